use crate::credentials::KeySource;
use crate::error::{Error, Result};
use crate::oauth::OAuth2ProviderConfig;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Complete tokenvault configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VaultConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub flow: FlowConfig,
    #[serde(default)]
    pub token: TokenConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

/// Credential store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// SQLite database file
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    /// Environment variable holding the base64 encryption key
    #[serde(default = "default_key_env")]
    pub key_env: String,
    /// Key file used (and created) when the variable is unset
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("credentials.db")
}

fn default_key_env() -> String {
    "TOKENVAULT_ENCRYPTION_KEY".to_string()
}

fn default_key_file() -> PathBuf {
    PathBuf::from("tokenvault.key")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            key_env: default_key_env(),
            key_file: default_key_file(),
        }
    }
}

impl StoreConfig {
    pub fn key_source(&self) -> KeySource {
        KeySource {
            explicit: None,
            env_var: Some(self.key_env.clone()),
            file: Some(self.key_file.clone()),
        }
    }
}

/// Authorization flow configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FlowConfig {
    /// Local callback port (0 = pick a free port)
    #[serde(default = "default_port")]
    pub port: u16,
    /// How long the local server waits for the callback
    #[serde(default = "default_flow_timeout")]
    pub timeout_secs: u64,
    /// Lifetime of an unconsumed PKCE attempt
    #[serde(default = "default_attempt_ttl")]
    pub attempt_ttl_secs: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

fn default_port() -> u16 {
    8089
}

fn default_flow_timeout() -> u64 {
    300
}

fn default_attempt_ttl() -> u64 {
    600
}

fn default_cleanup_interval() -> u64 {
    60
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            timeout_secs: default_flow_timeout(),
            attempt_ttl_secs: default_attempt_ttl(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

impl FlowConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn attempt_ttl(&self) -> Duration {
        Duration::from_secs(self.attempt_ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

/// On-demand token source configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    #[serde(default = "default_token_margin")]
    pub refresh_margin_secs: u64,
}

fn default_token_margin() -> u64 {
    300
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            refresh_margin_secs: default_token_margin(),
        }
    }
}

impl TokenConfig {
    pub fn refresh_margin(&self) -> Duration {
        Duration::from_secs(self.refresh_margin_secs)
    }
}

/// Background refresh configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler_enabled")]
    pub enabled: bool,
    #[serde(default = "default_scheduler_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_scheduler_margin")]
    pub refresh_margin_secs: u64,
}

fn default_scheduler_enabled() -> bool {
    true
}

fn default_scheduler_interval() -> u64 {
    1800
}

fn default_scheduler_margin() -> u64 {
    900
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_scheduler_enabled(),
            interval_secs: default_scheduler_interval(),
            refresh_margin_secs: default_scheduler_margin(),
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn refresh_margin(&self) -> Duration {
        Duration::from_secs(self.refresh_margin_secs)
    }
}

/// Outbound HTTP configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Per-request timeout for provider calls
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

fn default_http_timeout() -> u64 {
    30
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_http_timeout(),
        }
    }
}

impl HttpConfig {
    pub fn client(&self) -> Result<reqwest::Client> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .user_agent(concat!("tokenvault/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(client)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub dropbox: Option<DropboxConfig>,
    #[serde(default)]
    pub oauth2: Vec<OAuth2ProviderConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DropboxConfig {
    pub app_key: String,
    #[serde(default)]
    pub app_secret: Option<String>,
}

impl VaultConfig {
    /// Applies `TOKENVAULT_*` environment overrides.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(path) = var("TOKENVAULT_DB").filter(|v| !v.is_empty()) {
            self.store.path = PathBuf::from(path);
        }
        if let Some(app_key) = var("TOKENVAULT_DROPBOX_APP_KEY").filter(|v| !v.is_empty()) {
            let app_secret = var("TOKENVAULT_DROPBOX_APP_SECRET").filter(|v| !v.is_empty());
            match &mut self.providers.dropbox {
                Some(dropbox) => {
                    dropbox.app_key = app_key;
                    if app_secret.is_some() {
                        dropbox.app_secret = app_secret;
                    }
                }
                None => {
                    self.providers.dropbox = Some(DropboxConfig {
                        app_key,
                        app_secret,
                    })
                }
            }
        }
    }

    /// Rejects configurations that cannot work.
    pub fn validate(&self) -> Result<()> {
        if let Some(dropbox) = &self.providers.dropbox {
            if dropbox.app_key.trim().is_empty() {
                return Err(Error::Config("providers.dropbox.app_key is empty".to_string()));
            }
        }
        let mut seen = std::collections::HashSet::new();
        if self.providers.dropbox.is_some() {
            seen.insert("dropbox");
        }
        for provider in &self.providers.oauth2 {
            if provider.name.trim().is_empty() {
                return Err(Error::Config("providers.oauth2 entry without a name".to_string()));
            }
            if !seen.insert(provider.name.as_str()) {
                return Err(Error::Config(format!(
                    "provider '{}' is configured more than once",
                    provider.name
                )));
            }
        }
        Ok(())
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<VaultConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: VaultConfig =
        toml::from_str(&contents).map_err(|e| Error::Config(format!("{path}: {e}")))?;
    config.validate()?;
    Ok(config)
}
