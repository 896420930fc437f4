//! Top-level facade used by the rest of an application.
//!
//! Collaborators only ever need four things: a valid bearer token, a way to
//! connect an account, the list of connected accounts, and a way to
//! disconnect one. [`CredentialVault`] wires the registry, the encrypted
//! store, the flow handler, the per-account token sources and the refresh
//! scheduler together behind those operations.

use crate::audit::{AuditSink, TracingAuditSink, CATEGORY_DISCONNECT};
use crate::config::VaultConfig;
use crate::credentials::{AccountSummary, CredentialStore, FlowResult};
use crate::error::{Error, Result};
use crate::flow::{AuthorizationMode, FlowEvent, FlowHandler, WebAuthorization};
use crate::oauth::{run_state_cleanup, DropboxProvider, OAuth2Provider, ProviderRegistry};
use crate::scheduler::RefreshScheduler;
use crate::token::{AccessTokenSource, TokenSource, DEFAULT_REFRESH_MARGIN};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

type AccountKey = (String, String);

pub struct CredentialVault {
    registry: Arc<ProviderRegistry>,
    store: Arc<CredentialStore>,
    audit: Arc<dyn AuditSink>,
    flows: FlowHandler,
    scheduler: RefreshScheduler,
    scheduler_enabled: bool,
    cleanup_interval: Duration,
    token_margin: Duration,
    /// One source per account so concurrent callers share its refresh lock
    sources: DashMap<AccountKey, Arc<TokenSource>>,
}

impl CredentialVault {
    /// Vault with default flow, token and scheduler settings.
    pub fn new(
        registry: Arc<ProviderRegistry>,
        store: Arc<CredentialStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let flows = FlowHandler::new(registry.clone(), Some(store.clone()), audit.clone());
        let scheduler = RefreshScheduler::new(registry.clone(), store.clone(), audit.clone());
        Self {
            registry,
            store,
            audit,
            flows,
            scheduler,
            scheduler_enabled: true,
            cleanup_interval: Duration::from_secs(60),
            token_margin: DEFAULT_REFRESH_MARGIN,
            sources: DashMap::new(),
        }
    }

    /// Builds providers, the SQLite store and all settings from configuration.
    pub fn from_config(config: &VaultConfig) -> Result<Self> {
        config.validate()?;
        let client = config.http.client()?;

        let registry = Arc::new(ProviderRegistry::new());
        if let Some(dropbox) = &config.providers.dropbox {
            registry.register(Arc::new(DropboxProvider::new(
                dropbox.app_key.clone(),
                dropbox.app_secret.clone(),
                client.clone(),
            )));
        }
        for provider in &config.providers.oauth2 {
            registry.register(Arc::new(OAuth2Provider::new(provider.clone(), client.clone())));
        }

        let store = Arc::new(CredentialStore::open(
            &config.store.path,
            &config.store.key_source(),
        )?);
        let audit: Arc<dyn AuditSink> = Arc::new(TracingAuditSink);

        let flows = FlowHandler::new(registry.clone(), Some(store.clone()), audit.clone())
            .with_port(config.flow.port)
            .with_timeout(config.flow.timeout())
            .with_attempt_ttl(config.flow.attempt_ttl());
        let scheduler = RefreshScheduler::new(registry.clone(), store.clone(), audit.clone())
            .with_interval(config.scheduler.interval())
            .with_margin(config.scheduler.refresh_margin());

        info!(
            providers = ?registry.names(),
            store = %config.store.path.display(),
            "Credential vault initialized"
        );

        Ok(Self {
            registry,
            store,
            audit,
            flows,
            scheduler,
            scheduler_enabled: config.scheduler.enabled,
            cleanup_interval: config.flow.cleanup_interval(),
            token_margin: config.token.refresh_margin(),
            sources: DashMap::new(),
        })
    }

    pub fn with_flow_handler(mut self, flows: FlowHandler) -> Self {
        self.flows = flows;
        self
    }

    pub fn with_scheduler(mut self, scheduler: RefreshScheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_token_margin(mut self, margin: Duration) -> Self {
        self.token_margin = margin;
        self.sources.clear();
        self
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn flows(&self) -> &FlowHandler {
        &self.flows
    }

    pub fn scheduler(&self) -> &RefreshScheduler {
        &self.scheduler
    }

    /// Shared token source for one account. Unknown providers fail here;
    /// a missing credential fails on first use.
    pub fn token_source(&self, provider: &str, account_id: &str) -> Result<Arc<TokenSource>> {
        let key = (provider.to_string(), account_id.to_string());
        if let Some(source) = self.sources.get(&key) {
            return Ok(source.clone());
        }

        let provider = self.registry.get(provider)?;
        let source = self
            .sources
            .entry(key)
            .or_insert_with(|| {
                Arc::new(
                    TokenSource::new(provider, self.store.clone(), account_id)
                        .with_margin(self.token_margin),
                )
            })
            .clone();
        Ok(source)
    }

    /// A currently valid access token, refreshed first if needed.
    pub async fn token(&self, provider: &str, account_id: &str) -> Result<String> {
        self.token_source(provider, account_id)?.token().await
    }

    pub async fn run_authorization_flow(
        &self,
        provider: &str,
        mode: AuthorizationMode,
        events: Option<UnboundedSender<FlowEvent>>,
        cancel: CancellationToken,
    ) -> Result<FlowResult> {
        let result = self.flows.authorize(provider, mode, events, cancel).await?;
        self.forget_source(&result.provider, &result.account_id);
        Ok(result)
    }

    pub fn begin_web_flow(&self, provider: &str, redirect_url: Option<&str>) -> Result<WebAuthorization> {
        self.flows.begin_web(provider, redirect_url)
    }

    pub async fn complete_web_flow(&self, state: &str, code: &str) -> Result<FlowResult> {
        let result = self.flows.complete_web(state, code).await?;
        self.forget_source(&result.provider, &result.account_id);
        Ok(result)
    }

    pub fn list_accounts(&self, provider: &str) -> Result<Vec<AccountSummary>> {
        self.store.list_accounts(provider)
    }

    /// Deletes the stored credential. Fails with
    /// [`Error::CredentialNotFound`] if there was none.
    pub fn disconnect(&self, provider: &str, account_id: &str) -> Result<()> {
        self.forget_source(provider, account_id);
        let outcome = match self.store.delete(provider, account_id) {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::CredentialNotFound {
                provider: provider.to_string(),
                account: account_id.to_string(),
            }),
            Err(e) => Err(e),
        };

        match &outcome {
            Ok(()) => {
                info!(provider = %provider, account = %account_id, "Account disconnected");
                self.audit.record(
                    CATEGORY_DISCONNECT,
                    &format!("disconnected {provider}/{account_id}"),
                    None,
                );
            }
            Err(e) => self.audit.record(
                CATEGORY_DISCONNECT,
                &format!("disconnect failed for {provider}/{account_id}"),
                Some(e),
            ),
        }
        outcome
    }

    /// Starts the pending-attempt cleanup loop and, when enabled, the refresh
    /// scheduler. Both stop when `cancel` fires; call
    /// [`RefreshScheduler::stop`] to wait for an in-progress sweep.
    pub fn start_background(&self, cancel: CancellationToken) -> JoinHandle<()> {
        if self.scheduler_enabled {
            self.scheduler.start(cancel.clone());
        } else {
            info!("Refresh scheduler disabled");
        }
        tokio::spawn(run_state_cleanup(
            self.flows.attempts().clone(),
            self.cleanup_interval,
            cancel,
        ))
    }

    /// Drops a cached source so the next request reloads from the store.
    fn forget_source(&self, provider: &str, account_id: &str) {
        self.sources
            .remove(&(provider.to_string(), account_id.to_string()));
    }
}
