use anyhow::{Context, Result};
use async_trait::async_trait;
use tokenvault::config::{load_config, VaultConfig};
use tokenvault::flow::{AuthorizationMode, CodePrompt, FlowEvent};
use tokenvault::CredentialVault;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::info;

const USAGE: &str = "\
usage: tokenvault <command>

commands:
  connect <provider> [--manual]     authorize a new account
  accounts <provider>               list connected accounts
  token <provider> <account>        print a valid access token
  disconnect <provider> <account>   delete a stored credential
  daemon                            keep credentials refreshed until Ctrl-C

environment:
  TOKENVAULT_CONFIG                 config file (default: tokenvault.toml if present)
  TOKENVAULT_DB                     credential database path
  TOKENVAULT_ENCRYPTION_KEY         base64 32-byte key (else the key file is used)
  TOKENVAULT_DROPBOX_APP_KEY        Dropbox app key
  TOKENVAULT_DROPBOX_APP_SECRET     Dropbox app secret (optional)";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tokenvault=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    if matches!(args.as_slice(), [] | ["help" | "--help" | "-h", ..]) {
        println!("{USAGE}");
        return Ok(());
    }
    // Nothing is opened or created until the command line is known to be valid
    let Some(command) = Command::parse(&args) else {
        eprintln!("{USAGE}");
        std::process::exit(2);
    };

    let config = read_config()?;
    let vault =
        CredentialVault::from_config(&config).context("Failed to initialize credential vault")?;

    match command {
        Command::Connect { provider, manual } => connect(&vault, &provider, manual).await,
        Command::Accounts { provider } => accounts(&vault, &provider),
        Command::Token { provider, account } => {
            let token = vault
                .token(&provider, &account)
                .await
                .with_context(|| format!("Failed to get a token for {provider}/{account}"))?;
            println!("{token}");
            Ok(())
        }
        Command::Disconnect { provider, account } => {
            vault
                .disconnect(&provider, &account)
                .with_context(|| format!("Failed to disconnect {provider}/{account}"))?;
            println!("Disconnected {provider}/{account}");
            Ok(())
        }
        Command::Daemon => daemon(&vault).await,
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Connect { provider: String, manual: bool },
    Accounts { provider: String },
    Token { provider: String, account: String },
    Disconnect { provider: String, account: String },
    Daemon,
}

impl Command {
    fn parse(args: &[&str]) -> Option<Self> {
        let command = match args {
            ["connect", provider] => Command::Connect {
                provider: provider.to_string(),
                manual: false,
            },
            ["connect", provider, "--manual"] | ["connect", "--manual", provider] => Command::Connect {
                provider: provider.to_string(),
                manual: true,
            },
            ["accounts", provider] => Command::Accounts {
                provider: provider.to_string(),
            },
            ["token", provider, account] => Command::Token {
                provider: provider.to_string(),
                account: account.to_string(),
            },
            ["disconnect", provider, account] => Command::Disconnect {
                provider: provider.to_string(),
                account: account.to_string(),
            },
            ["daemon"] => Command::Daemon,
            _ => return None,
        };
        Some(command)
    }
}

fn read_config() -> Result<VaultConfig> {
    let mut config = match std::env::var("TOKENVAULT_CONFIG") {
        Ok(path) => load_config(&path).with_context(|| format!("Failed to load config {path}"))?,
        Err(_) if std::path::Path::new("tokenvault.toml").exists() => {
            load_config("tokenvault.toml").context("Failed to load tokenvault.toml")?
        }
        Err(_) => VaultConfig::default(),
    };
    config.apply_env();

    info!(
        store = %config.store.path.display(),
        callback_port = config.flow.port,
        scheduler_enabled = config.scheduler.enabled,
        "Configuration loaded"
    );
    Ok(config)
}

/// Reads the pasted code (or redirect URL) from stdin.
struct StdinPrompt;

#[async_trait]
impl CodePrompt for StdinPrompt {
    async fn prompt(&self, url: &str) -> tokenvault::Result<String> {
        println!("Open this URL, authorize access, then paste the code shown:\n\n  {url}\n");
        print!("Code: ");
        use std::io::Write;
        std::io::stdout().flush()?;

        let mut line = String::new();
        BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
        Ok(line)
    }
}

async fn connect(vault: &CredentialVault, provider: &str, manual: bool) -> Result<()> {
    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                FlowEvent::AwaitingUser { url } if !manual => {
                    println!("Open this URL in your browser to authorize:\n\n  {url}\n");
                    println!("Waiting for authorization (Ctrl-C to abort)...");
                }
                FlowEvent::ExchangingCode => println!("Exchanging authorization code..."),
                _ => {}
            }
        }
    });

    let mode = if manual {
        AuthorizationMode::Manual(Arc::new(StdinPrompt))
    } else {
        AuthorizationMode::LocalServer
    };
    let outcome = vault
        .run_authorization_flow(provider, mode, Some(tx), cancel)
        .await;
    let _ = printer.await;

    let result = outcome.with_context(|| format!("Authorization with {provider} failed"))?;
    println!(
        "Connected {} account {} (expires {})",
        result.provider,
        result.account_id,
        result
            .expires_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string())
    );
    Ok(())
}

fn accounts(vault: &CredentialVault, provider: &str) -> Result<()> {
    let accounts = vault
        .list_accounts(provider)
        .with_context(|| format!("Failed to list {provider} accounts"))?;
    if accounts.is_empty() {
        println!("No {provider} accounts connected");
        return Ok(());
    }

    for account in accounts {
        println!(
            "{}\texpires={}\trefreshable={}\tlast_used={}",
            account.account_id,
            account
                .expires_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".to_string()),
            account.has_refresh_token,
            account
                .last_used_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".to_string()),
        );
    }
    Ok(())
}

async fn daemon(vault: &CredentialVault) -> Result<()> {
    let cancel = CancellationToken::new();
    let cleanup = vault.start_background(cancel.clone());
    info!("Refresh daemon running");

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    cancel.cancel();
    vault.scheduler().stop().await;
    let _ = cleanup.await;
    info!("Refresh daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_commands() {
        assert_eq!(
            Command::parse(&["connect", "dropbox"]),
            Some(Command::Connect {
                provider: "dropbox".to_string(),
                manual: false
            })
        );
        assert_eq!(
            Command::parse(&["connect", "dropbox", "--manual"]),
            Some(Command::Connect {
                provider: "dropbox".to_string(),
                manual: true
            })
        );
        assert_eq!(
            Command::parse(&["token", "dropbox", "dbid:1"]),
            Some(Command::Token {
                provider: "dropbox".to_string(),
                account: "dbid:1".to_string()
            })
        );
        assert_eq!(Command::parse(&["daemon"]), Some(Command::Daemon));
    }

    #[test]
    fn test_parse_rejects_unknown_or_malformed() {
        assert_eq!(Command::parse(&["frobnicate"]), None);
        assert_eq!(Command::parse(&["connect"]), None);
        assert_eq!(Command::parse(&["connect", "dropbox", "--bogus"]), None);
        assert_eq!(Command::parse(&["token", "dropbox"]), None);
        assert_eq!(Command::parse(&["daemon", "extra"]), None);
    }
}
