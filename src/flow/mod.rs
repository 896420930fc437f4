//! Authorization flow orchestration.
//!
//! One attempt moves through
//! `Idle → AwaitingUserAuthorization → ExchangingCode → Complete`, or to
//! `Failed` from any state. Three variants share the exchange step:
//!
//! - **Local server**: binds `127.0.0.1:<port>/callback` before the URL is
//!   shown, then waits for the callback, a timeout or cancellation.
//! - **Manual**: shows the URL and waits for the user to paste the code (or
//!   the whole redirect URL) through a [`CodePrompt`].
//! - **Web**: an external HTTP layer owns the callback; [`FlowHandler::begin_web`]
//!   hands out the URL and [`FlowHandler::complete_web`] finishes with the
//!   code and state it received.
//!
//! Failures never leave a partial record behind, and the PKCE attempt is
//! discarded on every exit path.

mod callback;

use crate::audit::{AuditSink, CATEGORY_AUTHORIZE};
use crate::credentials::{CredentialStore, FlowResult};
use crate::error::{Error, Result};
use crate::oauth::{PendingAttempt, PendingAttempts, Provider, ProviderRegistry};
use async_trait::async_trait;
use callback::{resolve_callback, CallbackListener, CallbackParams};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const DEFAULT_CALLBACK_PORT: u16 = 8089;
pub const DEFAULT_FLOW_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_ATTEMPT_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowState {
    Idle,
    AwaitingUserAuthorization,
    ExchangingCode,
    Complete,
    Failed,
}

/// Progress notification, delivered in order:
/// `AwaitingUser` → `ExchangingCode` → `Complete` | `Failed`.
/// `Failed` may follow any earlier event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FlowEvent {
    AwaitingUser { url: String },
    ExchangingCode,
    Complete { account_id: String },
    Failed { reason: String },
}

impl FlowEvent {
    /// State the attempt is in once this event has been emitted.
    pub fn state(&self) -> FlowState {
        match self {
            FlowEvent::AwaitingUser { .. } => FlowState::AwaitingUserAuthorization,
            FlowEvent::ExchangingCode => FlowState::ExchangingCode,
            FlowEvent::Complete { .. } => FlowState::Complete,
            FlowEvent::Failed { .. } => FlowState::Failed,
        }
    }
}

/// Source of a manually pasted authorization code.
#[async_trait]
pub trait CodePrompt: Send + Sync {
    /// Shows `url` to the user and returns what they paste back: the bare
    /// code, or the full redirect URL / query string.
    async fn prompt(&self, url: &str) -> Result<String>;
}

#[derive(Clone)]
pub enum AuthorizationMode {
    LocalServer,
    Manual(Arc<dyn CodePrompt>),
}

impl std::fmt::Debug for AuthorizationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthorizationMode::LocalServer => f.write_str("LocalServer"),
            AuthorizationMode::Manual(_) => f.write_str("Manual"),
        }
    }
}

/// URL and state handed to an external web layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WebAuthorization {
    pub url: String,
    pub state: String,
}

struct Progress(Option<UnboundedSender<FlowEvent>>);

impl Progress {
    fn emit(&self, event: FlowEvent) {
        if let Some(tx) = &self.0 {
            // A dropped receiver just means nobody is watching
            let _ = tx.send(event);
        }
    }
}

/// Removes the attempt from the pending table when the flow ends, however
/// it ends (including the future being dropped).
struct AttemptGuard {
    attempts: PendingAttempts,
    state: String,
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        self.attempts.discard(&self.state);
    }
}

pub struct FlowHandler {
    registry: Arc<ProviderRegistry>,
    store: Option<Arc<CredentialStore>>,
    audit: Arc<dyn AuditSink>,
    attempts: PendingAttempts,
    port: u16,
    timeout: Duration,
}

impl FlowHandler {
    /// Without a store, completed flows are returned but not persisted.
    pub fn new(
        registry: Arc<ProviderRegistry>,
        store: Option<Arc<CredentialStore>>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            registry,
            store,
            audit,
            attempts: PendingAttempts::new(DEFAULT_ATTEMPT_TTL),
            port: DEFAULT_CALLBACK_PORT,
            timeout: DEFAULT_FLOW_TIMEOUT,
        }
    }

    /// Callback port for the local server flow; 0 picks a free port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_attempt_ttl(mut self, ttl: Duration) -> Self {
        self.attempts = PendingAttempts::new(ttl);
        self
    }

    /// Pending attempt table, for running [`crate::oauth::run_state_cleanup`].
    pub fn attempts(&self) -> &PendingAttempts {
        &self.attempts
    }

    /// Runs one authorization attempt in the given mode.
    pub async fn authorize(
        &self,
        provider: &str,
        mode: AuthorizationMode,
        events: Option<UnboundedSender<FlowEvent>>,
        cancel: CancellationToken,
    ) -> Result<FlowResult> {
        match mode {
            AuthorizationMode::LocalServer => self.authorize_local(provider, events, cancel).await,
            AuthorizationMode::Manual(prompt) => {
                self.authorize_manual(provider, prompt.as_ref(), events, cancel)
                    .await
            }
        }
    }

    /// Local server variant. Blocks until the callback arrives, the flow
    /// timeout elapses, or `cancel` fires.
    pub async fn authorize_local(
        &self,
        provider: &str,
        events: Option<UnboundedSender<FlowEvent>>,
        cancel: CancellationToken,
    ) -> Result<FlowResult> {
        let progress = Progress(events);
        let outcome = self.run_local(provider, &progress, cancel).await;
        self.conclude(provider, outcome, &progress)
    }

    /// Manual variant. Bounded by cancellation and the attempt TTL rather
    /// than the callback timeout.
    pub async fn authorize_manual(
        &self,
        provider: &str,
        prompt: &dyn CodePrompt,
        events: Option<UnboundedSender<FlowEvent>>,
        cancel: CancellationToken,
    ) -> Result<FlowResult> {
        let progress = Progress(events);
        let outcome = self.run_manual(provider, prompt, &progress, cancel).await;
        self.conclude(provider, outcome, &progress)
    }

    /// First half of the web variant: builds the URL and records the attempt.
    pub fn begin_web(&self, provider: &str, redirect_url: Option<&str>) -> Result<WebAuthorization> {
        let provider = self.registry.get(provider)?;
        let request = provider.build_authorization_url(redirect_url);
        self.attempts.insert(PendingAttempt {
            provider: provider.name().to_string(),
            state: request.state.clone(),
            verifier: request.pkce.verifier,
            redirect_url: redirect_url.map(str::to_string),
            created_at: Utc::now(),
        });

        info!(provider = %provider.name(), "Web authorization started");
        Ok(WebAuthorization {
            url: request.url,
            state: request.state,
        })
    }

    /// Second half of the web variant: consumes the attempt for `state` and
    /// exchanges `code`. An unknown, reused or expired state fails with
    /// [`Error::UnknownState`].
    pub async fn complete_web(&self, state: &str, code: &str) -> Result<FlowResult> {
        let progress = Progress(None);
        let Some(attempt) = self.attempts.validate_and_consume(state) else {
            warn!("Web authorization completed with unknown or expired state");
            self.audit.record(
                CATEGORY_AUTHORIZE,
                "web authorization rejected",
                Some(&Error::UnknownState),
            );
            return Err(Error::UnknownState);
        };

        let provider_name = attempt.provider.clone();
        let outcome = match self.registry.get(&provider_name) {
            Ok(provider) => self.exchange(provider.as_ref(), &attempt, code, &progress).await,
            Err(e) => Err(e),
        };
        self.conclude(&provider_name, outcome, &progress)
    }

    async fn run_local(
        &self,
        provider_name: &str,
        progress: &Progress,
        cancel: CancellationToken,
    ) -> Result<FlowResult> {
        let provider = self.registry.get(provider_name)?;

        // Bind before the URL exists so the user cannot beat the listener
        let listener = CallbackListener::bind(self.port).await?;
        let redirect_url = listener.redirect_url();
        let request = provider.build_authorization_url(Some(&redirect_url));
        let _guard = self.track(provider.as_ref(), &request.state, &request.pkce.verifier, Some(&redirect_url));

        let mut server = listener.serve(request.state.clone());
        info!(provider = %provider_name, redirect = %redirect_url, "Waiting for authorization callback");
        progress.emit(FlowEvent::AwaitingUser { url: request.url });

        let params: Result<CallbackParams> = tokio::select! {
            params = server.callback() => params,
            _ = tokio::time::sleep(self.timeout) => Err(Error::Timeout(self.timeout)),
            _ = cancel.cancelled() => Err(Error::Cancelled),
        };
        server.shutdown().await;

        let code = resolve_callback(&request.state, &params?)?;
        let attempt = self
            .attempts
            .validate_and_consume(&request.state)
            .ok_or(Error::UnknownState)?;
        self.exchange(provider.as_ref(), &attempt, &code, progress).await
    }

    async fn run_manual(
        &self,
        provider_name: &str,
        prompt: &dyn CodePrompt,
        progress: &Progress,
        cancel: CancellationToken,
    ) -> Result<FlowResult> {
        let provider = self.registry.get(provider_name)?;
        let request = provider.build_authorization_url(None);
        let _guard = self.track(provider.as_ref(), &request.state, &request.pkce.verifier, None);

        progress.emit(FlowEvent::AwaitingUser {
            url: request.url.clone(),
        });

        let input = tokio::select! {
            input = prompt.prompt(&request.url) => input?,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };

        let code = parse_manual_input(&request.state, &input)?;
        let attempt = self
            .attempts
            .validate_and_consume(&request.state)
            .ok_or(Error::UnknownState)?;
        self.exchange(provider.as_ref(), &attempt, &code, progress).await
    }

    fn track(
        &self,
        provider: &dyn Provider,
        state: &str,
        verifier: &str,
        redirect_url: Option<&str>,
    ) -> AttemptGuard {
        self.attempts.insert(PendingAttempt {
            provider: provider.name().to_string(),
            state: state.to_string(),
            verifier: verifier.to_string(),
            redirect_url: redirect_url.map(str::to_string),
            created_at: Utc::now(),
        });
        AttemptGuard {
            attempts: self.attempts.clone(),
            state: state.to_string(),
        }
    }

    async fn exchange(
        &self,
        provider: &dyn Provider,
        attempt: &PendingAttempt,
        code: &str,
        progress: &Progress,
    ) -> Result<FlowResult> {
        progress.emit(FlowEvent::ExchangingCode);

        let token = provider
            .exchange_code(code, &attempt.verifier, attempt.redirect_url.as_deref())
            .await?;
        token.ensure_access_token()?;
        let expires_at = token.expires_at(Utc::now())?;

        let account_id = match token.account_id.clone().filter(|id| !id.is_empty()) {
            Some(id) => id,
            None => provider.account_info(&token.access_token).await?.account_id,
        };

        let result = FlowResult {
            provider: provider.name().to_string(),
            account_id,
            access_token: token.access_token.clone(),
            refresh_token: token.refresh_token.clone().filter(|t| !t.is_empty()),
            token_type: token.token_type_or_default(),
            expires_at,
            scope: token.scope.clone().unwrap_or_default(),
        };

        if let Some(store) = &self.store {
            store.save(&result)?;
        }
        Ok(result)
    }

    fn conclude(
        &self,
        provider: &str,
        outcome: Result<FlowResult>,
        progress: &Progress,
    ) -> Result<FlowResult> {
        match &outcome {
            Ok(result) => {
                info!(provider = %provider, account = %result.account_id, "Authorization complete");
                self.audit.record(
                    CATEGORY_AUTHORIZE,
                    &format!("authorized {}/{}", provider, result.account_id),
                    None,
                );
                progress.emit(FlowEvent::Complete {
                    account_id: result.account_id.clone(),
                });
            }
            Err(e) => {
                warn!(provider = %provider, error = %e, "Authorization failed");
                self.audit.record(
                    CATEGORY_AUTHORIZE,
                    &format!("authorization failed for {provider}"),
                    Some(e),
                );
                progress.emit(FlowEvent::Failed {
                    reason: e.to_string(),
                });
            }
        }
        outcome
    }
}

/// Extracts the code from pasted input. Accepts a bare code, a full redirect
/// URL, or a query string; when a state is present it must match.
fn parse_manual_input(expected_state: &str, input: &str) -> Result<String> {
    let input = input.trim();
    if input.is_empty() {
        return Err(Error::MissingCode);
    }

    let query = match input.split_once('?') {
        Some((_, query)) => query,
        None if input.contains("code=") || input.contains("error=") => input,
        None => return Ok(input.to_string()),
    };
    let query = query.split_once('#').map_or(query, |(q, _)| q);

    let mut params: CallbackParams =
        serde_urlencoded::from_str(query).map_err(|_| Error::MissingCode)?;
    // Providers that display the code do not echo the state
    if params.state.is_none() {
        params.state = Some(expected_state.to_string());
    }
    resolve_callback(expected_state, &params)
}
