//! Loopback HTTP listener that receives the provider's redirect.
//!
//! Binding and serving are separate steps: the socket is bound first so the
//! redirect URL (and its port) is known before the authorization URL is
//! built, and the router is only mounted once the expected state exists.

use crate::error::{Error, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Query parameters the provider appends to the redirect URL.
#[derive(Clone, Debug, Default, Deserialize)]
pub(crate) struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Turns callback parameters into an authorization code, or the reason there
/// is none. An `error` parameter wins over everything else.
pub(crate) fn resolve_callback(expected_state: &str, params: &CallbackParams) -> Result<String> {
    if let Some(error) = &params.error {
        return Err(Error::AuthorizationDenied {
            error: error.clone(),
            description: params.error_description.clone(),
        });
    }
    if params.state.as_deref() != Some(expected_state) {
        return Err(Error::CsrfMismatch);
    }
    match &params.code {
        Some(code) if !code.is_empty() => Ok(code.clone()),
        _ => Err(Error::MissingCode),
    }
}

/// A bound but not yet serving listener.
pub(crate) struct CallbackListener {
    listener: TcpListener,
    port: u16,
}

impl CallbackListener {
    pub async fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|source| Error::PortUnavailable { port, source })?;
        let port = listener.local_addr()?.port();
        debug!(port, "Callback listener bound");
        Ok(Self { listener, port })
    }

    pub fn redirect_url(&self) -> String {
        format!("http://127.0.0.1:{}/callback", self.port)
    }

    /// Mounts `/callback` and starts serving. The first callback request
    /// resolves the server; later ones get an "already handled" page.
    pub fn serve(self, expected_state: String) -> CallbackServer {
        let (tx, rx) = oneshot::channel();
        let state = CallbackState {
            expected_state: Arc::from(expected_state),
            sender: Arc::new(Mutex::new(Some(tx))),
        };
        let app = Router::new()
            .route("/callback", get(handle_callback))
            .with_state(state);

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let port = self.port;
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(self.listener, app)
                .with_graceful_shutdown(signal.cancelled_owned())
                .await
            {
                error!(port, error = %e, "Callback server error");
            }
        });

        CallbackServer {
            outcome: Some(rx),
            shutdown,
            handle: Some(handle),
        }
    }
}

/// A serving callback listener. Dropping it tears the server down.
pub(crate) struct CallbackServer {
    outcome: Option<oneshot::Receiver<CallbackParams>>,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl CallbackServer {
    /// Resolves with the parameters of the first `/callback` request.
    pub async fn callback(&mut self) -> Result<CallbackParams> {
        let Some(rx) = self.outcome.as_mut() else {
            return Err(Error::Io(std::io::Error::other("callback already received")));
        };
        let params = rx
            .await
            .map_err(|_| Error::Io(std::io::Error::other("callback server stopped")));
        self.outcome = None;
        params
    }

    /// Stops accepting connections and waits for in-flight responses.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(mut handle) = self.handle.take() {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
                handle.abort();
            }
        }
        debug!("Callback server stopped");
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[derive(Clone)]
struct CallbackState {
    expected_state: Arc<str>,
    sender: Arc<Mutex<Option<oneshot::Sender<CallbackParams>>>>,
}

async fn handle_callback(
    State(state): State<CallbackState>,
    Query(params): Query<CallbackParams>,
) -> (StatusCode, Html<String>) {
    let sender = state
        .sender
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    let Some(sender) = sender else {
        return (
            StatusCode::CONFLICT,
            page("Authorization Already Handled", "This authorization request was already completed. You can close this window."),
        );
    };

    let response = match resolve_callback(&state.expected_state, &params) {
        Ok(_) => (
            StatusCode::OK,
            page("Authorization Successful", "You can close this window and return to the application."),
        ),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            page("Authorization Failed", &e.to_string()),
        ),
    };

    // Receiver gone means the flow already ended (timeout or cancel)
    let _ = sender.send(params);
    response
}

fn page(title: &str, message: &str) -> Html<String> {
    Html(format!(
        "<!DOCTYPE html>\n<html>\n<head><title>{title}</title></head>\n<body><h1>{title}</h1><p>{}</p></body>\n</html>",
        escape_html(message)
    ))
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
