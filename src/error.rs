//! Error types for the credential lifecycle.
//!
//! Variants fall into the four families the rest of the crate reasons about:
//! configuration errors (bad key, port taken), protocol errors (CSRF, denied
//! authorization, upstream non-success), refresh errors and decryption errors.
//! Decryption failures are never folded into "no credential".

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("encryption key must be 32 bytes, got {0}")]
    InvalidKeySize(usize),

    #[error("encryption key is not valid base64: {0}")]
    InvalidKeyEncoding(String),

    #[error("ciphertext is shorter than the {expected}-byte nonce (got {actual} bytes)")]
    CiphertextTooShort { expected: usize, actual: usize },

    #[error("decryption failed (wrong key or tampered data)")]
    DecryptionFailed,

    #[error("provider '{0}' is not registered")]
    ProviderNotFound(String),

    #[error("no stored credential for {provider}/{account}")]
    CredentialNotFound { provider: String, account: String },

    #[error("access token for {provider}/{account} has expired and cannot be refreshed")]
    TokenExpired { provider: String, account: String },

    #[error("token source does not support refresh")]
    RefreshUnsupported,

    #[error("OAuth state mismatch (possible CSRF attack)")]
    CsrfMismatch,

    #[error("unknown or expired OAuth state")]
    UnknownState,

    #[error("authorization denied: {error}{}", .description.as_deref().map(|d| format!(" - {d}")).unwrap_or_default())]
    AuthorizationDenied {
        error: String,
        description: Option<String>,
    },

    #[error("callback did not include an authorization code")]
    MissingCode,

    #[error("timed out after {0:?} waiting for the authorization callback")]
    Timeout(std::time::Duration),

    #[error("authorization attempt was cancelled")]
    Cancelled,

    #[error("cannot listen on 127.0.0.1:{port}: {source}")]
    PortUnavailable {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("{provider} returned {status}: {body}")]
    Provider {
        provider: String,
        status: u16,
        /// Upstream `error` code when the body was a standard OAuth error.
        code: Option<String>,
        body: String,
    },

    #[error("unusable token response: {0}")]
    InvalidTokenResponse(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Errors caused by local setup; surfaced immediately and never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::InvalidKeySize(_)
                | Error::InvalidKeyEncoding(_)
                | Error::PortUnavailable { .. }
                | Error::ProviderNotFound(_)
                | Error::Config(_)
        )
    }

    /// Errors that abort an authorization attempt and are reported verbatim.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Error::CsrfMismatch
                | Error::UnknownState
                | Error::AuthorizationDenied { .. }
                | Error::MissingCode
                | Error::Provider { .. }
                | Error::InvalidTokenResponse(_)
        )
    }

    /// True when a provider rejected the grant itself (revoked or invalid
    /// refresh token), as opposed to a transient failure.
    pub fn is_invalid_grant(&self) -> bool {
        match self {
            Error::Provider { status, code, .. } => {
                code.as_deref() == Some("invalid_grant") || *status == 401
            }
            _ => false,
        }
    }
}
