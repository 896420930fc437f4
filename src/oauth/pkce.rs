//! PKCE (Proof Key for Code Exchange) per RFC 7636, plus CSRF state.
//!
//! The verifier stays with the client and is sent during token exchange; the
//! challenge goes in the authorization URL so the authorization server can
//! check the exchange came from the party that started the flow.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};

/// Random bytes behind each verifier (encodes to 43 characters)
const VERIFIER_BYTES: usize = 32;

/// Random bytes behind each CSRF state value
const STATE_BYTES: usize = 32;

/// A verifier and its S256 challenge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pkce {
    pub verifier: String,
    pub challenge: String,
}

impl Pkce {
    pub fn generate() -> Self {
        let verifier = generate_verifier();
        let challenge = compute_challenge(&verifier);
        Self {
            verifier,
            challenge,
        }
    }
}

fn random_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Cryptographically random code verifier, URL-safe base64 without padding.
pub fn generate_verifier() -> String {
    random_token(VERIFIER_BYTES)
}

/// `challenge = BASE64URL(SHA256(verifier))`
pub fn compute_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// Cryptographically random CSRF state value.
pub fn generate_state() -> String {
    random_token(STATE_BYTES)
}

/// Appends URL-encoded query parameters to `base`.
pub fn build_url(base: &str, params: &[(&str, &str)]) -> String {
    let query = params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");
    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{base}{separator}{query}")
}
