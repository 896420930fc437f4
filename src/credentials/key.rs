//! Encryption key resolution.
//!
//! The key is resolved once when a store is opened: an explicit value wins,
//! then an environment variable, then a key file. A missing key file is
//! generated from the OS RNG and written owner-only.

use super::encryption::KEY_SIZE;
use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::{rngs::OsRng, RngCore};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Where to find the 32-byte master key.
#[derive(Clone, Debug, Default)]
pub struct KeySource {
    /// Base64-encoded key supplied directly by the caller.
    pub explicit: Option<String>,
    /// Environment variable holding a base64-encoded key.
    pub env_var: Option<String>,
    /// File holding a base64-encoded key; created if absent.
    pub file: Option<PathBuf>,
}

impl KeySource {
    pub fn explicit(key_base64: impl Into<String>) -> Self {
        Self {
            explicit: Some(key_base64.into()),
            ..Self::default()
        }
    }

    /// Resolves the key bytes, generating the key file if needed.
    pub fn resolve(&self) -> Result<Vec<u8>> {
        if let Some(key) = &self.explicit {
            debug!("Using explicitly supplied encryption key");
            return decode_key(key);
        }

        if let Some(var) = &self.env_var {
            if let Ok(value) = std::env::var(var) {
                if !value.trim().is_empty() {
                    debug!(env_var = %var, "Using encryption key from environment");
                    return decode_key(&value);
                }
            }
        }

        match &self.file {
            Some(path) => load_or_create_key_file(path),
            None => Err(Error::Config(
                "no encryption key: set an explicit key, an environment variable, or a key file"
                    .to_string(),
            )),
        }
    }
}

/// Decodes a base64 key and checks it is exactly 32 bytes.
pub fn decode_key(key_base64: &str) -> Result<Vec<u8>> {
    let key_bytes = BASE64
        .decode(key_base64.trim())
        .map_err(|e| Error::InvalidKeyEncoding(e.to_string()))?;

    if key_bytes.len() != KEY_SIZE {
        return Err(Error::InvalidKeySize(key_bytes.len()));
    }

    Ok(key_bytes)
}

/// Generates a fresh random key, base64-encoded.
pub fn generate_key() -> String {
    let mut bytes = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut bytes);
    BASE64.encode(bytes)
}

fn load_or_create_key_file(path: &Path) -> Result<Vec<u8>> {
    if path.exists() {
        debug!(path = %path.display(), "Loading encryption key file");
        let contents = fs::read_to_string(path)?;
        return decode_key(&contents);
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let key = generate_key();
    let mut file = open_owner_only(path)?;
    file.write_all(key.as_bytes())?;
    file.sync_all()?;

    info!(path = %path.display(), "Generated new encryption key file");
    decode_key(&key)
}

#[cfg(unix)]
fn open_owner_only(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_owner_only(path: &Path) -> std::io::Result<fs::File> {
    fs::OpenOptions::new().write(true).create_new(true).open(path)
}
