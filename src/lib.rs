// Error taxonomy shared by every layer
pub mod error;

// Audit sink for authorize/refresh/disconnect events
pub mod audit;

// TOML configuration
pub mod config;

// Encrypted credential storage
pub mod credentials;

// Provider contract, PKCE, registry
pub mod oauth;

// Authorization flows (local server, manual, web)
pub mod flow;

// On-demand token sources
pub mod token;

// Background refresh
pub mod scheduler;

// Facade over all of the above
pub mod vault;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Error, Result};
pub use vault::CredentialVault;
