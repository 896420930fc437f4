//! Generic OAuth 2.0 provider driven by configuration.
//!
//! Covers any authorization-code + PKCE service (Google, GitHub, ...) whose
//! endpoints and scopes can be described in the config file.

use super::exchange::{provider_error, request_token};
use super::pkce::{build_url, generate_state, Pkce};
use super::{AccountInfo, AuthorizationRequest, Provider, TokenResponse};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// OAuth provider configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OAuth2ProviderConfig {
    /// Registry name (e.g., "google")
    pub name: String,

    /// OAuth authorization endpoint URL
    pub auth_url: String,

    /// OAuth token exchange endpoint URL
    pub token_url: String,

    /// Endpoint returning the account identity as JSON (GET, bearer auth)
    #[serde(default)]
    pub userinfo_url: Option<String>,

    /// JSON field in the userinfo response holding the account identifier
    #[serde(default = "default_account_id_field")]
    pub account_id_field: String,

    #[serde(default)]
    pub scopes: Vec<String>,

    pub client_id: String,

    #[serde(default)]
    pub client_secret: Option<String>,

    /// Extra authorization parameters, e.g. `access_type = "offline"`
    #[serde(default)]
    pub extra_auth_params: BTreeMap<String, String>,
}

fn default_account_id_field() -> String {
    "sub".to_string()
}

pub struct OAuth2Provider {
    config: OAuth2ProviderConfig,
    client: reqwest::Client,
}

impl OAuth2Provider {
    pub fn new(config: OAuth2ProviderConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    fn client_credentials<'a>(&'a self, form: &mut Vec<(&'a str, &'a str)>) {
        form.push(("client_id", self.config.client_id.as_str()));
        if let Some(secret) = self.config.client_secret.as_deref().filter(|s| !s.is_empty()) {
            form.push(("client_secret", secret));
        }
    }
}

#[async_trait]
impl Provider for OAuth2Provider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn build_authorization_url(&self, redirect_url: Option<&str>) -> AuthorizationRequest {
        let pkce = Pkce::generate();
        let state = generate_state();
        let scopes = self.config.scopes.join(" ");

        let mut params = vec![
            ("client_id", self.config.client_id.as_str()),
            ("response_type", "code"),
            ("code_challenge", pkce.challenge.as_str()),
            ("code_challenge_method", "S256"),
            ("state", state.as_str()),
        ];
        if !scopes.is_empty() {
            params.push(("scope", scopes.as_str()));
        }
        if let Some(redirect) = redirect_url {
            params.push(("redirect_uri", redirect));
        }
        for (key, value) in &self.config.extra_auth_params {
            params.push((key.as_str(), value.as_str()));
        }
        let url = build_url(&self.config.auth_url, &params);

        AuthorizationRequest { url, state, pkce }
    }

    async fn exchange_code(
        &self,
        code: &str,
        verifier: &str,
        redirect_url: Option<&str>,
    ) -> Result<TokenResponse> {
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("code_verifier", verifier),
        ];
        if let Some(redirect) = redirect_url {
            form.push(("redirect_uri", redirect));
        }
        self.client_credentials(&mut form);

        request_token(&self.client, self.name(), &self.config.token_url, &form).await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse> {
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        self.client_credentials(&mut form);

        request_token(&self.client, self.name(), &self.config.token_url, &form).await
    }

    async fn account_info(&self, access_token: &str) -> Result<AccountInfo> {
        let url = self.config.userinfo_url.as_deref().ok_or_else(|| {
            Error::Config(format!(
                "provider '{}' has no userinfo_url and the token response carried no account id",
                self.config.name
            ))
        })?;

        let response = self
            .client
            .get(url)
            .bearer_auth(access_token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(provider_error(self.name(), response).await);
        }

        let body: serde_json::Value = response.json().await?;
        let account_id = match &body[self.config.account_id_field.as_str()] {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            _ => {
                return Err(Error::Config(format!(
                    "userinfo response from '{}' has no '{}' field",
                    self.config.name, self.config.account_id_field
                )))
            }
        };

        Ok(AccountInfo {
            account_id,
            email: body["email"].as_str().map(str::to_string),
            display_name: body["name"].as_str().map(str::to_string),
        })
    }
}
