//! Dropbox provider.
//!
//! Dropbox apps authenticate with an app key and PKCE; the app secret is
//! optional. `token_access_type=offline` is required to receive a refresh
//! token. Dropbox does not rotate refresh tokens on refresh.

use super::exchange::{provider_error, request_token};
use super::pkce::{build_url, generate_state, Pkce};
use super::{AccountInfo, AuthorizationRequest, Provider, TokenResponse};
use crate::error::Result;
use async_trait::async_trait;
use serde::Deserialize;

pub const AUTHORIZE_URL: &str = "https://www.dropbox.com/oauth2/authorize";
pub const API_URL: &str = "https://api.dropboxapi.com";

#[derive(Deserialize)]
struct CurrentAccount {
    account_id: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    name: Option<AccountName>,
}

#[derive(Deserialize)]
struct AccountName {
    display_name: String,
}

pub struct DropboxProvider {
    app_key: String,
    app_secret: Option<String>,
    authorize_url: String,
    api_url: String,
    client: reqwest::Client,
}

impl DropboxProvider {
    pub fn new(app_key: impl Into<String>, app_secret: Option<String>, client: reqwest::Client) -> Self {
        Self {
            app_key: app_key.into(),
            app_secret: app_secret.filter(|s| !s.is_empty()),
            authorize_url: AUTHORIZE_URL.to_string(),
            api_url: API_URL.to_string(),
            client,
        }
    }

    /// Points the provider at different endpoints (tests, proxies).
    pub fn with_endpoints(mut self, authorize_url: impl Into<String>, api_url: impl Into<String>) -> Self {
        self.authorize_url = authorize_url.into();
        self.api_url = api_url.into().trim_end_matches('/').to_string();
        self
    }

    fn token_url(&self) -> String {
        format!("{}/oauth2/token", self.api_url)
    }
}

#[async_trait]
impl Provider for DropboxProvider {
    fn name(&self) -> &str {
        "dropbox"
    }

    fn build_authorization_url(&self, redirect_url: Option<&str>) -> AuthorizationRequest {
        let pkce = Pkce::generate();
        let state = generate_state();

        let mut params = vec![
            ("client_id", self.app_key.as_str()),
            ("response_type", "code"),
            ("code_challenge", pkce.challenge.as_str()),
            ("code_challenge_method", "S256"),
            ("token_access_type", "offline"),
            ("state", state.as_str()),
        ];
        if let Some(redirect) = redirect_url {
            params.push(("redirect_uri", redirect));
        }
        let url = build_url(&self.authorize_url, &params);

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
            ("client_id", self.app_key.as_str()),
        ];
        if let Some(secret) = &self.app_secret {
            form.push(("client_secret", secret.as_str()));
        }
        if let Some(redirect) = redirect_url {
            form.push(("redirect_uri", redirect));
        }

        request_token(&self.client, self.name(), &self.token_url(), &form).await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse> {
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.app_key.as_str()),
        ];
        if let Some(secret) = &self.app_secret {
            form.push(("client_secret", secret.as_str()));
        }

        request_token(&self.client, self.name(), &self.token_url(), &form).await
    }

    async fn account_info(&self, access_token: &str) -> Result<AccountInfo> {
        // RPC endpoint with no arguments: body must be the JSON literal null
        let response = self
            .client
            .post(format!("{}/2/users/get_current_account", self.api_url))
            .bearer_auth(access_token)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body("null")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(provider_error(self.name(), response).await);
        }

        let account: CurrentAccount = response.json().await?;
        Ok(AccountInfo {
            account_id: account.account_id,
            email: account.email,
            display_name: account.name.map(|n| n.display_name),
        })
    }
}
