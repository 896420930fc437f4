//! Token endpoint plumbing shared by all providers.
//!
//! Both the authorization-code exchange and the refresh grant POST a form to
//! the provider's token endpoint and parse a standard OAuth 2.0 response.

use super::TokenResponse;
use crate::error::{Error, Result};
use serde::Deserialize;
use tracing::debug;

/// Standard OAuth 2.0 error body (RFC 6749 §5.2)
#[derive(Debug, Deserialize)]
pub struct OAuthErrorBody {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// POSTs `form` to `token_url` and parses the token response.
pub(crate) async fn request_token(
    client: &reqwest::Client,
    provider: &str,
    token_url: &str,
    form: &[(&str, &str)],
) -> Result<TokenResponse> {
    debug!(provider = %provider, token_url = %token_url, "Calling token endpoint");

    let response = client
        .post(token_url)
        .header(reqwest::header::ACCEPT, "application/json")
        .form(form)
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(provider_error(provider, response).await);
    }

    let token: TokenResponse = response.json().await?;

    debug!(
        provider = %provider,
        has_refresh_token = token.refresh_token.is_some(),
        expires_in = ?token.expires_in,
        "Token endpoint call succeeded"
    );

    Ok(token)
}

/// Wraps a non-success response, keeping the upstream payload verbatim.
pub(crate) async fn provider_error(provider: &str, response: reqwest::Response) -> Error {
    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<failed to read body>".to_string());
    let code = serde_json::from_str::<OAuthErrorBody>(&body)
        .ok()
        .map(|e| e.error);

    Error::Provider {
        provider: provider.to_string(),
        status,
        code,
        body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_token_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_body(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
                mockito::Matcher::UrlEncoded("code".into(), "abc".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"at","refresh_token":"rt","expires_in":3600}"#)
            .create_async()
            .await;

        let token = request_token(
            &reqwest::Client::new(),
            "test",
            &format!("{}/token", server.url()),
            &[("grant_type", "authorization_code"), ("code", "abc")],
        )
        .await
        .unwrap();

        mock.assert_async().await;
        assert_eq!(token.access_token, "at");
        assert_eq!(token.refresh_token.as_deref(), Some("rt"));
    }

    #[tokio::test]
    async fn test_request_token_wraps_upstream_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant","error_description":"code expired"}"#)
            .create_async()
            .await;

        let err = request_token(
            &reqwest::Client::new(),
            "test",
            &format!("{}/token", server.url()),
            &[("grant_type", "authorization_code")],
        )
        .await
        .unwrap_err();

        match err {
            Error::Provider {
                provider,
                status,
                code,
                body,
            } => {
                assert_eq!(provider, "test");
                assert_eq!(status, 400);
                assert_eq!(code.as_deref(), Some("invalid_grant"));
                assert!(body.contains("code expired"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_non_json_error_body_kept_verbatim() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/token")
            .with_status(503)
            .with_body("upstream unavailable")
            .create_async()
            .await;

        let err = request_token(
            &reqwest::Client::new(),
            "test",
            &format!("{}/token", server.url()),
            &[],
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            Error::Provider { status: 503, code: None, ref body, .. } if body == "upstream unavailable"
        ));
    }
}
