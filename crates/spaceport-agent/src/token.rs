//! OAuth client-credential token exchange

use std::time::{Duration, Instant};

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::StreamError;

/// Tokens are refreshed this long before they expire
const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

/// Source of bearer tokens for the stream and the backend API
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Return a valid access token
    async fn token(&self) -> Result<String, StreamError>;
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Client-credential grant against an OAuth token endpoint.
///
/// Tokens are cached until shortly before their advertised expiry.
pub struct OAuthClientCredentials {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    cached: Mutex<Option<(String, Option<Instant>)>>,
}

impl OAuthClientCredentials {
    /// Create a token source for the given endpoint and client
    pub fn new(
        http: reqwest::Client,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            http,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            cached: Mutex::new(None),
        }
    }

    async fn exchange(&self) -> Result<TokenResponse, StreamError> {
        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| StreamError::Auth(format!("token request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(StreamError::Auth(format!(
                "token endpoint returned {status}"
            )));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| StreamError::Auth(format!("invalid token response: {e}")))
    }
}

#[async_trait]
impl TokenSource for OAuthClientCredentials {
    async fn token(&self) -> Result<String, StreamError> {
        let mut cached = self.cached.lock().await;
        if let Some((token, expires_at)) = cached.as_ref() {
            if expires_at.is_none_or(|at| Instant::now() < at) {
                return Ok(token.clone());
            }
        }

        let response = self.exchange().await?;
        let expires_at = response
            .expires_in
            .map(|secs| Instant::now() + Duration::from_secs(secs).saturating_sub(EXPIRY_MARGIN));
        debug!(expires_in = ?response.expires_in, "obtained access token");
        *cached = Some((response.access_token.clone(), expires_at));
        Ok(response.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_response_tolerates_missing_expiry() {
        let r: TokenResponse =
            serde_json::from_str(r#"{"access_token":"abc","token_type":"bearer"}"#).unwrap();
        assert_eq!(r.access_token, "abc");
        assert!(r.expires_in.is_none());
    }

    #[tokio::test]
    async fn cached_token_is_reused() {
        let source = OAuthClientCredentials::new(
            reqwest::Client::new(),
            "http://127.0.0.1:9/token",
            "id",
            "secret",
        );
        *source.cached.lock().await = Some(("cached".to_string(), None));
        // the endpoint is unreachable, so a fresh exchange would fail
        assert_eq!(source.token().await.unwrap(), "cached");
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_an_auth_error() {
        let source = OAuthClientCredentials::new(
            reqwest::Client::new(),
            "http://127.0.0.1:9/token",
            "id",
            "secret",
        );
        assert!(matches!(source.token().await, Err(StreamError::Auth(_))));
    }
}
