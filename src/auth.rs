use crate::constants::{
    API_PREFIX, AUTH_REFRESH_TOKEN, EXPIRED_REFRESH_MESSAGE, REQUEST_ID_HEADER,
    TOKEN_EXPIRED_PAYLOAD,
};
use crate::types::{CitelineError, Result};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct TokenStore {
    token: RwLock<Option<String>>,
}

impl TokenStore {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token.filter(|t| !t.is_empty())),
        }
    }

    pub async fn current(&self) -> Option<String> {
        self.token.read().await.clone()
    }

    pub async fn set(&self, token: String) {
        *self.token.write().await = Some(token);
    }

    pub async fn clear(&self) {
        *self.token.write().await = None;
    }
}

#[derive(Deserialize)]
struct RefreshResponse {
    access_token: Option<String>,
    message: Option<String>,
}

/// Bearer-authenticated HTTP access to the backend.
pub struct AuthClient {
    client: reqwest::Client,
    api_root: String,
    tokens: TokenStore,
}

impl AuthClient {
    pub fn new(client: reqwest::Client, base_url: &str, token: Option<String>) -> Self {
        Self {
            client,
            api_root: format!("{}{}", base_url.trim_end_matches('/'), API_PREFIX),
            tokens: TokenStore::new(token),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_root, path)
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    /// Sends the request built by `build`. An expired token is refreshed once and the
    /// request re-sent once; whatever the retry returns goes back to the caller.
    pub async fn send<F>(&self, build: F) -> Result<reqwest::Response>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let token = match self.tokens.current().await {
            Some(t) => t,
            None => return Err(CitelineError::MissingToken.into()),
        };

        let response = self.dispatch(&build, &token).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let body: serde_json::Value = match response.json().await {
            Ok(v) => v,
            Err(_) => serde_json::Value::Null,
        };
        if body.get("payload").and_then(|p| p.as_str()) == Some(TOKEN_EXPIRED_PAYLOAD) {
            tracing::info!("[⚙️  -> ☁️ ] Access token expired; refreshing once");
            let refreshed = self.refresh(&token).await?;
            return self.dispatch(&build, &refreshed).await;
        }

        tracing::warn!("[☁️  -> ⚙️ ] Request rejected as unauthorized: {}", body);
        self.tokens.clear().await;
        Err(CitelineError::SessionExpired(format!("unauthorized: {}", body)).into())
    }

    async fn dispatch<F>(&self, build: &F, token: &str) -> Result<reqwest::Response>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let request_id = Uuid::new_v4().to_string();
        tracing::debug!("[⚙️  -> ☁️ ] Sending request {}", request_id);
        let response = build(&self.client)
            .bearer_auth(token)
            .header(REQUEST_ID_HEADER, request_id)
            .send()
            .await?;
        Ok(response)
    }

    /// Exchanges `token` for a fresh access token and stores it.
    pub async fn refresh(&self, token: &str) -> Result<String> {
        let response = self
            .client
            .post(self.url(AUTH_REFRESH_TOKEN))
            .bearer_auth(token)
            .send()
            .await?;

        if !response.status().is_success() {
            self.tokens.clear().await;
            return Err(CitelineError::SessionExpired(format!(
                "Failed to refresh token: {}",
                response.status()
            ))
            .into());
        }

        let data: RefreshResponse = response.json().await?;
        if data.message.as_deref() == Some(EXPIRED_REFRESH_MESSAGE) {
            self.tokens.clear().await;
            return Err(CitelineError::SessionExpired(EXPIRED_REFRESH_MESSAGE.to_string()).into());
        }

        match data.access_token {
            Some(fresh) if !fresh.is_empty() => {
                self.tokens.set(fresh.clone()).await;
                tracing::info!("[☁️  -> ⚙️ ] Access token refreshed");
                Ok(fresh)
            }
            _ => {
                self.tokens.clear().await;
                Err(CitelineError::SessionExpired(
                    "refresh response carried no access token".to_string(),
                )
                .into())
            }
        }
    }
}
