use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{CallId, UserId, UserStatus},
    protocol::UserPayload,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authorization endpoint rejected the request ({status}): {message}")]
    Rejected { status: StatusCode, message: String },
    #[error("authorization request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Partial account update; unset fields are left untouched server-side.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AccountChange {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<UserStatus>,
}

#[derive(Debug, Deserialize)]
struct CallTokenResponse {
    token: String,
}

/// Issues media-room tokens bound to a call identifier.
#[async_trait]
pub trait CallAuthorizer: Send + Sync {
    async fn issue_call_token(&self, call_id: &CallId) -> Result<String, AuthError>;
}

/// HTTP client for the authorization host: identity lookups, account
/// changes and call-token issuance all live under one base url.
pub struct AuthClient {
    http: Client,
    base_url: String,
}

impl AuthClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http: Client::new(),
            base_url,
        }
    }

    pub async fn get_user(&self, user_id: UserId) -> Result<UserPayload, AuthError> {
        let response = self
            .http
            .get(format!("{}/users/{}", self.base_url, user_id.0))
            .send()
            .await?;
        Self::into_json(response).await
    }

    pub async fn get_user_by_username(&self, username: &str) -> Result<UserPayload, AuthError> {
        let response = self
            .http
            .get(format!("{}/users/by-name/{username}", self.base_url))
            .send()
            .await?;
        Self::into_json(response).await
    }

    pub async fn update_account(&self, change: &AccountChange) -> Result<UserPayload, AuthError> {
        let response = self
            .http
            .post(format!("{}/account", self.base_url))
            .json(change)
            .send()
            .await?;
        Self::into_json(response).await
    }

    async fn into_json<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, AuthError> {
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AuthError::Rejected { status, message });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl CallAuthorizer for AuthClient {
    async fn issue_call_token(&self, call_id: &CallId) -> Result<String, AuthError> {
        let response = self
            .http
            .post(format!("{}/calls/{}/token", self.base_url, call_id))
            .send()
            .await?;
        let body: CallTokenResponse = Self::into_json(response).await?;
        Ok(body.token)
    }
}

#[cfg(test)]
#[path = "tests/auth_tests.rs"]
mod tests;
