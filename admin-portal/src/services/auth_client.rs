use crate::config::AuthServiceSettings;
use crate::models::RemoteSession;
use chrono::{TimeZone, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use service_core::observability::TracedClientExt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Identity provider unreachable: {0}")]
    Transport(String),

    #[error("Identity provider rejected the request with status {0}")]
    Rejected(StatusCode),

    #[error("Identity provider returned an unexpected body: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// Rejections are answers; everything else means we never got one.
    pub fn is_transport(&self) -> bool {
        !matches!(self, ProviderError::Rejected(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub expires_in: i64,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IntrospectResponse {
    active: bool,
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    exp: Option<i64>,
}

impl IntrospectResponse {
    fn into_session(self) -> Option<RemoteSession> {
        if !self.active {
            return None;
        }
        // A session without an email cannot be matched against the allow-list
        let email = self.email.filter(|email| !email.is_empty())?;
        Some(RemoteSession {
            user_id: self.sub.unwrap_or_default(),
            email,
            display_name: self.name,
            expires_at: self.exp.and_then(|exp| Utc.timestamp_opt(exp, 0).single()),
        })
    }
}

/// HTTP client for the identity provider (auth-service).
pub struct AuthClient {
    client: Client,
    settings: AuthServiceSettings,
}

impl AuthClient {
    pub fn new(settings: AuthServiceSettings) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(settings.request_timeout_ms))
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        Ok(Self { client, settings })
    }

    pub fn base_url(&self) -> &str {
        &self.settings.url
    }

    pub fn public_url(&self) -> &str {
        &self.settings.public_url
    }

    /// Exchange credentials for a token pair.
    pub async fn login(&self, email: &str, password: &str) -> Result<TokenPair, ProviderError> {
        let response = self
            .post(
                "/auth/login",
                serde_json::json!({ "email": email, "password": password }),
            )
            .await?;
        Self::json(response).await
    }

    /// Resolve an access token to the live session it belongs to.
    ///
    /// `Ok(None)` means the provider answered and the token is no longer
    /// active.
    pub async fn introspect(&self, access_token: &str) -> Result<Option<RemoteSession>, ProviderError> {
        let response = self
            .post("/auth/introspect", serde_json::json!({ "token": access_token }))
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Ok(None);
        }
        let body: IntrospectResponse = Self::json(response).await?;
        Ok(body.into_session())
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, ProviderError> {
        let response = self
            .post(
                "/auth/refresh",
                serde_json::json!({ "refresh_token": refresh_token }),
            )
            .await?;
        Self::json(response).await
    }

    /// Revoke the refresh token. The provider treats unknown tokens as
    /// already revoked.
    pub async fn logout(&self, refresh_token: &str) -> Result<(), ProviderError> {
        let response = self
            .post(
                "/auth/logout",
                serde_json::json!({ "refresh_token": refresh_token }),
            )
            .await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED | StatusCode::NOT_FOUND => Ok(()),
            status => Err(ProviderError::Rejected(status)),
        }
    }

    /// Send a POST request with trace context propagation.
    async fn post(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}{}", self.settings.url, path);

        self.client
            .traced_post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!("Failed to send POST request to {}: {}", url, e);
                ProviderError::Transport(e.to_string())
            })
    }

    async fn json<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ProviderError> {
        let status = response.status();
        if status.is_server_error() {
            return Err(ProviderError::Transport(format!("provider returned {}", status)));
        }
        if !status.is_success() {
            return Err(ProviderError::Rejected(status));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inactive_introspection_has_no_session() {
        let body: IntrospectResponse = serde_json::from_str(r#"{"active":false}"#).unwrap();
        assert!(body.into_session().is_none());
    }

    #[test]
    fn introspection_without_email_has_no_session() {
        let body: IntrospectResponse =
            serde_json::from_str(r#"{"active":true,"sub":"user-1"}"#).unwrap();
        assert!(body.into_session().is_none());
    }

    #[test]
    fn active_introspection_maps_to_session() {
        let body: IntrospectResponse = serde_json::from_str(
            r#"{"active":true,"sub":"user-1","email":"a@x.com","exp":1704326400}"#,
        )
        .unwrap();
        let session = body.into_session().expect("active session");

        assert_eq!(session.user_id, "user-1");
        assert_eq!(session.email, "a@x.com");
        assert_eq!(session.expires_at.map(|t| t.timestamp()), Some(1704326400));
    }

    #[test]
    fn only_rejections_are_answers() {
        assert!(!ProviderError::Rejected(StatusCode::FORBIDDEN).is_transport());
        assert!(ProviderError::Transport("timeout".to_string()).is_transport());
        assert!(ProviderError::Malformed("eof".to_string()).is_transport());
    }
}
