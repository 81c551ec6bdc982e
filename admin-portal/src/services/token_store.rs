use super::auth_client::TokenPair;
use super::kv_store::{KeyValueStore, StoreError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Provider tokens held for a visitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitorTokens {
    pub access_token: String,
    pub refresh_token: String,
}

impl From<&TokenPair> for VisitorTokens {
    fn from(pair: &TokenPair) -> Self {
        Self {
            access_token: pair.access_token.clone(),
            refresh_token: pair.refresh_token.clone(),
        }
    }
}

/// Per-visitor token slots. Kept outside the HTTP session so background
/// verification runs can reach them.
#[derive(Clone)]
pub struct TokenStore {
    store: Arc<dyn KeyValueStore>,
    key_prefix: String,
    ttl_seconds: u64,
}

impl TokenStore {
    pub fn new(store: Arc<dyn KeyValueStore>, key_prefix: &str, ttl_seconds: u64) -> Self {
        Self {
            store,
            key_prefix: key_prefix.to_string(),
            ttl_seconds,
        }
    }

    fn key(&self, visitor_id: &str) -> String {
        format!("{}:tokens:{}", self.key_prefix, visitor_id)
    }

    pub async fn load(&self, visitor_id: &str) -> Result<Option<VisitorTokens>, StoreError> {
        let Some(raw) = self.store.get(&self.key(visitor_id)).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(tokens) => Ok(Some(tokens)),
            Err(e) => {
                tracing::warn!(visitor_id = %visitor_id, error = %e, "Dropping unreadable token entry");
                self.store.delete(&self.key(visitor_id)).await?;
                Ok(None)
            }
        }
    }

    pub async fn save(&self, visitor_id: &str, tokens: &VisitorTokens) -> Result<(), StoreError> {
        let raw = serde_json::to_string(tokens)
            .map_err(|e| StoreError::Command(format!("serialize tokens: {}", e)))?;
        self.store
            .set(&self.key(visitor_id), &raw, self.ttl_seconds)
            .await
    }

    pub async fn remove(&self, visitor_id: &str) -> Result<(), StoreError> {
        self.store.delete(&self.key(visitor_id)).await
    }
}
