pub mod config;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod startup;
pub mod utils;

use services::{
    auth_client::AuthClient, guard_registry::GuardRegistry, session_source::SessionEventHub,
    token_store::TokenStore,
};
use std::sync::Arc;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub auth_client: Arc<AuthClient>,
    pub tokens: TokenStore,
    pub hub: SessionEventHub,
    pub guards: Arc<GuardRegistry>,
}

impl AppState {
    pub fn new(
        auth_client: Arc<AuthClient>,
        tokens: TokenStore,
        hub: SessionEventHub,
        guards: Arc<GuardRegistry>,
    ) -> Self {
        Self {
            auth_client,
            tokens,
            hub,
            guards,
        }
    }
}
