#![allow(dead_code)]

use admin_portal::config::{AuthServiceSettings, GuardSettings};
use admin_portal::models::{Identity, IdentitySource, RemoteSession};
use admin_portal::services::allow_list::MockAllowList;
use admin_portal::services::auth_client::AuthClient;
use admin_portal::services::guard_registry::{GuardBackend, GuardRegistry};
use admin_portal::services::identity_cache::MemoryIdentityCache;
use admin_portal::services::kv_store::InMemoryStore;
use admin_portal::services::reconciler::{Dependencies, Reconciler, ReconcilerSettings};
use admin_portal::services::session_source::{MockSessionSource, SessionEventHub};
use admin_portal::services::token_store::TokenStore;
use admin_portal::startup::build_router;
use admin_portal::AppState;
use axum::Router;
use chrono::Utc;
use std::sync::{Arc, Once};
use std::time::Duration;

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::new("admin_portal=debug"))
            .with_test_writer()
            .try_init();
    });
}

pub fn session(email: &str) -> RemoteSession {
    RemoteSession {
        user_id: format!("user-{}", email),
        email: email.to_string(),
        display_name: None,
        expires_at: None,
    }
}

/// A cached identity verified `age` ago.
pub fn cached(email: &str, age: Duration) -> Identity {
    let verified_at = Utc::now() - chrono::Duration::from_std(age).unwrap();
    Identity::new(email, None, IdentitySource::LocalCache, verified_at)
}

/// Mock collaborators shared by every reconciler built from them.
#[derive(Clone)]
pub struct Harness {
    pub source: Arc<MockSessionSource>,
    pub allow_list: Arc<MockAllowList>,
    pub cache: Arc<MemoryIdentityCache>,
}

impl Harness {
    pub fn new() -> Self {
        init_tracing();
        Self {
            source: Arc::new(MockSessionSource::new()),
            allow_list: Arc::new(MockAllowList::new()),
            cache: Arc::new(MemoryIdentityCache::new()),
        }
    }

    pub fn deps(&self) -> Dependencies {
        Dependencies {
            session_source: self.source.clone(),
            allow_list: self.allow_list.clone(),
            cache: self.cache.clone(),
        }
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new("test", self.deps(), ReconcilerSettings::default())
    }

    pub async fn mount(&self) -> Reconciler {
        Reconciler::mount("test", self.deps(), ReconcilerSettings::default()).await
    }
}

impl GuardBackend for Harness {
    fn dependencies(&self, _visitor_id: &str) -> Dependencies {
        self.deps()
    }
}

/// Let spawned fire-and-forget work run.
pub async fn drain() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

pub fn test_app(harness: &Harness, guard: GuardSettings) -> (Router, AppState) {
    let auth_client = Arc::new(
        AuthClient::new(AuthServiceSettings {
            url: "http://127.0.0.1:9".to_string(),
            public_url: "http://127.0.0.1:9".to_string(),
            request_timeout_ms: 100,
        })
        .unwrap(),
    );
    let tokens = TokenStore::new(Arc::new(InMemoryStore::new()), "test", 60);
    let guards = Arc::new(GuardRegistry::new(Arc::new(harness.clone()), guard));
    let state = AppState::new(auth_client, tokens, SessionEventHub::new(), guards);
    (build_router(state.clone(), false), state)
}
