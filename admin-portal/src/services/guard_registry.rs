//! Mounted admin guards, one reconciler per visitor.
//!
//! A guard is mounted on the visitor's first guarded request, re-verifies on
//! navigation, and is unmounted when it denies access, on logout, or after
//! sitting idle.

use super::allow_list::AllowListVerifier;
use super::auth_client::AuthClient;
use super::identity_cache::StoredIdentityCache;
use super::kv_store::KeyValueStore;
use super::reconciler::{Dependencies, Reconciler};
use super::session_source::{ProviderSessionSource, SessionError, SessionEvent, SessionEventHub};
use super::token_store::TokenStore;
use crate::config::{GuardSettings, RedisSettings};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Builds the collaborators for one visitor's reconciler.
pub trait GuardBackend: Send + Sync {
    fn dependencies(&self, visitor_id: &str) -> Dependencies;

    /// Called once a visitor's guard is gone.
    fn release(&self, _visitor_id: &str) {}
}

/// Production wiring: provider-backed sessions, Redis identity cache,
/// Postgres allow-list.
pub struct ProviderBackend {
    auth_client: Arc<AuthClient>,
    store: Arc<dyn KeyValueStore>,
    allow_list: Arc<dyn AllowListVerifier>,
    tokens: TokenStore,
    hub: SessionEventHub,
    key_prefix: String,
    identity_ttl_seconds: u64,
}

impl ProviderBackend {
    pub fn new(
        auth_client: Arc<AuthClient>,
        store: Arc<dyn KeyValueStore>,
        allow_list: Arc<dyn AllowListVerifier>,
        tokens: TokenStore,
        hub: SessionEventHub,
        redis: &RedisSettings,
    ) -> Self {
        Self {
            auth_client,
            store,
            allow_list,
            tokens,
            hub,
            key_prefix: redis.key_prefix.clone(),
            identity_ttl_seconds: redis.identity_ttl_seconds,
        }
    }
}

impl GuardBackend for ProviderBackend {
    fn dependencies(&self, visitor_id: &str) -> Dependencies {
        Dependencies {
            session_source: Arc::new(ProviderSessionSource::new(
                visitor_id,
                self.auth_client.clone(),
                self.tokens.clone(),
                self.hub.clone(),
            )),
            allow_list: self.allow_list.clone(),
            cache: Arc::new(StoredIdentityCache::new(
                self.store.clone(),
                &self.key_prefix,
                visitor_id,
                self.identity_ttl_seconds,
            )),
        }
    }

    fn release(&self, visitor_id: &str) {
        self.hub.release(visitor_id);
    }
}

struct Activity {
    view: String,
    last_seen: Instant,
}

struct MountedGuard {
    reconciler: Arc<Reconciler>,
    activity: Mutex<Activity>,
}

impl MountedGuard {
    /// Record a request. Returns true when it came from a different view.
    fn touch(&self, view: &str) -> bool {
        let Ok(mut activity) = self.activity.lock() else {
            return true;
        };
        activity.last_seen = Instant::now();
        if activity.view == view {
            return false;
        }
        activity.view = view.to_string();
        true
    }

    fn idle_since(&self, cutoff: Instant) -> bool {
        self.activity
            .lock()
            .map(|activity| activity.last_seen < cutoff)
            .unwrap_or(true)
    }
}

pub struct GuardRegistry {
    guards: DashMap<String, Arc<MountedGuard>>,
    backend: Arc<dyn GuardBackend>,
    settings: GuardSettings,
}

impl GuardRegistry {
    pub fn new(backend: Arc<dyn GuardBackend>, settings: GuardSettings) -> Self {
        Self {
            guards: DashMap::new(),
            backend,
            settings,
        }
    }

    pub fn settings(&self) -> &GuardSettings {
        &self.settings
    }

    pub fn mounted_count(&self) -> usize {
        self.guards.len()
    }

    pub fn get(&self, visitor_id: &str) -> Option<Arc<Reconciler>> {
        self.guards
            .get(visitor_id)
            .map(|guard| guard.reconciler.clone())
            .filter(|reconciler| !reconciler.is_unmounted())
    }

    /// Return the visitor's live reconciler, mounting one if needed.
    ///
    /// An existing guard re-verifies when `navigated` is set or when the
    /// request comes from a different view than the last one.
    pub async fn enter(&self, visitor_id: &str, view: &str, navigated: bool) -> Arc<Reconciler> {
        let existing = self.guards.get(visitor_id).map(|guard| guard.clone());
        if let Some(guard) = existing {
            if !guard.reconciler.is_unmounted() {
                let view_changed = guard.touch(view);
                if navigated || view_changed {
                    debug!(visitor_id = %visitor_id, view = %view, "Re-verifying admin guard");
                    guard.reconciler.spawn_verification().await;
                }
                return guard.reconciler.clone();
            }
        }

        let reconciler = Arc::new(
            Reconciler::mount(
                visitor_id,
                self.backend.dependencies(visitor_id),
                self.settings.reconciler(),
            )
            .await,
        );
        let mounted = Arc::new(MountedGuard {
            reconciler: reconciler.clone(),
            activity: Mutex::new(Activity {
                view: view.to_string(),
                last_seen: Instant::now(),
            }),
        });

        let winner = match self.guards.entry(visitor_id.to_string()) {
            Entry::Occupied(entry) if !entry.get().reconciler.is_unmounted() => {
                Some(entry.get().reconciler.clone())
            }
            Entry::Occupied(mut entry) => {
                entry.insert(mounted);
                None
            }
            Entry::Vacant(entry) => {
                entry.insert(mounted);
                None
            }
        };

        match winner {
            // A concurrent request mounted first; keep theirs
            Some(winner) => {
                reconciler.unmount().await;
                winner
            }
            None => {
                info!(visitor_id = %visitor_id, view = %view, "Admin guard mounted");
                reconciler
            }
        }
    }

    pub async fn unmount(&self, visitor_id: &str) {
        let removed = self.guards.remove(visitor_id);
        if let Some((_, guard)) = removed {
            guard.reconciler.unmount().await;
            info!(visitor_id = %visitor_id, "Admin guard unmounted");
        }
        self.backend.release(visitor_id);
    }

    /// Sign the visitor out: deny through the reconciler first so the cache
    /// is cleared even if the provider call fails, then end the provider
    /// session and unmount.
    pub async fn sign_out(&self, visitor_id: &str) -> Result<(), SessionError> {
        let deps = self.backend.dependencies(visitor_id);
        let (reconciler, temporary) = match self.get(visitor_id) {
            Some(reconciler) => (reconciler, false),
            None => (
                Arc::new(Reconciler::new(
                    visitor_id,
                    deps.clone(),
                    self.settings.reconciler(),
                )),
                true,
            ),
        };

        reconciler.dispatch(SessionEvent::signed_out()).await;
        let result = deps.session_source.sign_out().await;

        if temporary {
            reconciler.unmount().await;
        }
        self.unmount(visitor_id).await;
        result
    }

    /// Unmount guards not seen for `idle`. Returns how many were removed.
    pub async fn sweep(&self, idle: Duration) -> usize {
        let Some(cutoff) = Instant::now().checked_sub(idle) else {
            return 0;
        };
        let stale: Vec<String> = self
            .guards
            .iter()
            .filter(|guard| guard.reconciler.is_unmounted() || guard.idle_since(cutoff))
            .map(|guard| guard.key().clone())
            .collect();

        for visitor_id in &stale {
            self.unmount(visitor_id).await;
        }
        if !stale.is_empty() {
            debug!(removed = stale.len(), remaining = self.guards.len(), "Swept idle admin guards");
        }
        stale.len()
    }

    pub fn spawn_sweeper(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.settings.sweep_interval());
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep(self.settings.idle_timeout()).await;
                    }
                }
            }

            let visitors: Vec<String> = self.guards.iter().map(|g| g.key().clone()).collect();
            for visitor_id in &visitors {
                self.unmount(visitor_id).await;
            }
        })
    }
}
