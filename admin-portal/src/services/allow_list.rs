//! Administrator allow-list backed by the `admin_users` table.

use crate::models::AllowListEntry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, Secret};
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument};

#[derive(Debug, Error)]
pub enum AllowListError {
    /// The email is confirmed absent (or inactive). Authoritative.
    #[error("No active allow-list entry for {0}")]
    NotFound(String),

    /// Any other failure. Denies, but must not destroy cached state.
    #[error("Allow-list query failed: {0}")]
    Ambiguous(anyhow::Error),
}

#[async_trait]
pub trait AllowListVerifier: Send + Sync {
    async fn find_active_entry(&self, email: &str) -> Result<AllowListEntry, AllowListError>;
    async fn record_login(&self, email: &str, at: DateTime<Utc>) -> Result<(), AllowListError>;
}

#[derive(Clone)]
pub struct PgAllowList {
    pool: PgPool,
}

impl PgAllowList {
    #[instrument(skip(database_url))]
    pub async fn connect(
        database_url: &Secret<String>,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url.expose_secret())
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl AllowListVerifier for PgAllowList {
    #[instrument(skip(self))]
    async fn find_active_entry(&self, email: &str) -> Result<AllowListEntry, AllowListError> {
        let entry = sqlx::query_as::<_, AllowListEntry>(
            "SELECT email, is_active, last_login_at FROM admin_users WHERE email = $1 AND is_active = TRUE",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AllowListError::Ambiguous(anyhow::anyhow!(e)))?;

        entry.ok_or_else(|| AllowListError::NotFound(email.to_string()))
    }

    #[instrument(skip(self))]
    async fn record_login(&self, email: &str, at: DateTime<Utc>) -> Result<(), AllowListError> {
        sqlx::query("UPDATE admin_users SET last_login_at = $2 WHERE email = $1")
            .bind(email)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(|e| AllowListError::Ambiguous(anyhow::anyhow!(e)))?;
        Ok(())
    }
}

/// Scriptable allow-list for tests.
#[derive(Default)]
pub struct MockAllowList {
    entries: Mutex<HashMap<String, AllowListEntry>>,
    failing: Mutex<HashSet<String>>,
    delays: Mutex<HashMap<String, Duration>>,
    lookups: Mutex<Vec<String>>,
    logins: Mutex<Vec<(String, DateTime<Utc>)>>,
    fail_record_login: AtomicBool,
}

impl MockAllowList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entry: AllowListEntry) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(entry.email.clone(), entry);
        }
    }

    pub fn remove(&self, email: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(email);
        }
    }

    /// Make lookups for `email` fail with an ambiguous error.
    pub fn fail_for(&self, email: &str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(email.to_string());
        }
    }

    /// Delay lookups for `email` before answering.
    pub fn delay_for(&self, email: &str, delay: Duration) {
        if let Ok(mut delays) = self.delays.lock() {
            delays.insert(email.to_string(), delay);
        }
    }

    pub fn fail_record_login(&self, fail: bool) {
        self.fail_record_login.store(fail, Ordering::SeqCst);
    }

    pub fn lookups(&self) -> Vec<String> {
        self.lookups.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn logins(&self) -> Vec<(String, DateTime<Utc>)> {
        self.logins.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl AllowListVerifier for MockAllowList {
    async fn find_active_entry(&self, email: &str) -> Result<AllowListEntry, AllowListError> {
        if let Ok(mut lookups) = self.lookups.lock() {
            lookups.push(email.to_string());
        }

        let delay = self
            .delays
            .lock()
            .ok()
            .and_then(|delays| delays.get(email).copied());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .failing
            .lock()
            .map(|failing| failing.contains(email))
            .unwrap_or(false);
        if failing {
            return Err(AllowListError::Ambiguous(anyhow::anyhow!(
                "connection reset by peer"
            )));
        }

        // Returns inactive rows as-is so callers exercise their own check
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(email).cloned())
            .ok_or_else(|| AllowListError::NotFound(email.to_string()))
    }

    async fn record_login(&self, email: &str, at: DateTime<Utc>) -> Result<(), AllowListError> {
        if self.fail_record_login.load(Ordering::SeqCst) {
            return Err(AllowListError::Ambiguous(anyhow::anyhow!("write rejected")));
        }
        if let Ok(mut logins) = self.logins.lock() {
            logins.push((email.to_string(), at));
        }
        if let Ok(mut entries) = self.entries.lock() {
            if let Some(entry) = entries.get_mut(email) {
                entry.last_login_at = Some(at);
            }
        }
        Ok(())
    }
}
