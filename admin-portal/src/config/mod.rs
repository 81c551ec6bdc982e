use crate::services::reconciler::ReconcilerSettings;
use secrecy::Secret;
use serde::Deserialize;
use std::time::Duration;

#[derive(Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub auth_service: AuthServiceSettings,
    pub database: DatabaseSettings,
    pub redis: RedisSettings,
    #[serde(default)]
    pub guard: GuardSettings,
    #[serde(default)]
    pub observability: ObservabilitySettings,
}

#[derive(Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Mark the session cookie `Secure`. Enable behind HTTPS.
    #[serde(default)]
    pub secure_cookies: bool,
}

#[derive(Deserialize, Clone)]
pub struct AuthServiceSettings {
    /// HTTP URL of the identity provider for server-side calls.
    pub url: String,
    /// URL of the identity provider as seen from the browser.
    pub public_url: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    5000
}

#[derive(Deserialize, Clone)]
pub struct DatabaseSettings {
    pub url: Secret<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize, Clone)]
pub struct RedisSettings {
    pub url: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Lifetime of a cached identity.
    #[serde(default = "default_identity_ttl_seconds")]
    pub identity_ttl_seconds: u64,
    /// Lifetime of stored provider tokens.
    #[serde(default = "default_token_ttl_seconds")]
    pub token_ttl_seconds: u64,
}

fn default_key_prefix() -> String {
    "admin-portal".to_string()
}

fn default_identity_ttl_seconds() -> u64 {
    7 * 24 * 60 * 60
}

fn default_token_ttl_seconds() -> u64 {
    24 * 60 * 60
}

#[derive(Deserialize, Clone, Debug)]
pub struct GuardSettings {
    #[serde(default = "default_verify_timeout_ms")]
    pub verify_timeout_ms: u64,
    /// How long a guarded request waits for a pending verdict before the
    /// loading page is rendered.
    #[serde(default = "default_render_wait_ms")]
    pub render_wait_ms: u64,
    #[serde(default = "default_cache_refresh_seconds")]
    pub cache_refresh_seconds: u64,
    #[serde(default = "default_idle_timeout_seconds")]
    pub idle_timeout_seconds: u64,
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
}

fn default_verify_timeout_ms() -> u64 {
    5000
}

fn default_render_wait_ms() -> u64 {
    750
}

fn default_cache_refresh_seconds() -> u64 {
    300
}

fn default_idle_timeout_seconds() -> u64 {
    1800
}

fn default_sweep_interval_seconds() -> u64 {
    60
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            verify_timeout_ms: default_verify_timeout_ms(),
            render_wait_ms: default_render_wait_ms(),
            cache_refresh_seconds: default_cache_refresh_seconds(),
            idle_timeout_seconds: default_idle_timeout_seconds(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
        }
    }
}

impl GuardSettings {
    pub fn reconciler(&self) -> ReconcilerSettings {
        ReconcilerSettings {
            verify_timeout: Duration::from_millis(self.verify_timeout_ms),
            cache_refresh: Duration::from_secs(self.cache_refresh_seconds),
        }
    }

    pub fn render_wait(&self) -> Duration {
        Duration::from_millis(self.render_wait_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds.max(1))
    }
}

#[derive(Deserialize, Clone)]
pub struct ObservabilitySettings {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// OTLP collector endpoint. Traces are only exported when set.
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ObservabilitySettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            otlp_endpoint: None,
        }
    }
}

pub fn get_configuration() -> Result<Settings, config::ConfigError> {
    service_core::config::load::<Settings>("admin-portal")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_defaults_match_documented_values() {
        let guard = GuardSettings::default();
        let reconciler = guard.reconciler();

        assert_eq!(reconciler.verify_timeout, Duration::from_secs(5));
        assert_eq!(reconciler.cache_refresh, Duration::from_secs(300));
        assert_eq!(guard.render_wait(), Duration::from_millis(750));
        assert_eq!(guard.idle_timeout(), Duration::from_secs(1800));
    }

    #[test]
    fn zero_sweep_interval_is_clamped() {
        let guard = GuardSettings {
            sweep_interval_seconds: 0,
            ..GuardSettings::default()
        };
        assert_eq!(guard.sweep_interval(), Duration::from_secs(1));
    }
}
