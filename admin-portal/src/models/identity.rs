use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where an identity came from. Diagnostics only: both sources still have to
/// pass the allow-list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentitySource {
    RemoteSession,
    LocalCache,
}

impl IdentitySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentitySource::RemoteSession => "remote_session",
            IdentitySource::LocalCache => "local_cache",
        }
    }
}

/// The subject being authorized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub email: String,
    pub display_name: String,
    pub source: IdentitySource,
    pub verified_at: DateTime<Utc>,
}

impl Identity {
    pub fn new(
        email: impl Into<String>,
        display_name: Option<&str>,
        source: IdentitySource,
        verified_at: DateTime<Utc>,
    ) -> Self {
        let email = email.into();
        let display_name = derive_display_name(&email, display_name);
        Self {
            email,
            display_name,
            source,
            verified_at,
        }
    }

    pub fn initials(&self) -> String {
        let name = &self.display_name;
        let mut chars = name.chars().filter(|c| c.is_alphanumeric());
        match (chars.next(), chars.next()) {
            (Some(a), Some(b)) => format!("{}{}", a, b).to_uppercase(),
            (Some(a), None) => a.to_uppercase().to_string(),
            _ => "A".to_string(),
        }
    }

    /// True when `other` names the same subject with the same display name,
    /// regardless of source or timestamp.
    pub fn same_subject(&self, other: &Identity) -> bool {
        self.email == other.email && self.display_name == other.display_name
    }
}

/// Provider display name when it carries one, else the local part of the email.
pub fn derive_display_name(email: &str, display_name: Option<&str>) -> String {
    match display_name.map(str::trim) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => email
            .split('@')
            .next()
            .filter(|local| !local.is_empty())
            .unwrap_or("Admin")
            .to_string(),
    }
}

/// A live session as reported by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSession {
    pub user_id: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// The identity asserted for a verification run. A remote session always
/// wins over the cache when both are present.
#[derive(Debug, Clone, PartialEq)]
pub enum IdentityClaim {
    Remote(RemoteSession),
    Cached(Identity),
    None,
}

impl IdentityClaim {
    pub fn resolve(remote: Option<RemoteSession>, cached: Option<Identity>) -> Self {
        match (remote, cached) {
            (Some(session), _) => IdentityClaim::Remote(session),
            (None, Some(identity)) => IdentityClaim::Cached(identity),
            (None, None) => IdentityClaim::None,
        }
    }

    pub fn email(&self) -> Option<&str> {
        match self {
            IdentityClaim::Remote(session) => Some(&session.email),
            IdentityClaim::Cached(identity) => Some(&identity.email),
            IdentityClaim::None => None,
        }
    }

    pub fn has_remote_session(&self) -> bool {
        matches!(self, IdentityClaim::Remote(_))
    }

    /// The identity this claim becomes once the allow-list accepts it.
    pub fn into_identity(self, verified_at: DateTime<Utc>) -> Option<Identity> {
        match self {
            IdentityClaim::Remote(session) => Some(Identity::new(
                session.email,
                session.display_name.as_deref(),
                IdentitySource::RemoteSession,
                verified_at,
            )),
            IdentityClaim::Cached(identity) => Some(Identity {
                source: IdentitySource::LocalCache,
                verified_at,
                ..identity
            }),
            IdentityClaim::None => None,
        }
    }
}
