use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A row of the `admin_users` allow-list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct AllowListEntry {
    pub email: String,
    pub is_active: bool,
    pub last_login_at: Option<DateTime<Utc>>,
}

impl AllowListEntry {
    pub fn active(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            is_active: true,
            last_login_at: None,
        }
    }

    pub fn inactive(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            is_active: false,
            last_login_at: None,
        }
    }
}
