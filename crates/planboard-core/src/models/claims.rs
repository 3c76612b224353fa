use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Buffer before expiry inside which a session should be refreshed (5 minutes)
const REFRESH_BUFFER_MINUTES: i64 = 5;

/// Workspace role of a company member.
///
/// Roles the dashboard does not know about are carried through verbatim
/// so that a newer server never breaks an older client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    Admin,
    Manager,
    #[default]
    Member,
    Other(String),
}

impl Role {
    pub fn as_str(&self) -> &str {
        match self {
            Role::Admin => "admin",
            Role::Manager => "manager",
            Role::Member => "member",
            Role::Other(name) => name,
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin)
    }

    /// Admins manage everything a manager can.
    pub fn is_manager(&self) -> bool {
        matches!(self, Role::Admin | Role::Manager)
    }
}

impl From<String> for Role {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "admin" => Role::Admin,
            "manager" => Role::Manager,
            "member" => Role::Member,
            _ => Role::Other(value.trim().to_string()),
        }
    }
}

impl From<&str> for Role {
    fn from(value: &str) -> Self {
        Role::from(value.to_string())
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        match role {
            Role::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity facts for the signed-in member.
///
/// Claims are never edited in place: a re-login or refresh produces a new
/// value that supersedes the old one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct IdentityClaims {
    #[serde(default)]
    pub username: String,
    #[serde(default, alias = "companyName")]
    pub company_name: String,
    #[serde(default)]
    #[cfg_attr(feature = "ts", ts(type = "string"))]
    pub role: Role,
    #[serde(default, alias = "expiresAt")]
    #[cfg_attr(feature = "ts", ts(type = "string | null"))]
    pub expires_at: Option<DateTime<Utc>>,
}

impl IdentityClaims {
    pub fn new(
        username: impl Into<String>,
        company_name: impl Into<String>,
        role: impl Into<Role>,
    ) -> Self {
        Self {
            username: username.into(),
            company_name: company_name.into(),
            role: role.into(),
            expires_at: None,
        }
    }

    pub fn with_expiry(self, expires_at: Option<DateTime<Utc>>) -> Self {
        Self { expires_at, ..self }
    }

    /// Both `username` and `company_name` are populated.
    pub fn is_complete(&self) -> bool {
        !self.username.trim().is_empty() && !self.company_name.trim().is_empty()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    /// Complete and not expired: the only claims allowed to back a session.
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        self.is_complete() && !self.is_expired_at(now)
    }

    pub fn time_until_expiry(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.expires_at.map(|at| at - now)
    }

    /// Check if the session will expire soon and should be refreshed
    pub fn needs_refresh_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .map(|at| now > at - Duration::minutes(REFRESH_BUFFER_MINUTES))
            .unwrap_or(false)
    }
}

// ============================================================================
// Tests
// ============================================================================
