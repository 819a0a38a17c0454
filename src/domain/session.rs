//! Usage: Session data model (tokens, user identity, lifecycle status).

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Instructor,
    Student,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Instructor => "instructor",
            Role::Student => "student",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "instructor" => Some(Role::Instructor),
            "student" => Some(Role::Student),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who is signed in. Opaque to the gateway; UI layers route on `role`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    #[serde(deserialize_with = "deserialize_id_lossy")]
    pub id: String,
    #[serde(deserialize_with = "deserialize_role_lossy")]
    pub role: Role,
    #[serde(
        rename = "displayName",
        alias = "display_name",
        alias = "name",
        alias = "username",
        default
    )]
    pub display_name: String,
}

fn deserialize_id_lossy<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::String(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        other => Err(serde::de::Error::custom(format!(
            "user id must be a number or non-empty string, got {other}"
        ))),
    }
}

fn deserialize_role_lossy<'de, D>(deserializer: D) -> Result<Role, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Role::parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("unknown role: {raw}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Anonymous,
    Authenticated,
    Refreshing,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Anonymous => "anonymous",
            SessionStatus::Authenticated => "authenticated",
            SessionStatus::Refreshing => "refreshing",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the current session.
///
/// `Authenticated`/`Refreshing` always carry an access token; `Anonymous`
/// never carries tokens or a user. Only the state machine builds non-anonymous
/// values, through [`Session::signed_in`].
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub user: Option<UserIdentity>,
    pub status: SessionStatus,
}

impl Session {
    pub fn anonymous() -> Self {
        Self {
            access_token: None,
            refresh_token: None,
            user: None,
            status: SessionStatus::Anonymous,
        }
    }

    pub(crate) fn signed_in(
        access_token: String,
        refresh_token: Option<String>,
        user: Option<UserIdentity>,
        status: SessionStatus,
    ) -> Self {
        debug_assert!(status != SessionStatus::Anonymous);
        Self {
            access_token: Some(access_token),
            refresh_token,
            user,
            status,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.status == SessionStatus::Anonymous
    }

    pub fn role(&self) -> Option<Role> {
        self.user.as_ref().map(|u| u.role)
    }

    /// Same tokens and user, regardless of status.
    pub(crate) fn same_credentials(&self, other: &Session) -> bool {
        self.access_token == other.access_token
            && self.refresh_token == other.refresh_token
            && self.user == other.user
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::anonymous()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use crate::shared::security::mask_opt;
        f.debug_struct("Session")
            .field("access_token", &mask_opt(self.access_token.as_deref()))
            .field("refresh_token", &mask_opt(self.refresh_token.as_deref()))
            .field("user", &self.user)
            .field("status", &self.status)
            .finish()
    }
}
