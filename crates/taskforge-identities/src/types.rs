use serde::{Deserialize, Serialize};

/// Lifecycle status of a platform account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityStatus {
    Active,
    Blocked,
    /// Fresh account being ramped up; not yet eligible for work.
    Warming,
}

impl IdentityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityStatus::Active => "active",
            IdentityStatus::Blocked => "blocked",
            IdentityStatus::Warming => "warming",
        }
    }
}

impl std::str::FromStr for IdentityStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(IdentityStatus::Active),
            "blocked" => Ok(IdentityStatus::Blocked),
            "warming" => Ok(IdentityStatus::Warming),
            other => Err(format!("unknown identity status: {other}")),
        }
    }
}

/// An external-platform account. The cookie never leaves the registry
/// unencrypted except through `get_cookie`.
#[derive(Debug, Clone, Serialize)]
pub struct Identity {
    pub id: i64,
    pub platform: String,
    pub name: String,
    pub account_type: String,
    pub status: IdentityStatus,
    pub user_agent: Option<String>,
    pub last_used_at: Option<String>,
    pub blocked_at: Option<String>,
    pub blocked_reason: Option<String>,
    pub created_at: String,
}

/// Post-pruning usage counters for one (identity, action) pair today.
#[derive(Debug, Clone, Serialize)]
pub struct ActionStats {
    pub hourly_used: usize,
    pub hourly_limit: u32,
    pub daily_used: u32,
    pub daily_limit: u32,
    pub last_request: Option<String>,
}
