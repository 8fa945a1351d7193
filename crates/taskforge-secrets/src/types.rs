use serde::{Deserialize, Serialize};

/// Visibility scope of a stored secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretScope {
    /// Shared by every task on the platform.
    Platform,
    /// Bound to a single user; takes precedence over a platform value
    /// with the same key.
    User,
}

impl SecretScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecretScope::Platform => "platform",
            SecretScope::User => "user",
        }
    }
}

impl std::str::FromStr for SecretScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "platform" => Ok(SecretScope::Platform),
            "user" => Ok(SecretScope::User),
            other => Err(format!("unknown secret scope: {other}")),
        }
    }
}

/// Secret metadata returned by listings. Never carries plaintext.
#[derive(Debug, Clone, Serialize)]
pub struct SecretMeta {
    pub id: i64,
    pub key: String,
    pub scope: SecretScope,
    pub user_id: Option<i64>,
    pub description: Option<String>,
    pub expires_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}
