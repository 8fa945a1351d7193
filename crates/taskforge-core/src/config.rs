use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

pub const DEFAULT_PORT: u16 = 8700;
pub const DEFAULT_BIND: &str = "0.0.0.0";
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_SCRIPT_TIMEOUT_SECS: u64 = 300;

/// Top-level config (taskforge.toml + TASKFORGE_* env overrides).
///
/// The well-known plain environment variables take precedence over both:
/// `DATABASE_URL`, `SECRETS_MASTER_KEY`, `API_KEY`, `POLL_INTERVAL`,
/// `CORS_ORIGINS`, `AGENT_MODEL`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgeConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database path, optionally prefixed `sqlite://`.
    #[serde(default)]
    pub url: String,
}

impl DatabaseConfig {
    /// The plain filesystem path with any `sqlite://` scheme stripped.
    pub fn sqlite_path(&self) -> &str {
        self.url
            .strip_prefix("sqlite://")
            .unwrap_or(self.url.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Optional API key. When unset the HTTP surface is unauthenticated.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Comma-separated allowed CORS origins.
    #[serde(default = "default_cors")]
    pub cors_origins: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            api_key: None,
            cors_origins: default_cors(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Seconds between polls when no work is available.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Worker identity. Defaults to `worker-{hostname}` when unset.
    #[serde(default)]
    pub worker_id: Option<String>,
    /// Default workspace for tasks that carry none.
    #[serde(default)]
    pub workspace: Option<String>,
    /// Wall-clock timeout for script execution.
    #[serde(default = "default_script_timeout")]
    pub script_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            worker_id: None,
            workspace: None,
            script_timeout_secs: default_script_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_model")]
    pub model: String,
    /// Agent CLI command to spawn.
    #[serde(default = "default_agent_command")]
    pub command: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            command: default_agent_command(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecretsConfig {
    /// Base64-encoded 32-byte master key for the secrets vault.
    #[serde(default)]
    pub master_key: String,
}

fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_cors() -> String {
    "*".to_string()
}
fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}
fn default_script_timeout() -> u64 {
    DEFAULT_SCRIPT_TIMEOUT_SECS
}
fn default_model() -> String {
    "claude-sonnet-4-5".to_string()
}
fn default_agent_command() -> String {
    "claude".to_string()
}

impl ForgeConfig {
    /// Load config from a TOML file with TASKFORGE_* env var overrides,
    /// then the well-known plain environment variables on top.
    ///
    /// Returns `CoreError::Config` when a required value is missing:
    /// the database path and the secrets master key must be set.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path.unwrap_or("taskforge.toml");

        let mut config: ForgeConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("TASKFORGE_").split("__"))
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))?;

        config.apply_well_known_env();
        config.validate()?;
        Ok(config)
    }

    /// Overlay the plain environment variables the service documents.
    fn apply_well_known_env(&mut self) {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database.url = url;
        }
        if let Ok(key) = std::env::var("SECRETS_MASTER_KEY") {
            self.secrets.master_key = key;
        }
        if let Ok(key) = std::env::var("API_KEY") {
            if !key.is_empty() {
                self.server.api_key = Some(key);
            }
        }
        if let Ok(interval) = std::env::var("POLL_INTERVAL") {
            if let Ok(secs) = interval.parse() {
                self.worker.poll_interval_secs = secs;
            }
        }
        if let Ok(origins) = std::env::var("CORS_ORIGINS") {
            self.server.cors_origins = origins;
        }
        if let Ok(model) = std::env::var("AGENT_MODEL") {
            self.agent.model = model;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(CoreError::Config(
                "database url not set (DATABASE_URL or [database] url)".into(),
            ));
        }
        if self.secrets.master_key.is_empty() {
            return Err(CoreError::Config(
                "secrets master key not set (SECRETS_MASTER_KEY or [secrets] master_key)".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_path_strips_scheme() {
        let db = DatabaseConfig {
            url: "sqlite:///var/lib/taskforge.db".to_string(),
        };
        assert_eq!(db.sqlite_path(), "/var/lib/taskforge.db");

        let plain = DatabaseConfig {
            url: "/tmp/forge.db".to_string(),
        };
        assert_eq!(plain.sqlite_path(), "/tmp/forge.db");
    }

    #[test]
    fn validate_requires_database_and_master_key() {
        let mut config = ForgeConfig {
            database: DatabaseConfig::default(),
            server: ServerConfig::default(),
            worker: WorkerConfig::default(),
            agent: AgentConfig::default(),
            secrets: SecretsConfig::default(),
        };
        assert!(config.validate().is_err());

        config.database.url = ":memory:".to_string();
        assert!(config.validate().is_err());

        config.secrets.master_key = "a".repeat(44);
        assert!(config.validate().is_ok());
    }
}
