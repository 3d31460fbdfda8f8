//! Configuration parsing and resolution for relay

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Full process configuration, loaded once at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    pub database: DatabaseConfig,
    pub providers: ProvidersConfig,
    pub retry: Option<RetryConfig>,
    pub server: Option<ServerConfig>,
    pub scm: Option<ScmConfig>,
}

/// Persistence backend configuration (event store + record store).
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
}

fn default_database_url() -> String {
    "sqlite://relay.db".to_string()
}

/// Per-provider HMAC secrets. An absent or empty secret disables that
/// provider's ingress endpoint entirely.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProvidersConfig {
    pub payments: Option<ConfigValue>,
    pub identity: Option<ConfigValue>,
    pub source_control: Option<ConfigValue>,
    pub email: Option<ConfigValue>,
}

/// Retry, timeout, and replay-tolerance knobs for the ingress and dispatch path.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_replay_tolerance_ms")]
    pub replay_tolerance_ms: i64,
    #[serde(default = "default_handler_timeout_ms")]
    pub handler_timeout_ms: u64,
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

fn default_replay_tolerance_ms() -> i64 {
    300_000
}
fn default_handler_timeout_ms() -> u64 {
    30_000
}
fn default_max_retry_attempts() -> u32 {
    5
}
fn default_retry_base_delay_ms() -> u64 {
    1_000
}
fn default_retry_max_delay_ms() -> u64 {
    60_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            replay_tolerance_ms: default_replay_tolerance_ms(),
            handler_timeout_ms: default_handler_timeout_ms(),
            max_retry_attempts: default_max_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
    #[serde(default)]
    pub behind_proxy: bool,
    /// Bearer token required for management endpoints (`/api/events/...`).
    pub management_token: Option<ConfigValue>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: vec![],
            behind_proxy: false,
            management_token: None,
        }
    }
}

/// Source-control API configuration (GitHub-compatible Contents API).
#[derive(Debug, Clone, Deserialize)]
pub struct ScmConfig {
    #[serde(default = "default_scm_api_base")]
    pub api_base: String,
    pub token: Option<ConfigValue>,
}

fn default_scm_api_base() -> String {
    "https://api.github.com".to_string()
}

/// A config value that can be a literal or an `env:VAR_NAME` indirection.
///
/// Mirrors the teacher's `ConfigValue`, used so HMAC keys and API tokens never
/// have to be written in plaintext config files.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Literal(String),
}

impl ConfigValue {
    /// Resolve the value, reading from the environment if it starts with `env:`.
    pub fn resolve(&self) -> Result<String> {
        match self {
            ConfigValue::Literal(s) => {
                if let Some(var_name) = s.strip_prefix("env:") {
                    std::env::var(var_name).map_err(|_| {
                        Error::Config(format!("Environment variable {} not set", var_name))
                    })
                } else {
                    Ok(s.clone())
                }
            }
        }
    }

    /// Resolve the value, treating an unset/empty result as "disabled" rather
    /// than an error.
    pub fn resolve_or_disabled(&self) -> Option<String> {
        match self.resolve() {
            Ok(v) if !v.is_empty() => Some(v),
            _ => None,
        }
    }
}

/// Wrapper for loading config from file.
pub struct Config;

impl Config {
    /// Load config from a specific path.
    pub fn from_path(path: &Path) -> Result<RelayConfig> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| Error::ConfigParse {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// Resolve config file path using the resolution order:
/// 1. Explicit path if provided
/// 2. `RELAY_CONFIG` env var
/// 3. `relay.toml` in the current directory, walking up ancestors
/// 4. `~/.config/relay/config.toml` (user default)
/// 5. `/etc/relay/config.toml` (system default)
pub fn resolve_config(explicit_path: Option<&Path>) -> Result<RelayConfig> {
    let mut searched = Vec::new();

    if let Some(path) = explicit_path {
        if path.exists() {
            return Config::from_path(path);
        }
        searched.push(path.to_path_buf());
    }

    if let Ok(env_path) = std::env::var("RELAY_CONFIG") {
        let path = PathBuf::from(&env_path);
        if path.exists() {
            return Config::from_path(&path);
        }
        searched.push(path);
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = Some(cwd.as_path());
        while let Some(d) = dir {
            let config_path = d.join("relay.toml");
            if config_path.exists() {
                return Config::from_path(&config_path);
            }
            searched.push(config_path);
            dir = d.parent();
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let user_config = config_dir.join("relay").join("config.toml");
        if user_config.exists() {
            return Config::from_path(&user_config);
        }
        searched.push(user_config);
    }

    let system_config = PathBuf::from("/etc/relay/config.toml");
    if system_config.exists() {
        return Config::from_path(&system_config);
    }
    searched.push(system_config);

    Err(Error::ConfigNotFound { searched })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn config_value_literal() {
        let val = ConfigValue::Literal("shh".to_string());
        assert_eq!(val.resolve().unwrap(), "shh");
    }

    #[test]
    fn config_value_env() {
        unsafe {
            std::env::set_var("TEST_RELAY_VAR", "from_env");
        }
        let val = ConfigValue::Literal("env:TEST_RELAY_VAR".to_string());
        assert_eq!(val.resolve().unwrap(), "from_env");
        unsafe {
            std::env::remove_var("TEST_RELAY_VAR");
        }
    }

    #[test]
    fn config_value_env_missing_is_error() {
        let val = ConfigValue::Literal("env:NONEXISTENT_RELAY_VAR_12345".to_string());
        assert!(val.resolve().is_err());
    }

    #[test]
    fn config_value_empty_resolves_to_disabled() {
        let val = ConfigValue::Literal(String::new());
        assert_eq!(val.resolve_or_disabled(), None);
    }

    #[test]
    fn parse_minimal_config() {
        let toml = r#"
[database]
url = "sqlite://test.db"

[providers]
payments = "whsec_test"
"#;
        let config: RelayConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.database.url, "sqlite://test.db");
        assert!(config.providers.payments.is_some());
        assert!(config.providers.identity.is_none());
        assert!(config.retry.is_none());
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
[database]
url = "sqlite://relay.db"

[providers]
payments = "whsec_pay"
identity = "env:IDENTITY_SECRET"
source_control = "shared_secret"
email = "svix_secret"

[retry]
replay_tolerance_ms = 60000
max_retry_attempts = 3

[server]
host = "127.0.0.1"
port = 3000
cors_origins = ["https://example.com"]
behind_proxy = true

[scm]
api_base = "https://git.example.com/api/v3"
token = "env:SCM_TOKEN"
"#;
        let config: RelayConfig = toml::from_str(toml).unwrap();
        let retry = config.retry.unwrap();
        assert_eq!(retry.replay_tolerance_ms, 60000);
        assert_eq!(retry.max_retry_attempts, 3);
        // Defaults fill in for fields not set
        assert_eq!(retry.handler_timeout_ms, 30_000);

        let server = config.server.unwrap();
        assert_eq!(server.port, 3000);
        assert!(server.behind_proxy);

        let scm = config.scm.unwrap();
        assert_eq!(scm.api_base, "https://git.example.com/api/v3");
    }

    #[test]
    fn load_config_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("relay.toml");
        std::fs::write(
            &config_path,
            r#"
[database]
url = "sqlite://test.db"

[providers]
"#,
        )
        .unwrap();

        let config = Config::from_path(&config_path).unwrap();
        assert_eq!(config.database.url, "sqlite://test.db");
    }

    #[test]
    fn load_config_invalid_toml_errors() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("invalid.toml");
        std::fs::write(&config_path, "this is not valid toml {{{").unwrap();
        assert!(Config::from_path(&config_path).is_err());
    }

    #[test]
    fn retry_config_defaults() {
        let retry = RetryConfig::default();
        assert_eq!(retry.replay_tolerance_ms, 300_000);
        assert_eq!(retry.handler_timeout_ms, 30_000);
        assert_eq!(retry.max_retry_attempts, 5);
        assert_eq!(retry.retry_base_delay_ms, 1_000);
        assert_eq!(retry.retry_max_delay_ms, 60_000);
    }
}
