//! Configuration types for cdcrepl
//!
//! Loaded from YAML with `${VAR}` / `${VAR:-default}` expansion:
//!
//! ```yaml
//! source:
//!   servers:
//!     - { host: 127.0.0.1, port: 3000, user: maxuser, password: maxpwd }
//!   server_id: 1234
//!   gtid: "0-3000-1"
//! sink:
//!   host: 127.0.0.1
//!   user: maxuser
//!   password: ${SINK_PASSWORD}
//!   bulk_metadata: ./Columnstore.xml
//! state:
//!   dir: ./state
//! ```

use crate::error::ReplicatorError;
use crate::filter::TableFilter;
use crate::position::Gtid;
use crate::resilience::RetryConfig;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Password or other secret; never printed.
#[derive(Clone, Default)]
pub struct SensitiveString(SecretString);

impl SensitiveString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretString::from(value.into()))
    }

    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl fmt::Debug for SensitiveString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("\"***REDACTED***\"")
    }
}

impl From<String> for SensitiveString {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for SensitiveString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl Serialize for SensitiveString {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("***REDACTED***")
    }
}

impl<'de> Deserialize<'de> for SensitiveString {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Self::new(value))
    }
}

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReplicatorConfig {
    pub source: SourceConfig,
    pub sink: SinkConfig,
    pub state: StateConfig,
    #[serde(default)]
    pub replicator: ReplicatorSettings,
}

/// Replication source
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    /// Tried in order on every (re)connect
    pub servers: Vec<ServerEndpoint>,

    /// Replica id announced with COM_REGISTER_SLAVE
    pub server_id: u32,

    /// Start position used when no checkpoint is stored
    #[serde(default)]
    pub gtid: Option<Gtid>,

    #[serde(default = "default_heartbeat_period_secs")]
    pub heartbeat_period_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl SourceConfig {
    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_secs(self.heartbeat_period_secs)
    }

    /// A silent stream for three heartbeat periods counts as dead.
    pub fn read_timeout(&self) -> Duration {
        self.heartbeat_period() * 3
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn default_heartbeat_period_secs() -> u64 {
    5
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_mysql_port() -> u16 {
    3306
}

/// One MariaDB server endpoint
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerEndpoint {
    pub host: String,
    #[serde(default = "default_mysql_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: SensitiveString,
}

impl ServerEndpoint {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            password: SensitiveString::new(password),
        }
    }
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// ColumnStore target
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SinkConfig {
    pub host: String,
    #[serde(default = "default_mysql_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: SensitiveString,

    /// Bulk-load metadata descriptor (Columnstore.xml)
    pub bulk_metadata: PathBuf,

    /// Write every table into this database instead of its source database
    #[serde(default)]
    pub database: Option<String>,
}

impl SinkConfig {
    pub fn endpoint(&self) -> ServerEndpoint {
        ServerEndpoint {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            password: self.password.clone(),
        }
    }
}

/// Durable state location
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StateConfig {
    pub dir: PathBuf,
}

/// Supervisor behaviour
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ReplicatorSettings {
    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub include_tables: Vec<String>,

    #[serde(default)]
    pub exclude_tables: Vec<String>,
}

impl ReplicatorSettings {
    pub fn table_filter(&self) -> Result<TableFilter, ReplicatorError> {
        TableFilter::new(&self.include_tables, &self.exclude_tables)
            .map_err(|e| ReplicatorError::config(e.to_string()))
    }
}

impl ReplicatorConfig {
    /// Load, expand and validate a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ReplicatorError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ReplicatorError::config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ReplicatorError> {
        let expanded = Self::expand_env_vars(content);
        let config: Self = serde_yaml::from_str(&expanded)
            .map_err(|e| ReplicatorError::config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Expand environment variables in the format ${VAR} or ${VAR:-default}
    fn expand_env_vars(content: &str) -> String {
        ENV_VAR_REGEX
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default = caps.get(2).map(|m| m.as_str());

                std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
            })
            .to_string()
    }

    pub fn validate(&self) -> Result<(), ReplicatorError> {
        let source = &self.source;
        if source.servers.is_empty() {
            return Err(ReplicatorError::config(
                "source.servers must list at least one server",
            ));
        }
        for (i, server) in source.servers.iter().enumerate() {
            if server.host.is_empty() {
                return Err(ReplicatorError::config(format!(
                    "source.servers[{}].host must not be empty",
                    i
                )));
            }
            if server.user.is_empty() {
                return Err(ReplicatorError::config(format!(
                    "source.servers[{}].user must not be empty",
                    i
                )));
            }
        }
        if source.server_id == 0 {
            return Err(ReplicatorError::config("source.server_id must not be 0"));
        }
        if source.heartbeat_period_secs == 0 {
            return Err(ReplicatorError::config(
                "source.heartbeat_period_secs must be at least 1",
            ));
        }
        if source.connect_timeout_secs == 0 {
            return Err(ReplicatorError::config(
                "source.connect_timeout_secs must be at least 1",
            ));
        }

        if self.sink.host.is_empty() || self.sink.user.is_empty() {
            return Err(ReplicatorError::config(
                "sink.host and sink.user must not be empty",
            ));
        }
        if self.sink.bulk_metadata.as_os_str().is_empty() {
            return Err(ReplicatorError::config("sink.bulk_metadata must be set"));
        }
        if self.state.dir.as_os_str().is_empty() {
            return Err(ReplicatorError::config("state.dir must be set"));
        }

        self.replicator
            .retry
            .validate()
            .map_err(ReplicatorError::config)?;
        self.replicator.table_filter()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
source:
  servers:
    - host: 127.0.0.1
      port: 3000
      user: maxuser
      password: maxpwd
  server_id: 1234
  gtid: "0-3000-1"
sink:
  host: 127.0.0.1
  user: maxuser
  password: sinkpwd
  bulk_metadata: ./Columnstore.xml
state:
  dir: ./state
"#;

    #[test]
    fn test_parse_minimal_config() {
        let config = ReplicatorConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.source.servers.len(), 1);
        assert_eq!(config.source.servers[0].port, 3000);
        assert_eq!(config.source.servers[0].password.expose_secret(), "maxpwd");
        assert_eq!(config.source.gtid, Some(Gtid::new(0, 3000, 1)));
        assert_eq!(config.source.read_timeout(), Duration::from_secs(15));
        assert_eq!(config.sink.port, 3306);
        assert!(config.sink.database.is_none());
        assert_eq!(config.replicator.retry.max_retries(), 10);
        assert!(config.replicator.table_filter().unwrap().is_pass_through());
    }

    #[test]
    fn test_debug_redacts_passwords() {
        let config = ReplicatorConfig::from_yaml(MINIMAL).unwrap();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("maxpwd"));
        assert!(!debug.contains("sinkpwd"));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn test_env_var_expansion() {
        std::env::set_var("CDCREPL_TEST_HOST", "db.internal");
        let expanded = ReplicatorConfig::expand_env_vars("host: ${CDCREPL_TEST_HOST}");
        assert_eq!(expanded, "host: db.internal");
    }

    #[test]
    fn test_env_var_with_default() {
        std::env::remove_var("CDCREPL_MISSING_VAR");
        let expanded = ReplicatorConfig::expand_env_vars("port: ${CDCREPL_MISSING_VAR:-3307}");
        assert_eq!(expanded, "port: 3307");
    }

    #[test]
    fn test_validation_failures() {
        let cases = [
            ("server_id: 1234", "server_id: 0", "server_id"),
            ("gtid: \"0-3000-1\"", "gtid: \"zero\"", "parse"),
            (
                "  gtid: \"0-3000-1\"",
                "  gtid: \"0-3000-1\"\n  heartbeat_period_secs: 0",
                "heartbeat",
            ),
            ("bulk_metadata: ./Columnstore.xml", "bulk_metadata: \"\"", "bulk_metadata"),
        ];
        for (from, to, needle) in cases {
            let yaml = MINIMAL.replacen(from, to, 1);
            let err = ReplicatorConfig::from_yaml(&yaml).unwrap_err();
            assert!(
                err.to_string().contains(needle),
                "{} should mention {}",
                err,
                needle
            );
        }
    }

    #[test]
    fn test_invalid_table_pattern() {
        let yaml = format!("{}replicator:\n  include_tables: [\"\"]\n", MINIMAL);
        let err = ReplicatorConfig::from_yaml(&yaml).unwrap_err();
        assert!(matches!(err, ReplicatorError::Config(_)));
    }

    #[test]
    fn test_replicator_section() {
        let yaml = format!(
            "{}replicator:\n  retry: {{ max_retries: -1, initial_backoff_ms: 10, max_backoff_ms: 100 }}\n  exclude_tables: [\"mysql.*\"]\n",
            MINIMAL
        );
        let config = ReplicatorConfig::from_yaml(&yaml).unwrap();
        assert!(config.replicator.retry.is_infinite());
        let filter = config.replicator.table_filter().unwrap();
        assert!(!filter.accepts("mysql", "user"));
    }
}
