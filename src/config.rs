//! Service Discovery Configuration
//!
//! This module provides configuration structures for server set
//! registration, discovery and leader election.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::acl::Credentials;
use crate::path::GroupPath;
use crate::retry::RetryPolicy;

/// Main service discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Server set paths and node naming
    pub discovery: ServerSetConfig,

    /// Coordination service session settings
    #[serde(default)]
    pub coordination: CoordinationConfig,

    /// Retry budget for coordination operations
    #[serde(default)]
    pub retry: RetryConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server set configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSetConfig {
    /// Path members and candidates register under
    pub serverset_path: String,

    /// Node name prefix for election candidates
    #[serde(default = "default_candidate_prefix")]
    pub candidate_prefix: String,

    /// Node name prefix for server set members
    #[serde(default = "default_member_prefix")]
    pub member_prefix: String,
}

/// Coordination service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// Upper bound on a single coordination call in milliseconds
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    /// Digest credentials; without them created nodes are world-writable
    #[serde(default)]
    pub credentials: Option<Credentials>,
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// First backoff delay in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Largest backoff delay in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Attempts before giving up, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_candidate_prefix() -> String {
    "singleton_candidate_".to_string()
}

fn default_member_prefix() -> String {
    "member_".to_string()
}

fn default_session_timeout_ms() -> u64 {
    4000
}

fn default_operation_timeout_ms() -> u64 {
    5000
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            session_timeout_ms: default_session_timeout_ms(),
            operation_timeout_ms: default_operation_timeout_ms(),
            credentials: None,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl DiscoveryConfig {
    /// Configuration with defaults for everything but the server set path
    pub fn new(serverset_path: impl Into<String>) -> Self {
        Self {
            discovery: ServerSetConfig {
                serverset_path: serverset_path.into(),
                candidate_prefix: default_candidate_prefix(),
                member_prefix: default_member_prefix(),
            },
            coordination: CoordinationConfig::default(),
            retry: RetryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DiscoveryConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: DiscoveryConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        GroupPath::new(self.discovery.serverset_path.as_str())?;

        for (key, prefix) in [
            ("discovery.candidate_prefix", &self.discovery.candidate_prefix),
            ("discovery.member_prefix", &self.discovery.member_prefix),
        ] {
            if prefix.is_empty() || prefix.contains('/') {
                return Err(crate::Error::Config(format!(
                    "{} must be non-empty and contain no '/'",
                    key
                )));
            }
        }

        // Node names are told apart by prefix alone
        let (candidate, member) = (&self.discovery.candidate_prefix, &self.discovery.member_prefix);
        if candidate.starts_with(member.as_str()) || member.starts_with(candidate.as_str()) {
            return Err(crate::Error::Config(format!(
                "discovery.candidate_prefix ({}) and discovery.member_prefix ({}) must not overlap",
                candidate, member
            )));
        }

        if self.coordination.operation_timeout_ms == 0 {
            return Err(crate::Error::Config(
                "coordination.operation_timeout_ms must be positive".into(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(crate::Error::Config("retry.max_attempts must be at least 1".into()));
        }

        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(crate::Error::Config(
                "retry.initial_backoff_ms cannot exceed retry.max_backoff_ms".into(),
            ));
        }

        if let Some(credentials) = &self.coordination.credentials {
            if credentials.user.is_empty() {
                return Err(crate::Error::Config(
                    "coordination.credentials.user cannot be empty".into(),
                ));
            }
        }

        Ok(())
    }

    /// Get the server set path
    pub fn serverset_path(&self) -> crate::Result<GroupPath> {
        GroupPath::new(self.discovery.serverset_path.as_str())
    }

    /// Get the configured credentials, if any
    pub fn credentials(&self) -> Option<&Credentials> {
        self.coordination.credentials.as_ref()
    }

    /// Get session timeout as Duration
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.coordination.session_timeout_ms)
    }

    /// Get operation timeout as Duration
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.coordination.operation_timeout_ms)
    }

    /// Get the retry policy
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
            max_attempts: self.retry.max_attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[discovery]
serverset_path = "/aurora/scheduler"

[coordination]
session_timeout_ms = 4000

[coordination.credentials]
user = "aurora"
secret = "secret"

[retry]
max_attempts = 3
"#;

        let config = DiscoveryConfig::from_str(toml).unwrap();
        assert_eq!(config.discovery.serverset_path, "/aurora/scheduler");
        assert_eq!(config.discovery.candidate_prefix, "singleton_candidate_");
        assert_eq!(config.discovery.member_prefix, "member_");
        assert_eq!(config.operation_timeout(), Duration::from_secs(5));
        assert_eq!(config.retry_policy().max_attempts, 3);
        assert_eq!(config.credentials().unwrap().user, "aurora");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_defaults_without_optional_sections() {
        let config = DiscoveryConfig::from_str(
            r#"
[discovery]
serverset_path = "/svc"
"#,
        )
        .unwrap();
        assert!(config.credentials().is_none());
        assert_eq!(config.session_timeout(), Duration::from_millis(4000));
        assert_eq!(config.retry_policy().max_backoff, Duration::from_secs(10));
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let cases = [
            "[discovery]\nserverset_path = \"relative/path\"\n",
            "[discovery]\nserverset_path = \"/svc\"\nmember_prefix = \"a/b\"\n",
            "[discovery]\nserverset_path = \"/svc\"\nmember_prefix = \"x_\"\ncandidate_prefix = \"x_\"\n",
            "[discovery]\nserverset_path = \"/svc\"\nmember_prefix = \"c1\"\ncandidate_prefix = \"c\"\n",
            "[discovery]\nserverset_path = \"/svc\"\nmember_prefix = \"member\"\ncandidate_prefix = \"member_\"\n",
            "[discovery]\nserverset_path = \"/svc\"\n[retry]\nmax_attempts = 0\n",
            "[discovery]\nserverset_path = \"/svc\"\n[retry]\ninitial_backoff_ms = 500\nmax_backoff_ms = 100\n",
        ];
        for case in cases {
            let err = DiscoveryConfig::from_str(case).unwrap_err();
            assert!(matches!(err, crate::Error::Config(_)), "{}: {}", case, err);
        }

        let err = DiscoveryConfig::from_str("[discovery]\n").unwrap_err();
        assert!(matches!(err, crate::Error::ConfigParse(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[discovery]\nserverset_path = \"/aurora/scheduler\"").unwrap();

        let config = DiscoveryConfig::from_file(file.path()).unwrap();
        assert_eq!(
            config.serverset_path().unwrap().as_str(),
            "/aurora/scheduler"
        );
    }
}
