//! ShardKeeper Configuration
//!
//! Configuration structures for the central node, the two year partitions,
//! connection acquisition, recovery scheduling and the HTTP API.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::node::acquire::RetryPolicy;
use crate::node::NodeRole;

/// Main ShardKeeper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardKeeperConfig {
    /// Partitioning configuration
    #[serde(default)]
    pub shard: ShardConfig,

    /// Database endpoints for every node role
    pub nodes: NodesConfig,

    /// Connection acquisition policy
    #[serde(default)]
    pub acquire: AcquireConfig,

    /// Recovery scheduling
    #[serde(default)]
    pub recovery: RecoveryConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Partitioning configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardConfig {
    /// Records with `year` strictly below this go to the before-cutoff node
    #[serde(default = "default_cutoff_year")]
    pub cutoff_year: i32,
}

/// Endpoints for the three nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodesConfig {
    pub central: DatabaseConfig,
    pub before_cutoff: DatabaseConfig,
    pub after_cutoff: DatabaseConfig,
}

/// Database connection configuration for a single node
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DatabaseConfig {
    /// MariaDB host
    pub host: String,

    /// MariaDB port
    #[serde(default = "default_db_port")]
    pub port: u16,

    /// Database user
    pub user: String,

    /// Database password
    #[serde(default)]
    pub password: String,

    /// Database name
    pub database: String,

    /// Connection pool size
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

/// Connection acquisition configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquireConfig {
    /// Per-attempt timeout in milliseconds
    #[serde(default = "default_acquire_timeout_ms")]
    pub timeout_ms: u64,

    /// Attempts before a node is reported unavailable
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Wait between attempts in milliseconds
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Multiplier applied to the wait after each failed attempt (1.0 = fixed)
    #[serde(default = "default_backoff")]
    pub backoff: f64,
}

/// Recovery scheduling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Run a recovery pass before serving traffic
    #[serde(default = "default_true")]
    pub on_startup: bool,

    /// Periodic recovery interval in seconds (0 = disabled)
    #[serde(default)]
    pub interval_secs: u64,

    /// Run a recovery pass in front of every API request
    #[serde(default = "default_true")]
    pub gate_requests: bool,

    /// Minimum spacing between gated recovery passes in milliseconds
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_cutoff_year() -> i32 {
    1980
}

fn default_db_port() -> u16 {
    3306
}

fn default_pool_size() -> u32 {
    10
}

fn default_acquire_timeout_ms() -> u64 {
    2000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_interval_ms() -> u64 {
    200
}

fn default_backoff() -> f64 {
    1.0
}

fn default_min_interval_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            cutoff_year: default_cutoff_year(),
        }
    }
}

impl Default for AcquireConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_acquire_timeout_ms(),
            max_attempts: default_max_attempts(),
            retry_interval_ms: default_retry_interval_ms(),
            backoff: default_backoff(),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            on_startup: true,
            interval_secs: 0,
            gate_requests: true,
            min_interval_ms: default_min_interval_ms(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_api_address(),
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

impl DatabaseConfig {
    /// Get database connection URL
    pub fn url(&self) -> String {
        format!(
            "mysql://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }

    /// Endpoint without credentials, safe for logs
    pub fn endpoint(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }
}

impl NodesConfig {
    /// Configuration for a node role
    pub fn get(&self, role: NodeRole) -> &DatabaseConfig {
        match role {
            NodeRole::Central => &self.central,
            NodeRole::BeforeCutoff => &self.before_cutoff,
            NodeRole::AfterCutoff => &self.after_cutoff,
        }
    }
}

impl ShardKeeperConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: ShardKeeperConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        for role in NodeRole::ALL {
            let db = self.nodes.get(role);
            if db.host.is_empty() {
                return Err(crate::Error::Config(format!("nodes.{}.host cannot be empty", role.config_key())));
            }
            if db.database.is_empty() {
                return Err(crate::Error::Config(format!("nodes.{}.database cannot be empty", role.config_key())));
            }
            if db.pool_size == 0 {
                return Err(crate::Error::Config(format!("nodes.{}.pool_size must be at least 1", role.config_key())));
            }
        }

        let endpoints: std::collections::HashSet<String> = NodeRole::ALL
            .iter()
            .map(|role| self.nodes.get(*role).endpoint())
            .collect();
        if endpoints.len() != NodeRole::ALL.len() {
            return Err(crate::Error::Config("every node must point at a distinct database".into()));
        }

        if self.acquire.timeout_ms == 0 {
            return Err(crate::Error::Config("acquire.timeout_ms must be greater than 0".into()));
        }

        if self.acquire.max_attempts == 0 {
            return Err(crate::Error::Config("acquire.max_attempts must be at least 1".into()));
        }

        if !self.acquire.backoff.is_finite() || self.acquire.backoff < 1.0 {
            return Err(crate::Error::Config("acquire.backoff must be a finite number >= 1.0".into()));
        }

        Ok(())
    }

    /// Retry policy used for every connection acquisition
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(self.acquire.timeout_ms),
            max_attempts: self.acquire.max_attempts,
            interval: Duration::from_millis(self.acquire.retry_interval_ms),
            backoff: self.acquire.backoff,
        }
    }

    /// Periodic recovery interval, if enabled
    pub fn recovery_interval(&self) -> Option<Duration> {
        (self.recovery.interval_secs > 0).then(|| Duration::from_secs(self.recovery.interval_secs))
    }

    /// Minimum spacing between request-gated recovery passes
    pub fn recovery_gate_interval(&self) -> Duration {
        Duration::from_millis(self.recovery.min_interval_ms)
    }
}
