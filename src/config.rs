use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub brake: BrakeConfig,
    #[serde(default)]
    pub approvals: ApprovalConfig,
    #[serde(default)]
    pub autonomy: AutonomyConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Task lifecycle policy
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Concurrent tasks per agent kind (default: 4)
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    /// Heartbeat refresh period for running tasks (default: 30s)
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Zombie / expiry / retention sweep period (default: 300s)
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Failed attempts before dead-lettering (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First retry delay (default: 30s)
    #[serde(default = "default_retry_base_delay_secs")]
    pub retry_base_delay_secs: u64,
    /// Retry delay ceiling (default: 600s)
    #[serde(default = "default_retry_max_delay_secs")]
    pub retry_max_delay_secs: u64,
    /// Ask the agent to checkpoint and stop (default: 240s)
    #[serde(default = "default_soft_timeout_secs")]
    pub soft_timeout_secs: u64,
    /// Force-fail the attempt (default: 300s)
    #[serde(default = "default_hard_timeout_secs")]
    pub hard_timeout_secs: u64,
    /// Terminal tasks older than this are deleted by the sweep (default: 30 days)
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_worker_pool_size() -> usize {
    4
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_secs() -> u64 {
    30
}

fn default_retry_max_delay_secs() -> u64 {
    600
}

fn default_soft_timeout_secs() -> u64 {
    240
}

fn default_hard_timeout_secs() -> u64 {
    300
}

fn default_retention_days() -> u32 {
    30
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: default_worker_pool_size(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_attempts: default_max_attempts(),
            retry_base_delay_secs: default_retry_base_delay_secs(),
            retry_max_delay_secs: default_retry_max_delay_secs(),
            soft_timeout_secs: default_soft_timeout_secs(),
            hard_timeout_secs: default_hard_timeout_secs(),
            retention_days: default_retention_days(),
        }
    }
}

impl SchedulerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Heartbeat age after which a running task counts as a zombie
    pub fn zombie_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds((self.heartbeat_interval_secs * 2) as i64)
    }
}

/// What happens to the partial state of tasks force-terminated by the brake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialPolicy {
    /// Keep the last checkpoint on the cancelled task
    #[default]
    Persist,
    /// Drop the checkpoint
    Discard,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrakeConfig {
    /// How long running tasks have to acknowledge a pause (default: 120s)
    #[serde(default = "default_ack_window_secs")]
    pub ack_window_secs: u64,
    #[serde(default)]
    pub partial_policy: PartialPolicy,
}

fn default_ack_window_secs() -> u64 {
    120
}

impl Default for BrakeConfig {
    fn default() -> Self {
        Self {
            ack_window_secs: default_ack_window_secs(),
            partial_policy: PartialPolicy::default(),
        }
    }
}

impl BrakeConfig {
    pub fn ack_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.ack_window_secs as i64)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApprovalConfig {
    /// Pending items expire after this long (default: 48h)
    #[serde(default = "default_approval_ttl_hours")]
    pub ttl_hours: u64,
}

fn default_approval_ttl_hours() -> u64 {
    48
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            ttl_hours: default_approval_ttl_hours(),
        }
    }
}

impl ApprovalConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.ttl_hours as i64)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutonomyConfig {
    /// Daily write cap for L2 users (default: 50)
    #[serde(default = "default_l2_daily_cap")]
    pub l2_daily_cap: u32,
    /// Daily direct-execution cap for L3 users (default: 25)
    #[serde(default = "default_l3_daily_cap")]
    pub l3_daily_cap: u32,
}

fn default_l2_daily_cap() -> u32 {
    50
}

fn default_l3_daily_cap() -> u32 {
    25
}

impl Default for AutonomyConfig {
    fn default() -> Self {
        Self {
            l2_daily_cap: default_l2_daily_cap(),
            l3_daily_cap: default_l3_daily_cap(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL; in-memory store when unset
    #[serde(default)]
    pub url: Option<String>,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// HTTP listen address (default: 0.0.0.0:8080)
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default values
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("database.max_connections", 5)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("JOBPILOT_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (JOBPILOT__SCHEDULER__MAX_ATTEMPTS, etc.)
            .add_source(
                Environment::with_prefix("JOBPILOT")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let s = &self.scheduler;

        if s.worker_pool_size == 0 {
            errors.push("scheduler.worker_pool_size must be at least 1".to_string());
        }

        if s.max_attempts == 0 {
            errors.push("scheduler.max_attempts must be at least 1".to_string());
        }

        if s.heartbeat_interval_secs == 0 {
            errors.push("scheduler.heartbeat_interval_secs must be positive".to_string());
        }

        if s.sweep_interval_secs == 0 {
            errors.push("scheduler.sweep_interval_secs must be positive".to_string());
        }

        if s.soft_timeout_secs >= s.hard_timeout_secs {
            errors.push(
                "scheduler.soft_timeout_secs should be less than hard_timeout_secs".to_string(),
            );
        }

        if s.retry_base_delay_secs > s.retry_max_delay_secs {
            errors.push(
                "scheduler.retry_base_delay_secs should not exceed retry_max_delay_secs"
                    .to_string(),
            );
        }

        if self.brake.ack_window_secs == 0 {
            errors.push("brake.ack_window_secs must be positive".to_string());
        }

        if self.approvals.ttl_hours == 0 {
            errors.push("approvals.ttl_hours must be positive".to_string());
        }

        if let Some(url) = &self.database.url {
            if !url.starts_with("postgres://") && !url.starts_with("postgresql://") {
                errors.push("database.url must be a postgres:// URL".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
