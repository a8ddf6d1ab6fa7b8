//! Configuration types shared across crates.

use crate::liveness::HealthCheckPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// HTTP listener configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Expose `/metrics` for Prometheus scraping.
    /// Restrict access to the scraper at the network level.
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            metrics_enabled: true,
        }
    }
}

/// Admin token configuration.
///
/// The configured token is ensured at startup. If its hash changes between
/// restarts, the previous bootstrap token is revoked and replaced.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdminConfig {
    /// SHA-256 hex digest of the admin token.
    /// Generate with: `echo -n "your-secret-token" | sha256sum`
    pub token_hash: String,
    /// Scopes for the admin token (default: ["cluster:admin"]).
    pub token_scopes: Option<Vec<String>>,
    pub token_description: Option<String>,
}

impl AdminConfig {
    /// **For testing only.** Matches the token "test-admin-token".
    pub fn for_testing() -> Self {
        Self {
            token_hash: "17d6bfe05d1b1fb7bc499f8e3f639c7b3eda4c40f321eef8887a0c04c89a99c5"
                .to_string(),
            token_scopes: None,
            token_description: Some("Test admin token".to_string()),
        }
    }
}

/// PostgreSQL SSL mode.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PgSslMode {
    Disable,
    #[default]
    Prefer,
    Require,
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// Single-file SQLite database. Suited to tests and single-instance
    /// deployments; lease leadership across instances needs Postgres.
    Sqlite {
        path: PathBuf,
        /// Queries slower than this are logged. SQLite cannot cancel them.
        #[serde(default = "default_sqlite_query_timeout_secs")]
        query_timeout_secs: Option<u64>,
    },
    Postgres {
        /// Takes precedence over the individual fields.
        url: Option<String>,
        host: Option<String>,
        #[serde(default = "default_pg_port")]
        port: Option<u16>,
        username: Option<String>,
        /// Prefer MERIDIAN_METADATA__PASSWORD over storing it in a file.
        password: Option<String>,
        database: Option<String>,
        ssl_mode: Option<PgSslMode>,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        #[serde(default = "default_statement_timeout_ms")]
        statement_timeout_ms: Option<u64>,
    },
}

fn default_max_connections() -> u32 {
    10
}

fn default_pg_port() -> Option<u16> {
    Some(5432)
}

fn default_statement_timeout_ms() -> Option<u64> {
    Some(30_000)
}

fn default_sqlite_query_timeout_secs() -> Option<u64> {
    Some(60)
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/meridian.db"),
            query_timeout_secs: default_sqlite_query_timeout_secs(),
        }
    }
}

impl MetadataConfig {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            MetadataConfig::Sqlite { .. } => Ok(()),
            MetadataConfig::Postgres {
                url,
                host,
                database,
                ..
            } => match (url.as_ref(), host.as_ref(), database.as_ref()) {
                (Some(_), _, _) | (None, Some(_), Some(_)) => Ok(()),
                (None, None, _) => Err(
                    "postgres config requires either 'url' or 'host' + 'database'".to_string(),
                ),
                (None, Some(_), None) => Err(
                    "postgres config requires 'database' when using individual fields".to_string(),
                ),
            },
        }
    }
}

/// Pull endpoint limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Rows returned when the caller does not ask for a limit.
    #[serde(default = "default_sync_limit")]
    pub default_limit: u32,
    /// Hard ceiling; larger requests are clamped.
    #[serde(default = "default_sync_max_limit")]
    pub max_limit: u32,
}

fn default_sync_limit() -> u32 {
    2000
}

fn default_sync_max_limit() -> u32 {
    10_000
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_limit: default_sync_limit(),
            max_limit: default_sync_max_limit(),
        }
    }
}

impl SyncConfig {
    /// Effective limit for a request. Zero or absent means the default.
    pub fn effective_limit(&self, requested: Option<u32>) -> u32 {
        match requested {
            None | Some(0) => self.default_limit.min(self.max_limit),
            Some(n) => n.min(self.max_limit),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_limit == 0 {
            return Err("sync.max_limit cannot be 0".to_string());
        }
        if self.default_limit == 0 || self.default_limit > self.max_limit {
            return Err(format!(
                "sync.default_limit {} must be between 1 and sync.max_limit {}",
                self.default_limit, self.max_limit
            ));
        }
        Ok(())
    }
}

/// Cluster task extraction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TasksConfig {
    #[serde(default = "default_extract_interval_secs")]
    pub extract_interval_secs: u64,
    /// Claims older than this are considered abandoned and may be reclaimed.
    #[serde(default = "default_claim_timeout_secs")]
    pub claim_timeout_secs: u64,
    /// Tasks claimed per role per tick.
    #[serde(default = "default_claim_batch")]
    pub claim_batch: u32,
}

fn default_extract_interval_secs() -> u64 {
    10
}

fn default_claim_timeout_secs() -> u64 {
    60
}

fn default_claim_batch() -> u32 {
    100
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            extract_interval_secs: default_extract_interval_secs(),
            claim_timeout_secs: default_claim_timeout_secs(),
            claim_batch: default_claim_batch(),
        }
    }
}

impl TasksConfig {
    pub fn extract_interval(&self) -> Duration {
        Duration::from_secs(self.extract_interval_secs)
    }

    pub fn claim_timeout(&self) -> time::Duration {
        time::Duration::seconds(i64::try_from(self.claim_timeout_secs).unwrap_or(i64::MAX))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.extract_interval_secs == 0 {
            return Err("tasks.extract_interval_secs cannot be 0".to_string());
        }
        if self.claim_batch == 0 {
            return Err("tasks.claim_batch cannot be 0".to_string());
        }
        Ok(())
    }
}

/// Active health checking.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_health_interval_secs")]
    pub interval_secs: u64,
    /// Concurrent probes per cluster run.
    #[serde(default = "default_health_workers")]
    pub workers: usize,
    /// Policy for clusters without their own.
    #[serde(default)]
    pub policy: HealthCheckPolicy,
}

fn default_health_interval_secs() -> u64 {
    60
}

fn default_health_workers() -> usize {
    10
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_health_interval_secs(),
            workers: default_health_workers(),
            policy: HealthCheckPolicy::default(),
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.interval_secs == 0 {
            return Err("health_check.interval_secs cannot be 0".to_string());
        }
        if self.workers == 0 {
            return Err("health_check.workers cannot be 0".to_string());
        }
        if self.policy.count_up == 0 || self.policy.count_down == 0 {
            return Err("health_check.policy count_up/count_down must be at least 1".to_string());
        }
        self.policy
            .validate()
            .map_err(|e| format!("health_check.policy: {e}"))
    }
}

/// Passive inactivity monitoring.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InactivityConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_inactivity_interval_secs")]
    pub interval_secs: u64,
    /// A node silent for longer than this is inactive.
    #[serde(default = "default_inactive_after_secs")]
    pub inactive_after_secs: u64,
    /// Consecutive inactive ticks before a message is raised.
    #[serde(default = "default_notify_after_ticks")]
    pub notify_after_ticks: u32,
    /// Minimum time between two messages for the same node.
    #[serde(default = "default_quiet_period_secs")]
    pub quiet_period_secs: u64,
    #[serde(default = "default_remote_start_max_tries")]
    pub remote_start_max_tries: u32,
    #[serde(default = "default_remote_start_cooldown_secs")]
    pub remote_start_cooldown_secs: u64,
}

fn default_inactivity_interval_secs() -> u64 {
    60
}

fn default_inactive_after_secs() -> u64 {
    120
}

fn default_notify_after_ticks() -> u32 {
    5
}

fn default_quiet_period_secs() -> u64 {
    3600
}

fn default_remote_start_max_tries() -> u32 {
    3
}

fn default_remote_start_cooldown_secs() -> u64 {
    600
}

impl Default for InactivityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_inactivity_interval_secs(),
            inactive_after_secs: default_inactive_after_secs(),
            notify_after_ticks: default_notify_after_ticks(),
            quiet_period_secs: default_quiet_period_secs(),
            remote_start_max_tries: default_remote_start_max_tries(),
            remote_start_cooldown_secs: default_remote_start_cooldown_secs(),
        }
    }
}

impl InactivityConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn inactive_after(&self) -> time::Duration {
        time::Duration::seconds(i64::try_from(self.inactive_after_secs).unwrap_or(i64::MAX))
    }

    pub fn quiet_period(&self) -> time::Duration {
        time::Duration::seconds(i64::try_from(self.quiet_period_secs).unwrap_or(i64::MAX))
    }

    pub fn remote_start_cooldown(&self) -> Duration {
        Duration::from_secs(self.remote_start_cooldown_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.interval_secs == 0 {
            return Err("inactivity.interval_secs cannot be 0".to_string());
        }
        if self.notify_after_ticks == 0 {
            return Err("inactivity.notify_after_ticks cannot be 0".to_string());
        }
        Ok(())
    }
}

/// Command stream queues and correlation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandStreamConfig {
    /// Outbound messages buffered per node before new ones are dropped.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Waiters older than this are dropped by the sweeper.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

fn default_queue_capacity() -> usize {
    64
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_stale_after_secs() -> u64 {
    3600
}

impl Default for CommandStreamConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            request_timeout_secs: default_request_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

impl CommandStreamConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.queue_capacity == 0 {
            return Err("command_stream.queue_capacity cannot be 0".to_string());
        }
        if self.sweep_interval_secs == 0 {
            return Err("command_stream.sweep_interval_secs cannot be 0".to_string());
        }
        Ok(())
    }
}

/// How this instance decides whether it runs the cluster-wide loops.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LeaderConfig {
    /// Fixed role, for single-instance deployments.
    Static {
        #[serde(default = "default_true")]
        is_primary: bool,
    },
    /// Lease row in the metadata store, renewed on every check.
    Lease {
        /// Defaults to a random id per process.
        instance_id: Option<String>,
        #[serde(default = "default_lease_ttl_secs")]
        ttl_secs: u64,
    },
}

fn default_lease_ttl_secs() -> u64 {
    30
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self::Static { is_primary: true }
    }
}

impl LeaderConfig {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            LeaderConfig::Lease { ttl_secs: 0, .. } => {
                Err("leader.ttl_secs cannot be 0".to_string())
            }
            _ => Ok(()),
        }
    }
}

/// Complete control plane configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    /// Required.
    pub admin: AdminConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub inactivity: InactivityConfig,
    #[serde(default)]
    pub command_stream: CommandStreamConfig,
    #[serde(default)]
    pub leader: LeaderConfig,
}

impl AppConfig {
    /// **For testing only.** SQLite defaults and the test admin token.
    pub fn for_testing() -> Self {
        Self {
            server: ServerConfig::default(),
            metadata: MetadataConfig::default(),
            admin: AdminConfig::for_testing(),
            sync: SyncConfig::default(),
            tasks: TasksConfig::default(),
            health_check: HealthCheckConfig::default(),
            inactivity: InactivityConfig::default(),
            command_stream: CommandStreamConfig::default(),
            leader: LeaderConfig::default(),
        }
    }

    /// Validate every section, returning the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        self.metadata.validate()?;
        self.sync.validate()?;
        self.tasks.validate()?;
        self.health_check.validate()?;
        self.inactivity.validate()?;
        self.command_stream.validate()?;
        self.leader.validate()?;
        Ok(())
    }
}
