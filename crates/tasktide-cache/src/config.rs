use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::codec::Codec;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheSettings {
    /// Redis configuration (remote tier and distributed job queues)
    #[serde(default)]
    pub redis: RedisConfig,
    /// Local tier configuration
    #[serde(default)]
    pub local_cache: LocalCacheConfig,
    /// Circuit breaker guarding remote tier calls
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    /// Cache warming configuration
    #[serde(default)]
    pub warming: WarmingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl CacheSettings {
    pub fn validate(&self) -> Result<(), String> {
        // Redis validations
        if self.redis.enabled && self.redis.url.trim().is_empty() {
            return Err("redis.enabled=true requires redis.url".into());
        }
        if self.redis.pool_size == 0 {
            return Err("redis.pool_size must be > 0".into());
        }
        if self.redis.operation_timeout_ms == 0
            || self.redis.pattern_timeout_ms == 0
            || self.redis.ping_timeout_ms == 0
        {
            return Err("redis timeouts must be > 0".into());
        }
        if self.redis.key_prefix.contains('*') {
            return Err("redis.key_prefix must not contain '*'".into());
        }
        if self.redis.key_prefix == self.warming.queue_prefix {
            return Err("redis.key_prefix and warming.queue_prefix must differ".into());
        }
        // Local tier
        if self.local_cache.backfill_ttl_secs == 0 {
            return Err("local_cache.backfill_ttl_secs must be > 0".into());
        }
        // Breaker
        if self.circuit_breaker.max_failures == 0 {
            return Err("circuit_breaker.max_failures must be > 0".into());
        }
        if self.circuit_breaker.half_open_max_calls == 0 {
            return Err("circuit_breaker.half_open_max_calls must be > 0".into());
        }
        // Warming
        let w = &self.warming;
        if w.batch_size == 0 {
            return Err("warming.batch_size must be > 0".into());
        }
        if w.concurrent_jobs == 0 {
            return Err("warming.concurrent_jobs must be > 0".into());
        }
        if w.warmup_interval_secs == 0 {
            return Err("warming.warmup_interval_secs must be > 0".into());
        }
        if w.max_tries == 0 {
            return Err("warming.max_tries must be > 0".into());
        }
        if w.poll_interval_ms == 0 || w.scheduled_check_interval_ms == 0 {
            return Err("warming poll intervals must be > 0".into());
        }
        if w.queue_prefix.trim().is_empty() {
            return Err("warming.queue_prefix must not be empty".into());
        }
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Enable Redis (gracefully degrades to local-only without it)
    #[serde(default = "default_redis_enabled")]
    pub enabled: bool,

    /// Redis connection URL (e.g., "redis://localhost:6379")
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Connection acquire timeout in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,

    /// Per-command timeout for get/set/delete/exists
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    /// Timeout for a whole SCAN + DEL pattern invalidation
    #[serde(default = "default_pattern_timeout_ms")]
    pub pattern_timeout_ms: u64,

    /// Timeout for liveness probes
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,

    /// Namespace prepended to every cache key stored in Redis
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_redis_enabled() -> bool {
    false
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_redis_pool_size() -> usize {
    10
}

fn default_redis_timeout_ms() -> u64 {
    5000
}

fn default_operation_timeout_ms() -> u64 {
    3000
}

fn default_pattern_timeout_ms() -> u64 {
    10_000
}

fn default_ping_timeout_ms() -> u64 {
    2000
}

fn default_key_prefix() -> String {
    "tasktide:cache:".to_string()
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: default_redis_enabled(),
            url: default_redis_url(),
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
            operation_timeout_ms: default_operation_timeout_ms(),
            pattern_timeout_ms: default_pattern_timeout_ms(),
            ping_timeout_ms: default_ping_timeout_ms(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl RedisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn pattern_timeout(&self) -> Duration {
        Duration::from_millis(self.pattern_timeout_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}

/// Local (L1) tier configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalCacheConfig {
    /// TTL given to entries backfilled from the remote tier
    #[serde(default = "default_backfill_ttl_secs")]
    pub backfill_ttl_secs: u64,

    /// How often expired local entries are swept (0 disables the sweeper)
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Value encoding for typed reads and writes
    #[serde(default)]
    pub codec: Codec,
}

fn default_backfill_ttl_secs() -> u64 {
    300
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for LocalCacheConfig {
    fn default() -> Self {
        Self {
            backfill_ttl_secs: default_backfill_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            codec: Codec::default(),
        }
    }
}

impl LocalCacheConfig {
    pub fn backfill_ttl(&self) -> Duration {
        Duration::from_secs(self.backfill_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}

/// Which warming engine the manager runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarmingMode {
    /// Probe the job queue backend at startup and pick one of the others.
    #[default]
    Auto,
    /// In-process priority queue, worker pool and scheduler.
    Legacy,
    /// Persisted distributed job queues.
    Integrated,
}

impl WarmingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WarmingMode::Auto => "auto",
            WarmingMode::Legacy => "legacy",
            WarmingMode::Integrated => "integrated",
        }
    }
}

impl std::fmt::Display for WarmingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cache warming configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmingConfig {
    #[serde(default)]
    pub mode: WarmingMode,

    /// Jobs per batch when no worker pool is used
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Worker count / batch concurrency
    #[serde(default = "default_concurrent_jobs")]
    pub concurrent_jobs: usize,

    /// Period of the full warm pass
    #[serde(default = "default_warmup_interval_secs")]
    pub warmup_interval_secs: u64,

    #[serde(default = "default_true")]
    pub use_worker_pool: bool,

    #[serde(default = "default_true")]
    pub use_scheduler: bool,

    /// How often deferred jobs are checked for due-ness
    #[serde(default = "default_scheduled_check_interval_ms")]
    pub scheduled_check_interval_ms: u64,

    /// Apply jobs directly when the distributed queue rejects them
    #[serde(default = "default_true")]
    pub local_fallback: bool,

    /// Attempts before a distributed job is dead-lettered
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,

    /// Base of the exponential retry backoff
    #[serde(default = "default_retry_base_delay_secs")]
    pub retry_base_delay_secs: u64,

    /// How often distributed workers poll for due jobs
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Per-job execution timeout for distributed workers
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,

    /// Key prefix for distributed queues
    #[serde(default = "default_queue_prefix")]
    pub queue_prefix: String,

    /// Maximum number of dead-letter entries retained
    #[serde(default = "default_dead_letter_capacity")]
    pub dead_letter_capacity: usize,

    /// Liveness probe timeout used by auto mode detection
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

fn default_batch_size() -> usize {
    10
}

fn default_concurrent_jobs() -> usize {
    3
}

fn default_warmup_interval_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_scheduled_check_interval_ms() -> u64 {
    1000
}

fn default_max_tries() -> u32 {
    3
}

fn default_retry_base_delay_secs() -> u64 {
    60
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_job_timeout_secs() -> u64 {
    30
}

fn default_queue_prefix() -> String {
    "tasktide:jobs".to_string()
}

fn default_dead_letter_capacity() -> usize {
    1000
}

fn default_probe_timeout_ms() -> u64 {
    2000
}

impl Default for WarmingConfig {
    fn default() -> Self {
        Self {
            mode: WarmingMode::default(),
            batch_size: default_batch_size(),
            concurrent_jobs: default_concurrent_jobs(),
            warmup_interval_secs: default_warmup_interval_secs(),
            use_worker_pool: true,
            use_scheduler: true,
            scheduled_check_interval_ms: default_scheduled_check_interval_ms(),
            local_fallback: true,
            max_tries: default_max_tries(),
            retry_base_delay_secs: default_retry_base_delay_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            job_timeout_secs: default_job_timeout_secs(),
            queue_prefix: default_queue_prefix(),
            dead_letter_capacity: default_dead_letter_capacity(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl WarmingConfig {
    pub fn warmup_interval(&self) -> Duration {
        Duration::from_secs(self.warmup_interval_secs)
    }

    pub fn scheduled_check_interval(&self) -> Duration {
        Duration::from_millis(self.scheduled_check_interval_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_secs(self.retry_base_delay_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

pub mod loader {
    use super::CacheSettings;
    use config::{Config, Environment, File};
    use std::path::{Path, PathBuf};

    pub fn load_config(path: Option<&str>) -> Result<CacheSettings, String> {
        let mut builder = Config::builder();
        match path {
            Some(p) => {
                let pathbuf = PathBuf::from(p);
                if pathbuf.exists() {
                    builder = builder.add_source(File::from(pathbuf));
                }
            }
            None => {
                let default_path = PathBuf::from("tasktide.toml");
                if default_path.exists() {
                    builder = builder.add_source(File::from(default_path));
                }
            }
        }
        // Environment variable overrides, e.g., TASKTIDE__WARMING__BATCH_SIZE=20
        builder = builder.add_source(
            Environment::with_prefix("TASKTIDE")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: CacheSettings = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }

    pub fn load_config_with_default_path<P: AsRef<Path>>(
        path: Option<P>,
    ) -> Result<CacheSettings, String> {
        let p = path
            .as_ref()
            .map(|p| p.as_ref().to_string_lossy().to_string());
        load_config(p.as_deref())
    }
}
