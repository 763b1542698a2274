//! Core configuration, loaded from the environment with fallback defaults.
//!
//! Grounded on the teacher's `nexo::config` (one sub-struct per subsystem,
//! each with its own `fn load()` reading `get_env`). Unlike the teacher's
//! `Config::global()` `OnceLock` singleton, `Config` here is constructed
//! explicitly and threaded into `Core::new` — Design Notes calls for a
//! fresh, independently-configured `Core` per test.

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub queue: QueueDefaults,
    pub retry: RetryDefaults,
    pub breaker: BreakerDefaults,
    pub group: GroupDefaults,
    pub routing: RoutingConfig,
    pub secure: SecureStoreConfig,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        Self {
            queue: QueueDefaults::load(),
            retry: RetryDefaults::load(),
            breaker: BreakerDefaults::load(),
            group: GroupDefaults::load(),
            routing: RoutingConfig::load(),
            secure: SecureStoreConfig::load(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue: QueueDefaults::default(),
            retry: RetryDefaults::default(),
            breaker: BreakerDefaults::default(),
            group: GroupDefaults::default(),
            routing: RoutingConfig::default(),
            secure: SecureStoreConfig::default(),
        }
    }
}

// ---------- QUEUE ----------

#[derive(Debug, Clone)]
pub struct QueueDefaults {
    pub max_size: usize,
    pub worker_count: usize,
    pub ttl_ms: u64,
    pub enqueue_wait: Duration,
    pub stop_grace: Duration,
}

impl QueueDefaults {
    fn load() -> Self {
        Self {
            max_size: get_env("QUEUE_DEFAULT_MAX_SIZE", "0"),
            worker_count: get_env("QUEUE_DEFAULT_WORKER_COUNT", "4"),
            ttl_ms: get_env("QUEUE_DEFAULT_TTL_MS", "0"),
            enqueue_wait: Duration::from_millis(get_env("QUEUE_ENQUEUE_WAIT_MS", "5000")),
            stop_grace: Duration::from_millis(get_env("QUEUE_STOP_GRACE_MS", "10000")),
        }
    }
}

impl Default for QueueDefaults {
    fn default() -> Self {
        Self {
            max_size: 0,
            worker_count: 4,
            ttl_ms: 0,
            enqueue_wait: Duration::from_secs(5),
            stop_grace: Duration::from_secs(10),
        }
    }
}

// ---------- RETRY ----------

#[derive(Debug, Clone)]
pub struct RetryDefaults {
    pub enabled: bool,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_retries: u32,
}

impl RetryDefaults {
    fn load() -> Self {
        Self {
            enabled: get_env("RETRY_ENABLED", "false"),
            initial_delay: Duration::from_millis(get_env("RETRY_INITIAL_DELAY_MS", "1000")),
            max_delay: Duration::from_millis(get_env("RETRY_MAX_DELAY_MS", "30000")),
            factor: get_env("RETRY_FACTOR", "2.0"),
            max_retries: get_env("RETRY_MAX_RETRIES", "5"),
        }
    }
}

impl Default for RetryDefaults {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
            max_retries: 5,
        }
    }
}

// ---------- CIRCUIT BREAKER ----------

#[derive(Debug, Clone)]
pub struct BreakerDefaults {
    pub enabled: bool,
    pub error_ratio: f64,
    pub min_requests: u64,
    pub open_timeout: Duration,
    pub success_threshold: u64,
    pub half_open_probes: u64,
}

impl BreakerDefaults {
    fn load() -> Self {
        Self {
            enabled: get_env("BREAKER_ENABLED", "false"),
            error_ratio: get_env("BREAKER_ERROR_RATIO", "0.5"),
            min_requests: get_env("BREAKER_MIN_REQUESTS", "10"),
            open_timeout: Duration::from_millis(get_env("BREAKER_OPEN_TIMEOUT_MS", "30000")),
            success_threshold: get_env("BREAKER_SUCCESS_THRESHOLD", "3"),
            half_open_probes: get_env("BREAKER_HALF_OPEN_PROBES", "5"),
        }
    }
}

impl Default for BreakerDefaults {
    fn default() -> Self {
        Self {
            enabled: false,
            error_ratio: 0.5,
            min_requests: 10,
            open_timeout: Duration::from_secs(30),
            success_threshold: 3,
            half_open_probes: 5,
        }
    }
}

// ---------- CONSUMER GROUPS ----------

#[derive(Debug, Clone)]
pub struct GroupDefaults {
    pub ttl: Duration,
    pub sweep_interval: Duration,
}

impl GroupDefaults {
    fn load() -> Self {
        Self {
            ttl: Duration::from_millis(get_env("GROUP_DEFAULT_TTL_MS", "3600000")),
            sweep_interval: Duration::from_millis(get_env("GROUP_SWEEP_INTERVAL_MS", "30000")),
        }
    }
}

impl Default for GroupDefaults {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

// ---------- ROUTING ----------

#[derive(Debug, Clone)]
pub struct RoutingConfig {
    pub max_hops: usize,
}

impl RoutingConfig {
    fn load() -> Self {
        Self {
            max_hops: get_env("ROUTING_MAX_HOPS", "64"),
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self { max_hops: 64 }
    }
}

// ---------- SECURE STORE ----------

#[derive(Debug, Clone)]
pub struct SecureStoreConfig {
    pub data_dir: String,
    pub last_used_debounce: Duration,
    pub watcher_debounce: Duration,
    pub argon2_memory_kib: u32,
    pub argon2_iterations: u32,
    pub argon2_parallelism: u32,
}

impl SecureStoreConfig {
    fn load() -> Self {
        Self {
            data_dir: get_env_str("GORTMS_DATA_DIR", "./data"),
            last_used_debounce: Duration::from_millis(get_env("SECURE_LAST_USED_DEBOUNCE_MS", "1000")),
            watcher_debounce: Duration::from_millis(get_env("SECURE_WATCHER_DEBOUNCE_MS", "2000")),
            argon2_memory_kib: get_env("ARGON2_MEMORY_KIB", "65536"),
            argon2_iterations: get_env("ARGON2_ITERATIONS", "1"),
            argon2_parallelism: get_env("ARGON2_PARALLELISM", "4"),
        }
    }
}

impl Default for SecureStoreConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            last_used_debounce: Duration::from_secs(1),
            watcher_debounce: Duration::from_secs(2),
            argon2_memory_kib: 65536,
            argon2_iterations: 1,
            argon2_parallelism: 4,
        }
    }
}

// ---------- PRIVATE HELPERS ----------

fn get_env<T: std::str::FromStr>(key: &str, default: &str) -> T {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .unwrap_or_else(|_| panic!("config error: {key} must be valid"))
}

fn get_env_str(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
