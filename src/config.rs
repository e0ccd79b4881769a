//! Layered configuration
//!
//! Compiled defaults, overridden by an optional TOML file, overridden by
//! `STREAMER_*` environment variables — later sources win. Grounded on
//! `hooteconf`'s `load_with_sources_from` pipeline, scaled down to
//! Streamer's flat parameter set.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::StreamerError;

/// Every tunable governing routing, retries, progress batching, and circuit breaking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub async_threshold_secs: u64,
    pub connection_ttl_secs: u64,
    pub request_ttl_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_cap_ms: u64,
    pub progress_batch_interval_ms: u64,
    pub progress_max_batch: usize,
    pub progress_flush_threshold: u8,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_window_secs: u64,
    pub circuit_breaker_cooldown_secs: u64,
    pub executor_pool_size: usize,
    pub notifier_broadcast_parallelism: usize,
    pub allowed_tenants: Option<HashSet<String>>,
    pub router_safety_margin_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            async_threshold_secs: 5,
            connection_ttl_secs: 24 * 3600,
            request_ttl_secs: 7 * 24 * 3600,
            max_retries: 3,
            retry_backoff_base_ms: 2_000,
            retry_backoff_cap_ms: 30_000,
            progress_batch_interval_ms: 200,
            progress_max_batch: 5,
            progress_flush_threshold: 90,
            circuit_breaker_threshold: 5,
            circuit_breaker_window_secs: 30,
            circuit_breaker_cooldown_secs: 30,
            executor_pool_size: 32,
            notifier_broadcast_parallelism: 10,
            allowed_tenants: None,
            router_safety_margin_secs: 2,
        }
    }
}

impl Config {
    pub fn async_threshold(&self) -> Duration {
        Duration::from_secs(self.async_threshold_secs)
    }

    pub fn connection_ttl(&self) -> Duration {
        Duration::from_secs(self.connection_ttl_secs)
    }

    pub fn request_ttl(&self) -> Duration {
        Duration::from_secs(self.request_ttl_secs)
    }

    pub fn retry_backoff_base(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_base_ms)
    }

    pub fn retry_backoff_cap(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_cap_ms)
    }

    pub fn progress_batch_interval(&self) -> Duration {
        Duration::from_millis(self.progress_batch_interval_ms)
    }

    pub fn circuit_breaker_window(&self) -> Duration {
        Duration::from_secs(self.circuit_breaker_window_secs)
    }

    pub fn circuit_breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.circuit_breaker_cooldown_secs)
    }

    pub fn router_safety_margin(&self) -> Duration {
        Duration::from_secs(self.router_safety_margin_secs)
    }

    pub fn tenant_allowed(&self, tenant_id: &str) -> bool {
        match &self.allowed_tenants {
            None => true,
            Some(set) => set.contains(tenant_id),
        }
    }

    /// Load defaults, then merge a TOML file if present, then environment overrides.
    pub fn load_with_sources(file: Option<&Path>) -> Result<Self, StreamerError> {
        let mut cfg = Self::default();

        if let Some(path) = file {
            if path.exists() {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    StreamerError::internal(format!("reading config {}: {e}", path.display()))
                })?;
                let file_cfg: Self = toml::from_str(&text).map_err(|e| {
                    StreamerError::internal(format!("parsing config {}: {e}", path.display()))
                })?;
                cfg = merge(cfg, file_cfg);
            }
        }

        cfg = apply_env_overrides(cfg)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject nonsensical combinations at construction time.
    pub fn validate(&self) -> Result<(), StreamerError> {
        if self.retry_backoff_cap_ms < self.retry_backoff_base_ms {
            return Err(StreamerError::validation(
                "retry_backoff_cap_ms must be >= retry_backoff_base_ms",
            ));
        }
        if self.progress_flush_threshold > 100 {
            return Err(StreamerError::validation(
                "progress_flush_threshold must be <= 100",
            ));
        }
        if self.executor_pool_size == 0 {
            return Err(StreamerError::validation(
                "executor_pool_size must be > 0",
            ));
        }
        if self.notifier_broadcast_parallelism == 0 {
            return Err(StreamerError::validation(
                "notifier_broadcast_parallelism must be > 0",
            ));
        }
        Ok(())
    }
}

/// Field-by-field merge: a value differing from `Default` in `overlay` wins.
/// Mirrors `hooteconf::loader::merge_configs`'s sentinel-compare-against-Default strategy.
fn merge(base: Config, overlay: Config) -> Config {
    let default = Config::default();
    macro_rules! pick {
        ($field:ident) => {
            if overlay.$field != default.$field {
                overlay.$field
            } else {
                base.$field
            }
        };
    }
    Config {
        async_threshold_secs: pick!(async_threshold_secs),
        connection_ttl_secs: pick!(connection_ttl_secs),
        request_ttl_secs: pick!(request_ttl_secs),
        max_retries: pick!(max_retries),
        retry_backoff_base_ms: pick!(retry_backoff_base_ms),
        retry_backoff_cap_ms: pick!(retry_backoff_cap_ms),
        progress_batch_interval_ms: pick!(progress_batch_interval_ms),
        progress_max_batch: pick!(progress_max_batch),
        progress_flush_threshold: pick!(progress_flush_threshold),
        circuit_breaker_threshold: pick!(circuit_breaker_threshold),
        circuit_breaker_window_secs: pick!(circuit_breaker_window_secs),
        circuit_breaker_cooldown_secs: pick!(circuit_breaker_cooldown_secs),
        executor_pool_size: pick!(executor_pool_size),
        notifier_broadcast_parallelism: pick!(notifier_broadcast_parallelism),
        allowed_tenants: if overlay.allowed_tenants.is_some() {
            overlay.allowed_tenants
        } else {
            base.allowed_tenants
        },
        router_safety_margin_secs: pick!(router_safety_margin_secs),
    }
}

fn apply_env_overrides(mut cfg: Config) -> Result<Config, StreamerError> {
    macro_rules! env_u64 {
        ($name:literal, $field:ident) => {
            if let Ok(v) = std::env::var(concat!("STREAMER_", $name)) {
                cfg.$field = v.parse().map_err(|_| {
                    StreamerError::validation(concat!(
                        "invalid STREAMER_",
                        $name,
                        ": expected an integer"
                    ))
                })?;
            }
        };
    }
    env_u64!("ASYNC_THRESHOLD_SECS", async_threshold_secs);
    env_u64!("CONNECTION_TTL_SECS", connection_ttl_secs);
    env_u64!("REQUEST_TTL_SECS", request_ttl_secs);
    env_u64!("MAX_RETRIES", max_retries);
    env_u64!("RETRY_BACKOFF_BASE_MS", retry_backoff_base_ms);
    env_u64!("RETRY_BACKOFF_CAP_MS", retry_backoff_cap_ms);
    env_u64!("PROGRESS_BATCH_INTERVAL_MS", progress_batch_interval_ms);
    env_u64!("PROGRESS_MAX_BATCH", progress_max_batch);
    env_u64!("CIRCUIT_BREAKER_THRESHOLD", circuit_breaker_threshold);
    env_u64!("CIRCUIT_BREAKER_WINDOW_SECS", circuit_breaker_window_secs);
    env_u64!(
        "CIRCUIT_BREAKER_COOLDOWN_SECS",
        circuit_breaker_cooldown_secs
    );
    env_u64!("EXECUTOR_POOL_SIZE", executor_pool_size);
    env_u64!(
        "NOTIFIER_BROADCAST_PARALLELISM",
        notifier_broadcast_parallelism
    );

    if let Ok(v) = std::env::var("STREAMER_PROGRESS_FLUSH_THRESHOLD") {
        cfg.progress_flush_threshold = v
            .parse()
            .map_err(|_| StreamerError::validation("invalid STREAMER_PROGRESS_FLUSH_THRESHOLD"))?;
    }
    if let Ok(v) = std::env::var("STREAMER_ALLOWED_TENANTS") {
        cfg.allowed_tenants = Some(v.split(',').map(|s| s.trim().to_string()).collect());
    }

    Ok(cfg)
}
