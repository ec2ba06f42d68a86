//! Configuration types for atomsync
//!
//! This module defines the configuration structures used by the engine,
//! the store and the remote client. Every field has a default so a partial
//! TOML file is enough.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for atomsync
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Local replica configuration
    #[serde(default)]
    pub store: StoreConfig,
    /// Remote source of truth
    #[serde(default)]
    pub remote: RemoteConfig,
    /// Missing-atom recovery
    #[serde(default)]
    pub hammer: HammerConfig,
    /// Lane scheduling
    #[serde(default)]
    pub queue: QueueConfig,
    /// Single-writer lease
    #[serde(default)]
    pub lease: LeaseConfig,
    /// Full resynchronization
    #[serde(default)]
    pub cold_start: ColdStartConfig,
}

/// Local replica configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path of the redb database file
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("./atomsync-data/replica.redb")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

/// Remote API configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Base URL of the API (e.g., "http://localhost:8080/api")
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_base_url() -> String {
    "http://localhost:8080/api".to_string()
}

const fn default_timeout_ms() -> u64 {
    30_000
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Hammer (backfill) retry configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HammerConfig {
    /// Retries after the first attempt for 5xx responses
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay; attempt `n` waits `base * n^2`
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound on a single backoff delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

const fn default_max_retries() -> u32 {
    5
}

const fn default_base_delay_ms() -> u64 {
    1000
}

const fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for HammerConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl HammerConfig {
    /// Delay before retry number `attempt` (1-based), capped at `max_delay_ms`
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = u64::from(attempt).saturating_mul(u64::from(attempt));
        let delay = self.base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

/// Lane scheduling configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Independent change-set pairs processed at the same time
    #[serde(default = "default_max_concurrent_pairs")]
    pub max_concurrent_pairs: usize,
}

const fn default_max_concurrent_pairs() -> usize {
    4
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_pairs: default_max_concurrent_pairs(),
        }
    }
}

/// Writer lease configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// Lease lifetime without renewal
    #[serde(default = "default_lease_ttl_ms")]
    pub ttl_ms: u64,
    /// Renewal period; must be well under `ttl_ms`
    #[serde(default = "default_renew_interval_ms")]
    pub renew_interval_ms: u64,
}

const fn default_lease_ttl_ms() -> u64 {
    10_000
}

const fn default_renew_interval_ms() -> u64 {
    3_000
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_lease_ttl_ms(),
            renew_interval_ms: default_renew_interval_ms(),
        }
    }
}

/// Cold start configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ColdStartConfig {
    /// Restarts after a cold start fails with an unavailable remote
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// Non-default change-sets cold started at the same time
    #[serde(default = "default_open_change_set_concurrency")]
    pub open_change_set_concurrency: usize,
}

const fn default_max_restarts() -> u32 {
    1
}

const fn default_open_change_set_concurrency() -> usize {
    1
}

impl Default for ColdStartConfig {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            open_change_set_concurrency: default_open_change_set_concurrency(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.hammer.max_retries, 5);
        assert_eq!(config.queue.max_concurrent_pairs, 4);
        assert_eq!(config.remote.timeout_ms, 30_000);
    }

    #[test]
    fn test_backoff_is_quadratic_and_capped() {
        let hammer = HammerConfig::default();
        assert_eq!(hammer.backoff(1), Duration::from_secs(1));
        assert_eq!(hammer.backoff(3), Duration::from_secs(9));
        assert_eq!(hammer.backoff(100), Duration::from_secs(60));
    }

    #[test]
    fn test_partial_toml() {
        let config: SyncConfig = toml::from_str(
            r#"
            [hammer]
            max_retries = 2

            [remote]
            base_url = "https://example.test/api"
            "#,
        )
        .unwrap();
        assert_eq!(config.hammer.max_retries, 2);
        assert_eq!(config.hammer.base_delay_ms, 1000);
        assert_eq!(config.remote.base_url, "https://example.test/api");
        assert_eq!(config.lease.ttl_ms, 10_000);
    }
}
