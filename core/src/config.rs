//! Mesh configuration
//!
//! One serde document with a section per component. Every field has a
//! default, so a partial JSON file only overrides what it names.

use crate::message::MessageType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Invalid(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Exact LRU cache capacity
    pub lru_capacity: usize,
    /// Bloom filter design capacity
    pub bloom_capacity: usize,
    /// Bloom filter target false-positive rate
    pub bloom_fp_rate: f64,
    /// Entries older than this are swept regardless of capacity
    pub retention_ms: u64,
    /// Persist the bloom filter alongside the LRU snapshot
    pub persist_bloom: bool,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            lru_capacity: 5_000,
            bloom_capacity: 10_000,
            bloom_fp_rate: 0.01,
            retention_ms: 24 * 60 * 60 * 1000,
            persist_bloom: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_entries: usize,
    /// Failed attempts after which an entry is dropped
    pub max_attempts: u32,
    /// Linear backoff step: next retry = now + attempts * step
    pub retry_backoff_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_entries: 200,
            max_attempts: 3,
            retry_backoff_ms: 5_000,
        }
    }
}

/// Token bucket parameters for one message type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    pub capacity: u32,
    pub refill_per_minute: f64,
}

impl RateLimit {
    pub fn per_minute(n: u32) -> Self {
        Self {
            capacity: n,
            refill_per_minute: n as f64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Types without an entry are not rate-limited
    pub limits: BTreeMap<MessageType, RateLimit>,
    /// At or below this battery level only emergency types may send
    pub battery_threshold_percent: u8,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        let limits = [
            (MessageType::Help, RateLimit::per_minute(1)),
            (MessageType::Chat, RateLimit::per_minute(10)),
            (MessageType::Position, RateLimit::per_minute(2)),
            (MessageType::Safe, RateLimit::per_minute(2)),
            (MessageType::Resource, RateLimit::per_minute(4)),
            (MessageType::Ping, RateLimit::per_minute(6)),
            (MessageType::SessionInit, RateLimit::per_minute(4)),
        ]
        .into_iter()
        .collect();

        Self {
            limits,
            battery_threshold_percent: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub base_interval_ms: u64,
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    /// Peer count above which the interval starts shrinking
    pub peer_density_threshold: usize,
    /// Largest divisor applied for peer density
    pub max_density_speedup: f64,
    pub battery_warning_percent: u8,
    pub ultra_low_percent: u8,
    pub critical_percent: u8,
    pub ultra_low_interval_ms: u64,
    pub critical_interval_ms: u64,
    /// TTL cap applied to lean frames
    pub lean_ttl_cap: u8,
    pub burst_window_ms: u64,
    /// Tick interval while a burst window is open
    pub burst_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            base_interval_ms: 30_000,
            min_interval_ms: 10_000,
            max_interval_ms: 5 * 60_000,
            peer_density_threshold: 5,
            max_density_speedup: 3.0,
            battery_warning_percent: 20,
            ultra_low_percent: 8,
            critical_percent: 5,
            ultra_low_interval_ms: 8 * 60_000,
            critical_interval_ms: 15 * 60_000,
            lean_ttl_cap: 4,
            burst_window_ms: 4_000,
            burst_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// How far ahead of the receiving chain a counter may jump
    pub max_skip: u32,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self { max_skip: 32 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Upper bound on a single transport send/broadcast
    pub transport_timeout_ms: u64,
    /// Tolerated future drift on envelope timestamps from other devices
    pub clock_skew_allowance_ms: u64,
    /// Persist state every N ticks (0 disables periodic persistence)
    pub persist_every_ticks: u32,
    /// Advertise and scan once per tick
    pub beacon_enabled: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            transport_timeout_ms: 5_000,
            clock_skew_allowance_ms: 10 * 60_000,
            persist_every_ticks: 1,
            beacon_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub dedup: DedupConfig,
    pub queue: QueueConfig,
    pub admission: AdmissionConfig,
    pub scheduler: SchedulerConfig,
    pub crypto: CryptoConfig,
    pub router: RouterConfig,
}

impl MeshConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.dedup;
        if d.lru_capacity == 0 || d.bloom_capacity == 0 {
            return Err(invalid("dedup capacities must be at least 1"));
        }
        if !(d.bloom_fp_rate > 0.0 && d.bloom_fp_rate < 1.0) {
            return Err(invalid("dedup.bloom_fp_rate must be in (0, 1)"));
        }

        let q = &self.queue;
        if q.max_entries == 0 {
            return Err(invalid("queue.max_entries must be at least 1"));
        }
        if q.max_attempts == 0 {
            return Err(invalid("queue.max_attempts must be at least 1"));
        }

        for (message_type, limit) in &self.admission.limits {
            if limit.capacity == 0 || !(limit.refill_per_minute > 0.0) {
                return Err(invalid(format!(
                    "admission limit for {} must have positive capacity and refill",
                    message_type
                )));
            }
        }
        if self.admission.battery_threshold_percent > 100 {
            return Err(invalid("admission.battery_threshold_percent cannot exceed 100"));
        }

        let s = &self.scheduler;
        if !(s.min_interval_ms <= s.base_interval_ms && s.base_interval_ms <= s.max_interval_ms) {
            return Err(invalid(
                "scheduler intervals must satisfy min <= base <= max",
            ));
        }
        if s.min_interval_ms == 0 || s.burst_interval_ms == 0 {
            return Err(invalid("scheduler intervals must be non-zero"));
        }
        if !(s.critical_percent < s.ultra_low_percent
            && s.ultra_low_percent < s.battery_warning_percent
            && s.battery_warning_percent <= 100)
        {
            return Err(invalid(
                "battery thresholds must satisfy critical < ultra_low < warning <= 100",
            ));
        }
        if s.max_density_speedup < 1.0 {
            return Err(invalid("scheduler.max_density_speedup must be >= 1"));
        }
        if s.lean_ttl_cap > crate::message::MAX_TTL {
            return Err(invalid("scheduler.lean_ttl_cap exceeds the maximum TTL"));
        }

        if self.router.transport_timeout_ms == 0 {
            return Err(invalid("router.transport_timeout_ms must be non-zero"));
        }

        Ok(())
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: MeshConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        self.validate()?;
        std::fs::write(path, self.to_json_string()?)?;
        Ok(())
    }
}
