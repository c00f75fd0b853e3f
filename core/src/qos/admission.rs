//! Admission control: may this send proceed at all?
//!
//! Two gates, checked in order:
//!
//! 1. **Device state.** At or below the battery threshold, or while the
//!    device runs hot, the mesh is inactive for everything except the
//!    emergency classes. Those are never blocked by power policy, only
//!    rate-limited.
//! 2. **Token buckets.** One bucket per rate-limited type, refilled
//!    continuously by elapsed time × rate and capped at capacity.
//!
//! All times are local milliseconds from the injected clock.

use crate::config::{AdmissionConfig, RateLimit};
use crate::message::MessageType;
use crate::scheduler::device::DeviceState;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("{message_type} rate limited, next token in {retry_after:?}")]
    RateLimited {
        message_type: MessageType,
        retry_after: Duration,
    },
    #[error("Mesh inactive for {message_type}: {reason}")]
    MeshInactive {
        message_type: MessageType,
        reason: String,
    },
}

/// Observable state of one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateBucket {
    pub tokens: f64,
    pub capacity: u32,
    pub last_refill: u64,
    pub refill_rate_per_minute: f64,
}

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    /// Tokens per millisecond
    rate: f64,
    last_refill: u64,
}

impl TokenBucket {
    fn new(limit: RateLimit, now: u64) -> Self {
        Self {
            tokens: limit.capacity as f64,
            capacity: limit.capacity as f64,
            rate: limit.refill_per_minute / 60_000.0,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: u64) {
        // A clock that stepped backwards refills nothing
        let elapsed = now.saturating_sub(self.last_refill) as f64;
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = self.last_refill.max(now);
    }

    fn has_token(&mut self, now: u64) -> bool {
        self.refill(now);
        self.tokens >= 1.0
    }

    fn try_consume(&mut self, now: u64) -> bool {
        if self.has_token(now) {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn time_until_next(&mut self, now: u64) -> Duration {
        self.refill(now);
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        let ms = ((1.0 - self.tokens) / self.rate).ceil().max(1.0);
        Duration::from_millis(ms as u64)
    }

    fn view(&self) -> RateBucket {
        RateBucket {
            tokens: self.tokens,
            capacity: self.capacity as u32,
            last_refill: self.last_refill,
            refill_rate_per_minute: self.rate * 60_000.0,
        }
    }
}

pub struct AdmissionController {
    config: AdmissionConfig,
    buckets: HashMap<MessageType, TokenBucket>,
    device: DeviceState,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig, now: u64) -> Self {
        let buckets = config
            .limits
            .iter()
            .map(|(t, limit)| (*t, TokenBucket::new(*limit, now)))
            .collect();
        Self {
            config,
            buckets,
            device: DeviceState::default(),
        }
    }

    pub fn update_device_state(&mut self, device: DeviceState) {
        self.device = device;
    }

    pub fn device_state(&self) -> DeviceState {
        self.device
    }

    /// False while the battery is at or below the threshold or the device
    /// runs hot.
    pub fn should_activate_mesh(&self) -> bool {
        self.inactive_reason().is_none()
    }

    fn inactive_reason(&self) -> Option<String> {
        if self.device.battery_percent <= self.config.battery_threshold_percent {
            Some(format!(
                "battery {}% at or below {}%",
                self.device.battery_percent, self.config.battery_threshold_percent
            ))
        } else if self.device.thermal.is_high() {
            Some(format!("thermal state {}", self.device.thermal))
        } else {
            None
        }
    }

    fn device_gate(&self, message_type: MessageType) -> Result<(), AdmissionError> {
        if message_type.is_emergency() {
            return Ok(());
        }
        match self.inactive_reason() {
            Some(reason) => Err(AdmissionError::MeshInactive {
                message_type,
                reason,
            }),
            None => Ok(()),
        }
    }

    /// Would a send of this type be admitted right now? Consumes nothing.
    pub fn check(&mut self, message_type: MessageType, now: u64) -> Result<(), AdmissionError> {
        self.device_gate(message_type)?;
        if let Some(bucket) = self.buckets.get_mut(&message_type) {
            if !bucket.has_token(now) {
                let retry_after = bucket.time_until_next(now);
                debug!(%message_type, ?retry_after, "admission denied by rate limit");
                return Err(AdmissionError::RateLimited {
                    message_type,
                    retry_after,
                });
            }
        }
        Ok(())
    }

    pub fn can_send(&mut self, message_type: MessageType, now: u64) -> bool {
        self.check(message_type, now).is_ok()
    }

    /// Take one token. Unlimited types always succeed.
    pub fn consume(&mut self, message_type: MessageType, now: u64) -> bool {
        match self.buckets.get_mut(&message_type) {
            Some(bucket) => bucket.try_consume(now),
            None => true,
        }
    }

    pub fn time_until_next_token(&mut self, message_type: MessageType, now: u64) -> Duration {
        self.buckets
            .get_mut(&message_type)
            .map_or(Duration::ZERO, |b| b.time_until_next(now))
    }

    pub fn bucket(&self, message_type: MessageType) -> Option<RateBucket> {
        self.buckets.get(&message_type).map(TokenBucket::view)
    }
}
