//! Adaptive broadcast scheduler
//!
//! Picks the tick interval from battery level and observed peer density, and
//! decides how outbound envelopes are shaped in the low-power modes:
//!
//! | Mode                | Trigger                   | Interval                  |
//! |---------------------|---------------------------|---------------------------|
//! | Normal              | otherwise                 | base, scaled by density   |
//! | BatteryConservative | battery < warning         | normal x2                 |
//! | UltraLowPower       | battery < ultra-low       | fixed (8 min), lean frame |
//! | Critical            | battery < critical        | fixed (15 min), lean frame, HELP bumped |
//!
//! The mode is only recomputed by [`AdaptiveScheduler::refresh`], which the
//! router calls at the start of a tick, so a tick in progress always runs
//! under one mode.

pub mod burst;
pub mod device;

pub use burst::{BurstController, DutyCycle};
pub use device::{DeviceMonitor, DeviceState, ManualDeviceMonitor, ThermalState};

use crate::config::SchedulerConfig;
use crate::message::{Envelope, MessageType};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PowerMode {
    #[default]
    Normal,
    BatteryConservative,
    UltraLowPower,
    Critical,
}

impl PowerMode {
    /// Lean frames: coarse location, no note, capped TTL.
    pub fn uses_lean_frame(self) -> bool {
        matches!(self, PowerMode::UltraLowPower | PowerMode::Critical)
    }
}

impl fmt::Display for PowerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerMode::Normal => write!(f, "normal"),
            PowerMode::BatteryConservative => write!(f, "battery-conservative"),
            PowerMode::UltraLowPower => write!(f, "ultra-low-power"),
            PowerMode::Critical => write!(f, "critical"),
        }
    }
}

/// Snapshot returned by the application API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub mode: PowerMode,
    pub interval_ms: u64,
    pub battery_percent: u8,
    pub peer_count: usize,
    pub burst_active: bool,
    pub lean_frame: bool,
}

pub struct AdaptiveScheduler {
    config: SchedulerConfig,
    mode: PowerMode,
    device: DeviceState,
    peer_count: usize,
    burst: BurstController,
}

impl AdaptiveScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let burst = BurstController::new(config.burst_window_ms);
        Self {
            config,
            mode: PowerMode::Normal,
            device: DeviceState::default(),
            peer_count: 0,
            burst,
        }
    }

    /// Mode for a battery level. Lowest threshold wins.
    pub fn mode_for(&self, battery_percent: u8) -> PowerMode {
        if battery_percent < self.config.critical_percent {
            PowerMode::Critical
        } else if battery_percent < self.config.ultra_low_percent {
            PowerMode::UltraLowPower
        } else if battery_percent < self.config.battery_warning_percent {
            PowerMode::BatteryConservative
        } else {
            PowerMode::Normal
        }
    }

    /// Take a new device reading and peer count. Returns the new mode when
    /// it changed.
    pub fn refresh(&mut self, device: DeviceState, peer_count: usize) -> Option<PowerMode> {
        self.device = device;
        self.peer_count = peer_count;
        let mode = self.mode_for(device.battery_percent);
        if mode == self.mode {
            return None;
        }
        info!(
            from = %self.mode,
            to = %mode,
            battery = device.battery_percent,
            "scheduler mode change"
        );
        self.mode = mode;
        Some(mode)
    }

    pub fn mode(&self) -> PowerMode {
        self.mode
    }

    pub fn device_state(&self) -> DeviceState {
        self.device
    }

    pub fn peer_count(&self) -> usize {
        self.peer_count
    }

    fn normal_interval_ms(&self) -> f64 {
        let base = self.config.base_interval_ms as f64;
        let threshold = self.config.peer_density_threshold.max(1);
        if self.peer_count == 0 {
            base * 2.0
        } else if self.peer_count > threshold {
            let speedup = (self.peer_count as f64 / threshold as f64)
                .min(self.config.max_density_speedup)
                .max(1.0);
            base / speedup
        } else {
            base
        }
    }

    fn clamp(&self, ms: f64) -> u64 {
        (ms.round() as u64).clamp(self.config.min_interval_ms, self.config.max_interval_ms)
    }

    /// Interval for the current mode, ignoring any burst window.
    pub fn interval(&self) -> Duration {
        let ms = match self.mode {
            PowerMode::Normal => self.clamp(self.normal_interval_ms()),
            PowerMode::BatteryConservative => self.clamp(self.normal_interval_ms() * 2.0),
            PowerMode::UltraLowPower => self.config.ultra_low_interval_ms,
            PowerMode::Critical => self.config.critical_interval_ms,
        };
        Duration::from_millis(ms)
    }

    /// Delay until the next tick. An open burst window overrides the mode.
    pub fn next_interval(&self, now: u64) -> Duration {
        if self.burst.is_active(now) {
            let remaining = self.burst.remaining_ms(now).max(1);
            Duration::from_millis(self.config.burst_interval_ms.min(remaining))
        } else {
            self.interval()
        }
    }

    /// Adjust an outbound envelope before it is signed. Returns true when
    /// anything was changed.
    pub fn shape_outbound(&self, envelope: &mut Envelope) -> bool {
        let mut changed = false;

        if self.mode.uses_lean_frame() {
            if let Some(payload) = envelope.payload.as_mut() {
                changed |= payload.strip_note();
            }
            if let Some(loc) = envelope.loc {
                let coarse = loc.coarsened();
                if coarse != loc {
                    envelope.loc = Some(coarse);
                    changed = true;
                }
            }
            if envelope.ttl > self.config.lean_ttl_cap {
                envelope.ttl = self.config.lean_ttl_cap;
                changed = true;
            }
        }

        if self.mode == PowerMode::Critical
            && envelope.message_type == MessageType::Help
            && envelope.priority > 0
        {
            envelope.priority -= 1;
            changed = true;
        }

        changed
    }

    pub fn trigger_burst(&mut self, now: u64) -> bool {
        let opened = self.burst.activate(now);
        if opened {
            info!(window_ms = self.config.burst_window_ms, "burst window opened");
        }
        opened
    }

    /// Returns true when a burst window just closed.
    pub fn expire_burst(&mut self, now: u64) -> bool {
        let closed = self.burst.expire(now);
        if closed {
            info!("burst window closed");
        }
        closed
    }

    pub fn burst_active(&self, now: u64) -> bool {
        self.burst.is_active(now)
    }

    pub fn duty_cycle(&self, now: u64) -> DutyCycle {
        self.burst.duty_cycle(now)
    }

    pub fn status(&self, now: u64) -> SchedulerStatus {
        SchedulerStatus {
            mode: self.mode,
            interval_ms: self.next_interval(now).as_millis() as u64,
            battery_percent: self.device.battery_percent,
            peer_count: self.peer_count,
            burst_active: self.burst.is_active(now),
            lean_frame: self.mode.uses_lean_frame(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{HelpPayload, Location, Payload};
    use device::MockDeviceMonitor;

    fn scheduler_at(battery: u8, peers: usize) -> AdaptiveScheduler {
        let mut s = AdaptiveScheduler::new(SchedulerConfig::default());
        s.refresh(DeviceState::with_battery(battery), peers);
        s
    }

    fn help_with_note() -> Envelope {
        Envelope::new(
            [1u8; 32],
            Payload::Help(HelpPayload {
                under_rubble: true,
                injured: true,
                people_count: 2,
                note: Some("stairwell B, third floor".into()),
            }),
            1_000,
        )
        .with_location(Location::new(41.015137, 28.979530).with_accuracy(5.0))
    }

    #[test]
    fn test_mode_thresholds() {
        let s = AdaptiveScheduler::new(SchedulerConfig::default());
        assert_eq!(s.mode_for(100), PowerMode::Normal);
        assert_eq!(s.mode_for(20), PowerMode::Normal);
        assert_eq!(s.mode_for(19), PowerMode::BatteryConservative);
        assert_eq!(s.mode_for(8), PowerMode::BatteryConservative);
        assert_eq!(s.mode_for(7), PowerMode::UltraLowPower);
        assert_eq!(s.mode_for(6), PowerMode::UltraLowPower);
        assert_eq!(s.mode_for(4), PowerMode::Critical);
        assert_eq!(s.mode_for(0), PowerMode::Critical);
    }

    #[test]
    fn test_normal_interval_scales_with_density() {
        assert_eq!(scheduler_at(90, 3).interval(), Duration::from_secs(30));
        assert_eq!(scheduler_at(90, 10).interval(), Duration::from_secs(15));
        // Speedup caps at 3x, floor is 10 s
        assert_eq!(scheduler_at(90, 50).interval(), Duration::from_secs(10));
        // Alone: back off
        assert_eq!(scheduler_at(90, 0).interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_conservative_doubles_interval() {
        assert_eq!(scheduler_at(15, 3).interval(), Duration::from_secs(60));
        assert_eq!(scheduler_at(15, 10).interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_low_power_intervals_are_fixed() {
        assert_eq!(scheduler_at(6, 50).interval(), Duration::from_secs(8 * 60));
        assert_eq!(scheduler_at(3, 50).interval(), Duration::from_secs(15 * 60));
    }

    #[test]
    fn test_refresh_reports_transitions_only() {
        let mut s = AdaptiveScheduler::new(SchedulerConfig::default());
        assert_eq!(s.refresh(DeviceState::with_battery(90), 2), None);
        assert_eq!(
            s.refresh(DeviceState::with_battery(6), 2),
            Some(PowerMode::UltraLowPower)
        );
        assert_eq!(s.refresh(DeviceState::with_battery(6), 4), None);
    }

    #[test]
    fn test_lean_frame_in_ultra_low_power() {
        let s = scheduler_at(6, 2);
        let mut env = help_with_note();
        assert!(s.shape_outbound(&mut env));
        assert_eq!(env.note(), None);
        let loc = env.loc.unwrap();
        assert_eq!(loc.lat, 41.02);
        assert_eq!(loc.lon, 28.98);
        assert_eq!(env.ttl, 4);
        // No priority bump above critical
        assert_eq!(env.priority, MessageType::Help.default_priority());
    }

    #[test]
    fn test_critical_bumps_help_priority() {
        let s = scheduler_at(3, 2);
        let mut env = help_with_note();
        s.shape_outbound(&mut env);
        assert_eq!(env.priority, MessageType::Help.default_priority() - 1);

        let mut top = help_with_note().with_priority(0);
        s.shape_outbound(&mut top);
        assert_eq!(top.priority, 0);
    }

    #[test]
    fn test_normal_mode_leaves_envelope_alone() {
        let s = scheduler_at(80, 2);
        let mut env = help_with_note();
        let before = env.clone();
        assert!(!s.shape_outbound(&mut env));
        assert_eq!(env, before);
    }

    #[test]
    fn test_burst_overrides_interval() {
        let mut s = scheduler_at(80, 2);
        assert!(s.trigger_burst(10_000));
        assert!(s.burst_active(12_000));
        assert_eq!(s.next_interval(12_000), Duration::from_secs(1));
        assert_eq!(s.next_interval(13_500), Duration::from_millis(500));
        assert!(s.status(12_000).burst_active);

        assert!(s.expire_burst(14_000));
        assert_eq!(s.next_interval(14_000), Duration::from_secs(30));
        assert_eq!(s.mode(), PowerMode::Normal);
    }

    #[test]
    fn test_refresh_from_monitor() {
        let mut monitor = MockDeviceMonitor::new();
        monitor.expect_battery_percent().return_const(4u8);
        monitor.expect_is_charging().return_const(false);
        monitor
            .expect_thermal_state()
            .return_const(ThermalState::Nominal);

        let mut s = AdaptiveScheduler::new(SchedulerConfig::default());
        s.refresh(DeviceState::read(&monitor), 1);
        let status = s.status(0);
        assert_eq!(status.mode, PowerMode::Critical);
        assert_eq!(status.battery_percent, 4);
        assert!(status.lean_frame);
        assert_eq!(status.interval_ms, 15 * 60_000);
    }
}
