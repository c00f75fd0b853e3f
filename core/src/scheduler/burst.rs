// Burst window: temporary duty-cycle boost for fast-path traffic

use serde::{Deserialize, Serialize};

/// Radio duty cycle requested from transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DutyCycle {
    #[default]
    Normal,
    Burst,
}

/// Tracks one bounded burst window. Re-activating while open extends it.
#[derive(Debug, Clone)]
pub struct BurstController {
    window_ms: u64,
    until: Option<u64>,
    activations: u64,
}

impl BurstController {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            until: None,
            activations: 0,
        }
    }

    /// Open (or extend) the window. Returns true if it was closed before.
    pub fn activate(&mut self, now: u64) -> bool {
        let was_active = self.is_active(now);
        self.until = Some(now.saturating_add(self.window_ms));
        self.activations += 1;
        !was_active
    }

    pub fn is_active(&self, now: u64) -> bool {
        self.until.is_some_and(|until| now < until)
    }

    /// Close the window if it has run out. Returns true exactly once per
    /// window, when the caller should revert the duty cycle.
    pub fn expire(&mut self, now: u64) -> bool {
        match self.until {
            Some(until) if now >= until => {
                self.until = None;
                true
            }
            _ => false,
        }
    }

    pub fn remaining_ms(&self, now: u64) -> u64 {
        self.until.map_or(0, |until| until.saturating_sub(now))
    }

    pub fn duty_cycle(&self, now: u64) -> DutyCycle {
        if self.is_active(now) {
            DutyCycle::Burst
        } else {
            DutyCycle::Normal
        }
    }

    pub fn activations(&self) -> u64 {
        self.activations
    }
}
