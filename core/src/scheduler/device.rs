// Device state: battery and thermal readings from the host platform

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ThermalState {
    #[default]
    Nominal,
    Elevated,
    High,
    Critical,
}

impl ThermalState {
    pub fn is_high(self) -> bool {
        matches!(self, ThermalState::High | ThermalState::Critical)
    }
}

impl fmt::Display for ThermalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThermalState::Nominal => write!(f, "nominal"),
            ThermalState::Elevated => write!(f, "elevated"),
            ThermalState::High => write!(f, "high"),
            ThermalState::Critical => write!(f, "critical"),
        }
    }
}

/// One reading of the device's power and thermal condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceState {
    /// 0-100
    pub battery_percent: u8,
    pub charging: bool,
    pub thermal: ThermalState,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            battery_percent: 100,
            charging: false,
            thermal: ThermalState::Nominal,
        }
    }
}

impl DeviceState {
    pub fn with_battery(battery_percent: u8) -> Self {
        Self {
            battery_percent: battery_percent.min(100),
            ..Self::default()
        }
    }

    /// Take one reading from a monitor.
    pub fn read(monitor: &dyn DeviceMonitor) -> Self {
        Self {
            battery_percent: monitor.battery_percent().min(100),
            charging: monitor.is_charging(),
            thermal: monitor.thermal_state(),
        }
    }
}

/// Implemented by the host platform (Android/iOS battery APIs, etc.).
#[cfg_attr(test, mockall::automock)]
pub trait DeviceMonitor: Send + Sync {
    fn battery_percent(&self) -> u8;
    fn is_charging(&self) -> bool;
    fn thermal_state(&self) -> ThermalState;
}

/// Settable monitor for simulations and hosts that push readings in.
#[derive(Debug)]
pub struct ManualDeviceMonitor {
    battery: AtomicU8,
    charging: AtomicBool,
    thermal: RwLock<ThermalState>,
}

impl ManualDeviceMonitor {
    pub fn new(battery_percent: u8) -> Self {
        Self {
            battery: AtomicU8::new(battery_percent.min(100)),
            charging: AtomicBool::new(false),
            thermal: RwLock::new(ThermalState::Nominal),
        }
    }

    pub fn set_battery(&self, percent: u8) {
        self.battery.store(percent.min(100), Ordering::SeqCst);
    }

    pub fn set_charging(&self, charging: bool) {
        self.charging.store(charging, Ordering::SeqCst);
    }

    pub fn set_thermal(&self, thermal: ThermalState) {
        *self.thermal.write() = thermal;
    }
}

impl Default for ManualDeviceMonitor {
    fn default() -> Self {
        Self::new(100)
    }
}

impl DeviceMonitor for ManualDeviceMonitor {
    fn battery_percent(&self) -> u8 {
        self.battery.load(Ordering::SeqCst)
    }

    fn is_charging(&self) -> bool {
        self.charging.load(Ordering::SeqCst)
    }

    fn thermal_state(&self) -> ThermalState {
        *self.thermal.read()
    }
}
