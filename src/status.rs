use std::sync::Arc;

use bitflags::bitflags;
use chrono::{DateTime, Local};
use tokio::sync::{Mutex, MutexGuard};

use crate::power::PowerSummary;

bitflags! {
    /// Device status byte of the UPS controller.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DeviceStatus: u8 {
        const CHARGING = 1 << 0;
        const DISCHARGING = 1 << 1;
        const POWER_PRESENT = 1 << 2;
        const BATTERY_PRESENT = 1 << 3;
        const SHUTDOWN_SET = 1 << 4;
        const OVER_CURRENT = 1 << 5;
    }
}

bitflags! {
    /// LTC3350 charger status register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ChargeStatus: u16 {
        const STEP_DOWN = 1 << 0;
        const STEP_UP = 1 << 1;
        const CONSTANT_VOLTAGE = 1 << 2;
        const UNDER_VOLTAGE = 1 << 3;
        const CURRENT_LIMIT = 1 << 4;
        const POWER_GOOD = 1 << 5;
        const SHUNTING = 1 << 6;
        const BALANCING = 1 << 7;
        const CAP_MEASUREMENT = 1 << 8;
        const CONSTANT_CURRENT = 1 << 9;
        const POWER_FAIL = 1 << 11;
    }
}

bitflags! {
    /// LTC3350 monitor status register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MonitorStatus: u16 {
        const ESR_MEASURING = 1 << 0;
        const ESR_WAITING = 1 << 1;
        const WAITING_CONDITION = 1 << 2;
        const CAPACITY_COMPLETE = 1 << 3;
        const ESR_COMPLETE = 1 << 4;
        const LAST_CAP_FAIL = 1 << 5;
        const LAST_ESR_FAIL = 1 << 6;
        const POWER_FAIL = 1 << 8;
        const POWER_RECOVERY = 1 << 9;
    }
}

// Flags are views over the raw value. Undefined bits are retained so the
// register always reads back exactly as the device sent it.

impl DeviceStatus {
    pub fn from_raw(value: u8) -> Self {
        Self::from_bits_retain(value)
    }

    pub fn is_power_present(self) -> bool {
        self.contains(Self::POWER_PRESENT)
    }

    pub fn is_battery_present(self) -> bool {
        self.contains(Self::BATTERY_PRESENT)
    }

    pub fn is_shutdown_set(self) -> bool {
        self.contains(Self::SHUTDOWN_SET)
    }

    pub fn is_over_current(self) -> bool {
        self.contains(Self::OVER_CURRENT)
    }
}

impl ChargeStatus {
    pub fn from_raw(value: u16) -> Self {
        Self::from_bits_retain(value)
    }
}

impl MonitorStatus {
    pub fn from_raw(value: u16) -> Self {
        Self::from_bits_retain(value)
    }
}

/// One poll cycle worth of UPS readings.
///
/// Voltages and currents are in mV and mA as sent by the device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UPSStatus {
    pub input_voltage: i32,
    pub input_current: i32,
    pub output_voltage: i32,
    pub output_current: i32,
    pub battery_voltage: i32,
    pub battery_current: i32,
    pub vcap_voltage: [i32; 4],
    pub capacity: i32,
    pub esr: i32,
    pub soc: i32,
    pub uc_temperature: i32,

    pub device_status: DeviceStatus,
    pub charge_status: ChargeStatus,
    pub monitor_status: MonitorStatus,

    pub series: String,
    pub firmware: String,
    pub battery_type: String,
    pub hw_revision: String,

    /// False when the device status register did not come back in a valid frame.
    pub device_status_valid: bool,
    /// Number of commands in this cycle whose reply failed validation.
    pub mismatches: u32,
}

impl UPSStatus {
    /// Utility power is considered failed when absent or when the UPS requests a shutdown.
    pub fn is_power_failed(&self) -> bool {
        !self.device_status.is_power_present() || self.device_status.is_shutdown_set()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub status: UPSStatus,
    pub power: PowerSummary,
    pub updated: Option<DateTime<Local>>,
}

/// The single shared copy of the latest snapshot.
#[derive(Clone, Default)]
pub struct StatusStore {
    inner: Arc<Mutex<Snapshot>>,
}

impl StatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self) -> MutexGuard<'_, Snapshot> {
        self.inner.lock().await
    }
}
