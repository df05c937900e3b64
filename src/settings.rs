use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::serial::SERIAL_TIMEOUT;

// The following define server behaviour.
const SERVER_PORT: u16 = 10024; // WebSocket relay.
const NIS_PORT: u16 = 3551; // apcupsd network information server.
const SERIAL_INTERFACE: &str = "/dev/ttyUSB0";
const BAUD_RATE: u32 = 38400;
const SERIAL_TIMEOUT_MS: u64 = SERIAL_TIMEOUT.as_millis() as u64;
const POLL_INTERVAL_MS: u64 = 500; // 2 Hz relay updates.
const SHUTDOWN_DELAY: u64 = 1; // Seconds on battery before the host shuts down.
const MAX_CLIENTS: usize = 10;

// The following describe the UPS nameplate and shutdown policy.
const SHUTDOWN_SOC: u8 = 20; // Percent charge below which the host shuts down at once.

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    pub ip: IpAddr,
    pub port: u16,
    pub nis_port: u16,
    pub serial: String,
    pub baud_rate: u32,
    pub serial_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub shutdown_delay: u64,
    pub max_clients: usize,
    pub csv_log: Option<PathBuf>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: SERVER_PORT,
            nis_port: NIS_PORT,
            serial: SERIAL_INTERFACE.to_string(),
            baud_rate: BAUD_RATE,
            serial_timeout_ms: SERIAL_TIMEOUT_MS,
            poll_interval_ms: POLL_INTERVAL_MS,
            shutdown_delay: SHUTDOWN_DELAY,
            max_clients: MAX_CLIENTS,
            csv_log: None,
        }
    }
}

impl ServerSettings {
    pub fn serial_timeout(&self) -> Duration {
        Duration::from_millis(self.serial_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct UpsSettings {
    pub input_voltage: f64,
    pub battery_voltage: f64,
    pub power_return_percent: u32,
    pub max_backup_time: u32,
    pub wakeup_delay: u32,
    /// Rated output current in mA.
    pub max_current: u32,
    pub shutdown_by_time: bool,
    pub shutdown_by_soc: bool,
    pub shutdown_soc: u8,
}

impl Default for UpsSettings {
    fn default() -> Self {
        UpsSettings {
            input_voltage: 24.0,
            battery_voltage: 12.0,
            power_return_percent: 0,
            max_backup_time: 0,
            wakeup_delay: 0,
            max_current: 5000,
            shutdown_by_time: true,
            shutdown_by_soc: false,
            shutdown_soc: SHUTDOWN_SOC,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub ups: UpsSettings,
}

impl Settings {
    /// Layers defaults, the TOML file and `UPS_SERVER_` environment overrides.
    pub fn load(path: &Path) -> Result<Settings, figment::Error> {
        if path.exists() {
            let file = Figment::from(Toml::file(path));
            for section in ["server", "ups"] {
                if file.find_value(section).is_err() {
                    warn!(
                        "No [{}] section in {}, using defaults.",
                        section,
                        path.display()
                    );
                }
            }
        } else {
            warn!("Configuration file {} not found, using defaults.", path.display());
        }

        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("UPS_SERVER_").split("__"))
            .extract()
    }

    pub fn nominal(&self) -> NominalConfig {
        NominalConfig {
            input_voltage: self.ups.input_voltage,
            battery_voltage: self.ups.battery_voltage,
            max_backup_time: self.ups.max_backup_time,
            power_return_percent: self.ups.power_return_percent,
            wakeup_delay: self.ups.wakeup_delay,
            max_current: self.ups.max_current,
            output_power: self.ups.input_voltage * f64::from(self.ups.max_current) / 1000.0,
            shutdown_delay: self.server.shutdown_delay,
            shutdown_soc: self.ups.shutdown_soc,
            shutdown_by_time: self.ups.shutdown_by_time,
            shutdown_by_soc: self.ups.shutdown_by_soc,
        }
    }
}

/// Nameplate values and shutdown policy, fixed for the life of the process.
#[derive(Debug, Clone, PartialEq)]
pub struct NominalConfig {
    pub input_voltage: f64,
    pub battery_voltage: f64,
    pub max_backup_time: u32,
    pub power_return_percent: u32,
    pub wakeup_delay: u32,
    pub max_current: u32,
    /// Watts.
    pub output_power: f64,
    /// Seconds.
    pub shutdown_delay: u64,
    pub shutdown_soc: u8,
    pub shutdown_by_time: bool,
    pub shutdown_by_soc: bool,
}

impl Default for NominalConfig {
    fn default() -> Self {
        Settings::default().nominal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
nis_port = 3552
serial = "/dev/ttyS1"
shutdown_delay = 30

[ups]
input_voltage = 230.0
max_current = 2000
shutdown_by_soc = true
shutdown_soc = 35
"#
        )
        .unwrap();

        let settings = Settings::load(file.path()).unwrap();
        assert_eq!(settings.server.nis_port, 3552);
        assert_eq!(settings.server.serial, "/dev/ttyS1");
        assert_eq!(settings.server.port, SERVER_PORT);
        assert_eq!(settings.ups.battery_voltage, 12.0);

        let nominal = settings.nominal();
        assert_eq!(nominal.shutdown_delay, 30);
        assert_eq!(nominal.output_power, 460.0);
        assert!(nominal.shutdown_by_soc);
        assert!(nominal.shutdown_by_time);
        assert_eq!(nominal.shutdown_soc, 35);
    }

    #[test]
    fn missing_section_falls_back() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nport = 8080").unwrap();

        let settings = Settings::load(file.path()).unwrap();
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.ups, UpsSettings::default());
    }
}
