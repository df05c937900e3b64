//! apcupsd compatible status report.
//!
//! The report is plain text, one `KEY      : VALUE` record per line, led by a
//! header carrying the format version, the record count and the byte length
//! of everything after the header line.

use std::sync::Arc;

use chrono::{DateTime, Local};
use tokio::sync::{OwnedRwLockReadGuard, RwLock};
use tracing::debug;

use crate::power::PowerSummary;
use crate::settings::NominalConfig;
use crate::status::Snapshot;

pub const RECORD_COUNT: usize = 34;
pub const LINE_SEPARATOR: char = '\n';
/// A delivery frame carries at most this many bytes of line text.
pub const MAX_LINE_LEN: usize = 255;

const VERSION: u32 = 1;
const KEY_WIDTH: usize = 9;

fn header(length: usize) -> String {
    format!(
        "{:<width$}: {:03},{:03},{:04}",
        "APC",
        VERSION,
        RECORD_COUNT,
        length,
        width = KEY_WIDTH
    )
}

/// Cuts `s` to at most `max` bytes without splitting a character.
fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// A finished, immutable report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Report {
    text: String,
}

impl Report {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Record lines without their separator.
    pub fn lines(&self) -> ReportLines<'_> {
        ReportLines::new(&self.text)
    }
}

/// Lazy scan over the report text that leaves the text untouched.
#[derive(Debug, Clone)]
pub struct ReportLines<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> ReportLines<'a> {
    pub fn new(text: &'a str) -> Self {
        ReportLines { text, pos: 0 }
    }
}

impl<'a> Iterator for ReportLines<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        let rest = &self.text[self.pos..];
        if rest.is_empty() {
            return None;
        }
        match rest.find(LINE_SEPARATOR) {
            Some(end) => {
                self.pos += end + LINE_SEPARATOR.len_utf8();
                Some(&rest[..end])
            }
            None => {
                self.pos = self.text.len();
                Some(rest)
            }
        }
    }
}

struct Records {
    text: String,
    count: usize,
}

impl Records {
    /// Control characters in `value` become spaces so a record stays on one line.
    fn push(&mut self, key: &str, value: impl AsRef<str>) {
        let value: String = value
            .as_ref()
            .chars()
            .map(|c| if c.is_control() { ' ' } else { c })
            .collect();
        let line = format!("{:<width$}: {}", key, value, width = KEY_WIDTH);
        self.text.push_str(truncate(&line, MAX_LINE_LEN));
        self.text.push(LINE_SEPARATOR);
        self.count += 1;
    }
}

fn volts(milli: i32) -> String {
    format!("{:.1} Volts", f64::from(milli) / 1000.0)
}

fn amps(milli: i32) -> String {
    format!("{:.3} Amps", f64::from(milli) / 1000.0)
}

/// Output load as a percentage of the rated current.
pub fn load_percent(output_current: i32, max_current: u32) -> u32 {
    if max_current == 0 || output_current <= 0 {
        return 0;
    }
    (f64::from(output_current) / f64::from(max_current) * 100.0).round() as u32
}

fn status_line(snapshot: &Snapshot, nominal: &NominalConfig) -> String {
    let status = &snapshot.status;
    if !status.device_status_valid {
        return "COMMLOST".to_string();
    }

    let mut line = if status.device_status.is_power_present() {
        "ONLINE".to_string()
    } else {
        "ONBATT".to_string()
    };
    if status.device_status.is_over_current() {
        line.push_str(" OVERLOAD");
    }
    if status.soc < i32::from(nominal.shutdown_soc) {
        line.push_str(" LOWBATT");
    }
    if !status.device_status.is_battery_present() {
        line.push_str(" NOBATT");
    }
    if snapshot.power.shutdown_pending {
        line.push_str(" SHUTTING DOWN");
    }
    line
}

pub struct ReportBuilder {
    hostname: String,
    version: String,
}

impl ReportBuilder {
    pub fn new(hostname: String) -> Self {
        ReportBuilder {
            hostname,
            version: format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        }
    }

    /// Uses the machine hostname, or an empty one if it can't be read.
    pub fn for_this_host() -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default();
        ReportBuilder::new(hostname)
    }

    pub fn build(&self, snapshot: &Snapshot, nominal: &NominalConfig, now: DateTime<Local>) -> Report {
        let status = &snapshot.status;
        let power: &PowerSummary = &snapshot.power;
        let date = now.format("%Y-%m-%d %H:%M:%S %z").to_string();

        // Header first with a dummy length, rewritten once the size is known.
        let mut records = Records {
            text: String::new(),
            count: 0,
        };
        records.text.push_str(&header(0));
        records.text.push(LINE_SEPARATOR);
        records.count += 1;
        let header_len = records.text.len();

        records.push("DATE", &date);
        records.push("HOSTNAME", &self.hostname);
        records.push("VERSION", &self.version);
        records.push("UPSNAME", &status.series);
        records.push("MODEL", &status.battery_type);
        records.push("FIRMWARE", &status.firmware);
        records.push("STATUS", status_line(snapshot, nominal));
        records.push(
            "LINEFAIL",
            if status.device_status.is_power_present() { "No" } else { "Yes" },
        );
        records.push("LINEV", volts(status.input_voltage));
        records.push("LINEA", amps(status.input_current));
        records.push(
            "LOADPCT",
            format!("{} Percent", load_percent(status.output_current, nominal.max_current)),
        );
        records.push("BCHARGE", format!("{} Percent", status.soc));
        records.push(
            "TIMELEFT",
            format!("{:.1} Minutes", power.remaining.unwrap_or(0) as f64 / 60.0),
        );
        records.push("OUTPUTV", volts(status.output_voltage));
        records.push("OUTPUTA", amps(status.output_current));
        records.push("BATTV", volts(status.battery_voltage));
        records.push("BATTA", amps(status.battery_current));
        records.push("ITEMP", format!("{} C", status.uc_temperature));
        records.push("DSHUTD", format!("{} Seconds", nominal.shutdown_delay));
        records.push("DWAKE", format!("{} Seconds", nominal.wakeup_delay));
        records.push("MAXTIME", format!("{} Seconds", nominal.max_backup_time));
        records.push("RETPCT", format!("{} Percent", nominal.power_return_percent));
        records.push("MBATTCHG", format!("{} Percent", nominal.shutdown_soc));
        records.push("NUMXFERS", power.fail_count.to_string());
        records.push("TONBATT", format!("{} Seconds", power.time_on_battery));
        records.push(
            "XONBATT",
            power
                .failed_since
                .map_or("N/A".to_string(), |t| t.format("%Y-%m-%d %H:%M:%S %z").to_string()),
        );
        records.push("STATFLAG", format!("0x{:02X}", status.device_status.bits()));
        records.push("REG2", format!("0x{:04X}", status.charge_status.bits()));
        records.push("REG3", format!("0x{:04X}", status.monitor_status.bits()));
        records.push("NOMINV", format!("{:.1} Volts", nominal.input_voltage));
        records.push("NOMBATTV", format!("{:.1} Volts", nominal.battery_voltage));
        records.push("NOMPOWER", format!("{:.0} Watts", nominal.output_power));
        records.push("END APC", &date);

        let length = records.text.len() - header_len;
        records
            .text
            .replace_range(..header_len - 1, &header(length));
        debug_assert_eq!(records.count, RECORD_COUNT);

        Report { text: records.text }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Updated,
    /// A delivery session holds the report, this cycle's update was dropped.
    Skipped,
}

/// The current report, shared between the poll loop and delivery sessions.
///
/// Sessions hold a read guard for their whole lifetime. The poll loop
/// refreshes on a best-effort basis: it never waits for sessions to finish
/// and simply drops the update when any session is active.
#[derive(Clone, Default)]
pub struct ReportStore {
    inner: Arc<RwLock<Report>>,
}

impl ReportStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refresh_best_effort(&self, build: impl FnOnce() -> Report) -> RefreshOutcome {
        match self.inner.try_write() {
            Ok(mut report) => {
                *report = build();
                RefreshOutcome::Updated
            }
            Err(_) => {
                debug!("Report in use, skipping refresh.");
                RefreshOutcome::Skipped
            }
        }
    }

    /// Holds the report until the returned guard is dropped.
    pub async fn checkout(&self) -> OwnedRwLockReadGuard<Report> {
        self.inner.clone().read_owned().await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::status::{DeviceStatus, UPSStatus};
    use chrono::TimeZone;

    pub(crate) fn snapshot() -> Snapshot {
        Snapshot {
            status: UPSStatus {
                input_voltage: 24_100,
                input_current: 350,
                output_voltage: 23_900,
                output_current: 1_250,
                battery_voltage: 11_800,
                battery_current: -40,
                soc: 87,
                uc_temperature: 31,
                device_status: DeviceStatus::from_raw(0x0D),
                series: "UPSIC-1205".to_string(),
                firmware: "1.17".to_string(),
                battery_type: "DS-2".to_string(),
                device_status_valid: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub(crate) fn sample_report() -> Report {
        let now = Local.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        ReportBuilder::new("nas".to_string()).build(&snapshot(), &NominalConfig::default(), now)
    }

    #[test]
    fn header_declares_length_of_body() {
        let report = sample_report();
        let (first, body) = report.text().split_once('\n').unwrap();
        assert_eq!(first, format!("APC      : 001,{:03},{:04}", RECORD_COUNT, body.len()));
        assert_eq!(report.lines().count(), RECORD_COUNT);
    }

    #[test]
    fn renders_engineering_units() {
        let report = sample_report();
        let lines: Vec<&str> = report.lines().collect();

        assert_eq!(lines.len(), RECORD_COUNT);
        assert_eq!(lines[2], "HOSTNAME : nas");
        assert!(lines.contains(&"UPSNAME  : UPSIC-1205"));
        assert!(lines.contains(&"STATUS   : ONLINE"));
        assert!(lines.contains(&"LINEFAIL : No"));
        assert!(lines.contains(&"LINEV    : 24.1 Volts"));
        assert!(lines.contains(&"LINEA    : 0.350 Amps"));
        assert!(lines.contains(&"BATTA    : -0.040 Amps"));
        assert!(lines.contains(&"LOADPCT  : 25 Percent"));
        assert!(lines.contains(&"BCHARGE  : 87 Percent"));
        assert!(lines.contains(&"TIMELEFT : 0.0 Minutes"));
        assert!(lines.contains(&"XONBATT  : N/A"));
        assert!(lines.contains(&"STATFLAG : 0x0D"));
        assert!(lines.contains(&"NOMPOWER : 120 Watts"));
        assert!(lines[RECORD_COUNT - 1].starts_with("END APC  : 2024-03-01 12:30:00"));
    }

    #[test]
    fn status_reflects_outage() {
        let mut snap = snapshot();
        snap.status.device_status = DeviceStatus::DISCHARGING | DeviceStatus::BATTERY_PRESENT;
        snap.status.soc = 10;
        snap.power.shutdown_pending = true;
        snap.power.remaining = Some(300);
        let report = ReportBuilder::new("nas".to_string()).build(&snap, &NominalConfig::default(), Local::now());

        assert!(report.lines().any(|l| l == "STATUS   : ONBATT LOWBATT SHUTTING DOWN"));
        assert!(report.lines().any(|l| l == "LINEFAIL : Yes"));
        assert!(report.lines().any(|l| l == "TIMELEFT : 5.0 Minutes"));

        snap.status.device_status = DeviceStatus::from_raw(0x24);
        snap.status.soc = 50;
        snap.power.shutdown_pending = false;
        let report = ReportBuilder::new("nas".to_string()).build(&snap, &NominalConfig::default(), Local::now());
        assert!(report.lines().any(|l| l == "STATUS   : ONLINE OVERLOAD NOBATT"));

        snap.status.device_status_valid = false;
        let report = ReportBuilder::new("nas".to_string()).build(&snap, &NominalConfig::default(), Local::now());
        assert!(report.lines().any(|l| l == "STATUS   : COMMLOST"));
    }

    #[test]
    fn long_values_are_capped() {
        let builder = ReportBuilder::new("h".repeat(400));
        let report = builder.build(&snapshot(), &NominalConfig::default(), Local::now());

        assert!(report.lines().all(|l| l.len() <= MAX_LINE_LEN));
        let (_, body) = report.text().split_once('\n').unwrap();
        assert!(report.text().starts_with(&format!("APC      : 001,034,{:04}", body.len())));
    }

    #[test]
    fn identity_newlines_stay_inside_their_record() {
        let mut snap = snapshot();
        snap.status.series = "A\n\nB".to_string();
        let report = ReportBuilder::new("nas\r".to_string()).build(&snap, &NominalConfig::default(), Local::now());

        assert_eq!(report.lines().count(), RECORD_COUNT);
        assert!(report.lines().any(|l| l == "UPSNAME  : A  B"));
        assert!(report.lines().any(|l| l == "HOSTNAME : nas "));
        let (_, body) = report.text().split_once('\n').unwrap();
        assert!(report.text().starts_with(&format!("APC      : 001,034,{:04}", body.len())));
    }

    #[test]
    fn load_percent_rounds() {
        assert_eq!(load_percent(1_250, 5_000), 25);
        assert_eq!(load_percent(1_999, 4_000), 50);
        assert_eq!(load_percent(100, 0), 0);
        assert_eq!(load_percent(-20, 5_000), 0);
    }

    #[test]
    fn line_scanner_keeps_empty_lines() {
        let mut lines = ReportLines::new("a\nbb\n\nccc");
        assert_eq!(lines.next(), Some("a"));
        assert_eq!(lines.next(), Some("bb"));
        assert_eq!(lines.next(), Some(""));
        assert_eq!(lines.next(), Some("ccc"));
        assert_eq!(lines.next(), None);
    }

    #[tokio::test]
    async fn refresh_skips_while_checked_out() {
        let store = ReportStore::new();
        assert_eq!(store.refresh_best_effort(sample_report), RefreshOutcome::Updated);

        let guard = store.checkout().await;
        let newer = || Report::default();
        assert_eq!(store.refresh_best_effort(newer), RefreshOutcome::Skipped);
        assert_eq!(*guard, sample_report());
        drop(guard);

        assert_eq!(store.refresh_best_effort(newer), RefreshOutcome::Updated);
        assert!(store.checkout().await.is_empty());
    }
}
