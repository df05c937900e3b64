use std::fs::{File, OpenOptions};
use std::path::Path;

use csv::{Writer, WriterBuilder};
use serde::Serialize;

use crate::status::Snapshot;

#[derive(Serialize, Debug)]
struct CsvRecord {
    timestamp: String,
    input_voltage: i32,
    input_current: i32,
    output_voltage: i32,
    output_current: i32,
    battery_voltage: i32,
    battery_current: i32,
    vcap1_voltage: i32,
    vcap2_voltage: i32,
    vcap3_voltage: i32,
    vcap4_voltage: i32,
    capacity: i32,
    esr: i32,
    soc: i32,
    uc_temperature: i32,
    device_status: u8,
    charge_status: u16,
    monitor_status: u16,
    power_failed: bool,
    fail_count: u32,
    remaining: Option<u64>,
}

impl From<&Snapshot> for CsvRecord {
    fn from(snapshot: &Snapshot) -> Self {
        let status = &snapshot.status;
        CsvRecord {
            timestamp: snapshot
                .updated
                .map(|t| t.to_rfc3339())
                .unwrap_or_default(),
            input_voltage: status.input_voltage,
            input_current: status.input_current,
            output_voltage: status.output_voltage,
            output_current: status.output_current,
            battery_voltage: status.battery_voltage,
            battery_current: status.battery_current,
            vcap1_voltage: status.vcap_voltage[0],
            vcap2_voltage: status.vcap_voltage[1],
            vcap3_voltage: status.vcap_voltage[2],
            vcap4_voltage: status.vcap_voltage[3],
            capacity: status.capacity,
            esr: status.esr,
            soc: status.soc,
            uc_temperature: status.uc_temperature,
            device_status: status.device_status.bits(),
            charge_status: status.charge_status.bits(),
            monitor_status: status.monitor_status.bits(),
            power_failed: snapshot.power.power_failed,
            fail_count: snapshot.power.fail_count,
            remaining: snapshot.power.remaining,
        }
    }
}

/// Append-only log of poll cycles, one row each. Readings stay in mV/mA.
pub struct CsvLog {
    writer: Writer<File>,
}

impl CsvLog {
    pub fn open(path: &Path) -> Result<CsvLog, csv::Error> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let is_new = file.metadata()?.len() == 0;
        let writer = WriterBuilder::new().has_headers(is_new).from_writer(file);
        Ok(CsvLog { writer })
    }

    pub fn append(&mut self, snapshot: &Snapshot) -> Result<(), csv::Error> {
        self.writer.serialize(CsvRecord::from(snapshot))?;
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apc::tests::snapshot;
    use chrono::{Local, TimeZone};

    #[test]
    fn header_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ups.csv");
        let mut snap = snapshot();
        snap.updated = Some(Local.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap());

        let mut log = CsvLog::open(&path).unwrap();
        log.append(&snap).unwrap();
        drop(log);

        snap.power.remaining = Some(300);
        let mut log = CsvLog::open(&path).unwrap();
        log.append(&snap).unwrap();
        drop(log);

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(&headers[0], "timestamp");
        assert_eq!(&headers[1], "input_voltage");

        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert!(rows[0][0].starts_with("2024-03-01T12:30:00"));
        assert_eq!(&rows[0][1], "24100");
        assert_eq!(&rows[0][15], "13");
        assert_eq!(&rows[0][20], "");
        assert_eq!(&rows[1][20], "300");
    }
}
