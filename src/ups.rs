use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::SerialStream;
use tracing::debug;

use crate::protocol::{encode_request, Command, CommandIndex, Frame, IDENTITY_LEN};
use crate::serial::SerialTransport;
use crate::status::{ChargeStatus, DeviceStatus, MonitorStatus, UPSStatus};

// Largest response the module sends, with room to spare.
const MAX_FRAME_LENGTH: usize = 512;

#[derive(Debug, Error)]
pub enum UPSError {
    #[error("failed to open serial device {path}: {source}")]
    Open {
        path: String,
        source: tokio_serial::Error,
    },
    #[error("serial {0} timed out")]
    Timeout(&'static str),
    #[error("serial link closed")]
    Closed,
    #[error("serial i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("serial interface not accessible")]
    Unhealthy,
    #[error("host shutdown command failed: {0}")]
    ShutdownCommand(String),
}

/// Request/response client for the UPS module.
///
/// Getters never fail: a reply that does not echo the request, or any
/// transport problem, reads as zero. Once the link has failed no further
/// I/O is attempted.
pub struct UPS<S = SerialStream> {
    link: SerialTransport<S>,
    buffer: [u8; MAX_FRAME_LENGTH],
    mismatches: u32,
}

impl UPS<SerialStream> {
    pub fn connect(path: &str, baud_rate: u32, timeout: Duration) -> Result<Self, UPSError> {
        Ok(UPS::new(SerialTransport::open(path, baud_rate, timeout)?))
    }
}

impl<S> UPS<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(link: SerialTransport<S>) -> Self {
        UPS {
            link,
            buffer: [0; MAX_FRAME_LENGTH],
            mismatches: 0,
        }
    }

    pub fn is_healthy(&mut self) -> bool {
        self.link.is_healthy()
    }

    async fn transact(&mut self, index: CommandIndex, command: Command) -> Option<Frame<'_>> {
        if self.link.has_failed() {
            return None;
        }

        // Make sure a late reply to an earlier request isn't taken for ours.
        self.link.discard_pending().await;
        self.link.write(&encode_request(index, command)).await.ok()?;
        let len = self.link.read(&mut self.buffer).await.ok()?;

        match Frame::parse(&self.buffer[..len]) {
            Some(frame) if frame.echoes(command) => Some(frame),
            other => {
                debug!("Unexpected reply to {:?}: {:?}", command, other);
                self.mismatches += 1;
                None
            }
        }
    }

    /// 8 or 16 bit register.
    pub async fn get_short(&mut self, command: Command) -> i16 {
        self.transact(command.index(), command)
            .await
            .map_or(0, |frame| frame.short())
    }

    async fn get_value(&mut self, command: Command) -> i32 {
        self.get_short(command).await.into()
    }

    /// 32 bit register.
    pub async fn get_int(&mut self, command: Command) -> i32 {
        self.transact(command.index(), command)
            .await
            .map_or(0, |frame| frame.int())
    }

    pub async fn get_string(&mut self, command: Command) -> String {
        self.transact(CommandIndex::Direct, command)
            .await
            .map(|frame| frame.text(IDENTITY_LEN))
            .unwrap_or_default()
    }

    async fn get_device_status(&mut self) -> Option<DeviceStatus> {
        let command = Command::DeviceStatus;
        self.transact(command.index(), command)
            .await
            .filter(|frame| matches!(frame.size, 4 | 5))
            .map(|frame| DeviceStatus::from_raw(frame.short() as u8))
    }

    /// Reads a full status snapshot, one command after another.
    pub async fn poll_status(&mut self) -> UPSStatus {
        self.mismatches = 0;

        let input_voltage = self.get_value(Command::InputVoltage).await;
        let input_current = self.get_value(Command::InputCurrent).await;
        let output_voltage = self.get_value(Command::OutputVoltage).await;
        let output_current = self.get_value(Command::OutputCurrent).await;
        let battery_current = self.get_value(Command::BatteryCurrent).await;
        let battery_voltage = self.get_value(Command::BatteryVoltage).await;
        let vcap_voltage = [
            self.get_value(Command::Vcap1Voltage).await,
            self.get_value(Command::Vcap2Voltage).await,
            self.get_value(Command::Vcap3Voltage).await,
            self.get_value(Command::Vcap4Voltage).await,
        ];
        let capacity = self.get_int(Command::Capacity).await;
        let esr = self.get_value(Command::Esr).await;
        let charge_status = ChargeStatus::from_raw(self.get_short(Command::ChargeStatus).await as u16);
        let monitor_status = MonitorStatus::from_raw(self.get_short(Command::MonitorStatus).await as u16);
        let device_status = self.get_device_status().await;
        let soc = self.get_value(Command::StateOfCharge).await;
        let uc_temperature = self.get_value(Command::ControllerTemperature).await;

        let battery_type = self.get_string(Command::BatteryType).await;
        let firmware = self.get_string(Command::Firmware).await;
        let series = self.get_string(Command::Series).await;
        let hw_revision = self.get_string(Command::HardwareRevision).await;

        UPSStatus {
            input_voltage,
            input_current,
            output_voltage,
            output_current,
            battery_voltage,
            battery_current,
            vcap_voltage,
            capacity,
            esr,
            soc,
            uc_temperature,
            device_status: device_status.unwrap_or_default(),
            charge_status,
            monitor_status,
            series,
            firmware,
            battery_type,
            hw_revision,
            device_status_valid: device_status.is_some(),
            mismatches: self.mismatches,
        }
    }

    /// Starts a capacitance/ESR measurement. The only acknowledgement is the
    /// monitor status `ESR_MEASURING` flag on a later poll.
    pub async fn start_capacitor_test(&mut self) {
        let command = Command::StartCapEsrMeasurement;
        self.transact(command.index(), command).await;
    }
}
