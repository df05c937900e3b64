//! Frame layout for the UPSIC serial protocol.
//!
//! Request:  SOH, 0x03, index, command, EOT
//! Response: SOH, size, index, command, data...
//!
//! `size` counts itself plus index and command, so a response carries
//! `size - 3` data bytes and is `size + 1` bytes long in total.

pub const SOH: u8 = 0x01; // Start of header
pub const EOT: u8 = 0x04; // End of transmission
const REQUEST_LEN: u8 = 0x03;

pub const REQUEST_SIZE: usize = 5;
pub const RESPONSE_HEADER_SIZE: usize = 4;

// Identity strings are fixed 20 byte fields on the device.
pub const IDENTITY_LEN: usize = 20;

/// Command tables understood by the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandIndex {
    /// Registers of the UPS controller itself.
    Direct = 0x01,
    /// Pass-through reads of the LTC3350 capacitor controller.
    PassThrough = 0x03,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    ChargeStatus,
    MonitorStatus,
    Capacity,
    Esr,
    Vcap1Voltage,
    Vcap2Voltage,
    Vcap3Voltage,
    Vcap4Voltage,
    StartCapEsrMeasurement,
    DeviceStatus,
    InputVoltage,
    InputCurrent,
    OutputVoltage,
    OutputCurrent,
    BatteryVoltage,
    BatteryCurrent,
    StateOfCharge,
    Series,
    Firmware,
    BatteryType,
    ControllerTemperature,
    HardwareRevision,
}

impl Command {
    pub fn code(self) -> u8 {
        match self {
            Command::ChargeStatus => 0x1B,
            Command::MonitorStatus => 0x1C,
            Command::Capacity => 0x1E,
            Command::Esr => 0x1F,
            Command::Vcap1Voltage => 0x20,
            Command::Vcap2Voltage => 0x21,
            Command::Vcap3Voltage => 0x22,
            Command::Vcap4Voltage => 0x23,
            Command::StartCapEsrMeasurement => 0x31,
            Command::DeviceStatus => 0x40,
            Command::InputVoltage => 0x41,
            Command::InputCurrent => 0x42,
            Command::OutputVoltage => 0x43,
            Command::OutputCurrent => 0x44,
            Command::BatteryVoltage => 0x45,
            Command::BatteryCurrent => 0x46,
            Command::StateOfCharge => 0x47,
            Command::Series => 0x62,
            Command::Firmware => 0x63,
            Command::BatteryType => 0x64,
            Command::ControllerTemperature => 0x66,
            Command::HardwareRevision => 0x67,
        }
    }

    pub fn index(self) -> CommandIndex {
        if self.code() < 0x40 {
            CommandIndex::PassThrough
        } else {
            CommandIndex::Direct
        }
    }
}

/// Encodes a request frame. Strings are always requested through the direct table.
pub fn encode_request(index: CommandIndex, command: Command) -> [u8; REQUEST_SIZE] {
    [SOH, REQUEST_LEN, index as u8, command.code(), EOT]
}

/// A response frame borrowed from the receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub size: u8,
    pub command: u8,
    pub data: &'a [u8],
}

impl<'a> Frame<'a> {
    /// Splits raw bytes into a frame. Returns `None` on a short read or a
    /// missing start-of-header byte. Data is bounded by both the declared
    /// size and the bytes actually received.
    pub fn parse(bytes: &'a [u8]) -> Option<Frame<'a>> {
        if bytes.len() < RESPONSE_HEADER_SIZE || bytes[0] != SOH {
            return None;
        }
        let size = bytes[1];
        let end = (size as usize + 1).clamp(RESPONSE_HEADER_SIZE, bytes.len());
        Some(Frame {
            size,
            command: bytes[3],
            data: &bytes[RESPONSE_HEADER_SIZE..end],
        })
    }

    pub fn echoes(&self, command: Command) -> bool {
        self.command == command.code()
    }

    /// 8 bit (sign extended) or 16 bit little-endian value, 0 for any other size.
    pub fn short(&self) -> i16 {
        match (self.size, self.data) {
            (4, [b0, ..]) => *b0 as i8 as i16,
            (5, [b0, b1, ..]) => i16::from_le_bytes([*b0, *b1]),
            _ => 0,
        }
    }

    /// 32 bit little-endian value, 0 for any other size.
    pub fn int(&self) -> i32 {
        match (self.size, self.data) {
            (7, [b0, b1, b2, b3, ..]) => i32::from_le_bytes([*b0, *b1, *b2, *b3]),
            _ => 0,
        }
    }

    /// Fixed length identity string. Frames shorter than size 7 carry no text.
    /// Control characters read as spaces.
    pub fn text(&self, capacity: usize) -> String {
        if self.size < 7 {
            return String::new();
        }
        let len = self.data.len().min(capacity);
        let raw = &self.data[..len];
        let raw = match raw.iter().position(|&b| b == 0) {
            Some(nul) => &raw[..nul],
            None => raw,
        };
        String::from_utf8_lossy(raw)
            .chars()
            .map(|c| if c.is_control() { ' ' } else { c })
            .collect::<String>()
            .trim_end()
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn frame(size: u8, command: u8, data: &[u8]) -> Vec<u8> {
        let mut bytes = vec![SOH, size, CommandIndex::Direct as u8, command];
        bytes.extend_from_slice(data);
        bytes
    }

    #[test]
    fn request_layout() {
        assert_eq!(
            encode_request(CommandIndex::PassThrough, Command::Vcap1Voltage),
            [0x01, 0x03, 0x03, 0x20, 0x04]
        );
        assert_eq!(
            encode_request(Command::StateOfCharge.index(), Command::StateOfCharge),
            [0x01, 0x03, 0x01, 0x47, 0x04]
        );
    }

    #[test]
    fn command_tables() {
        assert_eq!(Command::Esr.index(), CommandIndex::PassThrough);
        assert_eq!(Command::StartCapEsrMeasurement.index(), CommandIndex::PassThrough);
        assert_eq!(Command::DeviceStatus.index(), CommandIndex::Direct);
        assert_eq!(Command::HardwareRevision.index(), CommandIndex::Direct);
    }

    #[rstest]
    #[case(4, &[0x7F], 127)]
    #[case(4, &[0x80], -128)]
    #[case(4, &[0xFF], -1)]
    #[case(5, &[0x34, 0x12], 0x1234)]
    #[case(5, &[0xFF, 0xFF], -1)]
    #[case(5, &[0x00, 0x80], i16::MIN)]
    fn decodes_short(#[case] size: u8, #[case] data: &[u8], #[case] expected: i16) {
        let bytes = frame(size, 0x41, data);
        assert_eq!(Frame::parse(&bytes).unwrap().short(), expected);
    }

    #[rstest]
    #[case(&[0x78, 0x56, 0x34, 0x12], 0x1234_5678)]
    #[case(&[0xFF, 0xFF, 0xFF, 0xFF], -1)]
    #[case(&[0x00, 0x00, 0x00, 0x80], i32::MIN)]
    fn decodes_int(#[case] data: &[u8], #[case] expected: i32) {
        let bytes = frame(7, 0x1E, data);
        assert_eq!(Frame::parse(&bytes).unwrap().int(), expected);
    }

    #[rstest]
    #[case(3)]
    #[case(6)]
    #[case(7)]
    #[case(8)]
    fn other_sizes_read_zero_as_short(#[case] size: u8) {
        let bytes = frame(size, 0x41, &[0x11, 0x22, 0x33, 0x44, 0x55]);
        assert_eq!(Frame::parse(&bytes).unwrap().short(), 0);
    }

    #[rstest]
    #[case(4)]
    #[case(5)]
    #[case(6)]
    #[case(9)]
    fn other_sizes_read_zero_as_int(#[case] size: u8) {
        let bytes = frame(size, 0x1E, &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        assert_eq!(Frame::parse(&bytes).unwrap().int(), 0);
    }

    #[test]
    fn truncated_data_reads_zero() {
        // Declares two data bytes but only one arrived.
        let bytes = frame(5, 0x41, &[0x34]);
        assert_eq!(Frame::parse(&bytes).unwrap().short(), 0);
    }

    #[test]
    fn rejects_short_and_unframed_input() {
        assert_eq!(Frame::parse(&[SOH, 4, 1]), None);
        assert_eq!(Frame::parse(&[0x02, 4, 1, 0x41, 9]), None);
    }

    #[test]
    fn text_is_bounded_and_stops_at_nul() {
        let bytes = frame(12, 0x64, b"UPSIC\0\0\0\0");
        assert_eq!(Frame::parse(&bytes).unwrap().text(IDENTITY_LEN), "UPSIC");

        let long = [b'A'; 30];
        let bytes = frame(33, 0x62, &long);
        assert_eq!(Frame::parse(&bytes).unwrap().text(IDENTITY_LEN).len(), IDENTITY_LEN);

        let bytes = frame(6, 0x62, b"abc");
        assert_eq!(Frame::parse(&bytes).unwrap().text(IDENTITY_LEN), "");
    }

    #[test]
    fn text_drops_control_characters() {
        let bytes = frame(23, 0x64, b"A\n\nB\r\0\0");
        assert_eq!(Frame::parse(&bytes).unwrap().text(IDENTITY_LEN), "A  B");
    }

    #[test]
    fn echo_check() {
        let bytes = frame(4, 0x47, &[50]);
        let parsed = Frame::parse(&bytes).unwrap();
        assert!(parsed.echoes(Command::StateOfCharge));
        assert!(!parsed.echoes(Command::DeviceStatus));
    }
}
