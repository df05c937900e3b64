//! Timeout bounded serial link to the UPS module.
//!
//! The link is generic over the byte stream so the device client can be driven
//! by an in-memory pipe in tests. In production it wraps a `SerialStream`
//! configured for 8-N-1, raw mode, no flow control, RTS/DTR asserted.

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, timeout_at, Instant};
use tokio_serial::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, SerialPortBuilderExt, SerialStream, StopBits};
use tracing::{debug, error};

use crate::ups::UPSError;

pub const SERIAL_TIMEOUT: Duration = Duration::from_millis(3000);

// A read only returns once this many bytes arrived, like VMIN on a tty.
const MIN_READ: usize = 4;

// Bounds the number of reads used to throw away stale input.
const MAX_DISCARD_LOOP: usize = 20;

pub struct SerialTransport<S = SerialStream> {
    stream: S,
    path: Option<PathBuf>,
    timeout: Duration,
    failed: bool,
}

impl SerialTransport<SerialStream> {
    pub fn open(path: &str, baud_rate: u32, timeout: Duration) -> Result<Self, UPSError> {
        let open_err = |source| UPSError::Open {
            path: path.to_string(),
            source,
        };

        let mut stream = tokio_serial::new(path, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(timeout)
            .open_native_async()
            .map_err(open_err)?;

        stream.clear(ClearBuffer::Input).map_err(open_err)?;
        // Kick on handshake and start reception.
        stream.write_request_to_send(true).map_err(open_err)?;
        stream.write_data_terminal_ready(true).map_err(open_err)?;

        debug!("Opened serial device {} at {} baud.", path, baud_rate);
        Ok(SerialTransport {
            path: Some(PathBuf::from(path)),
            ..SerialTransport::from_stream(stream, timeout)
        })
    }
}

impl<S> SerialTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn from_stream(stream: S, timeout: Duration) -> Self {
        SerialTransport {
            stream,
            path: None,
            timeout,
            failed: false,
        }
    }

    /// True once a read or write failed. Sticky until the link is reopened.
    pub fn has_failed(&self) -> bool {
        self.failed
    }

    /// Checks the device node is still present and no I/O error occurred.
    pub fn is_healthy(&mut self) -> bool {
        if let Some(path) = &self.path {
            if std::fs::metadata(path).is_err() {
                if !self.failed {
                    error!("Serial device {} vanished.", path.display());
                }
                self.failed = true;
            }
        }
        !self.failed
    }

    pub async fn write(&mut self, buf: &[u8]) -> Result<(), UPSError> {
        match timeout(self.timeout, self.stream.write_all(buf)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(self.fail(UPSError::Io(e))),
            Err(_) => Err(self.fail(UPSError::Timeout("write"))),
        }
    }

    /// Reads at least `MIN_READ` bytes, or whatever fits into `buf` if that
    /// is smaller. Returns the number of bytes read.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, UPSError> {
        let deadline = Instant::now() + self.timeout;
        let wanted = MIN_READ.min(buf.len());
        let mut filled = 0;

        while filled < wanted {
            match timeout_at(deadline, self.stream.read(&mut buf[filled..])).await {
                Ok(Ok(0)) => return Err(self.fail(UPSError::Closed)),
                Ok(Ok(n)) => filled += n,
                Ok(Err(e)) => return Err(self.fail(UPSError::Io(e))),
                Err(_) => return Err(self.fail(UPSError::Timeout("read"))),
            }
        }

        Ok(filled)
    }

    /// Throws away bytes already waiting on the link without blocking.
    pub async fn discard_pending(&mut self) {
        let mut scratch = [0u8; 64];
        for _ in 0..MAX_DISCARD_LOOP {
            match timeout(Duration::ZERO, self.stream.read(&mut scratch)).await {
                Ok(Ok(n)) if n > 0 => debug!("Discarded {} stale bytes.", n),
                _ => break,
            }
        }
    }

    fn fail(&mut self, err: UPSError) -> UPSError {
        error!("Serial link error: {}", err);
        self.failed = true;
        err
    }
}
