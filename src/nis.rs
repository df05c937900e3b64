//! Network information server: streams the status report to apcupsd
//! clients such as `apcaccess`.
//!
//! A client sends `00 06 "status"`. The server answers with one frame per
//! report line (`00 <len> <line>`), a terminating `00 00`, and closes the
//! connection. Any other request closes the connection without output, as
//! does a status request with more bytes already queued behind it.
//!
//! The request is read off a byte stream, so a partial token holds the
//! session until `REQUEST_TIMEOUT` runs out. Bytes that arrive after the
//! token has been checked are not looked at.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::apc::{Report, ReportStore, MAX_LINE_LEN};

pub const STATUS_REQUEST: &[u8; 8] = b"\x00\x06status";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Private copy of the report lines still to be sent.
struct ReportCursor {
    lines: VecDeque<String>,
}

impl ReportCursor {
    fn new(report: &Report) -> Self {
        ReportCursor {
            lines: report.lines().map(str::to_string).collect(),
        }
    }

    fn next_frame(&mut self) -> Option<Vec<u8>> {
        self.lines.pop_front().map(|line| frame(&line))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The report was sent, with this many line frames.
    Delivered(usize),
    /// The request was not a status request.
    Rejected,
    /// The client went quiet or disappeared.
    Aborted,
}

enum DeliveryState {
    AwaitingRequest,
    Sending(ReportCursor),
    Closed(SessionEnd),
}

fn frame(line: &str) -> Vec<u8> {
    let bytes = &line.as_bytes()[..line.len().min(MAX_LINE_LEN)];
    let mut out = Vec::with_capacity(bytes.len() + 2);
    out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(bytes);
    out
}

async fn read_request<S>(stream: &mut S) -> Option<bool>
where
    S: AsyncRead + Unpin,
{
    let len = stream.read_u16().await.ok()?;
    if usize::from(len) != STATUS_REQUEST.len() - 2 {
        return Some(false);
    }
    let mut command = [0u8; 6];
    stream.read_exact(&mut command).await.ok()?;
    if command != STATUS_REQUEST[2..] {
        return Some(false);
    }
    // Only input that is already buffered counts as trailing.
    let mut extra = [0u8; 1];
    match timeout(Duration::ZERO, stream.read(&mut extra)).await {
        Ok(Ok(n)) if n > 0 => Some(false),
        _ => Some(true),
    }
}

async fn write_frame<S>(stream: &mut S, frame: &[u8]) -> bool
where
    S: AsyncWrite + Unpin,
{
    matches!(timeout(WRITE_TIMEOUT, stream.write_all(frame)).await, Ok(Ok(())))
}

/// Runs one client session to completion.
pub async fn serve_session<S>(mut stream: S, reports: ReportStore) -> SessionEnd
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut state = DeliveryState::AwaitingRequest;
    let mut lock = None;
    let mut sent = 0;

    let end = loop {
        state = match state {
            DeliveryState::AwaitingRequest => {
                match timeout(REQUEST_TIMEOUT, read_request(&mut stream)).await {
                    Ok(Some(true)) => {
                        let report = reports.checkout().await;
                        if report.is_empty() {
                            debug!("No report yet, sending terminator only.");
                        }
                        let cursor = ReportCursor::new(&report);
                        lock = Some(report);
                        DeliveryState::Sending(cursor)
                    }
                    Ok(Some(false)) => DeliveryState::Closed(SessionEnd::Rejected),
                    _ => DeliveryState::Closed(SessionEnd::Aborted),
                }
            }
            DeliveryState::Sending(mut cursor) => match cursor.next_frame() {
                Some(framed) => {
                    if write_frame(&mut stream, &framed).await {
                        sent += 1;
                        DeliveryState::Sending(cursor)
                    } else {
                        DeliveryState::Closed(SessionEnd::Aborted)
                    }
                }
                None => {
                    if write_frame(&mut stream, &[0, 0]).await {
                        DeliveryState::Closed(SessionEnd::Delivered(sent))
                    } else {
                        DeliveryState::Closed(SessionEnd::Aborted)
                    }
                }
            },
            DeliveryState::Closed(end) => break end,
        };
    };

    let _ = stream.shutdown().await;
    // Releases the report for the next refresh.
    drop(lock);
    end
}

pub async fn server(
    listener: TcpListener,
    reports: ReportStore,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    info!("Status server listening on {}.", listener.local_addr()?);

    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Status server accept failed: {}", e);
                    continue;
                }
            },
        };

        let reports = reports.clone();
        tokio::spawn(async move {
            let end = serve_session(stream, reports).await;
            debug!("Status session with {} ended: {:?}", peer, end);
        });
    }

    Ok(())
}
