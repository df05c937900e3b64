//! Live status relay for browser dashboards over WebSocket.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::apc::load_percent;
use crate::settings::NominalConfig;
use crate::status::Snapshot;

pub const SUBPROTOCOL: &str = "broadcast";
const CAPACITOR_TEST: &str = "capesr";

/// Requests from relay clients, executed by the poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorCommand {
    StartCapacitorTest,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastPayload {
    pub input_voltage: f64,
    pub output_voltage: f64,
    pub battery_voltage: f64,
    pub vcap1_voltage: f64,
    pub vcap2_voltage: f64,
    pub vcap3_voltage: f64,
    pub vcap4_voltage: f64,
    pub input_current: i32,
    pub output_current: i32,
    pub battery_current: i32,
    pub uc_temperature: i32,
    pub capacity: i32,
    pub esr: i32,
    pub soc: i32,
    pub charge_status: u16,
    pub monitor_status: u16,
    pub device_status: u8,
    pub battery_type: String,
    pub series: String,
    pub firmware: String,
    pub hw_revision: String,
    pub power_fail_count: u32,
    /// Percent of rated output current.
    pub output_load: u32,
    /// Seconds since the service started.
    pub uptime: u64,
    /// Seconds, 0 while unknown.
    pub remain_time: u64,
}

fn volts(milli: i32) -> f64 {
    f64::from(milli) / 1000.0
}

impl BroadcastPayload {
    pub fn new(snapshot: &Snapshot, nominal: &NominalConfig, uptime: u64) -> Self {
        let status = &snapshot.status;
        BroadcastPayload {
            input_voltage: volts(status.input_voltage),
            output_voltage: volts(status.output_voltage),
            battery_voltage: volts(status.battery_voltage),
            vcap1_voltage: volts(status.vcap_voltage[0]),
            vcap2_voltage: volts(status.vcap_voltage[1]),
            vcap3_voltage: volts(status.vcap_voltage[2]),
            vcap4_voltage: volts(status.vcap_voltage[3]),
            input_current: status.input_current,
            output_current: status.output_current,
            battery_current: status.battery_current,
            uc_temperature: status.uc_temperature,
            capacity: status.capacity,
            esr: status.esr,
            soc: status.soc,
            charge_status: status.charge_status.bits(),
            monitor_status: status.monitor_status.bits(),
            device_status: status.device_status.bits(),
            battery_type: status.battery_type.clone(),
            series: status.series.clone(),
            firmware: status.firmware.clone(),
            hw_revision: status.hw_revision.clone(),
            power_fail_count: snapshot.power.fail_count,
            output_load: load_percent(status.output_current, nominal.max_current),
            uptime,
            remain_time: snapshot.power.remaining.unwrap_or(0),
        }
    }
}

#[derive(Deserialize)]
struct ClientRequest {
    cmd: String,
}

/// Accepts `capesr` either bare or as `{"cmd":"capesr"}`.
fn parse_command(text: &str) -> Option<MonitorCommand> {
    let text = text.trim();
    let cmd = match serde_json::from_str::<ClientRequest>(text) {
        Ok(request) => request.cmd,
        Err(_) => text.to_string(),
    };
    match cmd.as_str() {
        CAPACITOR_TEST => Some(MonitorCommand::StartCapacitorTest),
        _ => None,
    }
}

/// Latest serialized payload. Clients that fall behind skip straight to
/// the newest one.
#[derive(Clone)]
pub struct Relay {
    latest: Arc<watch::Sender<String>>,
}

impl Default for Relay {
    fn default() -> Self {
        Relay {
            latest: Arc::new(watch::channel(String::new()).0),
        }
    }
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, payload: &BroadcastPayload) {
        match serde_json::to_string(payload) {
            Ok(json) => {
                self.latest.send_replace(json);
            }
            Err(e) => warn!("Failed to serialize status: {}", e),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<String> {
        self.latest.subscribe()
    }
}

/// Decrements the client count when a session ends.
struct ClientSlot(Arc<AtomicUsize>);

impl Drop for ClientSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn offers_subprotocol(request: &Request) -> bool {
    request
        .headers()
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|protocol| protocol.trim() == SUBPROTOCOL)
}

/// Completes the WebSocket handshake, selecting the `broadcast`
/// subprotocol when the client offers it.
pub async fn accept<S>(stream: S) -> Result<WebSocketStream<S>, tungstenite::Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        if offers_subprotocol(request) {
            response
                .headers_mut()
                .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));
        }
        Ok(response)
    };
    tokio_tungstenite::accept_hdr_async(stream, callback).await
}

/// Streams payloads to one client until it leaves or the service stops.
/// A command that finds another one still queued is dropped.
pub async fn serve_client<S>(
    ws: WebSocketStream<S>,
    relay: Relay,
    commands: mpsc::Sender<MonitorCommand>,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut source) = ws.split();
    let mut updates = relay.subscribe();

    let current = updates.borrow_and_update().clone();
    if !current.is_empty() && sink.send(Message::Text(current)).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let json = updates.borrow_and_update().clone();
                if sink.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            message = source.next() => match message {
                Some(Ok(Message::Text(text))) => match parse_command(&text) {
                    Some(command) => match commands.try_send(command) {
                        Ok(()) => info!("Client requested {:?}.", command),
                        Err(TrySendError::Full(_)) => {
                            debug!("{:?} already queued, ignoring repeat.", command)
                        }
                        Err(TrySendError::Closed(_)) => break,
                    },
                    None => debug!("Ignoring client message {:?}.", text),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Client connection failed: {}", e);
                    break;
                }
            },
        }
    }
}

pub async fn server(
    listener: TcpListener,
    relay: Relay,
    max_clients: usize,
    commands: mpsc::Sender<MonitorCommand>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    info!("Relay listening on {}.", listener.local_addr()?);
    let clients = Arc::new(AtomicUsize::new(0));

    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Relay accept failed: {}", e);
                    continue;
                }
            },
        };

        if clients.load(Ordering::SeqCst) >= max_clients {
            warn!("{} clients already connected, rejecting {}.", max_clients, peer);
            continue;
        }
        clients.fetch_add(1, Ordering::SeqCst);
        let slot = ClientSlot(clients.clone());

        let relay = relay.clone();
        let commands = commands.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _slot = slot;
            match accept(stream).await {
                Ok(ws) => {
                    info!("Client {} connected.", peer);
                    serve_client(ws, relay, commands, cancel).await;
                    info!("Client {} disconnected.", peer);
                }
                Err(e) => debug!("Handshake with {} failed: {}", peer, e),
            }
        });
    }

    Ok(())
}
