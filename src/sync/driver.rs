//! Websocket client driver — runs a `SyncEngine` against a live server.
//!
//! DESIGN
//! ======
//! One session is one websocket connection: connect, `board:join`, then a
//! `select!` loop over inbound frames, UI commands, the engine tick, and a
//! periodic resync. Every mutation sent is remembered by request id so an
//! error reply can be handed back to the engine as a rejection.
//!
//! RECONNECT
//! =========
//! When a session ends without shutdown the engine drops its local intent
//! and the driver reconnects after a linearly growing delay. The join reply
//! is the fresh snapshot. The driver returns when the command channel
//! closes.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::doc::Board;
use crate::frame::{Data, ErrorCode, FRAME_MESSAGE, Frame, Status};
use crate::protocol::{self, BoardPatched, Mutation, SYSCALL_CONNECTED, SYSCALL_GET, SYSCALL_JOIN, SYSCALL_PATCHED};
use crate::sync::engine::{Command, Rejection, SyncEngine};

const DEFAULT_TICK_MS: u64 = 50;
const DEFAULT_RESYNC_SECS: u64 = 30;
const DEFAULT_RECONNECT_DELAY_MS: u64 = 500;
const DEFAULT_MAX_RECONNECT_DELAY_MS: u64 = 10_000;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Websocket endpoint, e.g. `ws://localhost:3000/api/ws`.
    pub url: String,
    pub tick_interval: Duration,
    /// How often a full snapshot is requested to recover missed events.
    pub resync_interval: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
}

impl DriverConfig {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            tick_interval: Duration::from_millis(DEFAULT_TICK_MS),
            resync_interval: Duration::from_secs(DEFAULT_RESYNC_SECS),
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            max_reconnect_delay: Duration::from_millis(DEFAULT_MAX_RECONNECT_DELAY_MS),
        }
    }

    /// Delay before reconnect attempt `failures + 1`.
    #[must_use]
    pub fn backoff(&self, failures: u32) -> Duration {
        self.reconnect_delay
            .saturating_mul(failures.saturating_add(1))
            .min(self.max_reconnect_delay)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("websocket connect failed: {0}")]
    Connect(Box<tungstenite::Error>),
    #[error("websocket closed")]
    Closed,
    #[error("frame decode failed: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("join rejected: {0}")]
    JoinRejected(String),
}

impl ErrorCode for DriverError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Connect(_) => "E_WS_CONNECT",
            Self::Closed => "E_WS_CLOSED",
            Self::Decode(_) => "E_DECODE",
            Self::JoinRejected(_) => "E_JOIN_REJECTED",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Closed)
    }
}

/// Updates for the UI.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    /// The working copy changed.
    Board(Board),
    /// A write was given up on.
    Notice(crate::sync::engine::Notice),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Shutdown,
    Disconnected,
}

/// Mutations sent and not yet answered, by request id.
type InFlight = HashMap<Uuid, Mutation>;

// =============================================================================
// RUN
// =============================================================================

/// Drive `engine` until `commands` closes, reconnecting as needed.
///
/// # Errors
///
/// Non-retryable failures only: a rejected join or an undecodable frame.
pub async fn run(
    config: DriverConfig,
    mut engine: SyncEngine,
    mut commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<DriverEvent>,
) -> Result<SyncEngine, DriverError> {
    let mut failures: u32 = 0;
    loop {
        match session(&config, &mut engine, &mut commands, &events).await {
            Ok(SessionEnd::Shutdown) => return Ok(engine),
            Ok(SessionEnd::Disconnected) => failures = 0,
            Err(e) if e.retryable() => {
                warn!(board_id = %engine.board_id(), error = %e, failures, "sync: session failed");
                failures = failures.saturating_add(1);
            }
            Err(e) => return Err(e),
        }
        engine.reset_for_reconnect();
        let delay = config.backoff(failures);
        info!(board_id = %engine.board_id(), delay_ms = delay.as_millis(), "sync: reconnecting");
        tokio::time::sleep(delay).await;
    }
}

async fn session(
    config: &DriverConfig,
    engine: &mut SyncEngine,
    commands: &mut mpsc::Receiver<Command>,
    events: &mpsc::Sender<DriverEvent>,
) -> Result<SessionEnd, DriverError> {
    let (socket, _) = connect_async(config.url.as_str())
        .await
        .map_err(|e| DriverError::Connect(Box::new(e)))?;
    let (mut sink, mut stream) = socket.split();
    let board_id = engine.board_id();
    info!(%board_id, url = %config.url, "sync: connected");

    let join = Frame::request(SYSCALL_JOIN, Data::new()).with_board_id(board_id);
    send_frame(&mut sink, &join).await?;
    engine.take_resync_request();

    let mut in_flight = InFlight::new();
    let mut ticker = tokio::time::interval(config.tick_interval);
    let mut resync = tokio::time::interval_at(
        tokio::time::Instant::now() + config.resync_interval,
        config.resync_interval,
    );

    loop {
        tokio::select! {
            msg = stream.next() => {
                let Some(Ok(msg)) = msg else { return Ok(SessionEnd::Disconnected) };
                match msg {
                    Message::Text(text) => {
                        let frame: Frame = match serde_json::from_str(text.as_str()) {
                            Ok(f) => f,
                            Err(e) => {
                                warn!(%board_id, error = %e, "sync: undecodable frame");
                                continue;
                            }
                        };
                        let now = tokio::time::Instant::now().into_std();
                        if route_frame(engine, &frame, join.id, &mut in_flight, now)? {
                            publish_board(engine, events).await;
                        }
                    }
                    Message::Close(_) => return Ok(SessionEnd::Disconnected),
                    _ => {}
                }
            }
            command = commands.recv() => {
                let Some(command) = command else {
                    let _ = sink.close().await;
                    info!(%board_id, "sync: shutting down");
                    return Ok(SessionEnd::Shutdown);
                };
                let now = tokio::time::Instant::now().into_std();
                if let Err(e) = engine.execute(command, now) {
                    warn!(%board_id, error = %e, "sync: command refused");
                }
                send_outbox(&mut sink, engine, &mut in_flight).await?;
                publish_board(engine, events).await;
            }
            _ = ticker.tick() => {
                let now = tokio::time::Instant::now().into_std();
                engine.tick(now);
                if engine.take_resync_request() {
                    let get = Frame::request(SYSCALL_GET, Data::new()).with_board_id(board_id);
                    send_frame(&mut sink, &get).await?;
                }
                send_outbox(&mut sink, engine, &mut in_flight).await?;
                for notice in engine.drain_notices() {
                    let _ = events.send(DriverEvent::Notice(notice)).await;
                }
            }
            _ = resync.tick() => engine.request_resync(),
        }
    }
}

// =============================================================================
// INBOUND
// =============================================================================

/// Apply one inbound frame to the engine. Returns whether the working copy
/// may have changed.
///
/// # Errors
///
/// `JoinRejected` when the server refuses the join.
fn route_frame(
    engine: &mut SyncEngine,
    frame: &Frame,
    join_id: Uuid,
    in_flight: &mut InFlight,
    now: std::time::Instant,
) -> Result<bool, DriverError> {
    if frame.syscall == SYSCALL_PATCHED {
        return match BoardPatched::from_frame(frame) {
            Ok(event) => {
                engine.apply_snapshot(event.board, now);
                Ok(true)
            }
            Err(e) => {
                warn!(error = %e, "sync: bad board:patched payload");
                Ok(false)
            }
        };
    }
    if frame.syscall == SYSCALL_CONNECTED {
        debug!(client_id = ?frame.data.get("client_id"), "sync: session established");
        return Ok(false);
    }

    let Some(parent_id) = frame.parent_id else {
        return Ok(false);
    };
    let sent = in_flight.remove(&parent_id);
    match frame.status {
        Status::Done => match protocol::board_from_data(&frame.data) {
            Ok(board) => {
                engine.apply_snapshot(board, now);
                Ok(true)
            }
            Err(_) => Ok(false),
        },
        Status::Error if parent_id == join_id => {
            let message = frame
                .data
                .get(FRAME_MESSAGE)
                .and_then(|v| v.as_str())
                .unwrap_or("join failed");
            Err(DriverError::JoinRejected(message.to_owned()))
        }
        Status::Error => {
            if let Some(mutation) = sent {
                engine.reject(mutation, &Rejection::from_frame(frame), now);
                return Ok(true);
            }
            warn!(syscall = %frame.syscall, code = frame.error_code().unwrap_or("-"), "sync: unmatched error reply");
            Ok(false)
        }
        Status::Request => Ok(false),
    }
}

// =============================================================================
// OUTBOUND
// =============================================================================

async fn send_outbox<S>(sink: &mut S, engine: &mut SyncEngine, in_flight: &mut InFlight) -> Result<(), DriverError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let board_id = engine.board_id();
    for mutation in engine.drain_outbox() {
        let frame = mutation.to_frame(board_id);
        debug!(%board_id, id = %frame.id, action = mutation.action(), "sync: send mutation");
        in_flight.insert(frame.id, mutation);
        send_frame(sink, &frame).await?;
    }
    Ok(())
}

async fn send_frame<S>(sink: &mut S, frame: &Frame) -> Result<(), DriverError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let json = serde_json::to_string(frame)?;
    sink.send(Message::text(json)).await.map_err(|_| DriverError::Closed)
}

async fn publish_board(engine: &SyncEngine, events: &mpsc::Sender<DriverEvent>) {
    if let Some(board) = engine.board() {
        let _ = events.send(DriverEvent::Board(board.clone())).await;
    }
}

#[cfg(test)]
#[path = "driver_test.rs"]
mod tests;
