//! WebSocket handler — board sync transport.
//!
//! DESIGN
//! ======
//! On upgrade, generates a client ID and enters a `select!` loop:
//! - Incoming client frames → parse + dispatch by syscall
//! - `board:patched` events for the joined board → forward to client
//!
//! Handlers validate, call into the services and return an `Outcome`. They
//! never send frames themselves; change events reach every subscriber,
//! the sender included, through the broadcaster's queue.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → send `session:connected` with `client_id`
//! 2. `board:join` → subscribe + reply with the full snapshot
//! 3. `board:mutate` → mutation service → reply with the updated board
//! 4. Close → unsubscribe

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::frame::{Data, FRAME_CODE, FRAME_MESSAGE, Frame, Status};
use crate::protocol::{self, Mutation, SYSCALL_CONNECTED};
use crate::services::{broadcast, mutation};
use crate::state::AppState;

// =============================================================================
// OUTCOME
// =============================================================================

/// What the dispatch layer sends back to the requesting client.
#[derive(Debug)]
enum Outcome {
    /// Send done+data to sender.
    Reply(Data),
    /// Send empty done to sender.
    Done,
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_ws(socket, state))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState) {
    let client_id = Uuid::new_v4();
    let (client_tx, mut client_rx) = mpsc::channel::<Frame>(state.config.client_channel_capacity);

    let welcome = Frame::request(SYSCALL_CONNECTED, Data::new()).with_data("client_id", client_id.to_string());
    if send_frame(&mut socket, &welcome).await.is_err() {
        return;
    }
    info!(%client_id, "ws: client connected");

    let mut current_board: Option<Uuid> = None;

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        let replies = process_inbound_text(&state, &mut current_board, client_id, &client_tx, &text).await;
                        for frame in replies {
                            let _ = send_frame(&mut socket, &frame).await;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(frame) = client_rx.recv() => {
                if send_frame(&mut socket, &frame).await.is_err() {
                    break;
                }
            }
        }
    }

    if let Some(board_id) = current_board {
        broadcast::unsubscribe(&state, board_id, client_id).await;
    }
    info!(%client_id, "ws: client disconnected");
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Parse and process one inbound text frame and return frames for the sender.
///
/// Kept apart from the socket so tests can drive dispatch with plain
/// channels.
async fn process_inbound_text(
    state: &AppState,
    current_board: &mut Option<Uuid>,
    client_id: Uuid,
    client_tx: &mpsc::Sender<Frame>,
    text: &str,
) -> Vec<Frame> {
    let mut req: Frame = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            warn!(%client_id, error = %e, "ws: invalid inbound frame");
            let err = Frame::request("gateway:error", Data::new()).with_data(FRAME_MESSAGE, format!("invalid json: {e}"));
            return vec![err];
        }
    };
    req.from = Some(client_id.to_string());
    info!(%client_id, id = %req.id, syscall = %req.syscall, status = ?req.status, "ws: recv frame");

    let prefix = req.prefix().to_owned();
    let result = match prefix.as_str() {
        "board" => handle_board(state, current_board, client_id, client_tx, &mut req).await,
        _ => Err(req.error(format!("unknown prefix: {prefix}"))),
    };

    match result {
        Ok(Outcome::Reply(data)) => vec![req.done_with(data)],
        Ok(Outcome::Done) => vec![req.done()],
        Err(err_frame) => vec![err_frame],
    }
}

// =============================================================================
// BOARD HANDLERS
// =============================================================================

async fn handle_board(
    state: &AppState,
    current_board: &mut Option<Uuid>,
    client_id: Uuid,
    client_tx: &mpsc::Sender<Frame>,
    req: &mut Frame,
) -> Result<Outcome, Frame> {
    let op = req.op().to_owned();
    match op.as_str() {
        "create" => {
            let name = req
                .data
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or("Untitled Board")
                .to_owned();
            let owner_id = req
                .data
                .get("owner_id")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse().ok());
            match mutation::create_board(state, &name, owner_id).await {
                Ok(board) => Ok(Outcome::Reply(protocol::board_data(&board))),
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "get" => {
            let Some(board_id) = req.target_board().or(*current_board) else {
                return Err(req.error_from(&protocol::ProtocolError::MissingBoardId));
            };
            match mutation::get_board(state, board_id).await {
                Ok(board) => Ok(Outcome::Reply(protocol::board_data(&board))),
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "join" => {
            let Some(board_id) = req.target_board() else {
                return Err(req.error_from(&protocol::ProtocolError::MissingBoardId));
            };

            if let Some(old_board) = current_board.take() {
                broadcast::unsubscribe(state, old_board, client_id).await;
            }

            // Subscribe before reading so no write can fall between the
            // snapshot and the first event.
            broadcast::subscribe(state, board_id, client_id, client_tx.clone()).await;
            match mutation::get_board(state, board_id).await {
                Ok(board) => {
                    *current_board = Some(board_id);
                    Ok(Outcome::Reply(protocol::board_data(&board)))
                }
                Err(e) => {
                    broadcast::unsubscribe(state, board_id, client_id).await;
                    Err(req.error_from(&e))
                }
            }
        }
        "part" => {
            if let Some(board_id) = current_board.take() {
                broadcast::unsubscribe(state, board_id, client_id).await;
            }
            Ok(Outcome::Done)
        }
        "mutate" => {
            if req.target_board().is_none() {
                req.board_id = *current_board;
            }
            let (board_id, change) = Mutation::from_frame(req).map_err(|e| req.error_from(&e))?;
            match mutation::apply(state, board_id, change).await {
                Ok(board) => Ok(Outcome::Reply(protocol::board_data(&board))),
                Err(e) => Err(req.error_from(&e)),
            }
        }
        _ => Err(req.error(format!("unknown board op: {op}"))),
    }
}

// =============================================================================
// SEND
// =============================================================================

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), ()> {
    let json = match serde_json::to_string(frame) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize frame");
            return Err(());
        }
    };
    if frame.status == Status::Error {
        let code = frame.data.get(FRAME_CODE).and_then(|v| v.as_str()).unwrap_or("-");
        let message = frame.data.get(FRAME_MESSAGE).and_then(|v| v.as_str()).unwrap_or("-");
        warn!(id = %frame.id, syscall = %frame.syscall, code, message, "ws: send frame status=Error");
    } else {
        info!(id = %frame.id, syscall = %frame.syscall, status = ?frame.status, "ws: send frame");
    }
    socket.send(Message::Text(json.into())).await.map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
