//! Event broadcaster — board subscriptions and `board:patched` fan-out.
//!
//! DESIGN
//! ======
//! Each subscriber owns a bounded `mpsc` queue drained by its connection
//! task. `publish` delivers the full board to every subscriber of that
//! board, the originating client included: the originator relies on its own
//! echo to release pending local edits.
//!
//! Delivery is at-most-once and never blocks the mutation that triggered
//! it. A full or closed queue drops the frame for that subscriber only;
//! clients recover through resync on reconnect.

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::doc::Board;
use crate::frame::Frame;
use crate::protocol::BoardPatched;
use crate::state::{AppState, BoardState};

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub dropped: usize,
}

// =============================================================================
// SUBSCRIBE / UNSUBSCRIBE
// =============================================================================

/// Register a client's outbound queue for a board's events.
pub async fn subscribe(state: &AppState, board_id: Uuid, client_id: Uuid, tx: mpsc::Sender<Frame>) {
    let mut boards = state.boards.write().await;
    let board_state = boards.entry(board_id).or_insert_with(BoardState::new);
    board_state.clients.insert(client_id, tx);
    info!(%board_id, %client_id, clients = board_state.clients.len(), "client subscribed");
}

/// Remove a client's subscription. The board entry goes away with its last
/// subscriber.
pub async fn unsubscribe(state: &AppState, board_id: Uuid, client_id: Uuid) {
    let mut boards = state.boards.write().await;
    let Some(board_state) = boards.get_mut(&board_id) else {
        return;
    };

    board_state.clients.remove(&client_id);
    info!(%board_id, %client_id, remaining = board_state.clients.len(), "client unsubscribed");

    if board_state.clients.is_empty() {
        boards.remove(&board_id);
        debug!(%board_id, "dropped idle board subscriber list");
    }
}

// =============================================================================
// PUBLISH
// =============================================================================

/// Deliver the full board snapshot to every subscriber of `board_id`.
pub async fn publish(state: &AppState, board_id: Uuid, board: &Board) -> Delivery {
    let frame = BoardPatched::new(board.clone()).to_frame();
    broadcast(state, board_id, &frame, None).await
}

/// Send a frame to all subscribers of a board, optionally excluding one.
pub async fn broadcast(state: &AppState, board_id: Uuid, frame: &Frame, exclude: Option<Uuid>) -> Delivery {
    let boards = state.boards.read().await;
    let Some(board_state) = boards.get(&board_id) else {
        return Delivery::default();
    };

    let mut delivery = Delivery::default();
    for (client_id, tx) in &board_state.clients {
        if exclude == Some(*client_id) {
            continue;
        }
        match tx.try_send(frame.clone()) {
            Ok(()) => delivery.delivered += 1,
            Err(e) => {
                delivery.dropped += 1;
                warn!(%board_id, %client_id, syscall = %frame.syscall, error = %e, "broadcast dropped for subscriber");
            }
        }
    }

    debug!(%board_id, syscall = %frame.syscall, delivered = delivery.delivered, dropped = delivery.dropped, "broadcast");
    delivery
}

#[cfg(test)]
#[path = "broadcast_test.rs"]
mod tests;
