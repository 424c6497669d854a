//! Board sync protocol — mutate requests and board-patched events.
//!
//! DESIGN
//! ======
//! A mutate request is a `board:mutate` frame whose data is a `Mutation`
//! tagged by `action`. Every successful mutation produces a `board:patched`
//! event carrying the full resulting board. Replies to `board:join`,
//! `board:get`, `board:create` and `board:mutate` carry the same full board
//! under the `board` key, so clients handle exactly one snapshot shape.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::doc::{Board, BoardObject, Position};
use crate::frame::{Data, ErrorCode, Frame};

pub const SYSCALL_CONNECTED: &str = "session:connected";
pub const SYSCALL_GET: &str = "board:get";
pub const SYSCALL_JOIN: &str = "board:join";
pub const SYSCALL_MUTATE: &str = "board:mutate";
pub const SYSCALL_PATCHED: &str = "board:patched";

const KEY_BOARD: &str = "board";
const KEY_BOARD_ID: &str = "board_id";

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("board_id required")]
    MissingBoardId,
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl ErrorCode for ProtocolError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::MissingBoardId => "E_BOARD_ID_REQUIRED",
            Self::MissingField(_) => "E_MISSING_FIELD",
            Self::Malformed(_) => "E_MALFORMED",
        }
    }
}

// =============================================================================
// MUTATIONS
// =============================================================================

/// One atomic write against a board document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Mutation {
    #[serde(rename_all = "camelCase")]
    UpsertObject { object_id: String, object: BoardObject },
    #[serde(rename_all = "camelCase")]
    RemoveObject { object_id: String },
    #[serde(rename_all = "camelCase")]
    BatchUpsertObjects { objects: BTreeMap<String, BoardObject> },
    #[serde(rename_all = "camelCase")]
    UpsertPosition { entity_id: String, position: Position },
    #[serde(rename_all = "camelCase")]
    BatchUpsertPositions { positions: BTreeMap<String, Position> },
    #[serde(rename_all = "camelCase")]
    RemovePosition { entity_id: String },
}

impl Mutation {
    /// Wire name of the action, as it appears in the `action` tag.
    #[must_use]
    pub fn action(&self) -> &'static str {
        match self {
            Self::UpsertObject { .. } => "upsertObject",
            Self::RemoveObject { .. } => "removeObject",
            Self::BatchUpsertObjects { .. } => "batchUpsertObjects",
            Self::UpsertPosition { .. } => "upsertPosition",
            Self::BatchUpsertPositions { .. } => "batchUpsertPositions",
            Self::RemovePosition { .. } => "removePosition",
        }
    }

    /// Ids this mutation writes.
    #[must_use]
    pub fn ids(&self) -> Vec<&str> {
        match self {
            Self::UpsertObject { object_id, .. } | Self::RemoveObject { object_id } => vec![object_id.as_str()],
            Self::UpsertPosition { entity_id, .. } | Self::RemovePosition { entity_id } => vec![entity_id.as_str()],
            Self::BatchUpsertObjects { objects } => objects.keys().map(String::as_str).collect(),
            Self::BatchUpsertPositions { positions } => positions.keys().map(String::as_str).collect(),
        }
    }

    /// Build the `board:mutate` request frame for this mutation.
    #[must_use]
    pub fn to_frame(&self, board_id: Uuid) -> Frame {
        let data = match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map.into_iter().collect(),
            _ => Data::new(),
        };
        Frame::request(SYSCALL_MUTATE, data).with_board_id(board_id)
    }

    /// Decode a `board:mutate` request frame.
    ///
    /// # Errors
    ///
    /// `MissingBoardId` when the frame names no board, `Malformed` when the
    /// data does not describe a known action.
    pub fn from_frame(frame: &Frame) -> Result<(Uuid, Mutation), ProtocolError> {
        let board_id = frame.target_board().ok_or(ProtocolError::MissingBoardId)?;
        let mut map: serde_json::Map<String, serde_json::Value> =
            frame.data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        map.remove(KEY_BOARD_ID);
        let mutation = serde_json::from_value(serde_json::Value::Object(map))?;
        Ok((board_id, mutation))
    }
}

// =============================================================================
// SNAPSHOTS + EVENTS
// =============================================================================

/// Payload carrying a full board snapshot.
#[must_use]
pub fn board_data(board: &Board) -> Data {
    let mut data = Data::new();
    data.insert(KEY_BOARD_ID.into(), serde_json::json!(board.id));
    data.insert(KEY_BOARD.into(), serde_json::to_value(board).unwrap_or_default());
    data
}

/// Extract the board snapshot from a frame payload.
///
/// # Errors
///
/// `MissingField` when no `board` key is present, `Malformed` when it does
/// not decode.
pub fn board_from_data(data: &Data) -> Result<Board, ProtocolError> {
    let value = data.get(KEY_BOARD).ok_or(ProtocolError::MissingField(KEY_BOARD))?;
    Ok(serde_json::from_value(value.clone())?)
}

/// The "board changed" broadcast event.
#[derive(Debug, Clone, PartialEq)]
pub struct BoardPatched {
    pub board_id: Uuid,
    pub board: Board,
}

impl BoardPatched {
    #[must_use]
    pub fn new(board: Board) -> Self {
        Self { board_id: board.id, board }
    }

    #[must_use]
    pub fn to_frame(&self) -> Frame {
        Frame::request(SYSCALL_PATCHED, board_data(&self.board)).with_board_id(self.board_id)
    }

    /// Decode a `board:patched` frame.
    ///
    /// # Errors
    ///
    /// Same as [`board_from_data`].
    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        let board = board_from_data(&frame.data)?;
        let board_id = frame.target_board().unwrap_or(board.id);
        Ok(Self { board_id, board })
    }
}

#[cfg(test)]
#[path = "protocol_test.rs"]
mod tests;
