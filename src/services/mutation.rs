//! Atomic mutation service — the only writer of board documents.
//!
//! DESIGN
//! ======
//! Every operation is one read-modify-write cycle under the board's write
//! lock: load the full document, apply the change in memory, persist the
//! full document, then publish the result to subscribers. Concurrent writes
//! to one board queue on the lock, so a cycle always starts from the
//! previous cycle's output and fields untouched by a writer survive it.
//! Different boards proceed in parallel.
//!
//! ERROR HANDLING
//! ==============
//! Nothing is persisted or published unless the whole change applies and the
//! save succeeds. A change that turns out to be a no-op (removing an id that
//! is already gone, an empty batch) skips both the write and the broadcast.
//!
//! TOMBSTONES
//! ==========
//! Removals bury the id in the document, objects and positions apart. A
//! single upsert of a buried id is refused; batch upserts silently drop
//! buried ids. A late drag flush from a client that has not yet seen the
//! delete therefore cannot resurrect it.

use std::collections::BTreeMap;

use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::StoreError;
use crate::doc::{Board, BoardObject, DocError, EntryKind, Position};
use crate::frame::ErrorCode;
use crate::protocol::Mutation;
use crate::services::broadcast;
use crate::state::AppState;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum MutationError {
    #[error("board not found: {0}")]
    BoardNotFound(Uuid),
    #[error("id was deleted: {0}")]
    ObjectDeleted(String),
    #[error("invalid parent for {entity_id}: {source}")]
    InvalidParent { entity_id: String, source: DocError },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ErrorCode for MutationError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::BoardNotFound(_) => "E_BOARD_NOT_FOUND",
            Self::ObjectDeleted(_) => "E_OBJECT_DELETED",
            Self::InvalidParent { .. } => "E_INVALID_PARENT",
            Self::Store(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.retryable(),
            _ => false,
        }
    }
}

/// Whether an applied change altered the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Changed,
    Unchanged,
}

// =============================================================================
// CORE CYCLE
// =============================================================================

async fn mutate<F>(state: &AppState, board_id: Uuid, action: &'static str, apply: F) -> Result<Board, MutationError>
where
    F: FnOnce(&mut Board) -> Result<Change, MutationError>,
{
    let guard = state.locks.acquire(board_id).await;
    let result = mutate_locked(state, board_id, action, apply).await;
    drop(guard);
    state.locks.release_idle(board_id);
    result
}

/// The read-modify-write cycle. Caller holds the board's write lock.
async fn mutate_locked<F>(
    state: &AppState,
    board_id: Uuid,
    action: &'static str,
    apply: F,
) -> Result<Board, MutationError>
where
    F: FnOnce(&mut Board) -> Result<Change, MutationError>,
{
    let mut board = state
        .store
        .load(board_id)
        .await?
        .ok_or(MutationError::BoardNotFound(board_id))?;
    board.prune_tombstones(OffsetDateTime::now_utc(), state.config.tombstone_retention);

    if apply(&mut board)? == Change::Unchanged {
        return Ok(board);
    }

    board.touch();
    state.store.save(&board).await?;

    // Publish while still holding the lock so events leave in write order.
    let delivery = broadcast::publish(state, board_id, &board).await;
    info!(
        %board_id,
        action,
        version = board.version,
        delivered = delivery.delivered,
        dropped = delivery.dropped,
        "mutation applied"
    );
    Ok(board)
}

/// Replace an object, unpinning entities first if a zone stops being a zone.
fn put_object(board: &mut Board, object_id: String, object: BoardObject) {
    let loses_zone = board.objects.get(&object_id).is_some_and(BoardObject::is_zone) && !object.is_zone();
    if loses_zone {
        board.unpin_children(&object_id);
    }
    board.objects.insert(object_id, object);
}

fn check_parent(board: &Board, entity_id: &str, position: &Position) -> Result<(), MutationError> {
    board
        .validate_parent(position)
        .map_err(|source| MutationError::InvalidParent { entity_id: entity_id.to_owned(), source })
}

// =============================================================================
// BOARDS
// =============================================================================

/// Create an empty board.
///
/// # Errors
///
/// Returns a store error if the save fails.
pub async fn create_board(state: &AppState, name: &str, owner_id: Option<Uuid>) -> Result<Board, MutationError> {
    let board = Board::new(Uuid::new_v4(), name, owner_id);
    state.store.save(&board).await?;
    info!(board_id = %board.id, name, "board created");
    Ok(board)
}

/// Current authoritative snapshot.
///
/// # Errors
///
/// `BoardNotFound` if no such board, or a store error.
pub async fn get_board(state: &AppState, board_id: Uuid) -> Result<Board, MutationError> {
    state
        .store
        .load(board_id)
        .await?
        .ok_or(MutationError::BoardNotFound(board_id))
}

// =============================================================================
// OBJECTS
// =============================================================================

/// Insert or replace one object.
///
/// # Errors
///
/// `ObjectDeleted` if the id was recently removed, plus the cycle errors.
pub async fn upsert_object(
    state: &AppState,
    board_id: Uuid,
    object_id: &str,
    object: BoardObject,
) -> Result<Board, MutationError> {
    mutate(state, board_id, "upsertObject", |board| {
        if board.is_buried(EntryKind::Object, object_id) {
            return Err(MutationError::ObjectDeleted(object_id.to_owned()));
        }
        put_object(board, object_id.to_owned(), object);
        Ok(Change::Changed)
    })
    .await
}

/// Remove an object. Removing an absent id is not an error.
///
/// Removing a zone first converts every entity pinned to it back to
/// absolute coordinates.
///
/// # Errors
///
/// Cycle errors only.
pub async fn remove_object(state: &AppState, board_id: Uuid, object_id: &str) -> Result<Board, MutationError> {
    mutate(state, board_id, "removeObject", |board| {
        if !board.objects.contains_key(object_id) {
            if board.is_buried(EntryKind::Object, object_id) {
                return Ok(Change::Unchanged);
            }
            board.bury(EntryKind::Object, object_id);
            return Ok(Change::Changed);
        }
        let unpinned = board.unpin_children(object_id);
        if !unpinned.is_empty() {
            info!(%board_id, object_id, count = unpinned.len(), "unpinned entities from removed zone");
        }
        board.objects.remove(object_id);
        board.bury(EntryKind::Object, object_id);
        Ok(Change::Changed)
    })
    .await
}

/// Merge many objects in one cycle and one broadcast.
///
/// # Errors
///
/// Cycle errors only; buried ids are dropped from the batch, not rejected.
pub async fn batch_upsert_objects(
    state: &AppState,
    board_id: Uuid,
    objects: BTreeMap<String, BoardObject>,
) -> Result<Board, MutationError> {
    mutate(state, board_id, "batchUpsertObjects", |board| {
        let mut applied = 0usize;
        for (object_id, object) in objects {
            if board.is_buried(EntryKind::Object, &object_id) {
                warn!(%board_id, %object_id, "dropping upsert for deleted object");
                continue;
            }
            put_object(board, object_id, object);
            applied += 1;
        }
        Ok(if applied == 0 { Change::Unchanged } else { Change::Changed })
    })
    .await
}

// =============================================================================
// POSITIONS
// =============================================================================

/// Insert or replace one entity position.
///
/// # Errors
///
/// `ObjectDeleted` for a recently removed id, `InvalidParent` when the parent
/// reference does not name a zone on this board, plus the cycle errors.
pub async fn upsert_position(
    state: &AppState,
    board_id: Uuid,
    entity_id: &str,
    position: Position,
) -> Result<Board, MutationError> {
    mutate(state, board_id, "upsertPosition", |board| {
        if board.is_buried(EntryKind::Position, entity_id) {
            return Err(MutationError::ObjectDeleted(entity_id.to_owned()));
        }
        check_parent(board, entity_id, &position)?;
        board.positions.insert(entity_id.to_owned(), position);
        Ok(Change::Changed)
    })
    .await
}

/// Merge many positions in one cycle and one broadcast.
///
/// # Errors
///
/// `InvalidParent` rejects the whole batch. Buried ids are dropped.
pub async fn batch_upsert_positions(
    state: &AppState,
    board_id: Uuid,
    positions: BTreeMap<String, Position>,
) -> Result<Board, MutationError> {
    mutate(state, board_id, "batchUpsertPositions", |board| {
        let live: Vec<(String, Position)> = positions
            .into_iter()
            .filter(|(entity_id, _)| {
                let buried = board.is_buried(EntryKind::Position, entity_id);
                if buried {
                    warn!(%board_id, %entity_id, "dropping position for deleted entity");
                }
                !buried
            })
            .collect();
        for (entity_id, position) in &live {
            check_parent(board, entity_id, position)?;
        }
        if live.is_empty() {
            return Ok(Change::Unchanged);
        }
        board.positions.extend(live);
        Ok(Change::Changed)
    })
    .await
}

/// Remove an entity's position, e.g. after the entity itself was deleted
/// elsewhere. Removing an absent id is not an error.
///
/// # Errors
///
/// Cycle errors only.
pub async fn remove_position(state: &AppState, board_id: Uuid, entity_id: &str) -> Result<Board, MutationError> {
    mutate(state, board_id, "removePosition", |board| {
        if board.positions.remove(entity_id).is_none() && board.is_buried(EntryKind::Position, entity_id) {
            return Ok(Change::Unchanged);
        }
        board.bury(EntryKind::Position, entity_id);
        Ok(Change::Changed)
    })
    .await
}

// =============================================================================
// DISPATCH
// =============================================================================

/// Apply a decoded mutate request.
///
/// # Errors
///
/// Whatever the selected operation returns.
pub async fn apply(state: &AppState, board_id: Uuid, mutation: Mutation) -> Result<Board, MutationError> {
    match mutation {
        Mutation::UpsertObject { object_id, object } => upsert_object(state, board_id, &object_id, object).await,
        Mutation::RemoveObject { object_id } => remove_object(state, board_id, &object_id).await,
        Mutation::BatchUpsertObjects { objects } => batch_upsert_objects(state, board_id, objects).await,
        Mutation::UpsertPosition { entity_id, position } => {
            upsert_position(state, board_id, &entity_id, position).await
        }
        Mutation::BatchUpsertPositions { positions } => batch_upsert_positions(state, board_id, positions).await,
        Mutation::RemovePosition { entity_id } => remove_position(state, board_id, &entity_id).await,
    }
}

#[cfg(test)]
#[path = "mutation_test.rs"]
mod tests;
