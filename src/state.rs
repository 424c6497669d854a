//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor and
//! passed explicitly to every service. It owns the store handle, the live
//! subscriber registry per board, and one write lock per board that gives
//! the mutation service its single-writer discipline. Independent boards
//! never contend on each other's lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{OwnedMutexGuard, RwLock, mpsc};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::db::BoardStore;
use crate::frame::Frame;

// =============================================================================
// BOARD STATE
// =============================================================================

/// Live per-board state: who is listening.
pub struct BoardState {
    /// Subscribers: `client_id` -> sender for outgoing frames.
    pub clients: HashMap<Uuid, mpsc::Sender<Frame>>,
}

impl BoardState {
    #[must_use]
    pub fn new() -> Self {
        Self { clients: HashMap::new() }
    }
}

impl Default for BoardState {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// WRITE LOCKS
// =============================================================================

/// One async mutex per board id, created on first use.
#[derive(Clone, Default)]
pub struct BoardLocks {
    inner: Arc<Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>>,
}

impl BoardLocks {
    /// Wait for exclusive write access to a board.
    pub async fn acquire(&self, board_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            map.entry(board_id).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Forget a board's lock if nobody holds or waits on it.
    pub fn release_idle(&self, board_id: Uuid) {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if map.get(&board_id).is_some_and(|l| Arc::strong_count(l) == 1) {
            map.remove(&board_id);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// APP STATE
// =============================================================================

/// Clone is required by Axum; all inner fields are Arc-wrapped.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn BoardStore>,
    pub boards: Arc<RwLock<HashMap<Uuid, BoardState>>>,
    pub locks: BoardLocks,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    #[must_use]
    pub fn new(store: Arc<dyn BoardStore>, config: ServerConfig) -> Self {
        Self {
            store,
            boards: Arc::new(RwLock::new(HashMap::new())),
            locks: BoardLocks::default(),
            config: Arc::new(config),
        }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn board_state_new_is_empty() {
        let bs = BoardState::new();
        assert!(bs.clients.is_empty());
        assert!(BoardState::default().clients.is_empty());
    }

    #[tokio::test]
    async fn board_locks_serialize_same_board() {
        let locks = BoardLocks::default();
        let board_id = Uuid::new_v4();

        let guard = locks.acquire(board_id).await;
        let contender = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = contender.acquire(board_id).await;
        });

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert!(!waiter.is_finished(), "second writer must wait for the first");
        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn board_locks_independent_boards_do_not_block() {
        let locks = BoardLocks::default();
        let _a = locks.acquire(Uuid::new_v4()).await;
        let b = tokio::time::timeout(std::time::Duration::from_millis(100), locks.acquire(Uuid::new_v4())).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn release_idle_keeps_held_locks() {
        let locks = BoardLocks::default();
        let board_id = Uuid::new_v4();
        let guard = locks.acquire(board_id).await;
        locks.release_idle(board_id);
        assert_eq!(locks.len(), 1);
        drop(guard);
        locks.release_idle(board_id);
        assert!(locks.is_empty());
    }
}
