use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{Duration, timeout};

use super::*;
use crate::db::{BoardStore, MemoryBoardStore};
use crate::frame::Frame;
use crate::protocol::BoardPatched;
use crate::state::test_helpers::{self, dummy_text, dummy_zone};

/// Memory store whose saves can be switched to fail.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryBoardStore,
    fail_saves: AtomicBool,
}

#[async_trait]
impl BoardStore for FlakyStore {
    async fn load(&self, board_id: Uuid) -> Result<Option<Board>, StoreError> {
        self.inner.load(board_id).await
    }

    async fn save(&self, board: &Board) -> Result<(), StoreError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected".into()));
        }
        self.inner.save(board).await
    }
}

async fn listen(state: &AppState, board_id: Uuid) -> mpsc::Receiver<Frame> {
    let (tx, rx) = mpsc::channel(64);
    broadcast::subscribe(state, board_id, Uuid::new_v4(), tx).await;
    rx
}

async fn next_event(rx: &mut mpsc::Receiver<Frame>) -> Board {
    let frame = timeout(Duration::from_millis(200), rx.recv())
        .await
        .expect("event timed out")
        .expect("channel closed");
    BoardPatched::from_frame(&frame).expect("board:patched").board
}

async fn assert_no_event(rx: &mut mpsc::Receiver<Frame>) {
    assert!(timeout(Duration::from_millis(60), rx.recv()).await.is_err(), "unexpected broadcast");
}

// =============================================================================
// objects
// =============================================================================

#[tokio::test]
async fn upsert_object_persists_and_publishes_full_board() {
    let state = test_helpers::test_app_state();
    let board_id = test_helpers::seed_board(&state).await;
    let mut rx = listen(&state, board_id).await;

    let board = upsert_object(&state, board_id, "z1", dummy_zone(10.0, 20.0)).await.unwrap();
    assert_eq!(board.objects["z1"], dummy_zone(10.0, 20.0));
    assert_eq!(board.version, 1);

    let stored = state.store.load(board_id).await.unwrap().unwrap();
    assert_eq!(stored, board);
    assert_eq!(next_event(&mut rx).await, board);
}

#[tokio::test]
async fn upsert_object_on_missing_board_is_not_found() {
    let state = test_helpers::test_app_state();
    let err = upsert_object(&state, Uuid::new_v4(), "z", dummy_zone(0.0, 0.0))
        .await
        .unwrap_err();
    assert!(matches!(err, MutationError::BoardNotFound(_)));
    assert_eq!(err.error_code(), "E_BOARD_NOT_FOUND");
    assert!(!err.retryable());
}

#[tokio::test]
async fn remove_object_twice_matches_removing_once() {
    let state = test_helpers::test_app_state();
    let board_id = test_helpers::seed_board(&state).await;
    upsert_object(&state, board_id, "t", dummy_text(1.0, 1.0)).await.unwrap();

    let once = remove_object(&state, board_id, "t").await.unwrap();
    let mut rx = listen(&state, board_id).await;
    let twice = remove_object(&state, board_id, "t").await.unwrap();

    assert_eq!(once, twice);
    assert!(!twice.objects.contains_key("t"));
    assert_no_event(&mut rx).await;
}

#[tokio::test]
async fn remove_zone_unpins_children_to_absolute() {
    let state = test_helpers::test_app_state();
    let board_id = test_helpers::seed_board(&state).await;
    upsert_object(&state, board_id, "z", dummy_zone(300.0, 100.0)).await.unwrap();
    upsert_position(&state, board_id, "card", Position::pinned(10.0, 10.0, "z")).await.unwrap();

    let board = remove_object(&state, board_id, "z").await.unwrap();
    assert_eq!(board.positions["card"], Position::absolute(310.0, 110.0));
    assert!(board.is_buried(EntryKind::Object, "z"));
}

#[tokio::test]
async fn upsert_after_remove_is_refused() {
    let state = test_helpers::test_app_state();
    let board_id = test_helpers::seed_board(&state).await;
    upsert_object(&state, board_id, "x", dummy_text(0.0, 0.0)).await.unwrap();
    remove_object(&state, board_id, "x").await.unwrap();

    let err = upsert_object(&state, board_id, "x", dummy_text(5.0, 5.0)).await.unwrap_err();
    assert!(matches!(err, MutationError::ObjectDeleted(ref id) if id == "x"));
    assert_eq!(err.error_code(), "E_OBJECT_DELETED");

    let stored = get_board(&state, board_id).await.unwrap();
    assert!(!stored.objects.contains_key("x"));
}

#[tokio::test]
async fn removing_never_seen_id_still_blocks_late_upsert() {
    let state = test_helpers::test_app_state();
    let board_id = test_helpers::seed_board(&state).await;

    remove_object(&state, board_id, "ghost").await.unwrap();
    let err = upsert_object(&state, board_id, "ghost", dummy_text(0.0, 0.0)).await.unwrap_err();
    assert!(matches!(err, MutationError::ObjectDeleted(_)));
}

#[tokio::test]
async fn object_and_position_tombstones_do_not_shadow_each_other() {
    let state = test_helpers::test_app_state();
    let board_id = test_helpers::seed_board(&state).await;
    upsert_object(&state, board_id, "shared", dummy_zone(0.0, 0.0)).await.unwrap();

    remove_position(&state, board_id, "shared").await.unwrap();
    let board = upsert_object(&state, board_id, "shared", dummy_zone(5.0, 5.0)).await.unwrap();
    assert_eq!(board.objects["shared"], dummy_zone(5.0, 5.0));

    remove_object(&state, board_id, "shared").await.unwrap();
    let board = upsert_position(&state, board_id, "shared", Position::absolute(1.0, 1.0)).await.unwrap();
    assert_eq!(board.positions["shared"], Position::absolute(1.0, 1.0));
    assert!(board.is_buried(EntryKind::Object, "shared"));
    assert!(!board.is_buried(EntryKind::Position, "shared"));
}

#[tokio::test]
async fn expired_tombstone_no_longer_blocks() {
    let store: Arc<dyn BoardStore> = Arc::new(MemoryBoardStore::new());
    let config = crate::config::ServerConfig {
        tombstone_retention: Duration::from_millis(0),
        ..crate::config::ServerConfig::default()
    };
    let state = AppState::new(store, config);
    let board_id = test_helpers::seed_board(&state).await;

    remove_object(&state, board_id, "x").await.unwrap();
    let board = upsert_object(&state, board_id, "x", dummy_text(0.0, 0.0)).await.unwrap();
    assert!(board.objects.contains_key("x"));
    assert!(!board.is_buried(EntryKind::Object, "x"));
}

#[tokio::test]
async fn batch_upsert_matches_sequential_upserts() {
    let state = test_helpers::test_app_state();
    let seq_board = test_helpers::seed_board(&state).await;
    let batch_board = test_helpers::seed_board(&state).await;

    upsert_object(&state, seq_board, "A", dummy_zone(0.0, 0.0)).await.unwrap();
    let sequential = upsert_object(&state, seq_board, "B", dummy_text(5.0, 5.0)).await.unwrap();

    let mut rx = listen(&state, batch_board).await;
    let mut objects = BTreeMap::new();
    objects.insert("A".to_string(), dummy_zone(0.0, 0.0));
    objects.insert("B".to_string(), dummy_text(5.0, 5.0));
    let batched = batch_upsert_objects(&state, batch_board, objects).await.unwrap();

    assert!(batched.same_content(&sequential));
    assert_eq!(batched.version, 1, "one write for the whole batch");
    next_event(&mut rx).await;
    assert_no_event(&mut rx).await;
}

#[tokio::test]
async fn batch_upsert_drops_buried_ids_and_keeps_the_rest() {
    let state = test_helpers::test_app_state();
    let board_id = test_helpers::seed_board(&state).await;
    remove_object(&state, board_id, "dead").await.unwrap();

    let mut objects = BTreeMap::new();
    objects.insert("dead".to_string(), dummy_text(0.0, 0.0));
    objects.insert("live".to_string(), dummy_text(1.0, 1.0));
    let board = batch_upsert_objects(&state, board_id, objects).await.unwrap();

    assert!(!board.objects.contains_key("dead"));
    assert!(board.objects.contains_key("live"));
}

#[tokio::test]
async fn empty_batch_writes_nothing() {
    let state = test_helpers::test_app_state();
    let board_id = test_helpers::seed_board(&state).await;
    let mut rx = listen(&state, board_id).await;

    let board = batch_upsert_objects(&state, board_id, BTreeMap::new()).await.unwrap();
    assert_eq!(board.version, 0);
    assert_no_event(&mut rx).await;
}

#[tokio::test]
async fn zone_replaced_by_text_releases_pinned_entities() {
    let state = test_helpers::test_app_state();
    let board_id = test_helpers::seed_board(&state).await;
    upsert_object(&state, board_id, "z", dummy_zone(100.0, 100.0)).await.unwrap();
    upsert_position(&state, board_id, "e", Position::pinned(5.0, 5.0, "z")).await.unwrap();

    let board = upsert_object(&state, board_id, "z", dummy_text(100.0, 100.0)).await.unwrap();
    assert_eq!(board.positions["e"], Position::absolute(105.0, 105.0));
}

// =============================================================================
// positions
// =============================================================================

#[tokio::test]
async fn upsert_position_requires_zone_parent() {
    let state = test_helpers::test_app_state();
    let board_id = test_helpers::seed_board(&state).await;
    upsert_object(&state, board_id, "t", dummy_text(0.0, 0.0)).await.unwrap();

    let err = upsert_position(&state, board_id, "e", Position::pinned(0.0, 0.0, "t"))
        .await
        .unwrap_err();
    assert!(matches!(err, MutationError::InvalidParent { .. }));
    assert_eq!(err.error_code(), "E_INVALID_PARENT");

    let err = upsert_position(&state, board_id, "e", Position::pinned(0.0, 0.0, "nope"))
        .await
        .unwrap_err();
    assert!(matches!(err, MutationError::InvalidParent { source: DocError::UnknownZone(_), .. }));
}

#[tokio::test]
async fn batch_positions_with_one_bad_parent_apply_nothing() {
    let state = test_helpers::test_app_state();
    let board_id = test_helpers::seed_board(&state).await;
    upsert_object(&state, board_id, "z", dummy_zone(0.0, 0.0)).await.unwrap();

    let mut positions = BTreeMap::new();
    positions.insert("good".to_string(), Position::pinned(1.0, 1.0, "z"));
    positions.insert("bad".to_string(), Position::pinned(1.0, 1.0, "missing"));
    let err = batch_upsert_positions(&state, board_id, positions).await.unwrap_err();
    assert!(matches!(err, MutationError::InvalidParent { ref entity_id, .. } if entity_id == "bad"));

    let stored = get_board(&state, board_id).await.unwrap();
    assert!(stored.positions.is_empty());
}

#[tokio::test]
async fn remove_position_is_idempotent_and_blocks_late_write() {
    let state = test_helpers::test_app_state();
    let board_id = test_helpers::seed_board(&state).await;
    upsert_position(&state, board_id, "card", Position::absolute(1.0, 2.0)).await.unwrap();

    let once = remove_position(&state, board_id, "card").await.unwrap();
    let twice = remove_position(&state, board_id, "card").await.unwrap();
    assert_eq!(once, twice);

    let mut positions = BTreeMap::new();
    positions.insert("card".to_string(), Position::absolute(50.0, 50.0));
    let board = batch_upsert_positions(&state, board_id, positions).await.unwrap();
    assert!(!board.positions.contains_key("card"));
}

// =============================================================================
// failures + concurrency
// =============================================================================

#[tokio::test]
async fn failed_save_persists_and_publishes_nothing() {
    let store = Arc::new(FlakyStore::default());
    let state = test_helpers::test_app_state_with_store(store.clone());
    let board_id = test_helpers::seed_board(&state).await;
    let mut rx = listen(&state, board_id).await;

    store.fail_saves.store(true, Ordering::SeqCst);
    let err = upsert_object(&state, board_id, "z", dummy_zone(0.0, 0.0)).await.unwrap_err();
    assert!(matches!(err, MutationError::Store(_)));
    assert!(err.retryable());
    assert_no_event(&mut rx).await;

    store.fail_saves.store(false, Ordering::SeqCst);
    let stored = get_board(&state, board_id).await.unwrap();
    assert!(stored.objects.is_empty());
    assert_eq!(stored.version, 0);
}

#[tokio::test]
async fn concurrent_writers_never_lose_each_others_objects() {
    let state = test_helpers::test_app_state();
    let board_id = test_helpers::seed_board(&state).await;

    let mut handles = Vec::new();
    for i in 0..32 {
        let state = state.clone();
        handles.push(tokio::spawn(async move {
            let x = f64::from(i);
            upsert_object(&state, board_id, &format!("obj-{i}"), dummy_text(x, x)).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    let board = get_board(&state, board_id).await.unwrap();
    assert_eq!(board.objects.len(), 32);
    assert_eq!(board.version, 32);
}

#[tokio::test]
async fn concurrent_resizes_of_one_zone_leave_one_whole_size() {
    let state = test_helpers::test_app_state();
    let board_id = test_helpers::seed_board(&state).await;
    upsert_object(&state, board_id, "z", dummy_zone(0.0, 0.0)).await.unwrap();

    let mut wide = dummy_zone(0.0, 0.0);
    wide.resize(800.0, 100.0);
    let mut tall = dummy_zone(0.0, 0.0);
    tall.resize(100.0, 800.0);

    let (a, b) = tokio::join!(
        upsert_object(&state, board_id, "z", wide.clone()),
        upsert_object(&state, board_id, "z", tall.clone()),
    );
    a.unwrap();
    b.unwrap();

    let size = get_board(&state, board_id).await.unwrap().objects["z"].size();
    assert!(size == Some((800.0, 100.0)) || size == Some((100.0, 800.0)), "mixed size {size:?}");
}

#[tokio::test]
async fn apply_dispatches_each_action() {
    let state = test_helpers::test_app_state();
    let board_id = test_helpers::seed_board(&state).await;

    apply(&state, board_id, Mutation::UpsertObject { object_id: "z".into(), object: dummy_zone(0.0, 0.0) })
        .await
        .unwrap();
    apply(
        &state,
        board_id,
        Mutation::UpsertPosition { entity_id: "e".into(), position: Position::pinned(1.0, 1.0, "z") },
    )
    .await
    .unwrap();
    let board = apply(&state, board_id, Mutation::RemovePosition { entity_id: "e".into() })
        .await
        .unwrap();
    assert!(board.positions.is_empty());
    assert!(board.objects.contains_key("z"));
}

#[tokio::test]
async fn write_locks_are_released_after_each_write() {
    let state = test_helpers::test_app_state();
    for _ in 0..50 {
        let board_id = test_helpers::seed_board(&state).await;
        upsert_object(&state, board_id, "z", dummy_zone(0.0, 0.0)).await.unwrap();
    }
    let missing = Uuid::new_v4();
    assert!(get_board(&state, missing).await.is_err());
    assert!(upsert_object(&state, missing, "z", dummy_zone(0.0, 0.0)).await.is_err());

    assert!(state.locks.is_empty());
}

#[tokio::test]
async fn create_and_get_board() {
    let state = test_helpers::test_app_state();
    let owner = Uuid::new_v4();
    let created = create_board(&state, "Roadmap", Some(owner)).await.unwrap();
    let fetched = get_board(&state, created.id).await.unwrap();
    assert_eq!(fetched, created);
    assert_eq!(fetched.owner_id, Some(owner));

    let err = get_board(&state, Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, MutationError::BoardNotFound(_)));
}
