use super::*;
use crate::doc::Position;

#[tokio::test]
async fn memory_store_load_missing_is_none() {
    let store = MemoryBoardStore::new();
    assert!(store.load(Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
async fn memory_store_save_replaces_whole_document() {
    let store = MemoryBoardStore::new();
    let mut board = Board::new(Uuid::new_v4(), "first", None);
    board.positions.insert("a".into(), Position::absolute(1.0, 1.0));
    store.save(&board).await.unwrap();

    board.positions.clear();
    board.name = "second".into();
    store.save(&board).await.unwrap();

    let loaded = store.load(board.id).await.unwrap().unwrap();
    assert_eq!(loaded.name, "second");
    assert!(loaded.positions.is_empty());
}

#[test]
fn store_error_codes_and_retryability() {
    let err = StoreError::Unavailable("disk full".into());
    assert_eq!(err.error_code(), "E_STORE_UNAVAILABLE");
    assert!(err.retryable());

    let bad = serde_json::from_str::<Board>("{").unwrap_err();
    let err = StoreError::from(bad);
    assert_eq!(err.error_code(), "E_DOCUMENT_ENCODING");
    assert!(!err.retryable());
}

#[cfg(feature = "live-db-tests")]
#[tokio::test]
async fn pg_store_round_trips_document() {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required for live-db-tests");
    let pool = init_pool(&url).await.expect("pool");
    let store = PgBoardStore::new(pool);

    let mut board = Board::new(Uuid::new_v4(), "live", None);
    board.positions.insert("card".into(), Position::absolute(4.0, 2.0));
    store.save(&board).await.unwrap();

    let loaded = store.load(board.id).await.unwrap().unwrap();
    assert_eq!(loaded, board);
}
