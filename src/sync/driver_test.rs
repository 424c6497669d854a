use super::*;
use crate::doc::Position;
use crate::services::mutation::MutationError;
use crate::state::test_helpers;
use crate::sync::engine::EngineConfig;
use std::time::Instant;
use tokio::time::timeout;

const BOARD: Uuid = Uuid::from_u128(0xD21);

fn board(version: u64) -> Board {
    let mut board = Board::new(BOARD, "Board", None);
    board.version = version;
    board
}

fn joined_engine(now: Instant) -> (SyncEngine, Frame) {
    let mut engine = SyncEngine::new(BOARD, EngineConfig::default());
    let join = Frame::request(SYSCALL_JOIN, Data::new()).with_board_id(BOARD);
    let reply = join.done_with(protocol::board_data(&board(1)));
    let mut in_flight = InFlight::new();
    assert!(route_frame(&mut engine, &reply, join.id, &mut in_flight, now).unwrap());
    (engine, join)
}

// =============================================================================
// ROUTING
// =============================================================================

#[test]
fn join_reply_syncs_the_engine() {
    let (engine, _) = joined_engine(Instant::now());
    assert!(engine.is_synced());
    assert_eq!(engine.board().unwrap().version, 1);
}

#[test]
fn patched_event_applies_snapshot() {
    let now = Instant::now();
    let (mut engine, join) = joined_engine(now);
    let mut next = board(2);
    next.positions.insert("e1".into(), Position::absolute(3.0, 4.0));

    let event = BoardPatched::new(next).to_frame();
    assert!(route_frame(&mut engine, &event, join.id, &mut InFlight::new(), now).unwrap());
    assert_eq!(engine.board().unwrap().positions["e1"], Position::absolute(3.0, 4.0));
}

#[test]
fn mutate_reply_clears_in_flight_entry() {
    let now = Instant::now();
    let (mut engine, join) = joined_engine(now);
    let mutation = Mutation::RemovePosition { entity_id: "e1".into() };
    let request = mutation.to_frame(BOARD);
    let mut in_flight = InFlight::new();
    in_flight.insert(request.id, mutation);

    let reply = request.done_with(protocol::board_data(&board(2)));
    assert!(route_frame(&mut engine, &reply, join.id, &mut in_flight, now).unwrap());
    assert!(in_flight.is_empty());
    assert_eq!(engine.board().unwrap().version, 2);
}

#[test]
fn error_reply_is_routed_to_engine_as_rejection() {
    let now = Instant::now();
    let (mut engine, join) = joined_engine(now);
    let later = now + Duration::from_millis(100);
    engine.place_entity("e1", Position::absolute(1.0, 1.0), later).unwrap();
    engine.flush_all(later);
    let mutation = engine.drain_outbox().remove(0);

    let request = mutation.to_frame(BOARD);
    let mut in_flight = InFlight::new();
    in_flight.insert(request.id, mutation);
    let reply = request.error_from(&MutationError::BoardNotFound(BOARD));

    assert!(route_frame(&mut engine, &reply, join.id, &mut in_flight, later).unwrap());
    assert!(in_flight.is_empty());
    assert!(!engine.board().unwrap().positions.contains_key("e1"));
    assert_eq!(engine.drain_notices().len(), 1);
}

#[test]
fn unmatched_error_reply_is_ignored() {
    let now = Instant::now();
    let (mut engine, join) = joined_engine(now);
    let stray = Frame::request("board:get", Data::new()).error("nope");
    assert!(!route_frame(&mut engine, &stray, join.id, &mut InFlight::new(), now).unwrap());
}

#[test]
fn rejected_join_is_fatal() {
    let now = Instant::now();
    let mut engine = SyncEngine::new(BOARD, EngineConfig::default());
    let join = Frame::request(SYSCALL_JOIN, Data::new()).with_board_id(BOARD);
    let reply = join.error_from(&MutationError::BoardNotFound(BOARD));

    let err = route_frame(&mut engine, &reply, join.id, &mut InFlight::new(), now).unwrap_err();
    assert!(matches!(err, DriverError::JoinRejected(ref m) if m.contains("board not found")));
    assert!(!err.retryable());
    assert_eq!(err.error_code(), "E_JOIN_REJECTED");
}

#[test]
fn backoff_grows_linearly_and_caps() {
    let config = DriverConfig::new("ws://localhost/api/ws");
    assert_eq!(config.backoff(0), Duration::from_millis(500));
    assert_eq!(config.backoff(3), Duration::from_millis(2_000));
    assert_eq!(config.backoff(100), Duration::from_millis(10_000));
    assert!(DriverError::Closed.retryable());
}

// =============================================================================
// LIVE SERVER
// =============================================================================

async fn next_board_event(rx: &mut mpsc::Receiver<DriverEvent>) -> Board {
    loop {
        let event = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("driver event timed out")
            .expect("driver event channel closed");
        if let DriverEvent::Board(board) = event {
            return board;
        }
    }
}

#[tokio::test]
async fn driver_persists_local_edits_through_a_live_server() {
    let state = test_helpers::test_app_state();
    let board_id = test_helpers::seed_board(&state).await;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = crate::routes::app(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let engine_config = EngineConfig { quiet_period: Duration::from_millis(50), ..EngineConfig::default() };
    let engine = SyncEngine::new(board_id, engine_config);
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let (event_tx, mut event_rx) = mpsc::channel(64);
    let driver = tokio::spawn(run(DriverConfig::new(format!("ws://{addr}/api/ws")), engine, cmd_rx, event_tx));

    let joined = next_board_event(&mut event_rx).await;
    assert_eq!(joined.id, board_id);

    cmd_tx
        .send(Command::CreateObject { object_id: "z1".into(), object: test_helpers::dummy_zone(10.0, 20.0) })
        .await
        .unwrap();
    cmd_tx.send(Command::EndGesture).await.unwrap();

    let persisted = timeout(Duration::from_secs(2), async {
        loop {
            let stored = state.store.load(board_id).await.unwrap().unwrap();
            if stored.objects.contains_key("z1") {
                return stored;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("write never reached the store");
    assert_eq!(persisted.objects["z1"], test_helpers::dummy_zone(10.0, 20.0));

    drop(cmd_tx);
    let engine = timeout(Duration::from_secs(2), driver)
        .await
        .expect("driver did not stop")
        .unwrap()
        .unwrap();
    assert!(engine.board().unwrap().objects.contains_key("z1"));
}
