//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! Binds the websocket sync transport, the board REST routes, and a health
//! check under one Axum router.

pub mod boards;
pub mod ws;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Full application router.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/board", post(boards::create_board_rest))
        .route("/api/board/{id}", get(boards::get_board_rest))
        .route("/api/board/{id}/mutate", post(boards::mutate_board_rest))
        .route("/api/ws", get(ws::handle_ws))
        .route("/healthz", get(healthz))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}
