//! Board REST routes.
//!
//! Non-socket collaborators (entity lifecycle services, scripts) create and
//! read boards here and may submit the same mutate requests the websocket
//! accepts. Writes still go through the mutation service and still broadcast.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::doc::Board;
use crate::protocol::Mutation;
use crate::services::mutation::{self, MutationError};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct CreateBoardBody {
    pub name: Option<String>,
    pub owner_id: Option<Uuid>,
}

/// `POST /api/board` — create a new board.
pub async fn create_board_rest(
    State(state): State<AppState>,
    Json(body): Json<CreateBoardBody>,
) -> Result<(StatusCode, Json<Board>), StatusCode> {
    let name = body.name.as_deref().unwrap_or("Untitled Board");
    let board = mutation::create_board(&state, name, body.owner_id)
        .await
        .map_err(mutation_error_to_status)?;
    Ok((StatusCode::CREATED, Json(board)))
}

/// `GET /api/board/{id}` — authoritative snapshot.
pub async fn get_board_rest(
    State(state): State<AppState>,
    Path(board_id): Path<Uuid>,
) -> Result<Json<Board>, StatusCode> {
    let board = mutation::get_board(&state, board_id)
        .await
        .map_err(mutation_error_to_status)?;
    Ok(Json(board))
}

/// `POST /api/board/{id}/mutate` — apply one mutate request.
pub async fn mutate_board_rest(
    State(state): State<AppState>,
    Path(board_id): Path<Uuid>,
    Json(body): Json<Mutation>,
) -> Result<Json<Board>, StatusCode> {
    let board = mutation::apply(&state, board_id, body)
        .await
        .map_err(mutation_error_to_status)?;
    Ok(Json(board))
}

pub(crate) fn mutation_error_to_status(err: MutationError) -> StatusCode {
    match err {
        MutationError::BoardNotFound(_) => StatusCode::NOT_FOUND,
        MutationError::ObjectDeleted(_) => StatusCode::GONE,
        MutationError::InvalidParent { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        MutationError::Store(e) => {
            tracing::error!(error = %e, "board store failure");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

#[cfg(test)]
#[path = "boards_test.rs"]
mod tests;
