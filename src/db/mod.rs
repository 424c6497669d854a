//! Board Document Store — durable storage for whole board documents.
//!
//! SYSTEM CONTEXT
//! ==============
//! Storage is an opaque key-value document store keyed by board id. Only the
//! mutation service writes through it; it never sees partial documents. Two
//! backends: Postgres (one JSONB row per board) and an in-process map used
//! when no `DATABASE_URL` is configured and by tests.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::env_parse;
use crate::doc::Board;
use crate::frame::ErrorCode;

const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("document encoding error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl ErrorCode for StoreError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Database(_) => "E_DATABASE",
            Self::Serialization(_) => "E_DOCUMENT_ENCODING",
            Self::Unavailable(_) => "E_STORE_UNAVAILABLE",
        }
    }

    fn retryable(&self) -> bool {
        !matches!(self, Self::Serialization(_))
    }
}

/// Whole-document storage. Writers must hold the board's write lock.
#[async_trait]
pub trait BoardStore: Send + Sync {
    async fn load(&self, board_id: Uuid) -> Result<Option<Board>, StoreError>;

    /// Insert or fully replace the document.
    async fn save(&self, board: &Board) -> Result<(), StoreError>;
}

// =============================================================================
// POSTGRES
// =============================================================================

/// Initialize the `PostgreSQL` connection pool and run migrations.
///
/// # Errors
///
/// Returns an error if the connection or migrations fail.
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(env_parse("DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS))
        .connect(database_url)
        .await?;

    sqlx::migrate!("src/db/migrations").run(&pool).await?;

    Ok(pool)
}

pub struct PgBoardStore {
    pool: PgPool,
}

impl PgBoardStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BoardStore for PgBoardStore {
    async fn load(&self, board_id: Uuid) -> Result<Option<Board>, StoreError> {
        let row: Option<serde_json::Value> = sqlx::query_scalar("SELECT document FROM boards WHERE id = $1")
            .bind(board_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(serde_json::from_value).transpose().map_err(StoreError::from)
    }

    async fn save(&self, board: &Board) -> Result<(), StoreError> {
        let document = serde_json::to_value(board)?;
        let version = i64::try_from(board.version).unwrap_or(i64::MAX);
        sqlx::query(
            "INSERT INTO boards (id, name, owner_id, document, version, updated_at) \
             VALUES ($1, $2, $3, $4, $5, now()) \
             ON CONFLICT (id) DO UPDATE SET \
                 name = EXCLUDED.name, document = EXCLUDED.document, \
                 version = EXCLUDED.version, updated_at = now()",
        )
        .bind(board.id)
        .bind(&board.name)
        .bind(board.owner_id)
        .bind(&document)
        .bind(version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// =============================================================================
// IN-MEMORY
// =============================================================================

#[derive(Default)]
pub struct MemoryBoardStore {
    boards: RwLock<HashMap<Uuid, Board>>,
}

impl MemoryBoardStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BoardStore for MemoryBoardStore {
    async fn load(&self, board_id: Uuid) -> Result<Option<Board>, StoreError> {
        Ok(self.boards.read().await.get(&board_id).cloned())
    }

    async fn save(&self, board: &Board) -> Result<(), StoreError> {
        self.boards.write().await.insert(board.id, board.clone());
        Ok(())
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
