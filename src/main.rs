use std::sync::Arc;

use boardsync::config::ServerConfig;
use boardsync::db::{self, BoardStore, MemoryBoardStore, PgBoardStore};
use boardsync::routes;
use boardsync::state::AppState;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let config = ServerConfig::from_env();
    let port = config.port;

    let store: Arc<dyn BoardStore> = match &config.database_url {
        Some(url) => {
            let pool = db::init_pool(url).await.expect("database init failed");
            tracing::info!("using postgres board store");
            Arc::new(PgBoardStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, boards will not survive a restart");
            Arc::new(MemoryBoardStore::new())
        }
    };

    let state = AppState::new(store, config);
    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(%port, "boardsync listening");
    axum::serve(listener, app).await.expect("server failed");
}
