//! Real-time messaging server library
//!
//! Presence registry, message store, conversation list and push delivery
//! behind a REST API and a WebSocket endpoint.

pub mod config;
pub mod conversations;
pub mod delivery;
pub mod directory;
pub mod error;
pub mod handlers;
pub mod models;
pub mod presence;
pub mod protocol;
pub mod store;

use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::{AppState, MessagingConfig};
use directory::SqliteDirectory;
use handlers::{
    get_conversation, get_unread, list_conversations, mark_read, mw_require_auth,
    send_group_message, send_message, ws_handler,
};
use store::JsonMessageStore;

/// Full application router.
pub fn app(state: AppState) -> Router {
    let messages = Router::new()
        .route("/send", post(send_message))
        .route("/group/send", post(send_group_message))
        .route("/conversation/{user_id}", get(get_conversation))
        .route("/conversations", get(list_conversations))
        .route("/unread", get(get_unread))
        .route("/read/{message_id}", put(mark_read))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            mw_require_auth,
        ));

    Router::new()
        .nest("/api/messages", messages)
        .route("/ws", get(ws_handler))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

pub async fn run() -> anyhow::Result<()> {
    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_err()
    {
        // Already set, ignore
    }

    info!("=== Messaging Server ===");

    let config = MessagingConfig::from_env()?;
    config.ensure_dirs().await?;
    info!("Data directory: {:?}", config.data_dir);
    info!("Users database: {:?}", config.users_db);

    let store = Arc::new(JsonMessageStore::new(&config).await?);
    let directory = Arc::new(SqliteDirectory::open(&config.users_db).await?);

    let addr = config.bind_addr;
    let state = AppState::new(config, store, directory.clone(), directory);
    let app = app(state);

    info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check(axum::extract::State(state): axum::extract::State<AppState>) -> String {
    format!(
        "OK - Messaging Server ({} users online)",
        state.presence.online_count()
    )
}
