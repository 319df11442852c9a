//! # Chatfold-rs
//!
//! A server for chat conversations stored as plain folders.
//!
//! Every sub-folder of the storage root is one conversation. Its messages live
//! in `messages.json`; any other file dropped into the folder (a photo, a PDF,
//! a text note) is picked up by reconciliation and turned into a message, so
//! the folder and the message list stay in step.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌─────────────────┐
//! │  Frontend   │────▶│  Axum HTTP   │────▶│  Library        │
//! │  (static/)  │     │  (api.rs)    │     │  (library.rs)   │
//! └─────────────┘     └──────────────┘     └────────┬────────┘
//!       ▲ SSE                                       │
//!       │             ┌──────────────┐     ┌────────▼────────┐
//!       └─────────────│  Watcher     │────▶│  <storage>/     │
//!                     │  (notify)    │     │  <folder>/...   │
//!                     └──────────────┘     └─────────────────┘
//! ```
//!
//! ## API Endpoints
//!
//! - `GET /health` - Server health check
//! - `GET /api/stream` - SSE event stream
//! - `GET /api/conversations` - List conversations, newest first
//! - `POST /api/conversations` - Create a `NewChatN` folder
//! - `POST /api/update-folders` - Resync the list with the storage folder
//! - `PATCH /api/conversations/{id}` - Rename
//! - `DELETE /api/conversations/{id}` - Move to the recycle bin
//! - `GET /api/conversations/{id}/files` - Files in the folder
//! - `GET|POST /api/conversations/{id}/messages` - Read or append messages
//! - `PATCH|DELETE /api/conversations/{id}/messages/{message_id}` - Edit one message
//! - `PUT /api/conversations/{id}/messages/order` - Reorder
//! - `POST /api/conversations/{id}/reconcile` - Import orphan files
//! - `POST /api/conversations/{id}/upload` - Upload a file as a message

mod api;
mod config;
mod conversations;
mod ids;
mod library;
mod mtime;
mod paths;
mod reconcile;
mod reply;
mod scanner;
mod store;
mod sync;
mod synth;
mod watcher;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, patch, post, put},
    Router,
};
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};
use tower_http::{cors::CorsLayer, services::ServeDir};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::ids::SystemClock;
use crate::library::Library;

const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

pub struct AppState {
    pub start_time: Instant,
    pub library: Arc<Library>,
    seq: AtomicU64,
}

impl AppState {
    /// Next SSE event id
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }
}

fn router(state: Arc<AppState>, config: &Config) -> Router {
    Router::new()
        // Health
        .route("/health", get(api::health))
        // SSE
        .route("/api/stream", get(api::stream_events))
        // Conversations
        .route(
            "/api/conversations",
            get(api::list_conversations).post(api::create_conversation),
        )
        .route("/api/update-folders", post(api::update_folders))
        .route(
            "/api/conversations/{id}",
            patch(api::rename_conversation).delete(api::delete_conversation),
        )
        .route("/api/conversations/{id}/files", get(api::list_files))
        // Messages
        .route(
            "/api/conversations/{id}/messages",
            get(api::get_messages).post(api::append_message),
        )
        .route("/api/conversations/{id}/messages/order", put(api::reorder_messages))
        .route(
            "/api/conversations/{id}/messages/{message_id}",
            patch(api::update_message).delete(api::delete_message),
        )
        .route("/api/conversations/{id}/reconcile", post(api::reconcile))
        .route("/api/conversations/{id}/upload", post(api::upload_file))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(CorsLayer::permissive())
        // Static files
        .fallback_service(ServeDir::new(&config.static_dir).append_index_html_on_directories(true))
        .with_state(state)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("chatfold_rs=info".parse().unwrap())
            .add_directive("tower_http=info".parse().unwrap()))
        .init();

    let config = Config::from_env();
    if let Err(e) = tokio::fs::create_dir_all(&config.storage_path).await {
        tracing::error!("Cannot create storage folder {}: {}", config.storage_path.display(), e);
        std::process::exit(1);
    }
    tracing::info!("Storage folder: {}", config.storage_path.display());

    let library = Library::new(config.storage_path.clone(), Arc::new(SystemClock));
    library.load_index().await;

    if config.watch {
        tokio::spawn(watcher::start(library.clone()));
    } else {
        tracing::info!("Storage watcher disabled");
        if let Err(e) = library.update_folders().await {
            tracing::warn!("Initial folder update failed: {}", e);
        }
    }

    let state = Arc::new(AppState {
        start_time: Instant::now(),
        library,
        seq: AtomicU64::new(0),
    });
    let app = router(state, &config);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Chatfold-rs v{} listening on {}", env!("CARGO_PKG_VERSION"), addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
