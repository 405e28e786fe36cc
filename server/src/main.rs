use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

mod handlers;
mod logic;
mod remote;
mod sessions;
mod sld;
mod state;
mod storage;

use crate::handlers::{
    annotations_handler, call_handler, protocol_handler, wms_handler, ws_handler,
};
use crate::sessions::save_all_sessions;
use crate::state::{AppState, BACKUP_INTERVAL, DEFAULT_CALL_TIMEOUT};
use crate::storage::FileStorage;

#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    /// Where annotation snapshots are kept.
    #[arg(long)]
    session_dir: Option<PathBuf>,
    #[arg(long, env = "PORT", default_value_t = 3000)]
    port: u16,
    /// How long to wait for the map client to answer a call.
    #[arg(long)]
    call_timeout_ms: Option<u64>,
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws/:session_id", get(ws_handler))
        .route("/api/:session_id/protocol", get(protocol_handler))
        .route("/api/:session_id/call/:procedure", post(call_handler))
        .route("/api/:session_id/wms", post(wms_handler))
        .route("/api/:session_id/annotations", get(annotations_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("geobridge_host=info,tower_http=info")),
        )
        .init();

    let args = Args::parse();
    let session_dir = args
        .session_dir
        .unwrap_or_else(|| PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../sessions"));
    if let Err(error) = tokio::fs::create_dir_all(&session_dir).await {
        tracing::error!(dir = %session_dir.display(), "failed to create session dir: {error}");
    }
    let call_timeout = args
        .call_timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_CALL_TIMEOUT);
    let state = AppState::new(Arc::new(FileStorage::new(session_dir)), call_timeout);

    let backup_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(BACKUP_INTERVAL);
        loop {
            interval.tick().await;
            save_all_sessions(&backup_state).await;
        }
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    tracing::info!("geobridge host listening on http://localhost:{}", args.port);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind server");
    axum::serve(listener, router(state))
        .await
        .expect("Server crashed");
}
