//! mirrorfs: an AFS-style file mirror.
//!
//! A central server owns a flat namespace of files; clients keep a local
//! mirror converged by streaming whole-file transfers. Writes are serialised
//! per file by server-side leases, deletions propagate through tombstones
//! merged into listings, and each client runs a periodic reconciler next to
//! a filesystem watcher.

pub mod checksum;
pub mod chunk;
pub mod cli;
pub mod client;
pub mod error;
pub mod server;
pub mod storage;
pub mod wire;

use axum::{routing::get, Router};
use server::FileService;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

async fn health_check() -> &'static str {
    "OK"
}

/// Assemble the full server router over a file service.
pub fn create_router(service: Arc<FileService>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .merge(server::router(service))
        .layer(TraceLayer::new_for_http())
}
