//! Shared harness for integration tests: an in-process server on an
//! ephemeral port plus clients over temporary mirror directories.

#![allow(dead_code)]

use mirrorfs::client::Client;
use mirrorfs::create_router;
use mirrorfs::server::{FileService, LockManager, TombstoneRegistry};
use mirrorfs::storage::DiskStorage;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

pub struct TestServer {
    pub url: String,
    pub service: Arc<FileService>,
    pub mount: TempDir,
}

/// Spin up a server with default lock/tombstone settings.
pub async fn spawn_server() -> TestServer {
    spawn_server_with_parts(LockManager::new(), TombstoneRegistry::new()).await
}

/// Spin up a server with custom registries (short TTLs and the like).
pub async fn spawn_server_with_parts(
    locks: Arc<LockManager>,
    tombstones: Arc<TombstoneRegistry>,
) -> TestServer {
    let mount = tempfile::tempdir().unwrap();
    let storage = DiskStorage::new(mount.path()).await.unwrap();
    let service = FileService::with_parts(Arc::new(storage), locks, tombstones);
    let app = create_router(service.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        url: format!("http://{}", addr),
        service,
        mount,
    }
}

/// Connect a client with its own temporary mirror directory.
pub async fn connect(server: &TestServer, client_id: &str) -> (Arc<Client>, TempDir) {
    let mount = tempfile::tempdir().unwrap();
    let client = Client::connect(&server.url, client_id, mount.path())
        .await
        .unwrap();
    (client, mount)
}

pub fn write_file(dir: &Path, name: &str, content: &[u8]) {
    std::fs::write(dir.join(name), content).unwrap();
}

pub fn read_file(dir: &Path, name: &str) -> Vec<u8> {
    std::fs::read(dir.join(name)).unwrap()
}

pub fn file_exists(dir: &Path, name: &str) -> bool {
    dir.join(name).exists()
}
