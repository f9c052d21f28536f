//! Client side: the RPC client, the periodic reconciler and the mount
//! watcher.
//!
//! The reconciler and the watcher both mutate the local mirror and both talk
//! to the server, so every mutation happens under one shared coordination
//! mutex, taken per file and never held across a cadence sleep.

pub mod reconciler;
pub mod watcher;

pub use reconciler::Reconciler;
pub use watcher::MirrorWatcher;

use crate::chunk::{self, ChunkReceiver, DEFAULT_STREAM_CAPACITY};
use crate::error::{SyncError, SyncResult};
use crate::storage::{DiskStorage, Storage};
use crate::wire::{
    encode_frame, DeleteRequest, FileData, FileEntry, FrameReader, ListRequest, ListResponse,
    OpResponse, StoreResponse, WriteAccessRequest,
};
use bytes::Bytes;
use fs2::FileExt;
use futures::StreamExt;
use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Chunk size for uploads.
pub const CLIENT_CHUNK_SIZE: usize = 1048;

/// Lock file guarding a mirror directory against a second watch instance.
const WATCH_LOCK_FILENAME: &str = ".mirrorfs.lock";

/// RPC client plus the local mirror it maintains.
pub struct Client {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
    storage: Arc<dyn Storage>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("base_url", &self.base_url)
            .field("client_id", &self.client_id)
            .finish()
    }
}

impl Client {
    /// Connect to a server and open the local mirror directory, creating it
    /// on demand.
    pub async fn connect(server: &str, client_id: &str, mount: &Path) -> SyncResult<Arc<Self>> {
        if client_id.is_empty() {
            return Err(SyncError::invalid_argument("client id is required"));
        }
        let storage = DiskStorage::new(mount).await?;
        Ok(Arc::new(Self {
            http: reqwest::Client::new(),
            base_url: normalize_server_url(server),
            client_id: client_id.to_string(),
            storage: Arc::new(storage),
        }))
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The storage driver over the local mirror.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Take (or renew) the server-side write lock on a file.
    pub async fn acquire_write_access(&self, filename: &str) -> SyncResult<()> {
        let response = self
            .http
            .post(self.url("/fs/acquire"))
            .json(&WriteAccessRequest {
                filename: filename.to_string(),
                client_id: self.client_id.clone(),
            })
            .send()
            .await?;
        let response = expect_ok(response, filename).await?;
        let body: OpResponse = response.json().await?;
        if !body.success {
            return Err(SyncError::transport(format!(
                "write access to {} denied: {}",
                filename,
                body.error.unwrap_or_default()
            )));
        }
        Ok(())
    }

    /// Delete a file on the server. The server releases the lock itself.
    pub async fn delete(&self, filename: &str) -> SyncResult<()> {
        self.acquire_write_access(filename).await?;
        let response = self
            .http
            .post(self.url("/fs/delete"))
            .json(&DeleteRequest {
                filename: filename.to_string(),
                client_id: self.client_id.clone(),
            })
            .send()
            .await?;
        let response = expect_ok(response, filename).await?;
        let body: OpResponse = response.json().await?;
        if !body.success {
            return Err(SyncError::transport(format!(
                "delete of {} refused: {}",
                filename,
                body.error.unwrap_or_default()
            )));
        }
        Ok(())
    }

    /// Stat one file on the server.
    pub async fn get_file_stat(&self, filename: &str) -> SyncResult<FileEntry> {
        let response = self
            .http
            .get(self.url(&format!("/fs/stat/{}", filename)))
            .send()
            .await?;
        let response = expect_ok(response, filename).await?;
        Ok(response.json().await?)
    }

    /// Poll the merged server listing (live files plus tombstones).
    pub async fn request_files(&self) -> SyncResult<Vec<FileEntry>> {
        let response = self
            .http
            .post(self.url("/fs/files"))
            .json(&ListRequest {
                client_id: self.client_id.clone(),
            })
            .send()
            .await?;
        let response = expect_ok(response, "listing").await?;
        let body: ListResponse = response.json().await?;
        Ok(body.files)
    }

    /// Upload a local file: acquire the write lock, stream the content in
    /// bounded chunks, and let the server release the lock when the stream
    /// ends.
    pub async fn store(&self, filename: &str, cancel: &CancellationToken) -> SyncResult<()> {
        self.acquire_write_access(filename).await?;
        let meta = self.storage.stat(filename).await?;

        let (tx, rx) = chunk::bounded(DEFAULT_STREAM_CAPACITY);
        let reader = tokio::spawn({
            let storage = self.storage.clone();
            let filename = filename.to_string();
            let cancel = cancel.clone();
            async move { storage.read(&filename, CLIENT_CHUNK_SIZE, &tx, &cancel).await }
        });

        let frames = store_frames(
            rx,
            filename.to_string(),
            self.client_id.clone(),
            meta.crc_checksum,
        );
        let response = self
            .http
            .post(self.url("/fs/store"))
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(reqwest::Body::wrap_stream(frames))
            .send()
            .await?;
        let response = expect_ok(response, filename).await?;

        match reader.await {
            Ok(result) => result?,
            Err(e) => return Err(SyncError::transport(e)),
        }

        let body: StoreResponse = response.json().await?;
        if !body.success {
            return Err(SyncError::transport(format!(
                "store of {} was rejected",
                filename
            )));
        }
        debug!("stored {} on server", filename);
        Ok(())
    }

    /// Download a file into the local mirror. Chunks go straight to disk
    /// through a bounded stream; a failure mid-stream can leave a partial
    /// file, which the next successful transfer truncates.
    pub async fn fetch(&self, filename: &str, cancel: &CancellationToken) -> SyncResult<()> {
        let response = self
            .http
            .get(self.url(&format!("/fs/fetch/{}", filename)))
            .query(&[("client_id", self.client_id.as_str())])
            .send()
            .await?;
        let response = expect_ok(response, filename).await?;

        let (tx, rx) = chunk::bounded(DEFAULT_STREAM_CAPACITY);
        let writer = tokio::spawn({
            let storage = self.storage.clone();
            let filename = filename.to_string();
            async move { write_chunks(storage, &filename, rx).await }
        });

        let mut body = response.bytes_stream();
        let mut frames = FrameReader::new();
        let received: SyncResult<()> = async {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                    next = body.next() => match next {
                        Some(Ok(bytes)) => {
                            frames.push(&bytes);
                            while let Some(frame) = frames.next_frame::<FileData>()? {
                                tx.send(Bytes::from(frame.decode_content()?)).await?;
                            }
                        }
                        Some(Err(e)) => return Err(SyncError::transport(e)),
                        None => {
                            if let Some(frame) = frames.finish::<FileData>()? {
                                tx.send(Bytes::from(frame.decode_content()?)).await?;
                            }
                            return Ok(());
                        }
                    }
                }
            }
        }
        .await;

        drop(tx);
        let written = match writer.await {
            Ok(result) => result,
            Err(e) => Err(SyncError::transport(e)),
        };
        received?;
        written?;
        debug!("fetched {} from server", filename);
        Ok(())
    }
}

/// Drain a chunk stream to disk: first chunk truncates, the rest append. An
/// empty stream still truncates, so an empty remote file mirrors correctly.
async fn write_chunks(
    storage: Arc<dyn Storage>,
    filename: &str,
    mut rx: ChunkReceiver,
) -> SyncResult<()> {
    let mut overwrite = true;
    while let Some(chunk) = rx.recv().await {
        storage.save(filename, &chunk, overwrite).await?;
        overwrite = false;
    }
    if overwrite {
        storage.save(filename, b"", true).await?;
    }
    Ok(())
}

struct FrameState {
    rx: ChunkReceiver,
    filename: String,
    client_id: String,
    crc_checksum: u32,
    sent_any: bool,
    done: bool,
}

/// Turn a chunk stream into NDJSON frames. At least one frame is always
/// produced so the server learns the filename even for an empty file.
fn store_frames(
    rx: ChunkReceiver,
    filename: String,
    client_id: String,
    crc_checksum: u32,
) -> impl futures::Stream<Item = SyncResult<Bytes>> + Send {
    let state = FrameState {
        rx,
        filename,
        client_id,
        crc_checksum,
        sent_any: false,
        done: false,
    };
    futures::stream::unfold(state, |mut s| async move {
        if s.done {
            return None;
        }
        match s.rx.recv().await {
            Some(chunk) => {
                s.sent_any = true;
                let frame = encode_frame(&FileData::new(
                    &s.filename,
                    &s.client_id,
                    &chunk,
                    s.crc_checksum,
                ));
                Some((frame, s))
            }
            None => {
                s.done = true;
                if s.sent_any {
                    None
                } else {
                    let frame = encode_frame(&FileData::new(
                        &s.filename,
                        &s.client_id,
                        b"",
                        s.crc_checksum,
                    ));
                    Some((frame, s))
                }
            }
        }
    })
}

/// Map an HTTP status onto the error the operation actually hit.
async fn expect_ok(response: reqwest::Response, context: &str) -> SyncResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(SyncError::not_found(context));
    }
    let body = response.text().await.unwrap_or_default();
    Err(SyncError::transport(format!("{}: {}", status, body)))
}

fn normalize_server_url(server: &str) -> String {
    let trimmed = server.trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    }
}

/// Take an exclusive lock on the mirror directory so only one watch instance
/// runs per checkout. The handle must stay alive for the duration.
pub fn acquire_watch_lock(mount: &Path) -> io::Result<File> {
    let lock_path = mount.join(WATCH_LOCK_FILENAME);
    let lock_file = File::create(&lock_path)?;
    match lock_file.try_lock_exclusive() {
        Ok(()) => {
            info!("acquired watch lock for {}", mount.display());
            Ok(lock_file)
        }
        Err(e) => {
            error!(
                "another watch is already running for {}: {}",
                mount.display(),
                e
            );
            Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("another watch is already running for {}", mount.display()),
            ))
        }
    }
}
