//! HTTP facade for the file service.
//!
//! Unary operations are JSON in, JSON out. Store and fetch bridge streaming
//! HTTP bodies onto bounded chunk streams so the transport and the disk side
//! run as a producer/consumer pair with backpressure. Listings go through a
//! single dispatcher task behind a bounded queue, which coalesces bursts of
//! polls into one storage walk.

use crate::chunk::{self, DEFAULT_STREAM_CAPACITY};
use crate::error::{SyncError, SyncResult};
use crate::server::service::FileService;
use crate::wire::{
    encode_frame, DeleteRequest, FileData, FileEntry, FrameReader, ListRequest, ListResponse,
    OpResponse, StoreResponse, WriteAccessRequest,
};
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Queue depth for pending listing requests.
pub const LISTING_QUEUE_SIZE: usize = 1000;

#[derive(Clone)]
pub struct ApiState {
    service: Arc<FileService>,
    listing_tx: mpsc::Sender<ListingRequest>,
}

struct ListingRequest {
    client_id: String,
    reply: oneshot::Sender<Result<ListResponse, String>>,
}

impl SyncError {
    fn status_code(&self) -> StatusCode {
        match self {
            SyncError::NotFound(_) => StatusCode::NOT_FOUND,
            SyncError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            SyncError::LockConflict { .. } | SyncError::LockOwnership => StatusCode::CONFLICT,
            SyncError::Cancelled => StatusCode::REQUEST_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for SyncError {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}

/// Build the `/fs` routes over a file service and start its listing
/// dispatcher.
pub fn router(service: Arc<FileService>) -> Router {
    let (listing_tx, listing_rx) = mpsc::channel(LISTING_QUEUE_SIZE);
    tokio::spawn(listing_dispatcher(service.clone(), listing_rx));

    let state = ApiState {
        service,
        listing_tx,
    };
    Router::new()
        .route("/fs/acquire", post(acquire_write_access))
        .route("/fs/delete", post(delete_file))
        .route("/fs/stat/:filename", get(get_file_stat))
        .route("/fs/store", post(store_file))
        .route("/fs/fetch/:filename", get(fetch_file))
        .route("/fs/files", post(request_files))
        .with_state(state)
}

async fn acquire_write_access(
    State(state): State<ApiState>,
    Json(req): Json<WriteAccessRequest>,
) -> Response {
    if req.filename.is_empty() || req.client_id.is_empty() {
        return SyncError::invalid_argument("filename and client_id are required").into_response();
    }
    match state
        .service
        .acquire_write_lock(&req.filename, &req.client_id)
        .await
    {
        Ok(()) => Json(OpResponse::ok()).into_response(),
        Err(e) => Json(OpResponse::denied(e)).into_response(),
    }
}

async fn delete_file(State(state): State<ApiState>, Json(req): Json<DeleteRequest>) -> Response {
    if req.filename.is_empty() || req.client_id.is_empty() {
        return SyncError::invalid_argument("filename and client_id are required").into_response();
    }
    let result = state.service.delete(&req.filename, &req.client_id).await;

    // The client's write access is server-released; skip when the failure
    // was someone else's live lock.
    if !matches!(result, Err(SyncError::LockConflict { .. })) {
        if let Err(e) = state
            .service
            .release_lock(&req.filename, &req.client_id)
            .await
        {
            warn!("unable to release lock on {}: {}", req.filename, e);
        }
    }

    match result {
        Ok(()) => Json(OpResponse::ok()).into_response(),
        Err(e @ SyncError::LockConflict { .. }) => Json(OpResponse::denied(e)).into_response(),
        Err(e) if e.is_not_found() => Json(OpResponse::denied(e)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn get_file_stat(
    State(state): State<ApiState>,
    Path(filename): Path<String>,
) -> Result<Json<FileEntry>, SyncError> {
    Ok(Json(state.service.stat(&filename).await?))
}

async fn store_file(State(state): State<ApiState>, body: Body) -> Response {
    // Run the whole transfer in its own task so a dropped connection still
    // drains, completes and releases the lock.
    match tokio::spawn(run_store(state, body)).await {
        Ok(Ok(resp)) => Json(resp).into_response(),
        Ok(Err(e)) => e.into_response(),
        Err(_) => SyncError::Cancelled.into_response(),
    }
}

async fn run_store(state: ApiState, body: Body) -> SyncResult<StoreResponse> {
    let mut data = body.into_data_stream();
    let mut frames = FrameReader::new();

    // The first frame names the file and the writing client.
    let first: FileData = loop {
        if let Some(frame) = frames.next_frame::<FileData>()? {
            break frame;
        }
        match data.next().await {
            Some(Ok(bytes)) => frames.push(&bytes),
            Some(Err(e)) => return Err(SyncError::transport(e)),
            None => match frames.finish::<FileData>()? {
                Some(frame) => break frame,
                None => return Err(SyncError::invalid_argument("store stream carried no frames")),
            },
        }
    };
    if first.filename.is_empty() || first.client_id.is_empty() {
        return Err(SyncError::invalid_argument(
            "filename and client_id are required",
        ));
    }
    let filename = first.filename.clone();
    let client_id = first.client_id.clone();
    debug!("store stream opened for {} by client {}", filename, client_id);

    let (tx, rx) = chunk::bounded(DEFAULT_STREAM_CAPACITY);
    let cancel = CancellationToken::new();
    let store_task = tokio::spawn({
        let service = state.service.clone();
        let filename = filename.clone();
        let client_id = client_id.clone();
        let cancel = cancel.clone();
        async move { service.store(&filename, &client_id, rx, &cancel).await }
    });

    // Pump the remaining frames into the bounded stream.
    let pumped: SyncResult<()> = async {
        tx.send(Bytes::from(first.decode_content()?)).await?;
        loop {
            while let Some(frame) = frames.next_frame::<FileData>()? {
                tx.send(Bytes::from(frame.decode_content()?)).await?;
            }
            match data.next().await {
                Some(Ok(bytes)) => frames.push(&bytes),
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
    .await;

    if pumped.is_err() {
        cancel.cancel();
    }
    drop(tx); // end-of-stream for the service side

    let stored = match store_task.await {
        Ok(result) => result,
        Err(e) => Err(SyncError::transport(e)),
    };

    // Lock released on every exit path: success, bad frames, storage error.
    if let Err(e) = state.service.release_lock(&filename, &client_id).await {
        warn!("unable to release lock on {}: {}", filename, e);
    }

    match (stored, pumped) {
        (Ok(()), Ok(())) => Ok(StoreResponse { success: true }),
        // A store failure of its own beats the Cancelled echo of a pump failure.
        (Err(e), _) if !matches!(e, SyncError::Cancelled) => Err(e),
        (_, Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
    }
}

#[derive(Deserialize)]
struct FetchParams {
    #[serde(default)]
    client_id: String,
}

async fn fetch_file(
    State(state): State<ApiState>,
    Path(filename): Path<String>,
    Query(params): Query<FetchParams>,
) -> Result<Response, SyncError> {
    let meta = state.service.stat(&filename).await?;
    if meta.deleted {
        return Err(SyncError::not_found(filename));
    }

    let (tx, rx) = chunk::bounded(DEFAULT_STREAM_CAPACITY);
    let cancel = CancellationToken::new();
    tokio::spawn({
        let service = state.service.clone();
        let filename = filename.clone();
        let cancel = cancel.clone();
        async move {
            if let Err(e) = service.fetch(&filename, tx, &cancel).await {
                warn!("fetch of {} ended early: {}", filename, e);
            }
        }
    });

    let frames = futures::stream::unfold(
        (rx, filename, params.client_id),
        |(mut rx, filename, client_id)| async move {
            let chunk = rx.recv().await?;
            let frame = encode_frame(&FileData::new(&filename, &client_id, &chunk, 0));
            Some((frame, (rx, filename, client_id)))
        },
    );
    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(frames),
    )
        .into_response())
}

async fn request_files(State(state): State<ApiState>, Json(req): Json<ListRequest>) -> Response {
    let (reply_tx, reply_rx) = oneshot::channel();
    let queued = state
        .listing_tx
        .send(ListingRequest {
            client_id: req.client_id,
            reply: reply_tx,
        })
        .await;
    if queued.is_err() {
        return SyncError::transport("listing dispatcher is gone").into_response();
    }
    match reply_rx.await {
        Ok(Ok(response)) => Json(response).into_response(),
        Ok(Err(msg)) => (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response(),
        Err(_) => SyncError::Cancelled.into_response(),
    }
}

/// Single consumer over the listing queue: drain whatever has piled up, walk
/// storage once, and hand every waiter the same response. A waiter that gave
/// up just drops its reply channel.
async fn listing_dispatcher(service: Arc<FileService>, mut queue: mpsc::Receiver<ListingRequest>) {
    while let Some(first) = queue.recv().await {
        let mut waiters = vec![first];
        while let Ok(req) = queue.try_recv() {
            waiters.push(req);
        }
        match service.list().await {
            Ok(files) => {
                let response = ListResponse { files };
                for waiter in waiters {
                    debug!(
                        "listing of {} entries for client {}",
                        response.files.len(),
                        waiter.client_id
                    );
                    let _ = waiter.reply.send(Ok(response.clone()));
                }
            }
            Err(e) => {
                warn!("listing failed: {}", e);
                let msg = e.to_string();
                for waiter in waiters {
                    let _ = waiter.reply.send(Err(msg.clone()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DiskStorage;

    async fn temp_state() -> (tempfile::TempDir, ApiState) {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::new(dir.path()).await.unwrap();
        let service = FileService::new(Arc::new(storage));
        let (listing_tx, listing_rx) = mpsc::channel(LISTING_QUEUE_SIZE);
        tokio::spawn(listing_dispatcher(service.clone(), listing_rx));
        (
            dir,
            ApiState {
                service,
                listing_tx,
            },
        )
    }

    fn ndjson_store_body(filename: &str, client_id: &str, chunks: &[&[u8]]) -> Body {
        let mut body = Vec::new();
        for chunk in chunks {
            let frame = FileData::new(filename, client_id, chunk, 0);
            body.extend_from_slice(&encode_frame(&frame).unwrap());
        }
        Body::from(body)
    }

    #[tokio::test]
    async fn test_run_store_writes_chunks_in_order() {
        let (dir, state) = temp_state().await;
        let body = ndjson_store_body("s.txt", "a", &[b"alpha ", b"beta ", b"gamma"]);
        let resp = run_store(state, body).await.unwrap();
        assert!(resp.success);
        assert_eq!(
            std::fs::read(dir.path().join("s.txt")).unwrap(),
            b"alpha beta gamma"
        );
    }

    #[tokio::test]
    async fn test_run_store_rejects_missing_identifiers() {
        let (_dir, state) = temp_state().await;
        let body = ndjson_store_body("", "a", &[b"x"]);
        let err = run_store(state, body).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_run_store_rejects_empty_stream() {
        let (_dir, state) = temp_state().await;
        let err = run_store(state, Body::from("")).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_run_store_releases_lock() {
        let (_dir, state) = temp_state().await;
        state
            .service
            .acquire_write_lock("locked.txt", "a")
            .await
            .unwrap();

        let body = ndjson_store_body("locked.txt", "a", &[b"payload"]);
        run_store(state.clone(), body).await.unwrap();

        // Another client can take the lock immediately afterwards.
        state
            .service
            .acquire_write_lock("locked.txt", "b")
            .await
            .unwrap();
        state.service.shutdown();
    }

    #[tokio::test]
    async fn test_dispatcher_replies_to_every_waiter() {
        let (_dir, state) = temp_state().await;
        let mut replies = Vec::new();
        for i in 0..5 {
            let (tx, rx) = oneshot::channel();
            state
                .listing_tx
                .send(ListingRequest {
                    client_id: format!("client-{}", i),
                    reply: tx,
                })
                .await
                .unwrap();
            replies.push(rx);
        }
        for rx in replies {
            let listing = rx.await.unwrap().unwrap();
            assert!(listing.files.is_empty());
        }
    }

    #[tokio::test]
    async fn test_dispatcher_survives_dropped_waiter() {
        let (_dir, state) = temp_state().await;
        let (tx, rx) = oneshot::channel();
        state
            .listing_tx
            .send(ListingRequest {
                client_id: "gone".to_string(),
                reply: tx,
            })
            .await
            .unwrap();
        drop(rx);

        // A later waiter still gets served.
        let (tx, rx) = oneshot::channel();
        state
            .listing_tx
            .send(ListingRequest {
                client_id: "alive".to_string(),
                reply: tx,
            })
            .await
            .unwrap();
        assert!(rx.await.unwrap().is_ok());
    }
}
