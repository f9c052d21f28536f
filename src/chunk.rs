//! Bounded chunk streams.
//!
//! A finite-capacity FIFO of byte buffers with explicit end-of-stream,
//! bridging an RPC-side task and a storage-side task within one store or
//! fetch. Senders block when the stream is full, receivers block when it is
//! empty, and the capacity bounds how much of a transfer sits in memory.

use crate::error::{SyncError, SyncResult};
use bytes::Bytes;
use tokio::sync::mpsc;

/// Default number of in-flight buffers per stream.
pub const DEFAULT_STREAM_CAPACITY: usize = 20;

/// Create a bounded chunk stream with the given capacity.
pub fn bounded(capacity: usize) -> (ChunkSender, ChunkReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (ChunkSender { tx }, ChunkReceiver { rx })
}

/// Producer half of a bounded chunk stream.
///
/// Dropping the sender closes the stream; [`ChunkSender::close`] makes that
/// explicit at the call site. Closing is idempotent because every close path
/// is a drop.
#[derive(Clone)]
pub struct ChunkSender {
    tx: mpsc::Sender<Bytes>,
}

impl ChunkSender {
    /// Send one chunk, waiting while the stream is at capacity.
    ///
    /// Fails with [`SyncError::Cancelled`] when the consumer has gone away,
    /// which is how a sink refuses further data.
    pub async fn send(&self, chunk: Bytes) -> SyncResult<()> {
        self.tx.send(chunk).await.map_err(|_| SyncError::Cancelled)
    }

    /// Close the stream, signalling end-of-data to the receiver.
    pub fn close(self) {}
}

/// Consumer half of a bounded chunk stream.
pub struct ChunkReceiver {
    rx: mpsc::Receiver<Bytes>,
}

impl ChunkReceiver {
    /// Receive the next chunk, waiting while the stream is empty.
    ///
    /// Returns `None` once the producer has closed the stream and all
    /// buffered chunks have been drained.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_fifo_order_and_close() {
        let (tx, mut rx) = bounded(4);
        tx.send(Bytes::from_static(b"one")).await.unwrap();
        tx.send(Bytes::from_static(b"two")).await.unwrap();
        tx.close();

        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"two"));
        assert!(rx.recv().await.is_none(), "close should end the stream");
    }

    #[tokio::test]
    async fn test_send_blocks_at_capacity() {
        let (tx, mut rx) = bounded(1);
        tx.send(Bytes::from_static(b"fill")).await.unwrap();

        // Stream is full: a second send must not complete yet.
        let blocked = timeout(Duration::from_millis(50), tx.send(Bytes::from_static(b"wait"))).await;
        assert!(blocked.is_err(), "send should block while at capacity");

        // Draining one chunk frees capacity for the pending send.
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"fill"));
        timeout(Duration::from_millis(200), tx.send(Bytes::from_static(b"wait")))
            .await
            .expect("send should proceed after a recv")
            .unwrap();
    }

    #[tokio::test]
    async fn test_send_fails_when_receiver_dropped() {
        let (tx, rx) = bounded(1);
        drop(rx);
        let err = tx.send(Bytes::from_static(b"chunk")).await.unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
    }
}
