//! Mount directory watcher.
//!
//! Local edits propagate to the server as they happen: writes and creates
//! upload, removals delete. A rename only deletes the old name; the new name
//! shows up as a separate create event. Every handler runs under the shared
//! coordination mutex with its own deadline, and a failed handler is logged
//! and dropped rather than retried.

use crate::client::Client;
use crate::error::SyncResult;
use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Deadline for one event's RPC round-trip.
pub const DEFAULT_EVENT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventAction {
    Store,
    Delete,
}

/// Watches one mirror directory and pushes local changes to the server.
pub struct MirrorWatcher {
    client: Arc<Client>,
    coord: Arc<Mutex<()>>,
    event_timeout: Duration,
}

impl MirrorWatcher {
    pub fn new(client: Arc<Client>, coord: Arc<Mutex<()>>, event_timeout: Duration) -> Self {
        Self {
            client,
            coord,
            event_timeout,
        }
    }

    /// Watch `mount` until cancelled.
    pub async fn run(&self, mount: PathBuf, cancel: CancellationToken) -> SyncResult<()> {
        // notify delivers on its own thread; bridge into the async side.
        let (tx, mut rx) = mpsc::channel::<Result<Event, notify::Error>>(100);
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.blocking_send(res);
            },
            Config::default(),
        )?;
        watcher.watch(&mount, RecursiveMode::NonRecursive)?;
        info!("watching mirror directory: {}", mount.display());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("watcher stopped");
                    return Ok(());
                }
                event = rx.recv() => match event {
                    None => return Ok(()),
                    Some(Err(e)) => error!("watcher error: {}", e),
                    Some(Ok(event)) => self.handle_event(event, &cancel).await,
                }
            }
        }
    }

    async fn handle_event(&self, event: Event, cancel: &CancellationToken) {
        for path in &event.paths {
            let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            // Dotfiles (the watch lock among them) are not mirrored.
            if filename.starts_with('.') {
                continue;
            }
            let Some(action) = classify(&event.kind, path) else {
                continue;
            };

            let _guard = self.coord.lock().await;
            let outcome = tokio::time::timeout(self.event_timeout, async {
                match action {
                    EventAction::Store => {
                        debug!("local change to {}, storing", filename);
                        self.client.store(filename, cancel).await
                    }
                    EventAction::Delete => {
                        debug!("local removal of {}, deleting on server", filename);
                        self.client.delete(filename).await
                    }
                }
            })
            .await;

            match outcome {
                Ok(Ok(())) => info!("propagated {:?} of {}", action, filename),
                Ok(Err(e)) => error!("failed to propagate {:?} of {}: {}", action, filename, e),
                Err(_) => error!("propagating {:?} of {} timed out", action, filename),
            }
        }
    }
}

/// Map a filesystem event onto the server operation it implies.
fn classify(kind: &EventKind, path: &Path) -> Option<EventAction> {
    match kind {
        EventKind::Create(_) => Some(EventAction::Store),
        EventKind::Remove(_) => Some(EventAction::Delete),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some(EventAction::Delete),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(EventAction::Store),
        // Platform could not say which side of the rename this is.
        EventKind::Modify(ModifyKind::Name(_)) => {
            if path.exists() {
                Some(EventAction::Store)
            } else {
                Some(EventAction::Delete)
            }
        }
        EventKind::Modify(_) => Some(EventAction::Store),
        _ => None,
    }
}
