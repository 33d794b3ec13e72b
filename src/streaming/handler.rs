//! Media stream handler (C10).
//!
//! Per-client read loop over a coordinator ring: new chunks are forwarded to
//! the client sink as they arrive, with a short idle sleep between empty
//! reads. On completion the client unregisters, and the registry entry is
//! dropped when it was the last one.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::StreamStatus;
use crate::streaming::coordinator::{Chunk, StreamCoordinator};
use crate::streaming::CoordinatorRegistry;

/// Poll interval while the reader is caught up with the ring.
const IDLE_SLEEP: Duration = Duration::from_millis(10);

/// Outcome of one client's relay loop.
#[derive(Debug)]
pub struct StreamStats {
    pub bytes_written: u64,
    pub status: StreamStatus,
}

/// Relay chunks from `coordinator` into `sink` until the client goes away or
/// the stream ends. The caller must already have registered the client; its
/// cursor is passed in. Unregisters on exit and removes the coordinator from
/// the registry when this was the last client.
pub async fn relay_to_client(
    registry: &CoordinatorRegistry,
    coordinator: Arc<StreamCoordinator>,
    slug: &str,
    mut cursor: u64,
    sink: mpsc::Sender<Result<Bytes, std::io::Error>>,
    client_cancel: CancellationToken,
) -> StreamStats {
    let mut bytes_written: u64 = 0;
    let status;

    'outer: loop {
        if client_cancel.is_cancelled() {
            status = StreamStatus::ClientClosed;
            break;
        }

        let (chunks, terminal, next) = coordinator.read_chunks(cursor);
        cursor = next;

        if chunks.is_empty() {
            if let Some(terminal) = terminal {
                status = match terminal.as_ref() {
                    Chunk::Terminal { status, message } => {
                        debug!("Stream terminal for client: {} ({:?})", message, status);
                        *status
                    }
                    Chunk::Data(_) => StreamStatus::ServerError,
                };
                break;
            }
            tokio::select! {
                _ = client_cancel.cancelled() => {
                    status = StreamStatus::ClientClosed;
                    break 'outer;
                }
                _ = tokio::time::sleep(IDLE_SLEEP) => continue,
            }
        }

        for chunk in chunks {
            match chunk.as_ref() {
                Chunk::Data(data) => {
                    let sent = tokio::select! {
                        _ = client_cancel.cancelled() => {
                            status = StreamStatus::ClientClosed;
                            break 'outer;
                        }
                        sent = sink.send(Ok(data.clone())) => sent,
                    };
                    if sent.is_err() {
                        status = StreamStatus::ClientClosed;
                        break 'outer;
                    }
                    bytes_written += data.len() as u64;
                }
                Chunk::Terminal { status: terminal_status, .. } => {
                    status = *terminal_status;
                    break 'outer;
                }
            }
        }
    }

    let last = coordinator.unregister_client();
    if last {
        registry.remove_if_idle(slug).await;
    }

    debug!(
        "Client relay finished: {} bytes, {:?} (last={})",
        bytes_written, status, last
    );
    StreamStats {
        bytes_written,
        status,
    }
}
