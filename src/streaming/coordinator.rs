//! Stream coordinator (C9).
//!
//! One coordinator exists per actively watched channel. It owns a bounded
//! ring of byte chunks fed by a single writer task reading the upstream
//! response; any number of readers follow the ring with their own cursors.
//! Readers never block the writer: when the ring is full the oldest chunk is
//! dropped, so a lagging reader observes a gap but never corruption. When
//! the client count drops to zero the writer is cancelled.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::StreamStatus;
use crate::proxy::BalanceResult;

/// One element of the ring: payload bytes, or the terminal marker that ends
/// the stream.
#[derive(Debug)]
pub enum Chunk {
    Data(Bytes),
    Terminal { status: StreamStatus, message: String },
}

struct Ring {
    chunks: VecDeque<Arc<Chunk>>,
    /// Sequence number of the chunk at the front of the deque
    start: u64,
    terminal: Option<Arc<Chunk>>,
}

pub struct StreamCoordinator {
    slug: String,
    capacity: usize,
    client_count: AtomicI32,
    writer_started: AtomicBool,
    writer_cancel: CancellationToken,
    ring: Mutex<Ring>,
    /// Upstream Content-Type, recorded when the writer starts so that
    /// late-joining clients answer with the same header.
    content_type: std::sync::OnceLock<String>,
}

impl StreamCoordinator {
    pub fn new(slug: String, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            slug,
            capacity: capacity.max(1),
            client_count: AtomicI32::new(0),
            writer_started: AtomicBool::new(false),
            writer_cancel: CancellationToken::new(),
            ring: Mutex::new(Ring {
                chunks: VecDeque::new(),
                start: 0,
                terminal: None,
            }),
            content_type: std::sync::OnceLock::new(),
        })
    }

    /// Content-Type advertised to clients of this coordinator.
    pub fn content_type(&self) -> &str {
        self.content_type
            .get()
            .map(|s| s.as_str())
            .unwrap_or("application/octet-stream")
    }

    /// Attach one client. Returns its starting cursor (the current ring
    /// tail) and whether it was the first client, in which case the caller
    /// must start the writer.
    pub fn register_client(&self) -> (u64, bool) {
        let previous = self.client_count.fetch_add(1, Ordering::AcqRel);
        let ring = self.ring.lock().expect("ring lock");
        let cursor = ring.start + ring.chunks.len() as u64;
        debug!(
            "Client joined coordinator {} (clients={})",
            short(&self.slug),
            previous + 1
        );
        (cursor, previous == 0)
    }

    /// Detach one client. When the last client leaves the writer is
    /// signalled to stop; returns true in that case.
    pub fn unregister_client(&self) -> bool {
        let remaining = self.client_count.fetch_sub(1, Ordering::AcqRel) - 1;
        debug!(
            "Client left coordinator {} (clients={})",
            short(&self.slug),
            remaining
        );
        if remaining <= 0 {
            self.writer_cancel.cancel();
            return true;
        }
        false
    }

    pub fn client_count(&self) -> i32 {
        self.client_count.load(Ordering::Acquire)
    }

    /// Non-blocking read of everything between `cursor` and the ring tail.
    ///
    /// Returns the chunks, the terminal chunk once the caller has caught up
    /// with it, and the new cursor. A cursor that fell behind the ring start
    /// is snapped forward: the reader skips the dropped chunks.
    pub fn read_chunks(&self, cursor: u64) -> (Vec<Arc<Chunk>>, Option<Arc<Chunk>>, u64) {
        let ring = self.ring.lock().expect("ring lock");
        let effective = cursor.max(ring.start);
        let offset = (effective - ring.start) as usize;
        let chunks: Vec<Arc<Chunk>> = ring.chunks.iter().skip(offset).cloned().collect();
        let new_cursor = ring.start + ring.chunks.len() as u64;
        let terminal = if chunks.is_empty() {
            ring.terminal.clone()
        } else {
            None
        };
        (chunks, terminal, new_cursor)
    }

    /// Push one data chunk, evicting the oldest when the ring is full.
    fn push_data(&self, data: Bytes) {
        let mut ring = self.ring.lock().expect("ring lock");
        ring.chunks.push_back(Arc::new(Chunk::Data(data)));
        while ring.chunks.len() > self.capacity {
            ring.chunks.pop_front();
            ring.start += 1;
        }
    }

    /// Publish the terminal marker. Only the first terminal wins.
    fn push_terminal(&self, status: StreamStatus, message: impl Into<String>) {
        let mut ring = self.ring.lock().expect("ring lock");
        if ring.terminal.is_none() {
            ring.terminal = Some(Arc::new(Chunk::Terminal {
                status,
                message: message.into(),
            }));
        }
    }

    /// True once the terminal chunk is published.
    pub fn finished(&self) -> bool {
        self.ring.lock().expect("ring lock").terminal.is_some()
    }

    /// End the stream without a writer, e.g. when balancing failed after
    /// clients already attached. Readers observe the terminal and leave.
    pub fn abort(&self, status: StreamStatus, message: impl Into<String>) {
        self.push_terminal(status, message);
    }

    /// Spawn the single writer task reading from the balanced upstream.
    /// Only the first call has any effect. The concurrency slot held by
    /// `result` is released when the writer exits.
    pub fn start_writer(self: Arc<Self>, result: BalanceResult, chunk_timeout: Duration) {
        if self.writer_started.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(content_type) = result
            .response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
        {
            let _ = self.content_type.set(content_type.to_string());
        }
        tokio::spawn(async move {
            self.write_loop(result, chunk_timeout).await;
        });
    }

    async fn write_loop(&self, result: BalanceResult, chunk_timeout: Duration) {
        let BalanceResult {
            mut response,
            url: _,
            source_id,
            sub_index,
            guard,
        } = result;

        debug!(
            "Writer started for coordinator {} (source '{}' sub {})",
            short(&self.slug),
            source_id,
            sub_index
        );

        loop {
            let read = tokio::select! {
                _ = self.writer_cancel.cancelled() => {
                    self.push_terminal(StreamStatus::ClientClosed, "all clients left");
                    break;
                }
                read = tokio::time::timeout(chunk_timeout, response.chunk()) => read,
            };
            match read {
                Ok(Ok(Some(bytes))) => {
                    if !bytes.is_empty() {
                        self.push_data(bytes);
                    }
                }
                Ok(Ok(None)) => {
                    self.push_terminal(StreamStatus::UpstreamError, "upstream ended the stream");
                    break;
                }
                Ok(Err(e)) => {
                    warn!(
                        "Upstream read failed on source '{}' sub {}: {}",
                        source_id, sub_index, e
                    );
                    self.push_terminal(StreamStatus::UpstreamError, e.to_string());
                    break;
                }
                Err(_) => {
                    warn!(
                        "Upstream read timed out on source '{}' sub {}",
                        source_id, sub_index
                    );
                    self.push_terminal(StreamStatus::UpstreamError, "chunk read timeout");
                    break;
                }
            }
        }

        // Slot goes back to the source the moment upstream activity stops.
        drop(guard);
        debug!("Writer exited for coordinator {}", short(&self.slug));
    }
}

fn short(slug: &str) -> &str {
    &slug[..slug.len().min(16)]
}
