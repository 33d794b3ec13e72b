//! Shared-buffer stream relay: one upstream connection fanned out to every
//! downstream client watching the same channel.

pub mod coordinator;
pub mod handler;
pub mod m3u8;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use coordinator::StreamCoordinator;

/// Owns the live coordinators, keyed by slug. A coordinator is created when
/// the first client of a channel arrives and dropped when the last one
/// leaves.
pub struct CoordinatorRegistry {
    inner: RwLock<HashMap<String, Arc<StreamCoordinator>>>,
    ring_capacity: usize,
}

impl CoordinatorRegistry {
    /// `buffer_mb` sizes each channel's chunk ring, assuming network-typical
    /// 16 KiB reads.
    pub fn new(buffer_mb: usize) -> Self {
        let ring_capacity = ((buffer_mb * 1024 * 1024) / (16 * 1024)).max(64);
        Self {
            inner: RwLock::new(HashMap::new()),
            ring_capacity,
        }
    }

    pub async fn get_or_create(&self, slug: &str) -> Arc<StreamCoordinator> {
        if let Some(existing) = self.inner.read().await.get(slug) {
            return existing.clone();
        }
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.get(slug) {
            return existing.clone();
        }
        info!("Creating coordinator for slug {}", &slug[..slug.len().min(16)]);
        let coordinator = StreamCoordinator::new(slug.to_string(), self.ring_capacity);
        inner.insert(slug.to_string(), coordinator.clone());
        coordinator
    }

    /// Drop a coordinator once its last client has unregistered. A client
    /// that raced in between registration checks keeps it alive.
    pub async fn remove_if_idle(&self, slug: &str) {
        let mut inner = self.inner.write().await;
        if let Some(coordinator) = inner.get(slug) {
            if coordinator.client_count() == 0 {
                inner.remove(slug);
                debug!("Removed idle coordinator for slug {}", &slug[..slug.len().min(16)]);
            }
        }
    }

    pub async fn active_count(&self) -> usize {
        self.inner.read().await.len()
    }
}
