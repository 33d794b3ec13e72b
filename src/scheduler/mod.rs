//! Updater (C12).
//!
//! Serializes merge-pipeline invocations behind a single exclusive lock and
//! drives them from the configured cron schedule. At boot the updater
//! optionally clears previous data and runs one synchronous revalidation.

use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use cron::Schedule;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Config, DEFAULT_SYNC_CRON};
use crate::errors::PipelineError;
use crate::processor::PlaylistProcessor;

pub struct Updater {
    processor: Arc<PlaylistProcessor>,
    config: Arc<Config>,
    /// Non-reentrant exclusive lock: only one revalidation runs at a time,
    /// later callers wait for the current one to finish.
    lock: Mutex<()>,
}

impl Updater {
    pub fn new(processor: Arc<PlaylistProcessor>, config: Arc<Config>) -> Self {
        Self {
            processor,
            config,
            lock: Mutex::new(()),
        }
    }

    /// Run one full revalidation. Concurrent callers serialize on the
    /// update lock.
    pub async fn update_once(
        &self,
        cancel: CancellationToken,
    ) -> Result<std::path::PathBuf, PipelineError> {
        let _guard = self.lock.lock().await;
        info!("Starting playlist revalidation");
        self.processor.run(cancel).await
    }

    /// Boot orchestration: clear previous data when configured, then run the
    /// initial sync. Neither failure is fatal for startup; the previous
    /// artifact (if any) keeps serving.
    pub async fn boot(&self, cancel: CancellationToken) {
        if self.config.sync.clear_on_boot {
            info!("CLEAR_ON_BOOT set, clearing processed playlists and stream index");
            for dir in [self.config.processed_dir(), self.config.streams_dir()] {
                if let Err(e) = std::fs::remove_dir_all(&dir) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!("Failed to clear {}: {}", dir.display(), e);
                    }
                }
            }
        }

        if self.config.sync.on_boot {
            match self.update_once(cancel).await {
                Ok(path) => info!("Boot sync published {}", path.display()),
                Err(e) => error!("Boot sync failed: {}", e),
            }
        }
    }

    /// Cron loop invoking [`Self::update_once`] at every schedule tick.
    /// Runs until `cancel` fires.
    pub async fn run_schedule(self: Arc<Self>, cancel: CancellationToken) {
        let expr = normalize_cron(&self.config.sync.cron);
        let schedule = match Schedule::from_str(&expr) {
            Ok(schedule) => schedule,
            Err(e) => {
                warn!(
                    "Invalid SYNC_CRON '{}' ({}), falling back to '{}'",
                    self.config.sync.cron, e, DEFAULT_SYNC_CRON
                );
                Schedule::from_str(&normalize_cron(DEFAULT_SYNC_CRON)).expect("default cron")
            }
        };

        if let Some(next) = schedule.upcoming(Utc).next() {
            info!(
                "Scheduler started, next sync at {}",
                next.format("%Y-%m-%d %H:%M:%S UTC")
            );
        }

        loop {
            let Some(next) = schedule.upcoming(Utc).next() else {
                warn!("Cron schedule has no upcoming runs, scheduler stopping");
                return;
            };
            let wait = (next - Utc::now())
                .to_std()
                .unwrap_or(std::time::Duration::from_secs(1));

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Scheduler stopping");
                    return;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            match self.update_once(cancel.child_token()).await {
                Ok(path) => {
                    info!("Scheduled sync published {}", path.display());
                    if let Some(next) = schedule.upcoming(Utc).next() {
                        info!(
                            "Next sync at {}",
                            next.format("%Y-%m-%d %H:%M:%S UTC")
                        );
                    }
                }
                Err(e) => error!("Scheduled sync failed: {}", e),
            }
        }
    }
}

/// The `cron` crate expects a seconds field; standard 5-field expressions
/// get one prepended.
fn normalize_cron(expr: &str) -> String {
    let fields = expr.split_whitespace().count();
    if fields == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_field_expressions_gain_a_seconds_column() {
        assert_eq!(normalize_cron("0 0 * * *"), "0 0 0 * * *");
        assert_eq!(normalize_cron("0 0 0 * * *"), "0 0 0 * * *");
    }

    #[test]
    fn default_sync_cron_parses() {
        assert!(Schedule::from_str(&normalize_cron(DEFAULT_SYNC_CRON)).is_ok());
        assert!(Schedule::from_str(&normalize_cron("*/5 * * * *")).is_ok());
    }
}
