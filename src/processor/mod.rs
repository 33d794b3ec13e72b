//! Merge pipeline (C5).
//!
//! Orchestrates download → parse → filter → sort for every configured
//! source, then compiles the merged playlist and publishes it atomically.
//! Per-source failures are non-fatal; shard or compile I/O failures mark the
//! run critical, which discards the in-flight artifacts and leaves the
//! previously published playlist authoritative.

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::errors::{PipelineError, SourceError};
use crate::ingestor::{FetchKind, M3uParser, SourceDownloader};
use crate::models::StreamInfo;
use crate::proxy::FilterEngine;
use crate::slug::encode_slug;
use crate::sorter::SortingManager;
use crate::utils::atomic_rename;

pub struct PlaylistProcessor {
    config: Arc<Config>,
    downloader: Arc<SourceDownloader>,
    parser: Arc<M3uParser>,
    filter: Arc<FilterEngine>,
    running: Mutex<Option<RunHandle>>,
    result_path: std::sync::RwLock<Option<PathBuf>>,
}

struct RunHandle {
    handle: JoinHandle<Result<PathBuf, PipelineError>>,
    cancel: CancellationToken,
}

impl PlaylistProcessor {
    pub fn new(config: Arc<Config>) -> anyhow::Result<Self> {
        let downloader = Arc::new(SourceDownloader::new(&config)?);
        let parser = Arc::new(M3uParser::new(&config)?);
        let filter = Arc::new(FilterEngine::new(&config.filters)?);
        Ok(Self {
            config,
            downloader,
            parser,
            filter,
            running: Mutex::new(None),
            result_path: std::sync::RwLock::new(None),
        })
    }

    /// Kick off a pipeline run in the background. A run that is already in
    /// flight is left alone.
    pub async fn start(&self, cancel: CancellationToken) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            debug!("Pipeline already running, not starting another");
            return;
        }
        let ctx = RunContext {
            config: self.config.clone(),
            downloader: self.downloader.clone(),
            parser: self.parser.clone(),
            filter: self.filter.clone(),
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(async move { execute(ctx).await });
        *running = Some(RunHandle { handle, cancel });
    }

    /// Await the in-flight run. Returns [`PipelineError::Cancelled`] when the
    /// run's cancellation token fired before the compile completed.
    pub async fn wait(&self) -> Result<PathBuf, PipelineError> {
        let run = self.running.lock().await.take();
        let Some(run) = run else {
            return Err(PipelineError::Critical {
                message: "no pipeline run in progress".to_string(),
            });
        };
        let result = run.handle.await.map_err(|e| PipelineError::Critical {
            message: format!("pipeline task panicked: {}", e),
        })?;
        if let Ok(path) = &result {
            *self.result_path.write().expect("result path lock") = Some(path.clone());
        }
        result
    }

    /// `start` + `wait`.
    pub async fn run(&self, cancel: CancellationToken) -> Result<PathBuf, PipelineError> {
        self.start(cancel).await;
        self.wait().await
    }

    /// Cancel the in-flight run, if any.
    pub async fn cancel(&self) {
        if let Some(run) = self.running.lock().await.as_ref() {
            run.cancel.cancel();
        }
    }

    /// Path of the most recent successfully compiled playlist: the one
    /// published by this process, or the newest artifact on disk after a
    /// restart.
    pub fn result_path(&self) -> Option<PathBuf> {
        if let Some(path) = self.result_path.read().expect("result path lock").clone() {
            if path.exists() {
                return Some(path);
            }
        }
        latest_artifact(&self.config.processed_dir())
    }
}

struct RunContext {
    config: Arc<Config>,
    downloader: Arc<SourceDownloader>,
    parser: Arc<M3uParser>,
    filter: Arc<FilterEngine>,
    cancel: CancellationToken,
}

async fn execute(ctx: RunContext) -> Result<PathBuf, PipelineError> {
    let started = std::time::Instant::now();
    let processed_dir = ctx.config.processed_dir();
    std::fs::create_dir_all(&processed_dir).map_err(|e| PipelineError::CompileIo {
        message: e.to_string(),
    })?;

    let timestamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
    let tmp_path = processed_dir.join(format!("{}.m3u.tmp", timestamp));
    let final_path = processed_dir.join(format!("{}.m3u", timestamp));

    let sorter = Arc::new(
        SortingManager::new(ctx.config.sorter_dir(), ctx.config.sorting.clone()).map_err(
            |e| PipelineError::Critical {
                message: e.to_string(),
            },
        )?,
    );

    info!(
        "Starting playlist merge for {} sources",
        ctx.config.sources.len()
    );

    let (tx, rx) = mpsc::channel::<StreamInfo>(512);
    let critical = Arc::new(AtomicBool::new(false));

    // One producer per source: download, pair EXTINF headers with their URL
    // lines, parse, filter, forward.
    let mut producers = Vec::new();
    for (source_id, source) in &ctx.config.sources {
        let tx = tx.clone();
        let downloader = ctx.downloader.clone();
        let parser = ctx.parser.clone();
        let filter = ctx.filter.clone();
        let cancel = ctx.cancel.clone();
        let source_id = source_id.clone();
        let url = source.url.clone();

        producers.push(tokio::spawn(async move {
            let mut lines = downloader.stream(&source_id, &url);
            let mut pending: Option<(String, u64)> = None;
            let mut parsed = 0u64;

            loop {
                let line = tokio::select! {
                    _ = cancel.cancelled() => {
                        let err = SourceError::download(&source_id, "cancelled");
                        return (source_id, Err(err));
                    }
                    line = lines.rx.recv() => line,
                };
                let Some((line, line_num)) = line else { break };
                let trimmed = line.trim();
                if trimmed.starts_with("#EXTINF:") {
                    pending = Some((line, line_num));
                } else if trimmed.starts_with('#') || trimmed.is_empty() {
                    continue;
                } else if let Some((header, header_line)) = pending.take() {
                    if let Some(info) =
                        parser.parse_entry(&header, trimmed, &source_id, header_line)
                    {
                        if filter.admit(&info) {
                            parsed += 1;
                            if tx.send(info).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }

            let outcome = match lines.handle.await {
                Ok(result) => result,
                Err(e) => Err(SourceError::download(&source_id, e.to_string())),
            };
            info!("Source '{}' contributed {} channels", source_id, parsed);
            (source_id, outcome)
        }));
    }
    drop(tx);

    // Consumer pool draining into the sorter.
    let worker_count = ctx
        .config
        .streaming
        .parser_workers
        .unwrap_or_else(|| (2 * num_cpus::get()).max(2));
    let rx = Arc::new(Mutex::new(rx));
    let mut workers = Vec::new();
    for _ in 0..worker_count {
        let rx = rx.clone();
        let sorter = sorter.clone();
        let critical = critical.clone();
        workers.push(tokio::spawn(async move {
            loop {
                let info = { rx.lock().await.recv().await };
                let Some(info) = info else { break };
                if let Err(e) = sorter.add(info).await {
                    error!("Sorter failure: {}", e);
                    critical.store(true, Ordering::Release);
                    break;
                }
            }
        }));
    }

    // Collect per-source outcomes; a failing source is logged and skipped.
    let mut live_sources = Vec::new();
    for producer in producers {
        match producer.await {
            Ok((source_id, Ok(FetchKind::Live))) => live_sources.push(source_id),
            Ok((source_id, Ok(FetchKind::Fallback))) => {
                debug!("Source '{}' served from fallback", source_id)
            }
            Ok((source_id, Err(e))) => warn!("Source '{}' failed: {}", source_id, e),
            Err(e) => warn!("Producer task failed: {}", e),
        }
    }
    for worker in workers {
        let _ = worker.await;
    }

    if ctx.cancel.is_cancelled() {
        discard_artifacts(&ctx, &tmp_path);
        sorter.close();
        return Err(PipelineError::Cancelled);
    }
    if critical.load(Ordering::Acquire) {
        discard_artifacts(&ctx, &tmp_path);
        sorter.close();
        return Err(PipelineError::Critical {
            message: "sorter failure while consuming records".to_string(),
        });
    }

    // Compile the merged artifact.
    let compile_result = compile(&ctx, &sorter, &tmp_path).await;
    sorter.close();
    let entry_count = match compile_result {
        Ok(count) => count,
        Err(e) => {
            discard_artifacts(&ctx, &tmp_path);
            return Err(e);
        }
    };

    if let Err(e) = atomic_rename(&tmp_path, &final_path) {
        discard_artifacts(&ctx, &tmp_path);
        return Err(PipelineError::CompileIo {
            message: e.to_string(),
        });
    }

    // Promote fresh downloads to their canonical per-source names, then
    // drop superseded artifacts.
    for source_id in &live_sources {
        let new_path = ctx.downloader.new_path(source_id);
        let canonical = ctx.downloader.canonical_path(source_id);
        if let Err(e) = atomic_rename(&new_path, &canonical) {
            warn!("Failed to promote download for source '{}': {}", source_id, e);
        }
    }
    if !ctx.config.sync.cache_on_sync {
        debug!("CACHE_ON_SYNC disabled; canonical copies kept for fallback only");
    }
    cleanup_old_artifacts(&ctx.config.processed_dir(), &final_path);

    info!(
        "Playlist merge completed: {} channels in {} ({:.1}s)",
        entry_count,
        final_path.display(),
        started.elapsed().as_secs_f64()
    );
    Ok(final_path)
}

async fn compile(
    ctx: &RunContext,
    sorter: &SortingManager,
    tmp_path: &PathBuf,
) -> Result<u64, PipelineError> {
    let file = std::fs::File::create(tmp_path).map_err(|e| PipelineError::CompileIo {
        message: e.to_string(),
    })?;
    let mut writer = std::io::BufWriter::new(file);
    writer
        .write_all(b"#EXTM3U\n")
        .map_err(|e| PipelineError::CompileIo {
            message: e.to_string(),
        })?;

    let base_url = ctx.config.web.base_url.clone().unwrap_or_default();
    let cancel = ctx.cancel.clone();
    let mut write_error: Option<String> = None;
    let mut cancelled = false;

    let count = sorter
        .visit_sorted(|entry| {
            if cancel.is_cancelled() {
                cancelled = true;
                return Err(crate::errors::SorterError::shard_io(0, "cancelled"));
            }
            let line = match playlist_entry(entry, &base_url) {
                Some(line) => line,
                None => return Ok(()), // channel without a playable upstream
            };
            if let Err(e) = writer.write_all(line.as_bytes()) {
                write_error = Some(e.to_string());
                return Err(crate::errors::SorterError::shard_io(0, "write failed"));
            }
            Ok(())
        })
        .await;

    match count {
        Ok(count) => {
            writer.flush().map_err(|e| PipelineError::CompileIo {
                message: e.to_string(),
            })?;
            Ok(count)
        }
        Err(_) if cancelled => Err(PipelineError::Cancelled),
        Err(e) => Err(PipelineError::CompileIo {
            message: write_error.unwrap_or_else(|| e.to_string()),
        }),
    }
}

/// Render one playlist entry: the EXTINF header plus the proxied stream URL.
fn playlist_entry(entry: &StreamInfo, base_url: &str) -> Option<String> {
    let (sub_path, extension) = upstream_shape(entry)?;
    let slug = match encode_slug(entry) {
        Ok(slug) => slug,
        Err(e) => {
            warn!("Failed to encode slug for '{}': {}", entry.title, e);
            return None;
        }
    };
    let mut url = format!("{}/p/{}/{}", base_url, sub_path, slug);
    if let Some(ext) = extension {
        url.push('.');
        url.push_str(&ext);
    }
    Some(format!("{}\n{}\n", format_extinf(entry), url))
}

/// Derive (subPath, extension) from any one of the channel's upstream URLs.
/// The second-to-last path segment is preserved because some players key
/// their behavior off it; "stream" is the fallback.
fn upstream_shape(entry: &StreamInfo) -> Option<(String, Option<String>)> {
    let record = entry.urls.values().flat_map(|inner| inner.values()).next()?;
    let (_, upstream) = crate::models::parse_url_record(record)?;

    let mut sub_path = "stream".to_string();
    let mut extension = None;
    if let Ok(parsed) = url::Url::parse(upstream) {
        let segments: Vec<&str> = parsed
            .path_segments()
            .map(|s| s.filter(|seg| !seg.is_empty()).collect())
            .unwrap_or_default();
        if segments.len() >= 2 {
            sub_path = crate::utils::sanitize_name(segments[segments.len() - 2]);
        }
        if let Some(last) = segments.last() {
            if let Some((_, ext)) = last.rsplit_once('.') {
                if !ext.is_empty() && ext.len() <= 5 {
                    extension = Some(ext.to_string());
                }
            }
        }
    }
    Some((sub_path, extension))
}

/// Render the `#EXTINF:-1` header with the present non-empty attributes in
/// canonical order.
pub fn format_extinf(entry: &StreamInfo) -> String {
    let mut line = String::from("#EXTINF:-1");
    for (name, value) in [
        ("tvg-id", &entry.tvg_id),
        ("tvg-chno", &entry.tvg_chno),
        ("tvg-logo", &entry.logo_url),
        ("group-title", &entry.group),
        ("tvg-type", &entry.tvg_type),
    ] {
        if !value.is_empty() {
            line.push_str(&format!(" {}=\"{}\"", name, value));
        }
    }
    line.push(',');
    line.push_str(&entry.title);
    line
}

/// Newest `.m3u` artifact in the processed directory, if any.
pub fn latest_artifact(processed_dir: &std::path::Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(processed_dir).ok()?;
    entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().map(|ext| ext == "m3u").unwrap_or(false))
        .max()
}

fn cleanup_old_artifacts(processed_dir: &std::path::Path, keep: &std::path::Path) {
    let Ok(entries) = std::fs::read_dir(processed_dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path == keep {
            continue;
        }
        let is_artifact = path.extension().map(|ext| ext == "m3u").unwrap_or(false);
        if is_artifact {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!("Failed to remove old playlist {}: {}", path.display(), e);
            }
        }
    }
}

fn discard_artifacts(ctx: &RunContext, tmp_path: &std::path::Path) {
    let _ = std::fs::remove_file(tmp_path);
    for source_id in ctx.config.sources.keys() {
        let _ = std::fs::remove_file(ctx.downloader.new_path(source_id));
    }
    info!("Discarded in-flight artifacts; previous playlist remains authoritative");
}
