//! Source downloader (C1).
//!
//! Fetches one configured source (HTTP or file) and yields its lines with
//! 0-based line numbers. Remote fetches are teed into a `.new` file next to
//! the canonical per-source copy; promotion of `.new` to the canonical name
//! is owned by the processor so a failed run discards the download together
//! with the rest of its artifacts. When the live fetch fails the downloader
//! falls back to the last known good copy on disk.

use std::collections::VecDeque;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::errors::SourceError;
use crate::utils::redact_url;

/// How the line stream was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchKind {
    /// Fresh download; a `.new` file is waiting for promotion
    Live,
    /// Served from the last known good on-disk copy
    Fallback,
}

/// Lazy line sequence for one source.
///
/// Lines arrive on `rx` as `(text, line_num)`; the join handle resolves to
/// the terminal outcome once the stream is drained.
pub struct SourceLines {
    pub rx: mpsc::Receiver<(String, u64)>,
    pub handle: JoinHandle<Result<FetchKind, SourceError>>,
}

#[async_trait]
trait LineReader: Send {
    /// Next line of the playlist body, or `None` at end of input.
    async fn next_line(&mut self) -> Result<Option<String>, SourceError>;
}

/// Reads a remote body chunk by chunk, teeing raw bytes into the `.new`
/// file while splitting out lines for the consumer.
struct HttpLineReader {
    source_id: String,
    response: Option<reqwest::Response>,
    tee: tokio::fs::File,
    pending: VecDeque<String>,
    partial: Vec<u8>,
}

impl HttpLineReader {
    fn push_bytes(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            if byte == b'\n' {
                let mut line = std::mem::take(&mut self.partial);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                self.pending
                    .push_back(String::from_utf8_lossy(&line).into_owned());
            } else {
                self.partial.push(byte);
            }
        }
    }
}

#[async_trait]
impl LineReader for HttpLineReader {
    async fn next_line(&mut self) -> Result<Option<String>, SourceError> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Ok(Some(line));
            }
            let Some(response) = self.response.as_mut() else {
                return Ok(None);
            };
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    self.tee
                        .write_all(&chunk)
                        .await
                        .map_err(|e| SourceError::download(&self.source_id, e.to_string()))?;
                    self.push_bytes(&chunk);
                }
                Ok(None) => {
                    // Body finished; flush the tee and any unterminated tail.
                    self.tee
                        .flush()
                        .await
                        .map_err(|e| SourceError::download(&self.source_id, e.to_string()))?;
                    self.response = None;
                    if !self.partial.is_empty() {
                        let line = std::mem::take(&mut self.partial);
                        return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
                    }
                    return Ok(None);
                }
                Err(e) => {
                    return Err(SourceError::download(&self.source_id, e.to_string()));
                }
            }
        }
    }
}

struct FileLineReader {
    source_id: String,
    lines: tokio::io::Lines<BufReader<tokio::fs::File>>,
}

#[async_trait]
impl LineReader for FileLineReader {
    async fn next_line(&mut self) -> Result<Option<String>, SourceError> {
        self.lines
            .next_line()
            .await
            .map_err(|e| SourceError::download(&self.source_id, e.to_string()))
    }
}

/// Downloads configured sources and streams their lines.
pub struct SourceDownloader {
    client: reqwest::Client,
    sources_dir: PathBuf,
    safe_logs: bool,
}

impl SourceDownloader {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;
        Ok(Self {
            client,
            sources_dir: config.sources_dir(),
            safe_logs: config.safe_logs,
        })
    }

    /// Canonical on-disk copy for one source.
    pub fn canonical_path(&self, source_id: &str) -> PathBuf {
        self.sources_dir.join(format!("{}.m3u", source_id))
    }

    /// In-flight download target, promoted by the processor on success.
    pub fn new_path(&self, source_id: &str) -> PathBuf {
        self.sources_dir.join(format!("{}.m3u.new", source_id))
    }

    /// Stream one source's lines. Never fails synchronously: open errors
    /// surface through the returned join handle.
    pub fn stream(&self, source_id: &str, url: &str) -> SourceLines {
        let (tx, rx) = mpsc::channel(256);
        let this = self.clone_parts();
        let source_id = source_id.to_string();
        let url = url.to_string();

        let handle = tokio::spawn(async move {
            let (mut reader, kind) = this.open(&source_id, &url).await?;
            let mut line_num: u64 = 0;
            while let Some(line) = reader.next_line().await? {
                if tx.send((line, line_num)).await.is_err() {
                    // Consumer went away; stop without promoting anything.
                    debug!("Consumer dropped line stream for source '{}'", source_id);
                    return Err(SourceError::download(&source_id, "consumer closed"));
                }
                line_num += 1;
            }
            debug!("Source '{}' produced {} lines", source_id, line_num);
            Ok(kind)
        });

        SourceLines { rx, handle }
    }

    fn clone_parts(&self) -> SourceDownloader {
        SourceDownloader {
            client: self.client.clone(),
            sources_dir: self.sources_dir.clone(),
            safe_logs: self.safe_logs,
        }
    }

    async fn open(
        &self,
        source_id: &str,
        url: &str,
    ) -> Result<(Box<dyn LineReader>, FetchKind), SourceError> {
        if url.starts_with("http://") || url.starts_with("https://") {
            match self.open_remote(source_id, url).await {
                Ok(reader) => return Ok((reader, FetchKind::Live)),
                Err(e) => {
                    warn!(
                        "Live fetch failed for source '{}' ({}): {}, trying on-disk fallback",
                        source_id,
                        redact_url(url, self.safe_logs),
                        e
                    );
                    let fallback = self.canonical_path(source_id);
                    match self.open_file(source_id, &fallback).await {
                        Ok(reader) => {
                            info!(
                                "Serving source '{}' from fallback copy {}",
                                source_id,
                                fallback.display()
                            );
                            return Ok((reader, FetchKind::Fallback));
                        }
                        Err(_) => {
                            return Err(SourceError::unavailable(source_id, e.to_string()));
                        }
                    }
                }
            }
        }

        // file:// URL or a bare local path
        let path = PathBuf::from(url.strip_prefix("file://").unwrap_or(url));
        let reader = self
            .open_file(source_id, &path)
            .await
            .map_err(|e| SourceError::unavailable(source_id, e.to_string()))?;
        Ok((reader, FetchKind::Fallback))
    }

    async fn open_remote(
        &self,
        source_id: &str,
        url: &str,
    ) -> Result<Box<dyn LineReader>, SourceError> {
        info!(
            "Connecting to source '{}': {}",
            source_id,
            redact_url(url, self.safe_logs)
        );

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| SourceError::download(source_id, e.to_string()))?;

        if response.status() != reqwest::StatusCode::OK {
            return Err(SourceError::BadStatus {
                source_id: source_id.to_string(),
                status: response.status().as_u16(),
            });
        }

        let mut response = response;

        // Peek enough of the body to verify the playlist header before
        // creating the tee file.
        let mut head: Vec<u8> = Vec::new();
        while head.len() < 16 {
            match response
                .chunk()
                .await
                .map_err(|e| SourceError::download(source_id, e.to_string()))?
            {
                Some(chunk) => head.extend_from_slice(&chunk),
                None => break,
            }
        }
        let trimmed = head
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .map(|i| &head[i..])
            .unwrap_or(&[]);
        if !trimmed.starts_with(b"#EXTM3U") {
            return Err(SourceError::NotM3u {
                source_id: source_id.to_string(),
            });
        }

        tokio::fs::create_dir_all(&self.sources_dir)
            .await
            .map_err(|e| SourceError::download(source_id, e.to_string()))?;
        let new_path = self.new_path(source_id);
        let mut tee = tokio::fs::File::create(&new_path)
            .await
            .map_err(|e| SourceError::download(source_id, e.to_string()))?;
        tee.write_all(&head)
            .await
            .map_err(|e| SourceError::download(source_id, e.to_string()))?;

        let mut reader = HttpLineReader {
            source_id: source_id.to_string(),
            response: Some(response),
            tee,
            pending: VecDeque::new(),
            partial: Vec::new(),
        };
        reader.push_bytes(&head);
        Ok(Box::new(reader))
    }

    async fn open_file(
        &self,
        source_id: &str,
        path: &std::path::Path,
    ) -> Result<Box<dyn LineReader>, SourceError> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| SourceError::download(source_id, format!("{}: {}", path.display(), e)))?;
        Ok(Box::new(FileLineReader {
            source_id: source_id.to_string(),
            lines: BufReader::new(file).lines(),
        }))
    }
}
