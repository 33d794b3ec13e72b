//! Sorting manager (C4).
//!
//! Disk-backed collector for parsed channels. Records are spread over 4096
//! shards keyed by the xxh3 hash of the title; each shard keeps a small
//! in-memory write buffer and an existence set so duplicate titles are
//! merged instead of duplicated, while the bulk of the data lives in
//! JSON-lines shard files. Memory stays bounded for playlists with hundreds
//! of thousands of entries.

use std::collections::HashSet;
use std::io::Write;
use std::path::PathBuf;

use tokio::sync::Mutex;
use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

use crate::config::{SortDirection, SortKey, SortingConfig};
use crate::errors::SorterError;
use crate::models::StreamInfo;
use crate::utils::sanitize_name;

pub const SHARD_COUNT: usize = 4096;

/// Unflushed entries a shard may hold before its buffer is written out.
const FLUSH_THRESHOLD: usize = 250;

#[derive(Default)]
struct Shard {
    /// Sanitized titles known to this shard (buffered or on disk)
    titles: HashSet<String>,
    buffer: Vec<StreamInfo>,
    has_file: bool,
}

pub struct SortingManager {
    dir: PathBuf,
    shards: Vec<Mutex<Shard>>,
    sorting: SortingConfig,
}

impl SortingManager {
    pub fn new(dir: PathBuf, sorting: SortingConfig) -> Result<Self, SorterError> {
        std::fs::create_dir_all(&dir).map_err(|e| SorterError::shard_io(0, e.to_string()))?;
        let shards = (0..SHARD_COUNT).map(|_| Mutex::new(Shard::default())).collect();
        Ok(Self { dir, shards, sorting })
    }

    fn shard_index(title: &str) -> usize {
        (xxh3_64(title.as_bytes()) % SHARD_COUNT as u64) as usize
    }

    fn shard_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("shard-{:04}.json", index))
    }

    /// Add one record, merging it into an existing entry when the title was
    /// seen before.
    pub async fn add(&self, info: StreamInfo) -> Result<(), SorterError> {
        let index = Self::shard_index(&info.title);
        let sanitized = sanitize_name(&info.title);
        let mut shard = self.shards[index].lock().await;

        if shard.titles.contains(&sanitized) {
            // Duplicate title: merge in the buffer when possible, otherwise
            // rewrite the shard file with the merged entry.
            if let Some(existing) = shard.buffer.iter_mut().find(|e| e.title == info.title) {
                existing.merge(info);
                return Ok(());
            }
            let mut entries = self.read_shard(index, &shard)?;
            match entries.iter_mut().find(|e| e.title == info.title) {
                Some(existing) => existing.merge(info),
                None => entries.push(info),
            }
            self.rewrite_shard(index, &entries)?;
            shard.buffer.clear();
            shard.has_file = true;
            return Ok(());
        }

        shard.titles.insert(sanitized);
        shard.buffer.push(info);
        if shard.buffer.len() >= FLUSH_THRESHOLD {
            self.flush_locked(index, &mut shard)?;
        }
        Ok(())
    }

    /// Flush all shard buffers, then stream every entry to `visitor` in
    /// sorted order. Returns the number of entries visited.
    pub async fn visit_sorted<F>(&self, mut visitor: F) -> Result<u64, SorterError>
    where
        F: FnMut(&StreamInfo) -> Result<(), SorterError>,
    {
        let mut entries: Vec<StreamInfo> = Vec::new();
        for index in 0..SHARD_COUNT {
            let mut shard = self.shards[index].lock().await;
            self.flush_locked(index, &mut shard)?;
            if shard.has_file {
                entries.extend(self.read_shard(index, &shard)?);
            }
        }

        debug!("Sorting {} merged entries", entries.len());
        entries.sort_by(|a, b| {
            self.normalized_key(a)
                .cmp(&self.normalized_key(b))
                .then_with(|| source_key(a).cmp(&source_key(b)))
                .then_with(|| a.source_index.cmp(&b.source_index))
        });

        let mut visited = 0;
        for entry in &entries {
            visitor(entry)?;
            visited += 1;
        }
        Ok(visited)
    }

    /// Delete the shard directory. The manager is spent afterwards.
    pub fn close(&self) {
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!("Failed to remove sorter dir {}: {}", self.dir.display(), e);
            }
        }
    }

    fn flush_locked(&self, index: usize, shard: &mut Shard) -> Result<(), SorterError> {
        if shard.buffer.is_empty() {
            return Ok(());
        }
        let path = self.shard_path(index);
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| SorterError::shard_io(index, e.to_string()))?;
        for entry in &shard.buffer {
            let line = serde_json::to_string(entry)
                .map_err(|e| SorterError::shard_io(index, e.to_string()))?;
            writeln!(file, "{}", line).map_err(|e| SorterError::shard_io(index, e.to_string()))?;
        }
        shard.buffer.clear();
        shard.has_file = true;
        Ok(())
    }

    fn read_shard(&self, index: usize, shard: &Shard) -> Result<Vec<StreamInfo>, SorterError> {
        let mut entries = Vec::new();
        if shard.has_file {
            let contents = std::fs::read_to_string(self.shard_path(index))
                .map_err(|e| SorterError::shard_io(index, e.to_string()))?;
            for line in contents.lines().filter(|l| !l.trim().is_empty()) {
                let entry: StreamInfo = serde_json::from_str(line)
                    .map_err(|source| SorterError::Corrupt { shard: index, source })?;
                entries.push(entry);
            }
        }
        entries.extend(shard.buffer.iter().cloned());
        Ok(entries)
    }

    fn rewrite_shard(&self, index: usize, entries: &[StreamInfo]) -> Result<(), SorterError> {
        let path = self.shard_path(index);
        let mut out = String::new();
        for entry in entries {
            let line = serde_json::to_string(entry)
                .map_err(|e| SorterError::shard_io(index, e.to_string()))?;
            out.push_str(&line);
            out.push('\n');
        }
        std::fs::write(&path, out).map_err(|e| SorterError::shard_io(index, e.to_string()))
    }

    /// Normalize the configured sort field into a string whose lexicographic
    /// order matches the desired output order.
    fn normalized_key(&self, info: &StreamInfo) -> String {
        let descending = self.sorting.direction == SortDirection::Desc;
        match self.sorting.key {
            SortKey::TvgId => numeric_key(&info.tvg_id, descending),
            SortKey::TvgChno => numeric_key(&info.tvg_chno, descending),
            SortKey::TvgGroup => string_key(&info.group, descending),
            SortKey::TvgType => string_key(&info.tvg_type, descending),
            SortKey::Title => string_key(&info.title, descending),
            // The source key is a tie-breaker field by nature and always
            // sorts ascending.
            SortKey::Source => source_key(info),
        }
    }
}

/// Width-10 zero-padded numeric key; descending flips through
/// `i32::MAX - n`. Values that fail to parse fall back to the sanitized
/// string form.
fn numeric_key(value: &str, descending: bool) -> String {
    match value.trim().parse::<i64>() {
        Ok(n) => {
            let n = if descending { i32::MAX as i64 - n } else { n };
            format!("{:010}", n)
        }
        Err(_) => string_key(value, descending),
    }
}

fn string_key(value: &str, descending: bool) -> String {
    let sanitized = sanitize_name(value);
    if descending {
        format!("~{}", sanitized)
    } else {
        sanitized
    }
}

/// Width-5 numeric source key used as the deterministic tie-breaker.
fn source_key(info: &StreamInfo) -> String {
    match info.source_m3u.trim().parse::<i64>() {
        Ok(n) => format!("{:05}", n),
        Err(_) => sanitize_name(&info.source_m3u),
    }
}
