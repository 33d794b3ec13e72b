//! Application configuration.
//!
//! Configuration is environment-driven: every recognized key is read once at
//! startup into a [`Config`] value that the rest of the application borrows.
//! Numbered keys (`M3U_URL_1`, `M3U_MAX_CONCURRENCY_1`, `INCLUDE_GROUPS_1`,
//! ...) are collected by suffix; the suffix of a source key becomes its
//! stable source id.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::warn;

pub const DEFAULT_USER_AGENT: &str = "IPTV Smarters/1.0.3 (iPad; iOS 16.6.1; Scale/2.00)";
pub const DEFAULT_SYNC_CRON: &str = "0 0 * * *";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub web: WebConfig,
    pub storage: StorageConfig,
    /// source id -> source settings, ordered by id
    pub sources: BTreeMap<String, SourceConfig>,
    pub sorting: SortingConfig,
    pub filters: FilterConfig,
    pub sync: SyncConfig,
    pub streaming: StreamingConfig,
    pub user_agent: String,
    pub debug: bool,
    pub safe_logs: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
    /// Absolute URL used when composing outbound URLs; when unset it is
    /// derived from the incoming request's scheme and host.
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root for processed playlists and the per-URL stream index
    pub data_path: PathBuf,
    /// Root for per-source copies and sorter shards
    pub temp_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub url: String,
    pub max_concurrency: i32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SortKey {
    TvgId,
    TvgChno,
    TvgGroup,
    TvgType,
    Source,
    Title,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortingConfig {
    pub key: SortKey,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    pub include_groups: Vec<String>,
    pub include_titles: Vec<String>,
    pub exclude_groups: Vec<String>,
    pub exclude_titles: Vec<String>,
    /// Regex removed from every parsed title
    pub title_substr_filter: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub cron: String,
    pub on_boot: bool,
    pub clear_on_boot: bool,
    pub cache_on_sync: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Load-balancer laps before giving up; 0 means unbounded
    pub max_retries: u32,
    /// Base backoff between laps, in seconds
    pub retry_wait_secs: u64,
    /// Coordinator ring size hint, in MiB
    pub buffer_mb: usize,
    /// Per-chunk upstream read timeout, in seconds
    pub stream_timeout_secs: u64,
    /// Consumer pool size override for the merge pipeline
    pub parser_workers: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            web: WebConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                base_url: None,
            },
            storage: StorageConfig {
                data_path: PathBuf::from("./data"),
                temp_path: std::env::temp_dir().join("m3u-merger"),
            },
            sources: BTreeMap::new(),
            sorting: SortingConfig {
                key: SortKey::Title,
                direction: SortDirection::Asc,
            },
            filters: FilterConfig::default(),
            sync: SyncConfig {
                cron: DEFAULT_SYNC_CRON.to_string(),
                on_boot: true,
                clear_on_boot: false,
                cache_on_sync: false,
            },
            streaming: StreamingConfig {
                max_retries: 5,
                retry_wait_secs: 10,
                buffer_mb: 1,
                stream_timeout_secs: 10,
                parser_workers: None,
            },
            user_agent: DEFAULT_USER_AGENT.to_string(),
            debug: false,
            safe_logs: false,
        }
    }
}

impl SortKey {
    pub fn parse(value: &str) -> Self {
        match value {
            "tvg-id" => SortKey::TvgId,
            "tvg-chno" | "channel-id" | "channel-number" => SortKey::TvgChno,
            "tvg-group" | "group-title" => SortKey::TvgGroup,
            "tvg-type" => SortKey::TvgType,
            "source" => SortKey::Source,
            _ => SortKey::Title,
        }
    }
}

impl SortDirection {
    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("desc") {
            SortDirection::Desc
        } else {
            SortDirection::Asc
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn load() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Build a configuration from an explicit key/value iterator.
    ///
    /// Unparsable numeric or boolean values fall back to their defaults with
    /// a warning rather than failing startup.
    pub fn from_vars<I>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut config = Config::default();
        let mut max_concurrency: BTreeMap<String, i32> = BTreeMap::new();
        let mut include_groups: BTreeMap<String, String> = BTreeMap::new();
        let mut include_titles: BTreeMap<String, String> = BTreeMap::new();
        let mut exclude_groups: BTreeMap<String, String> = BTreeMap::new();
        let mut exclude_titles: BTreeMap<String, String> = BTreeMap::new();

        for (key, value) in vars {
            if let Some(id) = key.strip_prefix("M3U_MAX_CONCURRENCY_") {
                max_concurrency.insert(id.to_string(), parse_or(&key, &value, 1));
            } else if let Some(id) = key.strip_prefix("M3U_URL_") {
                config.sources.insert(
                    id.to_string(),
                    SourceConfig {
                        url: value,
                        max_concurrency: 1,
                    },
                );
            } else if let Some(n) = key.strip_prefix("INCLUDE_GROUPS_") {
                include_groups.insert(n.to_string(), value);
            } else if let Some(n) = key.strip_prefix("INCLUDE_TITLE_") {
                include_titles.insert(n.to_string(), value);
            } else if let Some(n) = key.strip_prefix("EXCLUDE_GROUPS_") {
                exclude_groups.insert(n.to_string(), value);
            } else if let Some(n) = key.strip_prefix("EXCLUDE_TITLE_") {
                exclude_titles.insert(n.to_string(), value);
            } else {
                match key.as_str() {
                    "HOST" => config.web.host = value,
                    "PORT" => config.web.port = parse_or(&key, &value, config.web.port),
                    "BASE_URL" => {
                        config.web.base_url = Some(crate::utils::normalize_base_url(&value))
                    }
                    "DATA_PATH" => config.storage.data_path = PathBuf::from(value),
                    "TEMP_PATH" => config.storage.temp_path = PathBuf::from(value),
                    "USER_AGENT" => config.user_agent = value,
                    "SORTING_KEY" => config.sorting.key = SortKey::parse(&value),
                    "SORTING_DIRECTION" => {
                        config.sorting.direction = SortDirection::parse(&value)
                    }
                    "TITLE_SUBSTR_FILTER" => {
                        config.filters.title_substr_filter = Some(value).filter(|v| !v.is_empty())
                    }
                    "SYNC_CRON" => config.sync.cron = value,
                    "SYNC_ON_BOOT" => config.sync.on_boot = parse_bool_or(&key, &value, true),
                    "CLEAR_ON_BOOT" => {
                        config.sync.clear_on_boot = parse_bool_or(&key, &value, false)
                    }
                    "CACHE_ON_SYNC" => {
                        config.sync.cache_on_sync = parse_bool_or(&key, &value, false)
                    }
                    "DEBUG" => config.debug = parse_bool_or(&key, &value, false),
                    "SAFE_LOGS" => config.safe_logs = parse_bool_or(&key, &value, false),
                    "MAX_RETRIES" => {
                        config.streaming.max_retries =
                            parse_or(&key, &value, config.streaming.max_retries)
                    }
                    "RETRY_WAIT" => {
                        config.streaming.retry_wait_secs =
                            parse_or(&key, &value, config.streaming.retry_wait_secs)
                    }
                    "BUFFER_MB" => {
                        config.streaming.buffer_mb =
                            parse_or(&key, &value, config.streaming.buffer_mb).max(1)
                    }
                    "STREAM_TIMEOUT" => {
                        config.streaming.stream_timeout_secs =
                            parse_or(&key, &value, config.streaming.stream_timeout_secs).max(1)
                    }
                    "PARSER_WORKERS" => {
                        config.streaming.parser_workers = value.parse().ok().filter(|n| *n > 0)
                    }
                    _ => {}
                }
            }
        }

        for (id, max) in max_concurrency {
            if let Some(source) = config.sources.get_mut(&id) {
                source.max_concurrency = max.max(1);
            } else {
                warn!("M3U_MAX_CONCURRENCY_{} has no matching M3U_URL_{}", id, id);
            }
        }

        config.filters.include_groups = include_groups.into_values().collect();
        config.filters.include_titles = include_titles.into_values().collect();
        config.filters.exclude_groups = exclude_groups.into_values().collect();
        config.filters.exclude_titles = exclude_titles.into_values().collect();

        if config.sources.is_empty() {
            anyhow::bail!("no sources configured: at least one M3U_URL_<id> is required");
        }

        Ok(config)
    }

    /// Concurrency cap for one source; never below 1, default 1.
    pub fn max_concurrency(&self, source_id: &str) -> i32 {
        self.sources
            .get(source_id)
            .map(|s| s.max_concurrency.max(1))
            .unwrap_or(1)
    }

    /// Directory holding the timestamped merged playlists.
    pub fn processed_dir(&self) -> PathBuf {
        self.storage.data_path.join("processed")
    }

    /// Directory holding the sharded per-URL index files.
    pub fn streams_dir(&self) -> PathBuf {
        self.storage.data_path.join("streams")
    }

    /// Directory holding the canonical per-source playlist copies.
    pub fn sources_dir(&self) -> PathBuf {
        self.storage.temp_path.join("sources")
    }

    /// Scratch directory for sorter shards.
    pub fn sorter_dir(&self) -> PathBuf {
        self.storage.temp_path.join("sorter")
    }
}

fn parse_or<T: std::str::FromStr + Copy>(key: &str, value: &str, default: T) -> T {
    match value.trim().parse() {
        Ok(parsed) => parsed,
        Err(_) => {
            warn!("Invalid value '{}' for {}, using default", value, key);
            default
        }
    }
}

fn parse_bool_or(key: &str, value: &str, default: bool) -> bool {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => true,
        "false" | "0" | "no" | "off" => false,
        _ => {
            warn!("Invalid value '{}' for {}, using default", value, key);
            default
        }
    }
}
