//! Core data model shared across the merge pipeline and the stream proxy.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Separator between the original source line number and the upstream URL in
/// a stored url record (`<lineNum>:::<url>`). The prefix keeps sub-URL
/// ordering within one source aligned with the upstream playlist ordering.
pub const URL_RECORD_SEPARATOR: &str = ":::";

/// One logical channel in the merged playlist.
///
/// The title is the merge key: two ingested records with the same title are
/// always folded into a single `StreamInfo` whose `urls` map carries every
/// known upstream alternative, keyed first by source id, then by the
/// SHA3-224 hash of the upstream URL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamInfo {
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tvg_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tvg_chno: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tvg_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub logo_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
    /// source id -> url hash -> "<lineNum>:::<url>"
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub urls: BTreeMap<String, BTreeMap<String, String>>,
    /// Lowest-ordered source that produced this channel
    pub source_m3u: String,
    /// 0-based line number of the EXTINF header within that source
    pub source_index: u64,
}

impl StreamInfo {
    /// A channel with no playable upstream has an empty urls map.
    pub fn has_urls(&self) -> bool {
        self.urls.values().any(|inner| !inner.is_empty())
    }

    /// Register one upstream URL under (source, hash).
    pub fn add_url(&mut self, source_id: &str, url_hash: &str, line_num: u64, url: &str) {
        self.urls
            .entry(source_id.to_string())
            .or_default()
            .insert(url_hash.to_string(), format_url_record(line_num, url));
    }

    /// Merge identity used for deterministic ordering and duplicate folding.
    pub fn identity(&self) -> (&str, u64) {
        (&self.source_m3u, self.source_index)
    }

    /// Fold `other` into `self` (both share the same title).
    ///
    /// Existing non-empty attribute values win; urls are unioned per
    /// (source, hash); the source identity becomes the lexicographically
    /// smaller (sourceM3U, sourceIndex) tuple.
    pub fn merge(&mut self, other: StreamInfo) {
        if self.tvg_id.is_empty() {
            self.tvg_id = other.tvg_id;
        }
        if self.tvg_chno.is_empty() {
            self.tvg_chno = other.tvg_chno;
        }
        if self.tvg_type.is_empty() {
            self.tvg_type = other.tvg_type;
        }
        if self.logo_url.is_empty() {
            self.logo_url = other.logo_url;
        }
        if self.group.is_empty() {
            self.group = other.group;
        }
        for (source_id, inner) in other.urls {
            let entry = self.urls.entry(source_id).or_default();
            for (hash, record) in inner {
                entry.entry(hash).or_insert(record);
            }
        }
        if (other.source_m3u.as_str(), other.source_index)
            < (self.source_m3u.as_str(), self.source_index)
        {
            self.source_m3u = other.source_m3u;
            self.source_index = other.source_index;
        }
    }

    /// Iterate this channel's sub-URLs for one source, ordered by the stored
    /// line-number prefix ascending. Yields (sub_index, url).
    pub fn sub_urls(&self, source_id: &str) -> Vec<(u64, String)> {
        let mut out: Vec<(u64, String)> = self
            .urls
            .get(source_id)
            .map(|inner| {
                inner
                    .values()
                    .filter_map(|record| parse_url_record(record))
                    .map(|(line, url)| (line, url.to_string()))
                    .collect()
            })
            .unwrap_or_default();
        out.sort_by_key(|(line, _)| *line);
        out
    }
}

/// Identity of one HLS segment flowing through the proxy: the absolute
/// upstream URL plus the `sourceID|subIndex` tuple the balancer is pinned to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SegmentRef {
    pub url: String,
    /// "sourceID|subIndex"
    pub source: String,
}

impl SegmentRef {
    pub fn new(url: impl Into<String>, source_id: &str, sub_index: u64) -> Self {
        Self {
            url: url.into(),
            source: format!("{}|{}", source_id, sub_index),
        }
    }

    /// Split the pinned source back into (sourceID, subIndex).
    pub fn source_parts(&self) -> Option<(&str, u64)> {
        let (source_id, sub) = self.source.split_once('|')?;
        Some((source_id, sub.parse().ok()?))
    }
}

/// Format a url record as `<lineNum>:::<url>`.
pub fn format_url_record(line_num: u64, url: &str) -> String {
    format!("{}{}{}", line_num, URL_RECORD_SEPARATOR, url)
}

/// Parse a `<lineNum>:::<url>` record; malformed records yield None.
pub fn parse_url_record(record: &str) -> Option<(u64, &str)> {
    let (prefix, url) = record.split_once(URL_RECORD_SEPARATOR)?;
    let line_num = prefix.parse().ok()?;
    Some((line_num, url))
}
