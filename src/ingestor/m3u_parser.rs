//! EXTINF parser (C2).
//!
//! Turns an `#EXTINF:` header plus the following URL line into a canonical
//! [`StreamInfo`] record, extracts the named attributes, computes the
//! SHA3-224 identity of the upstream URL and writes the per-URL index file
//! used later to rehydrate decoded slugs.

use std::collections::BTreeMap;
use std::path::PathBuf;

use regex::Regex;
use sha3::{Digest, Sha3_224};
use tracing::warn;

use crate::config::Config;
use crate::models::{format_url_record, StreamInfo};
use crate::utils::{encode_component, normalize_base_url};

/// Number of leading hash characters that pick the index shard directory.
const INDEX_SHARD_PREFIX: usize = 3;

pub struct M3uParser {
    attr_re: Regex,
    title_filter: Option<Regex>,
    streams_dir: PathBuf,
    base_url: Option<String>,
}

impl M3uParser {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let title_filter = match &config.filters.title_substr_filter {
            Some(pattern) => Some(Regex::new(pattern)?),
            None => None,
        };
        Ok(Self {
            attr_re: Regex::new(r#"([A-Za-z0-9_-]+)="([^"]*)""#).expect("static regex"),
            title_filter,
            streams_dir: config.streams_dir(),
            base_url: config.web.base_url.as_deref().map(normalize_base_url),
        })
    }

    /// Parse one EXTINF header + URL line pair.
    ///
    /// Returns `None` for records that must be skipped (not an EXTINF
    /// header, or an empty title after filtering).
    pub fn parse_entry(
        &self,
        header: &str,
        url_line: &str,
        source_id: &str,
        line_num: u64,
    ) -> Option<StreamInfo> {
        let header = header.trim();
        if !header.starts_with("#EXTINF:") {
            return None;
        }
        let url = url_line.trim();
        if url.is_empty() || url.starts_with('#') {
            return None;
        }

        let mut tvg_id = String::new();
        let mut tvg_chno = String::new();
        let mut tvg_name = String::new();
        let mut tvg_type = String::new();
        let mut group = String::new();
        let mut logo = String::new();

        // Collect attribute spans so the remainder (duration + title) can be
        // reconstructed without them.
        let mut spans: Vec<(usize, usize)> = Vec::new();
        for captures in self.attr_re.captures_iter(header) {
            let whole = captures.get(0).expect("match");
            spans.push((whole.start(), whole.end()));
            let name = captures.get(1).expect("attr name").as_str().to_lowercase();
            let value = unquote(captures.get(2).expect("attr value").as_str());
            match name.as_str() {
                "tvg-id" => tvg_id = value,
                "tvg-chno" | "channel-id" | "channel-number" => tvg_chno = value,
                "tvg-name" => tvg_name = value,
                "tvg-type" => tvg_type = value,
                "tvg-group" | "group-title" => group = value,
                "tvg-logo" => logo = value,
                _ => {} // unknown attributes are dropped
            }
        }

        let remainder = strip_spans(header, &spans);
        let fallback_title = remainder
            .split_once(',')
            .map(|(_, right)| right.trim().to_string())
            .unwrap_or_default();

        let mut title = if tvg_name.is_empty() {
            fallback_title
        } else {
            tvg_name
        };
        if let Some(filter) = &self.title_filter {
            title = filter.replace_all(&title, "").to_string();
        }
        let title = title.trim().to_string();
        if title.is_empty() {
            return None;
        }

        let logo_url = self.rewrite_logo(&logo);
        let url_hash = hash_url(url);
        self.write_index_file(&title, source_id, &url_hash, line_num, url);

        let mut urls = BTreeMap::new();
        urls.insert(
            source_id.to_string(),
            BTreeMap::from([(url_hash, format_url_record(line_num, url))]),
        );

        Some(StreamInfo {
            title,
            tvg_id,
            tvg_chno,
            tvg_type,
            logo_url,
            group,
            urls,
            source_m3u: source_id.to_string(),
            source_index: line_num,
        })
    }

    /// Route a well-formed http(s) logo URL through the proxy so clients
    /// never talk to the upstream directly. Anything else passes unchanged.
    fn rewrite_logo(&self, logo: &str) -> String {
        let Some(base) = &self.base_url else {
            return logo.to_string();
        };
        match url::Url::parse(logo) {
            Ok(parsed) if parsed.scheme() == "http" || parsed.scheme() == "https" => {
                format!("{}/a/{}", base, encode_component(logo.as_bytes()))
            }
            _ => logo.to_string(),
        }
    }

    /// Persist `<streamsDir>/<hash prefix>/<b64(title)>_<sourceID>|<hash>`
    /// once per unique URL. The file body carries the original line number
    /// and the base64 of the upstream URL.
    fn write_index_file(
        &self,
        title: &str,
        source_id: &str,
        url_hash: &str,
        line_num: u64,
        url: &str,
    ) {
        let shard_dir = self.streams_dir.join(&url_hash[..INDEX_SHARD_PREFIX]);
        let file_name = format!(
            "{}_{}|{}",
            encode_component(title.as_bytes()),
            source_id,
            url_hash
        );
        let path = shard_dir.join(file_name);
        if path.exists() {
            return;
        }
        let body = format!("{}:::{}", line_num, encode_component(url.as_bytes()));
        if let Err(e) =
            std::fs::create_dir_all(&shard_dir).and_then(|_| std::fs::write(&path, body))
        {
            warn!("Failed to write stream index {}: {}", path.display(), e);
        }
    }
}

/// SHA3-224 hex of the trimmed upstream URL; keys the per-source url map and
/// the on-disk index file.
pub fn hash_url(url: &str) -> String {
    hex::encode(Sha3_224::digest(url.trim().as_bytes()))
}

fn unquote(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        trimmed[1..trimmed.len() - 1].to_string()
    } else {
        trimmed.to_string()
    }
}

fn strip_spans(input: &str, spans: &[(usize, usize)]) -> String {
    let mut out = String::with_capacity(input.len());
    let mut cursor = 0;
    for &(start, end) in spans {
        if start > cursor {
            out.push_str(&input[cursor..start]);
        }
        cursor = cursor.max(end);
    }
    if cursor < input.len() {
        out.push_str(&input[cursor..]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn parser_in(dir: &std::path::Path, extra: &[(&str, &str)]) -> M3uParser {
        let mut vars = vec![("M3U_URL_1".to_string(), "file:///unused".to_string())];
        vars.extend(
            extra
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        );
        let mut config = Config::from_vars(vars).unwrap();
        config.storage.data_path = dir.to_path_buf();
        M3uParser::new(&config).unwrap()
    }

    #[test]
    fn parses_attributes_and_title() {
        let dir = tempfile::tempdir().unwrap();
        let parser = parser_in(dir.path(), &[]);

        let info = parser
            .parse_entry(
                r#"#EXTINF:-1 tvg-id="bbc1" tvg-chno="101" group-title="UK" tvg-logo="not a url",BBC One"#,
                "http://a/bbc1",
                "1",
                0,
            )
            .unwrap();

        assert_eq!(info.title, "BBC One");
        assert_eq!(info.tvg_id, "bbc1");
        assert_eq!(info.tvg_chno, "101");
        assert_eq!(info.group, "UK");
        assert_eq!(info.logo_url, "not a url");
        assert_eq!(info.source_m3u, "1");
        assert_eq!(info.source_index, 0);
        let record = &info.urls["1"][&hash_url("http://a/bbc1")];
        assert_eq!(record, "0:::http://a/bbc1");
    }

    #[test]
    fn tvg_name_wins_over_comma_title() {
        let dir = tempfile::tempdir().unwrap();
        let parser = parser_in(dir.path(), &[]);
        let info = parser
            .parse_entry(
                r#"#EXTINF:-1 tvg-name="BBC One HD",BBC One"#,
                "http://a/bbc1",
                "1",
                3,
            )
            .unwrap();
        assert_eq!(info.title, "BBC One HD");
    }

    #[test]
    fn title_substr_filter_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let parser = parser_in(dir.path(), &[("TITLE_SUBSTR_FILTER", r"\s*\[VIP\]")]);
        let info = parser
            .parse_entry("#EXTINF:-1,BBC One [VIP]", "http://a/bbc1", "1", 0)
            .unwrap();
        assert_eq!(info.title, "BBC One");
    }

    #[test]
    fn drops_records_without_title_or_url() {
        let dir = tempfile::tempdir().unwrap();
        let parser = parser_in(dir.path(), &[]);
        assert!(parser
            .parse_entry("#EXTINF:-1,", "http://a/x", "1", 0)
            .is_none());
        assert!(parser
            .parse_entry("#EXTINF:-1,Name", "#EXTGRP:whatever", "1", 0)
            .is_none());
        assert!(parser
            .parse_entry("#EXTVLCOPT:something", "http://a/x", "1", 0)
            .is_none());
    }

    #[test]
    fn logo_is_proxied_when_base_url_is_set() {
        let dir = tempfile::tempdir().unwrap();
        let parser = parser_in(dir.path(), &[("BASE_URL", "http://proxy.example")]);
        let info = parser
            .parse_entry(
                r#"#EXTINF:-1 tvg-logo="http://cdn.example/bbc.png",BBC One"#,
                "http://a/bbc1",
                "1",
                0,
            )
            .unwrap();
        let encoded = encode_component(b"http://cdn.example/bbc.png");
        assert_eq!(info.logo_url, format!("http://proxy.example/a/{}", encoded));
    }

    #[test]
    fn writes_index_file_once() {
        let dir = tempfile::tempdir().unwrap();
        let parser = parser_in(dir.path(), &[]);
        let info = parser
            .parse_entry("#EXTINF:-1,BBC One", "http://a/bbc1", "1", 5)
            .unwrap();

        let hash = hash_url("http://a/bbc1");
        let path = dir
            .path()
            .join("streams")
            .join(&hash[..3])
            .join(format!("{}_1|{}", encode_component(b"BBC One"), hash));
        assert!(path.exists());
        let body = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            body,
            format!("5:::{}", encode_component(b"http://a/bbc1"))
        );
        assert_eq!(info.source_index, 5);

        // A second parse of the same URL leaves the file untouched.
        parser.parse_entry("#EXTINF:-1,BBC One", "http://a/bbc1", "1", 9);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), body);
    }

    #[test]
    fn formatted_extinf_reparses_to_equal_attributes() {
        let dir = tempfile::tempdir().unwrap();
        let parser = parser_in(dir.path(), &[]);
        let original = parser
            .parse_entry(
                r#"#EXTINF:-1 tvg-id="bbc1" tvg-chno="101" tvg-type="live" tvg-group="UK",BBC One"#,
                "http://a/bbc1",
                "1",
                0,
            )
            .unwrap();

        let formatted = crate::processor::format_extinf(&original);
        let reparsed = parser
            .parse_entry(&formatted, "http://a/bbc1", "1", 0)
            .unwrap();

        assert_eq!(reparsed.title, original.title);
        assert_eq!(reparsed.tvg_id, original.tvg_id);
        assert_eq!(reparsed.tvg_chno, original.tvg_chno);
        assert_eq!(reparsed.tvg_type, original.tvg_type);
        assert_eq!(reparsed.group, original.group);
    }
}
