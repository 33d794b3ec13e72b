//! M3U8 manifest rewriter (C11).
//!
//! When the balanced upstream serves a playlist manifest instead of raw
//! media, its segment URLs must flow back through this proxy. Comment and
//! tag lines pass through unmodified; every other line is resolved against
//! the upstream URL and rewritten to `/segment/<slug>[.ext]`, where the slug
//! pins the segment to the (source, subIndex) the balancer chose.

use tracing::warn;

use crate::errors::AppError;
use crate::models::SegmentRef;
use crate::proxy::BalanceResult;
use crate::slug::encode_segment;

/// Rewritten manifest plus the upstream Content-Type to propagate.
pub struct RewrittenManifest {
    pub body: String,
    pub content_type: String,
}

/// True when a balanced upstream response looks like an HLS manifest.
pub fn is_manifest(content_type: Option<&str>, url: &str) -> bool {
    if let Some(content_type) = content_type {
        let lowered = content_type.to_ascii_lowercase();
        if lowered.contains("mpegurl") {
            return true;
        }
    }
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.ends_with(".m3u8") || path.ends_with(".m3u")
}

/// Consume the balanced response and rewrite its manifest body.
pub async fn rewrite_manifest(
    result: BalanceResult,
    base_url: &str,
) -> Result<RewrittenManifest, AppError> {
    let content_type = result
        .response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/vnd.apple.mpegurl")
        .to_string();

    let upstream_url = url::Url::parse(&result.url)
        .map_err(|e| AppError::internal(format!("invalid upstream url: {}", e)))?;
    let source_id = result.source_id.clone();
    let sub_index = result.sub_index;

    let text = result.response.text().await?;

    let mut body = String::with_capacity(text.len());
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            body.push_str(line);
            body.push('\n');
            continue;
        }
        match rewrite_line(trimmed, &upstream_url, &source_id, sub_index, base_url) {
            Some(rewritten) => {
                body.push_str(&rewritten);
                body.push('\n');
            }
            None => {
                // Keep the original line rather than breaking the manifest.
                warn!("Could not rewrite manifest line '{}'", trimmed);
                body.push_str(line);
                body.push('\n');
            }
        }
    }

    Ok(RewrittenManifest { body, content_type })
}

fn rewrite_line(
    line: &str,
    upstream_url: &url::Url,
    source_id: &str,
    sub_index: u64,
    base_url: &str,
) -> Option<String> {
    // Relative segment URLs resolve against the manifest's own URL.
    let resolved = upstream_url.join(line).ok()?;
    let extension = resolved
        .path_segments()
        .and_then(|segments| segments.last())
        .and_then(|last| last.rsplit_once('.'))
        .map(|(_, ext)| ext.to_string())
        .filter(|ext| !ext.is_empty() && ext.len() <= 5);

    let segment = SegmentRef::new(resolved.to_string(), source_id, sub_index);
    let slug = encode_segment(&segment).ok()?;

    let mut out = format!("{}/segment/{}", base_url, slug);
    if let Some(ext) = extension {
        out.push('.');
        out.push_str(&ext);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slug::{decode_segment, split_extension};

    #[test]
    fn detects_manifests_by_content_type_and_extension() {
        assert!(is_manifest(
            Some("application/vnd.apple.mpegurl"),
            "http://src/live/feed"
        ));
        assert!(is_manifest(Some("audio/x-mpegurl"), "http://src/live/feed"));
        assert!(is_manifest(None, "http://src/live/index.m3u8"));
        assert!(is_manifest(None, "http://src/live/index.m3u8?token=x"));
        assert!(!is_manifest(Some("video/mp2t"), "http://src/live/feed.ts"));
    }

    #[test]
    fn relative_segment_is_resolved_and_pinned() {
        let upstream = url::Url::parse("http://src/live/index.m3u8").unwrap();
        let rewritten = rewrite_line("segment123.ts", &upstream, "1", 0, "http://proxy").unwrap();

        assert!(rewritten.starts_with("http://proxy/segment/"));
        assert!(rewritten.ends_with(".ts"));

        let slug_part = rewritten.rsplit('/').next().unwrap();
        let (slug, ext) = split_extension(slug_part);
        assert_eq!(ext, Some("ts"));
        let segment = decode_segment(slug).unwrap();
        assert_eq!(segment.url, "http://src/live/segment123.ts");
        assert_eq!(segment.source, "1|0");
    }

    #[test]
    fn absolute_segment_urls_keep_their_host() {
        let upstream = url::Url::parse("http://src/live/index.m3u8").unwrap();
        let rewritten =
            rewrite_line("http://cdn.example/seg/4.ts", &upstream, "2", 7, "").unwrap();
        let (slug, _) = split_extension(rewritten.rsplit('/').next().unwrap());
        let segment = decode_segment(slug).unwrap();
        assert_eq!(segment.url, "http://cdn.example/seg/4.ts");
        assert_eq!(segment.source_parts(), Some(("2", 7)));
    }
}
