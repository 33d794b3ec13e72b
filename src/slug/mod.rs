//! Slug codec (C6).
//!
//! A slug is the channel identity embedded in outbound stream URLs:
//! JSON-serialized [`StreamInfo`] (without its urls map), zstd-compressed
//! and base64-URL-encoded without padding. Decoding yields the identity with
//! an empty urls map; [`hydrate_urls`] repopulates it from the per-URL index
//! files written at parse time.
//!
//! Segments flowing through rewritten M3U8 manifests use the same wire
//! shape over the much smaller [`SegmentRef`].

use std::cell::RefCell;
use std::path::Path;

use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::errors::AppError;
use crate::models::{SegmentRef, StreamInfo};
use crate::utils::{decode_component, encode_component};

const COMPRESSION_LEVEL: i32 = 3;

/// Decompressed slugs are tiny; this cap only guards against hostile input.
const MAX_DECODED_LEN: usize = 256 * 1024;

thread_local! {
    static COMPRESSOR: RefCell<Option<zstd::bulk::Compressor<'static>>> = RefCell::new(None);
    static DECOMPRESSOR: RefCell<Option<zstd::bulk::Decompressor<'static>>> = RefCell::new(None);
}

fn compress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    COMPRESSOR.with(|cell| {
        let mut slot = cell.borrow_mut();
        if slot.is_none() {
            *slot = Some(zstd::bulk::Compressor::new(COMPRESSION_LEVEL)?);
        }
        slot.as_mut().expect("compressor").compress(data)
    })
}

fn decompress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    DECOMPRESSOR.with(|cell| {
        let mut slot = cell.borrow_mut();
        if slot.is_none() {
            *slot = Some(zstd::bulk::Decompressor::new()?);
        }
        slot.as_mut()
            .expect("decompressor")
            .decompress(data, MAX_DECODED_LEN)
    })
}

fn encode<T: Serialize>(value: &T) -> Result<String, AppError> {
    let json = serde_json::to_vec(value).map_err(|e| AppError::slug(e.to_string()))?;
    let packed = compress(&json).map_err(|e| AppError::slug(e.to_string()))?;
    Ok(encode_component(&packed))
}

fn decode<T: DeserializeOwned>(slug: &str) -> Result<T, AppError> {
    let packed =
        decode_component(slug).ok_or_else(|| AppError::slug("slug is not valid base64"))?;
    let json = decompress(&packed).map_err(|e| AppError::slug(e.to_string()))?;
    serde_json::from_slice(&json).map_err(|e| AppError::slug(e.to_string()))
}

/// Encode a channel identity. The urls map is never part of the slug.
pub fn encode_slug(info: &StreamInfo) -> Result<String, AppError> {
    let mut stripped = info.clone();
    stripped.urls.clear();
    encode(&stripped)
}

/// Decode a channel identity; urls comes back empty.
pub fn decode_slug(slug: &str) -> Result<StreamInfo, AppError> {
    decode(slug)
}

/// Encode one segment reference for a rewritten manifest line.
pub fn encode_segment(segment: &SegmentRef) -> Result<String, AppError> {
    encode(segment)
}

/// Decode a segment reference from a `/segment/<slug>` path.
pub fn decode_segment(slug: &str) -> Result<SegmentRef, AppError> {
    decode(slug)
}

/// Strip an optional `.ext` suffix from a slug path segment. Slugs are
/// base64-URL and never contain dots themselves.
pub fn split_extension(segment: &str) -> (&str, Option<&str>) {
    match segment.split_once('.') {
        Some((slug, ext)) => (slug, Some(ext).filter(|e| !e.is_empty())),
        None => (segment, None),
    }
}

/// Repopulate a decoded channel's urls map from the on-disk index.
///
/// Index files live under `<streamsDir>/<hash prefix>/` named
/// `<b64(title)>_<sourceID>|<urlHash>`; every shard directory is scanned for
/// the title prefix. Returns the number of rehydrated URLs.
pub fn hydrate_urls(info: &mut StreamInfo, streams_dir: &Path) -> usize {
    let prefix = format!("{}_", encode_component(info.title.as_bytes()));
    let mut found = 0;

    let Ok(shards) = std::fs::read_dir(streams_dir) else {
        return 0;
    };
    for shard in shards.flatten() {
        let Ok(files) = std::fs::read_dir(shard.path()) else {
            continue;
        };
        for file in files.flatten() {
            let name = file.file_name().to_string_lossy().into_owned();
            let Some(rest) = name.strip_prefix(&prefix) else {
                continue;
            };
            let Some((source_id, url_hash)) = rest.split_once('|') else {
                continue;
            };
            let Ok(body) = std::fs::read_to_string(file.path()) else {
                continue;
            };
            let Some((line, encoded_url)) = body.trim().split_once(":::") else {
                continue;
            };
            let (Ok(line_num), Some(url_bytes)) =
                (line.parse::<u64>(), decode_component(encoded_url))
            else {
                continue;
            };
            let url = String::from_utf8_lossy(&url_bytes).into_owned();
            info.add_url(source_id, url_hash, line_num, &url);
            found += 1;
        }
    }

    debug!("Hydrated {} urls for channel '{}'", found, info.title);
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn info() -> StreamInfo {
        let mut urls = BTreeMap::new();
        urls.insert(
            "1".to_string(),
            BTreeMap::from([("hash".to_string(), "0:::http://a/x".to_string())]),
        );
        StreamInfo {
            title: "BBC One".to_string(),
            tvg_id: "bbc1".to_string(),
            tvg_chno: "101".to_string(),
            tvg_type: "live".to_string(),
            logo_url: "http://proxy/a/abc".to_string(),
            group: "UK".to_string(),
            urls,
            source_m3u: "1".to_string(),
            source_index: 7,
        }
    }

    #[test]
    fn slug_round_trip_drops_urls_only() {
        let original = info();
        let slug = encode_slug(&original).unwrap();
        assert!(!slug.contains('/'));
        assert!(!slug.contains('+'));

        let decoded = decode_slug(&slug).unwrap();
        assert_eq!(decoded.title, original.title);
        assert_eq!(decoded.tvg_id, original.tvg_id);
        assert_eq!(decoded.tvg_chno, original.tvg_chno);
        assert_eq!(decoded.tvg_type, original.tvg_type);
        assert_eq!(decoded.logo_url, original.logo_url);
        assert_eq!(decoded.group, original.group);
        assert_eq!(decoded.source_m3u, original.source_m3u);
        assert_eq!(decoded.source_index, original.source_index);
        assert!(decoded.urls.is_empty());
    }

    #[test]
    fn segment_round_trip() {
        let segment = SegmentRef::new("http://src/live/segment123.ts", "1", 0);
        let slug = encode_segment(&segment).unwrap();
        let decoded = decode_segment(&slug).unwrap();
        assert_eq!(decoded, segment);
        assert_eq!(decoded.source_parts(), Some(("1", 0)));
    }

    #[test]
    fn garbage_slugs_are_rejected() {
        assert!(decode_slug("%%%not-base64%%%").is_err());
        let valid_b64_garbage = encode_component(b"not zstd at all");
        assert!(decode_slug(&valid_b64_garbage).is_err());
    }

    #[test]
    fn extension_is_split_off() {
        assert_eq!(split_extension("abcDEF.ts"), ("abcDEF", Some("ts")));
        assert_eq!(split_extension("abcDEF"), ("abcDEF", None));
        assert_eq!(split_extension("abcDEF."), ("abcDEF", None));
    }

    #[test]
    fn hydrate_reads_index_files() {
        let dir = tempfile::tempdir().unwrap();
        let streams_dir = dir.path().join("streams");

        // Write index entries the way the parser does.
        let url = "http://a/bbc1";
        let hash = crate::ingestor::m3u_parser::hash_url(url);
        let shard = streams_dir.join(&hash[..3]);
        std::fs::create_dir_all(&shard).unwrap();
        std::fs::write(
            shard.join(format!("{}_1|{}", encode_component(b"BBC One"), hash)),
            format!("4:::{}", encode_component(url.as_bytes())),
        )
        .unwrap();

        // A different title in the same shard must not leak in.
        std::fs::write(
            shard.join(format!("{}_1|{}", encode_component(b"Other"), hash)),
            format!("9:::{}", encode_component(b"http://a/other")),
        )
        .unwrap();

        let mut decoded = decode_slug(&encode_slug(&info()).unwrap()).unwrap();
        let found = hydrate_urls(&mut decoded, &streams_dir);
        assert_eq!(found, 1);
        assert_eq!(decoded.urls["1"][&hash], format!("4:::{}", url));
    }
}
