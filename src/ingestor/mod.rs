//! Playlist ingestion: source download with on-disk fallback, and EXTINF
//! parsing into [`crate::models::StreamInfo`] records.

pub mod downloader;
pub mod m3u_parser;

pub use downloader::{FetchKind, SourceDownloader, SourceLines};
pub use m3u_parser::M3uParser;
