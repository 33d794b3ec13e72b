//! M3U playlist merger and failover stream proxy.
//!
//! The crate consolidates any number of upstream IPTV playlists into a single
//! merged M3U artifact and proxies the live streams behind it. Channels that
//! share a title across sources are merged into one entry carrying every
//! upstream URL; stream requests are balanced across those alternates with
//! per-source concurrency caps and automatic failover, and a single upstream
//! connection is fanned out to all downstream clients watching the same
//! channel.

pub mod config;
pub mod errors;
pub mod ingestor;
pub mod models;
pub mod processor;
pub mod proxy;
pub mod scheduler;
pub mod slug;
pub mod sorter;
pub mod streaming;
pub mod utils;
pub mod web;
