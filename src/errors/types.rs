//! Error types, one enum per layer of the system.
//!
//! Each failure domain gets its own type: a source can fail to download
//! ([`SourceError`]), a sorter shard can fail on disk ([`SorterError`]),
//! the merge pipeline can go critical or be cancelled ([`PipelineError`]),
//! and the load balancer can run out of upstreams ([`BalancerError`]).
//! [`StreamStatus`] is the terminal outcome a proxied stream reports.

use thiserror::Error;

/// Umbrella over the per-layer errors for the seams that can see any of
/// them fail: slug decoding, HTTP handlers, startup wiring. Inside a layer
/// the specific enum below is the one to return.
#[derive(Error, Debug)]
pub enum AppError {
    /// Source download/fallback errors
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// Sorting store errors
    #[error("Sorter error: {0}")]
    Sorter(#[from] SorterError),

    /// Pipeline orchestration errors
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// Load balancer outcomes
    #[error("Balancer error: {0}")]
    Balancer(#[from] BalancerError),

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Slug encoding/decoding errors
    #[error("Slug error: {message}")]
    Slug { message: String },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Filesystem errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Source download specific errors
///
/// A failing source is non-fatal for the overall pipeline: the processor
/// logs the error and continues with the remaining sources.
#[derive(Error, Debug)]
pub enum SourceError {
    /// Both the live fetch and the on-disk fallback failed
    #[error("Source '{source_id}' unavailable: {message}")]
    Unavailable { source_id: String, message: String },

    /// Remote endpoint answered with a non-200 status
    #[error("Source '{source_id}' returned HTTP {status}")]
    BadStatus { source_id: String, status: u16 },

    /// The response body did not start with the #EXTM3U header
    #[error("Source '{source_id}' is not an M3U playlist")]
    NotM3u { source_id: String },

    /// Network failure while downloading
    #[error("Download failed for source '{source_id}': {message}")]
    Download { source_id: String, message: String },
}

/// Sorting store specific errors
#[derive(Error, Debug)]
pub enum SorterError {
    /// A shard file could not be read or written; marks the run critical
    #[error("Shard {shard:04} I/O failed: {message}")]
    ShardIo { shard: usize, message: String },

    /// Shard contents could not be decoded
    #[error("Shard {shard:04} is corrupt: {source}")]
    Corrupt {
        shard: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Pipeline orchestration errors
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Final write or rename of the merged artifact failed
    #[error("Compile failed: {message}")]
    CompileIo { message: String },

    /// A consumer worker hit an unrecoverable error mid-run
    #[error("Critical error during processing: {message}")]
    Critical { message: String },

    /// The caller cancelled the run before the compile completed
    #[error("Pipeline cancelled")]
    Cancelled,
}

/// Load balancer outcomes
#[derive(Error, Debug)]
pub enum BalancerError {
    /// The decoded channel carries no upstream URLs at all
    #[error("No upstream URLs for channel '{title}'")]
    NoUrls { title: String },

    /// Every sub-URL was probed without a successful connection
    #[error("All upstreams exhausted for channel '{title}' after {laps} laps")]
    AllExhausted { title: String, laps: u32 },

    /// The client went away while the balancer was still probing
    #[error("Balancing cancelled")]
    Cancelled,
}

/// Terminal status of one proxied stream, as observed by the media handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    /// The downstream client closed its connection
    ClientClosed,
    /// The upstream stopped delivering bytes
    UpstreamError,
    /// Something on our side broke while relaying
    ServerError,
}

impl StreamStatus {
    /// HTTP status code published with the terminal chunk
    pub fn status_code(&self) -> u16 {
        match self {
            StreamStatus::ClientClosed => 200,
            StreamStatus::UpstreamError => 502,
            StreamStatus::ServerError => 500,
        }
    }
}

/// Shorthand constructors for the string-carrying variants.
impl AppError {
    /// Configuration problem described by `message`.
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Slug codec failure.
    pub fn slug<S: Into<String>>(message: S) -> Self {
        Self::Slug {
            message: message.into(),
        }
    }

    /// Anything that has no better home.
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl SourceError {
    /// Both fetch paths failed for this source.
    pub fn unavailable<S: Into<String>, M: Into<String>>(source_id: S, message: M) -> Self {
        Self::Unavailable {
            source_id: source_id.into(),
            message: message.into(),
        }
    }

    /// Network or I/O failure while reading this source.
    pub fn download<S: Into<String>, M: Into<String>>(source_id: S, message: M) -> Self {
        Self::Download {
            source_id: source_id.into(),
            message: message.into(),
        }
    }
}

impl SorterError {
    /// Shard read/write failure; the processor treats this as critical.
    pub fn shard_io<M: Into<String>>(shard: usize, message: M) -> Self {
        Self::ShardIo {
            shard,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_status_maps_to_http() {
        assert_eq!(StreamStatus::ClientClosed.status_code(), 200);
        assert_eq!(StreamStatus::UpstreamError.status_code(), 502);
        assert_eq!(StreamStatus::ServerError.status_code(), 500);
    }

    #[test]
    fn source_error_display_names_the_source() {
        let err = SourceError::unavailable("3", "connection refused");
        assert!(err.to_string().contains("'3'"));
        assert!(err.to_string().contains("connection refused"));
    }
}
