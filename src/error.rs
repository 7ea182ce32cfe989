//! Error types for the download engine.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failures reported by an [`crate::transport::HttpTransport`].
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("server responded with status {0}")]
    Status(u16),

    #[error("server ignored the Range header")]
    RangeIgnored,

    #[error("server did not report a content length")]
    MissingContentLength,

    #[error("no data received for {0:?}")]
    IdleTimeout(Duration),

    #[error("response body error: {0}")]
    Body(String),
}

/// Failure of a single segment task.
#[derive(Debug, Error)]
pub enum SegmentError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("part file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("body ended after {received} of {expected} bytes")]
    Incomplete { received: u64, expected: u64 },

    #[error("segment cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("failed to resolve file metadata: {0}")]
    MetadataFailed(#[source] TransportError),

    #[error("segment {segment} failed: {source}")]
    TransferFailed {
        segment: usize,
        #[source]
        source: SegmentError,
    },

    #[error("failed to create working directory {path:?}: {source}")]
    WorkDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to assemble output file: {0}")]
    MergeFailed(#[source] std::io::Error),

    #[error("assembled file has {actual} bytes, expected {expected}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("digest mismatch for {path:?}")]
    ValidationFailed { path: PathBuf },

    #[error("download cancelled")]
    Cancelled,

    #[error("download task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

impl DownloadError {
    pub(crate) fn from_segment(segment: usize, err: SegmentError) -> Self {
        match err {
            SegmentError::Cancelled => DownloadError::Cancelled,
            source => DownloadError::TransferFailed { segment, source },
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DownloadError::Cancelled)
    }
}
