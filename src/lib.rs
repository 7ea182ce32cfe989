//! Resumable, multi-connection file downloads.
//!
//! [`Downloader::start`] probes the resource, splits it into byte ranges when
//! the server supports ranged requests, downloads the ranges concurrently into
//! part files and assembles them into the output file. Progress and the final
//! result arrive as [`DownloadOutcome`] events on the returned
//! [`DownloadHandle`]. Part files survive failures and cancellation, so
//! starting the same URL/output pair again resumes where the last attempt
//! stopped.

pub mod config;
pub mod downloader;
pub mod error;
pub mod hashing;
pub mod logging;
pub mod planner;
pub mod progress;
pub mod segment;
pub mod state;
pub mod storage;
pub mod transport;
pub mod utils;

#[cfg(test)]
mod tests;

pub use config::{DownloaderConfig, HttpConfig};
pub use downloader::{DownloadHandle, Downloader};
pub use error::{DownloadError, SegmentError, TransportError};
pub use hashing::{DigestAlgorithm, DigestEncoding, FileValidator, Md5Digest, Sha256Digest};
pub use state::{
    AggregateProgress, DownloadOutcome, DownloadPhase, FileInfo, Segment, SegmentPlan,
    SegmentProgress,
};
pub use transport::{HttpTransport, ReqwestTransport};
