use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::path::PathBuf;

use crate::error::DownloadError;

/// Size and range support of a remote resource, resolved once per download.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub total_size: u64,
    pub supports_range: bool,
}

impl FileInfo {
    pub fn new(total_size: u64, supports_range: bool) -> Self {
        Self {
            total_size,
            supports_range,
        }
    }
}

/// One contiguous byte range of the target file. `range` is half-open.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub index: usize,
    pub range: Range<u64>,
}

impl Segment {
    pub fn new(index: usize, range: Range<u64>) -> Self {
        Self { index, range }
    }

    pub fn len(&self) -> u64 {
        self.range.end - self.range.start
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    pub fn start(&self) -> u64 {
        self.range.start
    }

    /// Last byte offset covered, as sent in a `Range` header. Only meaningful
    /// for non-empty segments.
    pub fn end_inclusive(&self) -> u64 {
        self.range.end.saturating_sub(1)
    }
}

/// Ordered segments covering `[0, total_size)` without gaps or overlaps.
///
/// The plan is stored next to the part files, so a later attempt can tell
/// whether they were written for the same layout.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SegmentPlan {
    segments: Vec<Segment>,
    total_size: u64,
    ranged: bool,
}

impl SegmentPlan {
    pub(crate) fn new(segments: Vec<Segment>, total_size: u64, ranged: bool) -> Self {
        Self {
            segments,
            total_size,
            ranged,
        }
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Whether segments are fetched with `Range` requests.
    pub fn is_ranged(&self) -> bool {
        self.ranged
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentProgress {
    pub segment_index: usize,
    pub downloaded_bytes: u64,
    pub segment_total_bytes: u64,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AggregateProgress {
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
}

impl AggregateProgress {
    /// Fraction in `0.0..=1.0`; an empty resource counts as done.
    pub fn ratio(&self) -> f64 {
        if self.total_bytes == 0 {
            return 1.0;
        }
        self.downloaded_bytes as f64 / self.total_bytes as f64
    }
}

/// Events delivered to the caller of [`crate::Downloader::start`].
///
/// Any number of `Progress` events is followed by at most one of `Completed`
/// or `Failed`. A cancelled download ends without a terminal event.
#[derive(Debug)]
pub enum DownloadOutcome {
    Progress {
        url: String,
        progress: AggregateProgress,
    },
    Completed {
        url: String,
        path: PathBuf,
    },
    Failed {
        url: String,
        error: DownloadError,
    },
}

impl DownloadOutcome {
    pub fn is_terminal(&self) -> bool {
        match self {
            DownloadOutcome::Progress { .. } => false,
            DownloadOutcome::Completed { .. } | DownloadOutcome::Failed { .. } => true,
        }
    }

    pub fn url(&self) -> &str {
        match self {
            DownloadOutcome::Progress { url, .. }
            | DownloadOutcome::Completed { url, .. }
            | DownloadOutcome::Failed { url, .. } => url,
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DownloadPhase {
    NotStarted,
    Probing,
    Downloading,
    Merging,
    Validating,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadPhase::Completed | DownloadPhase::Failed | DownloadPhase::Cancelled
        )
    }
}
