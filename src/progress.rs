//! Progress aggregation and throttled publishing.
//!
//! Segment tasks report [`SegmentProgress`] values; the orchestrator folds
//! them into an [`AggregateProgress`] and hands the result to a
//! [`ThrottledEmitter`], which forwards at most one value per interval.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::state::{AggregateProgress, SegmentProgress};

/// Latest progress per segment, summed against the file's known total.
#[derive(Debug, Clone)]
pub struct ProgressAggregator {
    total_bytes: u64,
    segments: HashMap<usize, (u64, u64)>,
}

impl ProgressAggregator {
    pub fn new(total_bytes: u64) -> Self {
        Self {
            total_bytes,
            segments: HashMap::new(),
        }
    }

    /// Stores the latest counters of a segment. A value smaller than the one
    /// already stored for the same segment is ignored, so late deliveries
    /// cannot move the aggregate backwards. Returns `true` if the aggregate
    /// grew.
    pub fn record(&mut self, segment_index: usize, downloaded: u64, total: u64) -> bool {
        let entry = self.segments.entry(segment_index).or_insert((0, total));
        if downloaded < entry.0 {
            return false;
        }
        let grew = downloaded > entry.0;
        *entry = (downloaded, total);
        grew
    }

    pub fn record_progress(&mut self, progress: &SegmentProgress) -> bool {
        self.record(
            progress.segment_index,
            progress.downloaded_bytes,
            progress.segment_total_bytes,
        )
    }

    pub fn snapshot(&self) -> AggregateProgress {
        AggregateProgress {
            downloaded_bytes: self.segments.values().map(|(done, _)| done).sum(),
            total_bytes: self.total_bytes,
        }
    }
}

/// Destination of published values.
pub trait ProgressSink<T> {
    fn send(&mut self, value: T);
}

impl<T, F> ProgressSink<T> for F
where
    F: FnMut(T),
{
    fn send(&mut self, value: T) {
        self(value)
    }
}

/// Forwards a value to its sink only when `interval` has elapsed since the
/// previous forward. Skipped values are not queued; only the most recent one
/// is remembered so that [`ThrottledEmitter::flush`] can deliver it.
pub struct ThrottledEmitter<T, S> {
    sink: S,
    interval: Duration,
    last_emit: Option<Instant>,
    pending: Option<T>,
}

impl<T, S> ThrottledEmitter<T, S>
where
    S: ProgressSink<T>,
{
    pub fn new(sink: S, interval: Duration) -> Self {
        Self {
            sink,
            interval,
            last_emit: None,
            pending: None,
        }
    }

    /// Returns `true` if the value was forwarded.
    pub fn publish(&mut self, value: T) -> bool {
        let now = Instant::now();
        let due = self
            .last_emit
            .map_or(true, |last| now.duration_since(last) >= self.interval);

        if due {
            self.last_emit = Some(now);
            self.pending = None;
            self.sink.send(value);
        } else {
            self.pending = Some(value);
        }
        due
    }

    /// Forwards the last skipped value, if any, regardless of the interval.
    pub fn flush(&mut self) -> bool {
        match self.pending.take() {
            Some(value) => {
                self.last_emit = Some(Instant::now());
                self.sink.send(value);
                true
            }
            None => false,
        }
    }

    pub fn into_inner(self) -> S {
        self.sink
    }
}
