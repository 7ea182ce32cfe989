//! Download of a single segment into its part file.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{SegmentError, TransportError};
use crate::state::{Segment, SegmentProgress};
use crate::storage::{existing_size, remove_file_if_exists};
use crate::transport::{BodyStream, ByteRange, HttpTransport};

/// What one segment task downloads and where it writes.
#[derive(Debug, Clone)]
pub struct SegmentJob {
    pub url: String,
    pub segment: Segment,
    /// Fetch with a `Range` header. Unranged jobs always cover the whole file.
    pub ranged: bool,
    pub part_path: PathBuf,
}

#[derive(Clone)]
pub struct SegmentDownloader {
    transport: Arc<dyn HttpTransport>,
    chunk_size: usize,
    idle_timeout: Duration,
}

impl SegmentDownloader {
    pub fn new(transport: Arc<dyn HttpTransport>, chunk_size: usize, idle_timeout: Duration) -> Self {
        Self {
            transport,
            chunk_size: chunk_size.max(1),
            idle_timeout,
        }
    }

    /// Downloads `job` into its part file, resuming from bytes left by a
    /// previous attempt where possible. Returns the number of bytes received
    /// over the network.
    pub async fn run(
        &self,
        job: &SegmentJob,
        progress: &broadcast::Sender<SegmentProgress>,
        cancel: &CancellationToken,
    ) -> Result<u64, SegmentError> {
        let index = job.segment.index;
        let len = job.segment.len();
        let existing = existing_size(&job.part_path).await?;

        if len == 0 {
            File::create(&job.part_path).await?;
            return Ok(0);
        }

        let baseline = if job.ranged {
            if existing > 0 && existing < len {
                debug!("Segment {}: resuming at {} of {} bytes", index, existing, len);
                existing
            } else {
                if existing > 0 {
                    debug!("Segment {}: discarding part file of {} bytes", index, existing);
                }
                remove_file_if_exists(&job.part_path).await?;
                0
            }
        } else if existing == len {
            debug!("Segment {}: part file already complete", index);
            report(progress, index, len, len);
            return Ok(0);
        } else {
            if existing > 0 {
                debug!("Segment {}: range requests unsupported, restarting", index);
            }
            remove_file_if_exists(&job.part_path).await?;
            0
        };

        if baseline > 0 {
            report(progress, index, baseline, len);
        }

        let range = job
            .ranged
            .then(|| ByteRange::new(job.segment.start() + baseline, job.segment.end_inclusive()));

        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SegmentError::Cancelled),
            res = self.transport.get(&job.url, range) => res?,
        };

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&job.part_path)
            .await?;
        file.seek(SeekFrom::Start(baseline)).await?;

        let mut written = baseline;
        let result = self
            .write_body(stream, &mut file, &mut written, len, index, progress, cancel)
            .await;
        // Flush even on error so the bytes already received count on resume.
        let flushed = file.flush().await;
        result?;
        flushed?;

        if written < len {
            return Err(SegmentError::Incomplete {
                received: written,
                expected: len,
            });
        }

        debug!("Segment {}: finished ({} new bytes)", index, written - baseline);
        Ok(written - baseline)
    }

    #[allow(clippy::too_many_arguments)]
    async fn write_body(
        &self,
        mut stream: BodyStream,
        file: &mut File,
        written: &mut u64,
        len: u64,
        index: usize,
        progress: &broadcast::Sender<SegmentProgress>,
        cancel: &CancellationToken,
    ) -> Result<(), SegmentError> {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SegmentError::Cancelled),
                next = tokio::time::timeout(self.idle_timeout, stream.next()) => next,
            };
            let chunk = match next {
                Err(_) => return Err(TransportError::IdleTimeout(self.idle_timeout).into()),
                Ok(None) => return Ok(()),
                Ok(Some(chunk)) => chunk?,
            };

            for piece in chunk.chunks(self.chunk_size) {
                let remaining = len - *written;
                if remaining == 0 {
                    // Never write past the end of the segment.
                    return Ok(());
                }
                let take = piece.len().min(remaining as usize);
                file.write_all(&piece[..take]).await?;
                *written += take as u64;
                report(progress, index, *written, len);

                if cancel.is_cancelled() {
                    return Err(SegmentError::Cancelled);
                }
            }
        }
    }
}

fn report(progress: &broadcast::Sender<SegmentProgress>, index: usize, downloaded: u64, total: u64) {
    // No receiver means nobody is listening any more; the segment keeps going.
    let _ = progress.send(SegmentProgress {
        segment_index: index,
        downloaded_bytes: downloaded,
        segment_total_bytes: total,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::mock_transport::{pattern, MockTransport};
    use crate::storage::part_path;

    fn downloader(mock: &Arc<MockTransport>) -> SegmentDownloader {
        SegmentDownloader::new(mock.clone(), 8192, Duration::from_secs(5))
    }

    fn job(dir: &std::path::Path, segment: Segment, ranged: bool) -> SegmentJob {
        SegmentJob {
            url: "https://files.example/data.bin".to_string(),
            part_path: part_path(dir, segment.index),
            segment,
            ranged,
        }
    }

    #[tokio::test]
    async fn fresh_segment_downloads_its_range() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockTransport::new(100_000));
        let (tx, mut rx) = broadcast::channel(1024);
        let job = job(dir.path(), Segment::new(1, 40_000..100_000), true);

        let received = downloader(&mock)
            .run(&job, &tx, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(received, 60_000);
        assert_eq!(mock.requests(), vec![Some(ByteRange::new(40_000, 99_999))]);
        let bytes = tokio::fs::read(&job.part_path).await.unwrap();
        assert_eq!(bytes, pattern(40_000..100_000));

        let mut last = None;
        while let Ok(p) = rx.try_recv() {
            assert_eq!(p.segment_index, 1);
            assert_eq!(p.segment_total_bytes, 60_000);
            assert!(p.downloaded_bytes <= 60_000);
            last = Some(p);
        }
        assert_eq!(last.unwrap().downloaded_bytes, 60_000);
    }

    #[tokio::test]
    async fn progress_is_reported_per_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockTransport::new(20_000).with_body_chunk(20_000));
        let (tx, mut rx) = broadcast::channel(1024);
        let job = job(dir.path(), Segment::new(0, 0..20_000), true);

        downloader(&mock)
            .run(&job, &tx, &CancellationToken::new())
            .await
            .unwrap();

        let mut seen = Vec::new();
        while let Ok(p) = rx.try_recv() {
            seen.push(p.downloaded_bytes);
        }
        assert_eq!(seen, vec![8192, 16384, 20_000]);
    }

    #[tokio::test]
    async fn resumes_from_partial_part_file() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockTransport::new(100_000));
        let (tx, mut rx) = broadcast::channel(1024);
        let job = job(dir.path(), Segment::new(1, 40_000..100_000), true);
        tokio::fs::write(&job.part_path, pattern(40_000..45_000)).await.unwrap();

        let received = downloader(&mock)
            .run(&job, &tx, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(received, 55_000);
        assert_eq!(mock.requests(), vec![Some(ByteRange::new(45_000, 99_999))]);
        let bytes = tokio::fs::read(&job.part_path).await.unwrap();
        assert_eq!(bytes.len(), 60_000);
        assert_eq!(bytes, pattern(40_000..100_000));

        let first = rx.try_recv().unwrap();
        assert_eq!(first.downloaded_bytes, 5_000);
        assert_eq!(first.segment_total_bytes, 60_000);
    }

    #[tokio::test]
    async fn full_or_oversized_part_file_restarts() {
        for stale in [60_000usize, 70_000] {
            let dir = tempfile::tempdir().unwrap();
            let mock = Arc::new(MockTransport::new(100_000));
            let (tx, _rx) = broadcast::channel(1024);
            let job = job(dir.path(), Segment::new(1, 40_000..100_000), true);
            tokio::fs::write(&job.part_path, vec![0xAAu8; stale]).await.unwrap();

            downloader(&mock)
                .run(&job, &tx, &CancellationToken::new())
                .await
                .unwrap();

            assert_eq!(mock.requests(), vec![Some(ByteRange::new(40_000, 99_999))]);
            let bytes = tokio::fs::read(&job.part_path).await.unwrap();
            assert_eq!(bytes, pattern(40_000..100_000));
        }
    }

    #[tokio::test]
    async fn empty_part_file_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockTransport::new(10_000));
        let (tx, _rx) = broadcast::channel(1024);
        let job = job(dir.path(), Segment::new(0, 0..10_000), true);
        tokio::fs::write(&job.part_path, b"").await.unwrap();

        downloader(&mock)
            .run(&job, &tx, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(mock.requests(), vec![Some(ByteRange::new(0, 9_999))]);
    }

    #[tokio::test]
    async fn unranged_segment_sends_no_range() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockTransport::new(1024).without_ranges());
        let (tx, _rx) = broadcast::channel(16);
        let job = job(dir.path(), Segment::new(0, 0..1024), false);
        tokio::fs::write(&job.part_path, b"partial").await.unwrap();

        downloader(&mock)
            .run(&job, &tx, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(mock.requests(), vec![None]);
        assert_eq!(tokio::fs::read(&job.part_path).await.unwrap(), pattern(0..1024));
    }

    #[tokio::test]
    async fn complete_unranged_part_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockTransport::new(1024).without_ranges());
        let (tx, mut rx) = broadcast::channel(16);
        let job = job(dir.path(), Segment::new(0, 0..1024), false);
        tokio::fs::write(&job.part_path, pattern(0..1024)).await.unwrap();

        let received = downloader(&mock)
            .run(&job, &tx, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(received, 0);
        assert!(mock.requests().is_empty());
        assert_eq!(rx.try_recv().unwrap().downloaded_bytes, 1024);
    }

    #[tokio::test]
    async fn failure_keeps_received_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockTransport::new(100_000).fail_once(0, 30_000));
        let (tx, _rx) = broadcast::channel(1024);
        let job = job(dir.path(), Segment::new(0, 0..100_000), true);

        let err = downloader(&mock)
            .run(&job, &tx, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, SegmentError::Transport(TransportError::Body(_))));
        assert_eq!(existing_size(&job.part_path).await.unwrap(), 30_000);
    }

    #[tokio::test]
    async fn early_end_of_body_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockTransport::new(100_000).truncate_bodies(10_000));
        let (tx, _rx) = broadcast::channel(1024);
        let job = job(dir.path(), Segment::new(0, 0..100_000), true);

        let err = downloader(&mock)
            .run(&job, &tx, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SegmentError::Incomplete {
                received: 10_000,
                expected: 100_000
            }
        ));
    }

    #[tokio::test]
    async fn cancellation_stops_a_stalled_segment() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockTransport::new(100_000).stall_after(16_384));
        let (tx, mut rx) = broadcast::channel(1024);
        let job = job(dir.path(), Segment::new(0, 0..100_000), true);
        let cancel = CancellationToken::new();

        let task = {
            let downloader = downloader(&mock);
            let job = job.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { downloader.run(&job, &tx, &cancel).await })
        };

        loop {
            let p = rx.recv().await.unwrap();
            if p.downloaded_bytes == 16_384 {
                break;
            }
        }
        cancel.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, SegmentError::Cancelled));
        assert_eq!(existing_size(&job.part_path).await.unwrap(), 16_384);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockTransport::new(100_000).stall_after(8192));
        let (tx, _rx) = broadcast::channel(1024);
        let job = job(dir.path(), Segment::new(0, 0..100_000), true);
        let downloader = SegmentDownloader::new(mock.clone(), 8192, Duration::from_secs(30));

        let err = downloader
            .run(&job, &tx, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SegmentError::Transport(TransportError::IdleTimeout(_))
        ));
    }

    #[tokio::test]
    async fn zero_length_segment_makes_no_request() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockTransport::new(0));
        let (tx, _rx) = broadcast::channel(16);
        let job = job(dir.path(), Segment::new(0, 0..0), false);

        downloader(&mock)
            .run(&job, &tx, &CancellationToken::new())
            .await
            .unwrap();

        assert!(mock.requests().is_empty());
        assert_eq!(existing_size(&job.part_path).await.unwrap(), 0);
        assert!(job.part_path.exists());
    }
}
