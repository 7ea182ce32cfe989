//! Orchestration of one download: probe, plan, parallel segments, merge,
//! validation.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::config::DownloaderConfig;
use crate::error::{DownloadError, TransportError};
use crate::hashing::FileValidator;
use crate::planner;
use crate::progress::{ProgressAggregator, ProgressSink, ThrottledEmitter};
use crate::segment::{SegmentDownloader, SegmentJob};
use crate::state::{AggregateProgress, DownloadOutcome, DownloadPhase, FileInfo, SegmentPlan};
use crate::storage::{
    ensure_dir, load_plan, merge_parts, move_into_place, part_path, remove_work_dir, save_plan,
    work_dir_for,
};
use crate::transport::{HttpTransport, ReqwestTransport};

pub struct Downloader {
    transport: Arc<dyn HttpTransport>,
    config: DownloaderConfig,
    validator: Option<Arc<FileValidator>>,
}

impl Downloader {
    pub fn new(config: DownloaderConfig) -> Result<Self> {
        config.validate()?;
        let transport =
            ReqwestTransport::new(config.http.clone()).context("Failed to build HTTP client")?;
        Ok(Self::with_transport(Arc::new(transport), config))
    }

    pub fn with_transport(transport: Arc<dyn HttpTransport>, config: DownloaderConfig) -> Self {
        Self {
            transport,
            config,
            validator: None,
        }
    }

    /// Checks every finished file with `validator` before reporting success.
    pub fn with_validator(mut self, validator: FileValidator) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Starts downloading `url` into `output_path` on the current tokio
    /// runtime. When `file_info` is `None` the resource is probed first.
    pub fn start(
        &self,
        url: impl Into<String>,
        output_path: impl Into<PathBuf>,
        file_info: Option<FileInfo>,
    ) -> DownloadHandle {
        let (events_tx, events_rx) = mpsc::channel(self.config.event_buffer.max(1));
        let (phase_tx, phase_rx) = watch::channel(DownloadPhase::NotStarted);
        let cancel = CancellationToken::new();

        let run = DownloadRun {
            url: url.into(),
            output: output_path.into(),
            file_info,
            transport: self.transport.clone(),
            config: self.config.clone(),
            validator: self.validator.clone(),
            events: events_tx,
            phase: phase_tx,
            cancel: cancel.clone(),
            undelivered: None,
        };
        let task = tokio::spawn(run.execute());

        DownloadHandle {
            events: events_rx,
            phase: phase_rx,
            cancel: cancel.clone(),
            guard: cancel.drop_guard(),
            task,
        }
    }
}

/// Caller side of a running download. Dropping the handle cancels it.
pub struct DownloadHandle {
    events: mpsc::Receiver<DownloadOutcome>,
    phase: watch::Receiver<DownloadPhase>,
    cancel: CancellationToken,
    guard: DropGuard,
    task: JoinHandle<DownloadPhase>,
}

impl DownloadHandle {
    /// Next event, or `None` once the download has ended.
    pub async fn next(&mut self) -> Option<DownloadOutcome> {
        self.events.recv().await
    }

    /// Stops all segments. Part files stay on disk for a later attempt.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn phase(&self) -> DownloadPhase {
        *self.phase.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<DownloadPhase> {
        self.phase.clone()
    }

    /// Discards remaining events and waits for the final phase.
    pub async fn finish(self) -> DownloadPhase {
        self.collect().await.1
    }

    /// Gathers all remaining events and the final phase.
    pub async fn collect(self) -> (Vec<DownloadOutcome>, DownloadPhase) {
        let DownloadHandle {
            mut events,
            guard,
            task,
            ..
        } = self;

        let mut collected = Vec::new();
        while let Some(event) = events.recv().await {
            collected.push(event);
        }
        let phase = match task.await {
            Ok(phase) => phase,
            Err(e) => {
                warn!("Download task ended abnormally: {}", e);
                DownloadPhase::Failed
            }
        };
        guard.disarm();
        (collected, phase)
    }
}

/// Forwards throttled progress to the caller without ever waiting on it.
///
/// When the caller's buffer is full the newest value is kept in `undelivered`
/// instead, to be sent ahead of the terminal event.
struct OutcomeSink {
    events: mpsc::Sender<DownloadOutcome>,
    url: String,
    undelivered: Option<AggregateProgress>,
}

impl ProgressSink<AggregateProgress> for OutcomeSink {
    fn send(&mut self, progress: AggregateProgress) {
        let event = DownloadOutcome::Progress {
            url: self.url.clone(),
            progress,
        };
        match self.events.try_send(event) {
            Ok(()) => self.undelivered = None,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("Event buffer full, progress update held back");
                self.undelivered = Some(progress);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

struct DownloadRun {
    url: String,
    output: PathBuf,
    file_info: Option<FileInfo>,
    transport: Arc<dyn HttpTransport>,
    config: DownloaderConfig,
    validator: Option<Arc<FileValidator>>,
    events: mpsc::Sender<DownloadOutcome>,
    phase: watch::Sender<DownloadPhase>,
    cancel: CancellationToken,
    undelivered: Option<AggregateProgress>,
}

impl DownloadRun {
    async fn execute(mut self) -> DownloadPhase {
        info!("Downloading {} to {:?}", self.url, self.output);

        let (phase, outcome) = match self.run().await {
            Ok(path) => {
                info!("Completed {} -> {:?}", self.url, path);
                let outcome = DownloadOutcome::Completed {
                    url: self.url.clone(),
                    path,
                };
                (DownloadPhase::Completed, Some(outcome))
            }
            Err(e) if e.is_cancelled() || self.cancel.is_cancelled() => {
                info!("Cancelled {}", self.url);
                (DownloadPhase::Cancelled, None)
            }
            Err(error) => {
                warn!("Download of {} failed: {}", self.url, error);
                let outcome = DownloadOutcome::Failed {
                    url: self.url.clone(),
                    error,
                };
                (DownloadPhase::Failed, Some(outcome))
            }
        };

        self.set_phase(phase);
        if let Some(outcome) = outcome {
            // The receiver is gone when the caller dropped the handle.
            if let Some(progress) = self.undelivered.take() {
                let event = DownloadOutcome::Progress {
                    url: self.url.clone(),
                    progress,
                };
                let _ = self.events.send(event).await;
            }
            let _ = self.events.send(outcome).await;
        }
        phase
    }

    async fn run(&mut self) -> Result<PathBuf, DownloadError> {
        self.set_phase(DownloadPhase::Probing);
        let info = match self.file_info {
            Some(info) => info,
            None => self.probe().await?,
        };

        self.set_phase(DownloadPhase::Downloading);
        let plan = planner::plan(&info, self.config.max_parallelism);
        info!(
            "{}: {} bytes in {} segment(s), ranged={}",
            self.url,
            info.total_size,
            plan.len(),
            plan.is_ranged()
        );

        let work_dir = work_dir_for(&self.url, &self.output);
        self.prepare_work_dir(&work_dir, &plan)
            .await
            .map_err(|source| DownloadError::WorkDir {
                path: work_dir.clone(),
                source,
            })?;

        let received = self.download_segments(&plan, &work_dir).await?;
        debug!("{}: {} bytes received over the network", self.url, received);

        if self.cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        self.set_phase(DownloadPhase::Merging);
        self.assemble(&plan, &work_dir).await?;

        if let Some(validator) = &self.validator {
            self.set_phase(DownloadPhase::Validating);
            info!("Verifying {} of {:?}", validator.algorithm_name(), self.output);
            if !validator.validate(&self.output).await {
                return Err(DownloadError::ValidationFailed {
                    path: self.output.clone(),
                });
            }
        }

        Ok(self.output.clone())
    }

    async fn probe(&self) -> Result<FileInfo, DownloadError> {
        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
            res = self.transport.probe(&self.url) => res.map_err(DownloadError::MetadataFailed)?,
        };
        let total_size = response
            .content_length
            .ok_or(DownloadError::MetadataFailed(TransportError::MissingContentLength))?;
        Ok(FileInfo::new(total_size, response.accepts_ranges))
    }

    /// Part files are only kept when they were written for `plan`; anything
    /// left by a different layout is discarded before the plan is stored.
    async fn prepare_work_dir(&self, work_dir: &Path, plan: &SegmentPlan) -> std::io::Result<()> {
        match load_plan(work_dir).await? {
            Some(stored) if stored == *plan => {
                debug!("{}: resuming with the stored plan", self.url);
                return Ok(());
            }
            Some(_) => info!("{}: segment layout changed, discarding part files", self.url),
            None => {}
        }
        remove_work_dir(work_dir).await?;
        ensure_dir(work_dir).await?;
        save_plan(work_dir, plan).await
    }

    /// Runs one task per segment and feeds their progress through the
    /// aggregator and throttle. The first failing segment stops the others.
    async fn download_segments(&mut self, plan: &SegmentPlan, work_dir: &Path) -> Result<u64, DownloadError> {
        let (progress_tx, mut progress_rx) = broadcast::channel(self.config.progress_buffer.max(1));
        let segment_cancel = self.cancel.child_token();
        let downloader = SegmentDownloader::new(
            self.transport.clone(),
            self.config.chunk_size,
            self.config.http.socket_idle_timeout(),
        );

        let mut tasks = JoinSet::new();
        for segment in plan.iter() {
            let job = SegmentJob {
                url: self.url.clone(),
                segment: segment.clone(),
                ranged: plan.is_ranged(),
                part_path: part_path(work_dir, segment.index),
            };
            let downloader = downloader.clone();
            let progress = progress_tx.clone();
            let cancel = segment_cancel.clone();
            tasks.spawn(async move {
                let result = downloader.run(&job, &progress, &cancel).await;
                (job.segment.index, result)
            });
        }

        let mut aggregator = ProgressAggregator::new(plan.total_size());
        let sink = OutcomeSink {
            events: self.events.clone(),
            url: self.url.clone(),
            undelivered: None,
        };
        let mut emitter = ThrottledEmitter::new(sink, self.config.throttle_interval());
        let mut received = 0;

        let outcome = loop {
            tokio::select! {
                biased;
                msg = progress_rx.recv() => match msg {
                    Ok(p) => {
                        if aggregator.record_progress(&p) {
                            emitter.publish(aggregator.snapshot());
                        }
                    }
                    Err(RecvError::Lagged(n)) => debug!("{} progress updates dropped", n),
                    Err(RecvError::Closed) => {}
                },
                joined = tasks.join_next() => match joined {
                    None => break Ok(()),
                    Some(Ok((index, Ok(bytes)))) => {
                        received += bytes;
                        // Its last updates may have been dropped by a lagging channel.
                        if let Some(segment) = plan.segments().get(index) {
                            if aggregator.record(index, segment.len(), segment.len()) {
                                emitter.publish(aggregator.snapshot());
                            }
                        }
                    }
                    Some(Ok((index, Err(e)))) => break Err(DownloadError::from_segment(index, e)),
                    Some(Err(e)) => break Err(DownloadError::from(e)),
                },
            }
        };

        if let Err(e) = outcome {
            // Let the remaining segments stop and flush; their part files stay
            // for a resume.
            segment_cancel.cancel();
            while let Some(joined) = tasks.join_next().await {
                if let Ok((index, Err(err))) = joined {
                    debug!("Segment {} stopped: {}", index, err);
                }
            }
            return Err(e);
        }

        let mut grew = false;
        loop {
            match progress_rx.try_recv() {
                Ok(p) => grew |= aggregator.record_progress(&p),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        if grew {
            emitter.publish(aggregator.snapshot());
        }
        emitter.flush();
        self.undelivered = emitter.into_inner().undelivered;

        Ok(received)
    }

    async fn assemble(&self, plan: &SegmentPlan, work_dir: &Path) -> Result<(), DownloadError> {
        if plan.len() > 1 {
            let written = merge_parts(work_dir, plan.len(), &self.output)
                .await
                .map_err(DownloadError::MergeFailed)?;
            if written != plan.total_size() {
                return Err(DownloadError::SizeMismatch {
                    expected: plan.total_size(),
                    actual: written,
                });
            }
            remove_work_dir(work_dir)
                .await
                .map_err(DownloadError::MergeFailed)?;
        } else {
            move_into_place(&part_path(work_dir, 0), &self.output)
                .await
                .map_err(DownloadError::MergeFailed)?;
            remove_work_dir(work_dir)
                .await
                .map_err(DownloadError::MergeFailed)?;
        }
        Ok(())
    }

    fn set_phase(&self, phase: DownloadPhase) {
        debug!("{}: {:?}", self.url, phase);
        self.phase.send_replace(phase);
    }
}
