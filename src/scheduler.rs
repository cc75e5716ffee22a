//! Worker pool scheduling of a whole batch.
//!
//! [`BatchRun::prepare`] turns the input list into jobs (destination resolution
//! and probing happen here, in input order), [`BatchRun::run`] then feeds
//! pending jobs FIFO into at most `threads` concurrent process controllers.
//! [`BatchControl`] is the handle observers use to pause, resume, cancel or
//! stop while the run is in progress.

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{BatchConfig, Config, OverwriteMode};
use crate::context::RunContext;
use crate::error::{Result, RetempoError};
use crate::events::{BatchEvent, EventSink};
use crate::job::{Job, JobId, JobStatus};
use crate::media::{CommandBuilder, EncodeRequest, MediaProber};
use crate::overwrite::Resolution;
use crate::process::{ControllerSettings, ProcessController, ProcessSuspender};
use crate::progress::overall_progress;
use crate::report::BatchReport;
use crate::scan::SourceFile;

/// Control requests queued per job before the controller picks them up
const CONTROL_QUEUE: usize = 8;

pub struct BatchRun {
    ctx: Arc<RunContext>,
    settings: BatchConfig,
    builder: Arc<dyn CommandBuilder>,
    suspender: Arc<dyn ProcessSuspender>,
}

/// Cloneable handle for controlling a batch from outside the run
#[derive(Clone)]
pub struct BatchControl {
    ctx: Arc<RunContext>,
}

impl BatchRun {
    /// Validate the configuration and create one job per source, in order.
    ///
    /// Nothing is created when the configuration is unusable.
    pub async fn prepare(
        config: &Config,
        sources: Vec<SourceFile>,
        prober: Arc<dyn MediaProber>,
        builder: Arc<dyn CommandBuilder>,
        suspender: Arc<dyn ProcessSuspender>,
    ) -> Result<(Self, BatchControl, mpsc::UnboundedReceiver<BatchEvent>)> {
        config.validate()?;

        let (events, receiver) = EventSink::channel();
        let ctx = Arc::new(RunContext::new(config.batch.overwrite, events));
        let run = Self {
            ctx: ctx.clone(),
            settings: config.batch.clone(),
            builder,
            suspender,
        };

        let count = sources.len();
        for (index, source) in sources.into_iter().enumerate() {
            let job = run.create_job(index + 1, source, prober.as_ref()).await;
            ctx.insert(job).await;
        }
        info!(
            "Prepared {} {} jobs ({} threads, tempo {}, overwrite {:?})",
            count, run.settings.media_kind, run.settings.threads, run.settings.tempo, run.settings.overwrite
        );

        Ok((run, BatchControl { ctx }, receiver))
    }

    async fn create_job(&self, seq: usize, source: SourceFile, prober: &dyn MediaProber) -> Job {
        let kind = self.settings.media_kind;

        match self.ctx.resolver().resolve(&source.dest).await {
            Ok(Resolution::Skip(dest)) => {
                let mut job = Job::new(seq, source.source, dest, kind);
                job.skipped = true;
                if let Err(e) = job.transition(JobStatus::Succeeded) {
                    warn!("Job #{}: {}", seq, e);
                }
                info!("Skipping #{}: {} already exists", seq, job.dest.display());
                self.ctx.events().message(format!("Skipping {}", job.display_name()));
                job
            }
            Ok(resolution) => {
                let mut job = Job::new(seq, source.source, resolution.path().to_path_buf(), kind);
                job.reference = match prober.probe(&job.source).await {
                    Ok(info) => info.reference(kind, self.settings.tempo),
                    Err(e) => {
                        warn!("Job #{}: {}; progress will be indeterminate", seq, e);
                        None
                    }
                };
                if let Resolution::Overwrite(path) = &resolution {
                    info!("Job #{} will overwrite {}", seq, path.display());
                }
                job
            }
            Err(e) => {
                let mut job = Job::new(seq, source.source, source.dest, kind);
                error!("Job #{}: {}", seq, e);
                if let Err(err) = job.fail(e.to_string()) {
                    warn!("Job #{}: {}", seq, err);
                }
                self.ctx
                    .events()
                    .message(format!("Error processing {}: {}", job.display_name(), e));
                job
            }
        }
    }

    /// Run every pending job and wait until all of them reached a terminal state
    pub async fn run(self) -> Result<BatchReport> {
        let started_at = Local::now();
        let clock = Instant::now();
        let ctx = self.ctx.clone();

        let (stop_publishing, stop_rx) = oneshot::channel();
        let publisher = tokio::spawn(publish_progress(
            ctx.clone(),
            self.settings.publish_interval(),
            stop_rx,
        ));

        let semaphore = Arc::new(Semaphore::new(self.settings.threads));
        let mut workers = JoinSet::new();
        let ids = ctx.jobs().await.ids();

        for id in ids {
            if ctx.is_stopping() {
                break;
            }
            if ctx.job(id).await.map(|job| job.status) != Some(JobStatus::Pending) {
                continue;
            }

            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            if ctx.is_stopping() {
                break;
            }

            let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE);
            match ctx.begin(id, control_tx).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!("Could not start job {}: {}", id, e);
                    continue;
                }
            }
            let Some(job) = ctx.job(id).await else {
                continue;
            };

            let controller = ProcessController::new(
                ctx.clone(),
                &job,
                self.builder.build(&self.encode_request(&job)),
                self.suspender.clone(),
                ControllerSettings {
                    cancel_grace: self.settings.cancel_grace(),
                    replace_existing: self.settings.overwrite == OverwriteMode::Overwrite,
                },
            );

            let worker_ctx = ctx.clone();
            workers.spawn(async move {
                let _permit = permit;
                let status = controller.run(control_rx).await;
                worker_ctx.unregister(id).await;
                (id, status)
            });
        }

        while let Some(result) = workers.join_next().await {
            match result {
                Ok((id, status)) => debug!("Worker for job {} done: {}", id, status),
                Err(e) => error!("Worker task ended abnormally: {}", e),
            }
        }
        self.fail_abandoned().await;

        if stop_publishing.send(()).is_err() {
            debug!("Progress publisher already stopped");
        }
        if let Err(e) = publisher.await {
            warn!("Progress publisher ended abnormally: {}", e);
        }
        ctx.publish(true).await;

        let report = {
            let jobs = ctx.jobs().await;
            BatchReport::from_jobs(&jobs, started_at, clock.elapsed())
        };
        info!("{}", report);
        ctx.events().message(report.to_string());
        ctx.events().emit(BatchEvent::Finished(report.clone()));
        Ok(report)
    }

    fn encode_request(&self, job: &Job) -> EncodeRequest {
        EncodeRequest {
            source: job.source.clone(),
            dest: job.dest.clone(),
            media_kind: job.media_kind,
            tempo: self.settings.tempo,
            compression: self.settings.compression,
            overwrite: self.settings.overwrite == OverwriteMode::Overwrite,
        }
    }

    /// Jobs whose worker died without reaching a terminal state
    async fn fail_abandoned(&self) {
        for job in self.ctx.snapshot().await {
            if !job.status.is_active() {
                continue;
            }
            if job.status == JobStatus::Paused {
                if let Err(e) = self.ctx.transition(job.id, JobStatus::Running).await {
                    warn!("Job #{}: {}", job.seq, e);
                }
            }
            let reason = RetempoError::Encode {
                code: None,
                diagnostic: "encoder supervision ended unexpectedly".to_string(),
            };
            if let Err(e) = self.ctx.fail(job.id, &reason).await {
                warn!("Job #{}: {}", job.seq, e);
            }
        }
    }
}

async fn publish_progress(ctx: Arc<RunContext>, interval: Duration, mut stop: oneshot::Receiver<()>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                ctx.publish(false).await;
            }
            _ = &mut stop => break,
        }
    }
}

impl BatchControl {
    pub async fn request_pause(&self, id: JobId) -> Result<()> {
        self.ctx.request_pause(id).await
    }

    pub async fn request_resume(&self, id: JobId) -> Result<()> {
        self.ctx.request_resume(id).await
    }

    pub async fn request_cancel(&self, id: JobId) -> Result<()> {
        self.ctx.request_cancel(id).await
    }

    /// Cancel everything that has not finished; no new job starts afterwards
    pub async fn stop_all(&self) {
        self.ctx.stop_all().await
    }

    pub async fn snapshot(&self) -> Vec<Job> {
        self.ctx.snapshot().await
    }

    pub async fn job(&self, id: JobId) -> Option<Job> {
        self.ctx.job(id).await
    }

    /// Look up a job by its 1-based input position
    pub async fn job_by_seq(&self, seq: usize) -> Option<Job> {
        self.ctx.jobs().await.by_seq(seq).cloned()
    }

    /// Current weighted batch progress
    pub async fn progress(&self) -> f64 {
        overall_progress(self.ctx.jobs().await.iter())
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use assert_fs::TempDir;
    use assert_fs::prelude::*;

    use super::*;
    use crate::job::MediaKind;
    use crate::media::{MediaCommand, MediaInfo, MockMediaProber};
    use crate::process::NoSuspend;

    fn source(dir: &TempDir, name: &str) -> SourceFile {
        let input = dir.child(format!("in/{}", name));
        input.write_str("source").unwrap();
        SourceFile {
            source: input.path().to_path_buf(),
            dest: dir.child(format!("out/{}", name)).path().to_path_buf(),
        }
    }

    fn prober_with_duration(duration: f64) -> MockMediaProber {
        let mut prober = MockMediaProber::new();
        prober.expect_probe().returning(move |_| {
            Ok(MediaInfo {
                duration_secs: Some(duration),
                bit_rate_kbps: Some(128.0),
                size_bytes: 6,
            })
        });
        prober
    }

    fn counting_builder(calls: Arc<AtomicUsize>) -> Arc<dyn CommandBuilder> {
        Arc::new(move |request: &EncodeRequest| {
            calls.fetch_add(1, Ordering::SeqCst);
            MediaCommand::new("true", "noop").output(&request.dest)
        })
    }

    async fn prepare(
        config: &Config,
        sources: Vec<SourceFile>,
        prober: MockMediaProber,
        calls: Arc<AtomicUsize>,
    ) -> (BatchRun, BatchControl, mpsc::UnboundedReceiver<BatchEvent>) {
        BatchRun::prepare(
            config,
            sources,
            Arc::new(prober),
            counting_builder(calls),
            Arc::new(NoSuspend),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_invalid_config_creates_no_jobs() {
        let mut config = Config::default();
        config.encoder.ffmpeg_path = String::new();
        let dir = TempDir::new().unwrap();

        let mut prober = MockMediaProber::new();
        prober.expect_probe().never();
        let result = BatchRun::prepare(
            &config,
            vec![source(&dir, "a.mp4")],
            Arc::new(prober),
            counting_builder(Arc::new(AtomicUsize::new(0))),
            Arc::new(NoSuspend),
        )
        .await;
        assert!(matches!(result, Err(RetempoError::Config(_))));
    }

    #[tokio::test]
    async fn test_prepare_sets_video_reference_from_tempo() {
        let mut config = Config::default();
        config.batch.tempo = 2.0;
        let dir = TempDir::new().unwrap();

        let (_run, control, _events) = prepare(
            &config,
            vec![source(&dir, "a.mp4"), source(&dir, "b.mp4")],
            prober_with_duration(120.0),
            Arc::new(AtomicUsize::new(0)),
        )
        .await;

        let jobs = control.snapshot().await;
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs.iter().map(|job| job.seq).collect::<Vec<_>>(), vec![1, 2]);
        for job in &jobs {
            assert_eq!(job.status, JobStatus::Pending);
            assert_eq!(job.reference, Some(60.0));
        }
        assert_eq!(control.job_by_seq(2).await.map(|job| job.id), Some(jobs[1].id));
    }

    #[tokio::test]
    async fn test_skip_existing_destination_is_never_probed_or_started() {
        let config = Config::default();
        let dir = TempDir::new().unwrap();
        let done = source(&dir, "done.mp4");
        dir.child("out/done.mp4").write_str("encoded earlier").unwrap();

        let mut prober = MockMediaProber::new();
        prober.expect_probe().never();
        let calls = Arc::new(AtomicUsize::new(0));
        let (run, control, mut events) = prepare(&config, vec![done], prober, calls.clone()).await;

        let job = control.job_by_seq(1).await.unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert!(job.skipped);
        assert_eq!(job.progress, 1.0);
        assert_eq!(job.weight(), 0.0);

        let report = run.run().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!((report.total, report.skipped, report.succeeded), (1, 1, 0));
        assert_eq!(
            std::fs::read_to_string(dir.child("out/done.mp4").path()).unwrap(),
            "encoded earlier"
        );

        let mut finished = false;
        while let Ok(event) = events.try_recv() {
            if let BatchEvent::Finished(report) = event {
                assert_eq!(report.skipped, 1);
                finished = true;
            }
        }
        assert!(finished);
    }

    #[tokio::test]
    async fn test_rename_is_resolved_in_input_order() {
        let mut config = Config::default();
        config.batch.overwrite = OverwriteMode::Rename;
        config.batch.threads = 16;
        let dir = TempDir::new().unwrap();
        dir.child("out/clip.mp4").write_str("x").unwrap();

        let first = source(&dir, "clip.mp4");
        let second = SourceFile {
            source: dir.child("in/other/clip.mp4").path().to_path_buf(),
            dest: first.dest.clone(),
        };

        let (_run, control, _events) = prepare(
            &config,
            vec![first, second],
            prober_with_duration(10.0),
            Arc::new(AtomicUsize::new(0)),
        )
        .await;

        let dests: Vec<PathBuf> = control.snapshot().await.into_iter().map(|job| job.dest).collect();
        assert_eq!(
            dests,
            vec![
                dir.child("out/clip(1).mp4").path().to_path_buf(),
                dir.child("out/clip(2).mp4").path().to_path_buf(),
            ]
        );
    }

    #[tokio::test]
    async fn test_probe_failure_leaves_progress_indeterminate() {
        let config = Config::default();
        let dir = TempDir::new().unwrap();

        let mut prober = MockMediaProber::new();
        prober
            .expect_probe()
            .times(1)
            .returning(|path: &Path| Err(RetempoError::Probe(path.display().to_string())));
        let (_run, control, _events) = prepare(
            &config,
            vec![source(&dir, "a.mp4")],
            prober,
            Arc::new(AtomicUsize::new(0)),
        )
        .await;

        let job = control.job_by_seq(1).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.reference, None);
    }

    #[tokio::test]
    async fn test_cancel_pending_job_before_run() {
        let config = Config::default();
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let (run, control, _events) = prepare(
            &config,
            vec![source(&dir, "a.mp4")],
            prober_with_duration(10.0),
            calls.clone(),
        )
        .await;

        let id = control.job_by_seq(1).await.unwrap().id;
        control.request_cancel(id).await.unwrap();
        assert_eq!(control.job(id).await.unwrap().status, JobStatus::Canceled);

        // Already terminal: a second cancel is an invalid transition
        assert!(matches!(
            control.request_cancel(id).await,
            Err(RetempoError::InvalidTransition { from: JobStatus::Canceled, .. })
        ));
        assert!(matches!(
            control.request_pause(id).await,
            Err(RetempoError::InvalidTransition { .. })
        ));

        let report = run.run().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(report.canceled, 1);
    }

    #[tokio::test]
    async fn test_unknown_job_is_reported() {
        let config = Config::default();
        let (_run, control, _events) = prepare(
            &config,
            Vec::new(),
            MockMediaProber::new(),
            Arc::new(AtomicUsize::new(0)),
        )
        .await;

        assert!(matches!(
            control.request_resume(JobId::new()).await,
            Err(RetempoError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_all_before_run_cancels_everything() {
        let config = Config::default();
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let (run, control, _events) = prepare(
            &config,
            vec![source(&dir, "a.mp4"), source(&dir, "b.mp4"), source(&dir, "c.mp4")],
            prober_with_duration(10.0),
            calls.clone(),
        )
        .await;

        control.stop_all().await;
        let report = run.run().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!((report.total, report.canceled), (3, 3));
        assert_eq!(control.progress().await, 0.0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_with_trivial_encoder() {
        let mut config = Config::default();
        config.batch.threads = 2;
        config.batch.media_kind = MediaKind::Video;
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let (run, control, _events) = prepare(
            &config,
            vec![source(&dir, "a.mp4"), source(&dir, "b.mp4"), source(&dir, "c.mp4")],
            prober_with_duration(10.0),
            calls.clone(),
        )
        .await;

        let report = run.run().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.succeeded, 3);
        assert!(report.is_clean());
        for job in control.snapshot().await {
            assert_eq!(job.status, JobStatus::Succeeded);
            assert_eq!(job.progress, 1.0);
            assert_eq!(job.pid, None);
        }
        assert_eq!(control.progress().await, 1.0);
    }
}
