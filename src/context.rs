//! Shared state of one batch run.
//!
//! The job table and the resolver's claimed names are the only state workers
//! share. Lock order is always job table first, control registry second.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, RwLock, RwLockReadGuard, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::OverwriteMode;
use crate::error::{Result, RetempoError};
use crate::events::EventSink;
use crate::job::{Job, JobId, JobStatus, JobTable};
use crate::overwrite::OverwriteResolver;
use crate::process::{ControlMessage, ControlRequest};
use crate::progress::ProgressAggregator;

pub struct RunContext {
    jobs: RwLock<JobTable>,
    controls: Mutex<HashMap<JobId, mpsc::Sender<ControlMessage>>>,
    resolver: OverwriteResolver,
    aggregator: ProgressAggregator,
    events: EventSink,
    stopping: AtomicBool,
}

impl RunContext {
    pub fn new(mode: OverwriteMode, events: EventSink) -> Self {
        Self {
            jobs: RwLock::new(JobTable::new()),
            controls: Mutex::new(HashMap::new()),
            resolver: OverwriteResolver::new(mode),
            aggregator: ProgressAggregator::new(),
            events,
            stopping: AtomicBool::new(false),
        }
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    pub fn resolver(&self) -> &OverwriteResolver {
        &self.resolver
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Read access to the whole table, e.g. for a consistent snapshot
    pub async fn jobs(&self) -> RwLockReadGuard<'_, JobTable> {
        self.jobs.read().await
    }

    pub async fn job(&self, id: JobId) -> Option<Job> {
        self.jobs.read().await.get(id).cloned()
    }

    pub async fn snapshot(&self) -> Vec<Job> {
        self.jobs.read().await.iter().cloned().collect()
    }

    /// Add a job; terminal jobs (skipped, unresolvable) are announced right away
    pub async fn insert(&self, job: Job) -> JobId {
        let (id, seq, status) = (job.id, job.seq, job.status);
        self.jobs.write().await.push(job);
        if status != JobStatus::Pending {
            self.events.status(id, seq, status);
        }
        id
    }

    /// Move a job along the state graph and announce it
    pub async fn transition(&self, id: JobId, next: JobStatus) -> Result<()> {
        let seq = {
            let mut jobs = self.jobs.write().await;
            let job = jobs.get_mut(id).ok_or(RetempoError::JobNotFound(id))?;
            job.transition(next)?;
            job.seq
        };
        debug!("Job #{} is now {}", seq, next);
        self.events.status(id, seq, next);
        self.aggregator.mark(id).await;
        Ok(())
    }

    /// Mark a running job failed and record why
    pub async fn fail(&self, id: JobId, reason: &RetempoError) -> Result<()> {
        let (seq, name) = {
            let mut jobs = self.jobs.write().await;
            let job = jobs.get_mut(id).ok_or(RetempoError::JobNotFound(id))?;
            job.fail(reason.to_string())?;
            (job.seq, job.display_name())
        };
        error!("Job #{} ({}) failed: {}", seq, name, reason);
        self.events.status(id, seq, JobStatus::Failed);
        self.events.message(format!("Error processing {}: {}", name, reason));
        self.aggregator.mark(id).await;
        Ok(())
    }

    pub async fn update_progress(&self, id: JobId, fraction: f64) {
        let changed = match self.jobs.write().await.get_mut(id) {
            Some(job) => job.set_progress(fraction),
            None => false,
        };
        if changed {
            self.aggregator.mark(id).await;
        }
    }

    pub async fn set_pid(&self, id: JobId, pid: Option<u32>) {
        if let Some(job) = self.jobs.write().await.get_mut(id) {
            job.pid = pid;
        }
    }

    /// Take a pending job into a worker slot.
    ///
    /// The `Pending -> Running` edge and the control channel registration
    /// happen under one lock, so a control request either sees a pending job
    /// or finds its controller. Returns false when the job is no longer pending.
    pub async fn begin(&self, id: JobId, control: mpsc::Sender<ControlMessage>) -> Result<bool> {
        let seq = {
            let mut jobs = self.jobs.write().await;
            let job = jobs.get_mut(id).ok_or(RetempoError::JobNotFound(id))?;
            if job.status != JobStatus::Pending {
                return Ok(false);
            }
            job.transition(JobStatus::Running)?;
            self.controls.lock().await.insert(id, control);
            job.seq
        };
        self.events.status(id, seq, JobStatus::Running);
        self.aggregator.mark(id).await;
        Ok(true)
    }

    /// Drop a finished job's control channel
    pub async fn unregister(&self, id: JobId) {
        self.controls.lock().await.remove(&id);
    }

    pub async fn request_pause(&self, id: JobId) -> Result<()> {
        self.route(id, ControlRequest::Pause, JobStatus::Running, JobStatus::Paused)
            .await
    }

    pub async fn request_resume(&self, id: JobId) -> Result<()> {
        self.route(id, ControlRequest::Resume, JobStatus::Paused, JobStatus::Running)
            .await
    }

    /// Cancel a job; a pending one is canceled on the spot
    pub async fn request_cancel(&self, id: JobId) -> Result<()> {
        let sender = {
            let mut jobs = self.jobs.write().await;
            let job = jobs.get_mut(id).ok_or(RetempoError::JobNotFound(id))?;
            match job.status {
                JobStatus::Pending => {
                    job.transition(JobStatus::Canceled)?;
                    let seq = job.seq;
                    drop(jobs);
                    info!("Canceled pending job #{}", seq);
                    self.events.status(id, seq, JobStatus::Canceled);
                    self.aggregator.mark(id).await;
                    return Ok(());
                }
                JobStatus::Running | JobStatus::Paused => {}
                from => {
                    return Err(RetempoError::InvalidTransition {
                        id,
                        from,
                        to: JobStatus::Canceled,
                    });
                }
            }
            self.controls.lock().await.get(&id).cloned()
        };

        let reply = self.send(id, sender, ControlRequest::Cancel).await?;
        self.await_reply(id, reply, JobStatus::Canceled).await
    }

    /// Cancel every job that has not finished and refuse to start new ones
    pub async fn stop_all(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            debug!("Stop already requested");
        }
        info!("Stopping batch");

        let mut active = Vec::new();
        let mut canceled = Vec::new();
        {
            let mut jobs = self.jobs.write().await;
            for id in jobs.ids() {
                let Some(job) = jobs.get_mut(id) else { continue };
                match job.status {
                    JobStatus::Pending => {
                        if job.transition(JobStatus::Canceled).is_ok() {
                            canceled.push((id, job.seq));
                        }
                    }
                    JobStatus::Running | JobStatus::Paused => active.push(id),
                    _ => {}
                }
            }
        }
        for (id, seq) in canceled {
            self.events.status(id, seq, JobStatus::Canceled);
            self.aggregator.mark(id).await;
        }

        let mut replies = Vec::new();
        for id in active {
            let sender = self.controls.lock().await.get(&id).cloned();
            match self.send(id, sender, ControlRequest::Cancel).await {
                Ok(reply) => replies.push((id, reply)),
                Err(e) => debug!("Job {} finished before stop reached it: {}", id, e),
            }
        }
        for (id, reply) in replies {
            if let Err(e) = self.await_reply(id, reply, JobStatus::Canceled).await {
                warn!("Stopping job {}: {}", id, e);
            }
        }
    }

    /// Publish coalesced progress from a consistent view of the table
    pub async fn publish(&self, force: bool) -> f64 {
        let jobs = self.jobs.read().await;
        self.aggregator.publish(&jobs, &self.events, force).await
    }

    async fn route(
        &self,
        id: JobId,
        request: ControlRequest,
        required: JobStatus,
        next: JobStatus,
    ) -> Result<()> {
        let sender = {
            let jobs = self.jobs.read().await;
            let job = jobs.get(id).ok_or(RetempoError::JobNotFound(id))?;
            if job.status != required {
                return Err(RetempoError::InvalidTransition {
                    id,
                    from: job.status,
                    to: next,
                });
            }
            self.controls.lock().await.get(&id).cloned()
        };

        let reply = self.send(id, sender, request).await?;
        self.await_reply(id, reply, next).await
    }

    async fn send(
        &self,
        id: JobId,
        sender: Option<mpsc::Sender<ControlMessage>>,
        request: ControlRequest,
    ) -> Result<oneshot::Receiver<Result<()>>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let message = ControlMessage {
            request,
            reply: reply_tx,
        };
        match sender {
            Some(sender) if sender.send(message).await.is_ok() => Ok(reply_rx),
            _ => Err(self.stale_request(id, request.target()).await),
        }
    }

    async fn await_reply(
        &self,
        id: JobId,
        reply: oneshot::Receiver<Result<()>>,
        next: JobStatus,
    ) -> Result<()> {
        match reply.await {
            Ok(result) => result,
            Err(_) => Err(self.stale_request(id, next).await),
        }
    }

    /// The controller went away before answering: the job already finished
    async fn stale_request(&self, id: JobId, to: JobStatus) -> RetempoError {
        match self.jobs.read().await.get(id) {
            Some(job) => RetempoError::InvalidTransition {
                id,
                from: job.status,
                to,
            },
            None => RetempoError::JobNotFound(id),
        }
    }
}
