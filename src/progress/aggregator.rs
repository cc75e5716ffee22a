//! Batch-level progress.
//!
//! Per-job progress lives in the shared [`JobTable`]; controllers only mark a
//! job as dirty here. A publish tick then reads the whole table under one lock,
//! so every published aggregate reflects a single consistent snapshot and only
//! the latest value per job is ever sent.

use std::collections::HashSet;

use tokio::sync::Mutex;
use tracing::debug;

use crate::events::{BatchEvent, EventSink};
use crate::job::{Job, JobId, JobStatus, JobTable};

/// Weighted completion of a set of jobs.
///
/// `Σ(progress * reference) / Σ(reference)`. Jobs without a usable reference
/// carry no weight; when no job has one the result falls back to the share
/// of jobs in a terminal state.
pub fn overall_progress<'a, I>(jobs: I) -> f64
where
    I: IntoIterator<Item = &'a Job>,
{
    let mut weighted = 0.0;
    let mut total_weight = 0.0;
    let mut count = 0usize;
    let mut finished = 0usize;

    for job in jobs {
        count += 1;
        if job.status.is_terminal() {
            finished += 1;
        }
        let weight = job.weight();
        weighted += job.progress * weight;
        total_weight += weight;
    }

    if total_weight > 0.0 {
        (weighted / total_weight).clamp(0.0, 1.0)
    } else if count > 0 {
        finished as f64 / count as f64
    } else {
        0.0
    }
}

/// Fraction to show for one job, `None` while it is indeterminate
pub fn job_fraction(job: &Job) -> Option<f64> {
    if job.weight() > 0.0 || job.status == JobStatus::Succeeded {
        Some(job.progress)
    } else {
        None
    }
}

#[derive(Debug, Default)]
pub struct ProgressAggregator {
    dirty: Mutex<HashSet<JobId>>,
    last_published: Mutex<Option<(f64, usize)>>,
}

impl ProgressAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Note that a job's progress changed since the last tick
    pub async fn mark(&self, id: JobId) {
        self.dirty.lock().await.insert(id);
    }

    /// Publish coalesced job progress and the batch aggregate.
    ///
    /// Nothing is sent when no job changed and the aggregate is the same as
    /// last time, unless `force` is set.
    pub async fn publish(&self, jobs: &JobTable, sink: &EventSink, force: bool) -> f64 {
        let dirty: Vec<JobId> = self.dirty.lock().await.drain().collect();

        for id in &dirty {
            if let Some(job) = jobs.get(*id) {
                sink.emit(BatchEvent::JobProgress {
                    id: job.id,
                    seq: job.seq,
                    fraction: job_fraction(job),
                });
            }
        }

        let fraction = overall_progress(jobs.iter());
        let finished = jobs.finished();

        let mut last = self.last_published.lock().await;
        let changed = *last != Some((fraction, finished));
        if force || changed || !dirty.is_empty() {
            debug!(
                "Batch progress {:.1}% ({}/{} finished)",
                fraction * 100.0,
                finished,
                jobs.len()
            );
            sink.emit(BatchEvent::BatchProgress {
                fraction,
                finished,
                total: jobs.len(),
            });
            *last = Some((fraction, finished));
        }

        fraction
    }
}
