//! Job value object and its lifecycle state machine.
//!
//! A [`Job`] describes one file's transcode request together with the mutable
//! runtime state the scheduler and process controller drive it through.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, RetempoError};
use crate::progress::ProgressMetric;

/// Stable identity of a job for the lifetime of a batch run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of media a batch processes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Video files, progress measured on the output timeline
    Video,
    /// Audio files, progress measured in bytes written
    Audio,
}

impl MediaKind {
    pub fn progress_metric(&self) -> ProgressMetric {
        match self {
            MediaKind::Video => ProgressMetric::Time,
            MediaKind::Audio => ProgressMetric::Size,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Video => write!(f, "video"),
            MediaKind::Audio => write!(f, "audio"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Canceled,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Canceled | JobStatus::Succeeded | JobStatus::Failed
        )
    }

    /// Whether a live encoder process belongs to a job in this state
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Running | JobStatus::Paused)
    }

    /// The only legal edges between job states.
    ///
    /// The three `Pending -> terminal` edges cover work that never reaches a
    /// process: a skipped destination, a cancel before a slot was acquired, and
    /// a destination name that could not be resolved.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Succeeded)
                | (Pending, Canceled)
                | (Pending, Failed)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Canceled)
                | (Paused, Canceled)
                | (Running, Succeeded)
                | (Running, Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Canceled => "canceled",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// 1-based position in the input order
    pub seq: usize,
    pub source: PathBuf,
    pub dest: PathBuf,
    pub media_kind: MediaKind,
    pub status: JobStatus,
    pub progress: f64,
    /// Total duration (seconds) or estimated output size (bytes); `None` when unknown
    pub reference: Option<f64>,
    pub metric: ProgressMetric,
    /// OS process id while an encoder is attached
    pub pid: Option<u32>,
    pub error: Option<String>,
    pub skipped: bool,
    pub started_at: Option<DateTime<Local>>,
    pub finished_at: Option<DateTime<Local>>,
}

impl Job {
    pub fn new(seq: usize, source: PathBuf, dest: PathBuf, media_kind: MediaKind) -> Self {
        Self {
            id: JobId::new(),
            seq,
            source,
            dest,
            media_kind,
            status: JobStatus::Pending,
            progress: 0.0,
            reference: None,
            metric: media_kind.progress_metric(),
            pid: None,
            error: None,
            skipped: false,
            started_at: None,
            finished_at: None,
        }
    }

    /// Move the job along one edge of the state graph
    pub fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(RetempoError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: next,
            });
        }

        if self.status == JobStatus::Pending && next == JobStatus::Running {
            self.started_at = Some(Local::now());
        }

        self.status = next;

        if next.is_terminal() {
            self.pid = None;
            self.finished_at = Some(Local::now());
        }
        if next == JobStatus::Succeeded {
            self.progress = 1.0;
        }

        Ok(())
    }

    /// Mark the job failed with a diagnostic
    pub fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        self.transition(JobStatus::Failed)?;
        self.error = Some(error.into());
        Ok(())
    }

    /// Record a new progress fraction.
    ///
    /// Only applied while running; values are clamped to [0, 1] and never lower
    /// the current progress. Returns whether the stored value changed.
    pub fn set_progress(&mut self, fraction: f64) -> bool {
        if self.status != JobStatus::Running || !fraction.is_finite() {
            return false;
        }
        let fraction = fraction.clamp(0.0, 1.0);
        if fraction > self.progress {
            self.progress = fraction;
            true
        } else {
            false
        }
    }

    /// Weight of this job in the batch aggregate
    pub fn weight(&self) -> f64 {
        match self.reference {
            Some(reference) if reference.is_finite() && reference > 0.0 => reference,
            _ => 0.0,
        }
    }

    pub fn display_name(&self) -> String {
        self.dest
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| self.dest.display().to_string())
    }
}

/// Ordered collection of every job in a batch run, addressable by id
#[derive(Debug, Clone, Default)]
pub struct JobTable {
    jobs: Vec<Job>,
    index: HashMap<JobId, usize>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, job: Job) -> JobId {
        let id = job.id;
        self.index.insert(id, self.jobs.len());
        self.jobs.push(job);
        id
    }

    pub fn get(&self, id: JobId) -> Option<&Job> {
        self.index.get(&id).map(|&position| &self.jobs[position])
    }

    pub fn get_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.index
            .get(&id)
            .copied()
            .map(move |position| &mut self.jobs[position])
    }

    /// Look up a job by its 1-based input position
    pub fn by_seq(&self, seq: usize) -> Option<&Job> {
        self.jobs.iter().find(|job| job.seq == seq)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter()
    }

    /// Job ids in input order
    pub fn ids(&self) -> Vec<JobId> {
        self.jobs.iter().map(|job| job.id).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|job| job.status == status).count()
    }

    /// Number of jobs in a terminal state
    pub fn finished(&self) -> usize {
        self.jobs.iter().filter(|job| job.status.is_terminal()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(1, PathBuf::from("/in/a.mp4"), PathBuf::from("/out/a.mp4"), MediaKind::Video)
    }

    #[test]
    fn test_legal_lifecycle() {
        let mut job = job();
        job.transition(JobStatus::Running).unwrap();
        assert!(job.started_at.is_some());
        job.pid = Some(42);
        job.transition(JobStatus::Paused).unwrap();
        job.transition(JobStatus::Running).unwrap();
        job.transition(JobStatus::Succeeded).unwrap();
        assert_eq!(job.progress, 1.0);
        assert_eq!(job.pid, None);
        assert!(job.finished_at.is_some());
    }

    #[test]
    fn test_illegal_transitions_are_rejected() {
        let mut job = job();
        assert!(matches!(
            job.transition(JobStatus::Paused),
            Err(RetempoError::InvalidTransition { from: JobStatus::Pending, to: JobStatus::Paused, .. })
        ));

        job.transition(JobStatus::Running).unwrap();
        job.transition(JobStatus::Canceled).unwrap();
        for next in [
            JobStatus::Running,
            JobStatus::Paused,
            JobStatus::Succeeded,
            JobStatus::Failed,
            JobStatus::Pending,
        ] {
            assert!(job.transition(next).is_err(), "canceled -> {next} must fail");
        }
        assert_eq!(job.status, JobStatus::Canceled);
    }

    #[test]
    fn test_paused_job_cannot_finish_directly() {
        let mut job = job();
        job.transition(JobStatus::Running).unwrap();
        job.transition(JobStatus::Paused).unwrap();
        assert!(job.transition(JobStatus::Succeeded).is_err());
        assert!(job.transition(JobStatus::Failed).is_err());
    }

    #[test]
    fn test_progress_is_monotonic_and_frozen_when_paused() {
        let mut job = job();
        assert!(!job.set_progress(0.3), "pending jobs do not move");

        job.transition(JobStatus::Running).unwrap();
        assert!(job.set_progress(0.3));
        assert!(!job.set_progress(0.2));
        assert_eq!(job.progress, 0.3);
        assert!(job.set_progress(7.0));
        assert_eq!(job.progress, 1.0);

        let mut job = self::job();
        job.transition(JobStatus::Running).unwrap();
        job.set_progress(0.4);
        job.transition(JobStatus::Paused).unwrap();
        assert!(!job.set_progress(0.9));
        assert_eq!(job.progress, 0.4);
    }

    #[test]
    fn test_failed_job_keeps_last_progress() {
        let mut job = job();
        job.transition(JobStatus::Running).unwrap();
        job.set_progress(0.25);
        job.fail("boom").unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.progress, 0.25);
        assert_eq!(job.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_table_lookup() {
        let mut table = JobTable::new();
        let first = table.push(job());
        let mut second = job();
        second.seq = 2;
        let second = table.push(second);

        assert_eq!(table.len(), 2);
        assert_eq!(table.ids(), vec![first, second]);
        assert_eq!(table.by_seq(2).map(|job| job.id), Some(second));
        assert!(table.by_seq(3).is_none());

        table.get_mut(first).unwrap().transition(JobStatus::Canceled).unwrap();
        assert_eq!(table.count(JobStatus::Canceled), 1);
        assert_eq!(table.finished(), 1);
        assert_eq!(table.get(second).unwrap().status, JobStatus::Pending);
    }

    #[test]
    fn test_weight_ignores_unknown_reference() {
        let mut job = job();
        assert_eq!(job.weight(), 0.0);
        job.reference = Some(0.0);
        assert_eq!(job.weight(), 0.0);
        job.reference = Some(12.5);
        assert_eq!(job.weight(), 12.5);
    }
}
