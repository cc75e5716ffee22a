use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::job::{JobStatus, JobTable};

/// End-of-batch summary
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub total: usize,
    /// Jobs that were actually encoded
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub canceled: usize,
    pub started_at: DateTime<Local>,
    pub elapsed: Duration,
    /// Size of the inputs of every job whose output exists (encoded or skipped)
    pub source_bytes: u64,
    /// Size of the outputs of the same jobs
    pub output_bytes: u64,
    /// Source path and error of each failed job
    pub failures: Vec<(PathBuf, String)>,
}

fn file_size(path: &std::path::Path) -> u64 {
    std::fs::metadata(path).map(|meta| meta.len()).unwrap_or(0)
}

impl BatchReport {
    pub fn from_jobs(jobs: &JobTable, started_at: DateTime<Local>, elapsed: Duration) -> Self {
        let mut report = Self {
            total: jobs.len(),
            succeeded: 0,
            skipped: 0,
            failed: jobs.count(JobStatus::Failed),
            canceled: jobs.count(JobStatus::Canceled),
            started_at,
            elapsed,
            source_bytes: 0,
            output_bytes: 0,
            failures: Vec::new(),
        };

        for job in jobs.iter() {
            match job.status {
                JobStatus::Succeeded => {
                    if job.skipped {
                        report.skipped += 1;
                    } else {
                        report.succeeded += 1;
                    }
                    report.source_bytes += file_size(&job.source);
                    report.output_bytes += file_size(&job.dest);
                }
                JobStatus::Failed => report.failures.push((
                    job.source.clone(),
                    job.error.clone().unwrap_or_else(|| "unknown error".to_string()),
                )),
                JobStatus::Pending | JobStatus::Running | JobStatus::Paused | JobStatus::Canceled => {}
            }
        }

        report
    }

    /// Input bytes per output byte, when anything was written
    pub fn compression_ratio(&self) -> Option<f64> {
        (self.output_bytes > 0).then(|| self.source_bytes as f64 / self.output_bytes as f64)
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.canceled == 0
    }
}

/// `95s` -> `1 min 35 sec`, under a minute with two decimals
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if secs < 60.0 {
        format!("{:.2} sec", secs)
    } else {
        let whole = elapsed.as_secs();
        format!("{} min {} sec", whole / 60, whole % 60)
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} Files Total: {} Processed", self.total, self.succeeded)?;
        if self.skipped > 0 {
            write!(f, ", {} Skipped", self.skipped)?;
        }
        if self.failed > 0 {
            write!(f, ", {} Errors", self.failed)?;
        }
        if self.canceled > 0 {
            write!(f, ", {} Cancelled", self.canceled)?;
        }
        if !self.elapsed.is_zero() && self.skipped < self.total {
            write!(f, " in {}.", format_elapsed(self.elapsed))?;
        }
        if let Some(ratio) = self.compression_ratio() {
            write!(f, " Compression ratio {:.2}.", ratio)?;
        }
        Ok(())
    }
}
