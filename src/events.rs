use tokio::sync::mpsc;
use tracing::trace;

use crate::job::{JobId, JobStatus};
use crate::report::BatchReport;

/// Notifications a batch run publishes to its observer (terminal UI, tests, ...)
#[derive(Debug, Clone)]
pub enum BatchEvent {
    JobStatusChanged {
        id: JobId,
        seq: usize,
        status: JobStatus,
    },
    /// `fraction` is `None` while the job's progress is indeterminate
    JobProgress {
        id: JobId,
        seq: usize,
        fraction: Option<f64>,
    },
    BatchProgress {
        fraction: f64,
        finished: usize,
        total: usize,
    },
    /// Human readable status line
    Message(String),
    Finished(BatchReport),
}

/// Sending half of the event channel.
///
/// Sending never blocks; events are dropped once the receiver is gone.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<BatchEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<BatchEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: BatchEvent) {
        if self.tx.send(event).is_err() {
            trace!("Event receiver dropped, discarding event");
        }
    }

    pub fn status(&self, id: JobId, seq: usize, status: JobStatus) {
        self.emit(BatchEvent::JobStatusChanged { id, seq, status });
    }

    pub fn message(&self, message: impl Into<String>) {
        self.emit(BatchEvent::Message(message.into()));
    }
}
