use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Split};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::context::RunContext;
use crate::error::{Result, RetempoError};
use crate::job::{Job, JobId, JobStatus};
use crate::media::MediaCommand;
use crate::progress::ProgressTracker;

use super::ProcessSuspender;

/// Lines of encoder stderr kept for failure reports
const DIAGNOSTIC_LINES: usize = 20;

/// How long to keep reading output after the encoder exited
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    Pause,
    Resume,
    Cancel,
}

impl ControlRequest {
    /// State the job ends up in when the request succeeds
    pub fn target(&self) -> JobStatus {
        match self {
            ControlRequest::Pause => JobStatus::Paused,
            ControlRequest::Resume => JobStatus::Running,
            ControlRequest::Cancel => JobStatus::Canceled,
        }
    }
}

/// A control request plus the channel its outcome is reported on
#[derive(Debug)]
pub struct ControlMessage {
    pub request: ControlRequest,
    pub reply: oneshot::Sender<Result<()>>,
}

#[derive(Debug, Clone, Copy)]
pub struct ControllerSettings {
    /// Time a terminated encoder gets before it is killed
    pub cancel_grace: Duration,
    /// Whether the encoder was told to replace an existing destination
    pub replace_existing: bool,
}

/// Owns the encoder process of one running job.
///
/// Drives the job from `Running` to a terminal state: feeds encoder output to
/// the progress tracker, serves pause/resume/cancel requests, and removes
/// partial output when the job does not succeed.
pub struct ProcessController {
    ctx: Arc<RunContext>,
    id: JobId,
    seq: usize,
    dest: PathBuf,
    command: MediaCommand,
    tracker: ProgressTracker,
    suspender: Arc<dyn ProcessSuspender>,
    settings: ControllerSettings,
    status: JobStatus,
    child: Option<Child>,
    stdout: Option<Split<BufReader<ChildStdout>>>,
    stderr: Option<Split<BufReader<ChildStderr>>>,
    diagnostics: VecDeque<String>,
    /// Destination did not exist (or was to be replaced) when we spawned
    owns_dest: bool,
    /// Paused by stopping the encoder; resuming starts a new one
    restart_on_resume: bool,
}

impl ProcessController {
    /// Controller for a job that was just moved to `Running`
    pub fn new(
        ctx: Arc<RunContext>,
        job: &Job,
        command: MediaCommand,
        suspender: Arc<dyn ProcessSuspender>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            ctx,
            id: job.id,
            seq: job.seq,
            dest: job.dest.clone(),
            command,
            tracker: ProgressTracker::new(job.metric, job.reference),
            suspender,
            settings,
            status: job.status,
            child: None,
            stdout: None,
            stderr: None,
            diagnostics: VecDeque::with_capacity(DIAGNOSTIC_LINES),
            owns_dest: false,
            restart_on_resume: false,
        }
    }

    /// Run the job to completion and return its terminal state
    pub async fn run(mut self, mut control: mpsc::Receiver<ControlMessage>) -> JobStatus {
        if let Err(e) = self.spawn().await {
            self.fail(&e).await;
            return self.status;
        }

        let mut control_open = true;
        loop {
            if !control_open && self.child.is_none() {
                // Stopped for a pause and nobody is left to resume it
                return self.cancel().await;
            }

            tokio::select! {
                line = next_line(&mut self.stdout) => self.on_stdout(line).await,
                line = next_line(&mut self.stderr) => self.on_stderr(line),
                message = control.recv(), if control_open => match message {
                    Some(message) => {
                        if let Some(status) = self.handle(message).await {
                            return status;
                        }
                    }
                    None => control_open = false,
                },
                status = wait_child(&mut self.child) => return self.on_exit(status).await,
            }
        }
    }

    async fn handle(&mut self, message: ControlMessage) -> Option<JobStatus> {
        let ControlMessage { request, reply } = message;
        debug!("Job #{}: {:?} requested while {}", self.seq, request, self.status);

        let result = match request {
            ControlRequest::Pause => self.pause().await,
            ControlRequest::Resume => self.resume().await,
            ControlRequest::Cancel => {
                self.cancel().await;
                Ok(())
            }
        };
        if reply.send(result).is_err() {
            trace!("Job #{}: requester stopped waiting", self.seq);
        }

        self.status.is_terminal().then_some(self.status)
    }

    async fn spawn(&mut self) -> Result<()> {
        if let Some(parent) = self.dest.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        self.owns_dest = self.settings.replace_existing || !self.dest.exists();

        let mut cmd = self.command.to_command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Keep terminal signals (Ctrl-C) away from the encoder; stop goes through us
        #[cfg(unix)]
        cmd.process_group(0);

        debug!("Job #{}: {}", self.seq, self.command);
        let mut child = cmd.spawn().map_err(|e| RetempoError::Spawn {
            program: self.command.binary_path.clone(),
            source: e,
        })?;

        self.stdout = child.stdout.take().map(|out| BufReader::new(out).split(b'\n'));
        self.stderr = child.stderr.take().map(|err| BufReader::new(err).split(b'\n'));
        let pid = child.id();
        self.child = Some(child);
        self.ctx.set_pid(self.id, pid).await;
        info!("Job #{}: encoder started (pid {:?})", self.seq, pid);
        Ok(())
    }

    async fn pause(&mut self) -> Result<()> {
        if self.status != JobStatus::Running {
            return Err(self.invalid(JobStatus::Paused));
        }

        match self.pid().map(|pid| self.suspender.suspend(pid)) {
            Some(Ok(())) => info!("Job #{}: paused", self.seq),
            Some(Err(RetempoError::Unsupported(what))) => {
                warn!(
                    "Job #{}: {} not available, stopping the encoder until resumed",
                    self.seq, what
                );
                self.stop_for_restart().await;
            }
            None => self.stop_for_restart().await,
            Some(Err(e)) => return Err(e),
        }

        self.set_status(JobStatus::Paused).await
    }

    async fn stop_for_restart(&mut self) {
        self.kill_process().await;
        self.discard_output().await;
        self.restart_on_resume = true;
    }

    async fn resume(&mut self) -> Result<()> {
        if self.status != JobStatus::Paused {
            return Err(self.invalid(JobStatus::Running));
        }

        if self.restart_on_resume {
            self.set_status(JobStatus::Running).await?;
            self.restart_on_resume = false;
            if let Err(e) = self.spawn().await {
                self.fail(&e).await;
                return Err(e);
            }
            info!("Job #{}: restarted", self.seq);
            return Ok(());
        }

        let pid = self.pid().ok_or_else(|| self.invalid(JobStatus::Running))?;
        self.suspender.resume(pid)?;
        info!("Job #{}: resumed", self.seq);
        self.set_status(JobStatus::Running).await
    }

    async fn cancel(&mut self) -> JobStatus {
        info!("Job #{}: canceling", self.seq);

        if let Some(pid) = self.pid() {
            // A stopped process cannot act on the termination request
            if self.status == JobStatus::Paused {
                if let Err(e) = self.suspender.resume(pid) {
                    debug!("Job #{}: resume before cancel: {}", self.seq, e);
                }
            }
            self.terminate(pid).await;
        }
        self.kill_process().await;
        self.discard_output().await;

        if let Err(e) = self.set_status(JobStatus::Canceled).await {
            warn!("Job #{}: {}", self.seq, e);
        }
        self.status
    }

    /// Ask the encoder to exit and give it the grace period to do so
    async fn terminate(&mut self, pid: u32) {
        let Some(child) = self.child.as_mut() else {
            return;
        };
        if let Err(e) = self.suspender.terminate(pid) {
            debug!("Job #{}: graceful termination unavailable: {}", self.seq, e);
            return;
        }
        match tokio::time::timeout(self.settings.cancel_grace, child.wait()).await {
            Ok(status) => debug!("Job #{}: encoder exited with {:?}", self.seq, status),
            Err(_) => warn!(
                "Job #{}: encoder ignored termination for {:?}, killing it",
                self.seq, self.settings.cancel_grace
            ),
        }
    }

    async fn kill_process(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                trace!("Job #{}: kill: {}", self.seq, e);
            }
            if let Err(e) = child.wait().await {
                warn!("Job #{}: waiting for killed encoder: {}", self.seq, e);
            }
        }
        self.stdout = None;
        self.stderr = None;
        self.ctx.set_pid(self.id, None).await;
    }

    async fn on_stdout(&mut self, line: Option<String>) {
        let Some(line) = line else {
            self.stdout = None;
            return;
        };
        if self.status != JobStatus::Running {
            return;
        }
        trace!("Job #{} progress: {}", self.seq, line);
        self.observe(&line).await;
    }

    fn on_stderr(&mut self, line: Option<String>) {
        match line {
            Some(line) => self.push_diagnostic(line),
            None => self.stderr = None,
        }
    }

    async fn observe(&mut self, line: &str) {
        if self.tracker.observe_line(line) {
            if let Some(fraction) = self.tracker.fraction() {
                self.ctx.update_progress(self.id, fraction).await;
            }
        }
    }

    fn push_diagnostic(&mut self, line: String) {
        let line = line.trim_end().to_string();
        if line.is_empty() {
            return;
        }
        debug!("Job #{} encoder: {}", self.seq, line);
        if self.diagnostics.len() == DIAGNOSTIC_LINES {
            self.diagnostics.pop_front();
        }
        self.diagnostics.push_back(line);
    }

    async fn on_exit(&mut self, status: io::Result<ExitStatus>) -> JobStatus {
        self.child = None;
        self.drain_output().await;

        // Exited on its own while stopped (killed from outside)
        if self.status == JobStatus::Paused {
            if let Err(e) = self.set_status(JobStatus::Running).await {
                warn!("Job #{}: {}", self.seq, e);
            }
        }

        let error = match status {
            Ok(status) if status.success() => {
                info!("Job #{}: finished", self.seq);
                if let Err(e) = self.set_status(JobStatus::Succeeded).await {
                    warn!("Job #{}: {}", self.seq, e);
                }
                return self.status;
            }
            Ok(status) => RetempoError::Encode {
                code: status.code(),
                diagnostic: self.diagnostic(),
            },
            Err(e) => RetempoError::Io(e),
        };

        self.discard_output().await;
        self.fail(&error).await;
        self.status
    }

    /// Read what the encoder wrote right before exiting
    async fn drain_output(&mut self) {
        let deadline = Instant::now() + DRAIN_TIMEOUT;

        if let Some(mut lines) = self.stdout.take() {
            while let Ok(Ok(Some(raw))) = tokio::time::timeout_at(deadline, lines.next_segment()).await {
                self.observe(&decode_line(&raw)).await;
            }
        }
        if let Some(mut lines) = self.stderr.take() {
            while let Ok(Ok(Some(raw))) = tokio::time::timeout_at(deadline, lines.next_segment()).await {
                self.push_diagnostic(decode_line(&raw));
            }
        }
    }

    fn diagnostic(&self) -> String {
        if self.diagnostics.is_empty() {
            "no diagnostic output".to_string()
        } else {
            self.diagnostics.iter().cloned().collect::<Vec<_>>().join("\n")
        }
    }

    /// Remove what the encoder wrote, but never a file that was there before
    async fn discard_output(&self) {
        if !self.owns_dest {
            return;
        }
        match tokio::fs::remove_file(&self.dest).await {
            Ok(()) => debug!("Job #{}: removed {}", self.seq, self.dest.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Job #{}: could not remove {}: {}",
                self.seq,
                self.dest.display(),
                e
            ),
        }
    }

    async fn fail(&mut self, error: &RetempoError) {
        if let Err(e) = self.ctx.fail(self.id, error).await {
            warn!("Job #{}: {}", self.seq, e);
        }
        self.status = JobStatus::Failed;
    }

    async fn set_status(&mut self, next: JobStatus) -> Result<()> {
        self.ctx.transition(self.id, next).await?;
        self.status = next;
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    fn invalid(&self, to: JobStatus) -> RetempoError {
        RetempoError::InvalidTransition {
            id: self.id,
            from: self.status,
            to,
        }
    }
}

/// Next output line; `None` once the pipe is closed or unreadable
async fn next_line<R>(lines: &mut Option<Split<R>>) -> Option<String>
where
    R: AsyncBufRead + Unpin,
{
    let Some(lines) = lines else {
        return std::future::pending().await;
    };
    match lines.next_segment().await {
        Ok(raw) => raw.map(|raw| decode_line(&raw)),
        Err(e) => {
            debug!("Encoder output unreadable: {}", e);
            None
        }
    }
}

/// Encoders may print file names in any encoding
fn decode_line(raw: &[u8]) -> String {
    let line = String::from_utf8_lossy(raw);
    line.strip_suffix('\r').unwrap_or(&*line).to_string()
}

async fn wait_child(child: &mut Option<Child>) -> io::Result<ExitStatus> {
    match child {
        Some(child) => child.wait().await,
        None => std::future::pending().await,
    }
}
