use sysinfo::{Pid, Signal, System};
use tracing::debug;

use crate::error::{Result, RetempoError};

/// OS-level control over a running encoder process.
///
/// `suspend` freezes the process without terminating it, `resume` thaws it.
/// Implementations return [`RetempoError::Unsupported`] when the platform has
/// no such facility; the controller then falls back to terminate-and-restart.
pub trait ProcessSuspender: Send + Sync {
    fn suspend(&self, pid: u32) -> Result<()>;

    fn resume(&self, pid: u32) -> Result<()>;

    /// Ask the process to exit on its own
    fn terminate(&self, _pid: u32) -> Result<()> {
        Err(RetempoError::Unsupported("graceful termination".to_string()))
    }
}

/// Signal based control (SIGSTOP / SIGCONT / SIGTERM where available)
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalSuspender;

impl SignalSuspender {
    pub fn new() -> Self {
        Self
    }

    fn send(&self, pid: u32, signal: Signal) -> Result<()> {
        let pid = Pid::from_u32(pid);
        let mut system = System::new();
        if !system.refresh_process(pid) {
            return Err(RetempoError::Suspend(format!("process {} not found", pid)));
        }
        let process = system
            .process(pid)
            .ok_or_else(|| RetempoError::Suspend(format!("process {} not found", pid)))?;

        debug!("Sending {:?} to process {}", signal, pid);
        match process.kill_with(signal) {
            Some(true) => Ok(()),
            Some(false) => Err(RetempoError::Suspend(format!(
                "{:?} was not delivered to process {}",
                signal, pid
            ))),
            None => Err(RetempoError::Unsupported(format!("{:?} signal", signal))),
        }
    }
}

impl ProcessSuspender for SignalSuspender {
    fn suspend(&self, pid: u32) -> Result<()> {
        self.send(pid, Signal::Stop)
    }

    fn resume(&self, pid: u32) -> Result<()> {
        self.send(pid, Signal::Continue)
    }

    fn terminate(&self, pid: u32) -> Result<()> {
        self.send(pid, Signal::Term)
    }
}

/// For platforms without process suspension: every request is unsupported
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSuspend;

impl ProcessSuspender for NoSuspend {
    fn suspend(&self, _pid: u32) -> Result<()> {
        Err(RetempoError::Unsupported("process suspension".to_string()))
    }

    fn resume(&self, _pid: u32) -> Result<()> {
        Err(RetempoError::Unsupported("process suspension".to_string()))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use super::*;

    fn state_of(pid: u32) -> Option<String> {
        let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
        let after_name = stat.rsplit_once(')')?.1;
        after_name.split_whitespace().next().map(str::to_string)
    }

    #[tokio::test]
    async fn test_stop_and_continue_a_child() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        let suspender = SignalSuspender::new();

        suspender.suspend(pid).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Some(state) = state_of(pid) {
            assert_eq!(state, "T");
        }

        suspender.resume(pid).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Some(state) = state_of(pid) {
            assert_ne!(state, "T");
        }

        suspender.terminate(pid).unwrap();
        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());
    }

    #[test]
    fn test_no_suspend_is_unsupported() {
        assert!(matches!(NoSuspend.suspend(1), Err(RetempoError::Unsupported(_))));
        assert!(matches!(NoSuspend.resume(1), Err(RetempoError::Unsupported(_))));
        assert!(matches!(NoSuspend.terminate(1), Err(RetempoError::Unsupported(_))));
    }
}
