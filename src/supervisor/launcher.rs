//! Worker process launching

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::exit::{DIAGNOSTIC_TAIL, ExitReport};
use crate::{FrameLockError, Result};

/// How long `wait` gives output readers to drain after the process exits.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// A launched worker.
#[async_trait]
pub trait WorkerProcess: Send + 'static {
    /// OS process id, if known
    fn id(&self) -> Option<u32>;

    /// Wait for the process to exit. Safe to call again after it returned.
    async fn wait(&mut self) -> Result<ExitReport>;

    /// Ask the process to exit, forcing it after `grace`.
    async fn terminate(&mut self, grace: Duration) -> Result<()>;
}

/// Starts worker processes for a supervisor.
#[async_trait]
pub trait Launcher: Send + Sync + 'static {
    async fn launch(&self, binary: &Path, args: &[String]) -> Result<Box<dyn WorkerProcess>>;
}

/// Launches real OS processes with tokio, capturing their output.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, binary: &Path, args: &[String]) -> Result<Box<dyn WorkerProcess>> {
        let mut child = Command::new(binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FrameLockError::launch_failed(binary, e))?;

        let diagnostics = Arc::new(Mutex::new(VecDeque::with_capacity(DIAGNOSTIC_TAIL)));
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(capture_lines(stdout, Arc::clone(&diagnostics)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(capture_lines(stderr, Arc::clone(&diagnostics)));
        }

        debug!(binary = %binary.display(), pid = ?child.id(), "Worker process spawned");
        let pid = child.id();
        Ok(Box::new(OsProcess { child, pid, diagnostics, readers, report: None }))
    }
}

type Diagnostics = Arc<Mutex<VecDeque<String>>>;

fn capture_lines<R>(stream: R, diagnostics: Diagnostics) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            trace!(target: "framelock::worker_output", "{}", line);
            let mut tail = diagnostics.lock().unwrap_or_else(PoisonError::into_inner);
            if tail.len() == DIAGNOSTIC_TAIL {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    })
}

struct OsProcess {
    child: Child,
    pid: Option<u32>,
    diagnostics: Diagnostics,
    readers: Vec<JoinHandle<()>>,
    report: Option<ExitReport>,
}

#[async_trait]
impl WorkerProcess for OsProcess {
    fn id(&self) -> Option<u32> {
        self.pid
    }

    async fn wait(&mut self) -> Result<ExitReport> {
        if let Some(report) = &self.report {
            return Ok(report.clone());
        }

        let status = self.child.wait().await.map_err(|e| FrameLockError::io("waiting for worker", e))?;
        for reader in self.readers.drain(..) {
            // A grandchild holding the pipes open must not block exit handling
            if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader).await.is_err() {
                debug!(pid = ?self.pid, "Worker output still open after exit");
            }
        }

        let diagnostics =
            self.diagnostics.lock().unwrap_or_else(PoisonError::into_inner).iter().cloned().collect();
        let report = ExitReport::from_status(status, diagnostics);
        self.report = Some(report.clone());
        Ok(report)
    }

    async fn terminate(&mut self, grace: Duration) -> Result<()> {
        if self.report.is_some() || matches!(self.child.try_wait(), Ok(Some(_))) {
            return Ok(());
        }

        if request_exit(self.pid) {
            match tokio::time::timeout(grace, self.child.wait()).await {
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(e)) => return Err(FrameLockError::io("waiting for worker", e)),
                Err(_) => warn!(pid = ?self.pid, "Worker ignored SIGTERM, killing"),
            }
        }

        self.child.kill().await.map_err(|e| FrameLockError::io("killing worker", e))
    }
}

/// Send SIGTERM; returns false when the signal could not be delivered.
#[cfg(unix)]
fn request_exit(pid: Option<u32>) -> bool {
    let Some(pid) = pid.and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return false;
    };
    // SAFETY: kill only sends a signal to the given pid
    unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn request_exit(_pid: Option<u32>) -> bool {
    false
}
