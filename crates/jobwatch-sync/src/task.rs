//! Bounded execution of one source call: spawn, await with a deadline, and
//! force termination when the deadline passes.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobwatch_adapters::{adapter_for_source, response_from_result, HttpClientConfig, SourceAdapter};
use jobwatch_core::{RawPostingRow, SourceKind, SourceSpec, WorkerRequest, WorkerResponse, THROTTLED_EXIT_CODE};
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("could not start worker: {0}")]
    Spawn(String),
    #[error("worker crashed: {0}")]
    Crashed(String),
    #[error("worker produced unreadable output: {0}")]
    Protocol(String),
}

/// A running source call.
#[async_trait]
pub trait WorkerHandle: Send {
    /// Waits for the call to finish. Must be cancel-safe: it may be dropped
    /// at the deadline and followed by [`WorkerHandle::terminate`].
    async fn join(&mut self) -> Result<WorkerResponse, TaskError>;

    /// Forcefully stops the call and reclaims its resources.
    async fn terminate(&mut self);
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, request: &WorkerRequest) -> Result<Box<dyn WorkerHandle>, TaskError>;
}

/// Launches `request` and waits at most `deadline` for it. A call that is
/// still running at the deadline is terminated and reported as
/// [`TaskError::TimedOut`].
pub async fn run_bounded(
    launcher: &dyn WorkerLauncher,
    request: &WorkerRequest,
    deadline: Duration,
) -> Result<WorkerResponse, TaskError> {
    let mut handle = launcher.launch(request).await?;
    let joined = tokio::time::timeout(deadline, handle.join()).await;
    match joined {
        Ok(result) => result,
        Err(_) => {
            warn!(source = %request.source.name, ?deadline, "terminating worker at deadline");
            handle.terminate().await;
            Err(TaskError::TimedOut(deadline))
        }
    }
}

// ---------------------------------------------------------------------------
// Child processes
// ---------------------------------------------------------------------------

/// Runs every source call in its own child process.
///
/// Built-in sources run `program args..` (normally the CLI's own `worker`
/// subcommand); command sources run their configured command. The request is
/// written to the child's stdin as JSON and the response read from stdout.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// The current executable with the given subcommand arguments.
    pub fn current_exe(args: Vec<String>) -> anyhow::Result<Self> {
        let program = std::env::current_exe()?;
        Ok(Self::new(program, args))
    }

    fn command_for(&self, source: &SourceSpec) -> Result<Command, TaskError> {
        let mut command = match source.kind {
            SourceKind::Command => {
                let (program, args) = source
                    .command
                    .split_first()
                    .ok_or_else(|| TaskError::Spawn(format!("source `{}` has an empty command", source.name)))?;
                let mut command = Command::new(program);
                command.args(args);
                command
            }
            SourceKind::LinkedinPublic | SourceKind::Fixture => {
                let mut command = Command::new(&self.program);
                command.args(&self.args);
                command
            }
        };
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        // Each worker leads its own process group so a timeout can take down
        // everything it started, not just the direct child.
        #[cfg(unix)]
        command.process_group(0);
        Ok(command)
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, request: &WorkerRequest) -> Result<Box<dyn WorkerHandle>, TaskError> {
        let payload =
            serde_json::to_vec(request).map_err(|e| TaskError::Spawn(format!("encoding request: {e}")))?;
        let mut child = self
            .command_for(&request.source)?
            .spawn()
            .map_err(|e| TaskError::Spawn(e.to_string()))?;

        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                if let Err(err) = stdin.write_all(&payload).await {
                    debug!(error = %err, "worker closed stdin early");
                }
            });
        }
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TaskError::Spawn("child stdout not captured".to_string()))?;
        let reader = tokio::spawn(async move {
            let mut stdout = stdout;
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).await.map(|_| buf)
        });

        debug!(source = %request.source.name, pid = ?child.id(), "worker started");
        Ok(Box::new(ProcessHandle { child, reader }))
    }
}

struct ProcessHandle {
    child: Child,
    reader: JoinHandle<std::io::Result<Vec<u8>>>,
}

#[async_trait]
impl WorkerHandle for ProcessHandle {
    async fn join(&mut self) -> Result<WorkerResponse, TaskError> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| TaskError::Crashed(e.to_string()))?;
        let stdout = (&mut self.reader)
            .await
            .map_err(|e| TaskError::Crashed(e.to_string()))?
            .map_err(|e| TaskError::Crashed(format!("reading stdout: {e}")))?;
        decode_worker_output(status.code(), &stdout)
    }

    async fn terminate(&mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            kill_process_group(pid);
        }
        if let Err(err) = self.child.kill().await {
            warn!(error = %err, "failed to kill worker");
        }
        self.reader.abort();
    }
}

/// SIGKILL to every process in the group led by `pid`.
#[cfg(unix)]
fn kill_process_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: killpg only sends a signal; an already-empty group yields ESRCH.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        debug!(pgid, error = %std::io::Error::last_os_error(), "killpg failed");
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WorkerOutput {
    Response(WorkerResponse),
    Rows(Vec<RawPostingRow>),
}

/// Interprets a finished worker's exit code and stdout. Exit code 75 means
/// throttled even when stdout is empty; a non-zero exit without a readable
/// response is a crash.
pub fn decode_worker_output(exit_code: Option<i32>, stdout: &[u8]) -> Result<WorkerResponse, TaskError> {
    let text = String::from_utf8_lossy(stdout);
    let parsed = if text.trim().is_empty() {
        None
    } else {
        Some(serde_json::from_str::<WorkerOutput>(text.trim()))
    };

    match (exit_code, parsed) {
        (_, Some(Ok(WorkerOutput::Response(response)))) => Ok(response),
        (Some(0), Some(Ok(WorkerOutput::Rows(rows)))) => Ok(WorkerResponse::Rows { rows }),
        (Some(THROTTLED_EXIT_CODE), _) => Ok(WorkerResponse::Throttled {
            retry_after_secs: None,
            message: "worker exited with throttled status".to_string(),
        }),
        (Some(0), None) => Err(TaskError::Protocol("empty stdout".to_string())),
        (Some(0), Some(Err(err))) => Err(TaskError::Protocol(err.to_string())),
        (Some(code), _) => Err(TaskError::Crashed(format!("exit code {code}"))),
        (None, _) => Err(TaskError::Crashed("terminated by signal".to_string())),
    }
}

// ---------------------------------------------------------------------------
// In-process tasks
// ---------------------------------------------------------------------------

/// Resolves a configured source to an in-process adapter.
pub trait AdapterFactory: Send + Sync {
    fn adapter_for(&self, source: &SourceSpec) -> Result<Arc<dyn SourceAdapter>, String>;
}

/// The adapters built into `jobwatch-adapters`.
#[derive(Debug, Clone, Default)]
pub struct BuiltinAdapters {
    pub http: HttpClientConfig,
}

impl AdapterFactory for BuiltinAdapters {
    fn adapter_for(&self, source: &SourceSpec) -> Result<Arc<dyn SourceAdapter>, String> {
        adapter_for_source(source, &self.http)
            .map(Arc::from)
            .map_err(|e| e.to_string())
    }
}

/// Runs source calls as tokio tasks that are aborted on timeout.
///
/// Abort only lands at the adapter's next await point, so this is meant for
/// adapters that yield, and for tests.
#[derive(Clone)]
pub struct InProcessLauncher {
    factory: Arc<dyn AdapterFactory>,
}

impl InProcessLauncher {
    pub fn new(factory: Arc<dyn AdapterFactory>) -> Self {
        Self { factory }
    }
}

#[async_trait]
impl WorkerLauncher for InProcessLauncher {
    async fn launch(&self, request: &WorkerRequest) -> Result<Box<dyn WorkerHandle>, TaskError> {
        let adapter = self.factory.adapter_for(&request.source).map_err(TaskError::Spawn)?;
        let request = request.clone();
        let task = tokio::spawn(async move { response_from_result(adapter.search(&request).await) });
        Ok(Box::new(TaskHandle { task }))
    }
}

struct TaskHandle {
    task: JoinHandle<WorkerResponse>,
}

#[async_trait]
impl WorkerHandle for TaskHandle {
    async fn join(&mut self) -> Result<WorkerResponse, TaskError> {
        (&mut self.task)
            .await
            .map_err(|e| TaskError::Crashed(e.to_string()))
    }

    async fn terminate(&mut self) {
        self.task.abort();
    }
}
