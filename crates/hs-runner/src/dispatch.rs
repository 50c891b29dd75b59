//! Child-process dispatch for sweep runs.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hs_types::{DispatchResult, RunError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::command::RenderedCommand;

/// Only the most recent lines of a run's output are retained.
pub const MAX_CAPTURED_LINES: usize = 100_000;

/// Where a captured line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
    /// The per-run metrics file named by `HS_METRICS_FILE`.
    MetricsFile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

/// Output of one run in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    lines: VecDeque<OutputLine>,
    dropped: usize,
}

impl CapturedOutput {
    pub fn push(&mut self, line: OutputLine) {
        if self.lines.len() == MAX_CAPTURED_LINES {
            self.lines.pop_front();
            self.dropped += 1;
        }
        self.lines.push_back(line);
    }

    pub fn lines(&self) -> impl Iterator<Item = &OutputLine> {
        self.lines.iter()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Lines discarded from the front once the cap was reached.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Last `n` lines of a stream, oldest first.
    pub fn tail(&self, stream: OutputStream, n: usize) -> Vec<&str> {
        let mut tail: Vec<&str> = self
            .lines
            .iter()
            .rev()
            .filter(|l| l.stream == stream)
            .take(n)
            .map(|l| l.text.as_str())
            .collect();
        tail.reverse();
        tail
    }
}

/// Everything needed to start one run.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub run_id: Uuid,
    pub command: RenderedCommand,
    /// Overrides applied on top of the inherited environment.
    pub environment: Vec<(String, String)>,
    /// Sweep context injected when the template asks for `${env}`.
    pub context: Vec<(String, String)>,
    /// Per-run directory for the output log and metrics file.
    pub run_dir: Option<PathBuf>,
}

/// How a run terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunCompletion {
    pub exit_code: Option<i32>,
    pub success: bool,
    pub output: CapturedOutput,
}

impl RunCompletion {
    /// `Failed` unless the run exited cleanly.
    pub fn check(&self) -> DispatchResult<()> {
        if self.success {
            Ok(())
        } else {
            Err(RunError::Failed {
                exit_code: self.exit_code,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Stop signalling
// ---------------------------------------------------------------------------

/// Owner side of the sweep-wide stop signal.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn signal(&self) -> StopSignal {
        StopSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for StopHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of the stop signal.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once stop is requested. Pends forever if the handle is gone.
    pub async fn stopped(&mut self) {
        if self.rx.wait_for(|stopped| *stopped).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher seam
// ---------------------------------------------------------------------------

/// Launches runs. Implementations may spawn local processes, submit to a
/// cluster, or (in tests) replay scripted outcomes.
#[async_trait]
pub trait RunDispatcher: Send + Sync {
    async fn launch(&self, request: LaunchRequest) -> DispatchResult<Box<dyn RunHandle>>;
}

/// A launched run.
#[async_trait]
pub trait RunHandle: Send {
    fn run_id(&self) -> Uuid;

    /// Block until the run exits. If `stop` fires first the run is terminated
    /// and `Cancelled` is returned.
    async fn wait(&mut self, stop: StopSignal) -> DispatchResult<RunCompletion>;
}

#[async_trait]
impl<D: RunDispatcher + ?Sized> RunDispatcher for Arc<D> {
    async fn launch(&self, request: LaunchRequest) -> DispatchResult<Box<dyn RunHandle>> {
        (**self).launch(request).await
    }
}

// ---- Local processes ----

/// Runs each trial as a local child process.
#[derive(Debug, Clone)]
pub struct ProcessDispatcher {
    /// Time between SIGTERM and a forced kill on cancellation.
    grace: Duration,
}

impl ProcessDispatcher {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }
}

impl Default for ProcessDispatcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl RunDispatcher for ProcessDispatcher {
    async fn launch(&self, request: LaunchRequest) -> DispatchResult<Box<dyn RunHandle>> {
        let program = request.command.program.clone();
        let mut cmd = Command::new(&program);
        cmd.args(&request.command.args)
            .envs(request.environment.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut log_file = None;
        let mut metrics_path = None;
        if let Some(dir) = &request.run_dir {
            tokio::fs::create_dir_all(dir).await?;
            log_file = Some(tokio::fs::File::create(dir.join("output.log")).await?);
            metrics_path = Some(dir.join("metrics.jsonl"));
        }

        if request.command.inject_env {
            cmd.envs(request.context.iter().map(|(k, v)| (k, v)));
            if let Some(path) = &metrics_path {
                cmd.env("HS_METRICS_FILE", path);
            }
        }

        let mut child = cmd.spawn().map_err(|e| RunError::Launch {
            program: program.clone(),
            message: e.to_string(),
        })?;

        info!(
            run_id = %request.run_id,
            pid = child.id(),
            command = %request.command,
            "launched run"
        );

        let captured = Arc::new(Mutex::new(CapturedOutput::default()));
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, OutputStream::Stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, OutputStream::Stderr, tx);
        }
        let collector = spawn_collector(request.run_id, rx, captured.clone(), log_file);

        Ok(Box::new(ProcessHandle {
            run_id: request.run_id,
            child,
            captured,
            collector: Some(collector),
            metrics_path,
            grace: self.grace,
        }))
    }
}

fn spawn_reader<R>(reader: R, stream: OutputStream, tx: mpsc::UnboundedSender<OutputLine>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\r', '\n'])
                        .to_string();
                    if tx.send(OutputLine { stream, text }).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

fn spawn_collector(
    run_id: Uuid,
    mut rx: mpsc::UnboundedReceiver<OutputLine>,
    captured: Arc<Mutex<CapturedOutput>>,
    mut log_file: Option<tokio::fs::File>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            debug!(run_id = %run_id, stream = ?line.stream, "{}", line.text);
            if let Some(file) = log_file.as_mut() {
                let written = file.write_all(line.text.as_bytes()).await;
                if written.and(file.write_all(b"\n").await).is_err() {
                    warn!(run_id = %run_id, "output log write failed, disabling log");
                    log_file = None;
                }
            }
            captured.lock().push(line);
        }
        if let Some(mut file) = log_file {
            let _ = file.flush().await;
        }
    })
}

#[cfg(unix)]
async fn send_sigterm(child: &Child) -> bool {
    let Some(pid) = child.id() else {
        return false;
    };
    Command::new("kill")
        .arg("-TERM")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .is_ok_and(|status| status.success())
}

#[cfg(not(unix))]
async fn send_sigterm(_child: &Child) -> bool {
    false
}

/// Handle to a local child process.
pub struct ProcessHandle {
    run_id: Uuid,
    child: Child,
    captured: Arc<Mutex<CapturedOutput>>,
    collector: Option<JoinHandle<()>>,
    metrics_path: Option<PathBuf>,
    grace: Duration,
}

impl ProcessHandle {
    /// SIGTERM, then SIGKILL once the grace period lapses.
    async fn terminate(&mut self) {
        if send_sigterm(&self.child).await {
            if tokio::time::timeout(self.grace, self.child.wait()).await.is_ok() {
                return;
            }
            warn!(
                run_id = %self.run_id,
                grace_secs = self.grace.as_secs_f64(),
                "run ignored SIGTERM, killing"
            );
        }
        if let Err(e) = self.child.kill().await {
            warn!(run_id = %self.run_id, error = %e, "failed to kill run");
        }
    }

    async fn drain_output(&mut self) -> CapturedOutput {
        if let Some(collector) = self.collector.take() {
            // Grandchildren can keep the pipes open after the child exits.
            if tokio::time::timeout(self.grace, collector).await.is_err() {
                warn!(run_id = %self.run_id, "output still open after exit, truncating");
            }
        }

        let mut output = std::mem::take(&mut *self.captured.lock());
        if let Some(path) = &self.metrics_path {
            if let Ok(contents) = tokio::fs::read_to_string(path).await {
                for text in contents.lines() {
                    output.push(OutputLine {
                        stream: OutputStream::MetricsFile,
                        text: text.to_string(),
                    });
                }
            }
        }
        output
    }
}

#[async_trait]
impl RunHandle for ProcessHandle {
    fn run_id(&self) -> Uuid {
        self.run_id
    }

    async fn wait(&mut self, mut stop: StopSignal) -> DispatchResult<RunCompletion> {
        let exited: Option<std::io::Result<ExitStatus>> = {
            let wait = self.child.wait();
            tokio::select! {
                status = wait => Some(status),
                _ = stop.stopped() => None,
            }
        };

        let status = match exited {
            Some(status) => status?,
            None => {
                info!(run_id = %self.run_id, "stop requested, terminating run");
                self.terminate().await;
                return Err(RunError::Cancelled {
                    run_id: self.run_id.to_string(),
                });
            }
        };

        let output = self.drain_output().await;
        debug!(
            run_id = %self.run_id,
            exit_code = status.code(),
            lines = output.len(),
            "run exited"
        );

        Ok(RunCompletion {
            exit_code: status.code(),
            success: status.success(),
            output,
        })
    }
}

// ---- Retry wrapper ----

/// Opt-in wrapper retrying launch failures a bounded number of times.
/// Runs that start and then fail are never retried.
#[derive(Debug, Clone)]
pub struct RetryingDispatcher<D> {
    inner: D,
    max_attempts: u32,
    backoff: Duration,
}

impl<D: RunDispatcher> RetryingDispatcher<D> {
    pub fn new(inner: D, max_attempts: u32, backoff: Duration) -> Self {
        Self {
            inner,
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }
}

#[async_trait]
impl<D: RunDispatcher> RunDispatcher for RetryingDispatcher<D> {
    async fn launch(&self, request: LaunchRequest) -> DispatchResult<Box<dyn RunHandle>> {
        let mut attempt = 1;
        loop {
            match self.inner.launch(request.clone()).await {
                Err(RunError::Launch { program, message }) if attempt < self.max_attempts => {
                    warn!(
                        run_id = %request.run_id,
                        attempt,
                        program = %program,
                        error = %message,
                        "launch failed, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(self.backoff).await;
                }
                other => return other,
            }
        }
    }
}
