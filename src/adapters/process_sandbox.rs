//! Child-process sandbox.
//!
//! Every execution spawns a fresh worker (`<program> sandbox` by default),
//! sends it a [`SandboxJob`] as JSON on stdin and reads a raw execution log
//! back from stdout. The parent enforces the wall-clock timeout; the memory
//! ceiling, CPU backstop and network isolation are passed through the
//! environment and applied by the worker to itself. A worker that cannot
//! apply one of them exits without running the job, which is reported as a
//! resource-limit failure.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::domain::compiler::CompiledArtifact;
use crate::domain::error::{ExecutionCategory, ExecutionError};
use crate::domain::execution::ExecutionConfig;
use crate::domain::execution_result::RawExecutionLog;
use crate::domain::ohlcv::MarketSeries;
use crate::ports::sandbox_port::{Sandbox, SandboxLimits};
use crate::worker::{
    ENV_CPU_SECONDS, ENV_ISOLATE_NETWORK, ENV_MAX_MEMORY_MB, EXIT_CONFINEMENT_FAILED, SandboxJob,
    WorkerFailure,
};

const MAX_DIAGNOSTIC_CHARS: usize = 4000;

// SIGSEGV, SIGKILL, SIGXCPU
const RESOURCE_SIGNALS: [i32; 3] = [11, 9, 24];

pub struct ProcessSandbox {
    program: PathBuf,
    args: Vec<String>,
    execution: ExecutionConfig,
}

impl ProcessSandbox {
    /// Run `program sandbox` for each job.
    pub fn new(program: impl Into<PathBuf>, execution: ExecutionConfig) -> Self {
        Self {
            program: program.into(),
            args: vec!["sandbox".to_string()],
            execution,
        }
    }

    /// Replace the worker arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    async fn run_child(
        &self,
        payload: Vec<u8>,
        limits: &SandboxLimits,
    ) -> Result<std::process::Output, ExecutionError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env_clear()
            .env(ENV_MAX_MEMORY_MB, limits.max_memory_mb.to_string())
            .env(ENV_CPU_SECONDS, limits.cpu_seconds.to_string())
            .env(ENV_ISOLATE_NETWORK, if limits.isolate_network { "1" } else { "0" })
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ExecutionError::new(
                    ExecutionCategory::RuntimeError,
                    format!("failed to spawn sandbox worker {}: {e}", self.program.display()),
                )
            })?;

        let stdin = child.stdin.take();
        let write = async move {
            if let Some(mut stdin) = stdin {
                // A worker that exits early closes the pipe; its exit status
                // tells the story.
                let _ = stdin.write_all(&payload).await;
                let _ = stdin.shutdown().await;
            }
        };
        let (_, output) = tokio::join!(write, child.wait_with_output());
        output.map_err(|e| {
            ExecutionError::new(
                ExecutionCategory::RuntimeError,
                format!("failed to collect sandbox worker output: {e}"),
            )
        })
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    async fn execute(
        &self,
        artifact: &CompiledArtifact,
        series: &MarketSeries,
        initial_capital: f64,
        limits: &SandboxLimits,
    ) -> Result<RawExecutionLog, ExecutionError> {
        let job = SandboxJob {
            code: artifact.code.clone(),
            series: series.clone(),
            initial_capital,
            execution: self.execution.clone(),
        };
        let payload = serde_json::to_vec(&job).map_err(|e| {
            ExecutionError::new(
                ExecutionCategory::RuntimeError,
                format!("failed to encode sandbox job: {e}"),
            )
        })?;

        tracing::debug!(
            artifact = artifact.hash.short(),
            bars = series.len(),
            timeout_secs = limits.timeout.as_secs(),
            "spawning sandbox worker"
        );

        // Dropping the child future on timeout kills the worker.
        let output = match tokio::time::timeout(limits.timeout, self.run_child(payload, limits)).await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(ExecutionError::new(
                    ExecutionCategory::Timeout,
                    format!(
                        "execution exceeded the {}s wall-clock limit",
                        limits.timeout.as_secs()
                    ),
                ));
            }
        };

        classify_output(
            output.status.code(),
            termination_signal(&output.status),
            &output.stdout,
            &output.stderr,
        )
    }
}

#[cfg(unix)]
fn termination_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn termination_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

/// Turn a finished worker into a log or a categorized error.
pub fn classify_output(
    code: Option<i32>,
    signal: Option<i32>,
    stdout: &[u8],
    stderr: &[u8],
) -> Result<RawExecutionLog, ExecutionError> {
    let diagnostic = tail(&String::from_utf8_lossy(stderr), MAX_DIAGNOSTIC_CHARS);

    if code == Some(0) {
        return serde_json::from_slice::<RawExecutionLog>(stdout).map_err(|e| {
            ExecutionError::new(
                ExecutionCategory::InvalidOutput,
                format!("worker output is not an execution log: {e}"),
            )
            .with_diagnostic(tail(&String::from_utf8_lossy(stdout), MAX_DIAGNOSTIC_CHARS))
        });
    }

    if code == Some(i32::from(EXIT_CONFINEMENT_FAILED)) {
        let reason = serde_json::from_slice::<WorkerFailure>(stdout)
            .map(|f| f.message)
            .unwrap_or_else(|_| "requested limits could not be applied".to_string());
        return Err(ExecutionError::new(
            ExecutionCategory::ResourceLimit,
            format!("sandbox confinement failed: {reason}"),
        )
        .with_diagnostic(diagnostic));
    }

    let out_of_memory = diagnostic.contains("memory allocation of");
    if out_of_memory
        || code == Some(137)
        || signal.is_some_and(|s| RESOURCE_SIGNALS.contains(&s))
    {
        let message = match (signal, code) {
            _ if out_of_memory => "worker exceeded its memory ceiling".to_string(),
            (Some(24), _) => "worker exceeded its CPU time limit".to_string(),
            (Some(s), _) => format!("worker killed by signal {s}"),
            (None, Some(c)) => format!("worker killed (exit code {c})"),
            (None, None) => "worker killed".to_string(),
        };
        return Err(
            ExecutionError::new(ExecutionCategory::ResourceLimit, message).with_diagnostic(diagnostic)
        );
    }

    if let Ok(failure) = serde_json::from_slice::<WorkerFailure>(stdout) {
        let mut err = ExecutionError::new(ExecutionCategory::RuntimeError, failure.message)
            .with_diagnostic(diagnostic);
        if let Some(fragment) = failure.fragment {
            err = err.with_fragment(fragment);
        }
        return Err(err);
    }

    let message = diagnostic
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .map(|l| l.trim().to_string())
        .unwrap_or_else(|| match (code, signal) {
            (Some(c), _) => format!("worker exited with code {c}"),
            (None, Some(s)) => format!("worker terminated by signal {s}"),
            (None, None) => "worker terminated abnormally".to_string(),
        });
    Err(ExecutionError::new(ExecutionCategory::RuntimeError, message).with_diagnostic(diagnostic))
}

/// Last `max_chars` characters of `text`.
fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}
