//! Sandbox worker: the child-process side of [`ProcessSandbox`].
//!
//! Reads one [`SandboxJob`] from stdin, confines itself according to the
//! limits in its environment, runs the engine and writes the raw execution
//! log to stdout. On failure it writes a [`WorkerFailure`] and exits with
//! [`EXIT_RUNTIME_FAILURE`] (or [`EXIT_BAD_JOB`] for unreadable input).
//!
//! A requested limit that cannot be applied stops the worker before it reads
//! the job, with [`EXIT_CONFINEMENT_FAILED`]. Running without network
//! isolation takes `isolate_network = false` in the settings.
//!
//! [`ProcessSandbox`]: crate::adapters::process_sandbox::ProcessSandbox

use std::io::{self, Read, Write};
use std::process::ExitCode;

use serde::{Deserialize, Serialize};

use crate::domain::engine;
use crate::domain::execution::ExecutionConfig;
use crate::domain::execution_result::RawExecutionLog;
use crate::domain::ohlcv::MarketSeries;
use crate::domain::program::StrategyProgram;

pub const ENV_MAX_MEMORY_MB: &str = "STRATFORGE_SANDBOX_MAX_MEMORY_MB";
pub const ENV_CPU_SECONDS: &str = "STRATFORGE_SANDBOX_CPU_SECONDS";
pub const ENV_ISOLATE_NETWORK: &str = "STRATFORGE_SANDBOX_ISOLATE_NETWORK";

pub const EXIT_RUNTIME_FAILURE: u8 = 3;
pub const EXIT_BAD_JOB: u8 = 4;
pub const EXIT_CONFINEMENT_FAILED: u8 = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxJob {
    pub code: String,
    pub series: MarketSeries,
    pub initial_capital: f64,
    pub execution: ExecutionConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerFailure {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragment: Option<String>,
}

/// Load the program and run it. No I/O.
pub fn run_job(job: &SandboxJob) -> Result<RawExecutionLog, WorkerFailure> {
    let program = StrategyProgram::parse(&job.code).map_err(|e| WorkerFailure {
        message: e.to_string(),
        fragment: e.fragment(),
    })?;
    engine::run(&program, &job.series, job.initial_capital, &job.execution).map_err(|e| {
        WorkerFailure {
            message: e.to_string(),
            fragment: e.fragment(),
        }
    })
}

/// Entry point of the hidden `sandbox` subcommand.
pub fn run_stdio() -> ExitCode {
    let requested = RequestedLimits::from_lookup(|name| std::env::var(name).ok());
    if let Err(message) = confine(&requested, limits::apply) {
        return fail(EXIT_CONFINEMENT_FAILED, message, None);
    }

    let mut input = String::new();
    if let Err(e) = std::io::stdin().read_to_string(&mut input) {
        return fail(EXIT_BAD_JOB, format!("failed to read job from stdin: {e}"), None);
    }
    let job: SandboxJob = match serde_json::from_str(&input) {
        Ok(job) => job,
        Err(e) => return fail(EXIT_BAD_JOB, format!("invalid sandbox job: {e}"), None),
    };

    match run_job(&job) {
        Ok(log) => match serde_json::to_string(&log) {
            Ok(json) => {
                let mut stdout = std::io::stdout().lock();
                if writeln!(stdout, "{json}").and_then(|_| stdout.flush()).is_err() {
                    return ExitCode::from(EXIT_RUNTIME_FAILURE);
                }
                ExitCode::SUCCESS
            }
            Err(e) => fail(
                EXIT_RUNTIME_FAILURE,
                format!("failed to encode execution log: {e}"),
                None,
            ),
        },
        Err(failure) => fail(EXIT_RUNTIME_FAILURE, failure.message, failure.fragment),
    }
}

fn fail(code: u8, message: String, fragment: Option<String>) -> ExitCode {
    eprintln!("sandbox: {message}");
    let failure = WorkerFailure { message, fragment };
    if let Ok(json) = serde_json::to_string(&failure) {
        println!("{json}");
    }
    ExitCode::from(code)
}

/// Limits the parent asked for, as read from the worker's environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestedLimits {
    pub max_memory_mb: Option<u64>,
    pub cpu_seconds: Option<u64>,
    pub isolate_network: bool,
}

impl RequestedLimits {
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let positive = |name: &str| {
            lookup(name)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|v| *v > 0)
        };
        Self {
            max_memory_mb: positive(ENV_MAX_MEMORY_MB),
            cpu_seconds: positive(ENV_CPU_SECONDS),
            isolate_network: lookup(ENV_ISOLATE_NETWORK).is_some_and(|v| v.trim() == "1"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    MemoryBytes(u64),
    CpuSeconds(u64),
    Network,
}

impl Limit {
    fn describe(&self) -> String {
        match self {
            Limit::MemoryBytes(bytes) => format!("memory ceiling of {} MB", bytes / (1024 * 1024)),
            Limit::CpuSeconds(secs) => format!("cpu limit of {secs}s"),
            Limit::Network => "network isolation".to_string(),
        }
    }
}

/// Apply every requested limit with `apply`, stopping at the first one that
/// fails.
pub fn confine(
    requested: &RequestedLimits,
    mut apply: impl FnMut(Limit) -> io::Result<()>,
) -> Result<(), String> {
    let wanted = [
        requested
            .max_memory_mb
            .map(|mb| Limit::MemoryBytes(mb.saturating_mul(1024 * 1024))),
        requested.cpu_seconds.map(Limit::CpuSeconds),
        requested.isolate_network.then_some(Limit::Network),
    ];
    for limit in wanted.into_iter().flatten() {
        apply(limit).map_err(|e| format!("could not apply {}: {e}", limit.describe()))?;
    }
    Ok(())
}

#[cfg(unix)]
mod limits {
    use std::io;

    fn set(resource: libc::c_int, value: u64) -> io::Result<()> {
        let limit = libc::rlimit {
            rlim_cur: value as libc::rlim_t,
            rlim_max: value as libc::rlim_t,
        };
        // SAFETY: setrlimit only reads the struct we pass by reference.
        let rc = unsafe { libc::setrlimit(resource as _, &limit) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    pub fn apply(limit: super::Limit) -> io::Result<()> {
        match limit {
            super::Limit::MemoryBytes(bytes) => set(libc::RLIMIT_AS as libc::c_int, bytes),
            super::Limit::CpuSeconds(seconds) => set(libc::RLIMIT_CPU as libc::c_int, seconds),
            super::Limit::Network => isolate_network(),
        }
    }

    #[cfg(target_os = "linux")]
    fn isolate_network() -> io::Result<()> {
        // Unprivileged processes need a user namespace to own the new
        // network namespace.
        // SAFETY: unshare has no memory-safety preconditions; the worker is
        // still single-threaded here.
        let rc = unsafe { libc::unshare(libc::CLONE_NEWUSER | libc::CLONE_NEWNET) };
        if rc == 0 {
            return Ok(());
        }
        // SAFETY: as above.
        let rc = unsafe { libc::unshare(libc::CLONE_NEWNET) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn isolate_network() -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "network namespaces are Linux-only",
        ))
    }
}

#[cfg(not(unix))]
mod limits {
    use std::io;

    pub fn apply(_limit: super::Limit) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "resource limits need a unix host",
        ))
    }
}
