//! Isolated execution boundary.
//!
//! Artifact, series and capital go in; a raw log or a categorized
//! [`ExecutionError`] comes out. The isolation mechanism behind it is an
//! implementation detail of the adapter.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::compiler::CompiledArtifact;
use crate::domain::error::ExecutionError;
use crate::domain::execution_result::RawExecutionLog;
use crate::domain::ohlcv::MarketSeries;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxLimits {
    /// Wall-clock budget, enforced by the caller side.
    pub timeout: Duration,
    pub max_memory_mb: u64,
    /// CPU-time backstop applied inside the child.
    pub cpu_seconds: u64,
    pub isolate_network: bool,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        SandboxLimits {
            timeout: Duration::from_secs(30),
            max_memory_mb: 2048,
            cpu_seconds: 31,
            isolate_network: true,
        }
    }
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Run `artifact` over `series`. Dropping the returned future must stop
    /// the execution and release its resources.
    async fn execute(
        &self,
        artifact: &CompiledArtifact,
        series: &MarketSeries,
        initial_capital: f64,
        limits: &SandboxLimits,
    ) -> Result<RawExecutionLog, ExecutionError>;
}
