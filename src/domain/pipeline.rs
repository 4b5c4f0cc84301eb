//! Backtest run orchestration.
//!
//! A run walks `Pending → Translating → Validating → Compiling → Executing`
//! and ends in `Succeeded` or `Failed`. An execution failure moves it to
//! `Repairing`, which re-enters `Translating` through the auto-fix
//! controller. Every transition is recorded in the outcome's trace.

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;

use crate::domain::autofix::{AutoFixController, RepairAttempt, RepairSteps};
use crate::domain::compiler::{compile, CompiledArtifact};
use crate::domain::dialect::{classify, SourceDialect};
use crate::domain::dsl::DslDocument;
use crate::domain::engine::MIN_BARS;
use crate::domain::error::{
    ExecutionError, MarketDataError, PipelineError, StageFailure, TranslationError,
};
use crate::domain::execution_result::{BacktestReport, RawExecutionLog};
use crate::domain::market_data_cache::MarketDataCache;
use crate::domain::metrics::PerformanceMetrics;
use crate::domain::ohlcv::MarketSeries;
use crate::domain::request::StrategyRequest;
use crate::domain::translator::{RepairContext, Translator};
use crate::domain::validator::validate;
use crate::ports::sandbox_port::{Sandbox, SandboxLimits};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Translating,
    Validating,
    Compiling,
    Executing,
    Repairing,
    Succeeded,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Pending => "pending",
            RunState::Translating => "translating",
            RunState::Validating => "validating",
            RunState::Compiling => "compiling",
            RunState::Executing => "executing",
            RunState::Repairing => "repairing",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOptions {
    pub max_repair_attempts: usize,
    pub limits: SandboxLimits,
    pub risk_free_rate: f64,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            max_repair_attempts: crate::domain::autofix::DEFAULT_MAX_ATTEMPTS,
            limits: SandboxLimits::default(),
            risk_free_rate: 0.0,
        }
    }
}

/// Everything a run produced, successful or not.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub state: RunState,
    pub trace: Vec<RunState>,
    pub dialect: SourceDialect,
    pub attempts: Vec<RepairAttempt>,
    /// Last document the run worked with.
    pub dsl: Option<DslDocument>,
    /// Last artifact the run compiled. On exhausted retries this is the
    /// artifact behind the final failure when that attempt compiled.
    pub artifact: Option<CompiledArtifact>,
    pub result: Result<BacktestReport, PipelineError>,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

pub struct Pipeline {
    cache: Arc<MarketDataCache>,
    translator: Translator,
    sandbox: Arc<dyn Sandbox>,
    options: PipelineOptions,
}

/// Mutable state of one run.
struct Run {
    trace: Mutex<Vec<RunState>>,
    dialect: SourceDialect,
    attempts: Vec<RepairAttempt>,
    dsl: Option<DslDocument>,
    artifact: Option<CompiledArtifact>,
}

impl Run {
    fn new(dialect: SourceDialect) -> Self {
        Self {
            trace: Mutex::new(vec![RunState::Pending]),
            dialect,
            attempts: Vec::new(),
            dsl: None,
            artifact: None,
        }
    }

    fn enter(&self, state: RunState) {
        tracing::info!(state = state.as_str(), "pipeline state");
        self.trace
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(state);
    }

    fn finish(self, result: Result<BacktestReport, PipelineError>) -> RunOutcome {
        let state = if result.is_ok() {
            RunState::Succeeded
        } else {
            RunState::Failed
        };
        self.enter(state);
        if let Err(e) = &result {
            tracing::warn!(category = e.category(), error = %e, "run failed");
        }
        RunOutcome {
            state,
            trace: self.trace.into_inner().unwrap_or_else(|e| e.into_inner()),
            dialect: self.dialect,
            attempts: self.attempts,
            dsl: self.dsl,
            artifact: self.artifact,
            result,
        }
    }
}

/// Repair-loop side effects bound to one run.
struct RunSteps<'a> {
    pipeline: &'a Pipeline,
    run: &'a Run,
    request: &'a StrategyRequest,
    series: &'a MarketSeries,
}

#[async_trait]
impl RepairSteps for RunSteps<'_> {
    async fn revise(
        &self,
        prior_dsl: Option<&DslDocument>,
        prior_artifact: Option<&CompiledArtifact>,
        failure: &StageFailure,
    ) -> Result<DslDocument, TranslationError> {
        let context = RepairContext {
            prior_dsl,
            prior_artifact,
            failure,
        };
        self.pipeline
            .translator
            .repair(self.request, self.run.dialect, context)
            .await
    }

    async fn execute(&self, artifact: &CompiledArtifact) -> Result<RawExecutionLog, ExecutionError> {
        self.pipeline
            .execute(artifact, self.series, self.request.initial_capital())
            .await
    }

    fn on_state(&self, state: RunState) {
        self.run.enter(state);
    }
}

impl Pipeline {
    pub fn new(
        cache: Arc<MarketDataCache>,
        translator: Translator,
        sandbox: Arc<dyn Sandbox>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            cache,
            translator,
            sandbox,
            options,
        }
    }

    async fn execute(
        &self,
        artifact: &CompiledArtifact,
        series: &MarketSeries,
        initial_capital: f64,
    ) -> Result<RawExecutionLog, ExecutionError> {
        tracing::debug!(artifact = artifact.hash.short(), "executing artifact");
        self.sandbox
            .execute(artifact, series, initial_capital, &self.options.limits)
            .await
    }

    fn report(&self, request: &StrategyRequest, log: RawExecutionLog) -> BacktestReport {
        let metrics = PerformanceMetrics::compute(
            &log,
            request.initial_capital(),
            request.timeframe(),
            self.options.risk_free_rate,
        );
        BacktestReport { log, metrics }
    }

    /// Translate, validate, compile and execute `request`, repairing on
    /// execution failure. Dropping the future cancels the run and kills any
    /// running sandbox.
    pub async fn run_backtest(&self, request: &StrategyRequest) -> RunOutcome {
        let dialect = classify(request.text());
        let mut run = Run::new(dialect);
        let key = request.series_key();
        tracing::info!(%key, dialect = dialect.as_str(), "backtest run started");

        // Market data first: nothing is worth translating without it.
        let series = match self.cache.get(&key).await {
            Ok(series) => series,
            Err(e) => return run.finish(Err(e.into())),
        };
        if series.len() < MIN_BARS {
            return run.finish(Err(MarketDataError::InsufficientData {
                symbol: key.symbol.clone(),
                bars: series.len(),
                minimum: MIN_BARS,
            }
            .into()));
        }

        run.enter(RunState::Translating);
        let dsl = match self.translator.translate(request, dialect).await {
            Ok(dsl) => dsl,
            Err(e) => return run.finish(Err(e.into())),
        };
        run.dsl = Some(dsl.clone());

        run.enter(RunState::Validating);
        let validated = match validate(&dsl) {
            Ok(v) => v,
            Err(e) => return run.finish(Err(e.into())),
        };

        run.enter(RunState::Compiling);
        let artifact = match compile(&validated) {
            Ok(a) => a,
            Err(e) => return run.finish(Err(e.into())),
        };
        tracing::debug!(
            artifact = artifact.hash.short(),
            source = artifact.source_hash.short(),
            "compiled"
        );
        run.artifact = Some(artifact.clone());

        run.enter(RunState::Executing);
        let failure = match self
            .execute(&artifact, &series, request.initial_capital())
            .await
        {
            Ok(log) => {
                let report = self.report(request, log);
                return run.finish(Ok(report));
            }
            Err(e) => e,
        };
        tracing::warn!(category = %failure.category, error = %failure, "execution failed");

        let controller = AutoFixController::new(self.options.max_repair_attempts);
        let repaired = {
            let steps = RunSteps {
                pipeline: self,
                run: &run,
                request,
                series: &series,
            };
            controller
                .run(&steps, validated.into_document(), artifact, failure)
                .await
        };

        match repaired {
            Ok(repaired) => {
                run.attempts = repaired.attempts;
                run.dsl = Some(repaired.dsl);
                run.artifact = Some(repaired.artifact);
                let report = self.report(request, repaired.log);
                run.finish(Ok(report))
            }
            Err(exhausted) => {
                run.attempts = exhausted.attempts.clone();
                if let Some(last) = exhausted.attempts.iter().rev().find_map(|a| a.dsl.clone()) {
                    run.dsl = Some(last);
                }
                run.artifact = Some(exhausted.last_artifact.clone());
                run.finish(Err(exhausted.into()))
            }
        }
    }
}
