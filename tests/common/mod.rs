#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, TimeZone, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use stratforge::domain::compiler::{compile, CompiledArtifact};
use stratforge::domain::dsl::DslDocument;
use stratforge::domain::error::{
    ExecutionCategory, ExecutionError, GenerationError, MarketDataError,
};
use stratforge::domain::execution::ExecutionConfig;
use stratforge::domain::execution_result::RawExecutionLog;
use stratforge::domain::market_data_cache::MarketDataCache;
use stratforge::domain::ohlcv::{Bar, MarketSeries};
use stratforge::domain::pipeline::{Pipeline, PipelineOptions};
use stratforge::domain::request::{SeriesKey, StrategyRequest, Timeframe};
use stratforge::domain::translator::Translator;
use stratforge::domain::validator::validate;
use stratforge::ports::market_data_port::MarketDataProvider;
use stratforge::ports::sandbox_port::{Sandbox, SandboxLimits};
use stratforge::ports::text_generation_port::TextGenerator;
use stratforge::worker::{run_job, SandboxJob};

pub const BUY_AND_HOLD_DSL: &str = r#"{
  "name": "Buy and hold",
  "signals": { "entry_long": "true" },
  "sizing": { "method": "percent_equity", "percent": 95 }
}"#;

pub const SMA_CROSS_DSL: &str = r#"{
  "name": "SMA cross",
  "indicators": [
    { "id": "fast", "function": "SMA", "params": { "period": 3 } },
    { "id": "slow", "function": "SMA", "params": { "period": 8 } }
  ],
  "signals": {
    "entry_long": "cross_above(fast, slow)",
    "exit_long": "cross_below(fast, slow)"
  }
}"#;

/// Same shape as [`SMA_CROSS_DSL`] with a different slow period, so it
/// compiles to a different artifact.
pub fn sma_cross_dsl(slow: u32) -> String {
    SMA_CROSS_DSL.replace("\"period\": 8", &format!("\"period\": {slow}"))
}

pub fn compile_dsl(json: &str) -> CompiledArtifact {
    let doc: DslDocument = serde_json::from_str(json).unwrap();
    compile(&validate(&doc).unwrap()).unwrap()
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn request(text: &str) -> StrategyRequest {
    StrategyRequest::new(
        text,
        "AAPL",
        Timeframe::D1,
        date(2024, 1, 1),
        date(2024, 6, 30),
        10_000.0,
    )
    .unwrap()
}

/// Daily bars starting at 2024-01-01 with the given closes.
pub fn series_from_closes(key: &SeriesKey, closes: &[f64]) -> MarketSeries {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let bars = closes
        .iter()
        .enumerate()
        .map(|(i, &close)| Bar {
            timestamp: start + Duration::days(i as i64),
            open: close,
            high: close * 1.01,
            low: close * 0.99,
            close,
            volume: 1_000.0,
        })
        .collect();
    MarketSeries::new(key.clone(), bars)
}

/// A gently rising series with a dip in the middle, long enough for the
/// SMA cross to trade.
pub fn trending_closes(n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| {
            let x = i as f64;
            100.0 + x * 0.5 + 8.0 * (x / 6.0).sin()
        })
        .collect()
}

/// Text generator answering from a queue and recording every prompt.
pub struct ScriptedGenerator {
    responses: Mutex<VecDeque<Result<String, GenerationError>>>,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().map(|r| Ok(r.into())).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(err: GenerationError) -> Self {
        Self {
            responses: Mutex::new(VecDeque::from([Err(err)])),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(GenerationError::EmptyResponse))
    }
}

/// Market data provider serving one fixed series and counting fetches.
pub struct CountingProvider {
    closes: Vec<f64>,
    error: Option<MarketDataError>,
    pub fetches: AtomicUsize,
    delay: std::time::Duration,
}

impl CountingProvider {
    pub fn new(closes: Vec<f64>) -> Self {
        Self {
            closes,
            error: None,
            fetches: AtomicUsize::new(0),
            delay: std::time::Duration::ZERO,
        }
    }

    pub fn failing(error: MarketDataError) -> Self {
        Self {
            error: Some(error),
            ..Self::new(Vec::new())
        }
    }

    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MarketDataProvider for CountingProvider {
    async fn fetch(&self, key: &SeriesKey) -> Result<MarketSeries, MarketDataError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.error {
            Some(e) => Err(e.clone()),
            None => Ok(series_from_closes(key, &self.closes)),
        }
    }
}

/// Runs artifacts through the worker's job runner without a child process.
pub struct InProcessSandbox {
    pub executions: AtomicUsize,
}

impl InProcessSandbox {
    pub fn new() -> Self {
        Self {
            executions: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Sandbox for InProcessSandbox {
    async fn execute(
        &self,
        artifact: &CompiledArtifact,
        series: &MarketSeries,
        initial_capital: f64,
        _limits: &SandboxLimits,
    ) -> Result<RawExecutionLog, ExecutionError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let job = SandboxJob {
            code: artifact.code.clone(),
            series: series.clone(),
            initial_capital,
            execution: ExecutionConfig::default(),
        };
        run_job(&job).map_err(|f| {
            let err = ExecutionError::new(ExecutionCategory::RuntimeError, f.message);
            match f.fragment {
                Some(fragment) => err.with_fragment(fragment),
                None => err,
            }
        })
    }
}

/// Sandbox answering from a queue of failures, then delegating to the
/// in-process runner. Records the hash of every artifact it was given.
pub struct ScriptedSandbox {
    failures: Mutex<VecDeque<ExecutionError>>,
    pub seen: Mutex<Vec<String>>,
    inner: InProcessSandbox,
}

impl ScriptedSandbox {
    pub fn new<I: IntoIterator<Item = ExecutionError>>(failures: I) -> Self {
        Self {
            failures: Mutex::new(failures.into_iter().collect()),
            seen: Mutex::new(Vec::new()),
            inner: InProcessSandbox::new(),
        }
    }

    pub fn executions(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl Sandbox for ScriptedSandbox {
    async fn execute(
        &self,
        artifact: &CompiledArtifact,
        series: &MarketSeries,
        initial_capital: f64,
        limits: &SandboxLimits,
    ) -> Result<RawExecutionLog, ExecutionError> {
        self.seen
            .lock()
            .unwrap()
            .push(artifact.hash.as_str().to_string());
        let next = self.failures.lock().unwrap().pop_front();
        match next {
            Some(err) => Err(err),
            None => self.inner.execute(artifact, series, initial_capital, limits).await,
        }
    }
}

pub fn timeout_error() -> ExecutionError {
    ExecutionError::new(ExecutionCategory::Timeout, "execution exceeded 30s")
}

pub fn runtime_error(message: &str) -> ExecutionError {
    ExecutionError::new(ExecutionCategory::RuntimeError, message)
        .with_diagnostic(format!("Traceback: {message}"))
}

pub fn pipeline(
    generator: Arc<dyn TextGenerator>,
    provider: Arc<dyn MarketDataProvider>,
    sandbox: Arc<dyn Sandbox>,
) -> Pipeline {
    Pipeline::new(
        Arc::new(MarketDataCache::new(provider)),
        Translator::new(generator, std::time::Duration::from_secs(5)),
        sandbox,
        PipelineOptions::default(),
    )
}
