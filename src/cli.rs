//! CLI definition and dispatch.

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use crate::adapters::csv_adapter::CsvAdapter;
use crate::adapters::disk_cache::DiskCachedProvider;
use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::adapters::openai_adapter::{OpenAiAdapter, OpenAiSettings};
use crate::adapters::process_sandbox::ProcessSandbox;
use crate::adapters::yahoo_adapter::YahooAdapter;
use crate::domain::autofix::RepairAttempt;
use crate::domain::compiler::compile;
use crate::domain::dialect::{classify, SourceDialect};
use crate::domain::dsl::DslDocument;
use crate::domain::error::{PipelineError, StratforgeError};
use crate::domain::execution_result::BacktestReport;
use crate::domain::market_data_cache::MarketDataCache;
use crate::domain::metrics::PerformanceMetrics;
use crate::domain::optimization::{OptimizationAnalysis, OptimizationGoal, Optimizer};
use crate::domain::pipeline::{Pipeline, RunOutcome, RunState};
use crate::domain::request::{StrategyRequest, Timeframe};
use crate::domain::settings::{DataProvider, Settings};
use crate::domain::translator::Translator;
use crate::domain::validator::validate;
use crate::ports::market_data_port::MarketDataProvider;
use crate::ports::text_generation_port::TextGenerator;
use crate::worker;

const MARKET_DATA_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_LOG_FILTER: &str = "stratforge=info";

#[derive(Parser, Debug)]
#[command(
    name = "stratforge",
    version,
    about = "Translate trading strategies into sandboxed backtests"
)]
pub struct Cli {
    /// Settings file (INI)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Translate a strategy and backtest it
    Backtest {
        /// Strategy text (prose, Pine Script, MQL or Python)
        #[arg(required_unless_present = "strategy_file")]
        text: Option<String>,
        #[arg(long, conflicts_with = "text")]
        strategy_file: Option<PathBuf>,
        #[arg(long)]
        symbol: String,
        #[arg(long, default_value = "1d")]
        timeframe: Timeframe,
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
        #[arg(long, default_value_t = 10_000.0)]
        capital: f64,
        /// Write the run record as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Print the compiled strategy program
        #[arg(long)]
        show_code: bool,
    },
    /// Ask for an improved version of a backtested strategy
    Optimize {
        /// Run record written by `backtest --output`
        #[arg(long)]
        result: PathBuf,
        #[arg(long, default_value = "improve_returns")]
        goal: OptimizationGoal,
        /// Extra guidance for the rewrite
        #[arg(long)]
        feedback: Option<String>,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print the detected dialect of a strategy
    Classify {
        #[arg(required_unless_present = "strategy_file")]
        text: Option<String>,
        #[arg(long, conflicts_with = "text")]
        strategy_file: Option<PathBuf>,
    },
    /// Validate a DSL document
    Validate {
        #[arg(long)]
        dsl: PathBuf,
        /// Print the compiled strategy program
        #[arg(long)]
        emit: bool,
    },
    /// Sandbox worker: reads a job on stdin, writes the log on stdout
    #[command(hide = true)]
    Sandbox,
}

pub fn run(cli: Cli) -> ExitCode {
    // The worker applies its limits before anything else runs in-process.
    if let Command::Sandbox = cli.command {
        return worker::run_stdio();
    }
    init_tracing();

    match cli.command {
        Command::Backtest {
            text,
            strategy_file,
            symbol,
            timeframe,
            start,
            end,
            capital,
            output,
            show_code,
        } => {
            let text = match read_strategy_text(text, strategy_file.as_deref()) {
                Ok(t) => t,
                Err(e) => return report_error(&e),
            };
            let request = match StrategyRequest::new(&text, &symbol, timeframe, start, end, capital) {
                Ok(r) => r,
                Err(e) => return report_error(&e.into()),
            };
            run_backtest(cli.config.as_deref(), &request, output.as_deref(), show_code)
        }
        Command::Optimize {
            result,
            goal,
            feedback,
            output,
        } => run_optimize(
            cli.config.as_deref(),
            &result,
            goal,
            feedback.as_deref(),
            output.as_deref(),
        ),
        Command::Classify {
            text,
            strategy_file,
        } => match read_strategy_text(text, strategy_file.as_deref()) {
            Ok(text) => run_classify(&text),
            Err(e) => report_error(&e),
        },
        Command::Validate { dsl, emit } => run_validate(&dsl, emit),
        Command::Sandbox => worker::run_stdio(),
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn report_error(err: &StratforgeError) -> ExitCode {
    eprintln!("error: {err}");
    err.into()
}

fn read_strategy_text(
    text: Option<String>,
    strategy_file: Option<&Path>,
) -> Result<String, StratforgeError> {
    match (text, strategy_file) {
        (Some(text), _) => Ok(text),
        (None, Some(path)) => Ok(fs::read_to_string(path)?),
        (None, None) => Err(StratforgeError::Request(
            crate::domain::error::RequestError::Empty {
                field: "strategy text",
            },
        )),
    }
}

/// Settings from `path`, or defaults when no file is given.
pub fn load_settings(path: Option<&Path>) -> Result<Settings, StratforgeError> {
    let Some(path) = path else {
        return Ok(Settings::default());
    };
    eprintln!("Loading config from {}", path.display());
    let config = FileConfigAdapter::from_file(path).map_err(|reason| StratforgeError::ConfigParse {
        file: path.display().to_string(),
        reason,
    })?;
    Settings::from_config(&config)
}

fn runtime() -> Result<tokio::runtime::Runtime, StratforgeError> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?)
}

/// Run `future` to completion unless Ctrl-C arrives first. Dropping the
/// future on interrupt cancels the run and kills any sandbox child.
fn block_on_interruptible<F: Future>(runtime: &tokio::runtime::Runtime, future: F) -> Option<F::Output> {
    runtime.block_on(async {
        tokio::select! {
            output = future => Some(output),
            _ = tokio::signal::ctrl_c() => None,
        }
    })
}

fn text_generator(settings: &Settings) -> Result<Arc<dyn TextGenerator>, StratforgeError> {
    let llm = &settings.llm;
    let api_key = std::env::var(&llm.api_key_env).map_err(|_| StratforgeError::ConfigInvalid {
        section: "llm".into(),
        key: "api_key_env".into(),
        reason: format!("environment variable {} is not set", llm.api_key_env),
    })?;
    let adapter = OpenAiAdapter::new(OpenAiSettings {
        base_url: llm.base_url.clone(),
        model: llm.model.clone(),
        api_key,
        temperature: llm.temperature,
        timeout: llm.timeout,
    })
    .map_err(|e| StratforgeError::ConfigInvalid {
        section: "llm".into(),
        key: "base_url".into(),
        reason: e.to_string(),
    })?;
    tracing::debug!(model = adapter.model(), "text generator ready");
    Ok(Arc::new(adapter))
}

fn with_disk_cache<P: MarketDataProvider + 'static>(
    provider: P,
    cache_dir: Option<&Path>,
) -> Arc<dyn MarketDataProvider> {
    match cache_dir {
        Some(dir) => Arc::new(DiskCachedProvider::new(provider, dir)),
        None => Arc::new(provider),
    }
}

pub fn market_data_provider(settings: &Settings) -> Result<Arc<dyn MarketDataProvider>, StratforgeError> {
    let data = &settings.data;
    let cache_dir = data.cache_dir.as_deref();
    match data.provider {
        DataProvider::Csv => {
            let dir = data.csv_dir.clone().ok_or_else(|| StratforgeError::ConfigMissing {
                section: "data".into(),
                key: "csv_dir".into(),
            })?;
            Ok(with_disk_cache(CsvAdapter::new(dir), cache_dir))
        }
        DataProvider::Yahoo => {
            let yahoo = YahooAdapter::new(&data.yahoo_base_url, MARKET_DATA_TIMEOUT)
                .map_err(|e| StratforgeError::Pipeline(e.into()))?;
            Ok(with_disk_cache(yahoo, cache_dir))
        }
    }
}

fn build_pipeline(settings: &Settings) -> Result<Pipeline, StratforgeError> {
    let generator = text_generator(settings)?;
    let provider = market_data_provider(settings)?;
    let program = match &settings.sandbox.program {
        Some(p) => p.clone(),
        None => std::env::current_exe()?,
    };
    let sandbox = ProcessSandbox::new(program, settings.execution.clone());
    Ok(Pipeline::new(
        Arc::new(MarketDataCache::new(provider)),
        Translator::new(generator, settings.llm.timeout),
        Arc::new(sandbox),
        settings.pipeline_options(),
    ))
}

/// What `backtest --output` writes.
#[derive(Serialize)]
struct RunRecord<'a> {
    request: &'a StrategyRequest,
    dialect: SourceDialect,
    state: RunState,
    trace: &'a [RunState],
    attempts: &'a [RepairAttempt],
    #[serde(skip_serializing_if = "Option::is_none")]
    dsl: Option<&'a DslDocument>,
    #[serde(skip_serializing_if = "Option::is_none")]
    program: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    artifact_hash: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<&'a BacktestReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RecordedError>,
}

#[derive(Serialize)]
struct RecordedError {
    category: &'static str,
    message: String,
}

impl<'a> RunRecord<'a> {
    fn new(request: &'a StrategyRequest, outcome: &'a RunOutcome) -> Self {
        RunRecord {
            request,
            dialect: outcome.dialect,
            state: outcome.state,
            trace: &outcome.trace,
            attempts: &outcome.attempts,
            dsl: outcome.dsl.as_ref(),
            program: outcome.artifact.as_ref().map(|a| a.code.as_str()),
            artifact_hash: outcome.artifact.as_ref().map(|a| a.hash.as_str()),
            report: outcome.result.as_ref().ok(),
            error: outcome.result.as_ref().err().map(|e| RecordedError {
                category: e.category(),
                message: e.to_string(),
            }),
        }
    }
}

/// The parts of a run record `optimize` needs.
#[derive(Debug, Deserialize)]
pub struct SavedRun {
    pub request: StrategyRequest,
    pub dialect: SourceDialect,
    #[serde(default)]
    pub report: Option<SavedReport>,
}

#[derive(Debug, Deserialize)]
pub struct SavedReport {
    pub metrics: PerformanceMetrics,
}

pub fn load_saved_run(path: &Path) -> Result<SavedRun, StratforgeError> {
    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|e| StratforgeError::Json {
        what: path.display().to_string(),
        reason: e.to_string(),
    })
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StratforgeError> {
    let json = serde_json::to_string_pretty(value).map_err(|e| StratforgeError::Json {
        what: path.display().to_string(),
        reason: e.to_string(),
    })?;
    fs::write(path, json)?;
    Ok(())
}

fn run_backtest(
    config_path: Option<&Path>,
    request: &StrategyRequest,
    output_path: Option<&Path>,
    show_code: bool,
) -> ExitCode {
    let settings = match load_settings(config_path) {
        Ok(s) => s,
        Err(e) => return report_error(&e),
    };
    let pipeline = match build_pipeline(&settings) {
        Ok(p) => p,
        Err(e) => return report_error(&e),
    };
    let runtime = match runtime() {
        Ok(r) => r,
        Err(e) => return report_error(&e),
    };

    eprintln!(
        "Backtesting {} {} from {} to {}",
        request.symbol(),
        request.timeframe(),
        request.start(),
        request.end()
    );
    let Some(outcome) = block_on_interruptible(&runtime, pipeline.run_backtest(request)) else {
        eprintln!("\ninterrupted");
        return ExitCode::from(130);
    };

    print_outcome(&outcome);
    if show_code {
        if let Some(artifact) = &outcome.artifact {
            println!("{}", artifact.code);
        }
    }

    if let Some(path) = output_path {
        match write_json(path, &RunRecord::new(request, &outcome)) {
            Ok(()) => eprintln!("\nRun record written to: {}", path.display()),
            Err(e) => return report_error(&e),
        }
    }

    match outcome.result {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            let err = StratforgeError::Pipeline(e);
            ExitCode::from(&err)
        }
    }
}

fn print_outcome(outcome: &RunOutcome) {
    eprintln!("Dialect:          {}", outcome.dialect);
    let trace: Vec<&str> = outcome.trace.iter().map(RunState::as_str).collect();
    eprintln!("States:           {}", trace.join(" -> "));
    for attempt in &outcome.attempts {
        eprintln!(
            "  repair #{}: {} ({})",
            attempt.index,
            attempt.trigger.category(),
            attempt
                .artifact_hash
                .as_ref()
                .map(|h| h.short().to_string())
                .unwrap_or_else(|| "no artifact".into())
        );
    }

    match &outcome.result {
        Ok(report) => print_metrics(&report.metrics),
        Err(e) => print_failure(e),
    }
}

fn print_metrics(metrics: &PerformanceMetrics) {
    eprintln!("\n=== Results ===");
    eprintln!("Total Return:     {:.2}%", metrics.total_return_pct());
    eprintln!("Annual Return:    {:.2}%", metrics.annualized_return * 100.0);
    eprintln!("Buy & Hold:       {:.2}%", metrics.buy_and_hold_return * 100.0);
    eprintln!("Sharpe Ratio:     {:.2}", metrics.sharpe_ratio);
    eprintln!("Sortino Ratio:    {:.2}", metrics.sortino_ratio);
    eprintln!("Max Drawdown:     -{:.1}%", metrics.max_drawdown_pct());
    eprintln!(
        "Total Trades:     {} ({} open)",
        metrics.total_trades, metrics.open_trades
    );
    eprintln!("Win Rate:         {:.1}%", metrics.win_rate * 100.0);
    match metrics.profit_factor {
        Some(pf) => eprintln!("Profit Factor:    {pf:.2}"),
        None => eprintln!("Profit Factor:    n/a"),
    }
    eprintln!("Ending Value:     {:.2}", metrics.ending_value);
}

fn print_failure(err: &PipelineError) {
    eprintln!("\n=== Failed ({}) ===", err.category());
    eprintln!("{err}");
    if let PipelineError::ExhaustedRetries(exhausted) = err {
        if let crate::domain::error::StageFailure::Execution(e) = &exhausted.last_failure {
            if !e.diagnostic.is_empty() {
                eprintln!("\nLast diagnostic:\n{}", e.diagnostic);
            }
        }
    }
}

fn run_optimize(
    config_path: Option<&Path>,
    result_path: &Path,
    goal: OptimizationGoal,
    feedback: Option<&str>,
    output_path: Option<&Path>,
) -> ExitCode {
    let saved = match load_saved_run(result_path) {
        Ok(s) => s,
        Err(e) => return report_error(&e),
    };
    let Some(report) = saved.report else {
        return report_error(&StratforgeError::Json {
            what: result_path.display().to_string(),
            reason: "run record has no metrics (the backtest did not succeed)".into(),
        });
    };
    let settings = match load_settings(config_path) {
        Ok(s) => s,
        Err(e) => return report_error(&e),
    };
    let generator = match text_generator(&settings) {
        Ok(g) => g,
        Err(e) => return report_error(&e),
    };
    let runtime = match runtime() {
        Ok(r) => r,
        Err(e) => return report_error(&e),
    };

    let optimizer = Optimizer::new(generator, settings.llm.timeout);
    let future = optimizer.optimize(
        &saved.request,
        saved.dialect,
        &report.metrics,
        goal,
        feedback,
    );
    let analysis = match block_on_interruptible(&runtime, future) {
        None => {
            eprintln!("\ninterrupted");
            return ExitCode::from(130);
        }
        Some(Err(e)) => return report_error(&e.into()),
        Some(Ok(analysis)) => analysis,
    };

    print_analysis(&analysis);
    match output_path {
        Some(path) => match write_json(path, &analysis) {
            Ok(()) => eprintln!("\nAnalysis written to: {}", path.display()),
            Err(e) => return report_error(&e),
        },
        None => println!("{}", analysis.improved_strategy),
    }
    ExitCode::SUCCESS
}

fn print_analysis(analysis: &OptimizationAnalysis) {
    eprintln!("=== Optimization ({}) ===", analysis.goal);
    eprintln!(
        "Score:            {} (baseline {})",
        analysis.overall_score, analysis.baseline.overall_score
    );
    eprintln!("Risk Level:       {}", analysis.risk_level);
    for strength in &analysis.strengths {
        eprintln!("  + {strength}");
    }
    for weakness in &analysis.weaknesses {
        eprintln!("  - {weakness}");
    }
}

fn run_classify(text: &str) -> ExitCode {
    let dialect = classify(text);
    eprintln!("{}", dialect.description());
    println!("{dialect}");
    ExitCode::SUCCESS
}

fn run_validate(dsl_path: &Path, emit: bool) -> ExitCode {
    eprintln!("Validating DSL document: {}", dsl_path.display());
    let content = match fs::read_to_string(dsl_path) {
        Ok(c) => c,
        Err(e) => return report_error(&e.into()),
    };
    let doc: DslDocument = match serde_json::from_str(&content) {
        Ok(d) => d,
        Err(e) => {
            return report_error(&StratforgeError::Json {
                what: dsl_path.display().to_string(),
                reason: e.to_string(),
            });
        }
    };
    let validated = match validate(&doc) {
        Ok(v) => v,
        Err(e) => return report_error(&StratforgeError::Pipeline(e.into())),
    };
    let artifact = match compile(&validated) {
        Ok(a) => a,
        Err(e) => return report_error(&StratforgeError::Pipeline(e.into())),
    };

    eprintln!("Document hash:    {}", validated.content_hash().short());
    eprintln!("Artifact hash:    {}", artifact.hash.short());
    if emit {
        println!("{}", artifact.code);
    }
    eprintln!("\nDSL document is valid.");
    ExitCode::SUCCESS
}
