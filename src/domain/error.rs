//! Error taxonomy for the translate → validate → compile → execute → repair pipeline.

use serde::Serialize;
use std::fmt;

use crate::domain::autofix::RepairAttempt;

/// A parse error with position information, shared by the engine rule parser
/// and the DSL expression parser.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("parse error at position {position}: {message}")]
pub struct ParseError {
    pub message: String,
    pub position: usize,
}

impl ParseError {
    /// Format the error with a caret pointing at the error position in the input.
    pub fn display_with_context(&self, input: &str) -> String {
        let caret = " ".repeat(self.position) + "^";
        format!(
            "{input}\n{caret}\n{err}",
            input = input,
            caret = caret,
            err = self
        )
    }
}

/// Failure of the opaque text-generation capability.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GenerationError {
    #[error("text generation timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("text generation request failed: {reason}")]
    Request { reason: String },

    #[error("text generation returned no content")]
    EmptyResponse,
}

#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TranslationError {
    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error("translation output is not a valid DSL document: {reason}")]
    Unparsable { reason: String, excerpt: String },
}

/// Validator stages, in the order they are checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStage {
    Schema,
    ReferenceClosure,
    NumericRange,
    Logic,
}

impl fmt::Display for ValidationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValidationStage::Schema => "schema",
            ValidationStage::ReferenceClosure => "indicator-reference closure",
            ValidationStage::NumericRange => "numeric range",
            ValidationStage::Logic => "logical well-formedness",
        };
        f.write_str(name)
    }
}

/// First violated constraint of a DSL document.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[error("{stage} violation at {location}: {message}")]
pub struct ValidationError {
    pub stage: ValidationStage,
    pub location: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(stage: ValidationStage, location: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage,
            location: location.into(),
            message: message.into(),
        }
    }
}

/// A construct the compiler has no lowering for. Reaching this means the
/// validator accepted something the compiler cannot express.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[error("no lowering for {construct}")]
pub struct CompilationError {
    pub construct: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionCategory {
    Timeout,
    ResourceLimit,
    RuntimeError,
    InvalidOutput,
}

impl fmt::Display for ExecutionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionCategory::Timeout => "timeout",
            ExecutionCategory::ResourceLimit => "resource-limit",
            ExecutionCategory::RuntimeError => "runtime-error",
            ExecutionCategory::InvalidOutput => "invalid-output",
        };
        f.write_str(name)
    }
}

/// Structured failure reported by the sandbox boundary.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[error("execution failed ({category}): {message}")]
pub struct ExecutionError {
    pub category: ExecutionCategory,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fragment: Option<String>,
    pub diagnostic: String,
}

impl ExecutionError {
    pub fn new(category: ExecutionCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            fragment: None,
            diagnostic: String::new(),
        }
    }

    pub fn with_fragment(mut self, fragment: impl Into<String>) -> Self {
        self.fragment = Some(fragment.into());
        self
    }

    pub fn with_diagnostic(mut self, diagnostic: impl Into<String>) -> Self {
        self.diagnostic = diagnostic.into();
        self
    }
}

/// Any failure that can trigger (or end) a repair attempt.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[serde(tag = "failure", rename_all = "snake_case")]
pub enum StageFailure {
    #[error(transparent)]
    Translation(TranslationError),

    #[error(transparent)]
    Validation(ValidationError),

    #[error(transparent)]
    Compilation(CompilationError),

    #[error(transparent)]
    Execution(ExecutionError),
}

impl StageFailure {
    pub fn category(&self) -> &'static str {
        match self {
            StageFailure::Translation(_) => "translation",
            StageFailure::Validation(_) => "validation",
            StageFailure::Compilation(_) => "compilation",
            StageFailure::Execution(e) => match e.category {
                ExecutionCategory::Timeout => "timeout",
                ExecutionCategory::ResourceLimit => "resource-limit",
                ExecutionCategory::RuntimeError => "runtime-error",
                ExecutionCategory::InvalidOutput => "invalid-output",
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionReason {
    BudgetExhausted,
    NoProgress,
}

impl fmt::Display for ExhaustionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExhaustionReason::BudgetExhausted => f.write_str("repair budget exhausted"),
            ExhaustionReason::NoProgress => f.write_str("repair made no progress"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[error("{reason} after {} attempt(s); last failure: {last_failure}", .attempts.len())]
pub struct ExhaustedRetries {
    pub reason: ExhaustionReason,
    pub attempts: Vec<RepairAttempt>,
    pub last_failure: StageFailure,
    /// The most recently compiled artifact, paired with `last_failure`
    /// unless the last attempt never reached compilation.
    #[serde(skip)]
    pub last_artifact: crate::domain::compiler::CompiledArtifact,
}

#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MarketDataError {
    #[error("no market data for {symbol}")]
    NotFound { symbol: String },

    #[error("market data provider rate limited the request")]
    RateLimited,

    #[error("market data provider unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("malformed market data: {reason}")]
    Malformed { reason: String },

    #[error("insufficient data for {symbol}: have {bars} bars, need {minimum}")]
    InsufficientData {
        symbol: String,
        bars: usize,
        minimum: usize,
    },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RequestError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("start date {start} must be before end date {end}")]
    DateRange { start: String, end: String },

    #[error("end date {end} is in the future")]
    FutureEnd { end: String },

    #[error("initial capital must be positive and finite, got {value}")]
    Capital { value: f64 },

    #[error("unsupported timeframe '{value}' (expected one of 1m, 5m, 15m, 30m, 1h, 4h, 1d, 1w)")]
    Timeframe { value: String },
}

/// Terminal failure of a backtest run.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    MarketData(#[from] MarketDataError),

    #[error(transparent)]
    Translation(#[from] TranslationError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Compilation(#[from] CompilationError),

    #[error(transparent)]
    ExhaustedRetries(#[from] ExhaustedRetries),
}

impl PipelineError {
    pub fn category(&self) -> &'static str {
        match self {
            PipelineError::MarketData(_) => "market-data",
            PipelineError::Translation(_) => "translation",
            PipelineError::Validation(_) => "validation",
            PipelineError::Compilation(_) => "compilation",
            PipelineError::ExhaustedRetries(_) => "exhausted-retries",
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OptimizationError {
    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error("optimization response is malformed: {reason}")]
    Malformed { reason: String },

    #[error("optimization response field {field} out of range: {reason}")]
    OutOfRange { field: &'static str, reason: String },
}

/// Failure of the backtest engine while running a loaded program.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("insufficient data: {bars} bar(s), need at least {minimum}")]
    InsufficientData { bars: usize, minimum: usize },

    #[error("{indicator} never produces a value within {bars} bars")]
    WarmupExceedsData { indicator: String, bars: usize },

    #[error("equity became non-finite at {timestamp}")]
    NonFiniteEquity { timestamp: String },
}

impl EngineError {
    pub fn fragment(&self) -> Option<String> {
        match self {
            EngineError::WarmupExceedsData { indicator, .. } => Some(indicator.clone()),
            _ => None,
        }
    }
}

/// Failure to load a compiled strategy program inside the sandbox worker.
#[derive(Debug, thiserror::Error)]
pub enum ProgramError {
    #[error("strategy program is not valid INI: {reason}")]
    Syntax { reason: String },

    #[error("failed to parse [{section}] {key}: {source}")]
    Rule {
        section: String,
        key: String,
        text: String,
        #[source]
        source: ParseError,
    },

    #[error("invalid [{section}] {key}: {reason}")]
    Invalid {
        section: String,
        key: String,
        reason: String,
    },
}

impl ProgramError {
    /// The offending part of the program, when one can be pointed at.
    pub fn fragment(&self) -> Option<String> {
        match self {
            ProgramError::Syntax { .. } => None,
            ProgramError::Rule { key, text, source, .. } => {
                Some(format!("{key} = {}", source.display_with_context(text)))
            }
            ProgramError::Invalid { section, key, .. } => Some(format!("[{section}] {key}")),
        }
    }
}

/// Top-level error type for stratforge.
#[derive(Debug, thiserror::Error)]
pub enum StratforgeError {
    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("missing config key [{section}] {key}")]
    ConfigMissing { section: String, key: String },

    #[error("invalid config value [{section}] {key}: {reason}")]
    ConfigInvalid {
        section: String,
        key: String,
        reason: String,
    },

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Optimization(#[from] OptimizationError),

    #[error(transparent)]
    Program(#[from] ProgramError),

    #[error("invalid JSON in {what}: {reason}")]
    Json { what: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<&StratforgeError> for std::process::ExitCode {
    fn from(err: &StratforgeError) -> Self {
        let code: u8 = match err {
            StratforgeError::Io(_) | StratforgeError::Json { .. } => 1,
            StratforgeError::ConfigParse { .. }
            | StratforgeError::ConfigMissing { .. }
            | StratforgeError::ConfigInvalid { .. }
            | StratforgeError::Request(_) => 2,
            StratforgeError::Pipeline(PipelineError::MarketData(_)) => 3,
            StratforgeError::Pipeline(PipelineError::Translation(_))
            | StratforgeError::Pipeline(PipelineError::Validation(_))
            | StratforgeError::Pipeline(PipelineError::Compilation(_))
            | StratforgeError::Program(_) => 4,
            StratforgeError::Pipeline(PipelineError::ExhaustedRetries(_)) => 5,
            StratforgeError::Optimization(_) => 6,
        };
        std::process::ExitCode::from(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_context_points_at_position() {
        let err = ParseError {
            message: "expected ')'".into(),
            position: 4,
        };
        let rendered = err.display_with_context("ABOVE(");
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[0], "ABOVE(");
        assert_eq!(lines[1], "    ^");
    }

    #[test]
    fn stage_failure_category_uses_execution_category() {
        let failure = StageFailure::Execution(ExecutionError::new(
            ExecutionCategory::Timeout,
            "too slow",
        ));
        assert_eq!(failure.category(), "timeout");

        let failure = StageFailure::Validation(ValidationError::new(
            ValidationStage::Schema,
            "name",
            "must not be empty",
        ));
        assert_eq!(failure.category(), "validation");
    }

    #[test]
    fn execution_category_serializes_kebab_case() {
        let json = serde_json::to_string(&ExecutionCategory::ResourceLimit).unwrap();
        assert_eq!(json, "\"resource-limit\"");
    }

    // ExitCode has no PartialEq, compare through Debug.
    fn same_code(a: std::process::ExitCode, b: u8) -> bool {
        format!("{a:?}") == format!("{:?}", std::process::ExitCode::from(b))
    }

    #[test]
    fn exit_codes_by_category() {
        let err = StratforgeError::ConfigMissing {
            section: "llm".into(),
            key: "model".into(),
        };
        assert!(same_code((&err).into(), 2));

        let err = StratforgeError::Pipeline(PipelineError::MarketData(
            MarketDataError::RateLimited,
        ));
        assert!(same_code((&err).into(), 3));

        let err = StratforgeError::Optimization(OptimizationError::Malformed {
            reason: "no json".into(),
        });
        assert!(same_code((&err).into(), 6));
    }

    #[test]
    fn program_error_fragment_includes_caret() {
        let err = ProgramError::Rule {
            section: "strategy".into(),
            key: "entry_long".into(),
            text: "ABOVE(close".into(),
            source: ParseError {
                message: "expected ','".into(),
                position: 11,
            },
        };
        let fragment = err.fragment().unwrap();
        assert!(fragment.starts_with("entry_long = ABOVE(close"));
        assert!(fragment.contains('^'));
    }
}
