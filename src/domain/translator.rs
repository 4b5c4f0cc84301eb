//! Strategy text → DSL document, through the text-generation capability.
//!
//! One generation call per invocation and no internal retries; retrying is
//! the auto-fix controller's job. In repair mode the prompt carries the
//! previous document, the compiled program and the failure so the model can
//! fix the specific problem.

use std::sync::Arc;
use std::time::Duration;

use crate::domain::compiler::CompiledArtifact;
use crate::domain::dialect::SourceDialect;
use crate::domain::dsl::{DslDocument, VOCABULARY};
use crate::domain::error::{GenerationError, StageFailure, TranslationError};
use crate::domain::request::StrategyRequest;
use crate::ports::text_generation_port::TextGenerator;

const MAX_DIAGNOSTIC_CHARS: usize = 2000;
const MAX_EXCERPT_CHARS: usize = 200;

const GRAMMAR: &str = "\
Signal expressions (strings in \"signals\"):
  comparisons: a > b, a < b, a >= b, a <= b, a == b, a != b
  crossovers:  cross_above(a, b), cross_below(a, b)   (cross/cross_up and cross_down are aliases)
  logic:       and, or, not, parentheses, true, false
  values:      numbers, open, high, low, close, volume, an indicator id, or id.field
               for multi-output indicators (e.g. macd.signal, bb.upper)";

const SCHEMA: &str = r#"{
  "name": "short strategy name",
  "indicators": [{"id": "ema_fast", "function": "EMA", "params": {"period": 12}}],
  "signals": {
    "entry_long": "cross_above(ema_fast, ema_slow)",
    "exit_long": "cross_below(ema_fast, ema_slow)",
    "entry_short": null,
    "exit_short": null
  },
  "sizing": {"method": "percent_equity", "percent": 95},
  "risk": {"stop_loss_pct": 5, "take_profit_pct": 10, "max_position_pct": 100}
}"#;

const SIZING_RULES: &str = "\
Sizing methods:
  {\"method\": \"fixed\", \"quantity\": Q}                 fixed number of units
  {\"method\": \"percent_equity\", \"percent\": P}         P% of equity per entry, 0 < P <= 100
  {\"method\": \"risk_based\", \"risk_pct\": R, \"atr\": \"atr_id\", \"atr_multiple\": M}
      risk R% of equity per trade; per-unit risk is ATR x M, or the stop-loss distance when no atr is given
Risk limits (all optional, percentages): stop_loss_pct in (0, 100), take_profit_pct in (0, 1000],
max_position_pct in (0, 100].";

/// What the previous attempt produced and how it failed.
#[derive(Debug, Clone, Copy)]
pub struct RepairContext<'a> {
    pub prior_dsl: Option<&'a DslDocument>,
    pub prior_artifact: Option<&'a CompiledArtifact>,
    pub failure: &'a StageFailure,
}

pub struct Translator {
    generator: Arc<dyn TextGenerator>,
    timeout: Duration,
}

impl Translator {
    pub fn new(generator: Arc<dyn TextGenerator>, timeout: Duration) -> Self {
        Self { generator, timeout }
    }

    pub async fn translate(
        &self,
        request: &StrategyRequest,
        dialect: SourceDialect,
    ) -> Result<DslDocument, TranslationError> {
        let prompt = translation_prompt(request, dialect);
        self.call(&prompt).await
    }

    pub async fn repair(
        &self,
        request: &StrategyRequest,
        dialect: SourceDialect,
        context: RepairContext<'_>,
    ) -> Result<DslDocument, TranslationError> {
        let prompt = repair_prompt(request, dialect, context);
        self.call(&prompt).await
    }

    async fn call(&self, prompt: &str) -> Result<DslDocument, TranslationError> {
        tracing::debug!(prompt_chars = prompt.len(), "requesting translation");
        let response = match tokio::time::timeout(self.timeout, self.generator.generate(prompt)).await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(GenerationError::Timeout {
                    seconds: self.timeout.as_secs(),
                }
                .into());
            }
        };
        parse_response(&response)
    }
}

fn header(dialect: SourceDialect) -> String {
    let mut prompt = String::from(
        "You translate trading strategies into a strict JSON strategy document.\n\n",
    );
    prompt.push_str(&format!(
        "The input is written in {} ({}).\n\n",
        dialect.description(),
        dialect.as_str()
    ));

    prompt.push_str("Output exactly one JSON object with this shape:\n");
    prompt.push_str(SCHEMA);
    prompt.push_str("\n\nIndicator functions (params with defaults; output fields):\n");
    for spec in VOCABULARY {
        let params = if spec.params.is_empty() {
            "no params".to_string()
        } else {
            spec.params
                .iter()
                .map(|(name, default)| format!("{name}={default}"))
                .collect::<Vec<_>>()
                .join(", ")
        };
        prompt.push_str(&format!(
            "  {:<7} {}; fields: {} ({})\n",
            spec.name,
            params,
            spec.fields.join(", "),
            spec.description
        ));
    }
    prompt.push('\n');
    prompt.push_str(GRAMMAR);
    prompt.push_str("\n\n");
    prompt.push_str(SIZING_RULES);
    prompt.push_str(
        "\n\nRules:\n\
         - Declare every indicator a signal uses; ids are lowercase identifiers.\n\
         - At least one entry signal. Omit (or set null) signals the strategy does not use.\n\
         - An exit signal needs its matching entry signal.\n\
         - Output only the JSON, no explanations.\n",
    );
    prompt
}

fn request_block(request: &StrategyRequest) -> String {
    format!(
        "Instrument: {} on {} bars, {} to {}.\n\nStrategy:\n{}\n",
        request.symbol(),
        request.timeframe(),
        request.start(),
        request.end(),
        request.text()
    )
}

pub fn translation_prompt(request: &StrategyRequest, dialect: SourceDialect) -> String {
    let mut prompt = header(dialect);
    prompt.push('\n');
    prompt.push_str(&request_block(request));
    prompt
}

pub fn repair_prompt(
    request: &StrategyRequest,
    dialect: SourceDialect,
    context: RepairContext<'_>,
) -> String {
    let mut prompt = header(dialect);
    prompt.push('\n');
    prompt.push_str(&request_block(request));

    prompt.push_str("\nThe previous translation failed. Fix the specific problem below and return the corrected document.\n");
    if let Some(doc) = context.prior_dsl {
        prompt.push_str("\nPrevious document:\n");
        prompt.push_str(&doc.to_pretty_json());
        prompt.push('\n');
    }
    if let Some(artifact) = context.prior_artifact {
        prompt.push_str("\nCompiled program:\n");
        prompt.push_str(&artifact.code);
        if !artifact.code.ends_with('\n') {
            prompt.push('\n');
        }
    }

    let failure = context.failure;
    prompt.push_str(&format!("\nError category: {}\n", failure.category()));
    prompt.push_str(&format!("Error: {failure}\n"));
    match failure {
        StageFailure::Execution(e) => {
            if let Some(fragment) = &e.fragment {
                prompt.push_str(&format!("Offending fragment:\n{fragment}\n"));
            }
            let diagnostic = e.diagnostic.trim();
            if !diagnostic.is_empty() {
                prompt.push_str("Diagnostic output:\n");
                prompt.push_str(&truncate(diagnostic, MAX_DIAGNOSTIC_CHARS));
                prompt.push('\n');
            }
        }
        StageFailure::Validation(e) => {
            prompt.push_str(&format!("Location: {}\n", e.location));
        }
        StageFailure::Translation(TranslationError::Unparsable { excerpt, .. }) => {
            prompt.push_str(&format!("Previous response began with:\n{excerpt}\n"));
        }
        StageFailure::Translation(_) | StageFailure::Compilation(_) => {}
    }
    prompt
}

/// The outermost `{...}` of a model response, with markdown fences and any
/// surrounding prose removed.
pub(crate) fn json_object(response: &str) -> Option<&str> {
    let cleaned = response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```JSON")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    match (cleaned.find('{'), cleaned.rfind('}')) {
        (Some(start), Some(end)) if start < end => Some(&cleaned[start..=end]),
        _ => None,
    }
}

pub fn parse_response(response: &str) -> Result<DslDocument, TranslationError> {
    let Some(json) = json_object(response) else {
        return Err(TranslationError::Unparsable {
            reason: "response contains no JSON object".into(),
            excerpt: truncate(response.trim(), MAX_EXCERPT_CHARS),
        });
    };

    serde_json::from_str(json).map_err(|e| TranslationError::Unparsable {
        reason: e.to_string(),
        excerpt: truncate(json, MAX_EXCERPT_CHARS),
    })
}

pub(crate) fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
