//! DSL validation, first violation wins.
//!
//! Stages run in order: schema, indicator-reference closure, numeric
//! ranges, logical well-formedness of the signal expressions. Only
//! [`validate`] can produce a [`ValidatedDsl`].

use std::collections::HashMap;

use crate::domain::content_hash::ContentHash;
use crate::domain::dsl::expr::{self, Expr};
use crate::domain::dsl::{lookup_function, DslDocument, FunctionSpec, SizingSpec};
use crate::domain::error::{ValidationError, ValidationStage};

pub const MIN_PERIOD: f64 = 1.0;
pub const MAX_PERIOD: f64 = 500.0;
pub const MAX_BBANDS_STD: f64 = 10.0;
pub const MAX_TAKE_PROFIT_PCT: f64 = 1000.0;
pub const MAX_ATR_MULTIPLE: f64 = 20.0;

/// Parameters that are bar counts.
const PERIOD_PARAMS: &[&str] = &["period", "fast", "slow", "signal", "k", "d"];

/// A document that passed every validation stage, with its parsed signals.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedDsl {
    document: DslDocument,
    signals: Vec<(&'static str, Expr)>,
    hash: ContentHash,
}

impl ValidatedDsl {
    pub fn document(&self) -> &DslDocument {
        &self.document
    }

    pub fn signals(&self) -> impl Iterator<Item = (&'static str, &Expr)> {
        self.signals.iter().map(|(name, expr)| (*name, expr))
    }

    pub fn signal(&self, name: &str) -> Option<&Expr> {
        self.signals().find(|(n, _)| *n == name).map(|(_, e)| e)
    }

    pub fn content_hash(&self) -> &ContentHash {
        &self.hash
    }

    pub fn into_document(self) -> DslDocument {
        self.document
    }
}

pub fn validate(doc: &DslDocument) -> Result<ValidatedDsl, ValidationError> {
    let functions = check_schema(doc)?;
    check_references(doc, &functions)?;
    check_ranges(doc, &functions)?;
    let signals = check_logic(doc)?;

    Ok(ValidatedDsl {
        document: doc.clone(),
        signals,
        hash: doc.content_hash(),
    })
}

fn schema(location: impl Into<String>, message: impl Into<String>) -> ValidationError {
    ValidationError::new(ValidationStage::Schema, location, message)
}

fn closure(location: impl Into<String>, message: impl Into<String>) -> ValidationError {
    ValidationError::new(ValidationStage::ReferenceClosure, location, message)
}

fn range(location: impl Into<String>, message: impl Into<String>) -> ValidationError {
    ValidationError::new(ValidationStage::NumericRange, location, message)
}

fn logic(location: impl Into<String>, message: impl Into<String>) -> ValidationError {
    ValidationError::new(ValidationStage::Logic, location, message)
}

fn is_identifier(id: &str) -> bool {
    let mut chars = id.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Declared ids mapped to their function.
fn check_schema(doc: &DslDocument) -> Result<HashMap<&str, &'static FunctionSpec>, ValidationError> {
    if doc.name.trim().is_empty() {
        return Err(schema("name", "strategy name must not be empty"));
    }

    let mut functions = HashMap::new();
    for (i, decl) in doc.indicators.iter().enumerate() {
        let location = format!("indicators[{i}]");
        if !is_identifier(&decl.id) {
            return Err(schema(
                location,
                format!("id '{}' must match [a-z_][a-z0-9_]*", decl.id),
            ));
        }
        if expr::is_reserved(&decl.id) {
            return Err(schema(location, format!("id '{}' is a reserved word", decl.id)));
        }
        let Some(spec) = lookup_function(&decl.function) else {
            return Err(schema(
                location,
                format!("unknown indicator function '{}'", decl.function),
            ));
        };
        for (key, value) in &decl.params {
            if !spec.params.iter().any(|(name, _)| name == key) {
                let known: Vec<&str> = spec.params.iter().map(|(name, _)| *name).collect();
                return Err(schema(
                    format!("{location}.params.{key}"),
                    format!("{} takes no parameter '{key}' (known: {})", spec.name, known.join(", ")),
                ));
            }
            if !value.as_f64().is_some_and(f64::is_finite) {
                return Err(schema(
                    format!("{location}.params.{key}"),
                    format!("parameter must be a number, got {value}"),
                ));
            }
        }
        if functions.insert(decl.id.as_str(), spec).is_some() {
            return Err(schema(location, format!("duplicate indicator id '{}'", decl.id)));
        }
    }

    let signals = &doc.signals;
    let has_entry = signals
        .iter()
        .any(|(name, _)| name == "entry_long" || name == "entry_short");
    if !has_entry {
        return Err(schema("signals", "at least one entry signal is required"));
    }

    let numbers: Vec<(&str, f64)> = sizing_numbers(&doc.sizing)
        .into_iter()
        .chain([
            ("risk.stop_loss_pct", doc.risk.stop_loss_pct),
            ("risk.take_profit_pct", doc.risk.take_profit_pct),
            ("risk.max_position_pct", Some(doc.risk.max_position_pct)),
        ])
        .filter_map(|(field, value)| value.map(|v| (field, v)))
        .collect();
    if let Some((field, value)) = numbers.iter().find(|(_, v)| !v.is_finite()) {
        return Err(schema(*field, format!("{value} is not a finite number")));
    }

    Ok(functions)
}

fn sizing_numbers(sizing: &SizingSpec) -> Vec<(&'static str, Option<f64>)> {
    match sizing {
        SizingSpec::Fixed { quantity } => vec![("sizing.quantity", Some(*quantity))],
        SizingSpec::PercentEquity { percent } => vec![("sizing.percent", Some(*percent))],
        SizingSpec::RiskBased {
            risk_pct,
            atr_multiple,
            ..
        } => vec![
            ("sizing.risk_pct", Some(*risk_pct)),
            ("sizing.atr_multiple", *atr_multiple),
        ],
    }
}

fn check_references(
    doc: &DslDocument,
    functions: &HashMap<&str, &'static FunctionSpec>,
) -> Result<(), ValidationError> {
    for (name, text) in doc.signals.iter() {
        let location = format!("signals.{name}");
        for reference in expr::references(text) {
            let Some(spec) = functions.get(reference.id.as_str()) else {
                return Err(closure(
                    location,
                    format!("'{}' is not a declared indicator", reference.id),
                ));
            };
            if let Some(field) = &reference.field {
                if !spec.has_field(field) {
                    return Err(closure(
                        location,
                        format!(
                            "{} indicator '{}' has no field '{field}' (expected {})",
                            spec.name,
                            reference.id,
                            spec.fields.join(", ")
                        ),
                    ));
                }
            }
        }
    }

    if let SizingSpec::RiskBased { atr: Some(atr), .. } = &doc.sizing {
        match functions.get(atr.as_str()) {
            None => {
                return Err(closure(
                    "sizing.atr",
                    format!("'{atr}' is not a declared indicator"),
                ))
            }
            Some(spec) if spec.name != "ATR" => {
                return Err(closure(
                    "sizing.atr",
                    format!("'{atr}' must be an ATR indicator, not {}", spec.name),
                ))
            }
            Some(_) => {}
        }
    }
    Ok(())
}

fn in_range(value: f64, low: f64, high: f64, low_inclusive: bool, high_inclusive: bool) -> bool {
    let above = if low_inclusive { value >= low } else { value > low };
    let below = if high_inclusive { value <= high } else { value < high };
    above && below
}

fn check_ranges(
    doc: &DslDocument,
    functions: &HashMap<&str, &'static FunctionSpec>,
) -> Result<(), ValidationError> {
    for (i, decl) in doc.indicators.iter().enumerate() {
        let Some(spec) = functions.get(decl.id.as_str()) else {
            continue;
        };
        for (key, value) in &decl.params {
            let location = format!("indicators[{i}].params.{key}");
            let value = value.as_f64().unwrap_or(f64::NAN);
            if PERIOD_PARAMS.contains(&key.as_str())
                && (value.fract() != 0.0 || !in_range(value, MIN_PERIOD, MAX_PERIOD, true, true))
            {
                return Err(range(
                    location,
                    format!("period must be a whole number in {MIN_PERIOD}..={MAX_PERIOD}, got {value}"),
                ));
            }
            if key == "std" && !in_range(value, 0.0, MAX_BBANDS_STD, false, true) {
                return Err(range(
                    location,
                    format!("std must be in (0, {MAX_BBANDS_STD}], got {value}"),
                ));
            }
        }
        if spec.name == "MACD" {
            let fast = spec.param(&decl.params, "fast").unwrap_or_default();
            let slow = spec.param(&decl.params, "slow").unwrap_or_default();
            if fast >= slow {
                return Err(range(
                    format!("indicators[{i}].params"),
                    format!("MACD fast period ({fast}) must be below slow period ({slow})"),
                ));
            }
        }
    }

    let risk = &doc.risk;
    if let Some(stop) = risk.stop_loss_pct {
        if !in_range(stop, 0.0, 100.0, false, false) {
            return Err(range("risk.stop_loss_pct", format!("must be in (0, 100), got {stop}")));
        }
    }
    if let Some(target) = risk.take_profit_pct {
        if !in_range(target, 0.0, MAX_TAKE_PROFIT_PCT, false, true) {
            return Err(range(
                "risk.take_profit_pct",
                format!("must be in (0, {MAX_TAKE_PROFIT_PCT}], got {target}"),
            ));
        }
    }
    if !in_range(risk.max_position_pct, 0.0, 100.0, false, true) {
        return Err(range(
            "risk.max_position_pct",
            format!("must be in (0, 100], got {}", risk.max_position_pct),
        ));
    }

    match &doc.sizing {
        SizingSpec::Fixed { quantity } if *quantity <= 0.0 => Err(range(
            "sizing.quantity",
            format!("position size must be positive, got {quantity}"),
        )),
        SizingSpec::PercentEquity { percent } if !in_range(*percent, 0.0, 100.0, false, true) => {
            Err(range("sizing.percent", format!("must be in (0, 100], got {percent}")))
        }
        SizingSpec::RiskBased {
            risk_pct,
            atr,
            atr_multiple,
        } => {
            if !in_range(*risk_pct, 0.0, 100.0, false, true) {
                return Err(range("sizing.risk_pct", format!("must be in (0, 100], got {risk_pct}")));
            }
            if let Some(multiple) = atr_multiple {
                if !in_range(*multiple, 0.0, MAX_ATR_MULTIPLE, false, true) {
                    return Err(range(
                        "sizing.atr_multiple",
                        format!("must be in (0, {MAX_ATR_MULTIPLE}], got {multiple}"),
                    ));
                }
            }
            if atr.is_none() && risk.stop_loss_pct.is_none() {
                return Err(range(
                    "sizing",
                    "risk-based sizing needs a stop-loss or an ATR reference",
                ));
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn check_logic(doc: &DslDocument) -> Result<Vec<(&'static str, Expr)>, ValidationError> {
    let mut parsed = Vec::new();
    for (name, text) in doc.signals.iter() {
        let expr = expr::parse(text).map_err(|err| logic(format!("signals.{name}"), err.to_string()))?;
        parsed.push((name, expr));
    }

    let present = |name: &str| parsed.iter().any(|(n, _)| *n == name);
    for (exit, entry) in [("exit_long", "entry_long"), ("exit_short", "entry_short")] {
        if present(exit) && !present(entry) {
            return Err(logic(
                format!("signals.{exit}"),
                format!("{exit} refers to a position that never opens (no {entry})"),
            ));
        }
    }
    Ok(parsed)
}
