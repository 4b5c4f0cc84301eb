//! Lowering of validated DSL documents into strategy programs.
//!
//! Each declared indicator becomes an engine primitive (`EMA(20)`,
//! `MACD_SIGNAL(12,26,9)`, ...), each signal expression becomes a rule and
//! sizing / risk become the `[sizing]` and `[risk]` sections. The output
//! depends only on the document, so equal documents compile to byte-equal
//! programs.

use std::collections::HashMap;
use std::fmt::Write;

use serde::{Deserialize, Serialize};

use crate::domain::content_hash::ContentHash;
use crate::domain::dsl::expr::{CompareOp, CrossDirection, Expr, PriceField, Value};
use crate::domain::dsl::{lookup_function, IndicatorDecl, SizingSpec};
use crate::domain::error::CompilationError;
use crate::domain::indicator::IndicatorType;
use crate::domain::rule::{IndicatorField, IndicatorRef, Operand, Rule};
use crate::domain::validator::ValidatedDsl;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledArtifact {
    pub code: String,
    /// Content hash of the DSL document the code was compiled from.
    pub source_hash: ContentHash,
    pub hash: ContentHash,
}

fn no_lowering(construct: impl Into<String>) -> CompilationError {
    CompilationError {
        construct: construct.into(),
    }
}

pub fn compile(dsl: &ValidatedDsl) -> Result<CompiledArtifact, CompilationError> {
    let doc = dsl.document();

    let mut declared = HashMap::new();
    for decl in &doc.indicators {
        declared.insert(decl.id.as_str(), lower_indicator(decl)?);
    }

    // Writing to a String cannot fail.
    let mut code = String::new();
    let _ = writeln!(code, "; stratforge strategy program");
    let _ = writeln!(code, "; source {}", dsl.content_hash());
    let _ = writeln!(code, "[strategy]");
    let _ = writeln!(code, "name = {}", ini_safe(&doc.name));
    for (key, expr) in dsl.signals() {
        let rule = lower_expr(expr, &declared)?;
        let _ = writeln!(code, "{key} = {rule}");
    }

    let _ = writeln!(code);
    let _ = writeln!(code, "[sizing]");
    match &doc.sizing {
        SizingSpec::Fixed { quantity } => {
            let _ = writeln!(code, "method = fixed");
            let _ = writeln!(code, "quantity = {quantity}");
        }
        SizingSpec::PercentEquity { percent } => {
            let _ = writeln!(code, "method = percent_equity");
            let _ = writeln!(code, "percent = {percent}");
        }
        SizingSpec::RiskBased {
            risk_pct,
            atr,
            atr_multiple,
        } => {
            let _ = writeln!(code, "method = risk_based");
            let _ = writeln!(code, "risk_pct = {risk_pct}");
            if let Some(id) = atr {
                let atr_ref = declared
                    .get(id.as_str())
                    .filter(|t| matches!(t, IndicatorType::Atr(_)))
                    .ok_or_else(|| no_lowering(format!("sizing atr reference '{id}'")))?;
                let _ = writeln!(code, "atr = {}", IndicatorRef::value(atr_ref.clone()));
            }
            if let Some(multiple) = atr_multiple {
                let _ = writeln!(code, "atr_multiple = {multiple}");
            }
        }
    }

    let risk = &doc.risk;
    let _ = writeln!(code);
    let _ = writeln!(code, "[risk]");
    if let Some(stop) = risk.stop_loss_pct {
        let _ = writeln!(code, "stop_loss = {stop}");
    }
    if let Some(target) = risk.take_profit_pct {
        let _ = writeln!(code, "take_profit = {target}");
    }
    let _ = writeln!(code, "max_position = {}", risk.max_position_pct);

    let hash = ContentHash::of_bytes(code.as_bytes());
    tracing::debug!(source = dsl.content_hash().short(), artifact = hash.short(), "compiled");
    Ok(CompiledArtifact {
        code,
        source_hash: dsl.content_hash().clone(),
        hash,
    })
}

/// Strip what would end an INI value early.
fn ini_safe(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .map(|c| if c.is_control() || c == ';' || c == '#' { ' ' } else { c })
        .collect();
    cleaned.trim().to_string()
}

fn period(value: Option<f64>, construct: &str) -> Result<usize, CompilationError> {
    match value {
        Some(v) if v >= 1.0 && v.fract() == 0.0 => Ok(v as usize),
        _ => Err(no_lowering(construct.to_string())),
    }
}

fn lower_indicator(decl: &IndicatorDecl) -> Result<IndicatorType, CompilationError> {
    let spec = lookup_function(&decl.function)
        .ok_or_else(|| no_lowering(format!("indicator function '{}'", decl.function)))?;
    let construct = format!("{} parameters of '{}'", spec.name, decl.id);
    let p = |name: &str| period(spec.param(&decl.params, name), &construct);

    Ok(match spec.name {
        "SMA" => IndicatorType::Sma(p("period")?),
        "EMA" => IndicatorType::Ema(p("period")?),
        "WMA" => IndicatorType::Wma(p("period")?),
        "RSI" => IndicatorType::Rsi(p("period")?),
        "ROC" => IndicatorType::Roc(p("period")?),
        "ATR" => IndicatorType::Atr(p("period")?),
        "STDDEV" => IndicatorType::Stddev(p("period")?),
        "ADX" => IndicatorType::Adx(p("period")?),
        "OBV" => IndicatorType::Obv,
        "VWAP" => IndicatorType::Vwap,
        "MACD" => IndicatorType::Macd {
            fast: p("fast")?,
            slow: p("slow")?,
            signal: p("signal")?,
        },
        "STOCH" => IndicatorType::Stochastic {
            k_period: p("k")?,
            d_period: p("d")?,
        },
        "BBANDS" => {
            let std = spec
                .param(&decl.params, "std")
                .filter(|s| *s > 0.0)
                .ok_or_else(|| no_lowering(construct.clone()))?;
            IndicatorType::Bollinger {
                period: p("period")?,
                stddev_mult_x100: (std * 100.0).round() as u32,
            }
        }
        other => return Err(no_lowering(format!("indicator function '{other}'"))),
    })
}

fn lower_field(
    indicator_type: &IndicatorType,
    field: Option<&str>,
) -> Result<IndicatorField, CompilationError> {
    use IndicatorField as F;
    let field_name = field.unwrap_or("");
    let lowered = match (indicator_type, field) {
        (IndicatorType::Macd { .. }, None | Some("line")) => F::MacdLine,
        (IndicatorType::Macd { .. }, Some("signal")) => F::MacdSignal,
        (IndicatorType::Macd { .. }, Some("histogram")) => F::MacdHistogram,
        (IndicatorType::Stochastic { .. }, None | Some("k")) => F::StochasticK,
        (IndicatorType::Stochastic { .. }, Some("d")) => F::StochasticD,
        (IndicatorType::Bollinger { .. }, None | Some("middle")) => F::BollingerMiddle,
        (IndicatorType::Bollinger { .. }, Some("upper")) => F::BollingerUpper,
        (IndicatorType::Bollinger { .. }, Some("lower")) => F::BollingerLower,
        (IndicatorType::Adx(_), Some("plus_di")) => F::PlusDi,
        (IndicatorType::Adx(_), Some("minus_di")) => F::MinusDi,
        (
            IndicatorType::Macd { .. } | IndicatorType::Stochastic { .. } | IndicatorType::Bollinger { .. },
            Some(_),
        ) => return Err(no_lowering(format!("field '{field_name}' of {indicator_type}"))),
        (_, None | Some("value")) => F::Value,
        (_, Some(_)) => return Err(no_lowering(format!("field '{field_name}' of {indicator_type}"))),
    };
    Ok(lowered)
}

fn lower_value(
    value: &Value,
    declared: &HashMap<&str, IndicatorType>,
) -> Result<Operand, CompilationError> {
    Ok(match value {
        Value::Number(n) => Operand::Constant(*n),
        Value::Price(PriceField::Open) => Operand::Open,
        Value::Price(PriceField::High) => Operand::High,
        Value::Price(PriceField::Low) => Operand::Low,
        Value::Price(PriceField::Close) => Operand::Close,
        Value::Price(PriceField::Volume) => Operand::Volume,
        Value::Ref(reference) => {
            let indicator_type = declared
                .get(reference.id.as_str())
                .ok_or_else(|| no_lowering(format!("indicator reference '{}'", reference.id)))?;
            Operand::Indicator(IndicatorRef {
                indicator_type: indicator_type.clone(),
                field: lower_field(indicator_type, reference.field.as_deref())?,
            })
        }
    })
}

fn lower_expr(expr: &Expr, declared: &HashMap<&str, IndicatorType>) -> Result<Rule, CompilationError> {
    let operands = |left: &Value, right: &Value| -> Result<(Operand, Operand), CompilationError> {
        Ok((lower_value(left, declared)?, lower_value(right, declared)?))
    };

    Ok(match expr {
        Expr::Literal(true) => Rule::Always,
        Expr::Literal(false) => Rule::Never,
        Expr::Cross {
            direction,
            left,
            right,
        } => {
            let (left, right) = operands(left, right)?;
            match direction {
                CrossDirection::Above => Rule::CrossAbove { left, right },
                CrossDirection::Below => Rule::CrossBelow { left, right },
            }
        }
        Expr::Compare { op, left, right } => {
            let (left, right) = operands(left, right)?;
            match op {
                CompareOp::Gt => Rule::Above { left, right },
                CompareOp::Lt => Rule::Below { left, right },
                CompareOp::Eq => Rule::Equals { left, right },
                CompareOp::Ge => Rule::Not(Box::new(Rule::Below { left, right })),
                CompareOp::Le => Rule::Not(Box::new(Rule::Above { left, right })),
                CompareOp::Ne => Rule::Not(Box::new(Rule::Equals { left, right })),
            }
        }
        Expr::And(terms) => Rule::And(flatten(terms, declared, true)?),
        Expr::Or(terms) => Rule::Or(flatten(terms, declared, false)?),
        Expr::Not(inner) => Rule::Not(Box::new(lower_expr(inner, declared)?)),
    })
}

/// Lower `terms`, splicing nested chains of the same connective.
fn flatten(
    terms: &[Expr],
    declared: &HashMap<&str, IndicatorType>,
    conjunction: bool,
) -> Result<Vec<Rule>, CompilationError> {
    let mut out = Vec::with_capacity(terms.len());
    for term in terms {
        match (lower_expr(term, declared)?, conjunction) {
            (Rule::And(inner), true) | (Rule::Or(inner), false) => out.extend(inner),
            (rule, _) => out.push(rule),
        }
    }
    Ok(out)
}
