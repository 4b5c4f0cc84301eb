//! Rule AST for the engine's rule language.
//!
//! - `Operand`: What can be compared (price fields, constants, indicators)
//! - `IndicatorRef`: Reference to an indicator with a specific field
//! - `IndicatorField`: Which field of a multi-value indicator to use
//! - `Rule`: Comparisons, boolean composites and the constant rules
//!
//! `Display` renders the exact text [`crate::domain::rule_parser::parse`]
//! accepts, so a rule survives a trip through a strategy program.

use std::collections::BTreeSet;
use std::fmt;

use crate::domain::indicator::{bollinger_multiplier, IndicatorType};

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Open,
    High,
    Low,
    Close,
    Volume,
    Constant(f64),
    Indicator(IndicatorRef),
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorRef {
    pub indicator_type: IndicatorType,
    pub field: IndicatorField,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndicatorField {
    Value,
    MacdLine,
    MacdSignal,
    MacdHistogram,
    StochasticK,
    StochasticD,
    BollingerUpper,
    BollingerMiddle,
    BollingerLower,
    PlusDi,
    MinusDi,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Rule {
    CrossAbove { left: Operand, right: Operand },
    CrossBelow { left: Operand, right: Operand },
    Above { left: Operand, right: Operand },
    Below { left: Operand, right: Operand },
    Equals { left: Operand, right: Operand },
    And(Vec<Rule>),
    Or(Vec<Rule>),
    Not(Box<Rule>),
    Always,
    Never,
}

impl IndicatorRef {
    pub fn value(indicator_type: IndicatorType) -> Self {
        Self {
            indicator_type,
            field: IndicatorField::Value,
        }
    }
}

impl Rule {
    /// Every indicator the rule reads, deduplicated and ordered.
    pub fn indicators(&self) -> BTreeSet<IndicatorType> {
        let mut out = BTreeSet::new();
        self.collect_indicators(&mut out);
        out
    }

    fn collect_indicators(&self, out: &mut BTreeSet<IndicatorType>) {
        match self {
            Rule::CrossAbove { left, right }
            | Rule::CrossBelow { left, right }
            | Rule::Above { left, right }
            | Rule::Below { left, right }
            | Rule::Equals { left, right } => {
                for operand in [left, right] {
                    if let Operand::Indicator(iref) = operand {
                        out.insert(iref.indicator_type.clone());
                    }
                }
            }
            Rule::And(rules) | Rule::Or(rules) => {
                rules.iter().for_each(|r| r.collect_indicators(out))
            }
            Rule::Not(inner) => inner.collect_indicators(out),
            Rule::Always | Rule::Never => {}
        }
    }
}

impl fmt::Display for IndicatorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use IndicatorField as F;
        match (&self.indicator_type, self.field) {
            (IndicatorType::Macd { fast, slow, signal }, field) => {
                let name = match field {
                    F::MacdSignal => "MACD_SIGNAL",
                    F::MacdHistogram => "MACD_HISTOGRAM",
                    _ => "MACD_LINE",
                };
                write!(f, "{name}({fast},{slow},{signal})")
            }
            (IndicatorType::Stochastic { k_period, d_period }, field) => {
                let name = match field {
                    F::StochasticD => "STOCHASTIC_D",
                    _ => "STOCHASTIC_K",
                };
                write!(f, "{name}({k_period},{d_period})")
            }
            (
                IndicatorType::Bollinger {
                    period,
                    stddev_mult_x100,
                },
                field,
            ) => {
                let name = match field {
                    F::BollingerUpper => "BOLLINGER_UPPER",
                    F::BollingerLower => "BOLLINGER_LOWER",
                    _ => "BOLLINGER_MIDDLE",
                };
                write!(f, "{name}({period},{})", bollinger_multiplier(*stddev_mult_x100))
            }
            (IndicatorType::Adx(period), F::PlusDi) => write!(f, "ADX_PLUS_DI({period})"),
            (IndicatorType::Adx(period), F::MinusDi) => write!(f, "ADX_MINUS_DI({period})"),
            (other, _) => write!(f, "{other}"),
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Open => f.write_str("open"),
            Operand::High => f.write_str("high"),
            Operand::Low => f.write_str("low"),
            Operand::Close => f.write_str("close"),
            Operand::Volume => f.write_str("volume"),
            Operand::Constant(v) => write!(f, "{v}"),
            Operand::Indicator(iref) => write!(f, "{iref}"),
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pair = |f: &mut fmt::Formatter<'_>, name: &str, l: &Operand, r: &Operand| {
            write!(f, "{name}({l}, {r})")
        };
        let list = |f: &mut fmt::Formatter<'_>, name: &str, rules: &[Rule]| {
            write!(f, "{name}(")?;
            for (i, rule) in rules.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{rule}")?;
            }
            f.write_str(")")
        };
        match self {
            Rule::CrossAbove { left, right } => pair(f, "CROSS_ABOVE", left, right),
            Rule::CrossBelow { left, right } => pair(f, "CROSS_BELOW", left, right),
            Rule::Above { left, right } => pair(f, "ABOVE", left, right),
            Rule::Below { left, right } => pair(f, "BELOW", left, right),
            Rule::Equals { left, right } => pair(f, "EQUALS", left, right),
            Rule::And(rules) => list(f, "AND", rules),
            Rule::Or(rules) => list(f, "OR", rules),
            Rule::Not(inner) => write!(f, "NOT({inner})"),
            Rule::Always => f.write_str("ALWAYS"),
            Rule::Never => f.write_str("NEVER"),
        }
    }
}
