//! Strategy programs: the INI documents the compiler emits and the engine runs.
//!
//! ```ini
//! [strategy]
//! name = EMA crossover
//! entry_long = CROSS_ABOVE(EMA(12), EMA(26))
//! exit_long = CROSS_BELOW(EMA(12), EMA(26))
//!
//! [sizing]
//! method = risk_based
//! risk_pct = 1
//! atr = ATR(14)
//! atr_multiple = 2
//!
//! [risk]
//! stop_loss = 2
//! max_position = 100
//! ```

use std::collections::BTreeSet;

use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::domain::error::ProgramError;
use crate::domain::indicator::IndicatorType;
use crate::domain::rule::{IndicatorRef, Operand, Rule};
use crate::domain::rule_parser;
use crate::ports::config_port::ConfigPort;

pub const RULE_KEYS: [&str; 4] = ["entry_long", "exit_long", "entry_short", "exit_short"];

#[derive(Debug, Clone, PartialEq)]
pub enum PositionSizing {
    Fixed {
        quantity: f64,
    },
    PercentEquity {
        percent: f64,
    },
    RiskBased {
        risk_pct: f64,
        atr: Option<IndicatorRef>,
        atr_multiple: f64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RiskLimits {
    pub stop_loss_pct: Option<f64>,
    pub take_profit_pct: Option<f64>,
    pub max_position_pct: f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            stop_loss_pct: None,
            take_profit_pct: None,
            max_position_pct: 100.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StrategyProgram {
    pub name: String,
    pub entry_long: Option<Rule>,
    pub exit_long: Option<Rule>,
    pub entry_short: Option<Rule>,
    pub exit_short: Option<Rule>,
    pub sizing: PositionSizing,
    pub risk: RiskLimits,
}

impl StrategyProgram {
    pub fn parse(code: &str) -> Result<Self, ProgramError> {
        let config =
            FileConfigAdapter::from_string(code).map_err(|reason| ProgramError::Syntax { reason })?;
        Self::from_config(&config)
    }

    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, ProgramError> {
        let name = config
            .get_string("strategy", "name")
            .unwrap_or_else(|| "Unnamed".to_string());

        let [entry_long, exit_long, entry_short, exit_short] =
            RULE_KEYS.map(|key| parse_rule_key(config, key));
        let program = StrategyProgram {
            name,
            entry_long: entry_long?,
            exit_long: exit_long?,
            entry_short: entry_short?,
            exit_short: exit_short?,
            sizing: parse_sizing(config)?,
            risk: parse_risk(config)?,
        };

        if program.entry_long.is_none() && program.entry_short.is_none() {
            return Err(invalid("strategy", "entry_long", "no entry rule defined"));
        }
        Ok(program)
    }

    /// Rules present in the program, keyed by their INI key.
    pub fn rules(&self) -> impl Iterator<Item = (&'static str, &Rule)> {
        [
            &self.entry_long,
            &self.exit_long,
            &self.entry_short,
            &self.exit_short,
        ]
        .into_iter()
        .zip(RULE_KEYS)
        .filter_map(|(rule, key)| rule.as_ref().map(|r| (key, r)))
    }

    /// Every indicator the engine must compute, sizing included.
    pub fn indicators(&self) -> BTreeSet<IndicatorType> {
        let mut out: BTreeSet<IndicatorType> =
            self.rules().flat_map(|(_, rule)| rule.indicators()).collect();
        if let PositionSizing::RiskBased { atr: Some(atr), .. } = &self.sizing {
            out.insert(atr.indicator_type.clone());
        }
        out
    }
}

fn invalid(section: &str, key: &str, reason: impl Into<String>) -> ProgramError {
    ProgramError::Invalid {
        section: section.to_string(),
        key: key.to_string(),
        reason: reason.into(),
    }
}

fn parse_rule_key(config: &dyn ConfigPort, key: &str) -> Result<Option<Rule>, ProgramError> {
    let Some(text) = config
        .get_string("strategy", key)
        .filter(|s| !s.trim().is_empty())
    else {
        return Ok(None);
    };
    rule_parser::parse(&text)
        .map(Some)
        .map_err(|source| ProgramError::Rule {
            section: "strategy".to_string(),
            key: key.to_string(),
            text,
            source,
        })
}

fn number(config: &dyn ConfigPort, section: &str, key: &str) -> Result<Option<f64>, ProgramError> {
    match config.get_string(section, key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(Some)
            .ok_or_else(|| invalid(section, key, format!("'{raw}' is not a finite number"))),
    }
}

fn positive(config: &dyn ConfigPort, section: &str, key: &str) -> Result<Option<f64>, ProgramError> {
    match number(config, section, key)? {
        Some(v) if v <= 0.0 => Err(invalid(section, key, format!("must be positive, got {v}"))),
        other => Ok(other),
    }
}

fn parse_sizing(config: &dyn ConfigPort) -> Result<PositionSizing, ProgramError> {
    let method = config
        .get_string("sizing", "method")
        .unwrap_or_else(|| "percent_equity".to_string());

    let required = |key: &str| -> Result<f64, ProgramError> {
        positive(config, "sizing", key)?.ok_or_else(|| invalid("sizing", key, "missing"))
    };

    match method.trim() {
        "fixed" => Ok(PositionSizing::Fixed {
            quantity: required("quantity")?,
        }),
        "percent_equity" => Ok(PositionSizing::PercentEquity {
            percent: positive(config, "sizing", "percent")?.unwrap_or(95.0),
        }),
        "risk_based" => {
            let atr = match config.get_string("sizing", "atr") {
                None => None,
                Some(text) => match rule_parser::parse_operand(&text) {
                    Ok(Operand::Indicator(iref))
                        if matches!(iref.indicator_type, IndicatorType::Atr(_)) =>
                    {
                        Some(iref)
                    }
                    Ok(_) => return Err(invalid("sizing", "atr", "must be an ATR(n) indicator")),
                    Err(source) => {
                        return Err(ProgramError::Rule {
                            section: "sizing".to_string(),
                            key: "atr".to_string(),
                            text,
                            source,
                        })
                    }
                },
            };
            Ok(PositionSizing::RiskBased {
                risk_pct: required("risk_pct")?,
                atr,
                atr_multiple: positive(config, "sizing", "atr_multiple")?.unwrap_or(1.0),
            })
        }
        other => Err(invalid(
            "sizing",
            "method",
            format!("unknown sizing method '{other}'"),
        )),
    }
}

fn parse_risk(config: &dyn ConfigPort) -> Result<RiskLimits, ProgramError> {
    let max_position_pct = positive(config, "risk", "max_position")?.unwrap_or(100.0);
    if max_position_pct > 100.0 {
        return Err(invalid("risk", "max_position", "must not exceed 100"));
    }
    Ok(RiskLimits {
        stop_loss_pct: positive(config, "risk", "stop_loss")?,
        take_profit_pct: positive(config, "risk", "take_profit")?,
        max_position_pct,
    })
}
