//! The strategy DSL: the structured document the translator produces and
//! the validator checks.
//!
//! ```json
//! {
//!   "name": "RSI reversal",
//!   "indicators": [{ "id": "rsi_14", "function": "RSI", "params": { "period": 14 } }],
//!   "signals": { "entry_long": "rsi_14 < 30", "exit_long": "rsi_14 > 70" },
//!   "sizing": { "method": "percent_equity", "percent": 95 },
//!   "risk": { "stop_loss_pct": 5, "max_position_pct": 100 }
//! }
//! ```

pub mod expr;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::content_hash::ContentHash;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DslDocument {
    pub name: String,
    #[serde(default)]
    pub indicators: Vec<IndicatorDecl>,
    #[serde(default)]
    pub signals: Signals,
    #[serde(default)]
    pub sizing: SizingSpec,
    #[serde(default)]
    pub risk: RiskSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndicatorDecl {
    pub id: String,
    pub function: String,
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Signals {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_long: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_long: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_short: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_short: Option<String>,
}

impl Signals {
    /// Present, non-blank signals with their field names.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [
            ("entry_long", &self.entry_long),
            ("exit_long", &self.exit_long),
            ("entry_short", &self.entry_short),
            ("exit_short", &self.exit_short),
        ]
        .into_iter()
        .filter_map(|(name, text)| {
            text.as_deref()
                .filter(|t| !t.trim().is_empty())
                .map(|t| (name, t))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SizingSpec {
    Fixed {
        quantity: f64,
    },
    PercentEquity {
        percent: f64,
    },
    RiskBased {
        risk_pct: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        atr: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        atr_multiple: Option<f64>,
    },
}

impl Default for SizingSpec {
    fn default() -> Self {
        SizingSpec::PercentEquity { percent: 95.0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RiskSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit_pct: Option<f64>,
    #[serde(default = "default_max_position")]
    pub max_position_pct: f64,
}

fn default_max_position() -> f64 {
    100.0
}

impl Default for RiskSpec {
    fn default() -> Self {
        RiskSpec {
            stop_loss_pct: None,
            take_profit_pct: None,
            max_position_pct: default_max_position(),
        }
    }
}

impl DslDocument {
    /// BLAKE3 of the canonical JSON form.
    pub fn content_hash(&self) -> ContentHash {
        // A document only holds strings, numbers and ordered maps.
        ContentHash::of_json(self).unwrap_or_else(|_| ContentHash::of_bytes(self.name.as_bytes()))
    }

    pub fn to_pretty_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

/// An indicator function the DSL accepts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FunctionSpec {
    pub name: &'static str,
    /// Parameter names with their defaults.
    pub params: &'static [(&'static str, f64)],
    /// Selectable output fields; the first is used when none is named.
    pub fields: &'static [&'static str],
    pub description: &'static str,
}

impl FunctionSpec {
    pub fn param(&self, params: &BTreeMap<String, serde_json::Value>, name: &str) -> Option<f64> {
        params
            .get(name)
            .and_then(|v| v.as_f64())
            .or_else(|| self.params.iter().find(|(p, _)| *p == name).map(|(_, d)| *d))
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.fields.contains(&field)
    }
}

const VALUE: &[&str] = &["value"];
const PERIOD_14: &[(&str, f64)] = &[("period", 14.0)];
const PERIOD_20: &[(&str, f64)] = &[("period", 20.0)];

pub const VOCABULARY: &[FunctionSpec] = &[
    FunctionSpec {
        name: "SMA",
        params: PERIOD_20,
        fields: VALUE,
        description: "simple moving average of close",
    },
    FunctionSpec {
        name: "EMA",
        params: PERIOD_20,
        fields: VALUE,
        description: "exponential moving average of close",
    },
    FunctionSpec {
        name: "WMA",
        params: PERIOD_20,
        fields: VALUE,
        description: "linearly weighted moving average of close",
    },
    FunctionSpec {
        name: "RSI",
        params: PERIOD_14,
        fields: VALUE,
        description: "relative strength index, 0..100",
    },
    FunctionSpec {
        name: "ROC",
        params: &[("period", 10.0)],
        fields: VALUE,
        description: "rate of change of close in percent",
    },
    FunctionSpec {
        name: "ATR",
        params: PERIOD_14,
        fields: VALUE,
        description: "average true range",
    },
    FunctionSpec {
        name: "STDDEV",
        params: PERIOD_20,
        fields: VALUE,
        description: "rolling standard deviation of close",
    },
    FunctionSpec {
        name: "OBV",
        params: &[],
        fields: VALUE,
        description: "on-balance volume",
    },
    FunctionSpec {
        name: "VWAP",
        params: &[],
        fields: VALUE,
        description: "cumulative volume-weighted average price",
    },
    FunctionSpec {
        name: "MACD",
        params: &[("fast", 12.0), ("slow", 26.0), ("signal", 9.0)],
        fields: &["line", "signal", "histogram"],
        description: "moving average convergence divergence",
    },
    FunctionSpec {
        name: "STOCH",
        params: &[("k", 14.0), ("d", 3.0)],
        fields: &["k", "d"],
        description: "stochastic oscillator %K / %D, 0..100",
    },
    FunctionSpec {
        name: "BBANDS",
        params: &[("period", 20.0), ("std", 2.0)],
        fields: &["middle", "upper", "lower"],
        description: "Bollinger bands",
    },
    FunctionSpec {
        name: "ADX",
        params: PERIOD_14,
        fields: &["value", "plus_di", "minus_di"],
        description: "average directional index with +DI / -DI",
    },
];

/// Look up a function by name, ignoring case.
pub fn lookup_function(name: &str) -> Option<&'static FunctionSpec> {
    VOCABULARY
        .iter()
        .find(|spec| spec.name.eq_ignore_ascii_case(name.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_document_gets_defaults() {
        let doc: DslDocument = serde_json::from_str(
            r#"{"name": "Buy and hold", "signals": {"entry_long": "true"}}"#,
        )
        .unwrap();
        assert!(doc.indicators.is_empty());
        assert_eq!(doc.sizing, SizingSpec::PercentEquity { percent: 95.0 });
        assert_eq!(doc.risk.max_position_pct, 100.0);
        assert_eq!(doc.signals.iter().count(), 1);
    }

    #[test]
    fn sizing_is_tagged_by_method() {
        let doc: DslDocument = serde_json::from_str(
            r#"{"name": "x", "sizing": {"method": "risk_based", "risk_pct": 1, "atr": "atr_14"}}"#,
        )
        .unwrap();
        assert_eq!(
            doc.sizing,
            SizingSpec::RiskBased {
                risk_pct: 1.0,
                atr: Some("atr_14".into()),
                atr_multiple: None,
            }
        );
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = serde_json::from_str::<DslDocument>(r#"{"name": "x", "leverage": 10}"#);
        assert!(err.is_err());
    }

    #[test]
    fn hash_tracks_content() {
        let doc: DslDocument = serde_json::from_str(
            r#"{"name": "x", "indicators": [{"id": "a", "function": "SMA", "params": {"period": 5}}]}"#,
        )
        .unwrap();
        let mut changed = doc.clone();
        assert_eq!(doc.content_hash(), changed.content_hash());
        changed.indicators[0].params.insert("period".into(), 6.into());
        assert_ne!(doc.content_hash(), changed.content_hash());
    }

    #[test]
    fn blank_signals_are_skipped() {
        let signals = Signals {
            entry_long: Some("close > 1".into()),
            exit_long: Some("   ".into()),
            ..Default::default()
        };
        let names: Vec<_> = signals.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["entry_long"]);
    }

    #[test]
    fn vocabulary_lookup() {
        let macd = lookup_function("macd").unwrap();
        assert_eq!(macd.name, "MACD");
        assert!(macd.has_field("histogram"));
        assert_eq!(macd.param(&BTreeMap::new(), "slow"), Some(26.0));
        assert!(lookup_function("ICHIMOKU").is_none());
    }
}
