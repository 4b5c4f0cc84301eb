//! Source dialect classification.
//!
//! Keyword sets are checked in priority order (Pine, MQL, Python) and the
//! first set with any match wins. Text matching none of them is natural
//! language. Matching is case-insensitive. A marker that starts with a word
//! character only matches at the start of a word, and one that ends with a
//! word character only matches at the end of one, so `ta.` does not fire on
//! "data." and `expert` does not fire on "expertise".

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceDialect {
    #[serde(rename = "pine")]
    PseudoPine,
    #[serde(rename = "mql")]
    PseudoMql,
    #[serde(rename = "python")]
    PseudoPython,
    #[serde(rename = "natural")]
    NaturalLanguage,
}

const PINE_MARKERS: &[&str] = &[
    "//@version",
    "strategy(",
    "strategy.entry",
    "strategy.close",
    "ta.",
    "input(",
    "plot(",
    ":=",
];

const MQL_MARKERS: &[&str] = &[
    "ontick",
    "oninit",
    "ordersend",
    "imovingaverage",
    "irsi(",
    "ima(",
    "expert",
    "#property",
    "positionopen",
];

const PYTHON_MARKERS: &[&str] = &["def ", "import ", "self.", "elif ", "__init__", "print("];

const PRIORITY: [(SourceDialect, &[&str]); 3] = [
    (SourceDialect::PseudoPine, PINE_MARKERS),
    (SourceDialect::PseudoMql, MQL_MARKERS),
    (SourceDialect::PseudoPython, PYTHON_MARKERS),
];

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn contains_marker(text: &str, marker: &str) -> bool {
    let starts_word = marker.chars().next().is_some_and(is_word_char);
    let ends_word = marker.chars().next_back().is_some_and(is_word_char);
    text.match_indices(marker).any(|(at, _)| {
        let before_ok = !starts_word || !text[..at].chars().next_back().is_some_and(is_word_char);
        let after_ok = !ends_word || !text[at + marker.len()..].chars().next().is_some_and(is_word_char);
        before_ok && after_ok
    })
}

pub fn classify(text: &str) -> SourceDialect {
    let lowered = text.to_lowercase();
    PRIORITY
        .iter()
        .find(|(_, markers)| markers.iter().any(|m| contains_marker(&lowered, m)))
        .map_or(SourceDialect::NaturalLanguage, |(dialect, _)| *dialect)
}

impl SourceDialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceDialect::PseudoPine => "pine",
            SourceDialect::PseudoMql => "mql",
            SourceDialect::PseudoPython => "python",
            SourceDialect::NaturalLanguage => "natural",
        }
    }

    /// Human-readable name used in prompts.
    pub fn description(&self) -> &'static str {
        match self {
            SourceDialect::PseudoPine => "Pine Script-like pseudocode",
            SourceDialect::PseudoMql => "MQL-like pseudocode",
            SourceDialect::PseudoPython => "Python-like pseudocode",
            SourceDialect::NaturalLanguage => "natural language",
        }
    }

    /// How a rewritten strategy should be written in this dialect.
    pub fn rewrite_instructions(&self) -> &'static str {
        match self {
            SourceDialect::PseudoPine => {
                "Write the improved strategy as Pine Script-like pseudocode using //@version=5, \
                 strategy(), ta.* indicator calls and strategy.entry / strategy.close orders."
            }
            SourceDialect::PseudoMql => {
                "Write the improved strategy as MQL-like pseudocode with OnInit and OnTick \
                 handlers, iMA / iRSI style indicator calls and explicit order placement."
            }
            SourceDialect::PseudoPython => {
                "Write the improved strategy as Python-like pseudocode with a strategy class, \
                 an __init__ that declares indicators and a next() method holding the rules."
            }
            SourceDialect::NaturalLanguage => {
                "Write the improved strategy as clear natural language, stating each indicator \
                 with its period, the exact entry and exit conditions, position sizing and risk limits."
            }
        }
    }
}

impl fmt::Display for SourceDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceDialect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pine" => Ok(SourceDialect::PseudoPine),
            "mql" => Ok(SourceDialect::PseudoMql),
            "python" => Ok(SourceDialect::PseudoPython),
            "natural" => Ok(SourceDialect::NaturalLanguage),
            other => Err(format!(
                "unknown dialect '{other}' (expected pine, mql, python or natural)"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn pine_markers() {
        assert_eq!(
            classify("//@version=5\nstrategy(\"x\")\nif ta.crossover(a, b)"),
            SourceDialect::PseudoPine
        );
        assert_eq!(classify("fast := EMA(close, 12)"), SourceDialect::PseudoPine);
    }

    #[test]
    fn mql_markers() {
        assert_eq!(
            classify("void OnTick() { double ma = iMA(NULL, 0, 14); OrderSend(...); }"),
            SourceDialect::PseudoMql
        );
    }

    #[test]
    fn python_markers() {
        assert_eq!(
            classify("def next(self):\n    if self.rsi < 30:\n        self.buy()"),
            SourceDialect::PseudoPython
        );
    }

    #[test]
    fn natural_language_fallback() {
        assert_eq!(classify("Buy and hold AAPL"), SourceDialect::NaturalLanguage);
        assert_eq!(classify(""), SourceDialect::NaturalLanguage);
    }

    #[test]
    fn markers_respect_word_boundaries() {
        assert_eq!(
            classify("Use daily data. Buy when the price closes above the 50 day moving average."),
            SourceDialect::NaturalLanguage
        );
        assert_eq!(
            classify("Go long when beta. and delta. both rise, and the move itself. holds."),
            SourceDialect::NaturalLanguage
        );
        assert_eq!(
            classify("Rely on expertise: buy the dip."),
            SourceDialect::NaturalLanguage
        );
        assert_eq!(classify("x = ta.sma(close, 20)"), SourceDialect::PseudoPine);
        assert_eq!(classify("if (ta.rsi(close, 14) < 30)"), SourceDialect::PseudoPine);
        assert_eq!(classify("// Expert Advisor"), SourceDialect::PseudoMql);
    }

    #[test]
    fn first_matching_set_wins() {
        // both Pine and Python markers present
        assert_eq!(
            classify("def run():\n    strategy.entry(\"long\")"),
            SourceDialect::PseudoPine
        );
        // MQL outranks Python
        assert_eq!(classify("import x\nOnTick()"), SourceDialect::PseudoMql);
    }

    #[test]
    fn classification_ignores_case() {
        assert_eq!(classify("VOID ONTICK()"), SourceDialect::PseudoMql);
        assert_eq!(classify("IMPORT numpy"), SourceDialect::PseudoPython);
    }

    #[test]
    fn serde_names() {
        assert_eq!(
            serde_json::to_string(&SourceDialect::NaturalLanguage).unwrap(),
            "\"natural\""
        );
        let parsed: SourceDialect = serde_json::from_str("\"mql\"").unwrap();
        assert_eq!(parsed, SourceDialect::PseudoMql);
        assert_eq!("Pine".parse::<SourceDialect>(), Ok(SourceDialect::PseudoPine));
    }

    proptest! {
        #[test]
        fn classify_is_total_and_stable(text in ".{0,200}") {
            let first = classify(&text);
            prop_assert_eq!(first, classify(&text));
        }

        #[test]
        fn plain_words_are_natural(words in proptest::collection::vec("[a-z]{1,8}", 0..20)) {
            // letters and single spaces can only hit the bare-word markers
            let text = words.join(" ");
            let hits_marker = ["expert", "ontick", "oninit", "ordersend", "imovingaverage", "positionopen", "def ", "import ", "elif "]
                .iter()
                .any(|m| text.contains(m));
            prop_assume!(!hits_marker);
            prop_assert_eq!(classify(&text), SourceDialect::NaturalLanguage);
        }
    }
}
