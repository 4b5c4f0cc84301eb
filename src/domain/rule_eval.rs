//! Rule evaluation against bars and pre-computed indicator series.
//!
//! - Comparisons read operands at the given bar; a missing value (warmup,
//!   unknown series) makes the comparison false
//! - `CROSS_ABOVE`/`CROSS_BELOW` also read the previous bar and are false at
//!   index 0
//! - `AND`/`OR` short-circuit
//! - `ALWAYS`/`NEVER` ignore the bar entirely

use std::collections::HashMap;

use crate::domain::indicator::{IndicatorSeries, IndicatorType, IndicatorValue};
use crate::domain::ohlcv::Bar;
use crate::domain::rule::{IndicatorField, IndicatorRef, Operand, Rule};

const EPSILON: f64 = 1e-9;

pub fn evaluate(
    rule: &Rule,
    bars: &[Bar],
    indicators: &HashMap<IndicatorType, IndicatorSeries>,
    bar_index: usize,
) -> bool {
    let at = |operand: &Operand, index: usize| resolve_operand(operand, bars, indicators, index);
    let both = |left: &Operand, right: &Operand, index: usize| Some((at(left, index)?, at(right, index)?));
    let crossed = |left: &Operand, right: &Operand, upward: bool| {
        let Some(prev_index) = bar_index.checked_sub(1) else {
            return false;
        };
        match (both(left, right, bar_index), both(left, right, prev_index)) {
            (Some((l, r)), Some((pl, pr))) if upward => l > r && pl <= pr,
            (Some((l, r)), Some((pl, pr))) => l < r && pl >= pr,
            _ => false,
        }
    };

    match rule {
        Rule::CrossAbove { left, right } => crossed(left, right, true),
        Rule::CrossBelow { left, right } => crossed(left, right, false),
        Rule::Above { left, right } => both(left, right, bar_index).is_some_and(|(l, r)| l > r),
        Rule::Below { left, right } => both(left, right, bar_index).is_some_and(|(l, r)| l < r),
        Rule::Equals { left, right } => {
            both(left, right, bar_index).is_some_and(|(l, r)| (l - r).abs() < EPSILON)
        }
        Rule::And(rules) => rules.iter().all(|r| evaluate(r, bars, indicators, bar_index)),
        Rule::Or(rules) => rules.iter().any(|r| evaluate(r, bars, indicators, bar_index)),
        Rule::Not(inner) => !evaluate(inner, bars, indicators, bar_index),
        Rule::Always => true,
        Rule::Never => false,
    }
}

/// Numeric value of an operand at `bar_index`, `None` when unavailable.
pub fn resolve_operand(
    operand: &Operand,
    bars: &[Bar],
    indicators: &HashMap<IndicatorType, IndicatorSeries>,
    bar_index: usize,
) -> Option<f64> {
    let bar = bars.get(bar_index)?;
    match operand {
        Operand::Open => Some(bar.open),
        Operand::High => Some(bar.high),
        Operand::Low => Some(bar.low),
        Operand::Close => Some(bar.close),
        Operand::Volume => Some(bar.volume),
        Operand::Constant(v) => Some(*v),
        Operand::Indicator(iref) => resolve_indicator(iref, indicators, bar_index),
    }
}

fn resolve_indicator(
    iref: &IndicatorRef,
    indicators: &HashMap<IndicatorType, IndicatorSeries>,
    bar_index: usize,
) -> Option<f64> {
    let value = indicators.get(&iref.indicator_type)?.value_at(bar_index)?;
    extract_field(value, iref.field).filter(|v| v.is_finite())
}

fn extract_field(value: &IndicatorValue, field: IndicatorField) -> Option<f64> {
    use IndicatorField as F;
    use IndicatorValue as V;
    let v = match (value, field) {
        (V::Simple(v), F::Value) => *v,
        (V::Macd { line, .. }, F::MacdLine | F::Value) => *line,
        (V::Macd { signal, .. }, F::MacdSignal) => *signal,
        (V::Macd { histogram, .. }, F::MacdHistogram) => *histogram,
        (V::Stochastic { k, .. }, F::StochasticK | F::Value) => *k,
        (V::Stochastic { d, .. }, F::StochasticD) => *d,
        (V::Bollinger { upper, .. }, F::BollingerUpper) => *upper,
        (V::Bollinger { middle, .. }, F::BollingerMiddle | F::Value) => *middle,
        (V::Bollinger { lower, .. }, F::BollingerLower) => *lower,
        (V::Adx { adx, .. }, F::Value) => *adx,
        (V::Adx { plus_di, .. }, F::PlusDi) => *plus_di,
        (V::Adx { minus_di, .. }, F::MinusDi) => *minus_di,
        _ => return None,
    };
    Some(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::indicator::test_support::bars_from_closes;
    use crate::domain::indicator::compute_indicators;
    use crate::domain::rule_parser::parse;

    fn eval_all(text: &str, closes: &[f64]) -> Vec<bool> {
        let bars = bars_from_closes(closes);
        let rule = parse(text).unwrap();
        let indicators = compute_indicators(&bars, &rule.indicators());
        (0..bars.len())
            .map(|i| evaluate(&rule, &bars, &indicators, i))
            .collect()
    }

    #[test]
    fn above_and_below_constants() {
        assert_eq!(
            eval_all("ABOVE(close, 10)", &[9.0, 10.0, 11.0]),
            vec![false, false, true]
        );
        assert_eq!(
            eval_all("BELOW(close, 10)", &[9.0, 10.0, 11.0]),
            vec![true, false, false]
        );
    }

    #[test]
    fn equals_uses_epsilon() {
        assert_eq!(
            eval_all("EQUALS(close, 10)", &[10.0 + 1e-12, 10.1]),
            vec![true, false]
        );
    }

    #[test]
    fn cross_above_needs_prior_bar_at_or_below() {
        assert_eq!(
            eval_all("CROSS_ABOVE(close, 10)", &[11.0, 9.0, 10.0, 11.0, 12.0]),
            vec![false, false, false, true, false]
        );
    }

    #[test]
    fn cross_below() {
        assert_eq!(
            eval_all("CROSS_BELOW(close, 10)", &[11.0, 9.0, 8.0, 12.0, 7.0]),
            vec![false, true, false, false, true]
        );
    }

    #[test]
    fn indicator_warmup_makes_comparisons_false() {
        // SMA(3) only exists from index 2
        assert_eq!(
            eval_all("ABOVE(close, SMA(3))", &[1.0, 2.0, 3.0, 4.0]),
            vec![false, false, true, true]
        );
        // crossing needs both bars past warmup
        assert_eq!(
            eval_all("CROSS_ABOVE(close, SMA(3))", &[5.0, 5.0, 1.0, 9.0]),
            vec![false, false, false, true]
        );
    }

    #[test]
    fn composites_and_constants() {
        let closes = [5.0, 15.0, 25.0];
        assert_eq!(
            eval_all("AND(ABOVE(close, 10), BELOW(close, 20))", &closes),
            vec![false, true, false]
        );
        assert_eq!(
            eval_all("OR(BELOW(close, 10), ABOVE(close, 20))", &closes),
            vec![true, false, true]
        );
        assert_eq!(eval_all("NOT(ABOVE(close, 10))", &closes), vec![true, false, false]);
        assert_eq!(eval_all("ALWAYS", &closes), vec![true; 3]);
        assert_eq!(eval_all("NEVER", &closes), vec![false; 3]);
    }

    #[test]
    fn missing_series_is_false() {
        let bars = bars_from_closes(&[1.0, 2.0]);
        let rule = parse("ABOVE(RSI(14), 0)").unwrap();
        assert!(!evaluate(&rule, &bars, &HashMap::new(), 1));
    }

    #[test]
    fn field_extraction_by_shape() {
        let macd = IndicatorValue::Macd {
            line: 1.0,
            signal: 2.0,
            histogram: -1.0,
        };
        assert_eq!(extract_field(&macd, IndicatorField::MacdSignal), Some(2.0));
        assert_eq!(extract_field(&macd, IndicatorField::BollingerUpper), None);

        let adx = IndicatorValue::Adx {
            adx: 30.0,
            plus_di: 25.0,
            minus_di: 10.0,
        };
        assert_eq!(extract_field(&adx, IndicatorField::Value), Some(30.0));
        assert_eq!(extract_field(&adx, IndicatorField::MinusDi), Some(10.0));
        assert_eq!(
            extract_field(&IndicatorValue::Simple(4.0), IndicatorField::Value),
            Some(4.0)
        );
    }
}
