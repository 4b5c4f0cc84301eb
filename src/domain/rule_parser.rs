//! Rule language parser.
//!
//! Recursive descent over the text of a strategy program's rule keys. Errors
//! carry the character offset plus the expected and found tokens.
//!
//! ```text
//! rule     := CMP "(" operand "," operand ")"
//!           | ("AND" | "OR") "(" rule ("," rule)+ ")"
//!           | "NOT" "(" rule ")" | "ALWAYS" | "NEVER"
//! CMP      := CROSS_ABOVE | CROSS_BELOW | ABOVE | BELOW | EQUALS
//! operand  := number | open | high | low | close | volume | indicator
//! ```

use crate::domain::error::ParseError;
use crate::domain::indicator::IndicatorType;
use crate::domain::rule::{IndicatorField, IndicatorRef, Operand, Rule};

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn remaining(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.remaining().chars().next()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += ch.len_utf8();
        Some(ch)
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.advance();
        }
    }

    fn error(&self, message: String) -> ParseError {
        ParseError {
            message,
            position: self.pos,
        }
    }

    fn expect_char(&mut self, expected: char) -> Result<(), ParseError> {
        self.skip_whitespace();
        match self.peek() {
            Some(ch) if ch == expected => {
                self.advance();
                Ok(())
            }
            Some(ch) => Err(self.error(format!("expected '{expected}', found '{ch}'"))),
            None => Err(self.error(format!("expected '{expected}', found end of input"))),
        }
    }

    /// Identifier-like word at the cursor, or a description of what is there.
    fn peek_word(&self) -> String {
        let word: String = self
            .remaining()
            .chars()
            .take_while(|c| c.is_alphanumeric() || *c == '_')
            .collect();
        if !word.is_empty() {
            return word;
        }
        self.peek()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "end of input".to_string())
    }

    fn take_word(&mut self) -> String {
        let word: String = self
            .remaining()
            .chars()
            .take_while(|c| c.is_alphanumeric() || *c == '_')
            .collect();
        self.pos += word.len();
        word
    }

    fn parse_number(&mut self) -> Result<f64, ParseError> {
        self.skip_whitespace();
        let start = self.pos;
        if self.peek() == Some('-') {
            self.advance();
        }
        let mut digits = 0;
        let mut has_dot = false;
        while let Some(ch) = self.peek() {
            if ch.is_ascii_digit() {
                digits += 1;
            } else if ch == '.' && !has_dot {
                has_dot = true;
            } else {
                break;
            }
            self.advance();
        }
        if digits == 0 {
            self.pos = start;
            return Err(self.error("expected number".to_string()));
        }
        let text = &self.input[start..self.pos];
        text.parse::<f64>().map_err(|_| ParseError {
            message: format!("invalid number: {text}"),
            position: start,
        })
    }

    fn parse_integer(&mut self) -> Result<usize, ParseError> {
        self.skip_whitespace();
        let start = self.pos;
        let digits: String = self
            .remaining()
            .chars()
            .take_while(char::is_ascii_digit)
            .collect();
        if digits.is_empty() {
            return Err(self.error("expected integer".to_string()));
        }
        self.pos += digits.len();
        digits.parse::<usize>().map_err(|_| ParseError {
            message: format!("invalid integer: {digits}"),
            position: start,
        })
    }

    /// `(n, n, ...)` with exactly `count` integers.
    fn parse_int_args(&mut self, count: usize) -> Result<Vec<usize>, ParseError> {
        self.expect_char('(')?;
        let mut args = Vec::with_capacity(count);
        for i in 0..count {
            if i > 0 {
                self.expect_char(',')?;
            }
            args.push(self.parse_integer()?);
        }
        self.expect_char(')')?;
        Ok(args)
    }

    fn parse_indicator(&mut self) -> Result<IndicatorRef, ParseError> {
        use IndicatorField as F;

        let start = self.pos;
        let name = self.take_word();
        let single = |p: &mut Self,
                      make: fn(usize) -> IndicatorType,
                      field: IndicatorField|
         -> Result<IndicatorRef, ParseError> {
            let args = p.parse_int_args(1)?;
            Ok(IndicatorRef {
                indicator_type: make(args[0]),
                field,
            })
        };

        match name.as_str() {
            "SMA" => single(self, IndicatorType::Sma, F::Value),
            "EMA" => single(self, IndicatorType::Ema, F::Value),
            "WMA" => single(self, IndicatorType::Wma, F::Value),
            "RSI" => single(self, IndicatorType::Rsi, F::Value),
            "ROC" => single(self, IndicatorType::Roc, F::Value),
            "ATR" => single(self, IndicatorType::Atr, F::Value),
            "STDDEV" => single(self, IndicatorType::Stddev, F::Value),
            "ADX" => single(self, IndicatorType::Adx, F::Value),
            "ADX_PLUS_DI" => single(self, IndicatorType::Adx, F::PlusDi),
            "ADX_MINUS_DI" => single(self, IndicatorType::Adx, F::MinusDi),
            "OBV" => Ok(IndicatorRef::value(IndicatorType::Obv)),
            "VWAP" => Ok(IndicatorRef::value(IndicatorType::Vwap)),
            "MACD_LINE" | "MACD_SIGNAL" | "MACD_HISTOGRAM" => {
                let args = self.parse_int_args(3)?;
                let field = match name.as_str() {
                    "MACD_LINE" => F::MacdLine,
                    "MACD_SIGNAL" => F::MacdSignal,
                    _ => F::MacdHistogram,
                };
                Ok(IndicatorRef {
                    indicator_type: IndicatorType::Macd {
                        fast: args[0],
                        slow: args[1],
                        signal: args[2],
                    },
                    field,
                })
            }
            "STOCHASTIC_K" | "STOCHASTIC_D" => {
                let args = self.parse_int_args(2)?;
                let field = if name == "STOCHASTIC_K" {
                    F::StochasticK
                } else {
                    F::StochasticD
                };
                Ok(IndicatorRef {
                    indicator_type: IndicatorType::Stochastic {
                        k_period: args[0],
                        d_period: args[1],
                    },
                    field,
                })
            }
            "BOLLINGER_UPPER" | "BOLLINGER_MIDDLE" | "BOLLINGER_LOWER" => {
                self.expect_char('(')?;
                let period = self.parse_integer()?;
                self.expect_char(',')?;
                let mult = self.parse_number()?;
                self.expect_char(')')?;
                let field = match name.as_str() {
                    "BOLLINGER_UPPER" => F::BollingerUpper,
                    "BOLLINGER_MIDDLE" => F::BollingerMiddle,
                    _ => F::BollingerLower,
                };
                Ok(IndicatorRef {
                    indicator_type: IndicatorType::Bollinger {
                        period,
                        stddev_mult_x100: (mult * 100.0).round().max(0.0) as u32,
                    },
                    field,
                })
            }
            _ => {
                self.pos = start;
                Err(self.error(format!("expected indicator, found '{}'", self.peek_word())))
            }
        }
    }

    fn parse_operand(&mut self) -> Result<Operand, ParseError> {
        self.skip_whitespace();

        if self
            .peek()
            .is_some_and(|ch| ch.is_ascii_digit() || ch == '-' || ch == '.')
        {
            return self.parse_number().map(Operand::Constant);
        }

        let field = match self.peek_word().as_str() {
            "open" => Operand::Open,
            "high" => Operand::High,
            "low" => Operand::Low,
            "close" => Operand::Close,
            "volume" => Operand::Volume,
            _ => return self.parse_indicator().map(Operand::Indicator),
        };
        self.take_word();
        Ok(field)
    }

    fn parse_pair(&mut self) -> Result<(Operand, Operand), ParseError> {
        self.expect_char('(')?;
        let left = self.parse_operand()?;
        self.expect_char(',')?;
        let right = self.parse_operand()?;
        self.expect_char(')')?;
        Ok((left, right))
    }

    fn parse_rule_list(&mut self, keyword: &str) -> Result<Vec<Rule>, ParseError> {
        self.expect_char('(')?;
        let mut rules = vec![self.parse_rule()?];
        loop {
            self.skip_whitespace();
            if self.peek() == Some(')') {
                self.advance();
                break;
            }
            self.expect_char(',')?;
            rules.push(self.parse_rule()?);
        }
        if rules.len() < 2 {
            return Err(self.error(format!("{keyword} requires at least 2 rules")));
        }
        Ok(rules)
    }

    fn parse_rule(&mut self) -> Result<Rule, ParseError> {
        self.skip_whitespace();
        let start = self.pos;
        let keyword = self.take_word();

        match keyword.as_str() {
            "CROSS_ABOVE" => self
                .parse_pair()
                .map(|(left, right)| Rule::CrossAbove { left, right }),
            "CROSS_BELOW" => self
                .parse_pair()
                .map(|(left, right)| Rule::CrossBelow { left, right }),
            "ABOVE" => self.parse_pair().map(|(left, right)| Rule::Above { left, right }),
            "BELOW" => self.parse_pair().map(|(left, right)| Rule::Below { left, right }),
            "EQUALS" => self.parse_pair().map(|(left, right)| Rule::Equals { left, right }),
            "AND" => self.parse_rule_list("AND").map(Rule::And),
            "OR" => self.parse_rule_list("OR").map(Rule::Or),
            "NOT" => {
                self.expect_char('(')?;
                let inner = self.parse_rule()?;
                self.expect_char(')')?;
                Ok(Rule::Not(Box::new(inner)))
            }
            "ALWAYS" => Ok(Rule::Always),
            "NEVER" => Ok(Rule::Never),
            _ => {
                self.pos = start;
                Err(self.error(format!("expected rule, found '{}'", self.peek_word())))
            }
        }
    }

    fn finish<T>(&mut self, value: T) -> Result<T, ParseError> {
        self.skip_whitespace();
        if self.pos < self.input.len() {
            return Err(self.error(format!(
                "unexpected input after rule: '{}'",
                self.remaining()
            )));
        }
        Ok(value)
    }
}

/// Parse a complete rule.
pub fn parse(input: &str) -> Result<Rule, ParseError> {
    let mut parser = Parser::new(input);
    let rule = parser.parse_rule()?;
    parser.finish(rule)
}

/// Parse a single operand, as used by the `[sizing] atr` key.
pub fn parse_operand(input: &str) -> Result<Operand, ParseError> {
    let mut parser = Parser::new(input);
    let operand = parser.parse_operand()?;
    parser.finish(operand)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_above() {
        let rule = parse("ABOVE(close, 100)").unwrap();
        assert_eq!(
            rule,
            Rule::Above {
                left: Operand::Close,
                right: Operand::Constant(100.0)
            }
        );
    }

    #[test]
    fn parse_cross_with_indicators() {
        let rule = parse("CROSS_ABOVE(EMA(12), EMA(26))").unwrap();
        assert_eq!(
            rule,
            Rule::CrossAbove {
                left: Operand::Indicator(IndicatorRef::value(IndicatorType::Ema(12))),
                right: Operand::Indicator(IndicatorRef::value(IndicatorType::Ema(26))),
            }
        );
        assert!(matches!(
            parse("CROSS_BELOW(close, SMA(200))").unwrap(),
            Rule::CrossBelow { .. }
        ));
    }

    #[test]
    fn parse_constant_rules() {
        assert_eq!(parse("ALWAYS").unwrap(), Rule::Always);
        assert_eq!(parse("  NEVER ").unwrap(), Rule::Never);
    }

    #[test]
    fn parse_every_indicator_form() {
        let forms = [
            "SMA(20)",
            "EMA(9)",
            "WMA(10)",
            "RSI(14)",
            "ROC(10)",
            "ATR(14)",
            "STDDEV(20)",
            "OBV",
            "VWAP",
            "MACD_LINE(12,26,9)",
            "MACD_SIGNAL(12,26,9)",
            "MACD_HISTOGRAM(12,26,9)",
            "STOCHASTIC_K(14,3)",
            "STOCHASTIC_D(14,3)",
            "BOLLINGER_UPPER(20,2)",
            "BOLLINGER_MIDDLE(20,2)",
            "BOLLINGER_LOWER(20,2)",
            "ADX(14)",
            "ADX_PLUS_DI(14)",
            "ADX_MINUS_DI(14)",
        ];
        for form in forms {
            let text = format!("ABOVE({form}, 0)");
            let rule = parse(&text).unwrap_or_else(|e| panic!("{form}: {e}"));
            assert_eq!(rule.to_string(), format!("ABOVE({form}, 0)"));
        }
    }

    #[test]
    fn display_output_reparses() {
        let text = "AND(NOT(BELOW(RSI(14), 30.5)), OR(CROSS_ABOVE(close, VWAP), EQUALS(volume, -1)), ALWAYS)";
        let rule = parse(text).unwrap();
        assert_eq!(parse(&rule.to_string()).unwrap(), rule);
    }

    #[test]
    fn parse_bollinger_with_float_multiplier() {
        let rule = parse("ABOVE(BOLLINGER_UPPER(20, 2.5), 100)").unwrap();
        match rule {
            Rule::Above {
                left: Operand::Indicator(iref),
                ..
            } => assert_eq!(
                iref.indicator_type,
                IndicatorType::Bollinger {
                    period: 20,
                    stddev_mult_x100: 250
                }
            ),
            other => panic!("expected Above rule, got {other:?}"),
        }
    }

    #[test]
    fn parse_variadic_and_or() {
        match parse("AND(ABOVE(close, 100), BELOW(close, 150), ABOVE(volume, 0))").unwrap() {
            Rule::And(rules) => assert_eq!(rules.len(), 3),
            other => panic!("expected And, got {other:?}"),
        }
        match parse("OR(ABOVE(close, 150), BELOW(close, 50))").unwrap() {
            Rule::Or(rules) => assert_eq!(rules.len(), 2),
            other => panic!("expected Or, got {other:?}"),
        }
    }

    #[test]
    fn parse_operand_standalone() {
        assert_eq!(
            parse_operand(" ATR(14) ").unwrap(),
            Operand::Indicator(IndicatorRef::value(IndicatorType::Atr(14)))
        );
        assert!(parse_operand("ATR(14) x").is_err());
    }

    #[test]
    fn error_unexpected_token() {
        let err = parse("ABOVE(close, )").unwrap_err();
        assert!(err.message.contains("expected"));
        assert_eq!(err.position, 13);
    }

    #[test]
    fn error_missing_paren_and_comma() {
        assert!(parse("ABOVE(close, 100").unwrap_err().message.contains("expected ')'"));
        assert!(parse("ABOVE(close 100)").unwrap_err().message.contains("expected ','"));
    }

    #[test]
    fn error_unknown_rule_and_indicator() {
        let err = parse("INVALID(close, 100)").unwrap_err();
        assert!(err.message.contains("expected rule"));
        assert_eq!(err.position, 0);

        let err = parse("ABOVE(PIVOT, 1)").unwrap_err();
        assert!(err.message.contains("expected indicator, found 'PIVOT'"));
        assert_eq!(err.position, 6);
    }

    #[test]
    fn error_trailing_input() {
        let err = parse("ABOVE(close, 100) garbage").unwrap_err();
        assert!(err.message.contains("unexpected input"));
    }

    #[test]
    fn error_single_element_composite() {
        let err = parse("AND(ABOVE(close, 100))").unwrap_err();
        assert!(err.message.contains("AND requires at least 2 rules"));
    }

    #[test]
    fn keywords_are_case_sensitive() {
        let err = parse("above(close, 100)").unwrap_err();
        assert!(err.message.contains("expected rule"));
    }

    #[test]
    fn error_empty_input() {
        let err = parse("   ").unwrap_err();
        assert!(err.message.contains("expected rule"));
    }

    #[test]
    fn error_display_with_context() {
        let input = "CROSS_ABOVE(SMA(20), , SMA(50))";
        let ctx = parse(input).unwrap_err().display_with_context(input);
        assert!(ctx.contains('^'));
    }
}
