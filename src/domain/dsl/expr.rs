//! Signal expressions.
//!
//! ```text
//! expr     := and_expr (("or" | "||") and_expr)*
//! and_expr := unary (("and" | "&&") unary)*
//! unary    := ("not" | "!") unary | primary
//! primary  := "(" expr ")" | "true" | "false"
//!           | cross "(" value "," value ")"
//!           | value cmp value
//! cross    := cross | cross_up | cross_above | cross_down | cross_below
//! cmp      := ">" | "<" | ">=" | "<=" | "==" | "!="
//! value    := ["-"] number | open | high | low | close | volume | id ["." field]
//! ```
//!
//! Keywords are case-insensitive; indicator ids are matched exactly.

use crate::domain::error::ParseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
    Ne,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrossDirection {
    Above,
    Below,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceField {
    Open,
    High,
    Low,
    Close,
    Volume,
}

/// A use of a declared indicator, `id` or `id.field`.
#[derive(Debug, Clone, PartialEq)]
pub struct Reference {
    pub id: String,
    pub field: Option<String>,
    pub position: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(f64),
    Price(PriceField),
    Ref(Reference),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(bool),
    Compare {
        op: CompareOp,
        left: Value,
        right: Value,
    },
    Cross {
        direction: CrossDirection,
        left: Value,
        right: Value,
    },
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
}

/// Deepest run of nested parentheses and negations a signal may use.
pub const MAX_NESTING: usize = 64;

const KEYWORDS: &[&str] = &["and", "or", "not", "true", "false"];
const PRICE_FIELDS: &[&str] = &["open", "high", "low", "close", "volume"];
const CROSS_FUNCTIONS: &[&str] = &["cross", "cross_up", "cross_above", "cross_down", "cross_below"];

/// Words that cannot be used as indicator ids.
pub fn is_reserved(word: &str) -> bool {
    let lower = word.to_ascii_lowercase();
    [KEYWORDS, PRICE_FIELDS, CROSS_FUNCTIONS]
        .iter()
        .any(|set| set.contains(&lower.as_str()))
}

fn cross_direction(word: &str) -> Option<CrossDirection> {
    match word.to_ascii_lowercase().as_str() {
        "cross" | "cross_up" | "cross_above" => Some(CrossDirection::Above),
        "cross_down" | "cross_below" => Some(CrossDirection::Below),
        _ => None,
    }
}

fn price_field(word: &str) -> Option<PriceField> {
    match word.to_ascii_lowercase().as_str() {
        "open" => Some(PriceField::Open),
        "high" => Some(PriceField::High),
        "low" => Some(PriceField::Low),
        "close" => Some(PriceField::Close),
        "volume" => Some(PriceField::Volume),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Dot,
    Comma,
    LParen,
    RParen,
    Minus,
    Cmp(CompareOp),
    AndOp,
    OrOp,
    Bang,
}

fn describe(token: &Token) -> String {
    match token {
        Token::Number(n) => format!("number {n}"),
        Token::Ident(word) => format!("'{word}'"),
        Token::Dot => "'.'".to_string(),
        Token::Comma => "','".to_string(),
        Token::LParen => "'('".to_string(),
        Token::RParen => "')'".to_string(),
        Token::Minus => "'-'".to_string(),
        Token::Cmp(_) => "comparison operator".to_string(),
        Token::AndOp => "'&&'".to_string(),
        Token::OrOp => "'||'".to_string(),
        Token::Bang => "'!'".to_string(),
    }
}

/// Tokens with their byte offsets, plus the error that stopped lexing, if any.
fn lex(input: &str) -> (Vec<(Token, usize)>, Option<ParseError>) {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let ch = bytes[pos];
        let start = pos;
        let two = input.get(pos..pos + 2);

        let token = match ch {
            b' ' | b'\t' | b'\r' | b'\n' => {
                pos += 1;
                continue;
            }
            b'0'..=b'9' => {
                while pos < bytes.len() && (bytes[pos].is_ascii_digit() || bytes[pos] == b'.') {
                    pos += 1;
                }
                let text = &input[start..pos];
                match text.parse::<f64>() {
                    Ok(n) => Token::Number(n),
                    Err(_) => {
                        let err = ParseError {
                            message: format!("invalid number '{text}'"),
                            position: start,
                        };
                        return (tokens, Some(err));
                    }
                }
            }
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                while pos < bytes.len() && (bytes[pos].is_ascii_alphanumeric() || bytes[pos] == b'_') {
                    pos += 1;
                }
                Token::Ident(input[start..pos].to_string())
            }
            _ => {
                let (token, len) = match (ch, two) {
                    (_, Some(">=")) => (Token::Cmp(CompareOp::Ge), 2),
                    (_, Some("<=")) => (Token::Cmp(CompareOp::Le), 2),
                    (_, Some("==")) => (Token::Cmp(CompareOp::Eq), 2),
                    (_, Some("!=")) => (Token::Cmp(CompareOp::Ne), 2),
                    (_, Some("&&")) => (Token::AndOp, 2),
                    (_, Some("||")) => (Token::OrOp, 2),
                    (b'>', _) => (Token::Cmp(CompareOp::Gt), 1),
                    (b'<', _) => (Token::Cmp(CompareOp::Lt), 1),
                    (b'!', _) => (Token::Bang, 1),
                    (b'.', _) => (Token::Dot, 1),
                    (b',', _) => (Token::Comma, 1),
                    (b'(', _) => (Token::LParen, 1),
                    (b')', _) => (Token::RParen, 1),
                    (b'-', _) => (Token::Minus, 1),
                    _ => {
                        let shown = input[start..].chars().next().unwrap_or('?');
                        let err = ParseError {
                            message: format!("unexpected character '{shown}'"),
                            position: start,
                        };
                        return (tokens, Some(err));
                    }
                };
                pos += len;
                token
            }
        };
        tokens.push((token, start));
    }

    (tokens, None)
}

/// Indicator references in `input`, found from tokens alone so that a
/// malformed expression still reports what it refers to.
pub fn references(input: &str) -> Vec<Reference> {
    let (tokens, _) = lex(input);
    let mut refs = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        if let (Token::Ident(word), position) = &tokens[i] {
            let is_call = matches!(tokens.get(i + 1), Some((Token::LParen, _)));
            let skip = KEYWORDS.contains(&word.to_ascii_lowercase().as_str())
                || price_field(word).is_some()
                || (is_call && cross_direction(word).is_some());
            if !skip {
                let field = match (tokens.get(i + 1), tokens.get(i + 2)) {
                    (Some((Token::Dot, _)), Some((Token::Ident(field), _))) => {
                        i += 2;
                        Some(field.clone())
                    }
                    _ => None,
                };
                refs.push(Reference {
                    id: word.clone(),
                    field,
                    position: *position,
                });
            }
        }
        i += 1;
    }
    refs
}

pub fn parse(input: &str) -> Result<Expr, ParseError> {
    let (tokens, lex_error) = lex(input);
    if let Some(err) = lex_error {
        return Err(err);
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: input.len(),
        depth: 0,
    };
    if parser.tokens.is_empty() {
        return Err(parser.error("empty expression"));
    }
    let expr = parser.parse_or()?;
    if let Some((token, _)) = parser.peek_token() {
        let message = format!("unexpected trailing {}", describe(token));
        return Err(parser.error(message));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    end: usize,
    depth: usize,
}

impl Parser {
    fn peek_token(&self) -> Option<&(Token, usize)> {
        self.tokens.get(self.pos)
    }

    fn peek(&self) -> Option<&Token> {
        self.peek_token().map(|(t, _)| t)
    }

    fn position(&self) -> usize {
        self.peek_token().map_or(self.end, |(_, p)| *p)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            message: message.into(),
            position: self.position(),
        }
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), ParseError> {
        match self.peek() {
            Some(token) if *token == expected => {
                self.advance();
                Ok(())
            }
            Some(token) => {
                let message = format!("expected {what}, found {}", describe(token));
                Err(self.error(message))
            }
            None => Err(self.error(format!("expected {what}, found end of expression"))),
        }
    }

    /// Run `f` one nesting level deeper.
    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T, ParseError>) -> Result<T, ParseError> {
        if self.depth >= MAX_NESTING {
            return Err(self.error(format!("expression nests deeper than {MAX_NESTING} levels")));
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(w)) if w.eq_ignore_ascii_case(keyword))
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut terms = vec![self.parse_and()?];
        while matches!(self.peek(), Some(Token::OrOp)) || self.at_keyword("or") {
            self.advance();
            terms.push(self.parse_and()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Expr::Or(terms)
        })
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut terms = vec![self.parse_unary()?];
        while matches!(self.peek(), Some(Token::AndOp)) || self.at_keyword("and") {
            self.advance();
            terms.push(self.parse_unary()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Expr::And(terms)
        })
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        if matches!(self.peek(), Some(Token::Bang)) || self.at_keyword("not") {
            self.advance();
            let inner = self.nested(Self::parse_unary)?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        match self.peek() {
            None => Err(self.error("expected condition, found end of expression")),
            Some(Token::LParen) => {
                self.advance();
                let inner = self.nested(Self::parse_or)?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("true") => {
                self.advance();
                Ok(Expr::Literal(true))
            }
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("false") => {
                self.advance();
                Ok(Expr::Literal(false))
            }
            Some(Token::Ident(word))
                if matches!(self.tokens.get(self.pos + 1), Some((Token::LParen, _))) =>
            {
                let Some(direction) = cross_direction(word) else {
                    let message = format!("unknown function '{word}'");
                    return Err(self.error(message));
                };
                self.advance();
                self.advance();
                let left = self.parse_value()?;
                self.expect(Token::Comma, "',' between cross arguments")?;
                let right = self.parse_value()?;
                self.expect(Token::RParen, "')' after cross arguments")?;
                Ok(Expr::Cross {
                    direction,
                    left,
                    right,
                })
            }
            Some(_) => {
                let left = self.parse_value()?;
                let op = match self.peek() {
                    Some(Token::Cmp(op)) => *op,
                    Some(token) => {
                        let message = format!("expected comparison operator, found {}", describe(token));
                        return Err(self.error(message));
                    }
                    None => {
                        return Err(self.error("expected comparison operator, found end of expression"))
                    }
                };
                self.advance();
                let right = self.parse_value()?;
                Ok(Expr::Compare { op, left, right })
            }
        }
    }

    fn parse_value(&mut self) -> Result<Value, ParseError> {
        let position = self.position();
        match self.advance() {
            Some(Token::Number(n)) => Ok(Value::Number(n)),
            Some(Token::Minus) => match self.advance() {
                Some(Token::Number(n)) => Ok(Value::Number(-n)),
                _ => Err(ParseError {
                    message: "expected number after '-'".to_string(),
                    position,
                }),
            },
            Some(Token::Ident(word)) if KEYWORDS.contains(&word.to_ascii_lowercase().as_str()) => {
                Err(ParseError {
                    message: format!("expected value, found keyword '{word}'"),
                    position,
                })
            }
            Some(Token::Ident(word)) => {
                if let Some(field) = price_field(&word) {
                    return Ok(Value::Price(field));
                }
                let field = if matches!(self.peek(), Some(Token::Dot)) {
                    self.advance();
                    match self.advance() {
                        Some(Token::Ident(field)) => Some(field),
                        _ => {
                            return Err(ParseError {
                                message: format!("expected field name after '{word}.'"),
                                position,
                            })
                        }
                    }
                } else {
                    None
                };
                Ok(Value::Ref(Reference {
                    id: word,
                    field,
                    position,
                }))
            }
            Some(token) => Err(ParseError {
                message: format!("expected value, found {}", describe(&token)),
                position,
            }),
            None => Err(ParseError {
                message: "expected value, found end of expression".to_string(),
                position,
            }),
        }
    }
}

impl Expr {
    /// Every indicator reference in the expression, in source order.
    pub fn references(&self) -> Vec<&Reference> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Compare { left, right, .. } | Expr::Cross { left, right, .. } => {
                for value in [left, right] {
                    if let Value::Ref(reference) = value {
                        out.push(reference);
                    }
                }
            }
            Expr::And(terms) | Expr::Or(terms) => {
                terms.iter().for_each(|t| t.collect_references(out))
            }
            Expr::Not(inner) => inner.collect_references(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(id: &str, field: Option<&str>, position: usize) -> Value {
        Value::Ref(Reference {
            id: id.to_string(),
            field: field.map(str::to_string),
            position,
        })
    }

    #[test]
    fn comparison() {
        assert_eq!(
            parse("rsi_14 < 30").unwrap(),
            Expr::Compare {
                op: CompareOp::Lt,
                left: reference("rsi_14", None, 0),
                right: Value::Number(30.0),
            }
        );
    }

    #[test]
    fn precedence_and_flattening() {
        let expr = parse("a > 1 and b > 2 and c > 3 or not close <= -1.5").unwrap();
        let Expr::Or(terms) = expr else {
            panic!("expected OR at the top");
        };
        assert_eq!(terms.len(), 2);
        assert!(matches!(&terms[0], Expr::And(inner) if inner.len() == 3));
        assert!(matches!(
            &terms[1],
            Expr::Not(inner) if matches!(**inner, Expr::Compare { op: CompareOp::Le, right: Value::Number(n), .. } if n == -1.5)
        ));
    }

    #[test]
    fn symbolic_operators_and_case() {
        let a = parse("(x > 1 && y < 2) || !(z == 3)").unwrap();
        let b = parse("(x > 1 AND y < 2) OR NOT (z == 3)").unwrap();
        assert_eq!(a, b.clone());
        assert!(matches!(b, Expr::Or(_)));
    }

    #[test]
    fn cross_and_fields() {
        let expr = parse("cross_below(macd.line, macd.signal)").unwrap();
        assert_eq!(
            expr,
            Expr::Cross {
                direction: CrossDirection::Below,
                left: reference("macd", Some("line"), 12),
                right: reference("macd", Some("signal"), 23),
            }
        );
        assert!(matches!(
            parse("CROSS(close, fast)").unwrap(),
            Expr::Cross { direction: CrossDirection::Above, left: Value::Price(PriceField::Close), .. }
        ));
    }

    #[test]
    fn literals() {
        assert_eq!(parse("true").unwrap(), Expr::Literal(true));
        assert_eq!(parse(" False ").unwrap(), Expr::Literal(false));
    }

    #[test]
    fn errors_carry_positions() {
        let err = parse("(rsi < 30").unwrap_err();
        assert_eq!(err.position, 9);
        assert!(err.message.contains("')'"));

        let err = parse("rsi < 30 70").unwrap_err();
        assert_eq!(err.position, 9);
        assert!(err.message.contains("trailing"));

        let err = parse("rsi and close > 1").unwrap_err();
        assert_eq!(err.position, 4);
        assert!(err.message.contains("comparison operator"));

        let err = parse("close > ").unwrap_err();
        assert!(err.message.contains("end of expression"));

        let err = parse("sma(close, 5) > 1").unwrap_err();
        assert!(err.message.contains("unknown function 'sma'"));

        let err = parse("close > 1 $").unwrap_err();
        assert_eq!(err.position, 10);

        assert!(parse("   ").is_err());
        assert!(parse("cross(a)").is_err());
        assert!(parse("a > and").is_err());
    }

    #[test]
    fn nesting_is_bounded() {
        let at_limit = format!("{}close > 1{}", "(".repeat(MAX_NESTING), ")".repeat(MAX_NESTING));
        assert!(parse(&at_limit).is_ok());

        let deep = format!("{}true{}", "(".repeat(10_000), ")".repeat(10_000));
        let err = parse(&deep).unwrap_err();
        assert!(err.message.contains("nests deeper"), "{}", err.message);

        let negations = format!("{}true", "!".repeat(200_000));
        assert!(parse(&negations).unwrap_err().message.contains("nests deeper"));
        let words = format!("{}true", "not ".repeat(10_000));
        assert!(parse(&words).is_err());
    }

    #[test]
    fn references_from_tokens() {
        let refs = references("cross(fast, slow) and rsi_14.value < 30 and close > open");
        let ids: Vec<_> = refs.iter().map(|r| (r.id.as_str(), r.field.as_deref())).collect();
        assert_eq!(
            ids,
            vec![("fast", None), ("slow", None), ("rsi_14", Some("value"))]
        );

        // still found when the expression does not parse
        let refs = references("rsi_14 < (30");
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].id, "rsi_14");
    }

    #[test]
    fn ast_references_match_token_scan() {
        let text = "a > b or not cross_up(c.k, 5)";
        let parsed = parse(text).unwrap();
        let from_ast: Vec<_> = parsed.references().into_iter().cloned().collect();
        assert_eq!(from_ast, references(text));
    }

    #[test]
    fn reserved_words() {
        assert!(is_reserved("close"));
        assert!(is_reserved("AND"));
        assert!(is_reserved("cross_above"));
        assert!(!is_reserved("rsi_14"));
    }
}
