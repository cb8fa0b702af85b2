//! Per-column filter language.
//!
//! A filter constrains the values of one column. Supported forms:
//! - `5`, `'abc'`, `true`: equality
//! - `>5`, `<5`: strict comparison
//! - `5..10`, `5..`, `..10`: inclusive ranges
//! - `null`: the column is NULL
//! - `'abc'%`, `%'bc'%`, `'a'%'c'`: text patterns
//! - `@'abc'`: case-insensitive text matching
//! - `!f`, `f & g`, `f | g`, `(f)`: negation, conjunction, disjunction
//!
//! Date-time literals are written as `'YYYYMMDD'`. Literals are checked
//! against the column type when the filter is parsed. Evaluation follows SQL
//! three-valued logic, so `!5` does not match NULL.

use crate::column::{compare_values, parse_datetime, Column, ColumnType, ColumnValue};
use crate::error::{CursorError, Result};
use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;
use std::cmp::Ordering;
use std::str::FromStr;

/// Constraint installed on one column of a cursor.
#[derive(Debug, Clone)]
pub enum ColumnFilter {
    /// Exact match, `Null` meaning "is null"
    Single(ColumnValue),
    /// Inclusive range
    Range(ColumnValue, ColumnValue),
    /// Parsed filter expression
    Expression { text: String, expr: FilterExpr },
}

impl ColumnFilter {
    pub fn matches(&self, value: &ColumnValue) -> bool {
        match self {
            ColumnFilter::Single(ColumnValue::Null) => value.is_null(),
            ColumnFilter::Single(expected) => {
                compare_values(value, expected) == Some(Ordering::Equal)
            }
            ColumnFilter::Range(from, to) => {
                matches!(compare_values(value, from), Some(Ordering::Greater | Ordering::Equal))
                    && matches!(compare_values(value, to), Some(Ordering::Less | Ordering::Equal))
            }
            ColumnFilter::Expression { expr, .. } => expr.matches(value),
        }
    }

    /// The single value this filter pins the column to, if any.
    pub fn exact_value(&self) -> Option<&ColumnValue> {
        match self {
            ColumnFilter::Single(value) if !value.is_null() => Some(value),
            _ => None,
        }
    }
}

/// A parsed filter expression.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpr {
    IsNull,
    Compare {
        op: CompareOp,
        value: ColumnValue,
        case_insensitive: bool,
    },
    Between {
        from: ColumnValue,
        to: ColumnValue,
        case_insensitive: bool,
    },
    Like {
        pattern: Vec<LikePart>,
        case_insensitive: bool,
    },
    And(Box<FilterExpr>, Box<FilterExpr>),
    Or(Box<FilterExpr>, Box<FilterExpr>),
    Not(Box<FilterExpr>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CompareOp {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn test(self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::Le => ordering != Ordering::Greater,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Ge => ordering != Ordering::Less,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LikePart {
    Text(String),
    AnyChars,
}

impl FilterExpr {
    /// Three-valued evaluation: `None` is SQL's UNKNOWN.
    pub fn eval(&self, value: &ColumnValue) -> Option<bool> {
        match self {
            FilterExpr::IsNull => Some(value.is_null()),
            FilterExpr::Compare { op, value: literal, case_insensitive } => {
                let ordering = compare_folded(value, literal, *case_insensitive)?;
                Some(op.test(ordering))
            }
            FilterExpr::Between { from, to, case_insensitive } => {
                let lower = compare_folded(value, from, *case_insensitive)?;
                let upper = compare_folded(value, to, *case_insensitive)?;
                Some(lower != Ordering::Less && upper != Ordering::Greater)
            }
            FilterExpr::Like { pattern, case_insensitive } => {
                let text = value.as_string()?;
                if *case_insensitive {
                    Some(like_matches(pattern, &text.to_lowercase()))
                } else {
                    Some(like_matches(pattern, text))
                }
            }
            FilterExpr::Not(inner) => inner.eval(value).map(|b| !b),
            FilterExpr::And(left, right) => match (left.eval(value), right.eval(value)) {
                (Some(false), _) | (_, Some(false)) => Some(false),
                (Some(true), Some(true)) => Some(true),
                _ => None,
            },
            FilterExpr::Or(left, right) => match (left.eval(value), right.eval(value)) {
                (Some(true), _) | (_, Some(true)) => Some(true),
                (Some(false), Some(false)) => Some(false),
                _ => None,
            },
        }
    }

    pub fn matches(&self, value: &ColumnValue) -> bool {
        self.eval(value) == Some(true)
    }
}

fn compare_folded(value: &ColumnValue, literal: &ColumnValue, case_insensitive: bool) -> Option<Ordering> {
    match (value, case_insensitive) {
        (ColumnValue::String(s), true) => compare_values(&ColumnValue::String(s.to_lowercase()), literal),
        _ => compare_values(value, literal),
    }
}

fn like_matches(pattern: &[LikePart], text: &str) -> bool {
    let anchored_start = !matches!(pattern.first(), Some(LikePart::AnyChars));
    let anchored_end = !matches!(pattern.last(), Some(LikePart::AnyChars));
    let segments: Vec<&str> = pattern
        .iter()
        .filter_map(|p| match p {
            LikePart::Text(s) => Some(s.as_str()),
            LikePart::AnyChars => None,
        })
        .collect();

    let mut rest = text;
    for (i, segment) in segments.iter().enumerate() {
        let is_first = i == 0;
        let is_last = i == segments.len() - 1;
        if is_first && anchored_start {
            match rest.strip_prefix(segment) {
                Some(r) => rest = r,
                None => return false,
            }
            if is_last && anchored_end {
                return rest.is_empty();
            }
        } else if is_last && anchored_end {
            return rest.ends_with(segment);
        } else {
            match rest.find(segment) {
                Some(at) => rest = &rest[at + segment.len()..],
                None => return false,
            }
        }
    }
    !anchored_end || rest.is_empty() || segments.is_empty()
}

/// Token types for lexing
#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(String),
    Text(String),
    Null,
    Bool(bool),
    Gt,
    Lt,
    Range,
    Percent,
    At,
    Not,
    And,
    Or,
    LParen,
    RParen,
    Eof,
}

struct Lexer {
    input: Vec<char>,
    pos: usize,
}

impl Lexer {
    fn new(input: &str) -> Self {
        Lexer {
            input: input.chars().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.input.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.input.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek();
        self.pos += 1;
        c
    }

    fn read_number(&mut self) -> Token {
        let mut number = String::new();
        if self.peek() == Some('-') {
            number.push('-');
            self.advance();
        }
        let mut seen_dot = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                number.push(c);
                self.advance();
            } else if c == '.'
                && !seen_dot
                && self.peek_at(1).map_or(false, |n| n.is_ascii_digit())
            {
                seen_dot = true;
                number.push(c);
                self.advance();
            } else {
                break;
            }
        }
        Token::Number(number)
    }

    /// Single-quoted text, `''` standing for one quote.
    fn read_text(&mut self) -> std::result::Result<Token, String> {
        self.advance();
        let mut text = String::new();
        while let Some(c) = self.advance() {
            if c == '\'' {
                if self.peek() == Some('\'') {
                    self.advance();
                    text.push('\'');
                } else {
                    return Ok(Token::Text(text));
                }
            } else {
                text.push(c);
            }
        }
        Err("unterminated string literal".to_string())
    }

    fn next_token(&mut self) -> std::result::Result<Token, String> {
        while self.peek().map_or(false, char::is_whitespace) {
            self.advance();
        }
        let c = match self.peek() {
            None => return Ok(Token::Eof),
            Some(c) => c,
        };
        match c {
            '(' => { self.advance(); Ok(Token::LParen) }
            ')' => { self.advance(); Ok(Token::RParen) }
            '>' => { self.advance(); Ok(Token::Gt) }
            '<' => { self.advance(); Ok(Token::Lt) }
            '%' => { self.advance(); Ok(Token::Percent) }
            '@' => { self.advance(); Ok(Token::At) }
            '!' => { self.advance(); Ok(Token::Not) }
            '&' => { self.advance(); Ok(Token::And) }
            '|' => { self.advance(); Ok(Token::Or) }
            '.' if self.peek_at(1) == Some('.') => {
                self.pos += 2;
                Ok(Token::Range)
            }
            '\'' => self.read_text(),
            '-' if self.peek_at(1).map_or(false, |n| n.is_ascii_digit()) => Ok(self.read_number()),
            _ if c.is_ascii_digit() => Ok(self.read_number()),
            _ if c.is_alphabetic() => {
                let mut word = String::new();
                while let Some(c) = self.peek().filter(|c| c.is_alphanumeric()) {
                    word.push(c);
                    self.advance();
                }
                match word.to_lowercase().as_str() {
                    "null" => Ok(Token::Null),
                    "true" => Ok(Token::Bool(true)),
                    "false" => Ok(Token::Bool(false)),
                    _ => Err(format!("unexpected word '{}'", word)),
                }
            }
            _ => Err(format!("unexpected character '{}'", c)),
        }
    }
}

struct Parser<'a> {
    lexer: Lexer,
    current: Token,
    column_type: &'a ColumnType,
}

impl<'a> Parser<'a> {
    fn new(input: &str, column_type: &'a ColumnType) -> std::result::Result<Self, String> {
        let mut lexer = Lexer::new(input);
        let current = lexer.next_token()?;
        Ok(Parser {
            lexer,
            current,
            column_type,
        })
    }

    fn advance(&mut self) -> std::result::Result<(), String> {
        self.current = self.lexer.next_token()?;
        Ok(())
    }

    fn parse(&mut self) -> std::result::Result<FilterExpr, String> {
        let expr = self.parse_or()?;
        if self.current != Token::Eof {
            return Err(format!("unexpected {:?}", self.current));
        }
        Ok(expr)
    }

    fn parse_or(&mut self) -> std::result::Result<FilterExpr, String> {
        let mut left = self.parse_and()?;
        while self.current == Token::Or {
            self.advance()?;
            let right = self.parse_and()?;
            left = FilterExpr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> std::result::Result<FilterExpr, String> {
        let mut left = self.parse_not()?;
        while self.current == Token::And {
            self.advance()?;
            let right = self.parse_not()?;
            left = FilterExpr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> std::result::Result<FilterExpr, String> {
        match self.current {
            Token::Not => {
                self.advance()?;
                Ok(FilterExpr::Not(Box::new(self.parse_not()?)))
            }
            Token::LParen => {
                self.advance()?;
                let expr = self.parse_or()?;
                if self.current != Token::RParen {
                    return Err("expected ')'".to_string());
                }
                self.advance()?;
                Ok(expr)
            }
            Token::Null => {
                self.advance()?;
                Ok(FilterExpr::IsNull)
            }
            Token::At => {
                if !matches!(self.column_type, ColumnType::String { .. }) {
                    return Err("'@' applies to text columns only".to_string());
                }
                self.advance()?;
                self.parse_term(true)
            }
            _ => self.parse_term(false),
        }
    }

    fn parse_term(&mut self, ci: bool) -> std::result::Result<FilterExpr, String> {
        match self.current.clone() {
            Token::Gt => {
                self.advance()?;
                let value = self.literal(ci)?;
                Ok(FilterExpr::Compare { op: CompareOp::Gt, value, case_insensitive: ci })
            }
            Token::Lt => {
                self.advance()?;
                let value = self.literal(ci)?;
                Ok(FilterExpr::Compare { op: CompareOp::Lt, value, case_insensitive: ci })
            }
            Token::Range => {
                self.advance()?;
                let value = self.literal(ci)?;
                Ok(FilterExpr::Compare { op: CompareOp::Le, value, case_insensitive: ci })
            }
            Token::Percent => self.parse_like(Vec::new(), ci),
            _ => {
                let start = self.current.clone();
                let from = self.literal(ci)?;
                match self.current {
                    Token::Range => {
                        self.advance()?;
                        if self.starts_literal() {
                            let to = self.literal(ci)?;
                            Ok(FilterExpr::Between { from, to, case_insensitive: ci })
                        } else {
                            Ok(FilterExpr::Compare { op: CompareOp::Ge, value: from, case_insensitive: ci })
                        }
                    }
                    Token::Percent => match start {
                        Token::Text(text) => {
                            let text = if ci { text.to_lowercase() } else { text };
                            self.parse_like(vec![LikePart::Text(text)], ci)
                        }
                        _ => Err("patterns need text literals".to_string()),
                    },
                    _ => Ok(FilterExpr::Compare { op: CompareOp::Eq, value: from, case_insensitive: ci }),
                }
            }
        }
    }

    fn parse_like(&mut self, mut pattern: Vec<LikePart>, ci: bool) -> std::result::Result<FilterExpr, String> {
        if !matches!(self.column_type, ColumnType::String { .. }) {
            return Err("patterns apply to text columns only".to_string());
        }
        loop {
            match self.current.clone() {
                Token::Percent => {
                    if pattern.last() != Some(&LikePart::AnyChars) {
                        pattern.push(LikePart::AnyChars);
                    }
                }
                Token::Text(text) if pattern.last() == Some(&LikePart::AnyChars) => {
                    pattern.push(LikePart::Text(if ci { text.to_lowercase() } else { text }));
                }
                _ => break,
            }
            self.advance()?;
        }
        if !pattern.iter().any(|p| matches!(p, LikePart::Text(_))) {
            return Err("pattern has no text".to_string());
        }
        Ok(FilterExpr::Like { pattern, case_insensitive: ci })
    }

    fn starts_literal(&self) -> bool {
        matches!(self.current, Token::Number(_) | Token::Text(_) | Token::Bool(_))
    }

    /// Consume one literal and convert it to the column's type.
    fn literal(&mut self, ci: bool) -> std::result::Result<ColumnValue, String> {
        let value = match (&self.current, self.column_type) {
            (Token::Number(n), ColumnType::Int) => match n.parse::<i64>() {
                Ok(v) => ColumnValue::Int(v),
                Err(_) => ColumnValue::Decimal(parse_decimal(n)?),
            },
            (Token::Number(n), ColumnType::Float) => {
                ColumnValue::Float(n.parse::<f64>().map_err(|e| e.to_string())?)
            }
            (Token::Number(n), ColumnType::Decimal { .. }) => ColumnValue::Decimal(parse_decimal(n)?),
            (Token::Text(t), ColumnType::String { .. }) => {
                ColumnValue::String(if ci { t.to_lowercase() } else { t.clone() })
            }
            (Token::Text(t), ColumnType::DateTime) => ColumnValue::DateTime(
                parse_datetime(t).ok_or_else(|| format!("invalid date '{}'", t))?,
            ),
            (Token::Text(t), ColumnType::ZonedDateTime) => {
                let naive = parse_datetime(t).ok_or_else(|| format!("invalid date '{}'", t))?;
                ColumnValue::ZonedDateTime(Utc.from_utc_datetime(&naive))
            }
            (Token::Bool(b), ColumnType::Bool) => ColumnValue::Bool(*b),
            (Token::Eof, _) => return Err("unexpected end of filter".to_string()),
            (token, column_type) => {
                return Err(format!("{:?} is not a literal of type {}", token, column_type))
            }
        };
        self.advance()?;
        Ok(value)
    }
}

fn parse_decimal(text: &str) -> std::result::Result<Decimal, String> {
    Decimal::from_str(text).map_err(|e| e.to_string())
}

/// Parse a filter for `column`.
///
/// # Example
///
/// ```
/// use livecursor::{filter::parse_filter, Column, ColumnType, ColumnValue};
///
/// let column = Column::new("amount", ColumnType::Int, true);
/// let filter = parse_filter(&column, "..5|10").unwrap();
/// assert!(filter.matches(&ColumnValue::Int(3)));
/// assert!(filter.matches(&ColumnValue::Int(10)));
/// assert!(!filter.matches(&ColumnValue::Int(7)));
/// assert!(!filter.matches(&ColumnValue::Null));
/// ```
pub fn parse_filter(column: &Column, text: &str) -> Result<FilterExpr> {
    let invalid = |reason: String| CursorError::InvalidFilter {
        column: column.name.clone(),
        reason,
    };
    if text.trim().is_empty() {
        return Err(invalid("filter is empty".to_string()));
    }
    let mut parser = Parser::new(text, &column.column_type).map_err(invalid)?;
    parser.parse().map_err(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn int_filter(text: &str) -> FilterExpr {
        parse_filter(&Column::new("n", ColumnType::Int, true), text).unwrap()
    }

    fn text_filter(text: &str) -> FilterExpr {
        parse_filter(&Column::new("s", ColumnType::text(), true), text).unwrap()
    }

    fn matching(expr: &FilterExpr, values: &[i64]) -> Vec<i64> {
        values
            .iter()
            .copied()
            .filter(|v| expr.matches(&ColumnValue::Int(*v)))
            .collect()
    }

    #[test]
    fn test_numeric_terms() {
        let values = [1, 3, 5, 6, 7, 11, 15, 16];
        assert_eq!(matching(&int_filter("5"), &values), vec![5]);
        assert_eq!(matching(&int_filter(">6"), &values), vec![7, 11, 15, 16]);
        assert_eq!(matching(&int_filter("<3"), &values), vec![1]);
        assert_eq!(matching(&int_filter("..5"), &values), vec![1, 3, 5]);
        assert_eq!(matching(&int_filter("6.."), &values), vec![6, 7, 11, 15, 16]);
        assert_eq!(matching(&int_filter("11..15"), &values), vec![11, 15]);
        assert_eq!(matching(&int_filter("!3"), &values), vec![1, 5, 6, 7, 11, 15, 16]);
        assert_eq!(matching(&int_filter("-1..1"), &values), vec![1]);
    }

    #[test]
    fn test_boolean_connectives() {
        let values = [1, 3, 5, 6, 7, 11, 15, 16];
        assert_eq!(matching(&int_filter("1|15"), &values), vec![1, 15]);
        assert_eq!(matching(&int_filter(">5&<11"), &values), vec![6, 7]);
        assert_eq!(
            matching(&int_filter("(..3|15..)&!null&!16"), &values),
            vec![1, 3, 15]
        );
    }

    #[test]
    fn test_null_semantics() {
        assert!(int_filter("null").matches(&ColumnValue::Null));
        assert!(!int_filter("!null").matches(&ColumnValue::Null));
        assert!(int_filter("!null").matches(&ColumnValue::Int(0)));
        // negated comparisons stay unknown on NULL
        assert!(!int_filter("!3").matches(&ColumnValue::Null));
        assert!(int_filter("null|3").matches(&ColumnValue::Null));
    }

    #[test]
    fn test_text_patterns() {
        let starts = text_filter("'abc'%");
        assert!(starts.matches(&"abcdef".into()));
        assert!(!starts.matches(&"xabc".into()));

        let ends = text_filter("%'5'");
        assert!(ends.matches(&"125".into()));
        assert!(!ends.matches(&"512".into()));

        let contains = text_filter("%'ef'%");
        assert!(contains.matches(&"abcdefgh".into()));
        assert!(!contains.matches(&"abc".into()));

        let around = text_filter("'a'%'c'");
        assert!(around.matches(&"abbbc".into()));
        assert!(!around.matches(&"abbbcd".into()));

        let range = text_filter("'a'..'b'");
        assert!(range.matches(&"a".into()));
        assert!(range.matches(&"az".into()));
        assert!(!range.matches(&"bz".into()));

        assert!(text_filter("'it''s'").matches(&"it's".into()));
    }

    #[test]
    fn test_case_insensitive() {
        let f = text_filter("@'ABC'%");
        assert!(f.matches(&"abcd".into()));
        assert!(f.matches(&"AbCd".into()));
        assert!(text_filter("@'Foo'").matches(&"FOO".into()));
        assert!(!text_filter("'Foo'").matches(&"FOO".into()));
    }

    #[test]
    fn test_date_literals() {
        let column = Column::new("d", ColumnType::DateTime, true);
        let f = parse_filter(&column, "'20131124'..").unwrap();
        let day = |d| {
            ColumnValue::DateTime(
                NaiveDate::from_ymd_opt(2013, 11, d).unwrap().and_hms_opt(10, 0, 0).unwrap(),
            )
        };
        assert!(f.matches(&day(24)));
        assert!(!f.matches(&day(23)));
    }

    #[test]
    fn test_decimal_column() {
        let column = Column::new("cost", ColumnType::decimal(5, 2), true);
        let f = parse_filter(&column, ">1.5").unwrap();
        assert!(f.matches(&ColumnValue::Decimal(Decimal::from_str("1.51").unwrap())));
        assert!(!f.matches(&ColumnValue::Decimal(Decimal::from_str("1.50").unwrap())));
    }

    #[test]
    fn test_invalid_filters() {
        let int = Column::new("n", ColumnType::Int, true);
        for text in ["", "  ", "||", "5||6", ">", "(5", "'abc'", "'abc'%", "5 6", "maybe"] {
            let err = parse_filter(&int, text).unwrap_err();
            assert!(matches!(err, CursorError::InvalidFilter { .. }), "{}", text);
        }
        let text = Column::new("s", ColumnType::text(), true);
        assert!(parse_filter(&text, "5").is_err());
        assert!(parse_filter(&text, "'unterminated").is_err());
        assert!(parse_filter(&text, "%%").is_err());
    }

    #[test]
    fn test_column_filter_variants() {
        let single = ColumnFilter::Single(ColumnValue::Int(5));
        assert!(single.matches(&ColumnValue::Int(5)));
        assert!(!single.matches(&ColumnValue::Null));
        assert_eq!(single.exact_value(), Some(&ColumnValue::Int(5)));

        let null = ColumnFilter::Single(ColumnValue::Null);
        assert!(null.matches(&ColumnValue::Null));
        assert!(null.exact_value().is_none());

        let range = ColumnFilter::Range(ColumnValue::Int(2), ColumnValue::Int(4));
        assert!(range.matches(&ColumnValue::Int(2)));
        assert!(range.matches(&ColumnValue::Int(4)));
        assert!(!range.matches(&ColumnValue::Int(5)));
    }
}
