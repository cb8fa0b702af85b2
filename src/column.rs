/// Column definitions and values
///
/// A `Column` describes one typed field of a relation. A `ColumnValue` is a
/// single cell. Values are checked and coerced against their column on every
/// write: decimals are rounded half-up to the declared scale and rejected when
/// the integer part does not fit the declared precision, strings are checked
/// against their maximum length, and zoned timestamps are always held in UTC.
///
/// `ColumnValue` has a total order (NULL sorts lowest) and a hash that agrees
/// with equality, so rows and key tuples can live in ordered maps and hash
/// sets.

use crate::error::{CursorError, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Largest precision a decimal column may declare.
pub const MAX_DECIMAL_PRECISION: u32 = 28;

/// Column data types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ColumnType {
    Int,
    Float,
    Decimal { precision: u32, scale: u32 },
    String {
        #[serde(default)]
        max_length: Option<usize>,
    },
    DateTime,
    ZonedDateTime,
    Bool,
    Blob,
}

impl ColumnType {
    /// Unbounded text column
    pub fn text() -> Self {
        ColumnType::String { max_length: None }
    }

    pub fn varchar(max_length: usize) -> Self {
        ColumnType::String {
            max_length: Some(max_length),
        }
    }

    pub fn decimal(precision: u32, scale: u32) -> Self {
        ColumnType::Decimal { precision, scale }
    }

    /// Two columns are comparable when they hold the same kind of value.
    /// Lengths, precisions and scales do not matter.
    pub fn is_comparable_with(&self, other: &ColumnType) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ColumnType::Int | ColumnType::Float | ColumnType::Decimal { .. }
        )
    }

    /// Whether a non-null value of this kind can be compared with the
    /// column's values.
    pub fn accepts(&self, value: &ColumnValue) -> bool {
        match value {
            ColumnValue::Null => true,
            ColumnValue::Int(_) | ColumnValue::Float(_) | ColumnValue::Decimal(_) => self.is_numeric(),
            ColumnValue::String(_) => matches!(self, ColumnType::String { .. }),
            ColumnValue::DateTime(_) => *self == ColumnType::DateTime,
            ColumnValue::ZonedDateTime(_) => *self == ColumnType::ZonedDateTime,
            ColumnValue::Bool(_) => *self == ColumnType::Bool,
            ColumnValue::Blob(_) => *self == ColumnType::Blob,
        }
    }

    /// Widen an INT literal to the column's numeric representation so it
    /// compares equal to stored values. Other values are returned unchanged.
    pub fn normalize(&self, value: ColumnValue) -> ColumnValue {
        match (self, value) {
            (ColumnType::Float, ColumnValue::Int(i)) => ColumnValue::Float(i as f64),
            (ColumnType::Decimal { .. }, ColumnValue::Int(i)) => ColumnValue::Decimal(Decimal::from(i)),
            (_, value) => value,
        }
    }

    /// Whether `value` has exactly the representation stored in this column.
    pub fn is_native(&self, value: &ColumnValue) -> bool {
        matches!(
            (self, value),
            (ColumnType::Int, ColumnValue::Int(_))
                | (ColumnType::Float, ColumnValue::Float(_))
                | (ColumnType::Decimal { .. }, ColumnValue::Decimal(_))
                | (ColumnType::String { .. }, ColumnValue::String(_))
                | (ColumnType::DateTime, ColumnValue::DateTime(_))
                | (ColumnType::ZonedDateTime, ColumnValue::ZonedDateTime(_))
                | (ColumnType::Bool, ColumnValue::Bool(_))
                | (ColumnType::Blob, ColumnValue::Blob(_))
        )
    }

    /// Parse a textual literal (as used for column defaults) into a value of
    /// this type. Returns `None` when the text is not a valid literal.
    pub fn parse_literal(&self, text: &str) -> Option<ColumnValue> {
        let text = text.trim();
        if text.eq_ignore_ascii_case("null") {
            return Some(ColumnValue::Null);
        }
        match self {
            ColumnType::Int => text.parse::<i64>().ok().map(ColumnValue::Int),
            ColumnType::Float => text.parse::<f64>().ok().map(ColumnValue::Float),
            ColumnType::Decimal { .. } => Decimal::from_str(text).ok().map(ColumnValue::Decimal),
            ColumnType::String { .. } => Some(ColumnValue::String(text.to_string())),
            ColumnType::DateTime => parse_datetime(text).map(ColumnValue::DateTime),
            ColumnType::ZonedDateTime => DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|dt| ColumnValue::ZonedDateTime(dt.with_timezone(&Utc))),
            ColumnType::Bool => match text.to_ascii_lowercase().as_str() {
                "true" | "1" => Some(ColumnValue::Bool(true)),
                "false" | "0" => Some(ColumnValue::Bool(false)),
                _ => None,
            },
            ColumnType::Blob => parse_hex(text).map(ColumnValue::Blob),
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Int => write!(f, "INT"),
            ColumnType::Float => write!(f, "REAL"),
            ColumnType::Decimal { precision, scale } => write!(f, "DECIMAL({},{})", precision, scale),
            ColumnType::String { max_length: Some(n) } => write!(f, "VARCHAR({})", n),
            ColumnType::String { max_length: None } => write!(f, "TEXT"),
            ColumnType::DateTime => write!(f, "DATETIME"),
            ColumnType::ZonedDateTime => write!(f, "DATETIME WITH TIME ZONE"),
            ColumnType::Bool => write!(f, "BIT"),
            ColumnType::Blob => write!(f, "BLOB"),
        }
    }
}

/// Accepts `YYYY-MM-DD HH:MM:SS[.fff]`, `YYYY-MM-DDTHH:MM:SS[.fff]`,
/// `YYYY-MM-DD` and `YYYYMMDD`.
pub fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
            return Some(dt);
        }
    }
    for format in ["%Y-%m-%d", "%Y%m%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return date.and_hms_opt(0, 0, 0);
        }
    }
    None
}

fn parse_hex(text: &str) -> Option<Vec<u8>> {
    let digits = text.strip_prefix("0x").unwrap_or(text);
    if !digits.is_ascii() || digits.len() % 2 != 0 {
        return None;
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&digits[i..i + 2], 16).ok())
        .collect()
}

/// Column value enum to support multiple types
#[derive(Debug, Clone)]
pub enum ColumnValue {
    Null,
    Int(i64),
    Float(f64),
    Decimal(Decimal),
    String(String),
    DateTime(NaiveDateTime),
    ZonedDateTime(DateTime<Utc>),
    Bool(bool),
    Blob(Vec<u8>),
}

impl ColumnValue {
    /// Build a zoned timestamp value, normalizing it to UTC.
    pub fn zoned<Tz: TimeZone>(value: DateTime<Tz>) -> Self {
        ColumnValue::ZonedDateTime(value.with_timezone(&Utc))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ColumnValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ColumnValue::Float(v) => Some(*v),
            ColumnValue::Int(v) => Some(*v as f64),
            ColumnValue::Decimal(d) => d.to_f64(),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            ColumnValue::Decimal(d) => Some(*d),
            ColumnValue::Int(v) => Some(Decimal::from(*v)),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&str> {
        match self {
            ColumnValue::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ColumnValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            ColumnValue::DateTime(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_zoned(&self) -> Option<DateTime<Utc>> {
        match self {
            ColumnValue::ZonedDateTime(v) => Some(*v),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ColumnValue::Null => "NULL",
            ColumnValue::Int(_) => "INT",
            ColumnValue::Float(_) => "REAL",
            ColumnValue::Decimal(_) => "DECIMAL",
            ColumnValue::String(_) => "TEXT",
            ColumnValue::DateTime(_) => "DATETIME",
            ColumnValue::ZonedDateTime(_) => "DATETIME WITH TIME ZONE",
            ColumnValue::Bool(_) => "BIT",
            ColumnValue::Blob(_) => "BLOB",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            ColumnValue::Null => 0,
            ColumnValue::Bool(_) => 1,
            ColumnValue::Int(_) => 2,
            ColumnValue::Float(_) => 3,
            ColumnValue::Decimal(_) => 4,
            ColumnValue::String(_) => 5,
            ColumnValue::DateTime(_) => 6,
            ColumnValue::ZonedDateTime(_) => 7,
            ColumnValue::Blob(_) => 8,
        }
    }

    /// Render the value as one CSV field: `NULL` for null, double-quoted with
    /// doubled quotes when the text contains a quote, a comma or a line break.
    pub fn to_csv_field(&self) -> String {
        let text = self.to_string();
        if text.contains('"') || text.contains(',') || text.contains('\n') || text.contains('\r') {
            format!("\"{}\"", text.replace('"', "\"\""))
        } else {
            text
        }
    }
}

impl PartialEq for ColumnValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ColumnValue {}

impl PartialOrd for ColumnValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ColumnValue {
    fn cmp(&self, other: &Self) -> Ordering {
        use ColumnValue::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Bool(a), Bool(b)) => a.cmp(b),
            (Int(a), Int(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.total_cmp(b),
            (Decimal(a), Decimal(b)) => a.cmp(b),
            (String(a), String(b)) => a.cmp(b),
            (DateTime(a), DateTime(b)) => a.cmp(b),
            (ZonedDateTime(a), ZonedDateTime(b)) => a.cmp(b),
            (Blob(a), Blob(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl Hash for ColumnValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            ColumnValue::Null => {}
            ColumnValue::Int(v) => v.hash(state),
            ColumnValue::Float(v) => v.to_bits().hash(state),
            // Decimal's hash ignores trailing zeros, matching its Eq
            ColumnValue::Decimal(v) => v.hash(state),
            ColumnValue::String(v) => v.hash(state),
            ColumnValue::DateTime(v) => v.hash(state),
            ColumnValue::ZonedDateTime(v) => v.hash(state),
            ColumnValue::Bool(v) => v.hash(state),
            ColumnValue::Blob(v) => v.hash(state),
        }
    }
}

impl fmt::Display for ColumnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnValue::Null => write!(f, "NULL"),
            ColumnValue::Int(v) => write!(f, "{}", v),
            ColumnValue::Float(v) => write!(f, "{}", v),
            ColumnValue::Decimal(v) => write!(f, "{}", v),
            ColumnValue::String(v) => write!(f, "{}", v),
            ColumnValue::DateTime(v) => write!(f, "{}", v.format("%Y-%m-%d %H:%M:%S%.f")),
            ColumnValue::ZonedDateTime(v) => write!(f, "{}", v.format("%Y-%m-%d %H:%M:%S%.f%:z")),
            ColumnValue::Bool(v) => write!(f, "{}", v),
            ColumnValue::Blob(bytes) => {
                write!(f, "0x")?;
                for b in bytes {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }
    }
}

impl From<i64> for ColumnValue {
    fn from(v: i64) -> Self {
        ColumnValue::Int(v)
    }
}

impl From<i32> for ColumnValue {
    fn from(v: i32) -> Self {
        ColumnValue::Int(v as i64)
    }
}

impl From<f64> for ColumnValue {
    fn from(v: f64) -> Self {
        ColumnValue::Float(v)
    }
}

impl From<Decimal> for ColumnValue {
    fn from(v: Decimal) -> Self {
        ColumnValue::Decimal(v)
    }
}

impl From<&str> for ColumnValue {
    fn from(v: &str) -> Self {
        ColumnValue::String(v.to_string())
    }
}

impl From<String> for ColumnValue {
    fn from(v: String) -> Self {
        ColumnValue::String(v)
    }
}

impl From<bool> for ColumnValue {
    fn from(v: bool) -> Self {
        ColumnValue::Bool(v)
    }
}

impl From<NaiveDateTime> for ColumnValue {
    fn from(v: NaiveDateTime) -> Self {
        ColumnValue::DateTime(v)
    }
}

impl From<DateTime<Utc>> for ColumnValue {
    fn from(v: DateTime<Utc>) -> Self {
        ColumnValue::ZonedDateTime(v)
    }
}

impl<T: Into<ColumnValue>> From<Option<T>> for ColumnValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(ColumnValue::Null, Into::into)
    }
}

/// Compare two values the way filters see them: numbers compare by value
/// across INT, REAL and DECIMAL. Returns `None` when either side is NULL or
/// the values are of unrelated kinds.
pub fn compare_values(a: &ColumnValue, b: &ColumnValue) -> Option<Ordering> {
    use ColumnValue::*;
    match (a, b) {
        (Null, _) | (_, Null) => None,
        (Int(_), Int(_))
        | (Decimal(_), Decimal(_))
        | (Float(_), Float(_))
        | (String(_), String(_))
        | (DateTime(_), DateTime(_))
        | (ZonedDateTime(_), ZonedDateTime(_))
        | (Bool(_), Bool(_))
        | (Blob(_), Blob(_)) => Some(a.cmp(b)),
        (Int(_), Decimal(_)) | (Decimal(_), Int(_)) => {
            Some(a.as_decimal()?.cmp(&b.as_decimal()?))
        }
        (Float(_), Int(_) | Decimal(_)) | (Int(_) | Decimal(_), Float(_)) => {
            a.as_f64()?.partial_cmp(&b.as_f64()?)
        }
        _ => None,
    }
}

/// Default applied to a null field on insert
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnDefault {
    /// A literal in the column's textual form, e.g. `"0"` or `"2024-01-01"`
    Value(String),
    /// Next value of the named sequence
    NextVal(String),
}

/// A typed, named field of a relation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(flatten)]
    pub column_type: ColumnType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default)]
    pub default: Option<ColumnDefault>,
}

fn default_nullable() -> bool {
    true
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType, nullable: bool) -> Self {
        Column {
            name: name.into(),
            column_type,
            nullable,
            default: None,
        }
    }

    pub fn with_default(mut self, default: ColumnDefault) -> Self {
        self.default = Some(default);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn column_type(&self) -> ColumnType {
        self.column_type
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    /// Check a value against this column and convert it to the stored form.
    ///
    /// INT values are accepted by REAL and DECIMAL columns. Decimals are
    /// rounded half-up to the declared scale; a value whose integer part
    /// needs more than `precision - scale` digits is rejected.
    pub fn coerce(&self, value: ColumnValue) -> Result<ColumnValue> {
        use ColumnValue as V;
        if value.is_null() {
            return if self.nullable {
                Ok(V::Null)
            } else {
                Err(CursorError::NullViolation(self.name.clone()))
            };
        }
        match (self.column_type, value) {
            (ColumnType::Int, v @ V::Int(_)) => Ok(v),
            (ColumnType::Float, v @ V::Float(_)) => Ok(v),
            (ColumnType::Float, V::Int(i)) => Ok(V::Float(i as f64)),
            (ColumnType::Decimal { precision, scale }, V::Decimal(d)) => {
                self.fit_decimal(d, precision, scale)
            }
            (ColumnType::Decimal { precision, scale }, V::Int(i)) => {
                self.fit_decimal(Decimal::from(i), precision, scale)
            }
            (ColumnType::String { max_length }, V::String(s)) => match max_length {
                Some(max) if s.chars().count() > max => Err(CursorError::StringTooLong {
                    column: self.name.clone(),
                    length: s.chars().count(),
                    max_length: max,
                }),
                _ => Ok(V::String(s)),
            },
            (ColumnType::DateTime, v @ V::DateTime(_)) => Ok(v),
            (ColumnType::ZonedDateTime, v @ V::ZonedDateTime(_)) => Ok(v),
            (ColumnType::Bool, v @ V::Bool(_)) => Ok(v),
            (ColumnType::Blob, v @ V::Blob(_)) => Ok(v),
            (expected, found) => Err(CursorError::TypeMismatch {
                column: self.name.clone(),
                expected: expected.to_string(),
                found: found.type_name().to_string(),
            }),
        }
    }

    fn fit_decimal(&self, value: Decimal, precision: u32, scale: u32) -> Result<ColumnValue> {
        let mut rounded = value.round_dp_with_strategy(scale, RoundingStrategy::MidpointAwayFromZero);
        let limit = Decimal::from_i128_with_scale(10i128.pow(precision - scale), 0);
        if rounded.abs() >= limit {
            return Err(CursorError::DecimalOverflow {
                column: self.name.clone(),
                value: value.to_string(),
                precision,
                scale,
            });
        }
        rounded.rescale(scale);
        Ok(ColumnValue::Decimal(rounded))
    }
}
