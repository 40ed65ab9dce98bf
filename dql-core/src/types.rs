use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

/// DynamoDB-style typed value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Number (stored as string for precision)
    N(String),
    /// String
    S(String),
    /// Binary
    B(Bytes),
    /// Boolean
    Bool(bool),
    /// Null
    Null,
    /// List
    L(Vec<Value>),
    /// Map
    M(HashMap<String, Value>),
    /// Number set
    NS(Vec<String>),
    /// String set
    SS(Vec<String>),
    /// Binary set
    BS(Vec<Bytes>),
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Value::S(s.into())
    }

    pub fn number(n: impl ToString) -> Self {
        Value::N(n.to_string())
    }

    pub fn binary(b: impl Into<Bytes>) -> Self {
        Value::B(b.into())
    }

    pub fn map(m: HashMap<String, Value>) -> Self {
        Value::M(m)
    }

    pub fn as_string(&self) -> Option<&str> {
        match self {
            Value::S(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::N(n) => n.parse().ok(),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&HashMap<String, Value>> {
        match self {
            Value::M(m) => Some(m),
            _ => None,
        }
    }

    /// Store type descriptor, as used by `attribute_type`.
    pub fn type_code(&self) -> &'static str {
        match self {
            Value::N(_) => "N",
            Value::S(_) => "S",
            Value::B(_) => "B",
            Value::Bool(_) => "BOOL",
            Value::Null => "NULL",
            Value::L(_) => "L",
            Value::M(_) => "M",
            Value::NS(_) => "NS",
            Value::SS(_) => "SS",
            Value::BS(_) => "BS",
        }
    }

    /// Identity of a key value. Numbers are compared by numeric value, so
    /// `1`, `1.0` and `1e0` share one identity.
    pub fn key_text(&self) -> String {
        match self {
            Value::N(n) => format!("N:{}", canonical_number(n).unwrap_or_else(|| n.clone())),
            other => format!("{}:{}", other.type_code(), other),
        }
    }

    /// Ordering between two scalars of the same kind. Numbers compare
    /// numerically; anything else across kinds is unordered.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::N(l), Value::N(r)) => {
                let l: f64 = l.parse().ok()?;
                let r: f64 = r.parse().ok()?;
                l.partial_cmp(&r)
            }
            (Value::S(l), Value::S(r)) => Some(l.cmp(r)),
            (Value::B(l), Value::B(r)) => Some(l.cmp(r)),
            (Value::Bool(l), Value::Bool(r)) => Some(l.cmp(r)),
            _ => None,
        }
    }

    /// Equality with numeric normalization (`1` equals `1.0`).
    pub fn loosely_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::N(_), Value::N(_)) => self.compare(other) == Some(Ordering::Equal),
            _ => self == other,
        }
    }
}

/// Exact canonical form of a decimal number: significant digits without
/// leading or trailing zeros, then the decimal exponent of the first digit.
/// `None` when the text is not a decimal number.
pub fn canonical_number(text: &str) -> Option<String> {
    let text = text.trim();
    let (negative, rest) = match text.as_bytes().first()? {
        b'-' => (true, &text[1..]),
        b'+' => (false, &text[1..]),
        _ => (false, text),
    };
    let (mantissa, exponent) = match rest.find(['e', 'E']) {
        Some(at) => (&rest[..at], rest[at + 1..].parse::<i64>().ok()?),
        None => (rest, 0),
    };
    let (int_part, frac_part) = mantissa.split_once('.').unwrap_or((mantissa, ""));
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_part.bytes().chain(frac_part.bytes()).all(|b| b.is_ascii_digit()) {
        return None;
    }

    let digits = format!("{}{}", int_part, frac_part);
    let leading = digits.len() - digits.trim_start_matches('0').len();
    let significant = digits.trim_start_matches('0').trim_end_matches('0');
    if significant.is_empty() {
        return Some("0".to_string());
    }
    let point = (int_part.len() as i64)
        .checked_sub(leading as i64)?
        .checked_add(exponent)?;
    Some(format!("{}0.{}e{}", if negative { "-" } else { "" }, significant, point))
}

fn write_escaped(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    f.write_str("\"")?;
    for ch in s.chars() {
        match ch {
            '"' => f.write_str("\\\"")?,
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            '\t' => f.write_str("\\t")?,
            '\r' => f.write_str("\\r")?,
            c => write!(f, "{}", c)?,
        }
    }
    f.write_str("\"")
}

fn write_binary(f: &mut fmt::Formatter<'_>, b: &[u8]) -> fmt::Result {
    f.write_str("b\"")?;
    for &byte in b {
        match byte {
            b'"' => f.write_str("\\\"")?,
            b'\\' => f.write_str("\\\\")?,
            0x20..=0x7e => write!(f, "{}", byte as char)?,
            _ => write!(f, "\\x{:02x}", byte)?,
        }
    }
    f.write_str("\"")
}

/// Renders the value as a DQL literal that parses back to the same value.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::N(n) => f.write_str(n),
            Value::S(s) => write_escaped(f, s),
            Value::B(b) => write_binary(f, b),
            Value::Bool(true) => f.write_str("TRUE"),
            Value::Bool(false) => f.write_str("FALSE"),
            Value::Null => f.write_str("NULL"),
            Value::L(items) => {
                f.write_str("[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                f.write_str("]")
            }
            Value::M(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                f.write_str("{")?;
                for (i, k) in keys.into_iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write_escaped(f, k)?;
                    write!(f, ": {}", map[k])?;
                }
                f.write_str("}")
            }
            Value::NS(set) => {
                f.write_str("(")?;
                f.write_str(&set.join(", "))?;
                f.write_str(")")
            }
            Value::SS(set) => {
                f.write_str("(")?;
                for (i, s) in set.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write_escaped(f, s)?;
                }
                f.write_str(")")
            }
            Value::BS(set) => {
                f.write_str("(")?;
                for (i, b) in set.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write_binary(f, b)?;
                }
                f.write_str(")")
            }
        }
    }
}

/// Item - a map of attribute names to values
pub type Item = HashMap<String, Value>;
