//! # Script Value Type System
//!
//! The value domain that flows through bound variables, generator table
//! columns, and backend tuples: integers, floats, strings, opaque
//! byte-strings, and lists of option strings (multi-valued directory
//! attributes before the cartesian-product expander runs, see
//! [`crate::script::router`]).

use serde::{Deserialize, Serialize};
use std::fmt;

/// A single bound value.
///
/// Directory attribute values arrive as text or binary blobs; the script
/// language additionally allows numeric and list-shaped constants.
/// `List` only ever appears as an intermediate
/// attribute value before the change router's cartesian-product expander
/// flattens it into per-fork scalar bindings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScriptValue {
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<ScriptValue>),
}

impl ScriptValue {
    /// Encode this value as an opaque byte string for storage in a
    /// generator table column or for hashing into a differential
    /// fingerprint.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            ScriptValue::Int(n) => n.to_be_bytes().to_vec(),
            ScriptValue::Float(f) => f.to_be_bytes().to_vec(),
            ScriptValue::Str(s) => s.as_bytes().to_vec(),
            ScriptValue::Bytes(b) => b.clone(),
            ScriptValue::List(items) => {
                // Only meaningful once flattened; concatenate as a fallback.
                let mut out = Vec::new();
                for item in items {
                    out.extend(item.to_bytes());
                }
                out
            }
        }
    }

    /// Quote this value for inclusion in a generated SQL condition: integers/floats print in C form, strings are
    /// single-quoted with doubled internal quotes, byte-strings print as
    /// `X'...'`.
    pub fn to_sql_literal(&self) -> String {
        match self {
            ScriptValue::Int(n) => n.to_string(),
            ScriptValue::Float(f) => format!("{f}"),
            ScriptValue::Str(s) => format!("'{}'", s.replace('\'', "''")),
            ScriptValue::Bytes(b) => {
                let mut hex = String::with_capacity(b.len() * 2 + 2);
                hex.push('X');
                hex.push('\'');
                for byte in b {
                    hex.push_str(&format!("{byte:02X}"));
                }
                hex.push('\'');
                hex
            }
            ScriptValue::List(items) => items
                .first()
                .map(ScriptValue::to_sql_literal)
                .unwrap_or_else(|| "NULL".to_string()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScriptValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptValue::Int(n) => write!(f, "{n}"),
            ScriptValue::Float(x) => write!(f, "{x}"),
            ScriptValue::Str(s) => write!(f, "{s}"),
            ScriptValue::Bytes(b) => write!(f, "0x{}", hex_preview(b)),
            ScriptValue::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

fn hex_preview(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// A map of attribute name to one-or-many attribute values, as delivered
/// by the upstream directory collaborator for a single entry.
pub type AttributeMap = std::collections::HashMap<String, Vec<ScriptValue>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_literal_doubles_quotes() {
        let v = ScriptValue::Str("O'Brien".to_string());
        assert_eq!(v.to_sql_literal(), "'O''Brien'");
    }

    #[test]
    fn bytes_literal_is_hex_blob() {
        let v = ScriptValue::Bytes(vec![0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(v.to_sql_literal(), "X'DEADBEEF'");
    }

    #[test]
    fn int_literal_is_plain_decimal() {
        assert_eq!(ScriptValue::Int(-42).to_sql_literal(), "-42");
    }
}
