//! # Verb Surface
//!
//! The request/response shapes the core exposes to its dispatcher:
//! `script`, `add_entry`, `remove_entry`, `resync`, `dump_state`,
//! `stop`. No wire format is mandated; these types are the payload a
//! transport (HTTP, a local socket, direct in-process calls) carries.

use serde::{Deserialize, Serialize};

use crate::script::symbols::DiagnosticKind;
use crate::value::AttributeMap;

/// One verb invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "verb", rename_all = "snake_case")]
pub enum Verb {
    Script {
        filename: String,
        #[serde(default)]
        base: Option<String>,
        #[serde(default)]
        autofollow: bool,
    },
    AddEntry {
        uuid: String,
        attrs: AttributeMap,
    },
    RemoveEntry {
        uuid: String,
    },
    Resync,
    DumpState,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    Error,
}

/// One invariant violation, shaped for the diagnostics payload: tagged with the offending entity's line-hash so a caller can
/// map it back to a script line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticEntry {
    pub line: u32,
    pub kind: DiagnosticKind,
    pub message: String,
}

/// The `dump_state()` verb's structured payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpStatePayload {
    pub state: String,
    pub whole_script_hash: Option<String>,
    pub variables: usize,
    pub generators: usize,
    pub conditions: usize,
    pub drivers: usize,
    pub diagnostics: Vec<DiagnosticEntry>,
}

/// Every verb's result: `(status, message, optional structured
/// payload)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl Response {
    pub fn ok(message: impl Into<String>) -> Self {
        Response {
            status: Status::Ok,
            message: message.into(),
            payload: None,
        }
    }

    pub fn ok_with(message: impl Into<String>, payload: impl Serialize) -> Self {
        Response {
            status: Status::Ok,
            message: message.into(),
            payload: serde_json::to_value(payload).ok(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Response {
            status: Status::Error,
            message: message.into(),
            payload: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verb_round_trips_through_json() {
        let verb = Verb::AddEntry {
            uuid: "u".to_string(),
            attrs: AttributeMap::new(),
        };
        let json = serde_json::to_string(&verb).unwrap();
        let back: Verb = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, Verb::AddEntry { .. }));
    }
}
