//! # Protocol Errors
//!
//! Failures a verb dispatch can report back to its caller. Missing
//! attributes themselves are not an error; this type covers malformed verb
//! invocations and wraps [`EngineError`] for everything else.

use thiserror::Error;

use crate::error::EngineError;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("missing dn for uuid '{uuid}'")]
    MissingDn { uuid: String },

    #[error("malformed verb invocation: {0}")]
    MalformedVerb(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}
