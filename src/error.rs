//! # Error Types
//!
//! One `thiserror` enum per fallible surface, composed into a
//! crate-wide [`EngineError`]. Only [`TranslationError`] and
//! [`BackendError`] during initial script load propagate as `Err` out of
//! the lifecycle controller's public methods; [`RoutingError`] and
//! analyzer diagnostics are logged and swallowed.

use thiserror::Error;

/// Parser failures: syntax errors, undefined references,
/// duplicate bindings of a variable by the same generator. Each carries
/// the offending line number.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScriptError {
    #[error("line {line}: syntax error: {message}")]
    Syntax { line: u32, message: String },

    #[error("line {line}: undefined reference to '{name}'")]
    UndefinedReference { line: u32, name: String },

    #[error("line {line}: variable '{name}' is bound twice by the same generator")]
    DuplicateBinding { line: u32, name: String },
}

/// Translation failures: any statement-prep or
/// table-creation failure is fatal and transitions the controller to
/// *Broken*.
#[derive(Debug, Error)]
pub enum TranslationError {
    #[error("failed to open database at {path}: {source}")]
    OpenDatabase {
        path: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("failed to create table '{table}': {source}")]
    CreateTable {
        table: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("failed to prepare statement '{name}': {source}")]
    PrepareStatement {
        name: String,
        #[source]
        source: rusqlite::Error,
    },
}

/// Backend load failures: fatal for the owning driver-output
/// only, not for the whole script.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend name '{0}' must not contain path separators")]
    InvalidName(String),

    #[error("failed to load backend library at {path}: {source}")]
    Load {
        path: String,
        #[source]
        source: libloading::Error,
    },

    #[error("backend '{backend}' is missing required symbol '{symbol}'")]
    MissingSymbol { backend: String, symbol: String },

    #[error("backend '{backend}' open() returned a null handle")]
    OpenFailed { backend: String },

    #[error("backend '{backend}' instance is not in a state that allows {op}")]
    InvalidState { backend: String, op: &'static str },
}

/// Runtime routing failures: logged and the offending
/// event is dropped; the system continues.
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("database error while routing uuid {uuid}: {source}")]
    Database {
        uuid: String,
        #[source]
        source: rusqlite::Error,
    },
}

/// Top-level error type for fallible public entry points.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error(transparent)]
    Translation(#[from] TranslationError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
