//! # Verb Surface
//!
//! The request/response boundary around the script engine core: [`wire`] defines the verb and response shapes, [`error`] the
//! failures a dispatch can report, and [`handler`] maps one onto the
//! other by driving a [`crate::script::controller::Controller`]. No
//! transport is mandated; [`Handler`] is meant to be wrapped by
//! whatever carries it (a local socket, an HTTP endpoint, or — as in
//! this crate's binary — direct in-process calls).

pub mod error;
pub mod handler;
pub mod wire;

pub use error::ProtocolError;
pub use handler::Handler;
pub use wire::{DiagnosticEntry, DumpStatePayload, Response, Status, Verb};
