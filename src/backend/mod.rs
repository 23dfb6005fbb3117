//! Backend plug-in ABI encoding and the dynamic loader/instance manager.

pub mod abi;
pub mod loader;

pub use loader::{BackendArena, Instance};
