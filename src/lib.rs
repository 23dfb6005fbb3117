//! # syncbridge
//!
//! A directory-replication middle-tier: a small declarative script
//! compiles into an embedded relational engine that differentially
//! joins an upstream directory's change stream against itself, and
//! forwards the resulting add/remove transitions to dynamically loaded
//! backend plug-ins.
//!
//! ## Pipeline
//!
//! ```text
//! upstream change event (add/modify/delete/present, keyed by uuid)
//!     │
//!     ▼
//! script::router       — cartesian-expands the entry into generator-table rows
//!     │
//!     ▼
//! script::translator's prepared producer statements (NATURAL JOIN across
//! cogenerator tables, one per driver-output)
//!     │
//!     ▼
//! script::emitter      — dedup-counts each produced row, reports only
//!                         0→1 / 1→0 transitions
//!     │
//!     ▼
//! backend::loader::Instance — add()/del() against the loaded plug-in,
//!                              two-phase committed across every
//!                              instance a change touched
//! ```
//!
//! Before any of that runs, a script text moves through
//! [`lexhash`] → [`script::parser`] → [`script::symbols`] →
//! [`script::analyzer`] → [`script::translator`], and
//! [`script::controller::Controller`] owns the whole lifecycle plus the
//! per-uuid routing above. [`protocol`] is the verb surface
//! (`script`/`add_entry`/`remove_entry`/`resync`/`dump_state`/`stop`)
//! a transport wraps around one controller.
//!
//! ## Example
//!
//! ```rust,no_run
//! use syncbridge::config::Config;
//! use syncbridge::protocol::{Handler, Verb};
//!
//! let config = Config::default();
//! let handler = Handler::new(&config);
//! let response = handler.dispatch(Verb::Script {
//!     filename: "directory.pulley".to_string(),
//!     base: None,
//!     autofollow: false,
//! });
//! println!("{}", response.message);
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod lexhash;
pub mod protocol;
pub mod script;
pub mod upstream;
pub mod value;

pub use config::Config;
pub use error::{EngineError, EngineResult};
pub use script::controller::{Controller, ControllerState, DumpState};
