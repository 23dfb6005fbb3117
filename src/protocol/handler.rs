//! # Verb Dispatch
//!
//! Maps the wire-level [`Verb`] enum onto [`Controller`] method calls and
//! shapes the result back into a [`Response`]. This is the
//! only component that ever touches both the wire types and the core;
//! a transport (HTTP, a local socket, an in-process call from `main`)
//! wraps this and nothing else.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::config::Config;
use crate::protocol::error::ProtocolError;
use crate::protocol::wire::{DiagnosticEntry, DumpStatePayload, Response, Verb};
use crate::script::controller::Controller;
use crate::value::AttributeMap;

/// Owns the single [`Controller`] this process drives and counts verb
/// invocations for diagnostics.
pub struct Handler {
    controller: Mutex<Controller>,
    verbs_handled: AtomicU64,
}

impl Handler {
    pub fn new(config: &Config) -> Self {
        Handler {
            controller: Mutex::new(Controller::new(config)),
            verbs_handled: AtomicU64::new(0),
        }
    }

    pub fn verbs_handled(&self) -> u64 {
        self.verbs_handled.load(Ordering::Relaxed)
    }

    /// A clonable sender for upstream change events, so a collaborator
    /// running on another thread can feed the controller's queue.
    pub fn event_sender(&self) -> crossbeam_channel::Sender<crate::upstream::ChangeEvent> {
        self.controller.lock().event_sender()
    }

    /// Run one iteration of the cooperative event loop.
    /// Returns `false` once the controller has stopped.
    pub fn run_once(&self, poll_interval: std::time::Duration) -> bool {
        self.controller.lock().run_once(poll_interval)
    }

    /// Dispatch one verb invocation. Every path returns
    /// `Ok`; failures are reported through [`Response::error`] rather
    /// than propagated, matching the verb surface's "every verb
    /// returns (status, message, optional payload)" contract.
    pub fn dispatch(&self, verb: Verb) -> Response {
        self.verbs_handled.fetch_add(1, Ordering::Relaxed);
        match self.handle(verb) {
            Ok(response) => response,
            Err(err) => Response::error(err.to_string()),
        }
    }

    fn handle(&self, verb: Verb) -> Result<Response, ProtocolError> {
        let mut controller = self.controller.lock();
        match verb {
            Verb::Script { filename, base, autofollow } => {
                // `base` scopes which part of the replicated directory
                // this script watches; the concrete collaborator reads
                // it back off the controller once resync() is wired to
                // a real upstream. `autofollow` governs whether this
                // process keeps watching for appended script text after
                // load; a single file is always parsed, analyzed, and
                // translated in one verb call (the corpus never split
                // those steps across separate verb invocations).
                let _ = (base, autofollow);
                controller.script(&filename)?;
                let diagnostics = controller.analyze()?;
                controller.translate()?;

                let dump = controller.dump_state();
                let payload = DumpStatePayload {
                    state: format!("{:?}", dump.state),
                    whole_script_hash: dump.whole_script_hash,
                    variables: dump.variables,
                    generators: dump.generators,
                    conditions: dump.conditions,
                    drivers: dump.drivers,
                    diagnostics: diagnostics
                        .into_iter()
                        .map(|d| DiagnosticEntry {
                            line: d.line,
                            kind: d.kind,
                            message: d.message,
                        })
                        .collect(),
                };
                Ok(Response::ok_with(format!("loaded {filename}"), payload))
            }
            Verb::AddEntry { uuid, attrs } => {
                require_dn(&uuid, &attrs)?;
                controller.add_entry(&uuid, &attrs);
                Ok(Response::ok(format!("add_entry {uuid} routed")))
            }
            Verb::RemoveEntry { uuid } => {
                controller.remove_entry(&uuid);
                Ok(Response::ok(format!("remove_entry {uuid} routed")))
            }
            Verb::Resync => {
                controller.resync()?;
                Ok(Response::ok("resync requested"))
            }
            Verb::DumpState => {
                let dump = controller.dump_state();
                let payload = DumpStatePayload {
                    state: format!("{:?}", dump.state),
                    whole_script_hash: dump.whole_script_hash,
                    variables: dump.variables,
                    generators: dump.generators,
                    conditions: dump.conditions,
                    drivers: dump.drivers,
                    diagnostics: dump
                        .diagnostics
                        .into_iter()
                        .map(|d| DiagnosticEntry {
                            line: d.line,
                            kind: d.kind,
                            message: d.message,
                        })
                        .collect(),
                };
                Ok(Response::ok_with("state dumped", payload))
            }
            Verb::Stop => {
                controller.stop();
                Ok(Response::ok("stopped"))
            }
        }
    }
}

/// `add_entry` requires a dn-bearing attribute map; an entry with no
/// attributes at all cannot be routed to any generator.
fn require_dn(uuid: &str, attrs: &AttributeMap) -> Result<(), ProtocolError> {
    if attrs.is_empty() {
        return Err(ProtocolError::MissingDn { uuid: uuid.to_string() });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_verb_on_missing_file_reports_error_response() {
        let handler = Handler::new(&Config::default());
        let response = handler.dispatch(Verb::Script {
            filename: "/nonexistent/path.pulley".to_string(),
            base: None,
            autofollow: false,
        });
        assert_eq!(response.status, crate::protocol::wire::Status::Error);
    }

    #[test]
    fn add_entry_with_no_attributes_reports_missing_dn() {
        let handler = Handler::new(&Config::default());
        let response = handler.dispatch(Verb::AddEntry {
            uuid: "u1".to_string(),
            attrs: AttributeMap::new(),
        });
        assert_eq!(response.status, crate::protocol::wire::Status::Error);
        assert!(response.message.contains("missing dn"));
    }

    #[test]
    fn dump_state_verb_reports_initial_state() {
        let handler = Handler::new(&Config::default());
        let response = handler.dispatch(Verb::DumpState);
        assert_eq!(response.status, crate::protocol::wire::Status::Ok);
        assert!(response.payload.is_some());
    }

    #[test]
    fn stop_verb_succeeds_from_initial_state() {
        let handler = Handler::new(&Config::default());
        let response = handler.dispatch(Verb::Stop);
        assert_eq!(response.status, crate::protocol::wire::Status::Ok);
    }

    #[test]
    fn script_verb_parses_analyzes_and_translates_in_one_call() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("script.pulley");
        std::fs::write(&path, "Mail:x <- world\nout(x) <- x\n").unwrap();

        let handler = Handler::new(&Config::default());
        let response = handler.dispatch(Verb::Script {
            filename: path.to_str().unwrap().to_string(),
            base: None,
            autofollow: false,
        });
        assert_eq!(response.status, crate::protocol::wire::Status::Ok);
        let payload = response.payload.unwrap();
        assert_eq!(payload["state"], "Ready");
        assert_eq!(payload["generators"], 1);
    }
}
