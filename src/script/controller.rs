//! # Script Lifecycle Controller
//!
//! The single-threaded cooperative core: owns the
//! symbol tables, the open database, the loaded backend instances, and
//! the inbound upstream event queue. Every verb the wire protocol
//! exposes is a method here; [`crate::protocol::handler`] is the only
//! caller.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use super::emitter;
use super::router;
use super::symbols::{Diagnostic, DrvIdx, SymbolTables};
use super::translator::{self, CompiledScript};
use crate::backend::{BackendArena, Instance};
use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::upstream::{ChangeEvent, Cookie};
use crate::value::AttributeMap;

/// Lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Initial,
    Parsing,
    Analyzed,
    Ready,
    /// A fatal error occurred; the controller must be discarded and a
    /// fresh one created to reload.
    Broken,
    /// `stop()` was called; upstream is disconnected and in-flight
    /// transactions were rolled back.
    Stopped,
}

/// Everything a `dump_state()` call reports.
#[derive(Debug, Clone)]
pub struct DumpState {
    pub state: ControllerState,
    pub whole_script_hash: Option<String>,
    pub variables: usize,
    pub generators: usize,
    pub conditions: usize,
    pub drivers: usize,
    pub diagnostics: Vec<Diagnostic>,
}

pub struct Controller {
    state: ControllerState,
    parser: Option<super::parser::Parser>,
    symbols: Option<SymbolTables>,
    whole_script_hash: Option<u32>,
    compiled: Option<CompiledScript>,
    arena: BackendArena,
    instances: HashMap<DrvIdx, Instance>,
    db_dir: Option<std::path::PathBuf>,
    cookie: Cookie,
    events_tx: Sender<ChangeEvent>,
    events_rx: Receiver<ChangeEvent>,
}

impl Controller {
    pub fn new(config: &Config) -> Self {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        Controller {
            state: ControllerState::Initial,
            parser: Some(super::parser::Parser::new()),
            symbols: None,
            whole_script_hash: None,
            compiled: None,
            arena: BackendArena::new(config.script.backend_dir.clone()),
            instances: HashMap::new(),
            db_dir: config.script.db_dir.clone(),
            cookie: Cookie::default(),
            events_tx,
            events_rx,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// A clonable handle for whatever upstream collaborator feeds
    /// change events into this controller.
    pub fn event_sender(&self) -> Sender<ChangeEvent> {
        self.events_tx.clone()
    }

    /// `script(filename)`. Accepted in *Initial* or
    /// *Parsing*; appends the file to the same symbol tables.
    pub fn script(&mut self, filename: &str) -> EngineResult<()> {
        match self.state {
            ControllerState::Initial | ControllerState::Parsing => {
                let parser = self
                    .parser
                    .as_mut()
                    .expect("parser is Some while state is Initial or Parsing");
                parser.parse_file(Path::new(filename))?;
                self.state = ControllerState::Parsing;
                Ok(())
            }
            other => Err(EngineError::Config(format!("script() is not accepted in state {other:?}"))),
        }
    }

    /// `analyze()`: runs the semantic analyzer and returns its
    /// non-fatal invariant-violation set. The script still advances to
    /// *Analyzed* even when diagnostics were raised.
    pub fn analyze(&mut self) -> EngineResult<Vec<Diagnostic>> {
        if self.state != ControllerState::Parsing {
            return Err(EngineError::Config(format!("analyze() is not accepted in state {:?}", self.state)));
        }
        let parser = self.parser.take().expect("parser is Some while state is Parsing");
        let (mut symbols, hash) = parser.finalize();
        super::analyzer::analyze(&mut symbols);
        let diagnostics = symbols.diagnostics.clone();
        self.symbols = Some(symbols);
        self.whole_script_hash = Some(hash);
        self.state = ControllerState::Analyzed;
        Ok(diagnostics)
    }

    /// `translate()` lowering. Database preparation failures are fatal (→ *Broken*);
    /// a single backend's load failure is not —
    /// that driver simply has no instance and its emitted rows are
    /// logged and dropped at emit time.
    pub fn translate(&mut self) -> EngineResult<()> {
        if self.state != ControllerState::Analyzed {
            return Err(EngineError::Config(format!("translate() is not accepted in state {:?}", self.state)));
        }
        let symbols = self.symbols.as_ref().expect("symbols is Some while state is Analyzed");
        let hash = self.whole_script_hash.expect("hash is Some while state is Analyzed");

        let compiled = match translator::translate(symbols, hash, self.db_dir.as_deref()) {
            Ok(c) => c,
            Err(source) => {
                self.state = ControllerState::Broken;
                tracing::error!(error = %source, "database preparation failed; controller is broken");
                return Err(EngineError::Translation(source));
            }
        };

        for (drv_idx, drv) in symbols.drivers.iter().enumerate() {
            match self.arena.open(&drv.module, &drv.args, drv.output_vars.len()) {
                Ok(instance) => {
                    self.instances.insert(DrvIdx(drv_idx), instance);
                }
                Err(err) => {
                    tracing::warn!(module = %drv.module, error = %err, "backend load failed; this driver-output will drop its emissions");
                }
            }
        }

        match translator::load_cookie(&compiled.conn) {
            Ok(Some(bytes)) => self.cookie = Cookie(bytes),
            Ok(None) => {}
            Err(err) => tracing::warn!(error = %err, "failed to read persisted syncrepl cookie"),
        }

        self.compiled = Some(compiled);
        self.state = ControllerState::Ready;
        Ok(())
    }

    /// `add_entry(uuid, attrs)`. Database errors are
    /// logged and the event dropped; they never
    /// propagate out of this call.
    pub fn add_entry(&mut self, uuid: &str, attrs: &AttributeMap) {
        self.route_and_emit(uuid, |compiled, symbols| router::add_entry(compiled, symbols, uuid, attrs));
    }

    /// `remove_entry(uuid)`.
    pub fn remove_entry(&mut self, uuid: &str) {
        self.route_and_emit(uuid, |compiled, symbols| router::remove_entry(compiled, symbols, uuid));
    }

    /// `modify(uuid, attrs)` lowering: delete then re-add
    /// under the same uuid.
    pub fn modify_entry(&mut self, uuid: &str, attrs: &AttributeMap) {
        self.route_and_emit(uuid, |compiled, symbols| router::modify_entry(compiled, symbols, uuid, attrs));
    }

    fn route_and_emit(
        &mut self,
        uuid: &str,
        produce: impl FnOnce(&CompiledScript, &SymbolTables) -> Result<Vec<router::ProducedRow>, crate::error::RoutingError>,
    ) {
        if self.state != ControllerState::Ready {
            tracing::warn!(uuid, state = ?self.state, "change event dropped: controller is not Ready");
            return;
        }
        let compiled = self.compiled.as_ref().expect("compiled is Some while state is Ready");
        let symbols = self.symbols.as_ref().expect("symbols is Some while state is Ready");

        let rows = match produce(compiled, symbols) {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!(uuid, error = %err, "routing failed; event dropped");
                return;
            }
        };

        let instances = &mut self.instances;
        let mut touched: HashSet<DrvIdx> = HashSet::new();
        let emit_result = emitter::emit(compiled, symbols, &rows, |row| {
            let Some(instance) = instances.get_mut(&row.driver) else {
                return Err(crate::error::BackendError::InvalidState {
                    backend: "<unloaded>".to_string(),
                    op: "add_or_del",
                });
            };
            touched.insert(row.driver);
            match row.phase {
                router::Phase::Add => instance.add(&row.values),
                router::Phase::Del => instance.del(&row.values),
            }
        });
        if let Err(err) = emit_result {
            tracing::warn!(uuid, error = %err, "emitter failed; dedup counter already committed");
        }

        self.settle_transaction(&touched);
    }

    /// Two-phase close of every backend instance touched by this
    /// change: enroll every touched instance into one another's
    /// transaction via `collaborate`, `prepare` each, and if any votes
    /// no or errors, `rollback` every one of them instead of committing
    /// (spec §8 scenario 5).
    ///
    /// `HashMap` doesn't hand out two live `&mut` borrows at once, so
    /// the touched instances are pulled out into a `Vec` for the
    /// duration of the sweep and reinserted before returning.
    fn settle_transaction(&mut self, touched: &HashSet<DrvIdx>) {
        let mut touched_ids: Vec<DrvIdx> = touched.iter().copied().collect();
        touched_ids.sort();

        let mut enrolled: Vec<(DrvIdx, Instance)> = touched_ids
            .iter()
            .filter_map(|&id| self.instances.remove(&id).map(|instance| (id, instance)))
            .collect();

        for i in 0..enrolled.len() {
            let (left, right) = enrolled.split_at_mut(i + 1);
            let (_, this) = left.last_mut().expect("split_at_mut(i + 1) always leaves a last element");
            for (other_id, other) in right.iter_mut() {
                if let Err(err) = this.collaborate(other) {
                    tracing::warn!(error = %err, other = ?other_id, "collaborate failed");
                }
            }
        }

        let mut all_ok = true;
        for (_, instance) in enrolled.iter_mut() {
            match instance.prepare() {
                Ok(true) => {}
                Ok(false) => all_ok = false,
                Err(err) => {
                    tracing::warn!(error = %err, "prepare failed");
                    all_ok = false;
                }
            }
        }
        for (_, instance) in enrolled.iter_mut() {
            let result = if all_ok { instance.commit() } else { instance.rollback() };
            if let Err(err) = result {
                tracing::warn!(error = %err, "failed to settle backend transaction");
            }
        }

        for (id, instance) in enrolled {
            self.instances.insert(id, instance);
        }
    }

    /// `resync()`: re-synchronize with the upstream
    /// collaborator from the persisted cookie. The collaborator itself
    /// is out of scope for this crate; this is the
    /// hook a concrete collaborator implementation calls back into.
    pub fn resync(&mut self) -> EngineResult<()> {
        if self.state != ControllerState::Ready {
            return Err(EngineError::Config(format!("resync() is not accepted in state {:?}", self.state)));
        }
        tracing::info!(cookie_len = self.cookie.0.len(), "resync requested");
        Ok(())
    }

    /// Record a new resume token from the upstream collaborator, both
    /// in memory and in `syncrepl_cookie` so a restart can resume from
    /// it rather than replaying the whole change stream.
    pub fn set_cookie(&mut self, cookie: Cookie) {
        if let Some(compiled) = &self.compiled {
            if let Err(err) = translator::save_cookie(&compiled.conn, &cookie.0) {
                tracing::warn!(error = %err, "failed to persist syncrepl cookie");
            }
        }
        self.cookie = cookie;
    }

    pub fn cookie(&self) -> &Cookie {
        &self.cookie
    }

    /// `dump_state()`.
    pub fn dump_state(&self) -> DumpState {
        let symbols = self.symbols.as_ref();
        DumpState {
            state: self.state,
            whole_script_hash: self.whole_script_hash.map(crate::lexhash::hash_hex),
            variables: symbols.map_or(0, |s| s.variables.len()),
            generators: symbols.map_or(0, |s| s.generators.len()),
            conditions: symbols.map_or(0, |s| s.conditions.len()),
            drivers: symbols.map_or(0, |s| s.drivers.len()),
            diagnostics: symbols.map_or_else(Vec::new, |s| s.diagnostics.clone()),
        }
    }

    /// `stop()`: drops the upstream
    /// connection and rolls back every open backend transaction.
    pub fn stop(&mut self) {
        let touched: HashSet<DrvIdx> = self.instances.keys().copied().collect();
        for &drv_idx in &touched {
            if let Some(instance) = self.instances.get_mut(&drv_idx) {
                if let Err(err) = instance.rollback() {
                    tracing::warn!(error = %err, "rollback on stop failed");
                }
            }
        }
        self.state = ControllerState::Stopped;
    }

    /// Dispatch one upstream event: `present` is ignored,
    /// `modify` is lowered by [`Controller::modify_entry`].
    fn dispatch_event(&mut self, event: ChangeEvent) {
        match event {
            ChangeEvent::Present { .. } => {}
            ChangeEvent::Add { uuid, attrs } => self.add_entry(&uuid, &attrs),
            ChangeEvent::Modify { uuid, attrs } => self.modify_entry(&uuid, &attrs),
            ChangeEvent::Delete { uuid } => self.remove_entry(&uuid),
        }
    }

    /// Run one iteration of the cooperative event loop:
    /// process the next queued upstream event, or fall through to the
    /// periodic poll suspension point when the queue is quiet for
    /// `poll_interval`. Returns `false` once the controller has
    /// stopped, so a caller can loop `while controller.run_once(iv) {}`.
    pub fn run_once(&mut self, poll_interval: Duration) -> bool {
        if self.state == ControllerState::Stopped || self.state == ControllerState::Broken {
            return false;
        }
        match self.events_rx.recv_timeout(poll_interval) {
            Ok(event) => self.dispatch_event(event),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                // Periodic upstream poll suspension point;
                // the concrete collaborator drives any real I/O.
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return false,
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn ready_controller(script: &str, dir: &std::path::Path) -> Controller {
        let path = dir.join("script.pulley");
        std::fs::write(&path, script).unwrap();
        let mut config = Config::default();
        config.script.backend_dir = None;
        config.script.db_dir = None;
        let mut c = Controller::new(&config);
        c.script(path.to_str().unwrap()).unwrap();
        c.analyze().unwrap();
        c.translate().unwrap();
        c
    }

    #[test]
    fn lifecycle_reaches_ready_and_rejects_out_of_order_script_calls() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = ready_controller("Mail:x <- world\nout(x) <- x\n", dir.path());
        assert_eq!(c.state(), ControllerState::Ready);
        assert!(c.script("anything").is_err());
    }

    #[test]
    fn add_entry_on_non_ready_controller_is_a_noop() {
        let config = Config::default();
        let mut c = Controller::new(&config);
        c.add_entry("uuid-1", &AttributeMap::new());
        assert_eq!(c.state(), ControllerState::Initial);
    }

    #[test]
    fn stop_transitions_to_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = ready_controller("Mail:x <- world\nout(x) <- x\n", dir.path());
        c.stop();
        assert_eq!(c.state(), ControllerState::Stopped);
    }

    #[test]
    fn cookie_set_while_ready_survives_a_fresh_controller_over_the_same_db_file() {
        let dir = tempfile::tempdir().unwrap();
        let script_path = dir.join("script.pulley");
        std::fs::write(&script_path, "Mail:x <- world\nout(x) <- x\n").unwrap();

        let mut config = Config::default();
        config.script.backend_dir = None;
        config.script.db_dir = Some(dir.path().to_path_buf());

        let mut c1 = Controller::new(&config);
        c1.script(script_path.to_str().unwrap()).unwrap();
        c1.analyze().unwrap();
        c1.translate().unwrap();
        c1.set_cookie(Cookie(b"resume-token-1".to_vec()));

        let mut c2 = Controller::new(&config);
        c2.script(script_path.to_str().unwrap()).unwrap();
        c2.analyze().unwrap();
        c2.translate().unwrap();
        assert_eq!(c2.cookie().0, b"resume-token-1".to_vec());
    }

    #[test]
    fn dump_state_reports_entity_counts() {
        let dir = tempfile::tempdir().unwrap();
        let c = ready_controller("Mail:x <- world\nout(x) <- x\n", dir.path());
        let dump = c.dump_state();
        assert_eq!(dump.generators, 1);
        assert_eq!(dump.drivers, 1);
        assert!(dump.whole_script_hash.is_some());
    }
}
