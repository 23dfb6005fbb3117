//! Test-only stand-in for a backend plug-in: the same
//! add/del/prepare/commit/rollback/collaborate shape a dynamically
//! loaded `.so` would expose, but compiled directly into the test
//! binary so the differential-emitter and backend-lifecycle tests
//! don't need an actual shared-object build step.

use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Add(Vec<Vec<u8>>),
    Del(Vec<Vec<u8>>),
    Commit,
    Rollback,
}

/// Records every call it receives; `commit_should_fail` lets a test
/// drive a backend rollback on a failed commit vote.
#[derive(Default)]
pub struct StubBackend {
    calls: Mutex<Vec<Call>>,
    commit_should_fail: Mutex<bool>,
}

impl StubBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(StubBackend::default())
    }

    pub fn fail_next_commit(&self) {
        *self.commit_should_fail.lock().unwrap() = true;
    }

    pub fn add(&self, values: &[Vec<u8>]) {
        self.calls.lock().unwrap().push(Call::Add(values.to_vec()));
    }

    pub fn del(&self, values: &[Vec<u8>]) {
        self.calls.lock().unwrap().push(Call::Del(values.to_vec()));
    }

    /// Returns `true` to vote commit, `false` to vote abort.
    pub fn prepare(&self) -> bool {
        !*self.commit_should_fail.lock().unwrap()
    }

    pub fn commit(&self) {
        self.calls.lock().unwrap().push(Call::Commit);
    }

    pub fn rollback(&self) {
        self.calls.lock().unwrap().push(Call::Rollback);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn add_call_count(&self) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| matches!(c, Call::Add(_))).count()
    }

    pub fn del_call_count(&self) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| matches!(c, Call::Del(_))).count()
    }
}
