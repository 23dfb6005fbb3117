//! When one enrolled backend instance votes no on `prepare`, every
//! instance touched by that transaction rolls back instead of
//! committing. This mirrors `Controller::settle_transaction`'s
//! two-phase-commit sweep, driven directly against `StubBackend` since
//! that sweep's decision logic has no dependency on the
//! dynamic-loading FFI boundary.

mod support;

use support::{Call, StubBackend};

/// The same prepare-all/commit-or-rollback-all sweep
/// `Controller::settle_transaction` runs over every backend instance a
/// change touched.
fn settle(backends: &[std::sync::Arc<StubBackend>]) {
    let mut all_ok = true;
    for b in backends {
        if !b.prepare() {
            all_ok = false;
        }
    }
    for b in backends {
        if all_ok {
            b.commit();
        } else {
            b.rollback();
        }
    }
}

#[test]
fn failed_prepare_vote_rolls_back_every_enrolled_instance() {
    let a = StubBackend::new();
    let b = StubBackend::new();
    b.fail_next_commit();

    settle(&[a.clone(), b.clone()]);

    assert_eq!(a.calls(), vec![Call::Rollback]);
    assert_eq!(b.calls(), vec![Call::Rollback]);
}

#[test]
fn unanimous_prepare_vote_commits_every_enrolled_instance() {
    let a = StubBackend::new();
    let b = StubBackend::new();

    settle(&[a.clone(), b.clone()]);

    assert_eq!(a.calls(), vec![Call::Commit]);
    assert_eq!(b.calls(), vec![Call::Commit]);
}
