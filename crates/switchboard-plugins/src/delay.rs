//! Delay tokens holding up a dispatch operation or channel request.
//!
//! A policy plugin that needs to do its own asynchronous work takes a
//! [`DelayToken`] and hands it back when done. The owner may not proceed
//! while any token is outstanding. A token that is never ended wedges its
//! owner forever, so outstanding counts are exposed and unended tokens log
//! a warning when dropped.

use std::collections::BTreeSet;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use tracing::warn;

static NEXT_HOLD_ID: AtomicU64 = AtomicU64::new(1);

/// One outstanding hold. End it through the owner's `end_delay`.
#[derive(Debug)]
#[must_use = "a delay token that is never ended blocks dispatch forever"]
pub struct DelayToken {
    hold: u64,
    id: u64,
    armed: bool,
}

impl DelayToken {
    fn disarm(mut self) -> (u64, u64) {
        self.armed = false;
        (self.hold, self.id)
    }
}

impl Drop for DelayToken {
    fn drop(&mut self) {
        if self.armed {
            warn!(hold = self.hold, token = self.id, "delay token dropped without being ended; owner stays held");
        }
    }
}

/// Delay bookkeeping plus the "have all plugins run" flag.
#[derive(Debug)]
pub(crate) struct HoldState {
    hold: u64,
    next_token: u64,
    outstanding: BTreeSet<u64>,
    policy_started: bool,
    policy_done: bool,
    resolved: bool,
}

impl HoldState {
    pub(crate) fn new() -> Self {
        Self {
            hold: NEXT_HOLD_ID.fetch_add(1, Ordering::Relaxed),
            next_token: 0,
            outstanding: BTreeSet::new(),
            policy_started: false,
            policy_done: false,
            resolved: false,
        }
    }

    pub(crate) fn start(&mut self) -> DelayToken {
        self.next_token += 1;
        self.outstanding.insert(self.next_token);
        DelayToken {
            hold: self.hold,
            id: self.next_token,
            armed: true,
        }
    }

    /// End `token`. Returns `false` (and leaves the count untouched) for a
    /// token this hold never issued or already ended.
    pub(crate) fn end(&mut self, token: DelayToken) -> bool {
        let (hold, id) = token.disarm();
        if hold != self.hold || !self.outstanding.remove(&id) {
            warn!(hold = self.hold, token_hold = hold, token = id, "delay ended without matching start, ignoring");
            return false;
        }
        true
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub(crate) fn begin_policy(&mut self) -> bool {
        if self.policy_started {
            return false;
        }
        self.policy_started = true;
        true
    }

    pub(crate) fn policy_started(&self) -> bool {
        self.policy_started
    }

    pub(crate) fn finish_policy(&mut self) {
        self.policy_done = true;
    }

    pub(crate) fn resolved(&self) -> bool {
        self.resolved
    }

    /// Mark resolved the first time every plugin has run and no delay is
    /// outstanding. Returns `true` exactly once.
    pub(crate) fn try_resolve(&mut self) -> bool {
        if self.resolved || !self.policy_done || !self.outstanding.is_empty() {
            return false;
        }
        self.resolved = true;
        true
    }
}
