//! Fixture plugins for exercising the chains without loading modules.
//!
//! Every fixture hands out shared handles (call counters, recorded actions,
//! stored values) so a test can keep observing a plugin after moving it into
//! a registry.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use crate::acl::Acl;
use crate::acl::AclVerdict;
use crate::acl::BusCall;
use crate::channel::ChannelInfo;
use crate::channel::GroupChangeReason;
use crate::dispatch::ChannelControl;
use crate::plugin::Plugin;
use crate::storage::AccountRestrictions;
use crate::storage::AccountSink;
use crate::storage::AccountStorage;
use crate::storage::StorageNotifier;
use crate::util::lock;

// ============================================================================
// ACL
// ============================================================================

/// ACL plugin with a fixed answer.
pub struct ScriptedAcl {
    name: String,
    priority: i32,
    permit: bool,
    calls: Arc<AtomicUsize>,
    asynchronous: bool,
    drop_verdict: bool,
    deferred: bool,
}

impl ScriptedAcl {
    pub fn new(name: &str, priority: i32, permit: bool) -> Self {
        Self {
            name: name.to_string(),
            priority,
            permit,
            calls: Arc::new(AtomicUsize::new(0)),
            asynchronous: false,
            drop_verdict: false,
            deferred: false,
        }
    }

    /// Counter of sync and async invocations.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }

    /// Implement the async handler too.
    pub fn asynchronous(mut self) -> Self {
        self.asynchronous = true;
        self
    }

    /// Drop the verdict instead of answering.
    pub fn dropping_verdict(mut self) -> Self {
        self.drop_verdict = true;
        self
    }

    /// Answer from a spawned task. Needs a tokio runtime.
    pub fn deferred(mut self) -> Self {
        self.deferred = true;
        self
    }
}

impl Acl for ScriptedAcl {
    fn authorize(&self, _call: &BusCall) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.permit
    }

    fn supports_async(&self) -> bool {
        self.asynchronous
    }

    fn authorize_async(&self, _call: Arc<BusCall>, verdict: AclVerdict) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.drop_verdict {
            drop(verdict);
            return;
        }
        let permit = self.permit;
        if self.deferred {
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                verdict.decide(permit);
            });
        } else {
            verdict.decide(permit);
        }
    }
}

impl Plugin for ScriptedAcl {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn as_acl(&self) -> Option<&dyn Acl> {
        Some(self)
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// Channel control that records what it was asked to do.
#[derive(Default)]
pub struct RecordingControl {
    actions: Mutex<Vec<String>>,
}

impl RecordingControl {
    /// `"close <path>"`, `"destroy <path>"` or `"leave <path> <reason> <message>"`.
    pub fn actions(&self) -> Vec<String> {
        lock(&self.actions).clone()
    }
}

impl ChannelControl for RecordingControl {
    fn close(&self, channel: &ChannelInfo) {
        lock(&self.actions).push(format!("close {}", channel.path));
    }

    fn destroy(&self, channel: &ChannelInfo) {
        lock(&self.actions).push(format!("destroy {}", channel.path));
    }

    fn leave(&self, channel: &ChannelInfo, reason: GroupChangeReason, message: &str) {
        lock(&self.actions).push(format!("leave {} {} {}", channel.path, reason, message));
    }
}

// ============================================================================
// Storage
// ============================================================================

/// Sink that keeps everything it is given.
#[derive(Default)]
pub struct RecordingSink {
    values: Mutex<BTreeMap<(String, String), Option<String>>>,
}

impl RecordingSink {
    pub fn value(&self, account: &str, key: &str) -> Option<String> {
        lock(&self.values).get(&(account.to_string(), key.to_string())).cloned().flatten()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.values).is_empty()
    }
}

impl AccountSink for RecordingSink {
    fn set_value(&self, account: &str, key: &str, value: Option<String>) {
        lock(&self.values).insert((account.to_string(), key.to_string()), value);
    }
}

#[derive(Default)]
struct MemoryState {
    accounts: BTreeMap<String, BTreeMap<String, String>>,
    dirty: bool,
    notifier: Option<StorageNotifier>,
}

/// In-memory account store. Clones share contents.
#[derive(Clone)]
pub struct MemoryStorage {
    name: String,
    priority: i32,
    accept_prefix: Option<String>,
    fail_commit: bool,
    restrictions: AccountRestrictions,
    commits: Arc<AtomicUsize>,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStorage {
    pub fn new(name: &str, priority: i32) -> Self {
        Self {
            name: name.to_string(),
            priority,
            accept_prefix: None,
            fail_commit: false,
            restrictions: AccountRestrictions::empty(),
            commits: Arc::new(AtomicUsize::new(0)),
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    pub fn with_value(self, account: &str, key: &str, value: &str) -> Self {
        lock(&self.state)
            .accounts
            .entry(account.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        self
    }

    /// Only accept accounts whose name starts with `prefix`.
    pub fn accepting(mut self, prefix: &str) -> Self {
        self.accept_prefix = Some(prefix.to_string());
        self
    }

    pub fn failing_commit(mut self) -> Self {
        self.fail_commit = true;
        self
    }

    pub fn with_restrictions(mut self, restrictions: AccountRestrictions) -> Self {
        self.restrictions = restrictions;
        self
    }

    pub fn commits(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.commits)
    }

    /// Another handle onto the same contents.
    pub fn handle(&self) -> Self {
        self.clone()
    }

    pub fn value(&self, account: &str, key: &str) -> Option<String> {
        lock(&self.state).accounts.get(account)?.get(key).cloned()
    }

    /// Whether writes are waiting for a successful commit.
    pub fn is_dirty(&self) -> bool {
        lock(&self.state).dirty
    }

    /// Notifier received in `ready`, if it has been called.
    pub fn notifier(&self) -> Option<StorageNotifier> {
        lock(&self.state).notifier.clone()
    }

    fn accepts(&self, account: &str) -> bool {
        self.accept_prefix.as_deref().is_none_or(|prefix| account.starts_with(prefix))
    }
}

impl AccountStorage for MemoryStorage {
    fn ready(&self, _sink: Arc<dyn AccountSink>, notifier: StorageNotifier) {
        lock(&self.state).notifier = Some(notifier);
    }

    fn get(&self, sink: &dyn AccountSink, account: &str, key: Option<&str>) -> bool {
        let state = lock(&self.state);
        let Some(values) = state.accounts.get(account) else {
            return false;
        };
        match key {
            Some(key) => match values.get(key) {
                Some(value) => {
                    sink.set_value(account, key, Some(value.clone()));
                    true
                }
                None => false,
            },
            None => {
                for (key, value) in values {
                    sink.set_value(account, key, Some(value.clone()));
                }
                true
            }
        }
    }

    fn set(&self, account: &str, key: &str, value: &str) -> bool {
        if !self.accepts(account) {
            return false;
        }
        let mut state = lock(&self.state);
        state
            .accounts
            .entry(account.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        state.dirty = true;
        true
    }

    fn delete(&self, account: &str, key: Option<&str>) -> bool {
        let mut state = lock(&self.state);
        let removed = match key {
            Some(key) => state.accounts.get_mut(account).is_some_and(|values| values.remove(key).is_some()),
            None => state.accounts.remove(account).is_some(),
        };
        state.dirty |= removed;
        removed
    }

    fn commit(&self) -> bool {
        self.commits.fetch_add(1, Ordering::SeqCst);
        if self.fail_commit {
            return false;
        }
        lock(&self.state).dirty = false;
        true
    }

    fn list(&self) -> Vec<String> {
        lock(&self.state).accounts.keys().cloned().collect()
    }

    fn create(&self, manager: &str, protocol: &str, identifier: &str) -> Option<String> {
        let escaped: String =
            identifier.chars().map(|c| if c.is_ascii_alphanumeric() { c } else { '_' }).collect();
        let account = format!("{manager}/{protocol}/{escaped}");
        if !self.accepts(&account) {
            return None;
        }
        let mut state = lock(&self.state);
        state.accounts.entry(account.clone()).or_default();
        state.dirty = true;
        Some(account)
    }

    fn identifier(&self, account: &str) -> Option<String> {
        lock(&self.state).accounts.contains_key(account).then(|| account.to_string())
    }

    fn restrictions(&self, account: &str) -> AccountRestrictions {
        if lock(&self.state).accounts.contains_key(account) {
            self.restrictions
        } else {
            AccountRestrictions::empty()
        }
    }
}

impl Plugin for MemoryStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn as_account_storage(&self) -> Option<&dyn AccountStorage> {
        Some(self)
    }
}
