//! Bus-call authorization chains.
//!
//! Every bus call that needs authorization is offered to the ACL plugins in
//! priority order. The synchronous chain ([`authorize`]) stops at the first
//! plugin that says no. The asynchronous chain ([`AsyncAuthorization`])
//! offers the same decision space, but each plugin may suspend the chain
//! and answer later through the [`AclVerdict`] it was handed.
//!
//! ## Async chain contract
//!
//! - Plugins without an async handler are treated as an immediate permit
//!   and the cursor advances without suspending.
//! - The cursor only moves forward. After a denial nothing else is
//!   consulted.
//! - Exactly one of the terminal outcomes runs per context: `on_done(Ok)`
//!   then cleanup, or `on_done(Err)` then cleanup. Cleanup never runs twice.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::oneshot;
use tracing::debug;
use tracing::warn;

use crate::constants::UNKNOWN_DENIER;
use crate::error::PolicyError;
use crate::registry::CapabilityList;
use crate::util::lock;

/// What kind of bus operation is being authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    MethodCall,
    GetProperty,
    SetProperty,
}

impl CallKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CallKind::MethodCall => "method call",
            CallKind::GetProperty => "property get",
            CallKind::SetProperty => "property set",
        }
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One bus call awaiting authorization.
///
/// Supplied by the IPC layer; the chains never look at the wire format.
#[derive(Debug, Clone, PartialEq)]
pub struct BusCall {
    pub kind: CallKind,
    /// Fully-qualified method or property name.
    pub name: String,
    /// Unique bus name of the caller, when known.
    pub sender: Option<String>,
    /// Parameters the IPC layer extracted for ACL inspection.
    pub params: Option<BTreeMap<String, serde_json::Value>>,
}

impl BusCall {
    pub fn new(kind: CallKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            sender: None,
            params: None,
        }
    }

    pub fn method(name: impl Into<String>) -> Self {
        Self::new(CallKind::MethodCall, name)
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.get_or_insert_with(BTreeMap::new).insert(key.into(), value);
        self
    }

    pub fn param(&self, key: &str) -> Option<&serde_json::Value> {
        self.params.as_ref()?.get(key)
    }
}

/// ACL capability.
///
/// Both handlers default to "permit", which is how the chains treat a plugin
/// that lacks them.
pub trait Acl: Send + Sync {
    /// Synchronous single-shot decision.
    fn authorize(&self, _call: &BusCall) -> bool {
        true
    }

    /// Whether [`Acl::authorize_async`] is implemented.
    fn supports_async(&self) -> bool {
        false
    }

    /// Asynchronous decision. The plugin must eventually consume `verdict`.
    fn authorize_async(&self, _call: Arc<BusCall>, verdict: AclVerdict) {
        verdict.permit();
    }
}

fn denial(plugin: &str, call: &BusCall) -> PolicyError {
    PolicyError::access_denied(format!(
        "permission denied by ACL plugin '{}' for {} '{}'",
        plugin, call.kind, call.name
    ))
}

/// Run the synchronous ACL chain for `call`.
///
/// Returns the denial of the first plugin that refuses; later plugins are
/// not consulted.
pub fn authorize(acls: &CapabilityList, call: &BusCall) -> Result<(), PolicyError> {
    for record in acls.iter() {
        let Some(acl) = record.acl() else {
            continue;
        };
        debug!(plugin = %record.name(), kind = %call.kind, call = %call.name, "checking ACL");
        if !acl.authorize(call) {
            warn!(plugin = %record.name(), kind = %call.kind, call = %call.name, "bus call denied by ACL");
            return Err(denial(record.name(), call));
        }
    }
    Ok(())
}

/// Run the asynchronous ACL chain and await its outcome.
pub async fn authorize_async(acls: CapabilityList, call: BusCall) -> Result<(), PolicyError> {
    let (tx, rx) = oneshot::channel();
    AsyncAuthorization::new(acls, call)
        .on_done(move |outcome| {
            let _ = tx.send(outcome);
        })
        .start();
    // The chain always reaches a terminal outcome; a closed channel can only
    // mean on_done was dropped unrun, which the chain never does.
    rx.await.unwrap_or_else(|_| Err(PolicyError::access_denied("authorization abandoned")))
}

type DoneFn = Box<dyn FnOnce(Result<(), PolicyError>) + Send>;
type CleanupFn = Box<dyn FnOnce() + Send>;

struct AuthState {
    /// Index of the plugin consulted last; `None` before the first one.
    cursor: Option<usize>,
    on_done: Option<DoneFn>,
    cleanup: Option<CleanupFn>,
    finished: bool,
}

struct Shared {
    call: Arc<BusCall>,
    acls: CapabilityList,
    state: Mutex<AuthState>,
}

/// One asynchronous authorization in flight.
pub struct AsyncAuthorization {
    call: BusCall,
    acls: CapabilityList,
    on_done: Option<DoneFn>,
    cleanup: Option<CleanupFn>,
}

impl AsyncAuthorization {
    pub fn new(acls: CapabilityList, call: BusCall) -> Self {
        Self {
            call,
            acls,
            on_done: None,
            cleanup: None,
        }
    }

    /// Continuation receiving the final decision.
    pub fn on_done<F>(mut self, f: F) -> Self
    where
        F: FnOnce(Result<(), PolicyError>) + Send + 'static,
    {
        self.on_done = Some(Box::new(f));
        self
    }

    /// Owner-supplied cleanup, run once after `on_done`.
    pub fn cleanup<F>(mut self, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.cleanup = Some(Box::new(f));
        self
    }

    /// Start the chain. Returns as soon as it completes or first suspends.
    pub fn start(self) {
        let shared = Arc::new(Shared {
            call: Arc::new(self.call),
            acls: self.acls,
            state: Mutex::new(AuthState {
                cursor: None,
                on_done: self.on_done,
                cleanup: self.cleanup,
                finished: false,
            }),
        });
        step(&shared, None, true);
    }
}

/// Sole re-entry point of the async chain.
///
/// `from` is the cursor position of the plugin delivering `decision`
/// (`None` when starting).
fn step(shared: &Arc<Shared>, from: Option<usize>, mut decision: bool) {
    let mut expected = from;
    loop {
        let mut state = lock(&shared.state);
        if state.finished {
            warn!(call = %shared.call.name, "ACL verdict delivered after chain finished, ignoring");
            return;
        }
        if state.cursor != expected {
            warn!(call = %shared.call.name, "stale ACL verdict, ignoring");
            return;
        }

        if !decision {
            let denier = state
                .cursor
                .and_then(|i| shared.acls.get(i))
                .map(|r| r.name().to_string())
                .unwrap_or_else(|| UNKNOWN_DENIER.to_string());
            warn!(plugin = %denier, kind = %shared.call.kind, call = %shared.call.name, "bus call denied by async ACL");
            let err = denial(&denier, &shared.call);
            finish(shared, state, Err(err));
            return;
        }

        let next = state.cursor.map_or(0, |c| c + 1);
        let Some(record) = shared.acls.get(next).cloned() else {
            debug!(call = %shared.call.name, "async ACL chain permitted");
            finish(shared, state, Ok(()));
            return;
        };
        state.cursor = Some(next);
        drop(state);

        match record.acl() {
            Some(acl) if acl.supports_async() => {
                debug!(plugin = %record.name(), call = %shared.call.name, "suspending on async ACL");
                let verdict = AclVerdict {
                    shared: Some(Arc::clone(shared)),
                    position: next,
                };
                acl.authorize_async(Arc::clone(&shared.call), verdict);
                return;
            }
            _ => {
                debug!(plugin = %record.name(), call = %shared.call.name, "no async handler, treating as permit");
                expected = Some(next);
                decision = true;
            }
        }
    }
}

fn finish(shared: &Shared, mut state: std::sync::MutexGuard<'_, AuthState>, outcome: Result<(), PolicyError>) {
    state.finished = true;
    let on_done = state.on_done.take();
    let cleanup = state.cleanup.take();
    drop(state);

    match on_done {
        Some(done) => done(outcome),
        None => debug!(call = %shared.call.name, "async ACL finished with no continuation"),
    }
    if let Some(cleanup) = cleanup {
        cleanup();
    }
}

/// Handle through which an async ACL plugin answers.
///
/// Consumed by [`AclVerdict::permit`] or [`AclVerdict::deny`]. Dropping it
/// unanswered is logged and counts as a denial so the chain still
/// terminates.
#[must_use = "an unanswered verdict denies the call"]
pub struct AclVerdict {
    shared: Option<Arc<Shared>>,
    position: usize,
}

impl AclVerdict {
    pub fn permit(self) {
        self.decide(true);
    }

    pub fn deny(self) {
        self.decide(false);
    }

    pub fn decide(mut self, permitted: bool) {
        if let Some(shared) = self.shared.take() {
            step(&shared, Some(self.position), permitted);
        }
    }

    /// The call being authorized.
    pub fn call(&self) -> Option<&BusCall> {
        self.shared.as_deref().map(|s| s.call.as_ref())
    }
}

impl Drop for AclVerdict {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            let plugin = shared.acls.get(self.position).map(|r| r.name().to_string()).unwrap_or_default();
            warn!(plugin = %plugin, call = %shared.call.name, "ACL verdict dropped unanswered, denying");
            step(&shared, Some(self.position), false);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::registry::PluginRegistry;
    use crate::test_support::ScriptedAcl;

    fn acl_list(plugins: Vec<ScriptedAcl>) -> CapabilityList {
        let registry = PluginRegistry::new();
        for plugin in plugins {
            registry.register(Arc::new(plugin));
        }
        registry.for_capability(crate::Capability::Acl)
    }

    fn run_async(acls: CapabilityList, call: BusCall) -> (Option<Result<(), PolicyError>>, usize) {
        let outcome = Arc::new(Mutex::new(None));
        let cleanups = Arc::new(AtomicUsize::new(0));
        let o = Arc::clone(&outcome);
        let c = Arc::clone(&cleanups);
        AsyncAuthorization::new(acls, call)
            .on_done(move |r| *lock(&o) = Some(r))
            .cleanup(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .start();
        let result = lock(&outcome).take();
        (result, cleanups.load(Ordering::SeqCst))
    }

    // -------------------------------------------------------------------------
    // synchronous chain
    // -------------------------------------------------------------------------

    #[test]
    fn empty_chain_permits() {
        let acls = acl_list(vec![]);
        assert!(authorize(&acls, &BusCall::method("a.b.C")).is_ok());
    }

    #[test]
    fn first_denier_short_circuits() {
        let p1 = ScriptedAcl::new("p1", 100, true);
        let p2 = ScriptedAcl::new("p2", 50, false);
        let p3 = ScriptedAcl::new("p3", 10, false);
        let (c1, c2, c3) = (p1.calls(), p2.calls(), p3.calls());
        let acls = acl_list(vec![p3, p1, p2]);

        let err = authorize(&acls, &BusCall::method("org.example.Reboot")).unwrap_err();
        assert!(err.is_access_denied());
        assert!(err.message.contains("'p2'"), "{}", err.message);
        assert!(err.message.contains("org.example.Reboot"), "{}", err.message);
        assert_eq!(c1.load(Ordering::SeqCst), 1);
        assert_eq!(c2.load(Ordering::SeqCst), 1);
        assert_eq!(c3.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn params_are_visible_to_plugins() {
        let call = BusCall::new(CallKind::SetProperty, "org.example.Account.Enabled")
            .with_sender(":1.42")
            .with_param("value", serde_json::json!(false));
        assert_eq!(call.param("value"), Some(&serde_json::json!(false)));
        assert!(call.param("other").is_none());
        assert_eq!(call.sender.as_deref(), Some(":1.42"));
    }

    // -------------------------------------------------------------------------
    // asynchronous chain
    // -------------------------------------------------------------------------

    #[test]
    fn async_chain_permits_when_all_permit() {
        let acls = acl_list(vec![ScriptedAcl::new("a", 2, true).asynchronous(), ScriptedAcl::new("b", 1, true)]);
        let (outcome, cleanups) = run_async(acls, BusCall::method("x.Y"));
        assert_eq!(outcome, Some(Ok(())));
        assert_eq!(cleanups, 1);
    }

    #[test]
    fn async_chain_skips_sync_only_plugins() {
        // A sync-only plugin that would deny is not consulted on the async path.
        let sync_denier = ScriptedAcl::new("sync", 5, false);
        let calls = sync_denier.calls();
        let acls = acl_list(vec![sync_denier, ScriptedAcl::new("async", 1, true).asynchronous()]);
        let (outcome, cleanups) = run_async(acls, BusCall::method("x.Y"));
        assert_eq!(outcome, Some(Ok(())));
        assert_eq!(cleanups, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn async_chain_attributes_denial_and_stops() {
        let later = ScriptedAcl::new("later", 1, true).asynchronous();
        let later_calls = later.calls();
        let acls = acl_list(vec![
            ScriptedAcl::new("first", 3, true).asynchronous(),
            ScriptedAcl::new("denier", 2, false).asynchronous(),
            later,
        ]);
        let (outcome, cleanups) = run_async(acls, BusCall::method("x.Y"));
        let err = outcome.unwrap().unwrap_err();
        assert!(err.message.contains("'denier'"), "{}", err.message);
        assert_eq!(cleanups, 1);
        assert_eq!(later_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dropped_verdict_denies_once() {
        let acls = acl_list(vec![ScriptedAcl::new("forgetful", 1, true).asynchronous().dropping_verdict()]);
        let (outcome, cleanups) = run_async(acls, BusCall::method("x.Y"));
        let err = outcome.unwrap().unwrap_err();
        assert!(err.message.contains("'forgetful'"));
        assert_eq!(cleanups, 1);
    }

    #[tokio::test]
    async fn suspended_verdict_resumes_from_task() {
        let acls = acl_list(vec![
            ScriptedAcl::new("deferred", 2, true).asynchronous().deferred(),
            ScriptedAcl::new("tail", 1, false).asynchronous().deferred(),
        ]);
        let err = authorize_async(acls, BusCall::method("x.Y")).await.unwrap_err();
        assert!(err.message.contains("'tail'"));
    }

    #[tokio::test]
    async fn async_future_permits_on_empty_chain() {
        let acls = acl_list(vec![]);
        assert!(authorize_async(acls, BusCall::method("x.Y")).await.is_ok());
    }
}
