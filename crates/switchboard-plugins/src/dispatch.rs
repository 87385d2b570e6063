//! Dispatch operations and the dispatch-operation policy chain.
//!
//! The dispatcher runs [`run_policies`] after observers have been told about
//! a bundle of channels and before approvers see it. Each policy plugin is
//! called once, in priority order, and may inspect the channels, hold the
//! operation with delay tokens, or terminate it.
//!
//! ## Phases
//!
//! ```text
//! Created -> PolicyRunning <-> Delayed -> ReadyForHandler
//!    \__________\_________________\______> Terminated (absorbing)
//! ```
//!
//! The operation's [`DispatchOutcome`] is published once every plugin has run
//! and every delay token has been ended. A terminated operation is never
//! reported as ready for a handler.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::watch;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::channel::ChannelInfo;
use crate::channel::ChannelProperties;
use crate::channel::GroupChangeReason;
use crate::channel::Recipient;
use crate::delay::DelayToken;
use crate::delay::HoldState;
use crate::error::PolicyError;
use crate::registry::CapabilityList;
use crate::util::lock;

/// Dispatch-operation policy capability.
#[async_trait::async_trait]
pub trait DispatchOperationPolicy: Send + Sync {
    /// Inspect, hold or terminate `operation`. Must return promptly; use
    /// [`DispatchOperation::start_delay`] for anything asynchronous.
    fn check(&self, operation: &DispatchOperation);

    /// Whether `handler` may be given `operation`. Consulted per candidate
    /// handler during handler selection.
    async fn handler_is_suitable(
        &self,
        _handler: &Recipient,
        _operation: &DispatchOperation,
    ) -> Result<(), PolicyError> {
        Ok(())
    }
}

/// Collaborator that actually acts on channels.
pub trait ChannelControl: Send + Sync {
    fn close(&self, channel: &ChannelInfo);

    /// Destructive teardown. Only called for channels that support it.
    fn destroy(&self, channel: &ChannelInfo);

    fn leave(&self, channel: &ChannelInfo, reason: GroupChangeReason, message: &str);
}

/// How a policy plugin terminated an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    Closed,
    Destroyed,
    Left { reason: GroupChangeReason, message: String },
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Closed => f.write_str("closed"),
            Termination::Destroyed => f.write_str("destroyed"),
            Termination::Left { reason, message } => write!(f, "left ({reason}: {message})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPhase {
    Created,
    PolicyRunning,
    Delayed,
    ReadyForHandler,
    Terminated,
}

/// Final word of the policy chain on an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    ReadyForHandler,
    Terminated(Termination),
}

/// Identity of the connection a bundle of channels came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchSource {
    pub account_path: String,
    pub connection_path: String,
    pub protocol: String,
    pub cm_name: String,
}

struct OpState {
    hold: HoldState,
    termination: Option<Termination>,
    /// Termination requested with `wait_for_observers` before they finished.
    deferred: Option<Termination>,
    observers_done: bool,
}

struct OpInner {
    source: DispatchSource,
    channels: Vec<ChannelInfo>,
    control: Option<Arc<dyn ChannelControl>>,
    state: Mutex<OpState>,
    outcome: watch::Sender<Option<DispatchOutcome>>,
}

/// A bundle of channels proposed for routing to a handler.
///
/// Cheap to clone; clones share state. Plugins may keep a clone only for as
/// long as they hold a delay token on it.
#[derive(Clone)]
pub struct DispatchOperation {
    inner: Arc<OpInner>,
}

impl DispatchOperation {
    pub fn new(source: DispatchSource, channels: Vec<ChannelInfo>) -> Self {
        Self::build(source, channels, None)
    }

    pub fn with_control(source: DispatchSource, channels: Vec<ChannelInfo>, control: Arc<dyn ChannelControl>) -> Self {
        Self::build(source, channels, Some(control))
    }

    fn build(source: DispatchSource, channels: Vec<ChannelInfo>, control: Option<Arc<dyn ChannelControl>>) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            inner: Arc::new(OpInner {
                source,
                channels,
                control,
                state: Mutex::new(OpState {
                    hold: HoldState::new(),
                    termination: None,
                    deferred: None,
                    observers_done: false,
                }),
                outcome,
            }),
        }
    }

    pub fn account_path(&self) -> &str {
        &self.inner.source.account_path
    }

    pub fn connection_path(&self) -> &str {
        &self.inner.source.connection_path
    }

    pub fn protocol(&self) -> &str {
        &self.inner.source.protocol
    }

    pub fn cm_name(&self) -> &str {
        &self.inner.source.cm_name
    }

    pub fn channels(&self) -> &[ChannelInfo] {
        &self.inner.channels
    }

    pub fn channel_count(&self) -> usize {
        self.inner.channels.len()
    }

    /// No channels to dispatch. Such an operation must not reach handler
    /// selection.
    pub fn is_empty(&self) -> bool {
        self.inner.channels.is_empty()
    }

    pub fn channel_path_at(&self, index: usize) -> Option<&str> {
        self.inner.channels.get(index).map(|c| c.path.as_str())
    }

    pub fn channel_properties_at(&self, index: usize) -> Option<&ChannelProperties> {
        self.inner.channels.get(index).map(|c| &c.properties)
    }

    /// Hold the operation until the returned token is ended.
    pub fn start_delay(&self) -> DelayToken {
        let mut state = lock(&self.inner.state);
        if state.hold.resolved() {
            warn!(account = %self.account_path(), "delay started after dispatch operation was resolved");
        }
        let token = state.hold.start();
        debug!(account = %self.account_path(), outstanding = state.hold.outstanding(), "dispatch delay started");
        token
    }

    pub fn end_delay(&self, token: DelayToken) {
        let mut state = lock(&self.inner.state);
        if state.hold.end(token) {
            debug!(account = %self.account_path(), outstanding = state.hold.outstanding(), "dispatch delay ended");
        }
        self.maybe_resolve(state);
    }

    /// Number of delay tokens not yet ended.
    pub fn outstanding_delays(&self) -> usize {
        lock(&self.inner.state).hold.outstanding()
    }

    pub fn phase(&self) -> DispatchPhase {
        let state = lock(&self.inner.state);
        if state.termination.is_some() {
            DispatchPhase::Terminated
        } else if state.hold.resolved() {
            DispatchPhase::ReadyForHandler
        } else if !state.hold.policy_started() {
            DispatchPhase::Created
        } else if state.hold.outstanding() > 0 {
            DispatchPhase::Delayed
        } else {
            DispatchPhase::PolicyRunning
        }
    }

    /// Whether the channels were closed, destroyed or left.
    pub fn is_terminated(&self) -> bool {
        lock(&self.inner.state).termination.is_some()
    }

    /// Current outcome, if the chain has resolved.
    pub fn outcome(&self) -> Option<DispatchOutcome> {
        self.inner.outcome.borrow().clone()
    }

    /// Wait for the chain to resolve.
    pub async fn wait(&self) -> DispatchOutcome {
        let mut rx = self.inner.outcome.subscribe();
        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                // Sender lives in `inner`, which `self` keeps alive.
                continue;
            }
        }
    }

    /// Close the channels politely.
    pub fn close_channels(&self, wait_for_observers: bool) {
        self.terminate(Termination::Closed, wait_for_observers);
    }

    /// Destroy the channels, falling back to close where unsupported.
    pub fn destroy_channels(&self, wait_for_observers: bool) {
        self.terminate(Termination::Destroyed, wait_for_observers);
    }

    /// Depart the channels with a group-change reason.
    #[deprecated(note = "use close_channels or destroy_channels")]
    pub fn leave_channels(&self, wait_for_observers: bool, reason: GroupChangeReason, message: &str) {
        self.terminate(
            Termination::Left {
                reason,
                message: message.to_string(),
            },
            wait_for_observers,
        );
    }

    /// Dispatcher notification that every observer has returned.
    pub fn observers_finished(&self) {
        let deferred = {
            let mut state = lock(&self.inner.state);
            state.observers_done = true;
            state.deferred.take()
        };
        if let Some(termination) = deferred {
            debug!(account = %self.account_path(), %termination, "running termination deferred for observers");
            self.apply(&termination);
        }
    }

    fn terminate(&self, termination: Termination, wait_for_observers: bool) {
        let mut state = lock(&self.inner.state);
        if let Some(existing) = &state.termination {
            warn!(account = %self.account_path(), %existing, requested = %termination, "dispatch operation already terminated");
            return;
        }
        info!(account = %self.account_path(), channels = self.channel_count(), %termination, "dispatch operation terminated by policy");
        state.termination = Some(termination.clone());
        let run_now = !wait_for_observers || state.observers_done;
        if !run_now {
            state.deferred = Some(termination.clone());
        }
        if state.hold.resolved() {
            // Already handed over; still make sure nobody sees it as ready now.
            self.inner.outcome.send_replace(Some(DispatchOutcome::Terminated(termination.clone())));
        }
        self.maybe_resolve(state);
        if run_now {
            self.apply(&termination);
        }
    }

    fn apply(&self, termination: &Termination) {
        let Some(control) = &self.inner.control else {
            return;
        };
        for channel in &self.inner.channels {
            match termination {
                Termination::Closed => control.close(channel),
                Termination::Destroyed if channel.supports_destroy() => control.destroy(channel),
                Termination::Destroyed => {
                    debug!(channel = %channel.path, "channel not destroyable, closing instead");
                    control.close(channel);
                }
                Termination::Left { reason, message } => control.leave(channel, *reason, message),
            }
        }
    }

    fn begin_policy(&self) -> bool {
        lock(&self.inner.state).hold.begin_policy()
    }

    fn finish_policy(&self) {
        let mut state = lock(&self.inner.state);
        state.hold.finish_policy();
        self.maybe_resolve(state);
    }

    fn maybe_resolve(&self, mut state: std::sync::MutexGuard<'_, OpState>) {
        if !state.hold.try_resolve() {
            return;
        }
        let outcome = match &state.termination {
            Some(termination) => DispatchOutcome::Terminated(termination.clone()),
            None => DispatchOutcome::ReadyForHandler,
        };
        drop(state);
        debug!(account = %self.account_path(), ?outcome, "dispatch operation resolved");
        self.inner.outcome.send_replace(Some(outcome));
    }
}

impl fmt::Debug for DispatchOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchOperation")
            .field("account_path", &self.account_path())
            .field("connection_path", &self.connection_path())
            .field("channels", &self.channel_count())
            .field("phase", &self.phase())
            .field("outstanding_delays", &self.outstanding_delays())
            .finish()
    }
}

/// Run every dispatch-operation policy plugin against `operation`.
///
/// Plugins run in priority order whether or not an earlier one terminated
/// the operation; the outcome is published once they have all returned and
/// every delay has ended.
///
/// An operation with no channels skips the plugins and resolves as
/// [`DispatchOutcome::ReadyForHandler`] straight away. That outcome is a
/// no-op: the dispatcher checks [`DispatchOperation::is_empty`] and drops the
/// operation instead of routing it to a handler.
pub fn run_policies(policies: &CapabilityList, operation: &DispatchOperation) {
    if !operation.begin_policy() {
        warn!(account = %operation.account_path(), "policy chain already ran for this dispatch operation");
        return;
    }

    if operation.is_empty() {
        warn!(account = %operation.account_path(), "dispatch operation has no channels, skipping policy");
        operation.finish_policy();
        return;
    }

    for record in policies.iter() {
        let Some(policy) = record.dispatch_operation_policy() else {
            continue;
        };
        debug!(plugin = %record.name(), account = %operation.account_path(), "checking dispatch operation");
        policy.check(operation);
    }

    operation.finish_policy();
}

/// Ask every policy plugin whether `handler` may receive `operation`.
///
/// Stops at the first plugin that objects; its error is returned with the
/// plugin named in the message.
pub async fn handler_is_suitable(
    policies: &CapabilityList,
    handler: &Recipient,
    operation: &DispatchOperation,
) -> Result<(), PolicyError> {
    for record in policies.iter() {
        let Some(policy) = record.dispatch_operation_policy() else {
            continue;
        };
        if let Err(e) = policy.handler_is_suitable(handler, operation).await {
            warn!(plugin = %record.name(), %handler, error = %e, "handler rejected by dispatch policy");
            return Err(PolicyError::new(
                e.domain,
                e.code,
                format!("handler '{}' rejected by policy plugin '{}': {}", handler.name, record.name(), e.message),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(deprecated)]

    use serde_json::json;

    use super::*;
    use crate::constants::DESTROYABLE_INTERFACE;
    use crate::constants::channel_property;
    use crate::plugin::PluginRecord;
    use crate::test_support::RecordingControl;

    fn no_policies() -> CapabilityList {
        CapabilityList::from(Vec::<PluginRecord>::new())
    }

    fn channel(path: &str) -> ChannelInfo {
        ChannelInfo::new(path, ChannelProperties::new())
    }

    fn operation(channels: Vec<ChannelInfo>) -> (DispatchOperation, Arc<RecordingControl>) {
        let control = Arc::new(RecordingControl::default());
        let op = DispatchOperation::with_control(
            DispatchSource {
                account_path: "/account/gabble/jabber/alice".into(),
                ..Default::default()
            },
            channels,
            control.clone(),
        );
        (op, control)
    }

    #[test]
    fn index_accessors_are_bounds_checked() {
        let (op, _) = operation(vec![channel("/c/1").with_property(channel_property::TARGET_ID, json!("bob"))]);
        assert_eq!(op.channel_count(), 1);
        assert_eq!(op.channel_path_at(0), Some("/c/1"));
        assert_eq!(op.channel_path_at(1), None);
        assert_eq!(op.channel_properties_at(0).and_then(|p| p.get(channel_property::TARGET_ID)), Some(&json!("bob")));
        assert!(op.channel_properties_at(5).is_none());
    }

    #[test]
    fn empty_chain_resolves_ready() {
        let (op, _) = operation(vec![channel("/c/1")]);
        assert_eq!(op.phase(), DispatchPhase::Created);
        run_policies(&no_policies(), &op);
        assert_eq!(op.outcome(), Some(DispatchOutcome::ReadyForHandler));
        assert_eq!(op.phase(), DispatchPhase::ReadyForHandler);
    }

    #[test]
    fn delay_holds_until_ended() {
        let (op, _) = operation(vec![channel("/c/1")]);
        assert!(op.begin_policy());
        let a = op.start_delay();
        let b = op.start_delay();
        assert_eq!(op.phase(), DispatchPhase::Delayed);
        op.finish_policy();
        assert_eq!(op.outstanding_delays(), 2);
        op.end_delay(a);
        assert_eq!(op.outcome(), None);
        op.end_delay(b);
        assert_eq!(op.outcome(), Some(DispatchOutcome::ReadyForHandler));
    }

    #[test]
    fn foreign_delay_token_keeps_count_at_zero() {
        let (op, _) = operation(vec![channel("/c/1")]);
        let (other, _) = operation(vec![channel("/c/2")]);
        let foreign = other.start_delay();
        op.end_delay(foreign);
        assert_eq!(op.outstanding_delays(), 0);
        assert_eq!(other.outstanding_delays(), 1);
    }

    #[test]
    fn destroy_falls_back_to_close() {
        let destroyable = channel("/c/d").with_property(channel_property::INTERFACES, json!([DESTROYABLE_INTERFACE]));
        let (op, control) = operation(vec![destroyable, channel("/c/plain")]);
        op.destroy_channels(false);
        assert_eq!(control.actions(), vec!["destroy /c/d".to_string(), "close /c/plain".to_string()]);
        assert_eq!(op.phase(), DispatchPhase::Terminated);
    }

    #[test]
    fn termination_is_absorbing() {
        let (op, control) = operation(vec![channel("/c/1")]);
        op.close_channels(false);
        op.destroy_channels(false);
        op.leave_channels(false, GroupChangeReason::Busy, "later");
        assert_eq!(control.actions(), vec!["close /c/1".to_string()]);
        run_policies(&no_policies(), &op);
        assert_eq!(op.outcome(), Some(DispatchOutcome::Terminated(Termination::Closed)));
    }

    #[test]
    fn wait_for_observers_defers_action() {
        let (op, control) = operation(vec![channel("/c/1")]);
        op.leave_channels(true, GroupChangeReason::PermissionDenied, "Computer says no");
        assert!(op.is_terminated());
        assert!(control.actions().is_empty());
        op.observers_finished();
        assert_eq!(control.actions(), vec!["leave /c/1 permission-denied Computer says no".to_string()]);
    }

    #[test]
    fn zero_channel_operation_is_a_no_op() {
        let (op, control) = operation(vec![]);
        assert!(op.is_empty());
        run_policies(&no_policies(), &op);
        assert_eq!(op.outcome(), Some(DispatchOutcome::ReadyForHandler));
        assert!(control.actions().is_empty());

        let (busy, _) = operation(vec![channel("/c/1")]);
        assert!(!busy.is_empty());
    }

    #[tokio::test]
    async fn wait_returns_after_delay_from_task() {
        let (op, _) = operation(vec![channel("/c/1")]);
        assert!(op.begin_policy());
        let token = op.start_delay();
        op.finish_policy();
        let held = op.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            held.end_delay(token);
        });
        assert_eq!(op.wait().await, DispatchOutcome::ReadyForHandler);
    }
}
