//! Channel requests and the request-policy chain.
//!
//! Unlike the ACL chains, the request-policy chain never stops early: every
//! plugin sees the request even after one has denied it, because policy
//! plugins may have side effects that must still run. The first denial is
//! the one reported; later ones are only logged.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::watch;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::channel::ChannelProperties;
use crate::constants::channel_property;
use crate::delay::DelayToken;
use crate::delay::HoldState;
use crate::error::PolicyError;
use crate::registry::CapabilityList;
use crate::util::lock;

/// Request-policy capability.
pub trait RequestPolicy: Send + Sync {
    /// Inspect `request`, optionally denying or holding it. Must return
    /// promptly; use [`Request::start_delay`] for asynchronous work.
    fn check(&self, request: &Request);
}

/// Who asked for the channels, and on which account.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestSource {
    pub account_path: String,
    pub protocol: String,
    pub cm_name: String,
    /// X11-style timestamp of the user action that caused the request; 0 if
    /// none, `i64::MAX` for "now".
    pub user_action_time: i64,
    /// Unique bus name of the requesting client, if it is still around.
    pub requesting_client: Option<String>,
}

/// Final word of the request-policy chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    Proceed,
    Denied(PolicyError),
}

struct RequestState {
    hold: HoldState,
    denial: Option<PolicyError>,
}

struct RequestInner {
    source: RequestSource,
    requests: Vec<ChannelProperties>,
    state: Mutex<RequestState>,
    outcome: watch::Sender<Option<RequestOutcome>>,
}

/// A client's request for one or more channels, between "proceed" and the
/// connection manager.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Request {
    inner: Arc<RequestInner>,
}

impl Request {
    pub fn new(source: RequestSource, requests: Vec<ChannelProperties>) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            inner: Arc::new(RequestInner {
                source,
                requests,
                state: Mutex::new(RequestState {
                    hold: HoldState::new(),
                    denial: None,
                }),
                outcome,
            }),
        }
    }

    pub fn account_path(&self) -> &str {
        &self.inner.source.account_path
    }

    pub fn protocol(&self) -> &str {
        &self.inner.source.protocol
    }

    pub fn cm_name(&self) -> &str {
        &self.inner.source.cm_name
    }

    pub fn user_action_time(&self) -> i64 {
        self.inner.source.user_action_time
    }

    pub fn requesting_client(&self) -> Option<&str> {
        self.inner.source.requesting_client.as_deref()
    }

    pub fn request_count(&self) -> usize {
        self.inner.requests.len()
    }

    pub fn request_properties_at(&self, index: usize) -> Option<&ChannelProperties> {
        self.inner.requests.get(index)
    }

    /// First request at or after `start_from` whose channel type is
    /// `channel_type`, with its index.
    pub fn find_request_by_type(&self, start_from: usize, channel_type: &str) -> Option<(usize, &ChannelProperties)> {
        self.inner
            .requests
            .iter()
            .enumerate()
            .skip(start_from)
            .find(|(_, props)| {
                props.get(channel_property::CHANNEL_TYPE).and_then(|v| v.as_str()) == Some(channel_type)
            })
    }

    /// Fail the request with a structured error.
    ///
    /// Only the first denial is kept. Other plugins are still consulted.
    /// A denial after the request resolved replaces the published outcome.
    pub fn deny(&self, domain: impl Into<String>, code: i32, message: impl Into<String>) {
        let error = PolicyError::new(domain, code, message);
        let mut state = lock(&self.inner.state);
        if let Some(first) = &state.denial {
            warn!(account = %self.account_path(), first = %first, ignored = %error, "request already denied");
            return;
        }
        state.denial = Some(error.clone());
        if !state.hold.resolved() {
            info!(account = %self.account_path(), error = %error, "channel request denied by policy");
            return;
        }
        drop(state);
        warn!(account = %self.account_path(), error = %error, "channel request denied after it was resolved");
        self.inner.outcome.send_replace(Some(RequestOutcome::Denied(error)));
    }

    pub fn is_denied(&self) -> bool {
        lock(&self.inner.state).denial.is_some()
    }

    pub fn start_delay(&self) -> DelayToken {
        let mut state = lock(&self.inner.state);
        if state.hold.resolved() {
            warn!(account = %self.account_path(), "delay started after request was resolved");
        }
        state.hold.start()
    }

    pub fn end_delay(&self, token: DelayToken) {
        let mut state = lock(&self.inner.state);
        state.hold.end(token);
        self.maybe_resolve(state);
    }

    pub fn outstanding_delays(&self) -> usize {
        lock(&self.inner.state).hold.outstanding()
    }

    pub fn outcome(&self) -> Option<RequestOutcome> {
        self.inner.outcome.borrow().clone()
    }

    /// Wait until every plugin has run and every delay has ended.
    pub async fn wait(&self) -> RequestOutcome {
        let mut rx = self.inner.outcome.subscribe();
        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                continue;
            }
        }
    }

    fn maybe_resolve(&self, mut state: std::sync::MutexGuard<'_, RequestState>) {
        if !state.hold.try_resolve() {
            return;
        }
        let outcome = match &state.denial {
            Some(error) => RequestOutcome::Denied(error.clone()),
            None => RequestOutcome::Proceed,
        };
        drop(state);
        debug!(account = %self.account_path(), ?outcome, "channel request resolved");
        self.inner.outcome.send_replace(Some(outcome));
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("account_path", &self.account_path())
            .field("requests", &self.request_count())
            .field("denied", &self.is_denied())
            .field("outstanding_delays", &self.outstanding_delays())
            .finish()
    }
}

/// Offer `request` to every request-policy plugin, in priority order.
pub fn run_policies(policies: &CapabilityList, request: &Request) {
    let began = lock(&request.inner.state).hold.begin_policy();
    if !began {
        warn!(account = %request.account_path(), "policy chain already ran for this request");
        return;
    }

    for record in policies.iter() {
        let Some(policy) = record.request_policy() else {
            continue;
        };
        debug!(plugin = %record.name(), account = %request.account_path(), denied = request.is_denied(), "checking channel request");
        policy.check(request);
    }

    let mut state = lock(&request.inner.state);
    state.hold.finish_policy();
    request.maybe_resolve(state);
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::plugin::PluginRecord;

    fn no_policies() -> CapabilityList {
        CapabilityList::from(Vec::<PluginRecord>::new())
    }

    fn text_and_call() -> Request {
        let text = ChannelProperties::from([(
            channel_property::CHANNEL_TYPE.to_string(),
            json!("org.freedesktop.Telepathy.Channel.Type.Text"),
        )]);
        let call = ChannelProperties::from([(
            channel_property::CHANNEL_TYPE.to_string(),
            json!("org.freedesktop.Telepathy.Channel.Type.Call1"),
        )]);
        Request::new(
            RequestSource {
                account_path: "/account/gabble/jabber/alice".into(),
                user_action_time: 1234,
                requesting_client: Some(":1.9".into()),
                ..Default::default()
            },
            vec![text.clone(), call, text],
        )
    }

    #[test]
    fn finds_requests_by_type_from_offset() {
        let request = text_and_call();
        let text = "org.freedesktop.Telepathy.Channel.Type.Text";
        assert_eq!(request.find_request_by_type(0, text).map(|(i, _)| i), Some(0));
        assert_eq!(request.find_request_by_type(1, text).map(|(i, _)| i), Some(2));
        assert!(request.find_request_by_type(3, text).is_none());
        assert!(request.find_request_by_type(0, "nope").is_none());
        assert_eq!(request.request_count(), 3);
        assert!(request.request_properties_at(3).is_none());
        assert_eq!(request.user_action_time(), 1234);
        assert_eq!(request.requesting_client(), Some(":1.9"));
    }

    #[test]
    fn first_denial_is_kept() {
        let request = text_and_call();
        request.deny("permission-denied", 1, "first");
        request.deny("other", 2, "second");
        run_policies(&no_policies(), &request);
        match request.outcome() {
            Some(RequestOutcome::Denied(error)) => {
                assert_eq!(error.domain, "permission-denied");
                assert_eq!(error.message, "first");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn delay_holds_outcome() {
        let request = text_and_call();
        let token = request.start_delay();
        run_policies(&no_policies(), &request);
        assert_eq!(request.outcome(), None);
        assert_eq!(request.outstanding_delays(), 1);
        request.end_delay(token);
        assert_eq!(request.outcome(), Some(RequestOutcome::Proceed));
    }

    #[test]
    fn late_denial_replaces_proceed() {
        let request = text_and_call();
        run_policies(&no_policies(), &request);
        assert_eq!(request.outcome(), Some(RequestOutcome::Proceed));

        request.deny("permission-denied", 7, "too late");
        assert!(request.is_denied());
        match request.outcome() {
            Some(RequestOutcome::Denied(error)) => assert_eq!(error.message, "too late"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
