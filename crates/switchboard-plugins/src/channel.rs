//! Channel descriptors and client identities seen by policy plugins.

use std::collections::BTreeMap;
use std::fmt;

use crate::constants::DESTROYABLE_INTERFACE;
use crate::constants::channel_property;

/// Immutable property map of a channel or channel request.
pub type ChannelProperties = BTreeMap<String, serde_json::Value>;

/// One channel in a dispatch operation.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelInfo {
    /// Object path of the channel on its connection.
    pub path: String,
    pub properties: ChannelProperties,
}

impl ChannelInfo {
    pub fn new(path: impl Into<String>, properties: ChannelProperties) -> Self {
        Self {
            path: path.into(),
            properties,
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(|v| v.as_str())
    }

    pub fn channel_type(&self) -> Option<&str> {
        self.property_str(channel_property::CHANNEL_TYPE)
    }

    pub fn target_id(&self) -> Option<&str> {
        self.property_str(channel_property::TARGET_ID)
    }

    /// Whether the channel advertises destructive teardown.
    pub fn supports_destroy(&self) -> bool {
        self.properties
            .get(channel_property::INTERFACES)
            .and_then(|v| v.as_array())
            .is_some_and(|ifaces| ifaces.iter().any(|i| i.as_str() == Some(DESTROYABLE_INTERFACE)))
    }
}

/// A client process that may receive channels.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Recipient {
    /// Well-known bus name the client registered.
    pub name: String,
    /// Unique connection name currently owning `name`.
    pub unique_name: Option<String>,
}

impl Recipient {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unique_name: None,
        }
    }

    pub fn with_unique_name(mut self, unique_name: impl Into<String>) -> Self {
        self.unique_name = Some(unique_name.into());
        self
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.unique_name {
            Some(unique) => write!(f, "{} ({})", self.name, unique),
            None => f.write_str(&self.name),
        }
    }
}

/// Reason given when departing a channel's group membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GroupChangeReason {
    #[default]
    None,
    Offline,
    Kicked,
    Busy,
    Invited,
    Banned,
    Error,
    InvalidContact,
    NoAnswer,
    Renamed,
    PermissionDenied,
    Separated,
}

impl GroupChangeReason {
    pub fn as_str(self) -> &'static str {
        match self {
            GroupChangeReason::None => "none",
            GroupChangeReason::Offline => "offline",
            GroupChangeReason::Kicked => "kicked",
            GroupChangeReason::Busy => "busy",
            GroupChangeReason::Invited => "invited",
            GroupChangeReason::Banned => "banned",
            GroupChangeReason::Error => "error",
            GroupChangeReason::InvalidContact => "invalid-contact",
            GroupChangeReason::NoAnswer => "no-answer",
            GroupChangeReason::Renamed => "renamed",
            GroupChangeReason::PermissionDenied => "permission-denied",
            GroupChangeReason::Separated => "separated",
        }
    }
}

impl fmt::Display for GroupChangeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn reads_well_known_properties() {
        let channel = ChannelInfo::new("/conn/chan1", ChannelProperties::new())
            .with_property(channel_property::CHANNEL_TYPE, json!("org.freedesktop.Telepathy.Channel.Type.Text"))
            .with_property(channel_property::TARGET_ID, json!("policy@example.net"));
        assert_eq!(channel.channel_type(), Some("org.freedesktop.Telepathy.Channel.Type.Text"));
        assert_eq!(channel.target_id(), Some("policy@example.net"));
        assert!(!channel.supports_destroy());
    }

    #[test]
    fn destroyable_interface_is_detected() {
        let channel = ChannelInfo::new("/conn/chan2", ChannelProperties::new())
            .with_property(channel_property::INTERFACES, json!([DESTROYABLE_INTERFACE]));
        assert!(channel.supports_destroy());
    }

    #[test]
    fn recipient_display_includes_unique_name() {
        let recipient = Recipient::new("org.freedesktop.Telepathy.Client.Logger").with_unique_name(":1.7");
        assert_eq!(recipient.to_string(), "org.freedesktop.Telepathy.Client.Logger (:1.7)");
        assert_eq!(GroupChangeReason::PermissionDenied.to_string(), "permission-denied");
    }
}
