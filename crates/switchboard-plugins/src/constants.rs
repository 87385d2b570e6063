//! Fixed names and numeric bands shared by the broker and plugin authors.

/// File-name prefix a module must carry to be considered a plugin candidate.
pub const DEFAULT_PLUGIN_FILE_PREFIX: &str = "sb-plugin-";

/// Symbol every plugin module exports; see [`crate::PluginEntry`].
pub const DEFAULT_PLUGIN_ENTRY_SYMBOL: &str = "switchboard_plugin_object";

/// Environment variable overriding the configured plugin directory.
pub const PLUGIN_DIR_ENV: &str = "SWITCHBOARD_PLUGIN_DIR";

/// Upper bound on objects a single module may hand out.
///
/// Protects the loader from an entry point that never returns null.
pub const MAX_OBJECTS_PER_MODULE: u32 = 256;

/// Error domain used for every chain's denial.
pub const ACCESS_DENIED_DOMAIN: &str = "access-denied";

/// Numeric code paired with [`ACCESS_DENIED_DOMAIN`].
pub const ACCESS_DENIED_CODE: i32 = 9;

/// Denier name reported when an async chain fails before consulting anyone.
pub const UNKNOWN_DENIER: &str = "*unknown*";

/// Account storage priority bands.
///
/// Bands are spaced so that plugins can nudge themselves within a band
/// without colliding with the next one.
pub mod storage_priority {
    /// Read-only overlays (e.g. system-provided defaults).
    pub const READONLY: i32 = -1;
    /// The built-in keyfile store.
    pub const DEFAULT: i32 = 0;
    /// Ordinary third-party stores.
    pub const NORMAL: i32 = 100;
    /// Secure credential stores.
    pub const KEYRING: i32 = 10_000;
}

/// Buffered storage notifications per subscriber before it starts lagging.
pub const STORAGE_EVENT_CAPACITY: usize = 64;

/// Well-known immutable channel property names.
pub mod channel_property {
    pub const CHANNEL_TYPE: &str = "org.freedesktop.Telepathy.Channel.ChannelType";
    pub const TARGET_HANDLE_TYPE: &str = "org.freedesktop.Telepathy.Channel.TargetHandleType";
    pub const TARGET_ID: &str = "org.freedesktop.Telepathy.Channel.TargetID";
    pub const INITIATOR_ID: &str = "org.freedesktop.Telepathy.Channel.InitiatorID";
    pub const REQUESTED: &str = "org.freedesktop.Telepathy.Channel.Requested";
    pub const INTERFACES: &str = "org.freedesktop.Telepathy.Channel.Interfaces";
}

/// Interface a channel lists in its `Interfaces` property when it can be
/// torn down destructively.
pub const DESTROYABLE_INTERFACE: &str = "org.freedesktop.Telepathy.Channel.Interface.Destroyable";
