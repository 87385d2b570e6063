//! Plugin objects and the capabilities they expose.
//!
//! A plugin module hands out generic [`Plugin`] objects. Each object answers
//! which policy capabilities it implements through the `as_*` accessors; the
//! registry resolves these once into a [`CapabilitySet`] when the object is
//! registered, so chains never re-query them.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::acl::Acl;
use crate::channel_acl::ChannelAcl;
use crate::dispatch::DispatchOperationPolicy;
use crate::request::RequestPolicy;
use crate::storage::AccountStorage;

/// Signature of the entry point every plugin module exports.
///
/// Called with `0, 1, 2, ...` until it returns null. Each non-null return
/// is a `Box::into_raw(Box::new(object))` the host takes ownership of.
#[allow(improper_ctypes_definitions)]
pub type PluginEntry = unsafe extern "C" fn(index: u32) -> *mut Box<dyn Plugin>;

/// An object exposed by a plugin module (or registered in-process).
pub trait Plugin: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Free-form identifier of whoever ships the plugin.
    fn provider(&self) -> Option<&str> {
        None
    }

    /// Ordering key within each capability; higher runs first.
    fn priority(&self) -> i32 {
        0
    }

    fn as_acl(&self) -> Option<&dyn Acl> {
        None
    }

    fn as_channel_acl(&self) -> Option<&dyn ChannelAcl> {
        None
    }

    fn as_dispatch_operation_policy(&self) -> Option<&dyn DispatchOperationPolicy> {
        None
    }

    fn as_request_policy(&self) -> Option<&dyn RequestPolicy> {
        None
    }

    fn as_account_storage(&self) -> Option<&dyn AccountStorage> {
        None
    }
}

/// Policy capabilities a plugin object may implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Acl,
    ChannelAcl,
    DispatchOperationPolicy,
    RequestPolicy,
    AccountStorage,
}

impl Capability {
    pub const COUNT: usize = 5;

    pub const ALL: [Capability; Capability::COUNT] = [
        Capability::Acl,
        Capability::ChannelAcl,
        Capability::DispatchOperationPolicy,
        Capability::RequestPolicy,
        Capability::AccountStorage,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            Capability::Acl => 0,
            Capability::ChannelAcl => 1,
            Capability::DispatchOperationPolicy => 2,
            Capability::RequestPolicy => 3,
            Capability::AccountStorage => 4,
        }
    }

    fn bit(self) -> u8 {
        1 << self.index()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Acl => "acl",
            Capability::ChannelAcl => "channel-acl",
            Capability::DispatchOperationPolicy => "dispatch-operation-policy",
            Capability::RequestPolicy => "request-policy",
            Capability::AccountStorage => "account-storage",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of capabilities, one bit per [`Capability`].
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CapabilitySet(u8);

impl CapabilitySet {
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Query `plugin` for every capability it implements.
    pub fn of(plugin: &dyn Plugin) -> Self {
        let mut set = Self::empty();
        if plugin.as_acl().is_some() {
            set.insert(Capability::Acl);
        }
        if plugin.as_channel_acl().is_some() {
            set.insert(Capability::ChannelAcl);
        }
        if plugin.as_dispatch_operation_policy().is_some() {
            set.insert(Capability::DispatchOperationPolicy);
        }
        if plugin.as_request_policy().is_some() {
            set.insert(Capability::RequestPolicy);
        }
        if plugin.as_account_storage().is_some() {
            set.insert(Capability::AccountStorage);
        }
        set
    }

    pub fn insert(&mut self, capability: Capability) {
        self.0 |= capability.bit();
    }

    pub fn contains(self, capability: Capability) -> bool {
        self.0 & capability.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = Capability> {
        Capability::ALL.into_iter().filter(move |c| self.contains(*c))
    }
}

impl fmt::Debug for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(Capability::as_str)).finish()
    }
}

/// Where a plugin object came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginOrigin {
    /// Handed out by a module found in the plugin directory.
    Module(PathBuf),
    /// Registered directly by the embedding process.
    Embedded,
}

/// One registered plugin object. Cheap to clone; never released.
#[derive(Clone)]
pub struct PluginRecord {
    plugin: Arc<dyn Plugin>,
    capabilities: CapabilitySet,
    sequence: u64,
    origin: PluginOrigin,
}

impl PluginRecord {
    pub(crate) fn new(plugin: Arc<dyn Plugin>, sequence: u64, origin: PluginOrigin) -> Self {
        let capabilities = CapabilitySet::of(plugin.as_ref());
        Self {
            plugin,
            capabilities,
            sequence,
            origin,
        }
    }

    pub fn name(&self) -> &str {
        self.plugin.name()
    }

    pub fn description(&self) -> &str {
        self.plugin.description()
    }

    pub fn provider(&self) -> Option<&str> {
        self.plugin.provider()
    }

    pub fn priority(&self) -> i32 {
        self.plugin.priority()
    }

    pub fn capabilities(&self) -> CapabilitySet {
        self.capabilities
    }

    /// Zero-based discovery position across the whole registry.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn origin(&self) -> &PluginOrigin {
        &self.origin
    }

    pub fn plugin(&self) -> &Arc<dyn Plugin> {
        &self.plugin
    }

    pub fn acl(&self) -> Option<&dyn Acl> {
        self.plugin.as_acl()
    }

    pub fn channel_acl(&self) -> Option<&dyn ChannelAcl> {
        self.plugin.as_channel_acl()
    }

    pub fn dispatch_operation_policy(&self) -> Option<&dyn DispatchOperationPolicy> {
        self.plugin.as_dispatch_operation_policy()
    }

    pub fn request_policy(&self) -> Option<&dyn RequestPolicy> {
        self.plugin.as_request_policy()
    }

    pub fn account_storage(&self) -> Option<&dyn AccountStorage> {
        self.plugin.as_account_storage()
    }
}

impl fmt::Debug for PluginRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRecord")
            .field("name", &self.name())
            .field("priority", &self.priority())
            .field("capabilities", &self.capabilities)
            .field("sequence", &self.sequence)
            .field("origin", &self.origin)
            .finish()
    }
}

/// Export plugin objects from a `cdylib` plugin module.
///
/// Generates the `switchboard_plugin_object` entry point. Each expression is
/// evaluated when the host asks for its index.
///
/// ```ignore
/// switchboard_plugins::export_plugins![DenyListAcl::new(), KeyfileStorage::default()];
/// ```
#[macro_export]
macro_rules! export_plugins {
    ($($object:expr),* $(,)?) => {
        #[unsafe(no_mangle)]
        #[allow(improper_ctypes_definitions)]
        pub extern "C" fn switchboard_plugin_object(index: u32) -> *mut ::std::boxed::Box<dyn $crate::Plugin> {
            let constructors: &[fn() -> ::std::boxed::Box<dyn $crate::Plugin>] = &[$(
                || {
                    let object: ::std::boxed::Box<dyn $crate::Plugin> = ::std::boxed::Box::new($object);
                    object
                }
            ),*];
            match constructors.get(index as usize) {
                Some(constructor) => ::std::boxed::Box::into_raw(::std::boxed::Box::new(constructor())),
                None => ::std::ptr::null_mut(),
            }
        }
    };
}
