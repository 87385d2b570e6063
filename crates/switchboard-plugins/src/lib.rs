//! Policy plugins for the Switchboard IPC broker.
//!
//! Loads native plugin modules from a directory, sorts the objects they
//! expose by priority per capability, and drives the chains the dispatcher
//! and account manager call into.
//!
//! ## Chains
//!
//! The dispatcher runs them in a fixed order:
//!
//! 1. **Channel ACL** ([`authorize_handler`]) before handler selection
//! 2. **Dispatch-operation policy** ([`dispatch::run_policies`]) after
//!    observers are notified, before approvers
//! 3. **Request policy** ([`request::run_policies`]) after the requesting
//!    client says "proceed", before the connection manager is asked
//! 4. **ACL** ([`authorize`], [`AsyncAuthorization`]) for any bus call that
//!    needs authorization, independent of dispatch
//!
//! The account manager reads and writes account settings through the
//! [`AccountStorageChain`].
//!
//! ## Writing a plugin
//!
//! Build a `cdylib` named with the plugin prefix (`sb-plugin-*.so` by
//! default), implement [`Plugin`] plus the capability traits you need, and
//! export your objects with [`export_plugins!`].

pub mod acl;
pub mod channel;
pub mod channel_acl;
pub mod config;
pub mod constants;
mod delay;
pub mod dispatch;
pub mod error;
mod plugin;
mod registry;
pub mod request;
pub mod storage;
mod util;

#[cfg(any(test, feature = "testing"))]
pub mod test_support;

pub use acl::AclVerdict;
pub use acl::AsyncAuthorization;
pub use acl::BusCall;
pub use acl::authorize;
pub use acl::authorize_async;
pub use channel::ChannelInfo;
pub use channel::Recipient;
pub use channel_acl::authorize_handler;
pub use config::PluginConfig;
pub use delay::DelayToken;
pub use dispatch::DispatchOperation;
pub use dispatch::DispatchOutcome;
pub use error::ConfigError;
pub use error::LoadError;
pub use error::PolicyError;
pub use plugin::Capability;
pub use plugin::CapabilitySet;
pub use plugin::Plugin;
pub use plugin::PluginEntry;
pub use plugin::PluginOrigin;
pub use plugin::PluginRecord;
pub use registry::CapabilityList;
pub use registry::LoadReport;
pub use registry::LoadedModule;
pub use registry::PluginRegistry;
pub use request::Request;
pub use request::RequestOutcome;
pub use storage::AccountStorageChain;
