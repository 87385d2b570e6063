//! Layered account storage.
//!
//! Account settings live in whichever storage plugin owns the account. The
//! [`AccountStorageChain`] walks storage plugins in priority order so that a
//! higher-priority store (a keyring, say) shadows lower ones (read-only
//! system defaults), and remembers which plugin owns which account so that
//! writes land in one place.
//!
//! ## Ownership
//!
//! An account's owner is, in order of preference:
//!
//! 1. the plugin recorded when the account was listed or created,
//! 2. the first plugin (by priority) whose [`AccountStorage::owns`] says yes,
//! 3. the first plugin that accepts a write for it.
//!
//! A key no plugin knows is "not found", never an error.
//!
//! ## Notifications
//!
//! Plugins report changes made behind the broker's back (another process
//! editing a keyfile, a keyring unlocking) through the [`StorageNotifier`]
//! they receive in [`AccountStorage::ready`]. Events fan out to every
//! [`AccountStorageChain::subscribe`] receiver.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::broadcast;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::constants::STORAGE_EVENT_CAPACITY;
use crate::plugin::PluginRecord;
use crate::registry::CapabilityList;
use crate::util::lock;

/// Receives values read out of a storage plugin.
pub trait AccountSink: Send + Sync {
    /// Store `value` for `account`/`key`; `None` clears it.
    fn set_value(&self, account: &str, key: &str, value: Option<String>);
}

/// Account storage capability.
///
/// `get`, `set` and `delete` return `false` to mean "not mine / not found",
/// which lets the chain try the next plugin. A plugin that declines must not
/// have changed anything.
pub trait AccountStorage: Send + Sync {
    /// Called once the account manager has loaded, with the sink values are
    /// read into and the notifier for out-of-band changes.
    fn ready(&self, _sink: Arc<dyn AccountSink>, _notifier: StorageNotifier) {}

    /// Write `key` (or every key when `None`) for `account` into `sink`.
    fn get(&self, sink: &dyn AccountSink, account: &str, key: Option<&str>) -> bool;

    fn set(&self, account: &str, key: &str, value: &str) -> bool;

    /// Remove `key`, or the whole account when `None`.
    fn delete(&self, account: &str, key: Option<&str>) -> bool;

    /// Persist all unsaved state.
    fn commit(&self) -> bool;

    /// Persist unsaved state for one account, or everything when `None`.
    fn commit_one(&self, account: Option<&str>) -> bool {
        let _ = account;
        self.commit()
    }

    /// Every account this plugin knows.
    fn list(&self) -> Vec<String>;

    /// Whether this plugin claims `account`.
    fn owns(&self, account: &str) -> bool {
        self.list().iter().any(|a| a == account)
    }

    /// Agree to store a new account and pick its unique name.
    fn create(&self, _manager: &str, _protocol: &str, _identifier: &str) -> Option<String> {
        None
    }

    /// Backend-specific identifier for `account`, for display or debugging.
    fn identifier(&self, _account: &str) -> Option<String> {
        None
    }

    fn additional_info(&self, _account: &str) -> BTreeMap<String, serde_json::Value> {
        BTreeMap::new()
    }

    fn restrictions(&self, _account: &str) -> AccountRestrictions {
        AccountRestrictions::empty()
    }
}

/// Things the user may not change about an account.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct AccountRestrictions(u32);

impl AccountRestrictions {
    pub const CANNOT_SET_PARAMETERS: Self = Self(1);
    pub const CANNOT_SET_ENABLED: Self = Self(1 << 1);
    pub const CANNOT_SET_PRESENCE: Self = Self(1 << 2);
    pub const CANNOT_SET_SERVICE: Self = Self(1 << 3);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for AccountRestrictions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for AccountRestrictions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::CANNOT_SET_PARAMETERS, "cannot-set-parameters"),
            (Self::CANNOT_SET_ENABLED, "cannot-set-enabled"),
            (Self::CANNOT_SET_PRESENCE, "cannot-set-presence"),
            (Self::CANNOT_SET_SERVICE, "cannot-set-service"),
        ];
        f.debug_set()
            .entries(names.iter().filter(|(flag, _)| self.contains(*flag)).map(|(_, name)| name))
            .finish()
    }
}

/// What changed in an out-of-band storage notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageChange {
    Created,
    /// Several keys may have changed; re-read the account.
    Altered,
    AlteredOne { key: String },
    Deleted,
    Toggled { enabled: bool },
    ReconnectRequested,
}

/// One notification, tagged with the plugin that sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub plugin: String,
    pub account: String,
    pub change: StorageChange,
}

/// Handle a storage plugin emits change notifications through.
#[derive(Clone)]
pub struct StorageNotifier {
    plugin: String,
    sender: broadcast::Sender<StorageEvent>,
}

impl StorageNotifier {
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn created(&self, account: &str) {
        self.emit(account, StorageChange::Created);
    }

    pub fn altered(&self, account: &str) {
        self.emit(account, StorageChange::Altered);
    }

    pub fn altered_one(&self, account: &str, key: &str) {
        self.emit(account, StorageChange::AlteredOne { key: key.to_string() });
    }

    pub fn deleted(&self, account: &str) {
        self.emit(account, StorageChange::Deleted);
    }

    pub fn toggled(&self, account: &str, enabled: bool) {
        self.emit(account, StorageChange::Toggled { enabled });
    }

    pub fn reconnect(&self, account: &str) {
        self.emit(account, StorageChange::ReconnectRequested);
    }

    fn emit(&self, account: &str, change: StorageChange) {
        debug!(plugin = %self.plugin, account, ?change, "storage notification");
        let event = StorageEvent {
            plugin: self.plugin.clone(),
            account: account.to_string(),
            change,
        };
        if self.sender.send(event).is_err() {
            debug!(plugin = %self.plugin, account, "no account manager listening for storage events");
        }
    }
}

impl fmt::Debug for StorageNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageNotifier").field("plugin", &self.plugin).finish()
    }
}

/// Priority-ordered view over every storage plugin, with account ownership.
pub struct AccountStorageChain {
    stores: CapabilityList,
    /// Account name to index into `stores`.
    owners: Mutex<BTreeMap<String, usize>>,
    events: broadcast::Sender<StorageEvent>,
}

impl AccountStorageChain {
    pub fn new(stores: CapabilityList) -> Self {
        let (events, _) = broadcast::channel(STORAGE_EVENT_CAPACITY);
        Self {
            stores,
            owners: Mutex::new(BTreeMap::new()),
            events,
        }
    }

    /// Receive notifications from every storage plugin.
    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }

    fn plugins(&self) -> impl Iterator<Item = (usize, &PluginRecord, &dyn AccountStorage)> {
        self.stores
            .iter()
            .enumerate()
            .filter_map(|(i, record)| record.account_storage().map(|storage| (i, record, storage)))
    }

    fn storage_at(&self, index: usize) -> Option<(&PluginRecord, &dyn AccountStorage)> {
        let record = self.stores.get(index)?;
        Some((record, record.account_storage()?))
    }

    fn claim(&self, account: &str, index: usize) {
        let mut owners = lock(&self.owners);
        if let Some(existing) = owners.get(account) {
            if *existing != index {
                debug!(account, "account already owned, keeping first owner");
            }
            return;
        }
        if let Some(record) = self.stores.get(index) {
            debug!(account, plugin = %record.name(), "account ownership recorded");
        }
        owners.insert(account.to_string(), index);
    }

    fn owner_index(&self, account: &str) -> Option<usize> {
        if let Some(index) = lock(&self.owners).get(account) {
            return Some(*index);
        }
        let (index, _, _) = self.plugins().find(|(_, _, storage)| storage.owns(account))?;
        self.claim(account, index);
        Some(index)
    }

    /// Hand every plugin the sink and its own notifier.
    pub fn ready(&self, sink: Arc<dyn AccountSink>) {
        for (_, record, storage) in self.plugins() {
            debug!(plugin = %record.name(), "account storage ready");
            storage.ready(
                Arc::clone(&sink),
                StorageNotifier {
                    plugin: record.name().to_string(),
                    sender: self.events.clone(),
                },
            );
        }
    }

    /// Read `key` (or the whole account) from the first plugin that has it.
    pub fn get(&self, sink: &dyn AccountSink, account: &str, key: Option<&str>) -> bool {
        for (_, record, storage) in self.plugins() {
            if storage.get(sink, account, key) {
                debug!(plugin = %record.name(), account, key, "account value served");
                return true;
            }
        }
        debug!(account, key, "account value not found");
        false
    }

    /// Write through the owning plugin, or the first one that accepts.
    pub fn set(&self, account: &str, key: &str, value: &str) -> bool {
        if let Some(index) = self.owner_index(account) {
            let Some((record, storage)) = self.storage_at(index) else {
                return false;
            };
            let stored = storage.set(account, key, value);
            if !stored {
                warn!(plugin = %record.name(), account, key, "owning storage plugin refused write");
            }
            return stored;
        }
        for (index, record, storage) in self.plugins() {
            if storage.set(account, key, value) {
                debug!(plugin = %record.name(), account, key, "storage plugin accepted write");
                self.claim(account, index);
                return true;
            }
        }
        warn!(account, key, "no storage plugin accepted write");
        false
    }

    /// Delete `key`, or the whole account when `None`.
    pub fn delete(&self, account: &str, key: Option<&str>) -> bool {
        let deleted = match self.owner_index(account) {
            Some(index) => self.storage_at(index).is_some_and(|(_, storage)| storage.delete(account, key)),
            None => self.plugins().any(|(_, _, storage)| storage.delete(account, key)),
        };
        if deleted && key.is_none() {
            lock(&self.owners).remove(account);
            info!(account, "account deleted from storage");
        }
        deleted
    }

    /// Ask every plugin to persist. One failure does not stop the others.
    pub fn commit(&self) -> bool {
        let mut all = true;
        for (_, record, storage) in self.plugins() {
            if !storage.commit() {
                warn!(plugin = %record.name(), "account storage commit failed");
                all = false;
            }
        }
        all
    }

    /// Persist one account through its owner, or everything when `None`.
    pub fn commit_one(&self, account: Option<&str>) -> bool {
        let owner = account.and_then(|a| self.owner_index(a));
        match (account, owner) {
            (Some(account), Some(index)) => self.storage_at(index).is_some_and(|(record, storage)| {
                let ok = storage.commit_one(Some(account));
                if !ok {
                    warn!(plugin = %record.name(), account, "account storage commit failed");
                }
                ok
            }),
            _ => {
                let mut all = true;
                for (_, record, storage) in self.plugins() {
                    if !storage.commit_one(account) {
                        warn!(plugin = %record.name(), account, "account storage commit failed");
                        all = false;
                    }
                }
                all
            }
        }
    }

    /// Union of every plugin's accounts, highest-priority claim first.
    pub fn list(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut accounts = Vec::new();
        for (index, record, storage) in self.plugins() {
            for account in storage.list() {
                if seen.insert(account.clone()) {
                    self.claim(&account, index);
                    accounts.push(account);
                } else {
                    debug!(plugin = %record.name(), account = %account, "account shadowed by higher-priority store");
                }
            }
        }
        accounts
    }

    /// Name of the plugin owning `account`, if any.
    pub fn owner(&self, account: &str) -> Option<PluginRecord> {
        let index = self.owner_index(account)?;
        self.stores.get(index).cloned()
    }

    /// Let the first willing plugin store a new account. Returns its name.
    pub fn create(&self, manager: &str, protocol: &str, identifier: &str) -> Option<String> {
        for (index, record, storage) in self.plugins() {
            if let Some(account) = storage.create(manager, protocol, identifier) {
                info!(plugin = %record.name(), account = %account, "account created in storage");
                self.claim(&account, index);
                return Some(account);
            }
        }
        warn!(manager, protocol, identifier, "no storage plugin would create account");
        None
    }

    pub fn identifier(&self, account: &str) -> Option<String> {
        let (_, storage) = self.storage_at(self.owner_index(account)?)?;
        storage.identifier(account)
    }

    pub fn additional_info(&self, account: &str) -> BTreeMap<String, serde_json::Value> {
        self.owner_index(account)
            .and_then(|index| self.storage_at(index))
            .map(|(_, storage)| storage.additional_info(account))
            .unwrap_or_default()
    }

    pub fn restrictions(&self, account: &str) -> AccountRestrictions {
        self.owner_index(account)
            .and_then(|index| self.storage_at(index))
            .map(|(_, storage)| storage.restrictions(account))
            .unwrap_or_default()
    }
}

impl fmt::Debug for AccountStorageChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountStorageChain")
            .field("stores", &self.stores.iter().map(PluginRecord::name).collect::<Vec<_>>())
            .field("owned_accounts", &lock(&self.owners).len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::constants::storage_priority;
    use crate::plugin::Capability;
    use crate::registry::PluginRegistry;
    use crate::test_support::MemoryStorage;
    use crate::test_support::RecordingSink;

    const ACCOUNT: &str = "gabble/jabber/alice";

    fn chain(stores: Vec<MemoryStorage>) -> AccountStorageChain {
        let registry = PluginRegistry::new();
        for store in stores {
            registry.register(Arc::new(store));
        }
        AccountStorageChain::new(registry.for_capability(Capability::AccountStorage))
    }

    #[test]
    fn higher_priority_value_shadows_lower() {
        let chain = chain(vec![
            MemoryStorage::new("defaults", storage_priority::READONLY).with_value(ACCOUNT, "Enabled", "false"),
            MemoryStorage::new("user", storage_priority::NORMAL).with_value(ACCOUNT, "Enabled", "true"),
        ]);
        let sink = RecordingSink::default();
        assert!(chain.get(&sink, ACCOUNT, Some("Enabled")));
        assert_eq!(sink.value(ACCOUNT, "Enabled"), Some("true".to_string()));
    }

    #[test]
    fn unknown_key_is_not_found() {
        let chain = chain(vec![MemoryStorage::new("user", storage_priority::NORMAL)]);
        let sink = RecordingSink::default();
        assert!(!chain.get(&sink, "nobody/none/x", Some("Enabled")));
        assert!(sink.is_empty());
    }

    #[test]
    fn list_is_deduplicated_and_records_owner() {
        let chain = chain(vec![
            MemoryStorage::new("defaults", storage_priority::READONLY)
                .with_value(ACCOUNT, "Enabled", "false")
                .with_value("salut/local_xmpp/bob", "Enabled", "true"),
            MemoryStorage::new("user", storage_priority::NORMAL).with_value(ACCOUNT, "Enabled", "true"),
        ]);
        let mut accounts = chain.list();
        accounts.sort();
        assert_eq!(accounts, vec![ACCOUNT.to_string(), "salut/local_xmpp/bob".to_string()]);
        assert_eq!(chain.owner(ACCOUNT).map(|r| r.name().to_string()), Some("user".to_string()));
        assert_eq!(chain.owner("salut/local_xmpp/bob").map(|r| r.name().to_string()), Some("defaults".to_string()));
    }

    #[test]
    fn write_goes_to_owner_only() {
        let keyfile = MemoryStorage::new("keyfile", storage_priority::DEFAULT).with_value(ACCOUNT, "Nickname", "al");
        let user = MemoryStorage::new("user", storage_priority::NORMAL);
        let (keyfile_view, user_view) = (keyfile.handle(), user.handle());
        let chain = chain(vec![keyfile, user]);

        assert!(chain.set(ACCOUNT, "Nickname", "alice"));
        assert_eq!(keyfile_view.value(ACCOUNT, "Nickname"), Some("alice".to_string()));
        assert_eq!(user_view.value(ACCOUNT, "Nickname"), None);
    }

    #[test]
    fn first_accepting_plugin_claims_new_account() {
        let picky = MemoryStorage::new("picky", storage_priority::KEYRING).accepting("keyring/");
        let fallback = MemoryStorage::new("fallback", storage_priority::DEFAULT);
        let picky_view = picky.handle();
        let chain = chain(vec![picky, fallback]);

        assert!(chain.set("gabble/jabber/carol", "Enabled", "true"));
        assert_eq!(chain.owner("gabble/jabber/carol").map(|r| r.name().to_string()), Some("fallback".to_string()));
        assert!(chain.set("keyring/jabber/dave", "Password", "hunter2"));
        assert_eq!(picky_view.value("keyring/jabber/dave", "Password"), Some("hunter2".to_string()));
    }

    #[test]
    fn commit_failure_does_not_block_others() {
        let broken = MemoryStorage::new("broken", storage_priority::NORMAL).failing_commit();
        let fine = MemoryStorage::new("fine", storage_priority::DEFAULT);
        let fine_commits = fine.commits();
        let (broken_view, fine_view) = (broken.handle(), fine.handle());
        assert!(AccountStorage::set(&broken, ACCOUNT, "Nickname", "a"));
        assert!(AccountStorage::set(&fine, ACCOUNT, "Nickname", "b"));
        assert!(broken_view.is_dirty() && fine_view.is_dirty());

        let chain = chain(vec![broken, fine]);
        assert!(!chain.commit());
        assert_eq!(fine_commits.load(Ordering::SeqCst), 1);
        assert!(!fine_view.is_dirty());
        assert!(broken_view.is_dirty());
    }

    #[test]
    fn create_delete_and_restrictions() {
        let store = MemoryStorage::new("user", storage_priority::NORMAL)
            .with_restrictions(AccountRestrictions::CANNOT_SET_ENABLED | AccountRestrictions::CANNOT_SET_SERVICE);
        let chain = chain(vec![store]);

        let account = chain.create("gabble", "jabber", "erin@example.net").unwrap();
        assert_eq!(chain.identifier(&account), Some(account.clone()));
        let restrictions = chain.restrictions(&account);
        assert!(restrictions.contains(AccountRestrictions::CANNOT_SET_ENABLED));
        assert!(!restrictions.contains(AccountRestrictions::CANNOT_SET_PRESENCE));
        assert_eq!(format!("{restrictions:?}"), r#"{"cannot-set-enabled", "cannot-set-service"}"#);

        assert!(chain.delete(&account, None));
        assert!(chain.owner(&account).is_none());
        assert!(chain.restrictions(&account).is_empty());
    }

    #[tokio::test]
    async fn notifications_reach_subscribers() {
        let store = MemoryStorage::new("user", storage_priority::NORMAL);
        let view = store.handle();
        let chain = chain(vec![store]);
        let mut events = chain.subscribe();
        chain.ready(Arc::new(RecordingSink::default()));

        let notifier = view.notifier().unwrap();
        notifier.toggled(ACCOUNT, false);
        notifier.altered_one(ACCOUNT, "Nickname");

        let first = events.recv().await.unwrap();
        assert_eq!(first.plugin, "user");
        assert_eq!(first.change, StorageChange::Toggled { enabled: false });
        let second = events.recv().await.unwrap();
        assert_eq!(second.change, StorageChange::AlteredOne { key: "Nickname".into() });
    }
}
