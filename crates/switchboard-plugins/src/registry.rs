//! Plugin registry for discovering and loading native policy plugins.
//!
//! Scans the configured plugin directory for modules, asks each module's
//! entry point for every object it exposes, and keeps modules and objects
//! resident for the life of the process.
//!
//! ## Lifecycle
//!
//! 1. **Discovery** – candidates are files in the plugin directory whose
//!    name carries the configured prefix and the platform module suffix
//! 2. **Loading** – each candidate is opened once and its entry point is
//!    called with `0, 1, 2, ...` until it returns null
//! 3. **Freezing** – the first request for a capability builds its ordered
//!    view; later registrations are invisible to that view
//!
//! There is no unload path. Modules are held in [`ManuallyDrop`] because
//! closing a shared object that handed out live objects is not safe to
//! reverse.

use std::mem::ManuallyDrop;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::sync::RwLock;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use anyhow::Context;
use libloading::Library;
use libloading::Symbol;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::PluginConfig;
use crate::constants::MAX_OBJECTS_PER_MODULE;
use crate::error::LoadError;
use crate::plugin::Capability;
use crate::plugin::Plugin;
use crate::plugin::PluginEntry;
use crate::plugin::PluginOrigin;
use crate::plugin::PluginRecord;
use crate::util::lock;

/// Ordered plugins implementing one capability, highest priority first.
pub type CapabilityList = Arc<[PluginRecord]>;

/// Summary of one module that loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedModule {
    pub path: PathBuf,
    pub objects: usize,
}

/// Outcome of one directory scan. Failures never abort the scan.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: Vec<LoadedModule>,
    pub skipped: Vec<LoadError>,
}

impl LoadReport {
    pub fn object_count(&self) -> usize {
        self.loaded.iter().map(|m| m.objects).sum()
    }
}

struct ResidentModule {
    path: PathBuf,
    _library: ManuallyDrop<Library>,
}

/// Write-once registry of plugin objects with memoized capability views.
pub struct PluginRegistry {
    plugins: RwLock<Vec<PluginRecord>>,
    modules: Mutex<Vec<ResidentModule>>,
    views: [OnceLock<CapabilityList>; Capability::COUNT],
    next_sequence: AtomicU64,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            plugins: RwLock::new(Vec::new()),
            modules: Mutex::new(Vec::new()),
            views: std::array::from_fn(|_| OnceLock::new()),
            next_sequence: AtomicU64::new(0),
        }
    }

    /// Process-wide registry used by the broker.
    pub fn global() -> &'static PluginRegistry {
        static GLOBAL: OnceLock<PluginRegistry> = OnceLock::new();
        GLOBAL.get_or_init(PluginRegistry::new)
    }

    /// Register an object without going through the directory scan.
    pub fn register(&self, plugin: Arc<dyn Plugin>) -> PluginRecord {
        self.insert(plugin, PluginOrigin::Embedded)
    }

    fn insert(&self, plugin: Arc<dyn Plugin>, origin: PluginOrigin) -> PluginRecord {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let record = PluginRecord::new(plugin, sequence, origin);

        for capability in record.capabilities().iter() {
            if self.views[capability.index()].get().is_some() {
                warn!(
                    plugin = %record.name(),
                    capability = %capability,
                    "plugin registered after capability list was built; it will not be consulted"
                );
            }
        }

        info!(
            plugin = %record.name(),
            priority = record.priority(),
            capabilities = ?record.capabilities(),
            origin = ?record.origin(),
            "plugin registered"
        );

        self.plugins.write().unwrap_or_else(std::sync::PoisonError::into_inner).push(record.clone());
        record
    }

    /// Load plugins from the directory named by `config`, if any.
    pub fn load(&self, config: &PluginConfig) -> LoadReport {
        match config.plugin_dir.as_deref() {
            Some(dir) => self.load_dir(dir, config),
            None => {
                debug!("no plugin directory configured");
                LoadReport::default()
            }
        }
    }

    /// Read a broker config file, apply environment overrides and load.
    pub fn load_configured(&self, config_path: &Path) -> anyhow::Result<LoadReport> {
        let config = PluginConfig::load(config_path)
            .with_context(|| format!("failed to load plugin config from {}", config_path.display()))?
            .with_env_overrides();
        Ok(self.load(&config))
    }

    /// Scan `dir` (non-recursively) and load every candidate module.
    ///
    /// Modules that fail to open, lack the entry point, or expose nothing
    /// are logged and skipped rather than causing a fatal error.
    pub fn load_dir(&self, dir: &Path, config: &PluginConfig) -> LoadReport {
        let mut report = LoadReport::default();

        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(source) => {
                warn!(dir = %dir.display(), error = %source, "cannot read plugin directory");
                report.skipped.push(LoadError::Directory {
                    path: dir.to_path_buf(),
                    source,
                });
                return report;
            }
        };

        let mut candidates: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| !t.is_dir()).unwrap_or(false))
            .filter(|entry| entry.file_name().to_str().is_some_and(|name| config.is_candidate(name)))
            .map(|entry| entry.path())
            .collect();
        candidates.sort();

        if candidates.is_empty() {
            debug!(dir = %dir.display(), "no plugin modules found");
            return report;
        }

        info!(dir = %dir.display(), candidate_count = candidates.len(), "found plugin modules");

        for path in candidates {
            if self.is_resident(&path) {
                debug!(path = %path.display(), "plugin module already loaded, skipping");
                continue;
            }
            match open_module(&path, &config.entry_symbol) {
                Ok((library, entry)) => self.admit_module(path, library, entry, &mut report),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to load plugin module, skipping");
                    report.skipped.push(e);
                }
            }
        }

        report
    }

    /// Keep `library` resident and register every object `entry` hands out.
    ///
    /// The module stays mapped even when it exposes nothing, since its
    /// initializers have already run.
    fn admit_module(&self, path: PathBuf, library: Library, entry: PluginEntry, report: &mut LoadReport) {
        lock(&self.modules).push(ResidentModule {
            path: path.clone(),
            _library: ManuallyDrop::new(library),
        });

        let objects = collect_objects(&path, entry);
        if objects.is_empty() {
            let e = LoadError::Empty { path };
            warn!(path = %e.path().display(), error = %e, "plugin module exposes nothing, keeping it resident");
            report.skipped.push(e);
            return;
        }

        let count = objects.len();
        for object in objects {
            self.insert(Arc::from(object), PluginOrigin::Module(path.clone()));
        }
        info!(path = %path.display(), objects = count, "plugin module loaded");
        report.loaded.push(LoadedModule { path, objects: count });
    }

    fn is_resident(&self, path: &Path) -> bool {
        lock(&self.modules).iter().any(|m| m.path == path)
    }

    /// Every registered object, in discovery order.
    pub fn list(&self) -> Vec<PluginRecord> {
        self.plugins.read().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }

    /// Ordered view of the plugins implementing `capability`.
    ///
    /// Built on first use and frozen for the life of the registry. Sorted by
    /// descending priority; equal priorities put later-discovered plugins
    /// first.
    pub fn for_capability(&self, capability: Capability) -> CapabilityList {
        let view = self.views[capability.index()].get_or_init(|| {
            let mut matching: Vec<PluginRecord> =
                self.list().into_iter().filter(|r| r.capabilities().contains(capability)).collect();
            matching.sort_by(|a, b| b.priority().cmp(&a.priority()).then(b.sequence().cmp(&a.sequence())));
            debug!(
                capability = %capability,
                plugins = ?matching.iter().map(PluginRecord::name).collect::<Vec<_>>(),
                "capability list built"
            );
            matching.into()
        });
        Arc::clone(view)
    }

    /// Number of registered objects.
    pub fn len(&self) -> usize {
        self.plugins.read().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }

    /// Whether nothing has been registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Modules kept resident by this registry.
    pub fn module_paths(&self) -> Vec<PathBuf> {
        lock(&self.modules).iter().map(|m| m.path.clone()).collect()
    }
}

/// Open one candidate module and resolve its entry point.
fn open_module(path: &Path, symbol: &str) -> Result<(Library, PluginEntry), LoadError> {
    // SAFETY: Loading a plugin runs its initializers; plugin directories are
    // trusted configuration.
    let library = unsafe { Library::new(path) }.map_err(|source| LoadError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    // SAFETY: Symbol type matches the documented plugin ABI. The copied
    // function pointer stays valid because the library is never unloaded
    // once the entry point resolves.
    let entry: PluginEntry = {
        let resolved: Symbol<PluginEntry> =
            unsafe { library.get(symbol.as_bytes()) }.map_err(|source| LoadError::MissingEntryPoint {
                path: path.to_path_buf(),
                symbol: symbol.to_string(),
                source,
            })?;
        *resolved
    };

    Ok((library, entry))
}

/// Call `entry` with `0, 1, 2, ...` until it returns null.
fn collect_objects(path: &Path, entry: PluginEntry) -> Vec<Box<dyn Plugin>> {
    let mut objects = Vec::new();
    for index in 0..MAX_OBJECTS_PER_MODULE {
        // SAFETY: Entry point is trusted by ABI contract; null checked below.
        let raw = unsafe { entry(index) };
        if raw.is_null() {
            break;
        }
        // SAFETY: Non-null returns are `Box::into_raw` of a boxed object.
        let object = unsafe { Box::from_raw(raw) };
        objects.push(*object);
    }
    if objects.len() as u32 == MAX_OBJECTS_PER_MODULE {
        warn!(path = %path.display(), limit = MAX_OBJECTS_PER_MODULE, "plugin module object limit reached");
    }
    objects
}
