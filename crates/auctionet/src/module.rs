// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Allocation module contract and the refcounted module loader.
//!
//! A module is a named strategy. On the server it turns the bids of an
//! auction into allocations; on the agent it turns offered auctions into
//! bids. The loader keeps at most one instance per module name, created and
//! initialized on first acquire and destroyed when the last holder releases
//! it.

use crate::error::ModuleError;
use crate::object::{Auction, BiddingObject, ObjectKey};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// String key/value configuration handed to a module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleConfig(BTreeMap<String, String>);

impl ModuleConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Parse `key`, falling back to `default` when absent.
    pub fn parse_or<T: FromStr>(&self, module: &str, key: &str, default: T) -> Result<T, ModuleError> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|_| ModuleError::InvalidConfig {
                module: module.to_string(),
                reason: format!("{} = {:?} is not valid", key, raw),
            }),
        }
    }

    /// A copy of this configuration with `overlay` entries taking precedence.
    pub fn merged(&self, overlay: &BTreeMap<String, String>) -> Self {
        let mut out = self.clone();
        out.0.extend(overlay.iter().map(|(k, v)| (k.clone(), v.clone())));
        out
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<BTreeMap<String, String>> for ModuleConfig {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

/// Which side of an auction a module serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleRole {
    /// Server side only: implements [`AllocationModule::execute`].
    Allocator,
    /// Agent side only: implements [`AllocationModule::execute_for_agent`].
    Bidder,
    Both,
}

impl ModuleRole {
    pub fn allocates(self) -> bool {
        matches!(self, Self::Allocator | Self::Both)
    }

    pub fn bids(self) -> bool {
        matches!(self, Self::Bidder | Self::Both)
    }
}

/// Plugin contract for allocation and bidding strategies.
///
/// Calls may come from several blocking-pool threads at once, but never two
/// concurrently for the same auction. Implementations keep any mutable state
/// behind their own synchronization.
pub trait AllocationModule: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn role(&self) -> ModuleRole {
        ModuleRole::Both
    }

    /// Validate and apply the module's configuration group.
    fn init(&self, _config: &ModuleConfig) -> Result<(), ModuleError> {
        Ok(())
    }

    /// Server role: allocate over `[start, stop)` from the current bids.
    ///
    /// # Arguments
    /// * `config` - module group merged with the auction's parameters
    /// * `auction` - key of the auction being executed
    /// * `bids` - every live bid of the auction
    fn execute(
        &self,
        _config: &ModuleConfig,
        _auction: &ObjectKey,
        _start: u64,
        _stop: u64,
        _bids: &[BiddingObject],
    ) -> Result<Vec<BiddingObject>, ModuleError> {
        Err(ModuleError::Failed {
            module: self.name().to_string(),
            reason: "module does not allocate".into(),
        })
    }

    /// Agent role: produce bids for the offered auctions over `[start, stop)`.
    fn execute_for_agent(
        &self,
        _config: &ModuleConfig,
        _params: &BTreeMap<String, String>,
        _auctions: &[Auction],
        _start: u64,
        _stop: u64,
    ) -> Result<Vec<BiddingObject>, ModuleError> {
        Err(ModuleError::Failed {
            module: self.name().to_string(),
            reason: "module does not bid".into(),
        })
    }

    /// Drop per-execution state.
    fn reset(&self) {}

    /// Called once when the last holder releases the module.
    fn destroy(&self) {}
}

/// Creates a fresh module instance.
pub type ModuleFactory = Arc<dyn Fn() -> Box<dyn AllocationModule> + Send + Sync>;

/// A counted reference to a loaded module.
///
/// Not `Clone`: each handle accounts for exactly one reference and is given
/// back through [`ModuleLoader::release`]. Share the instance itself through
/// [`ModuleHandle::module`].
pub struct ModuleHandle {
    name: Arc<str>,
    module: Arc<dyn AllocationModule>,
    config: Arc<ModuleConfig>,
}

impl ModuleHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module(&self) -> &Arc<dyn AllocationModule> {
        &self.module
    }

    /// Configuration the module was initialized with.
    pub fn config(&self) -> &ModuleConfig {
        &self.config
    }
}

impl fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleHandle").field("name", &self.name).finish()
    }
}

struct Loaded {
    module: Arc<dyn AllocationModule>,
    config: Arc<ModuleConfig>,
    refs: u32,
}

/// Name-to-factory map plus the refcounted instance cache.
#[derive(Default)]
pub struct ModuleLoader {
    factories: RwLock<HashMap<String, ModuleFactory>>,
    configs: RwLock<HashMap<String, ModuleConfig>>,
    loaded: Mutex<HashMap<String, Loaded>>,
}

impl ModuleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// A loader populated with the built-in strategies.
    pub fn with_builtin() -> Self {
        let loader = Self::new();
        crate::modules::register_builtin(&loader);
        loader
    }

    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn AllocationModule> + Send + Sync + 'static,
    {
        self.factories.write().insert(name.into(), Arc::new(factory));
    }

    /// Configuration group used when `name` is next initialized.
    pub fn set_config(&self, name: impl Into<String>, config: ModuleConfig) {
        self.configs.write().insert(name.into(), config);
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.factories.read().contains_key(name)
    }

    /// Role of module `name`, asked of the loaded instance or of a fresh,
    /// uninitialized one.
    pub fn role(&self, name: &str) -> Result<ModuleRole, ModuleError> {
        if let Some(entry) = self.loaded.lock().get(name) {
            return Ok(entry.module.role());
        }
        let factory = self
            .factories
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ModuleError::UnknownModule(name.to_string()))?;
        Ok(factory().role())
    }

    /// Fail unless module `name` is registered and allocates.
    pub fn require_allocator(&self, name: &str) -> Result<(), ModuleError> {
        if self.role(name)?.allocates() {
            Ok(())
        } else {
            Err(ModuleError::WrongRole {
                module: name.to_string(),
                required: "an allocation",
            })
        }
    }

    /// Fail unless module `name` is registered and bids.
    pub fn require_bidder(&self, name: &str) -> Result<(), ModuleError> {
        if self.role(name)?.bids() {
            Ok(())
        } else {
            Err(ModuleError::WrongRole {
                module: name.to_string(),
                required: "a bidding",
            })
        }
    }

    /// Obtain a handle, loading and initializing the module on first use.
    pub fn acquire(&self, name: &str) -> Result<ModuleHandle, ModuleError> {
        let mut loaded = self.loaded.lock();
        if let Some(entry) = loaded.get_mut(name) {
            entry.refs += 1;
            return Ok(ModuleHandle {
                name: Arc::from(name),
                module: Arc::clone(&entry.module),
                config: Arc::clone(&entry.config),
            });
        }

        let factory = self
            .factories
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ModuleError::UnknownModule(name.to_string()))?;
        let config = Arc::new(self.configs.read().get(name).cloned().unwrap_or_default());
        let module: Arc<dyn AllocationModule> = Arc::from(factory());
        module.init(&config)?;
        tracing::debug!("Module '{}' loaded", name);

        loaded.insert(
            name.to_string(),
            Loaded {
                module: Arc::clone(&module),
                config: Arc::clone(&config),
                refs: 1,
            },
        );
        Ok(ModuleHandle {
            name: Arc::from(name),
            module,
            config,
        })
    }

    /// Release a handle. Returns the remaining count; at zero the module is
    /// destroyed and dropped from the cache.
    pub fn release(&self, handle: ModuleHandle) -> Result<u32, ModuleError> {
        let mut loaded = self.loaded.lock();
        let entry = loaded
            .get_mut(handle.name())
            .ok_or_else(|| ModuleError::NotLoaded(handle.name().to_string()))?;
        entry.refs -= 1;
        let remaining = entry.refs;
        if remaining == 0 {
            if let Some(entry) = loaded.remove(handle.name()) {
                entry.module.destroy();
                tracing::debug!("Module '{}' unloaded", handle.name());
            }
        }
        Ok(remaining)
    }

    pub fn refcount(&self, name: &str) -> u32 {
        self.loaded.lock().get(name).map(|e| e.refs).unwrap_or(0)
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.loaded.lock().contains_key(name)
    }
}

impl fmt::Debug for ModuleLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<String> = self.factories.read().keys().cloned().collect();
        names.sort();
        f.debug_struct("ModuleLoader")
            .field("registered", &names)
            .field("loaded", &self.loaded.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        inits: Arc<AtomicUsize>,
        destroys: Arc<AtomicUsize>,
    }

    impl AllocationModule for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn init(&self, config: &ModuleConfig) -> Result<(), ModuleError> {
            config.parse_or::<u32>(self.name(), "limit", 1)?;
            self.inits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn destroy(&self) {
            self.destroys.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn loader_with_counters() -> (ModuleLoader, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let inits = Arc::new(AtomicUsize::new(0));
        let destroys = Arc::new(AtomicUsize::new(0));
        let loader = ModuleLoader::new();
        let (i, d) = (Arc::clone(&inits), Arc::clone(&destroys));
        loader.register("counting", move || {
            Box::new(Counting {
                inits: Arc::clone(&i),
                destroys: Arc::clone(&d),
            })
        });
        (loader, inits, destroys)
    }

    #[test]
    fn one_instance_per_name_destroyed_at_zero() {
        let (loader, inits, destroys) = loader_with_counters();

        let h1 = loader.acquire("counting").unwrap();
        let h2 = loader.acquire("counting").unwrap();
        assert!(Arc::ptr_eq(h1.module(), h2.module()));
        assert_eq!(inits.load(Ordering::SeqCst), 1);
        assert_eq!(loader.refcount("counting"), 2);

        assert_eq!(loader.release(h1).unwrap(), 1);
        assert_eq!(destroys.load(Ordering::SeqCst), 0);
        assert!(loader.is_loaded("counting"));

        assert_eq!(loader.release(h2).unwrap(), 0);
        assert_eq!(destroys.load(Ordering::SeqCst), 1);
        assert!(!loader.is_loaded("counting"));

        // A handle from another loader does not count here.
        let (other, _, _) = loader_with_counters();
        let stray = other.acquire("counting").unwrap();
        assert_eq!(
            loader.release(stray).unwrap_err(),
            ModuleError::NotLoaded("counting".into())
        );

        let _h3 = loader.acquire("counting").unwrap();
        assert_eq!(inits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn roles_are_known_without_loading() {
        let loader = ModuleLoader::with_builtin();
        assert_eq!(loader.role("first_price").unwrap(), ModuleRole::Allocator);
        assert_eq!(loader.role("fixed_bidder").unwrap(), ModuleRole::Bidder);
        assert!(!loader.is_loaded("first_price"));

        assert!(loader.require_allocator("first_price").is_ok());
        assert!(matches!(
            loader.require_allocator("fixed_bidder").unwrap_err(),
            ModuleError::WrongRole { .. }
        ));
        assert!(matches!(
            loader.require_bidder("first_price").unwrap_err(),
            ModuleError::WrongRole { .. }
        ));
        assert_eq!(
            loader.require_bidder("vickrey").unwrap_err(),
            ModuleError::UnknownModule("vickrey".into())
        );

        let (counting, _, _) = loader_with_counters();
        assert_eq!(counting.role("counting").unwrap(), ModuleRole::Both);
    }

    #[test]
    fn unknown_module_and_bad_config() {
        let (loader, inits, _) = loader_with_counters();
        assert_eq!(
            loader.acquire("vickrey").unwrap_err(),
            ModuleError::UnknownModule("vickrey".into())
        );

        loader.set_config("counting", ModuleConfig::new().with("limit", "many"));
        assert!(matches!(
            loader.acquire("counting").unwrap_err(),
            ModuleError::InvalidConfig { .. }
        ));
        assert_eq!(inits.load(Ordering::SeqCst), 0);
        assert!(!loader.is_loaded("counting"));
    }

    #[test]
    fn config_overlay() {
        let mut overlay = BTreeMap::new();
        overlay.insert("capacity".to_string(), "4".to_string());
        let cfg = ModuleConfig::new()
            .with("capacity", "1")
            .with("reserve_price", "0.5")
            .merged(&overlay);
        assert_eq!(cfg.parse_or("m", "capacity", 0.0).unwrap(), 4.0);
        assert_eq!(cfg.parse_or("m", "reserve_price", 0.0).unwrap(), 0.5);
        assert_eq!(cfg.parse_or("m", "absent", 7u32).unwrap(), 7);
    }
}
