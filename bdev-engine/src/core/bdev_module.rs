//! Bdev module registry.
//!
//! A bdev module is the driver-side counterpart of the bdev layer: it
//! creates bdevs, examines newly registered bdevs of other modules (and may
//! claim them), and serializes its configuration. Modules register once at
//! startup; registration order determines examine order.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::core::{Bdev, CoreError};

/// Status of a module operation that may complete asynchronously.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ModuleOpStatus {
    /// The operation completed synchronously.
    Done,
    /// The operation completes later; the module acknowledges it through the
    /// matching `*_done` call.
    Pending,
}

/// The interface every bdev module implements.
pub trait BdevModule: Send + Sync {
    /// Unique module name.
    fn name(&self) -> &str;

    /// Called once at subsystem startup. A `Pending` return must be matched
    /// by a later `ModuleRegistry::module_init_done` call.
    fn module_init(&self) -> ModuleOpStatus {
        ModuleOpStatus::Done
    }

    /// Called once at subsystem teardown.
    fn module_fini(&self) -> ModuleOpStatus {
        ModuleOpStatus::Done
    }

    /// Called before `module_fini` on any module runs, so modules may stop
    /// producing new work first.
    fn fini_start(&self) {}

    /// Size of the per-I/O driver context this module needs.
    fn get_ctx_size(&self) -> usize {
        0
    }

    /// First examine phase: runs synchronously when any bdev is registered,
    /// before the bdev becomes openable. The module may claim the bdev here.
    fn examine_config(&self, _bdev: &Bdev) {}

    /// Second examine phase: may perform I/O on the bdev. A `Pending` return
    /// must be matched by a later `ModuleRegistry::examine_done` call.
    fn examine_disk(&self, _bdev: &Bdev) -> ModuleOpStatus {
        ModuleOpStatus::Done
    }

    /// Emit configuration that reconstitutes this module's bdevs.
    fn config_json(&self) -> Option<serde_json::Value> {
        None
    }
}

/// All registered bdev modules, in registration order.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: RwLock<Vec<Arc<dyn BdevModule>>>,
    init_pending: AtomicU32,
    fini_pending: AtomicU32,
}

static MODULES: Lazy<ModuleRegistry> = Lazy::new(ModuleRegistry::default);

impl ModuleRegistry {
    pub fn get() -> &'static ModuleRegistry {
        &MODULES
    }

    /// Adds a module to the registry. Panics on duplicate names: module
    /// names are compile-time constants and a collision is a programming
    /// error.
    pub fn register(&self, module: Arc<dyn BdevModule>) {
        let mut modules = self.modules.write();
        assert!(
            !modules.iter().any(|m| m.name() == module.name()),
            "bdev module '{}' already registered",
            module.name()
        );
        info!("registered bdev module '{}'", module.name());
        modules.push(module);
    }

    /// Looks a module up by its name.
    pub fn find_by_name(
        &self,
        name: &str,
    ) -> Result<Arc<dyn BdevModule>, CoreError> {
        self.modules
            .read()
            .iter()
            .find(|m| m.name() == name)
            .cloned()
            .ok_or_else(|| CoreError::BdevModuleNotFound {
                name: String::from(name),
            })
    }

    /// Snapshot of the registered modules in registration order.
    pub fn iter(&self) -> Vec<Arc<dyn BdevModule>> {
        self.modules.read().clone()
    }

    /// Runs `module_init` on every module. Returns the number of modules
    /// whose initialization is still pending.
    pub fn init_modules(&self) -> u32 {
        for m in self.iter() {
            if m.module_init() == ModuleOpStatus::Pending {
                self.init_pending.fetch_add(1, Ordering::AcqRel);
            }
        }
        self.init_pending.load(Ordering::Acquire)
    }

    /// Acknowledges a pending `module_init`.
    pub fn module_init_done(&self) {
        self.init_pending.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn init_pending(&self) -> u32 {
        self.init_pending.load(Ordering::Acquire)
    }

    /// Runs `fini_start` followed by `module_fini` on every module, in
    /// reverse registration order.
    pub fn fini_modules(&self) -> u32 {
        let modules = self.iter();
        for m in modules.iter().rev() {
            m.fini_start();
        }
        for m in modules.iter().rev() {
            if m.module_fini() == ModuleOpStatus::Pending {
                self.fini_pending.fetch_add(1, Ordering::AcqRel);
            }
        }
        self.fini_pending.load(Ordering::Acquire)
    }

    /// Acknowledges a pending `module_fini`.
    pub fn module_fini_done(&self) {
        self.fini_pending.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn fini_pending(&self) -> u32 {
        self.fini_pending.load(Ordering::Acquire)
    }

    /// Acknowledges a pending `examine_disk` for the given bdev.
    pub fn examine_done(&self, bdev: &Bdev) {
        bdev.examine_done();
    }

    /// Collects the configuration of every module into one JSON document.
    pub fn config_json(&self) -> serde_json::Value {
        let sections = self
            .iter()
            .iter()
            .filter_map(|m| {
                m.config_json().map(|cfg| (m.name().to_string(), cfg))
            })
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(sections)
    }
}

/// Runs the examine pipeline for a freshly registered bdev: every module's
/// `examine_config` first, then every module's `examine_disk`. The bdev
/// becomes visible to `open` callers once all (possibly asynchronous)
/// examines acknowledged completion.
pub(crate) fn examine_bdev(bdev: &Bdev) {
    let modules = ModuleRegistry::get().iter();

    // Guard examine so the bdev can not become available halfway through.
    bdev.examine_start(1);

    for m in &modules {
        m.examine_config(bdev);
    }

    for m in &modules {
        if m.examine_disk(bdev) == ModuleOpStatus::Pending {
            bdev.examine_start(1);
        }
    }

    // Drop the guard; the bdev goes public when async examines drain too.
    bdev.examine_done();
}
