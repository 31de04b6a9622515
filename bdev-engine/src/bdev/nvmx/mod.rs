use std::{collections::HashMap, fmt::Display, sync::Arc};

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub use channel::NvmeIoChannelInner;
pub use controller::{
    connect_controller,
    destroy_device,
    options,
    NvmeController,
    TridEntry,
};
pub use controller_state::{
    ControllerFailureReason,
    ControllerFlag,
    NvmeControllerState,
};
pub use device::{
    attach_controller,
    detach_controller,
    group_controllers,
    nvme_admin_custom,
    register_module,
    NvmeBdev,
    NVME_MODULE_NAME,
};
pub use namespace::NvmeNamespace;
pub use qpair::{QPair, QPairState};

use crate::core::CoreError;
use crate::subsys::{Config, NvmeBdevOpts};

mod channel;
mod controller;
mod controller_state;
mod device;
pub mod emu;
mod handle;
mod namespace;
mod qpair;
pub mod transport;
pub mod utils;

#[derive(Debug)]
#[allow(clippy::upper_case_acronyms)]
pub struct NVMeCtlrList {
    entries: RwLock<HashMap<String, Arc<Mutex<NvmeController>>>>,
}

impl NVMeCtlrList {
    fn write_lock(
        &self,
    ) -> RwLockWriteGuard<HashMap<String, Arc<Mutex<NvmeController>>>> {
        self.entries.write()
    }

    fn read_lock(
        &self,
    ) -> RwLockReadGuard<HashMap<String, Arc<Mutex<NvmeController>>>> {
        self.entries.read()
    }

    /// lookup a NVMe controller
    pub fn lookup_by_name<T: Into<String>>(
        &self,
        name: T,
    ) -> Option<Arc<Mutex<NvmeController>>> {
        let entries = self.read_lock();
        entries.get(&name.into()).cloned()
    }

    /// remove a NVMe controller from the list; when the last reference to
    /// the controller is dropped, the controller is freed.
    pub fn remove_by_name<T: Into<String> + Display>(
        &self,
        name: T,
    ) -> Result<String, CoreError> {
        let mut entries = self.write_lock();

        if !entries.contains_key(&name.to_string()) {
            return Err(CoreError::BdevNotFound {
                name: name.into(),
            });
        }

        entries.remove(&name.to_string());
        debug!("{}: NVMe controller has been removed from the list", name);
        Ok(name.into())
    }

    /// insert a controller into the list using the key
    pub fn insert_controller(
        &self,
        name: String,
        ctl: Arc<Mutex<NvmeController>>,
    ) {
        let mut entries = self.write_lock();
        entries.insert(name, ctl);
    }

    /// Get the names of all available NVMe controllers.
    pub fn controllers(&self) -> Vec<String> {
        let entries = self.read_lock();
        entries.keys().map(|k| k.to_string()).collect::<Vec<_>>()
    }
}

impl Default for NVMeCtlrList {
    fn default() -> Self {
        Self {
            entries: RwLock::new(
                HashMap::<String, Arc<Mutex<NvmeController>>>::new(),
            ),
        }
    }
}

pub static NVME_CONTROLLERS: Lazy<NVMeCtlrList> =
    Lazy::new(NVMeCtlrList::default);

/// The running NVMe bdev driver options.
pub fn nvme_bdev_running_config() -> NvmeBdevOpts {
    Config::get().nvme_bdev_opts
}
