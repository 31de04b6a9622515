//! Bdev backends: the in-memory malloc disk, the partition library and the
//! NVMe driver.

use std::sync::Once;

pub use device::{device_lookup, device_open, BdevBlockDevice};
pub use nvmx::NvmeController;

pub mod device;
pub mod malloc;
pub mod nvmx;
pub mod part;

static MODULES_REGISTERED: Once = Once::new();

/// Registers the built-in bdev modules; idempotent.
pub fn register_modules() {
    MODULES_REGISTERED.call_once(|| {
        malloc::register_module();
        part::register_module();
        nvmx::register_module();
    });
}
