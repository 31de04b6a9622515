//! The partition library: virtual bdevs carved out of a base bdev at a
//! fixed block offset. All partitions of one base share a `PartBase` that
//! owns the open descriptor and the module claim on the base; the base is
//! released when the last partition is destructed. A hot-removed base fans
//! out and unregisters every partition built on it.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};

use crate::{
    constants::PART_DRIVER,
    core::{
        Bdev,
        BdevChannel,
        BdevIo,
        BdevModule,
        BdevOps,
        CoreError,
        DescriptorGuard,
        DeviceEventType,
        IoChannel,
        IoStatus,
        IoType,
        ModuleRegistry,
        Reactors,
    },
};

struct PartBdevModule;

impl BdevModule for PartBdevModule {
    fn name(&self) -> &str {
        PART_DRIVER
    }
}

pub fn register_module() {
    ModuleRegistry::get().register(Arc::new(PartBdevModule));
}

struct PartEntry {
    part_name: String,
    base_name: String,
}

/// All constructed partitions, used for base hot-remove fan-out.
static PARTS: Lazy<RwLock<Vec<PartEntry>>> = Lazy::new(|| RwLock::new(Vec::new()));

/// Shared state of all partitions over one base bdev. Owns the descriptor
/// and, once a partition claimed it, the module claim on the base.
pub struct PartBase {
    bdev: Bdev,
    desc: Mutex<Option<DescriptorGuard>>,
    claimed: AtomicBool,
}

impl PartBase {
    /// Opens the named base bdev for partitioning.
    pub fn construct(bdev_name: &str) -> Result<Arc<PartBase>, CoreError> {
        let name = bdev_name.to_string();
        let desc = Bdev::open_by_name(
            bdev_name,
            true,
            move |event, _| {
                if event == DeviceEventType::DeviceRemoved {
                    base_hotremove(&name);
                }
            },
        )?;

        Ok(Arc::new(PartBase {
            bdev: desc.bdev(),
            desc: Mutex::new(Some(desc)),
            claimed: AtomicBool::new(false),
        }))
    }

    pub fn bdev(&self) -> &Bdev {
        &self.bdev
    }

    fn claim_once(&self) -> Result<(), CoreError> {
        if self.bdev.is_claimed() {
            if self.claimed.load(Ordering::Acquire) {
                // Claimed by this base already.
                return Ok(());
            }
            return Err(CoreError::BdevAlreadyClaimed {
                name: self.bdev.name().to_string(),
                claimant: self.bdev.claimed_by().unwrap_or_default(),
            });
        }

        self.bdev.claim(PART_DRIVER)?;
        self.claimed.store(true, Ordering::Release);
        Ok(())
    }
}

impl Drop for PartBase {
    fn drop(&mut self) {
        debug!("{}: releasing partition base", self.bdev.name());
        if self.claimed.swap(false, Ordering::AcqRel) {
            self.bdev.release_claim();
        }
        // Dropping the descriptor closes it.
        self.desc.lock().take();
    }
}

/// Unregisters every partition built on the given base. The base itself is
/// freed when the last partition destructs.
fn base_hotremove(base_name: &str) {
    let victims = PARTS
        .read()
        .iter()
        .filter(|e| e.base_name == base_name)
        .map(|e| e.part_name.clone())
        .collect::<Vec<_>>();

    info!(
        "{}: base removed, unregistering {} partition(s)",
        base_name,
        victims.len()
    );

    for name in victims {
        if let Some(part) = Bdev::lookup_unchecked(&name) {
            Reactors::primary().send_msg(move || {
                part.unregister(|_| {});
            });
        }
    }
}

/// Per-thread channel of a partition: a reference to the base's channel on
/// the same core.
struct PartChannel {
    base_channel: IoChannel<BdevChannel>,
}

/// A partition bdev over a base, at a fixed block offset.
pub struct Part {
    name: String,
    base: Arc<PartBase>,
    offset_blocks: u64,
}

impl Part {
    /// Builds and registers a partition bdev of `num_blocks` blocks placed
    /// `offset_blocks` into the base. Geometry is inherited from the base.
    pub fn construct(
        base: Arc<PartBase>,
        name: &str,
        offset_blocks: u64,
        num_blocks: u64,
        product_name: &str,
    ) -> Result<Bdev, CoreError> {
        let base_bdev = base.bdev().clone();

        if offset_blocks + num_blocks > base_bdev.num_blocks() {
            return Err(CoreError::InvalidOffset {
                offset: offset_blocks + num_blocks,
            });
        }

        base.claim_once()?;

        let ops = Arc::new(Part {
            name: String::from(name),
            base: base.clone(),
            offset_blocks,
        });

        let bdev = Bdev::builder()
            .with_name(name)
            .with_product_name(product_name)
            .with_module(PART_DRIVER)
            .with_block_length(base_bdev.block_len())
            .with_num_blocks(num_blocks)
            .with_required_alignment(base_bdev.alignment())
            .with_ops(ops)
            .build();

        PARTS.write().push(PartEntry {
            part_name: String::from(name),
            base_name: base_bdev.name().to_string(),
        });

        if let Err(e) = bdev.register() {
            // Rewind the partial construct.
            PARTS.write().retain(|p| p.part_name != name);
            return Err(e);
        }

        info!(
            "{}: partition of '{}' at offset {} ({} blocks) created",
            name,
            base_bdev.name(),
            offset_blocks,
            num_blocks
        );

        Ok(bdev)
    }

    /// Offset of this partition on its base, in blocks.
    pub fn offset_blocks(&self) -> u64 {
        self.offset_blocks
    }
}

impl BdevOps for Part {
    fn destruct(&self) -> crate::core::DestructStatus {
        PARTS.write().retain(|p| p.part_name != self.name);
        crate::core::DestructStatus::Complete
    }

    fn submit_request(&self, io: BdevIo) {
        let base_channel = io.channel().with(|c| {
            c.module_channel_any()
                .downcast_ref::<PartChannel>()
                .expect("partition channel context")
                .base_channel
                .clone()
        });

        // Reset flows to the base unchanged; block ops are translated.
        let offset = match io.io_type() {
            IoType::Reset | IoType::Flush => io.offset_blocks(),
            _ => io.offset_blocks() + self.offset_blocks,
        };

        let parent = io.clone();
        let base_io = BdevIo::alloc(
            base_channel,
            self.base.bdev().clone(),
            io.io_type(),
            offset,
            io.num_blocks(),
            io.iovs(),
            Box::new(move |bio: &BdevIo, success: bool| {
                if success {
                    parent.complete(IoStatus::Success);
                } else {
                    match bio.nvme_status() {
                        Some(s) => parent.fail_nvme(s),
                        None => parent.complete(bio.status()),
                    }
                }
            }),
        );

        base_io.submit();
    }

    fn io_type_supported(&self, io_type: IoType) -> bool {
        match io_type {
            IoType::Abort | IoType::NvmeAdmin | IoType::NvmeIo => false,
            t => self.base.bdev().io_type_supported(t),
        }
    }

    fn open_channel(&self) -> Result<Box<dyn std::any::Any>, CoreError> {
        Ok(Box::new(PartChannel {
            base_channel: self.base.bdev().get_io_channel()?,
        }))
    }

    fn dump_info_json(&self) -> serde_json::Value {
        serde_json::json!({
            "base_bdev": self.base.bdev().name(),
            "offset_blocks": self.offset_blocks,
        })
    }
}
