//! The malloc bdev: a disk backed by process memory. Used as a base for
//! layered bdevs in tests and as the simplest complete backend.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::core::{
    Bdev,
    BdevIo,
    BdevModule,
    BdevOps,
    CoreError,
    IoStatus,
    IoType,
    MediaErrorStatusCode,
    ModuleRegistry,
    NvmeCommandStatus,
    NvmeStatus,
};

/// Name under which the module registers itself.
pub const MALLOC_MODULE_NAME: &str = "malloc";

struct MallocBdevModule;

impl BdevModule for MallocBdevModule {
    fn name(&self) -> &str {
        MALLOC_MODULE_NAME
    }
}

pub fn register_module() {
    ModuleRegistry::get().register(Arc::new(MallocBdevModule));
}

/// Per-thread channel context; the disk itself is shared.
struct MallocChannel;

/// The memory backed disk.
pub struct Malloc {
    name: String,
    data: RwLock<Vec<u8>>,
    block_len: u32,
}

impl Malloc {
    /// Creates and registers a malloc bdev. `alignment` is log2 of the
    /// payload alignment the disk pretends to require; a non-zero
    /// `optimal_io_boundary` makes the generic layer split on it.
    pub fn create(
        name: &str,
        num_blocks: u64,
        block_len: u32,
        alignment: u8,
        optimal_io_boundary: u64,
    ) -> Result<Bdev, CoreError> {
        let size = (num_blocks * block_len as u64) as usize;

        let ops = Arc::new(Malloc {
            name: String::from(name),
            data: RwLock::new(vec![0; size]),
            block_len,
        });

        let bdev = Bdev::builder()
            .with_name(name)
            .with_product_name("Malloc disk")
            .with_module(MALLOC_MODULE_NAME)
            .with_block_length(block_len)
            .with_num_blocks(num_blocks)
            .with_required_alignment(alignment)
            .with_optimal_io_boundary(optimal_io_boundary)
            .with_split_on_optimal_io_boundary(optimal_io_boundary > 0)
            .with_ops(ops)
            .build();

        bdev.register()?;
        Ok(bdev)
    }

    fn byte_range(&self, io: &BdevIo) -> (usize, usize) {
        let start = (io.offset_blocks() * self.block_len as u64) as usize;
        let len = (io.num_blocks() * self.block_len as u64) as usize;
        (start, start + len)
    }
}

impl BdevOps for Malloc {
    fn submit_request(&self, io: BdevIo) {
        let (start, end) = self.byte_range(&io);

        match io.io_type() {
            IoType::Read => {
                let data = self.data.read();
                if end > data.len() {
                    io.complete(IoStatus::Failed);
                    return;
                }
                let mut at = start;
                for iov in io.iovs() {
                    let dst = unsafe { iov.as_mut_slice() };
                    dst.copy_from_slice(&data[at .. at + dst.len()]);
                    at += dst.len();
                }
                io.complete(IoStatus::Success);
            }
            IoType::Write => {
                let mut data = self.data.write();
                if end > data.len() {
                    io.complete(IoStatus::Failed);
                    return;
                }
                let mut at = start;
                for iov in io.iovs() {
                    let src = unsafe { iov.as_slice() };
                    data[at .. at + src.len()].copy_from_slice(src);
                    at += src.len();
                }
                io.complete(IoStatus::Success);
            }
            IoType::Compare => {
                let data = self.data.read();
                if end > data.len() {
                    io.complete(IoStatus::Failed);
                    return;
                }
                let mut at = start;
                let mut equal = true;
                for iov in io.iovs() {
                    let src = unsafe { iov.as_slice() };
                    if data[at .. at + src.len()] != *src {
                        equal = false;
                        break;
                    }
                    at += src.len();
                }
                if equal {
                    io.complete(IoStatus::Success);
                } else {
                    io.fail_nvme(NvmeCommandStatus::error(
                        NvmeStatus::MediaError(
                            MediaErrorStatusCode::CompareFailure,
                        ),
                    ));
                }
            }
            IoType::WriteZeros | IoType::Unmap => {
                let mut data = self.data.write();
                if end > data.len() {
                    io.complete(IoStatus::Failed);
                    return;
                }
                data[start .. end].fill(0);
                io.complete(IoStatus::Success);
            }
            IoType::Flush | IoType::Reset => {
                io.complete(IoStatus::Success);
            }
            _ => {
                io.complete(IoStatus::Failed);
            }
        }
    }

    fn io_type_supported(&self, io_type: IoType) -> bool {
        matches!(
            io_type,
            IoType::Read
                | IoType::Write
                | IoType::Compare
                | IoType::CompareAndWrite
                | IoType::WriteZeros
                | IoType::Unmap
                | IoType::Flush
                | IoType::Reset
        )
    }

    fn open_channel(&self) -> Result<Box<dyn std::any::Any>, CoreError> {
        Ok(Box::new(MallocChannel))
    }

    fn dump_info_json(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "size": self.data.read().len(),
        })
    }
}
