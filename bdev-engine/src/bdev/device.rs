//! Bridging of registered bdevs into the `BlockDevice` trait surface, so
//! layered consumers can operate on any bdev through one device interface.

use std::{convert::TryFrom, sync::Arc};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::core::{
    Bdev,
    BdevHandle,
    BdevIo,
    BlockDevice,
    BlockDeviceDescriptor,
    BlockDeviceHandle,
    BlockDeviceIoStats,
    CoreError,
    DescriptorGuard,
    DeviceEventDispatcher,
    DeviceEventSink,
    DeviceIoController,
    DmaBuf,
    DmaError,
    IoCompletionCallback,
    IoCompletionStatus,
    IoType,
    IoVec,
    OpCompletionCallback,
    ReadOptions,
};

/// Listeners for bdev-backed devices, keyed by bdev name.
static BDEV_LISTENERS: Lazy<Mutex<std::collections::HashMap<String, Arc<DeviceEventDispatcher>>>> =
    Lazy::new(|| Mutex::new(std::collections::HashMap::new()));

/// Dispatches an event to the listeners of the named device.
pub(crate) fn dispatch_bdev_event(
    evt: crate::core::DeviceEventType,
    name: &str,
) {
    let dispatcher = BDEV_LISTENERS.lock().get(name).cloned();
    if let Some(d) = dispatcher {
        d.dispatch_event(evt, name);
    }
}

/// Looks up a block device by bdev name or alias.
pub fn device_lookup(name: &str) -> Option<Box<dyn BlockDevice>> {
    Bdev::lookup_by_name(name)
        .map(|b| Box::new(BdevBlockDevice::new(b)) as Box<dyn BlockDevice>)
}

/// Opens a block device by bdev name.
pub fn device_open(
    name: &str,
    read_write: bool,
) -> Result<Box<dyn BlockDeviceDescriptor>, CoreError> {
    device_lookup(name)
        .ok_or_else(|| CoreError::BdevNotFound {
            name: String::from(name),
        })?
        .open(read_write)
}

/// A `BlockDevice` view over a registered bdev.
pub struct BdevBlockDevice {
    bdev: Bdev,
}

impl BdevBlockDevice {
    pub fn new(bdev: Bdev) -> Self {
        Self {
            bdev,
        }
    }
}

#[async_trait(?Send)]
impl BlockDevice for BdevBlockDevice {
    fn size_in_bytes(&self) -> u64 {
        self.bdev.size_in_bytes()
    }

    fn block_len(&self) -> u64 {
        self.bdev.block_len() as u64
    }

    fn num_blocks(&self) -> u64 {
        self.bdev.num_blocks()
    }

    fn uuid(&self) -> Uuid {
        self.bdev.uuid()
    }

    fn product_name(&self) -> String {
        self.bdev.product_name().to_string()
    }

    fn driver_name(&self) -> String {
        self.bdev.driver().to_string()
    }

    fn device_name(&self) -> String {
        self.bdev.name().to_string()
    }

    fn alignment(&self) -> u64 {
        self.bdev.alignment() as u64
    }

    fn io_type_supported(&self, io_type: IoType) -> bool {
        self.bdev.io_type_supported(io_type)
    }

    async fn io_stats(&self) -> Result<BlockDeviceIoStats, CoreError> {
        self.bdev.stats_async().await
    }

    fn open(
        &self,
        read_write: bool,
    ) -> Result<Box<dyn BlockDeviceDescriptor>, CoreError> {
        let desc = self.bdev.open(read_write, move |evt, dev| {
            dispatch_bdev_event(evt, dev);
        })?;

        Ok(Box::new(BdevDescriptor {
            desc,
        }))
    }

    fn get_io_controller(&self) -> Option<Box<dyn DeviceIoController>> {
        None
    }

    fn add_event_listener(
        &self,
        listener: DeviceEventSink,
    ) -> Result<(), CoreError> {
        let mut map = BDEV_LISTENERS.lock();
        map.entry(self.bdev.name().to_string())
            .or_insert_with(|| Arc::new(DeviceEventDispatcher::new()))
            .add_listener(listener);
        Ok(())
    }
}

struct BdevDescriptor {
    desc: DescriptorGuard,
}

#[async_trait(?Send)]
impl BlockDeviceDescriptor for BdevDescriptor {
    fn get_device(&self) -> Box<dyn BlockDevice> {
        Box::new(BdevBlockDevice::new(self.desc.bdev()))
    }

    fn device_name(&self) -> String {
        self.desc.bdev().name().to_string()
    }

    fn into_handle(
        self: Box<Self>,
    ) -> Result<Box<dyn BlockDeviceHandle>, CoreError> {
        let handle = BdevHandle::try_from(self.desc)?;
        Ok(Box::new(BdevDeviceHandle {
            device: BdevBlockDevice::new(handle.get_bdev()),
            handle,
        }))
    }

    fn get_io_handle(&self) -> Result<Box<dyn BlockDeviceHandle>, CoreError> {
        let bdev = self.desc.bdev();
        let handle = BdevHandle::open(bdev.name(), self.desc.is_write())?;
        Ok(Box::new(BdevDeviceHandle {
            device: BdevBlockDevice::new(bdev),
            handle,
        }))
    }

    fn unclaim(&self) {
        self.desc.unclaim()
    }
}

struct BdevDeviceHandle {
    device: BdevBlockDevice,
    handle: BdevHandle,
}

fn completion_status(io: &BdevIo, success: bool) -> IoCompletionStatus {
    if success {
        IoCompletionStatus::Success
    } else {
        match io.nvme_status() {
            Some(s) => IoCompletionStatus::NvmeError(s.status),
            None => IoCompletionStatus::from(io.status()),
        }
    }
}

fn forward(cb: IoCompletionCallback) -> crate::core::IoCompletionFn {
    Box::new(move |io: &BdevIo, success: bool| {
        cb(completion_status(io, success))
    })
}

#[async_trait(?Send)]
impl BlockDeviceHandle for BdevDeviceHandle {
    fn get_device(&self) -> &dyn BlockDevice {
        &self.device
    }

    fn dma_malloc(&self, size: u64) -> Result<DmaBuf, DmaError> {
        self.handle.dma_malloc(size)
    }

    fn readv_blocks(
        &self,
        iovs: &[IoVec],
        offset_blocks: u64,
        num_blocks: u64,
        _opts: ReadOptions,
        cb: IoCompletionCallback,
    ) -> Result<(), CoreError> {
        self.handle.readv_blocks(
            iovs.to_vec(),
            offset_blocks,
            num_blocks,
            forward(cb),
        );
        Ok(())
    }

    fn writev_blocks(
        &self,
        iovs: &[IoVec],
        offset_blocks: u64,
        num_blocks: u64,
        cb: IoCompletionCallback,
    ) -> Result<(), CoreError> {
        self.handle
            .writev_blocks(iovs.to_vec(), offset_blocks, num_blocks, forward(cb))
            .map(|_| ())
    }

    fn comparev_blocks(
        &self,
        iovs: &[IoVec],
        offset_blocks: u64,
        num_blocks: u64,
        cb: IoCompletionCallback,
    ) -> Result<(), CoreError> {
        self.handle.comparev_blocks(
            iovs.to_vec(),
            offset_blocks,
            num_blocks,
            forward(cb),
        );
        Ok(())
    }

    fn reset(&self, cb: OpCompletionCallback) -> Result<(), CoreError> {
        self.handle.reset(Box::new(move |_io: &BdevIo, success: bool| {
            cb(success)
        }));
        Ok(())
    }

    fn unmap_blocks(
        &self,
        offset_blocks: u64,
        num_blocks: u64,
        cb: IoCompletionCallback,
    ) -> Result<(), CoreError> {
        self.handle
            .unmap_blocks(offset_blocks, num_blocks, forward(cb))
            .map(|_| ())
    }

    fn write_zeroes(
        &self,
        offset_blocks: u64,
        num_blocks: u64,
        cb: IoCompletionCallback,
    ) -> Result<(), CoreError> {
        self.handle
            .write_zeroes(offset_blocks, num_blocks, forward(cb))
            .map(|_| ())
    }

    fn flush_io(&self, cb: IoCompletionCallback) -> Result<(), CoreError> {
        self.handle.flush(forward(cb));
        Ok(())
    }
}
