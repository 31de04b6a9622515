use super::{CoreError, DeviceEventSink, IoCompletionStatus, IoType};

use crate::core::{DmaBuf, DmaError, IoVec};

use async_trait::async_trait;
use futures::channel::oneshot;
use merge::Merge;
use nix::errno::Errno;
use uuid::Uuid;

/// Structure representing Bdev Io Stats.
#[derive(Debug, Default, Clone, Copy, Merge)]
pub struct BlockDeviceIoStats {
    #[merge(strategy = merge::num::saturating_add)]
    pub num_read_ops: u64,
    #[merge(strategy = merge::num::saturating_add)]
    pub num_write_ops: u64,
    #[merge(strategy = merge::num::saturating_add)]
    pub bytes_read: u64,
    #[merge(strategy = merge::num::saturating_add)]
    pub bytes_written: u64,
    #[merge(strategy = merge::num::saturating_add)]
    pub num_unmap_ops: u64,
    #[merge(strategy = merge::num::saturating_add)]
    pub bytes_unmapped: u64,
}

/// Completion callback of a single device I/O; carries its context in the
/// closure.
pub type IoCompletionCallback = Box<dyn FnOnce(IoCompletionStatus) + 'static>;

/// Completion callback of a device level operation such as reset.
pub type OpCompletionCallback = Box<dyn FnOnce(bool) + 'static>;

/// Read options.
#[derive(Default, Debug, Copy, Clone)]
pub enum ReadOptions {
    /// Normal read operation.
    #[default]
    None,
    /// Fail when reading an unwritten block of a thin-provisioned device.
    UnwrittenFail,
}

/// Core trait that represents a block device.
#[async_trait(?Send)]
pub trait BlockDevice {
    /// Returns total size in bytes of the device.
    fn size_in_bytes(&self) -> u64;

    /// Returns the size of a block of the underlying device
    fn block_len(&self) -> u64;

    /// Returns number of blocks for the device.
    fn num_blocks(&self) -> u64;

    /// Returns the UUID of the device.
    fn uuid(&self) -> Uuid;

    /// Returns configured product name for the device.
    fn product_name(&self) -> String;

    /// Returns the name of driver module for the device.
    fn driver_name(&self) -> String;

    /// Returns the name of the device.
    fn device_name(&self) -> String;

    /// Returns alignment of the device, as log2 of the byte alignment.
    fn alignment(&self) -> u64;

    /// Checks whether target I/O type is supported by the device.
    fn io_type_supported(&self, io_type: IoType) -> bool;

    /// Obtains I/O statistics for the device.
    async fn io_stats(&self) -> Result<BlockDeviceIoStats, CoreError>;

    /// Open device and obtain a descriptor.
    fn open(
        &self,
        read_write: bool,
    ) -> Result<Box<dyn BlockDeviceDescriptor>, CoreError>;

    /// Obtain I/O controller for device.
    fn get_io_controller(&self) -> Option<Box<dyn DeviceIoController>>;

    /// Register device event listener.
    fn add_event_listener(
        &self,
        listener: DeviceEventSink,
    ) -> Result<(), CoreError>;
}

/// Core trait that represents a descriptor for an opened block device.
#[async_trait(?Send)]
pub trait BlockDeviceDescriptor {
    fn get_device(&self) -> Box<dyn BlockDevice>;

    fn device_name(&self) -> String;

    /// Consumes BlockDeviceDescriptor and returns a BlockDeviceHandle.
    fn into_handle(
        self: Box<Self>,
    ) -> Result<Box<dyn BlockDeviceHandle>, CoreError>;

    /// Returns a BlockDeviceHandle for this descriptor without consuming it.
    fn get_io_handle(&self) -> Result<Box<dyn BlockDeviceHandle>, CoreError>;

    fn unclaim(&self);
}

/// Core trait that represents a device I/O handle.
#[async_trait(?Send)]
pub trait BlockDeviceHandle {
    fn get_device(&self) -> &dyn BlockDevice;

    fn dma_malloc(&self, size: u64) -> Result<DmaBuf, DmaError>;

    /// Reads the given number of blocks into the list of buffers from the
    /// device, starting at the given offset.
    ///
    /// The given completion callback is called when the operation finishes.
    /// This method may return error immediately in the case operation
    /// dispatch fails.
    fn readv_blocks(
        &self,
        iovs: &[IoVec],
        offset_blocks: u64,
        num_blocks: u64,
        opts: ReadOptions,
        cb: IoCompletionCallback,
    ) -> Result<(), CoreError>;

    /// Reads the given number of blocks into the list of buffers from the
    /// device, starting at the given offset.
    ///
    /// Operation is performed asynchronously; I/O completion status is
    /// wrapped into `CoreError::ReadFailed` in the case of failure.
    async fn readv_blocks_async(
        &self,
        iovs: &[IoVec],
        offset_blocks: u64,
        num_blocks: u64,
        opts: ReadOptions,
    ) -> Result<(), CoreError> {
        let (s, r) = oneshot::channel::<IoCompletionStatus>();

        self.readv_blocks(
            iovs,
            offset_blocks,
            num_blocks,
            opts,
            Box::new(move |status| {
                s.send(status).ok();
            }),
        )?;

        match r.await.expect("Failed awaiting at readv_blocks()") {
            IoCompletionStatus::Success => Ok(()),
            status => Err(CoreError::ReadFailed {
                status,
                offset: offset_blocks,
                len: num_blocks,
            }),
        }
    }

    /// Reads the given number of blocks into the buffer from the device,
    /// starting at the given offset.
    async fn read_buf_blocks_async(
        &self,
        buf: &mut DmaBuf,
        offset_blocks: u64,
        num_blocks: u64,
        opts: ReadOptions,
    ) -> Result<(), CoreError> {
        self.readv_blocks_async(
            &[buf.to_io_vec()],
            offset_blocks,
            num_blocks,
            opts,
        )
        .await
    }

    /// Writes the given number of blocks from the list of buffers to the
    /// device, starting at the given offset.
    fn writev_blocks(
        &self,
        iovs: &[IoVec],
        offset_blocks: u64,
        num_blocks: u64,
        cb: IoCompletionCallback,
    ) -> Result<(), CoreError>;

    /// Writes the given number of blocks from the list of buffers to the
    /// device, starting at the given offset.
    ///
    /// Operation is performed asynchronously; I/O completion status is
    /// wrapped into `CoreError::WriteFailed` in the case of failure.
    async fn writev_blocks_async(
        &self,
        iovs: &[IoVec],
        offset_blocks: u64,
        num_blocks: u64,
    ) -> Result<(), CoreError> {
        let (s, r) = oneshot::channel::<IoCompletionStatus>();

        self.writev_blocks(
            iovs,
            offset_blocks,
            num_blocks,
            Box::new(move |status| {
                s.send(status).ok();
            }),
        )?;

        match r.await.expect("Failed awaiting at writev_blocks()") {
            IoCompletionStatus::Success => Ok(()),
            status => Err(CoreError::WriteFailed {
                status,
                offset: offset_blocks,
                len: num_blocks,
            }),
        }
    }

    /// Writes the given number of blocks from the buffer to the device,
    /// starting at the given offset.
    async fn write_buf_blocks_async(
        &self,
        buf: &DmaBuf,
        offset_blocks: u64,
        num_blocks: u64,
    ) -> Result<(), CoreError> {
        self.writev_blocks_async(&[buf.to_io_vec()], offset_blocks, num_blocks)
            .await
    }

    /// Submits a compare request to the block device.
    fn comparev_blocks(
        &self,
        iovs: &[IoVec],
        offset_blocks: u64,
        num_blocks: u64,
        cb: IoCompletionCallback,
    ) -> Result<(), CoreError>;

    /// Submits a compare request to the block device.
    ///
    /// Operation is performed asynchronously; I/O completion status is
    /// wrapped into `CoreError::CompareFailed` in the case of failure.
    async fn comparev_blocks_async(
        &self,
        iovs: &[IoVec],
        offset_blocks: u64,
        num_blocks: u64,
    ) -> Result<(), CoreError> {
        let (s, r) = oneshot::channel::<IoCompletionStatus>();

        self.comparev_blocks(
            iovs,
            offset_blocks,
            num_blocks,
            Box::new(move |status| {
                s.send(status).ok();
            }),
        )?;

        match r.await.expect("Failed awaiting at comparev_blocks()") {
            IoCompletionStatus::Success => Ok(()),
            status => Err(CoreError::CompareFailed {
                status,
                offset: offset_blocks,
                len: num_blocks,
            }),
        }
    }

    fn reset(&self, cb: OpCompletionCallback) -> Result<(), CoreError>;

    fn unmap_blocks(
        &self,
        offset_blocks: u64,
        num_blocks: u64,
        cb: IoCompletionCallback,
    ) -> Result<(), CoreError>;

    fn write_zeroes(
        &self,
        offset_blocks: u64,
        num_blocks: u64,
        cb: IoCompletionCallback,
    ) -> Result<(), CoreError>;

    /// Flush the io in buffer to disk, for the Local Block Device.
    fn flush_io(&self, cb: IoCompletionCallback) -> Result<(), CoreError>;

    /// Submits an NVMe admin command with a custom opcode to the device.
    async fn nvme_admin_custom(&self, _opcode: u8) -> Result<(), CoreError> {
        Err(CoreError::NotSupported {
            source: Errno::EOPNOTSUPP,
        })
    }

    /// Determines if the underlying controller is failed.
    fn is_ctrlr_failed(&self) -> bool {
        false
    }
}

#[derive(Debug, PartialEq, Copy, Clone)]
pub enum DeviceTimeoutAction {
    /// Abort I/O operation that times out.
    Abort,
    /// Reset the whole device in case any single command times out.
    Reset,
    /// Do not take any actions on command timeout.
    Ignore,
    /// Remove the device from the configuration
    HotRemove,
}

impl std::fmt::Display for DeviceTimeoutAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match *self {
            Self::Abort => "Abort",
            Self::Reset => "Reset",
            Self::Ignore => "Ignore",
            Self::HotRemove => "HotRemove",
        };
        write!(f, "{}", s)
    }
}

pub trait DeviceIoController {
    fn get_timeout_action(&self) -> Result<DeviceTimeoutAction, CoreError>;

    fn set_timeout_action(
        &mut self,
        action: DeviceTimeoutAction,
    ) -> Result<(), CoreError>;
}
