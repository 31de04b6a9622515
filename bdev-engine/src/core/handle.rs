//! Handle over an open descriptor plus the per-thread channel: the unit a
//! consumer uses to actually do I/O against a bdev. A handle is bound to the
//! reactor it was created on.

use std::convert::TryFrom;

use futures::channel::oneshot;
use nix::errno::Errno;

use crate::core::{
    bdev_io::{BdevChannel, IoCompletionFn},
    Bdev,
    BdevIo,
    CoreError,
    DescriptorGuard,
    DmaBuf,
    DmaError,
    IoChannel,
    IoStatus,
    IoType,
    IoVec,
};

/// A handle to a bdev, combining a descriptor with an I/O channel of the
/// calling reactor.
pub struct BdevHandle {
    desc: DescriptorGuard,
    channel: IoChannel<BdevChannel>,
}

impl BdevHandle {
    /// Opens a bdev by name and acquires a channel on the calling reactor.
    pub fn open(
        name: &str,
        read_write: bool,
    ) -> Result<Self, CoreError> {
        let desc = Bdev::open_by_name(name, read_write, |_, _| {})?;
        Self::try_from(desc)
    }

    pub fn get_bdev(&self) -> Bdev {
        self.desc.bdev()
    }

    pub fn descriptor(&self) -> &DescriptorGuard {
        &self.desc
    }

    /// Closes the handle, dropping the channel and the descriptor.
    pub fn close(self) {
        drop(self)
    }

    pub fn dma_malloc(&self, size: u64) -> Result<DmaBuf, DmaError> {
        DmaBuf::new(size, 1 << self.get_bdev().alignment())
    }

    fn submit(
        &self,
        io_type: IoType,
        offset_blocks: u64,
        num_blocks: u64,
        iovs: Vec<IoVec>,
        cb: IoCompletionFn,
    ) -> BdevIo {
        let io = BdevIo::alloc(
            self.channel.clone(),
            self.desc.bdev(),
            io_type,
            offset_blocks,
            num_blocks,
            iovs,
            cb,
        );
        io.submit();
        io
    }

    fn check_write(&self) -> Result<(), CoreError> {
        if self.desc.is_write() {
            Ok(())
        } else {
            Err(CoreError::OpenBdev {
                source: Errno::EPERM,
            })
        }
    }

    // -- callback based entry points --------------------------------------

    pub fn readv_blocks(
        &self,
        iovs: Vec<IoVec>,
        offset_blocks: u64,
        num_blocks: u64,
        cb: IoCompletionFn,
    ) -> BdevIo {
        self.submit(IoType::Read, offset_blocks, num_blocks, iovs, cb)
    }

    pub fn writev_blocks(
        &self,
        iovs: Vec<IoVec>,
        offset_blocks: u64,
        num_blocks: u64,
        cb: IoCompletionFn,
    ) -> Result<BdevIo, CoreError> {
        self.check_write()?;
        Ok(self.submit(IoType::Write, offset_blocks, num_blocks, iovs, cb))
    }

    pub fn comparev_blocks(
        &self,
        iovs: Vec<IoVec>,
        offset_blocks: u64,
        num_blocks: u64,
        cb: IoCompletionFn,
    ) -> BdevIo {
        self.submit(IoType::Compare, offset_blocks, num_blocks, iovs, cb)
    }

    pub fn reset(&self, cb: IoCompletionFn) -> BdevIo {
        self.submit(IoType::Reset, 0, 0, Vec::new(), cb)
    }

    pub fn unmap_blocks(
        &self,
        offset_blocks: u64,
        num_blocks: u64,
        cb: IoCompletionFn,
    ) -> Result<BdevIo, CoreError> {
        self.check_write()?;
        Ok(self.submit(IoType::Unmap, offset_blocks, num_blocks, Vec::new(), cb))
    }

    pub fn write_zeroes(
        &self,
        offset_blocks: u64,
        num_blocks: u64,
        cb: IoCompletionFn,
    ) -> Result<BdevIo, CoreError> {
        self.check_write()?;
        Ok(self.submit(
            IoType::WriteZeros,
            offset_blocks,
            num_blocks,
            Vec::new(),
            cb,
        ))
    }

    pub fn flush(&self, cb: IoCompletionFn) -> BdevIo {
        self.submit(IoType::Flush, 0, 0, Vec::new(), cb)
    }

    /// Fused compare-and-write over one span; fails with `Miscompare` when
    /// the compare half does not match.
    pub fn compare_and_write_blocks(
        &self,
        iovs: Vec<IoVec>,
        offset_blocks: u64,
        num_blocks: u64,
        cb: IoCompletionFn,
    ) -> Result<BdevIo, CoreError> {
        self.check_write()?;
        Ok(self.submit(
            IoType::CompareAndWrite,
            offset_blocks,
            num_blocks,
            iovs,
            cb,
        ))
    }

    /// Aborts a previously submitted request. Completion of the abort
    /// itself reports whether the target was found.
    pub fn abort(&self, target: &BdevIo, cb: IoCompletionFn) -> BdevIo {
        let io = BdevIo::alloc(
            self.channel.clone(),
            self.desc.bdev(),
            IoType::Abort,
            0,
            0,
            Vec::new(),
            cb,
        );
        io.set_abort_target(target);
        io.submit();
        io
    }

    // -- async wrappers ----------------------------------------------------

    async fn wait(r: oneshot::Receiver<IoStatus>) -> IoStatus {
        r.await.expect("bdev_io completion channel dropped")
    }

    fn status_cb(s: oneshot::Sender<IoStatus>) -> IoCompletionFn {
        Box::new(move |io: &BdevIo, _success: bool| {
            s.send(io.status()).ok();
        })
    }

    /// Reads `buffer.len()` bytes at `offset` bytes into the buffer.
    pub async fn read_at(
        &self,
        offset: u64,
        buffer: &mut DmaBuf,
    ) -> Result<u64, CoreError> {
        let (offset_blocks, num_blocks) =
            self.bytes_to_blocks(offset, buffer.len())?;

        let (s, r) = oneshot::channel();
        self.readv_blocks(
            vec![buffer.to_io_vec()],
            offset_blocks,
            num_blocks,
            Self::status_cb(s),
        );

        match Self::wait(r).await {
            IoStatus::Success => Ok(buffer.len()),
            status => {
                error!("read failed: {:?}", status);
                Err(CoreError::ReadDispatch {
                    source: Errno::EIO,
                    offset,
                    len: buffer.len(),
                })
            }
        }
    }

    /// Writes the buffer at `offset` bytes.
    pub async fn write_at(
        &self,
        offset: u64,
        buffer: &DmaBuf,
    ) -> Result<u64, CoreError> {
        let (offset_blocks, num_blocks) =
            self.bytes_to_blocks(offset, buffer.len())?;

        let (s, r) = oneshot::channel();
        self.writev_blocks(
            vec![buffer.to_io_vec()],
            offset_blocks,
            num_blocks,
            Self::status_cb(s),
        )?;

        match Self::wait(r).await {
            IoStatus::Success => Ok(buffer.len()),
            status => {
                error!("write failed: {:?}", status);
                Err(CoreError::WriteDispatch {
                    source: Errno::EIO,
                    offset,
                    len: buffer.len(),
                })
            }
        }
    }

    /// Resets the underlying device, awaiting the outcome.
    pub async fn reset_async(&self) -> Result<(), CoreError> {
        let (s, r) = oneshot::channel();
        self.reset(Self::status_cb(s));

        match Self::wait(r).await {
            IoStatus::Success => Ok(()),
            _ => Err(CoreError::ResetFailed {}),
        }
    }

    /// Unmaps a block range, awaiting the outcome.
    pub async fn unmap_blocks_async(
        &self,
        offset_blocks: u64,
        num_blocks: u64,
    ) -> Result<(), CoreError> {
        let (s, r) = oneshot::channel();
        self.unmap_blocks(offset_blocks, num_blocks, Self::status_cb(s))?;

        match Self::wait(r).await {
            IoStatus::Success => Ok(()),
            _ => Err(CoreError::UnmapDispatch {
                source: Errno::EIO,
                offset: offset_blocks,
                len: num_blocks,
            }),
        }
    }

    fn bytes_to_blocks(
        &self,
        offset: u64,
        len: u64,
    ) -> Result<(u64, u64), CoreError> {
        let block_len = self.get_bdev().block_len() as u64;
        if offset % block_len != 0 || len % block_len != 0 {
            return Err(CoreError::InvalidOffset {
                offset,
            });
        }
        Ok((offset / block_len, len / block_len))
    }
}

impl TryFrom<DescriptorGuard> for BdevHandle {
    type Error = CoreError;

    fn try_from(desc: DescriptorGuard) -> Result<Self, Self::Error> {
        let channel = desc.io_channel()?;
        Ok(Self {
            desc,
            channel,
        })
    }
}

impl std::fmt::Debug for BdevHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BdevHandle for {:?}", self.desc)
    }
}
