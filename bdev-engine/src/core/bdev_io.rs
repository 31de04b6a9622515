//! The bdev I/O request object and the generic submission path.
//!
//! A request is owned by its submitter from allocation until the completion
//! callback returns, and it never leaves the reactor it was submitted on.
//! The generic layer performs the work every backend would otherwise have to
//! repeat: I/O type checks, splitting on the optimal I/O boundary, bounce
//! buffering of misaligned payloads, compare-and-write emulation under an
//! LBA range lock, and the queue-on-no-memory retry policy.

use std::{
    any::Any,
    cell::{Cell, RefCell},
    cmp::min,
    collections::VecDeque,
    fmt::{Debug, Formatter},
    rc::Rc,
    time::Instant,
};

use nix::errno::Errno;
use once_cell::sync::Lazy;

use crate::{
    constants::BDEV_IO_NUM_CHILD_IOV,
    core::{
        lock::{lock_lba_range, unlock_lba_range, LbaRange},
        Bdev,
        BlockDeviceIoStats,
        DmaBuf,
        IoChannel,
        IoVec,
        MemoryPool,
        NvmeCommandStatus,
        Reactors,
    },
};

/// Process-wide budget of in-flight bdev I/Os. Exhaustion does not fail
/// submissions: the request parks on its channel's no-memory queue until a
/// slot frees up.
static BDEV_IO_POOL: Lazy<MemoryPool<()>> = Lazy::new(|| {
    MemoryPool::create(
        "bdev_io",
        crate::subsys::Config::get().bdev_opts.bdev_io_pool_size as u64,
    )
    .expect("failed to create bdev_io pool")
});

/// I/O types supported by the bdev layer.
#[derive(Debug, Copy, Clone, Eq, PartialEq, PartialOrd)]
pub enum IoType {
    Invalid,
    Read,
    Write,
    Unmap,
    Flush,
    Reset,
    NvmeAdmin,
    NvmeIo,
    NvmeIoMd,
    WriteZeros,
    ZeroCopy,
    ZoneInfo,
    ZoneManagement,
    ZoneAppend,
    Compare,
    CompareAndWrite,
    Abort,
}

/// Final status of a bdev I/O.
#[derive(Debug, Copy, Clone, Eq, PartialEq, PartialOrd)]
pub enum IoStatus {
    AioError,
    Aborted,
    FirstFusedFailed,
    Miscompare,
    NoMemory,
    ScsiError,
    NvmeError,
    Failed,
    Pending,
    Success,
}

/// Completion callback: invoked exactly once per submitted I/O, on the
/// submitting reactor.
pub type IoCompletionFn = Box<dyn FnOnce(&BdevIo, bool)>;

/// Payload placement policy for misaligned requests.
pub enum BouncePolicy {
    /// Payload obeys the backend alignment, no copies.
    NoBounce,
    /// Write path: data was copied into the bounce buffer before dispatch.
    BounceWrite {
        bounce: DmaBuf,
        orig_iovs: Vec<IoVec>,
    },
    /// Read path: data is copied back into the caller's vectors on success.
    BounceRead {
        bounce: DmaBuf,
        orig_iovs: Vec<IoVec>,
    },
}

impl Debug for BouncePolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoBounce => write!(f, "NoBounce"),
            Self::BounceWrite {
                ..
            } => write!(f, "BounceWrite"),
            Self::BounceRead {
                ..
            } => write!(f, "BounceRead"),
        }
    }
}

/// Parent side accounting of a split request.
struct SplitCtx {
    remaining_offset: u64,
    remaining_blocks: u64,
    iov_idx: usize,
    iov_off: u64,
    outstanding: u32,
    failed: Option<IoStatus>,
}

/// Per-thread channel of the generic bdev layer. Holds the backend channel
/// alive and carries the submission queues of this core.
pub struct BdevChannel {
    bdev: Bdev,
    /// Keeps the backend's own channel context alive; the backend downcasts
    /// when it needs it.
    module_channel: Box<dyn Any>,
    /// Requests that returned NoMemory, retried when any I/O completes.
    nomem_io: VecDeque<BdevIo>,
    /// Requests waiting for a bounce buffer.
    need_buf: VecDeque<BdevIo>,
    /// Queue depth telemetry.
    outstanding: u64,
    /// Submission call depth; completions arriving while non-zero are
    /// deferred to the next reactor iteration.
    submit_depth: u32,
    stats: BlockDeviceIoStats,
}

impl BdevChannel {
    pub(crate) fn new(bdev: &Bdev) -> Result<Self, Errno> {
        let module_channel = bdev
            .ops()
            .open_channel()
            .map_err(|_| Errno::ENOMEM)?;

        Ok(Self {
            bdev: bdev.clone(),
            module_channel,
            nomem_io: VecDeque::new(),
            need_buf: VecDeque::new(),
            outstanding: 0,
            submit_depth: 0,
            stats: BlockDeviceIoStats::default(),
        })
    }

    pub(crate) fn destroy(self) {
        if self.outstanding > 0 {
            warn!(
                "{}: destroying I/O channel with {} I/Os outstanding",
                self.bdev.name(),
                self.outstanding
            );
        }
    }

    /// The backend channel context, type erased.
    pub fn module_channel_any(&self) -> &dyn Any {
        self.module_channel.as_ref()
    }

    /// Number of I/Os currently dispatched through this channel.
    pub fn queue_depth(&self) -> u64 {
        self.outstanding
    }

    pub fn stats(&self) -> BlockDeviceIoStats {
        self.stats
    }

    fn account_io(&mut self, io_type: IoType, num_blocks: u64) {
        let bytes = num_blocks * self.bdev.block_len() as u64;
        match io_type {
            IoType::Read => {
                self.stats.num_read_ops += 1;
                self.stats.bytes_read += bytes;
            }
            IoType::Write => {
                self.stats.num_write_ops += 1;
                self.stats.bytes_written += bytes;
            }
            IoType::Unmap => {
                self.stats.num_unmap_ops += 1;
                self.stats.bytes_unmapped += bytes;
            }
            _ => {}
        }
    }
}

pub(crate) struct BioInner {
    bdev: Bdev,
    channel: IoChannel<BdevChannel>,
    io_type: IoType,
    offset_blocks: Cell<u64>,
    num_blocks: Cell<u64>,
    iovs: RefCell<Vec<IoVec>>,
    cb: RefCell<Option<IoCompletionFn>>,
    status: Cell<IoStatus>,
    nvme_status: Cell<Option<NvmeCommandStatus>>,
    submit_ts: Cell<Instant>,
    retry_count: Cell<u32>,
    in_submit: Cell<bool>,
    dispatched: Cell<bool>,
    split: RefCell<Option<SplitCtx>>,
    parent: RefCell<Option<BdevIo>>,
    bounce: RefCell<BouncePolicy>,
    abort_target: RefCell<Option<BdevIo>>,
    range_lock: Cell<Option<LbaRange>>,
    pool_token: RefCell<Option<Box<()>>>,
    driver_ctx: RefCell<Option<Box<dyn Any>>>,
}

/// A bdev I/O request. Cheap to clone; all clones refer to the same request.
#[derive(Clone)]
pub struct BdevIo(Rc<BioInner>);

impl Debug for BdevIo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} I/O at {}+{} on '{}' ({:?})",
            self.io_type(),
            self.offset_blocks(),
            self.num_blocks(),
            self.0.bdev.name(),
            self.0.status.get(),
        )
    }
}

impl BdevIo {
    /// Allocates a new request on the given channel.
    #[allow(clippy::too_many_arguments)]
    pub fn alloc(
        channel: IoChannel<BdevChannel>,
        bdev: Bdev,
        io_type: IoType,
        offset_blocks: u64,
        num_blocks: u64,
        iovs: Vec<IoVec>,
        cb: IoCompletionFn,
    ) -> Self {
        Self(Rc::new(BioInner {
            bdev,
            channel,
            io_type,
            offset_blocks: Cell::new(offset_blocks),
            num_blocks: Cell::new(num_blocks),
            iovs: RefCell::new(iovs),
            cb: RefCell::new(Some(cb)),
            status: Cell::new(IoStatus::Pending),
            nvme_status: Cell::new(None),
            submit_ts: Cell::new(Instant::now()),
            retry_count: Cell::new(0),
            in_submit: Cell::new(false),
            dispatched: Cell::new(false),
            split: RefCell::new(None),
            parent: RefCell::new(None),
            bounce: RefCell::new(BouncePolicy::NoBounce),
            abort_target: RefCell::new(None),
            range_lock: Cell::new(None),
            pool_token: RefCell::new(None),
            driver_ctx: RefCell::new(None),
        }))
    }

    fn alloc_child(
        parent: &BdevIo,
        io_type: IoType,
        offset_blocks: u64,
        num_blocks: u64,
        iovs: Vec<IoVec>,
    ) -> Self {
        let child = Self::alloc(
            parent.0.channel.clone(),
            parent.0.bdev.clone(),
            io_type,
            offset_blocks,
            num_blocks,
            iovs,
            Box::new(|_, _| {}),
        );
        *child.0.parent.borrow_mut() = Some(parent.clone());
        child.0.cb.borrow_mut().take();
        child
    }

    // -- accessors ---------------------------------------------------------

    pub fn bdev(&self) -> &Bdev {
        &self.0.bdev
    }

    /// The bdev-layer channel this request was submitted on.
    pub fn channel(&self) -> IoChannel<BdevChannel> {
        self.0.channel.clone()
    }

    pub fn io_type(&self) -> IoType {
        self.0.io_type
    }

    pub fn offset_blocks(&self) -> u64 {
        self.0.offset_blocks.get()
    }

    pub fn num_blocks(&self) -> u64 {
        self.0.num_blocks.get()
    }

    /// Translates the request to a new offset; used by layered bdevs.
    pub fn set_offset_blocks(&self, offset: u64) {
        self.0.offset_blocks.set(offset)
    }

    pub fn iovs(&self) -> Vec<IoVec> {
        self.0.iovs.borrow().clone()
    }

    pub fn status(&self) -> IoStatus {
        self.0.status.get()
    }

    pub fn nvme_status(&self) -> Option<NvmeCommandStatus> {
        self.0.nvme_status.get()
    }

    pub fn submit_ts(&self) -> Instant {
        self.0.submit_ts.get()
    }

    pub fn retry_count(&self) -> u32 {
        self.0.retry_count.get()
    }

    pub fn inc_retry_count(&self) -> u32 {
        let n = self.0.retry_count.get() + 1;
        self.0.retry_count.set(n);
        n
    }

    /// Two handles referring to the same request compare equal.
    pub fn same(&self, other: &BdevIo) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Stable identifier of the request while it is alive; used by abort
    /// to find it in transport queues.
    pub fn tag(&self) -> u64 {
        Rc::as_ptr(&self.0) as u64
    }

    /// The request an ABORT targets.
    pub fn abort_target(&self) -> Option<BdevIo> {
        self.0.abort_target.borrow().clone()
    }

    pub fn set_abort_target(&self, target: &BdevIo) {
        *self.0.abort_target.borrow_mut() = Some(target.clone());
    }

    /// Backend private per-I/O context.
    pub fn set_driver_ctx(&self, ctx: Box<dyn Any>) {
        *self.0.driver_ctx.borrow_mut() = Some(ctx);
    }

    pub fn take_driver_ctx(&self) -> Option<Box<dyn Any>> {
        self.0.driver_ctx.borrow_mut().take()
    }

    // -- submission --------------------------------------------------------

    /// Submits the request through the generic layer.
    pub fn submit(&self) {
        let bdev = &self.0.bdev;

        self.0.submit_ts.set(Instant::now());

        if !bdev.io_type_supported(self.io_type()) {
            debug!("{:?}: I/O type not supported", self);
            self.complete(IoStatus::Failed);
            return;
        }

        match self.io_type() {
            IoType::Read | IoType::Write => {
                if bdev.split_on_optimal_io_boundary()
                    && self.crosses_boundary()
                {
                    self.split_and_submit();
                    return;
                }
                self.submit_unsplit();
            }
            IoType::CompareAndWrite => {
                self.submit_compare_and_write();
            }
            _ => self.dispatch(),
        }
    }

    /// Submission stage past boundary splitting: bounce then dispatch.
    fn submit_unsplit(&self) {
        let align = self.0.bdev.alignment();
        if align > 0
            && matches!(self.io_type(), IoType::Read | IoType::Write)
            && self
                .0
                .iovs
                .borrow()
                .iter()
                .any(|iov| !iov.is_aligned(align as u64))
        {
            if !self.setup_bounce() {
                // Queued until a buffer frees up.
                return;
            }
        }
        self.dispatch();
    }

    fn dispatch(&self) {
        let ch = &self.0.channel;

        // Take an I/O slot from the shared pool; when none is available the
        // request waits for a completion on this channel to free one.
        if self.0.pool_token.borrow().is_none() {
            match BDEV_IO_POOL.get(()) {
                Some(token) => {
                    *self.0.pool_token.borrow_mut() = Some(token)
                }
                None => {
                    trace!("{:?}: bdev_io pool exhausted, queueing", self);
                    let io = self.clone();
                    ch.with(|c| c.nomem_io.push_back(io));
                    return;
                }
            }
        }

        ch.with(|c| {
            c.outstanding += 1;
            c.submit_depth += 1;
        });
        self.0.dispatched.set(true);
        self.0.in_submit.set(true);

        self.0.bdev.ops().submit_request(self.clone());

        self.0.in_submit.set(false);
        ch.with(|c| c.submit_depth -= 1);
    }

    // -- splitting ---------------------------------------------------------

    fn crosses_boundary(&self) -> bool {
        let boundary = self.0.bdev.optimal_io_boundary();
        if boundary == 0 || self.num_blocks() == 0 {
            return false;
        }
        let start = self.offset_blocks() / boundary;
        let end = (self.offset_blocks() + self.num_blocks() - 1) / boundary;
        start != end
    }

    fn split_and_submit(&self) {
        *self.0.split.borrow_mut() = Some(SplitCtx {
            remaining_offset: self.offset_blocks(),
            remaining_blocks: self.num_blocks(),
            iov_idx: 0,
            iov_off: 0,
            outstanding: 0,
            failed: None,
        });

        trace!("{:?}: splitting on boundary", self);
        self.submit_split_children();
    }

    fn submit_split_children(&self) {
        let boundary = self.0.bdev.optimal_io_boundary();
        let block_len = self.0.bdev.block_len() as u64;
        let parent_iovs = self.0.iovs.borrow().clone();
        let mut children = Vec::new();

        {
            let mut split = self.0.split.borrow_mut();
            let s = split.as_mut().expect("split context must exist");

            while s.remaining_blocks > 0 {
                let to_boundary = boundary - (s.remaining_offset % boundary);
                let mut child_blocks = min(to_boundary, s.remaining_blocks);

                // Carve scatter/gather entries for this child, bounded by
                // the per-child entry cap.
                let mut child_iovs = Vec::new();
                let mut bytes = child_blocks * block_len;
                let mut carved = 0_u64;

                while bytes > 0 && child_iovs.len() < BDEV_IO_NUM_CHILD_IOV {
                    let iov = parent_iovs[s.iov_idx];
                    let avail = iov.len() - s.iov_off;
                    let take = min(avail, bytes);

                    child_iovs.push(IoVec::new(
                        (iov.as_ptr() as u64 + s.iov_off) as *mut u8,
                        take,
                    ));

                    s.iov_off += take;
                    if s.iov_off == iov.len() {
                        s.iov_idx += 1;
                        s.iov_off = 0;
                    }
                    bytes -= take;
                    carved += take;
                }

                if bytes > 0 {
                    // Out of entry slots: shrink the child to what the
                    // vectors covered. Entry lengths are block multiples,
                    // so the carved byte count is too.
                    child_blocks = carved / block_len;
                }

                let child = BdevIo::alloc_child(
                    self,
                    self.io_type(),
                    s.remaining_offset,
                    child_blocks,
                    child_iovs,
                );

                s.remaining_offset += child_blocks;
                s.remaining_blocks -= child_blocks;
                s.outstanding += 1;

                children.push(child);
            }
        }

        for child in children {
            child.submit_unsplit();
        }
    }

    fn child_completed(&self, status: IoStatus) {
        let done = {
            let mut split = self.0.split.borrow_mut();
            let s = split.as_mut().expect("split context must exist");

            if status != IoStatus::Success && s.failed.is_none() {
                s.failed = Some(status);
            }
            s.outstanding -= 1;
            s.outstanding == 0 && s.remaining_blocks == 0
        };

        if done {
            let failed = self
                .0
                .split
                .borrow()
                .as_ref()
                .and_then(|s| s.failed);
            self.do_complete(failed.unwrap_or(IoStatus::Success));
        }
    }

    // -- bounce buffers ----------------------------------------------------

    /// Replaces misaligned payload vectors by an aligned bounce buffer.
    /// Returns false when no buffer could be obtained and the request was
    /// queued instead.
    fn setup_bounce(&self) -> bool {
        let align = 1_u64 << self.0.bdev.alignment();
        let bytes = self.num_blocks() * self.0.bdev.block_len() as u64;

        let bounce = match DmaBuf::new(bytes, align) {
            Ok(buf) => buf,
            Err(_) => {
                trace!("{:?}: no bounce buffer available, queueing", self);
                let io = self.clone();
                self.0.channel.with(|c| c.need_buf.push_back(io));
                return false;
            }
        };

        let orig_iovs = self.0.iovs.borrow().clone();

        let policy = match self.io_type() {
            IoType::Write => {
                // Gather the caller's data into the aligned buffer.
                let mut bounce_iov = bounce.to_io_vec();
                let dst = unsafe { bounce_iov.as_mut_slice() };
                let mut at = 0_usize;
                for iov in &orig_iovs {
                    let src = unsafe { iov.as_slice() };
                    dst[at .. at + src.len()].copy_from_slice(src);
                    at += src.len();
                }
                BouncePolicy::BounceWrite {
                    bounce,
                    orig_iovs,
                }
            }
            _ => BouncePolicy::BounceRead {
                bounce,
                orig_iovs,
            },
        };

        *self.0.iovs.borrow_mut() = match &policy {
            BouncePolicy::BounceWrite {
                bounce, ..
            }
            | BouncePolicy::BounceRead {
                bounce, ..
            } => vec![bounce.to_io_vec()],
            BouncePolicy::NoBounce => unreachable!(),
        };
        *self.0.bounce.borrow_mut() = policy;

        true
    }

    /// Executes the read copy-back and drops the bounce buffer.
    fn finish_bounce(&self, success: bool) {
        let policy = std::mem::replace(
            &mut *self.0.bounce.borrow_mut(),
            BouncePolicy::NoBounce,
        );

        match policy {
            BouncePolicy::NoBounce => {}
            BouncePolicy::BounceWrite {
                orig_iovs, ..
            } => {
                *self.0.iovs.borrow_mut() = orig_iovs;
            }
            BouncePolicy::BounceRead {
                bounce,
                orig_iovs,
            } => {
                if success {
                    let src = bounce.as_slice();
                    let mut at = 0_usize;
                    for iov in &orig_iovs {
                        let dst = unsafe { iov.as_mut_slice() };
                        dst.copy_from_slice(&src[at .. at + dst.len()]);
                        at += dst.len();
                    }
                }
                *self.0.iovs.borrow_mut() = orig_iovs;
            }
        }
    }

    // -- compare and write -------------------------------------------------

    /// Emulated fused compare-and-write: the range is locked, compared, and
    /// written only when the compare matched.
    fn submit_compare_and_write(&self) {
        let range = LbaRange::new(self.offset_blocks(), self.num_blocks());
        self.0.range_lock.set(Some(range));

        let io = self.clone();
        lock_lba_range(self.0.bdev.name(), range, move || {
            io.caw_locked();
        });
    }

    fn caw_locked(&self) {
        let parent = self.clone();
        let compare = BdevIo::alloc_child(
            self,
            IoType::Compare,
            self.offset_blocks(),
            self.num_blocks(),
            self.iovs(),
        );
        // Compare drives the write; completion is chained, not fanned out.
        *compare.0.parent.borrow_mut() = None;
        *compare.0.cb.borrow_mut() = Some(Box::new(move |_, success| {
            if !success {
                parent.do_complete(IoStatus::Miscompare);
                return;
            }
            let write_parent = parent.clone();
            let write = BdevIo::alloc_child(
                &parent,
                IoType::Write,
                parent.offset_blocks(),
                parent.num_blocks(),
                parent.iovs(),
            );
            *write.0.parent.borrow_mut() = None;
            *write.0.cb.borrow_mut() = Some(Box::new(move |_, success| {
                write_parent.do_complete(if success {
                    IoStatus::Success
                } else {
                    IoStatus::FirstFusedFailed
                });
            }));
            write.submit_unsplit();
        }));
        compare.submit_unsplit();
    }

    // -- completion --------------------------------------------------------

    /// Completes the request with an NVMe error status.
    pub fn fail_nvme(&self, status: NvmeCommandStatus) {
        self.0.nvme_status.set(Some(status));
        self.complete(IoStatus::NvmeError);
    }

    /// Completes the request. May be called from within `submit_request`;
    /// in that case the completion is deferred to the next iteration of the
    /// submitting reactor to avoid re-entrant stack growth.
    pub fn complete(&self, status: IoStatus) {
        let deferred = self.0.channel.with(|c| c.submit_depth > 0);

        if deferred {
            let io = self.clone();
            Reactors::current()
                .expect("completions must run on a reactor")
                .defer(move || io.do_complete(status));
        } else {
            self.do_complete(status);
        }
    }

    fn do_complete(&self, status: IoStatus) {
        // Queue-on-no-memory: the request is retried once another I/O on
        // this channel completes, it does not complete towards the caller.
        if status == IoStatus::NoMemory {
            trace!("{:?}: backend out of memory, queueing", self);
            if self.0.dispatched.replace(false) {
                self.0.channel.with(|c| {
                    c.outstanding -= 1;
                });
            }
            let io = self.clone();
            self.0.channel.with(|c| c.nomem_io.push_back(io));
            return;
        }

        let success = status == IoStatus::Success;

        self.finish_bounce(success);

        if self.0.dispatched.replace(false) {
            self.0.channel.with(|c| {
                c.outstanding -= 1;
                if success {
                    let (ty, nb) = (self.io_type(), self.num_blocks());
                    c.account_io(ty, nb);
                }
            });
        }

        if let Some(range) = self.0.range_lock.take() {
            unlock_lba_range(self.0.bdev.name(), range);
        }

        if let Some(token) = self.0.pool_token.borrow_mut().take() {
            BDEV_IO_POOL.put(token);
        }

        self.0.status.set(status);

        if let Some(parent) = self.0.parent.borrow_mut().take() {
            parent.child_completed(status);
        } else if let Some(cb) = self.0.cb.borrow_mut().take() {
            cb(self, success);
        }

        self.retry_queued();
    }

    /// Kicks queued work on this channel: one request from the no-memory
    /// queue and one waiting for a bounce buffer.
    fn retry_queued(&self) {
        let retry = self.0.channel.with(|c| c.nomem_io.pop_front());
        if let Some(io) = retry {
            trace!("{:?}: retrying after memory shortage", io);
            io.dispatch();
        }

        let need_buf = self.0.channel.with(|c| c.need_buf.pop_front());
        if let Some(io) = need_buf {
            io.submit_unsplit();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn boundary_crossing() {
        // Only the pure math is checked here; the full path is exercised in
        // the integration tests with a real backend.
        let boundary = 8_u64;
        let crosses = |offset: u64, num: u64| {
            offset / boundary != (offset + num - 1) / boundary
        };

        assert!(!crosses(0, 8));
        assert!(!crosses(8, 8));
        assert!(crosses(4, 8));
        assert!(crosses(7, 2));
        assert!(!crosses(15, 1));
    }
}
