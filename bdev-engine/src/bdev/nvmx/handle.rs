//! The NVMe I/O path: per-channel path selection, submission, completion
//! policy and the retry queue.
//!
//! Each channel of an NVMe bdev holds one I/O path per controller that
//! still contributes a namespace. Path selection prefers ANA-optimized
//! paths, falls back to the first live non-optimized one and otherwise
//! queues the I/O for retry with a deadline. The completion policy retries
//! path errors within the configured budget, escalates ANA errors into a
//! log page refresh, and honors the do-not-retry bit unconditionally.

use std::{
    cell::RefCell,
    collections::VecDeque,
    rc::Rc,
    sync::Arc,
    time::{Duration, Instant},
};

use nix::errno::Errno;

use crate::core::{
    poller,
    BdevChannel,
    BdevIo,
    CoreError,
    GenericStatusCode,
    IoChannel,
    IoStatus,
    IoType,
    NvmeCommandStatus,
    NvmeStatus,
    PathStatusCode,
};

use super::{
    channel::NvmeIoChannelInner,
    transport::{NvmeRequest, NvmeRequestOp},
    utils::AnaState,
    NvmeNamespace,
    NVME_CONTROLLERS,
};

/// Delay before retrying an I/O that found no usable path.
const NO_PATH_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Period of the per-channel retry poller, in microseconds.
const RETRY_POLL_PERIOD_US: u64 = 1_000;

/// One path of a multipath channel: the namespace and the controller
/// channel holding the qpair on this core.
pub(super) struct IoPath {
    pub ns: Arc<NvmeNamespace>,
    pub ctrlr_channel: IoChannel<NvmeIoChannelInner>,
}

impl IoPath {
    fn new(ns: &Arc<NvmeNamespace>) -> Result<IoPath, CoreError> {
        let carc = NVME_CONTROLLERS
            .lookup_by_name(ns.ctrlr_name())
            .ok_or_else(|| CoreError::BdevNotFound {
                name: ns.ctrlr_name().to_string(),
            })?;

        let io_device = {
            let c = carc.lock();
            c.io_device().ok_or_else(|| CoreError::GetIoChannel {
                name: ns.ctrlr_name().to_string(),
            })?
        };

        Ok(IoPath {
            ns: ns.clone(),
            ctrlr_channel: io_device.get_io_channel::<NvmeIoChannelInner>()?,
        })
    }

    /// A path is usable when its qpair is connected and the namespace ANA
    /// state admits I/O.
    fn is_usable(&self) -> bool {
        self.ns.ana_state().is_usable()
            && self.ctrlr_channel.with(|inner| inner.qpair_connected())
    }

    fn is_optimized(&self) -> bool {
        self.ns.ana_state() == AnaState::Optimized
    }

    /// Whether the owning controller told queued I/O to fail fast.
    fn fast_io_fail_timedout(&self) -> bool {
        NVME_CONTROLLERS
            .lookup_by_name(self.ns.ctrlr_name())
            .map_or(false, |c| c.lock().fast_io_fail_timedout())
    }

    /// Whether the owning controller gave up serving I/O entirely.
    fn io_unavailable(&self) -> bool {
        NVME_CONTROLLERS
            .lookup_by_name(self.ns.ctrlr_name())
            .map_or(true, |c| c.lock().io_unavailable())
    }
}

struct RetryEntry {
    io: BdevIo,
    deadline: Instant,
}

/// Shared state of one NVMe bdev channel; the retry poller and the
/// submission paths both reach it through the `Rc`.
pub(super) struct ChannelShared {
    bdev_name: String,
    io_paths: Vec<IoPath>,
    current_path: Option<usize>,
    retry_io_list: VecDeque<RetryEntry>,
}

impl ChannelShared {
    /// Selects a live path: ANA-optimized first, first usable
    /// non-optimized otherwise. The last selection is cached and reused
    /// while it stays usable and optimized.
    fn find_io_path(&mut self) -> Option<usize> {
        if let Some(cached) = self.current_path {
            if let Some(path) = self.io_paths.get(cached) {
                if path.is_usable() && path.is_optimized() {
                    return Some(cached);
                }
            }
            self.current_path = None;
        }

        let mut fallback = None;
        for (i, path) in self.io_paths.iter().enumerate() {
            if !path.is_usable() {
                continue;
            }
            if path.is_optimized() {
                self.current_path = Some(i);
                return Some(i);
            }
            if fallback.is_none() {
                fallback = Some(i);
            }
        }

        self.current_path = fallback;
        fallback
    }

    fn queue_retry(&mut self, io: BdevIo, delay: Duration) {
        self.retry_io_list.push_back(RetryEntry {
            io,
            deadline: Instant::now() + delay,
        });
    }

    /// Removes a queued I/O targeted by an abort.
    fn take_queued(&mut self, target: &BdevIo) -> Option<BdevIo> {
        let pos = self
            .retry_io_list
            .iter()
            .position(|e| e.io.same(target))?;
        self.retry_io_list.remove(pos).map(|e| e.io)
    }
}

/// Per-thread channel context of an NVMe bdev.
pub struct NvmeBdevChannel {
    shared: Rc<RefCell<ChannelShared>>,
    _retry_poller: poller::Poller,
}

impl NvmeBdevChannel {
    pub(super) fn new(
        bdev_name: &str,
        namespaces: Vec<Arc<NvmeNamespace>>,
    ) -> Result<NvmeBdevChannel, CoreError> {
        let mut io_paths = Vec::new();
        for ns in &namespaces {
            match IoPath::new(ns) {
                Ok(p) => io_paths.push(p),
                Err(e) => {
                    // A path that cannot come up now may join later via a
                    // reset; start without it.
                    warn!(
                        "{}: skipping path via '{}': {:?}",
                        bdev_name,
                        ns.ctrlr_name(),
                        e
                    );
                }
            }
        }

        let shared = Rc::new(RefCell::new(ChannelShared {
            bdev_name: bdev_name.to_string(),
            io_paths,
            current_path: None,
            retry_io_list: VecDeque::new(),
        }));

        let poll_shared = shared.clone();
        let retry_poller = poller::Builder::new()
            .with_name("nvme_bdev_retry")
            .with_interval(RETRY_POLL_PERIOD_US)
            .with_poll_fn(move || poll_retries(&poll_shared))
            .build();

        Ok(NvmeBdevChannel {
            shared,
            _retry_poller: retry_poller,
        })
    }
}

/// Adds a path for a namespace that joined the bdev; invoked by a channel
/// traversal on the owning core.
pub(super) fn channel_add_path(
    channel: &mut BdevChannel,
    ns: &Arc<NvmeNamespace>,
) {
    let ch = nvme_channel(channel);
    let mut shared = ch.borrow_mut();

    if shared
        .io_paths
        .iter()
        .any(|p| p.ns.ctrlr_name() == ns.ctrlr_name())
    {
        return;
    }

    match IoPath::new(ns) {
        Ok(p) => {
            debug!(
                "{}: path via '{}' added",
                shared.bdev_name,
                ns.ctrlr_name()
            );
            shared.io_paths.push(p);
        }
        Err(e) => {
            warn!(
                "{}: failed to add path via '{}': {:?}",
                shared.bdev_name,
                ns.ctrlr_name(),
                e
            );
        }
    }
}

/// Drops the path contributed by a leaving controller.
pub(super) fn channel_remove_path(channel: &mut BdevChannel, ctrlr: &str) {
    let ch = nvme_channel(channel);
    let mut shared = ch.borrow_mut();
    shared.io_paths.retain(|p| p.ns.ctrlr_name() != ctrlr);
    shared.current_path = None;
}

/// The typed channel state behind a generic bdev channel.
fn nvme_channel(channel: &mut BdevChannel) -> Rc<RefCell<ChannelShared>> {
    channel
        .module_channel_any()
        .downcast_ref::<NvmeBdevChannel>()
        .expect("NVMe bdev channel context")
        .shared
        .clone()
}

/// Entry point of the NVMe backend: routes a bdev I/O to a path.
pub(super) fn submit_nvme_io(io: BdevIo) {
    match io.io_type() {
        IoType::Reset => submit_reset(io),
        IoType::Abort => submit_abort(io),
        _ => submit_block_io(io),
    }
}

fn channel_shared(io: &BdevIo) -> Rc<RefCell<ChannelShared>> {
    io.channel().with(nvme_channel)
}

// -- block I/O -------------------------------------------------------------

fn request_op(io_type: IoType) -> Option<NvmeRequestOp> {
    match io_type {
        IoType::Read => Some(NvmeRequestOp::Read),
        IoType::Write => Some(NvmeRequestOp::Write),
        IoType::Compare => Some(NvmeRequestOp::Compare),
        IoType::WriteZeros => Some(NvmeRequestOp::WriteZeroes),
        IoType::Unmap => Some(NvmeRequestOp::Unmap),
        IoType::Flush => Some(NvmeRequestOp::Flush),
        _ => None,
    }
}

fn submit_block_io(io: BdevIo) {
    let shared = channel_shared(&io);

    let selected = {
        let mut s = shared.borrow_mut();
        match s.find_io_path() {
            Some(i) => {
                let path = &s.io_paths[i];
                Some((path.ns.clone(), path.ctrlr_channel.clone()))
            }
            None => {
                drop(s);
                handle_no_path(&shared, io);
                return;
            }
        }
    };

    let (ns, ctrlr_channel) = selected.expect("path must be selected");

    let op = match request_op(io.io_type()) {
        Some(op) => op,
        None => {
            io.complete(IoStatus::Failed);
            return;
        }
    };

    let completion_io = io.clone();
    let completion_ns = ns.clone();
    let pending = ctrlr_channel.with(|inner| inner.pending_handle());
    let completion_pending = pending.clone();

    let req = NvmeRequest {
        nsid: ns.nsid(),
        op,
        offset_blocks: io.offset_blocks(),
        num_blocks: io.num_blocks(),
        iovs: io.iovs(),
        tag: io.tag(),
        // The callback may run while the channel is being walked by a
        // reset, so it only touches the shared pending counter.
        cb: Box::new(move |status| {
            completion_pending
                .set(completion_pending.get().saturating_sub(1));
            on_io_completed(completion_io, completion_ns, status);
        }),
    };

    let submitted = ctrlr_channel.with(|inner| {
        inner.account_io();
        inner.submit_or_queue(req)
    });

    match submitted {
        Ok(()) => {}
        Err((e, req)) => {
            trace!("{:?}: submission failed: {}", io, e);
            pending.set(pending.get().saturating_sub(1));
            // Dropping the request releases its completion closure without
            // firing it; the bdev_io stays with us and is queued instead.
            drop(req);
            handle_no_path(&shared, io);
        }
    }
}

/// No usable path right now: queue with a deadline, unless the fail-fast
/// policy already kicked in.
fn handle_no_path(shared: &Rc<RefCell<ChannelShared>>, io: BdevIo) {
    let mut s = shared.borrow_mut();

    let fail_fast = s.io_paths.iter().any(|p| p.fast_io_fail_timedout())
        || (!s.io_paths.is_empty()
            && s.io_paths.iter().all(|p| p.io_unavailable()));

    if fail_fast || s.io_paths.is_empty() {
        debug!("{:?}: no usable path, failing", io);
        drop(s);
        io.fail_nvme(NvmeCommandStatus::error(NvmeStatus::Path(
            PathStatusCode::InternalPathError,
        )));
        return;
    }

    trace!("{:?}: no usable path, queued for retry", io);
    s.queue_retry(io, NO_PATH_RETRY_DELAY);
}

/// Completion policy for NVMe block I/O.
fn on_io_completed(io: BdevIo, ns: Arc<NvmeNamespace>, status: NvmeCommandStatus) {
    if status.succeeded() {
        io.complete(IoStatus::Success);
        return;
    }

    if status.status
        == NvmeStatus::Generic(GenericStatusCode::AbortedByRequest)
    {
        // Aborted on request of the initiator; never retried.
        io.complete(IoStatus::Aborted);
        return;
    }

    // ANA errors update the local view right away and trigger a log page
    // refresh for the authoritative one.
    if status.status.is_ana_error() {
        match status.status {
            NvmeStatus::Path(PathStatusCode::AnaInaccessible) => {
                ns.set_ana_state(AnaState::Inaccessible)
            }
            NvmeStatus::Path(PathStatusCode::AnaPersistentLoss) => {
                ns.set_ana_state(AnaState::PersistentLoss)
            }
            _ => ns.set_ana_state(AnaState::Change),
        }
        ns.set_ana_state_updating(true);

        if let Some(c) = NVME_CONTROLLERS.lookup_by_name(ns.ctrlr_name()) {
            let mut controller = c.lock();
            if let Err(e) = controller.update_ana_states() {
                debug!("ANA refresh not started: {}", e);
            }
        }
    }

    if !status.is_retryable() {
        io.fail_nvme(status);
        return;
    }

    let retry_limit =
        super::nvme_bdev_running_config().bdev_retry_count;
    let attempts = io.retry_count() as i32;

    // A negative budget retries without bound; fast-io-fail still applies
    // through the queued-I/O scan.
    if retry_limit >= 0 && attempts >= retry_limit {
        debug!("{:?}: retry budget exhausted", io);
        io.fail_nvme(status);
        return;
    }

    io.inc_retry_count();

    let shared = channel_shared(&io);
    let mut s = shared.borrow_mut();
    trace!("{:?}: queued for retry ({})", io, io.retry_count());
    s.queue_retry(io, Duration::from_millis(0));
}

// -- reset -----------------------------------------------------------------

/// A reset on the bdev resets the controller behind the active path. A
/// reset submitted while one is in progress is queued on this core and
/// completes with the status of the in-progress reset.
fn submit_reset(io: BdevIo) {
    let shared = channel_shared(&io);

    let path_channel = {
        let mut s = shared.borrow_mut();
        let idx = s.find_io_path().unwrap_or(0);
        match s.io_paths.get(idx) {
            Some(p) => (p.ns.ctrlr_name().to_string(), p.ctrlr_channel.clone()),
            None => {
                drop(s);
                io.complete(IoStatus::Failed);
                return;
            }
        }
    };
    let (ctrlr_name, ctrlr_channel) = path_channel;

    let carc = match NVME_CONTROLLERS.lookup_by_name(&ctrlr_name) {
        Some(c) => c,
        None => {
            io.complete(IoStatus::Failed);
            return;
        }
    };

    let mut controller = carc.lock();

    if controller.reset_in_progress() {
        // Coalesce behind the running reset; drained with its status.
        drop(controller);
        ctrlr_channel.with(|inner| inner.queue_pending_reset(io));
        return;
    }

    struct IoRef(BdevIo);
    // The reset completion runs on the reactor the reset originated from,
    // which is the one this I/O lives on.
    unsafe impl Send for IoRef {}

    let io_ref = IoRef(io.clone());
    let result = controller.reset(Box::new(move |success| {
        let io = io_ref;
        io.0.complete(if success {
            IoStatus::Success
        } else {
            IoStatus::Failed
        });
    }));

    drop(controller);

    if let Err(e) = result {
        match e {
            CoreError::ResetDispatch {
                source: Errno::EBUSY,
            } => {
                // Lost the race against another reset request.
                ctrlr_channel.with(|inner| inner.queue_pending_reset(io));
            }
            _ => {
                debug!("{:?}: reset dispatch failed: {:?}", io, e);
                io.complete(IoStatus::Failed);
            }
        }
    }
}

// -- abort -----------------------------------------------------------------

/// Aborts a previously submitted I/O: first the retry queue, then the
/// transport queues of every path.
fn submit_abort(io: BdevIo) {
    let target = match io.abort_target() {
        Some(t) => t,
        None => {
            io.complete(IoStatus::Failed);
            return;
        }
    };

    let shared = channel_shared(&io);

    // Still waiting in the retry queue: complete it aborted right here.
    let queued = shared.borrow_mut().take_queued(&target);
    if let Some(t) = queued {
        debug!("{:?}: aborted from the retry queue", t);
        t.complete(IoStatus::Aborted);
        io.complete(IoStatus::Success);
        return;
    }

    // In flight: abort through the transport by tag.
    let channels = {
        let s = shared.borrow();
        s.io_paths
            .iter()
            .map(|p| p.ctrlr_channel.clone())
            .collect::<Vec<_>>()
    };

    let mut hits = 0;
    for ch in channels {
        hits += ch.with(|inner| match inner.qpair() {
            Some(q) => q.abort(target.tag()),
            None => 0,
        });
    }

    io.complete(if hits > 0 {
        IoStatus::Success
    } else {
        IoStatus::Failed
    });
}

// -- retry poller ----------------------------------------------------------

/// Scans the retry queue: fails everything once fail-fast applies, and
/// resubmits entries whose deadline passed. Also drains transport queues
/// that had no room earlier.
fn poll_retries(shared: &Rc<RefCell<ChannelShared>>) -> i32 {
    let now = Instant::now();

    let (expired, due, flush_channels) = {
        let mut s = shared.borrow_mut();

        if s.retry_io_list.is_empty() {
            let flush = s
                .io_paths
                .iter()
                .map(|p| p.ctrlr_channel.clone())
                .collect::<Vec<_>>();
            (Vec::new(), Vec::new(), flush)
        } else {
            let fail_fast = s
                .io_paths
                .iter()
                .any(|p| p.fast_io_fail_timedout())
                || (!s.io_paths.is_empty()
                    && s.io_paths.iter().all(|p| p.io_unavailable()));

            if fail_fast {
                let expired = s
                    .retry_io_list
                    .drain(..)
                    .map(|e| e.io)
                    .collect::<Vec<_>>();
                (expired, Vec::new(), Vec::new())
            } else {
                let mut due = Vec::new();
                let mut keep = VecDeque::new();
                while let Some(e) = s.retry_io_list.pop_front() {
                    if e.deadline <= now {
                        due.push(e.io);
                    } else {
                        keep.push_back(e);
                    }
                }
                s.retry_io_list = keep;

                let flush = s
                    .io_paths
                    .iter()
                    .map(|p| p.ctrlr_channel.clone())
                    .collect::<Vec<_>>();
                (Vec::new(), due, flush)
            }
        }
    };

    let mut busy = false;

    for io in expired {
        debug!("{:?}: failing after fast-io-fail timeout", io);
        io.complete(IoStatus::Failed);
        busy = true;
    }

    for io in due {
        trace!("{:?}: retrying", io);
        let ops = io.bdev().ops().clone();
        ops.submit_request(io);
        busy = true;
    }

    for ch in flush_channels {
        ch.with(|inner| inner.flush_queued_reqs());
    }

    if busy {
        1
    } else {
        0
    }
}
