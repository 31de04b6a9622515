/* I/O channel for NVMe controller, one per core. */

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    rc::Rc,
};

use nix::errno::Errno;

use crate::{
    core::{
        poller,
        BdevIo,
        GenericStatusCode,
        IoStatus,
        NvmeCommandStatus,
        NvmeStatus,
    },
    subsys::NvmeBdevOpts,
};

use super::{
    nvme_bdev_running_config,
    transport::NvmeRequest,
    NvmeControllerState,
    QPair,
    NVME_CONTROLLERS,
};

impl std::fmt::Debug for NvmeIoChannelInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NvmeIoChannelInner")
            .field("ctrlr", &self.ctrlr_name)
            .field("pending IO", &self.num_pending_ios)
            .finish()
    }
}

/// Per-core I/O channel of one NVMe controller: the qpair, its completion
/// poller, the ENOMEM wait queue and the pending-reset queue.
///
/// The qpair lives in a slot shared with the completion poller, so a reset
/// swapping the qpair out is immediately observed by the poller.
pub struct NvmeIoChannelInner {
    qpair: Rc<RefCell<Option<QPair>>>,
    poller: Option<poller::Poller>,
    ctrlr_name: String,
    /// Requests the transport had no room for, resubmitted on poll.
    queued_reqs: VecDeque<NvmeRequest>,
    /// RESET requests arriving while a reset is already running; completed
    /// with the status of the in-progress reset.
    pending_resets: VecDeque<BdevIo>,
    /// In-flight I/O count; completion callbacks decrement it through a
    /// shared handle, as the channel itself may be borrowed when they run.
    num_pending_ios: Rc<Cell<u64>>,

    // Flag to indicate the shutdown state of the channel.
    // Channel reset is a reversible operation, followed by reinitialize();
    // shutdown is a one-way ticket. The distinction lets a reset that runs
    // in parallel with shutdown skip channels the shutdown already went
    // through.
    is_shutdown: bool,
}

impl NvmeIoChannelInner {
    /// Creates the channel for the named controller: allocates and connects
    /// a qpair and starts the completion poller.
    pub(super) fn create(ctrlr_name: &str) -> Result<Self, Errno> {
        let carc = NVME_CONTROLLERS
            .lookup_by_name(ctrlr_name)
            .ok_or(Errno::ENODEV)?;

        let (transport_ctrlr, name) = {
            let controller = carc.lock();
            if controller.get_state() != NvmeControllerState::Running {
                error!(
                    "{} controller is in {:?} state, I/O channel creation not possible",
                    controller.get_name(),
                    controller.get_state()
                );
                return Err(Errno::ENXIO);
            }
            (controller.transport_ctrlr().ok_or(Errno::ENXIO)?,
             controller.get_name())
        };

        let qpair = QPair::create(&transport_ctrlr, &name)
            .map_err(|_| Errno::ENOMEM)?;
        let rc = qpair.connect();
        if rc != 0 {
            error!("{} failed to connect qpair (errno={})", name, rc);
            return Err(Errno::ENXIO);
        }

        let qpair = Rc::new(RefCell::new(Some(qpair)));
        let poll_qpair = qpair.clone();
        let poll_name = name.clone();
        let cfg: NvmeBdevOpts = nvme_bdev_running_config();
        let poller = poller::Builder::new()
            .with_name("nvme_poll")
            .with_interval(cfg.nvme_ioq_poll_period_us)
            .with_poll_fn(move || nvme_poll(&poll_name, &poll_qpair))
            .build();

        trace!("{}: I/O channel successfully initialized", name);

        Ok(Self {
            qpair,
            poller: Some(poller),
            ctrlr_name: name,
            queued_reqs: VecDeque::new(),
            pending_resets: VecDeque::new(),
            num_pending_ios: Rc::new(Cell::new(0)),
            is_shutdown: false,
        })
    }

    pub(super) fn destroy(mut self) {
        trace!("{}: destroying I/O channel", self.ctrlr_name);
        self.poller.take();
        self.remove_qpair();
    }

    #[inline(always)]
    pub(crate) fn qpair(&self) -> Option<QPair> {
        self.qpair.borrow().clone()
    }

    /// Whether the channel currently has a connected qpair.
    pub fn qpair_connected(&self) -> bool {
        self.qpair
            .borrow()
            .as_ref()
            .map_or(false, |q| q.is_connected())
    }

    fn remove_qpair(&mut self) -> Option<QPair> {
        let q = self.qpair.borrow_mut().take();
        if let Some(q) = &q {
            trace!(qpair = ?q, "removing qpair");
        }
        q
    }

    /// Reset channel, making it unusable till reinitialize() is called.
    pub fn reset(&mut self) -> i32 {
        // Dropping the qpair aborts its queued requests; their submitters
        // see AbortedSqDeletion and queue for retry.
        match self.remove_qpair() {
            Some(qpair) => {
                trace!(
                    "reset: dropping qpair ({} I/O requests pending)",
                    self.num_pending_ios.get()
                );
                drop(qpair);
            }
            None => {
                trace!(
                    "reset: no qpair ({} I/O requests pending)",
                    self.num_pending_ios.get()
                );
            }
        }

        // Requests that never reached the transport abort the same way.
        while let Some(req) = self.queued_reqs.pop_front() {
            (req.cb)(NvmeCommandStatus::error(NvmeStatus::Generic(
                GenericStatusCode::AbortedSqDeletion,
            )));
        }
        0
    }

    /// Checks whether the I/O channel is shutdown.
    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    /// Shutdown I/O channel and make it completely unusable for I/O.
    pub fn shutdown(&mut self) -> i32 {
        if self.is_shutdown {
            return 0;
        }

        let rc = self.reset();
        if rc == 0 {
            self.is_shutdown = true;
            self.poller.take();
        }
        rc
    }

    /// Account active I/O for channel.
    #[inline]
    pub fn account_io(&self) {
        self.num_pending_ios.set(self.num_pending_ios.get() + 1);
    }

    /// Handle completion callbacks use to discard their I/O without
    /// touching the channel itself.
    pub fn pending_handle(&self) -> Rc<Cell<u64>> {
        self.num_pending_ios.clone()
    }

    pub fn num_pending_ios(&self) -> u64 {
        self.num_pending_ios.get()
    }

    /// Reinitialize channel after reset unless the channel is shutdown.
    pub fn reinitialize(
        &mut self,
        ctrlr_name: &str,
        ctrlr_handle: &std::sync::Arc<dyn super::transport::TransportCtrlr>,
    ) -> i32 {
        if self.is_shutdown {
            error!(
                "{} I/O channel is shutdown, channel reinitialization not possible",
                ctrlr_name
            );
            return -(Errno::ENODEV as i32);
        }

        // We assume that channel is reinitialized after being reset, so we
        // expect to see no I/O qpair.
        if self.remove_qpair().is_some() {
            warn!(
                "{}: I/O channel has active I/O qpair while being reinitialized, clearing",
                ctrlr_name
            );
        }

        let qpair = match QPair::create(ctrlr_handle, ctrlr_name) {
            Ok(qpair) => qpair,
            Err(e) => {
                error!("{}: failed to allocate qpair: {:?}", ctrlr_name, e);
                return -(Errno::ENOMEM as i32);
            }
        };

        let rc = qpair.connect();
        if rc != 0 {
            error!("{} failed to connect qpair (errno={})", ctrlr_name, rc);
            return rc;
        }

        trace!("{} I/O channel successfully reinitialized", ctrlr_name);
        *self.qpair.borrow_mut() = Some(qpair);
        0
    }

    /// Submits a request, queueing it when the transport is out of room;
    /// queued requests are resubmitted once completions drain. Any other
    /// failure hands the request back to the caller.
    pub fn submit_or_queue(
        &mut self,
        req: NvmeRequest,
    ) -> Result<(), (Errno, NvmeRequest)> {
        let qpair = match self.qpair() {
            Some(q) if q.is_connected() => q,
            _ => return Err((Errno::ENXIO, req)),
        };

        match qpair.submit(req) {
            Ok(()) => Ok(()),
            Err((Errno::ENOMEM, req)) => {
                trace!("{}: transport queue full, queueing", self.ctrlr_name);
                self.queued_reqs.push_back(req);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Queues a RESET request arriving while a reset is in progress.
    pub fn queue_pending_reset(&mut self, io: BdevIo) {
        debug!("{}: RESET queued behind the active reset", self.ctrlr_name);
        self.pending_resets.push_back(io);
    }

    /// Completes all queued pending resets with the given status.
    pub fn drain_pending_resets(&mut self, status: IoStatus) -> usize {
        let mut n = 0;
        while let Some(io) = self.pending_resets.pop_front() {
            io.complete(status);
            n += 1;
        }
        n
    }

    /// Resubmits requests queued on ENOMEM; driven by the bdev-side retry
    /// poller.
    pub fn flush_queued_reqs(&mut self) {
        let qpair = match self.qpair() {
            Some(q) if q.is_connected() => q,
            _ => return,
        };

        while let Some(req) = self.queued_reqs.pop_front() {
            match qpair.submit(req) {
                Ok(()) => {}
                Err((Errno::ENOMEM, req)) => {
                    // Still no room; keep the rest queued.
                    self.queued_reqs.push_front(req);
                    break;
                }
                Err((e, req)) => {
                    warn!(
                        "{}: flushing queued request failed: {}",
                        self.ctrlr_name, e
                    );
                    self.queued_reqs.push_front(req);
                    break;
                }
            }
        }
    }
}

/// Completion poller body: reap completions and escalate a dead qpair to a
/// controller reset.
fn nvme_poll(ctrlr_name: &str, slot: &Rc<RefCell<Option<QPair>>>) -> i32 {
    let qpair = match slot.borrow().clone() {
        Some(q) => q,
        None => return 0,
    };

    if qpair.is_failed() {
        warn!("{}: qpair failure detected by poller", ctrlr_name);
        super::controller::reset_on_qpair_failure(ctrlr_name);
        return 0;
    }

    // The channel inner cannot be borrowed from the poller; queued requests
    // are flushed from the submission path and after resets instead.
    match qpair.process_completions(0) {
        Ok(n) if n > 0 => 1,
        Ok(_) => 0,
        Err(e) => {
            warn!("{}: completion polling failed: {}", ctrlr_name, e);
            super::controller::reset_on_qpair_failure(ctrlr_name);
            0
        }
    }
}
