//!
//!
//! This file contains the main structures for a NVMe controller: the
//! attach path, the reset / failover / reconnect state machine and the
//! ANA log page handling.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use futures::channel::oneshot;
use nix::errno::Errno;
use parking_lot::Mutex;

use crate::core::{
    poller,
    CoreError,
    DeviceEventDispatcher,
    DeviceEventSink,
    DeviceEventType,
    IoDevice,
    IoStatus,
    Reactors,
};

use super::{
    channel::NvmeIoChannelInner,
    controller_state::{
        ControllerFailureReason,
        ControllerFlag,
        ControllerStateMachine,
    },
    nvme_bdev_running_config,
    transport::{
        NvmeTransport,
        NvmeTransportId,
        ProbeStatus,
        TransportCtrlr,
    },
    utils::{AnaLogPage, AsyncEvent},
    NvmeControllerState,
    NvmeControllerState::*,
    NvmeNamespace,
    NVME_CONTROLLERS,
};

/// Operation completion callback used by reset and shutdown.
pub type OpCompletion = Box<dyn FnOnce(bool) + Send>;

static CONTROLLER_IDS: AtomicU64 = AtomicU64::new(1);

/// Context that rides the reset traversals.
struct ResetCtx {
    name: String,
    cb: Option<OpCompletion>,
    io_device: Arc<IoDevice>,
    handle: Arc<dyn TransportCtrlr>,
    shutdown_in_progress: bool,
}

impl fmt::Debug for ResetCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResetCtx").field("name", &self.name).finish()
    }
}

struct ShutdownCtx {
    name: String,
    cb: Option<OpCompletion>,
}

/// A transport id entry of a controller, with its failure mark.
#[derive(Debug, Clone)]
pub struct TridEntry {
    pub trid: NvmeTransportId,
    pub is_failed: bool,
}

pub struct NvmeControllerInner {
    namespaces: Vec<Arc<NvmeNamespace>>,
    ctrlr: Arc<dyn TransportCtrlr>,
    adminq_poller: poller::Poller,
    io_device: Arc<IoDevice>,
}

unsafe impl Send for NvmeControllerInner {}
unsafe impl Sync for NvmeControllerInner {}

impl NvmeControllerInner {
    fn new(ctrlr: Arc<dyn TransportCtrlr>, name: String) -> Self {
        let device_name = name.clone();
        let io_device = IoDevice::new::<NvmeIoChannelInner>(
            &name,
            move || {
                NvmeIoChannelInner::create(&device_name)
            },
            NvmeIoChannelInner::destroy,
        );

        let poll_ctrlr = ctrlr.clone();
        let poll_name = name;
        let mut failure_reported = false;
        let adminq_poller = poller::Builder::new()
            .with_name("nvme_poll_adminq")
            .with_interval(
                nvme_bdev_running_config().nvme_adminq_poll_period_us,
            )
            .with_poll_fn(move || {
                nvme_poll_adminq(
                    &poll_name,
                    &poll_ctrlr,
                    &mut failure_reported,
                )
            })
            .build();

        Self {
            ctrlr,
            adminq_poller,
            namespaces: Vec::new(),
            io_device,
        }
    }
}

/// NVME controller implementation.
pub struct NvmeController {
    pub(crate) name: String,
    id: u64,
    inner: Option<NvmeControllerInner>,
    state_machine: ControllerStateMachine,
    event_dispatcher: DeviceEventDispatcher,
    transport: Arc<dyn NvmeTransport>,
    opts: options::NvmeControllerOpts,
    /// Transport id list; `[active_trid_idx]` is the active one. Newly
    /// added alternates always append behind the active entry.
    trids: Vec<TridEntry>,
    active_trid_idx: usize,
    /// Set when the active trid changed and the next reset must perform a
    /// full transport reconnect instead of a controller-level reset.
    trid_changed: bool,
    /// Start of the running reset/reconnect cycle; bounds the loss and
    /// fast-io-fail budgets.
    reset_start: Option<Instant>,
    /// Shutdown requested while a reset was active.
    destruct_pending: bool,
}

impl fmt::Debug for NvmeController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NvmeController")
            .field("name", &self.name)
            .field("state", &self.state_machine.current_state())
            .finish()
    }
}

unsafe impl Send for NvmeController {}
unsafe impl Sync for NvmeController {}

impl NvmeController {
    /// Creates a new NVMe controller with the given name; transport
    /// attachment is a separate step.
    fn new(
        name: &str,
        trid: NvmeTransportId,
        transport: Arc<dyn NvmeTransport>,
        opts: options::NvmeControllerOpts,
    ) -> Self {
        let l = NvmeController {
            name: String::from(name),
            id: 0,
            inner: None,
            state_machine: ControllerStateMachine::new(name),
            event_dispatcher: DeviceEventDispatcher::new(),
            transport,
            opts,
            trids: vec![TridEntry {
                trid,
                is_failed: false,
            }],
            active_trid_idx: 0,
            trid_changed: false,
            reset_start: None,
            destruct_pending: false,
        };

        debug!("{}: new NVMe controller created", l.name);
        l
    }

    /// returns the name of the current controller
    pub fn get_name(&self) -> String {
        self.name.clone()
    }

    /// returns the ID of the controller
    pub fn id(&self) -> u64 {
        if self.state_machine.current_state() != New {
            assert_ne!(self.id, 0, "Controller ID is not yet initialized");
        }
        self.id
    }

    fn set_id(&mut self, id: u64) -> u64 {
        assert_ne!(id, 0, "Controller ID can't be zero");
        self.id = id;
        debug!("{} ID set to 0x{:X}", self.name, self.id);
        id
    }

    /// Get controller state.
    pub fn get_state(&self) -> NvmeControllerState {
        self.state_machine.current_state()
    }

    /// Controller id as reported by the transport.
    pub fn cntlid(&self) -> u16 {
        self.inner.as_ref().map_or(0, |i| i.ctrlr.cntlid())
    }

    /// The transport-level controller handle.
    pub fn transport_ctrlr(&self) -> Option<Arc<dyn TransportCtrlr>> {
        self.inner.as_ref().map(|i| i.ctrlr.clone())
    }

    /// Namespaces currently attached to this controller.
    pub fn namespaces(&self) -> Vec<Arc<NvmeNamespace>> {
        self.inner
            .as_ref()
            .map(|i| i.namespaces.clone())
            .unwrap_or_default()
    }

    /// Looks up a namespace by its id.
    pub fn namespace(&self, nsid: u32) -> Option<Arc<NvmeNamespace>> {
        self.namespaces().into_iter().find(|ns| ns.nsid() == nsid)
    }

    /// The io-device producing this controller's per-core channels.
    pub(crate) fn io_device(&self) -> Option<Arc<IoDevice>> {
        self.inner.as_ref().map(|i| i.io_device.clone())
    }

    // -- transport ids -----------------------------------------------------

    /// The transport id list, active entry first in arrival order.
    pub fn trids(&self) -> Vec<TridEntry> {
        self.trids.clone()
    }

    pub fn active_trid(&self) -> &TridEntry {
        &self.trids[self.active_trid_idx]
    }

    /// Appends an alternate transport id. Alternates always land behind
    /// the currently active id, never before it.
    pub fn add_secondary_trid(&mut self, trid: NvmeTransportId) {
        debug!("{}: adding secondary trid {:?}", self.name, trid);
        self.trids.push(TridEntry {
            trid,
            is_failed: false,
        });
    }

    fn clear_active_trid_failure(&mut self) {
        self.trids[self.active_trid_idx].is_failed = false;
    }

    /// Rotates the active trid to the next entry that has not failed yet.
    /// Returns false when no such alternate exists.
    fn rotate_active_trid(&mut self, remove_active: bool) -> bool {
        let start = if remove_active {
            let removed = self.trids.remove(self.active_trid_idx);
            debug!("{}: removed trid {:?}", self.name, removed.trid);
            if self.trids.is_empty() {
                self.active_trid_idx = 0;
                return false;
            }
            // Removal shifted the next entry into the active position.
            self.active_trid_idx % self.trids.len()
        } else {
            if self.trids.len() < 2 {
                return false;
            }
            (self.active_trid_idx + 1) % self.trids.len()
        };

        let len = self.trids.len();
        let next = (0 .. len)
            .map(|off| (start + off) % len)
            .find(|i| !self.trids[*i].is_failed);

        let next = match next {
            Some(i) => i,
            None => return false,
        };

        self.active_trid_idx = next;
        self.trids[self.active_trid_idx].is_failed = false;
        self.trid_changed = true;

        info!(
            "{}: active trid is now {:?}",
            self.name,
            self.trids[self.active_trid_idx].trid
        );
        true
    }

    fn has_alternate_trid(&self) -> bool {
        self.trids
            .iter()
            .enumerate()
            .any(|(i, e)| i != self.active_trid_idx && !e.is_failed)
    }

    // -- reset -------------------------------------------------------------

    /// Elapsed time of the running reset/reconnect cycle.
    pub fn reset_elapsed(&self) -> Option<Duration> {
        self.reset_start.map(|t| t.elapsed())
    }

    /// Whether queued I/O should fail fast while reconnects continue.
    /// Fast-io-fail wins over an unbounded bdev retry count.
    pub fn fast_io_fail_timedout(&self) -> bool {
        let timeout = nvme_bdev_running_config().fast_io_fail_timeout_sec;
        if timeout == 0 {
            return false;
        }
        self.reset_elapsed()
            .map_or(false, |e| e.as_secs() >= timeout as u64)
    }

    /// Whether a reset cycle is currently active.
    pub fn reset_in_progress(&self) -> bool {
        self.state_machine.has_flag(ControllerFlag::ResetActive)
    }

    /// Whether the controller gave up on I/O entirely.
    pub fn io_unavailable(&self) -> bool {
        matches!(
            self.get_state(),
            Faulted(ControllerFailureReason::ResetTimeout)
                | Unconfiguring
                | Unconfigured
        )
    }

    /// Reset the controller. Upon reset all qpairs are torn down on every
    /// core, the transport is reconnected and the qpairs are recreated.
    /// A reset already in progress rejects new requests with Busy.
    pub fn reset(&mut self, cb: OpCompletion) -> Result<(), CoreError> {
        if self.destruct_pending {
            return Err(CoreError::ResetDispatch {
                source: Errno::ENXIO,
            });
        }

        match self.state_machine.current_state() {
            Running | Faulted(_) | ReconnectDelayed => {}
            state => {
                error!(
                    "{} Controller is in '{:?}' state, reset not possible",
                    self.name, state
                );
                return Err(CoreError::ResetDispatch {
                    source: Errno::EBUSY,
                });
            }
        }

        self.state_machine
            .set_flag_exclusively(ControllerFlag::ResetActive)
            .map_err(|_| {
                error!("{} reset already in progress", self.name);
                CoreError::ResetDispatch {
                    source: Errno::EBUSY,
                }
            })?;

        self.state_machine
            .transition(Resetting)
            .expect("failed to transition controller to Resetting state");

        if self.reset_start.is_none() {
            self.reset_start = Some(Instant::now());
        }

        let inner = self.inner.as_ref().expect("controller has no inner");
        let reset_ctx = ResetCtx {
            name: self.name.clone(),
            cb: Some(cb),
            io_device: inner.io_device.clone(),
            handle: inner.ctrlr.clone(),
            shutdown_in_progress: false,
        };

        debug!("{}: starting reset", self.name);
        // Iterate over all I/O channels and destroy their qpairs one by one.
        inner.io_device.traverse_io_channels(
            reset_ctx,
            NvmeController::_reset_destroy_channels,
            NvmeController::_reset_destroy_channels_done,
        );
        Ok(())
    }

    fn _reset_destroy_channels(
        channel: &mut NvmeIoChannelInner,
        ctx: &mut ResetCtx,
    ) -> i32 {
        // Bail out preliminary if shutdown is active.
        if ctx.shutdown_in_progress {
            return 0;
        }

        if channel.is_shutdown() {
            ctx.shutdown_in_progress = true;
            return 0;
        }

        let rc = channel.reset();
        if rc == 0 {
            debug!("{}: I/O channel successfully reset", ctx.name);
        } else {
            error!(
                "{}: failed to reset I/O channel (rc={}), reset aborted",
                ctx.name, rc
            );
        }
        rc
    }

    fn _reset_destroy_channels_done(status: i32, ctx: ResetCtx) {
        if status != 0 {
            error!(
                "{}: controller reset failed with status = {}",
                ctx.name, status
            );
            NvmeController::_complete_reset(ctx, status);
            return;
        }

        debug!("{}: all I/O channels successfully reset", ctx.name);

        // In case shutdown is active, don't reconnect the controller as it
        // is being removed.
        if ctx.shutdown_in_progress {
            warn!(
                "{}: controller shutdown detected, skipping reset",
                ctx.name
            );
            return;
        }

        if ctx.handle.is_removed() {
            warn!("{}: controller removed, reset failed", ctx.name);
            NvmeController::_complete_reset(ctx, Errno::ENODEV as i32);
            return;
        }

        // A rotated trid requires a full transport reconnect; otherwise a
        // controller-level reset over the existing attachment suffices.
        let reconnect = NVME_CONTROLLERS
            .lookup_by_name(&ctx.name)
            .map_or(false, |c| c.lock().trid_changed);

        if reconnect {
            NvmeController::_reset_reconnect_transport(ctx);
        } else {
            match ctx.handle.reset() {
                Ok(()) => NvmeController::_reset_recreate_channels(ctx),
                Err(e) => {
                    error!(
                        "{} failed to reset controller, rc = -{}",
                        ctx.name, e as i32
                    );
                    NvmeController::_complete_reset(ctx, e as i32);
                }
            }
        }
    }

    /// Connects to the (rotated) active trid and swaps the transport
    /// handle on success.
    fn _reset_reconnect_transport(ctx: ResetCtx) {
        let (transport, opts, trid) = match NVME_CONTROLLERS
            .lookup_by_name(&ctx.name)
        {
            Some(c) => {
                let c = c.lock();
                (
                    c.transport.clone(),
                    c.opts.clone(),
                    c.active_trid().trid.clone(),
                )
            }
            None => {
                NvmeController::_complete_reset(ctx, Errno::ENODEV as i32);
                return;
            }
        };

        info!("{}: reconnecting via {:?}", ctx.name, trid);

        let mut probe = match transport.connect(&trid, &opts) {
            Ok(p) => p,
            Err(_) => {
                NvmeController::_complete_reset(
                    ctx,
                    Errno::ECONNREFUSED as i32,
                );
                return;
            }
        };

        let mut pending = Some(ctx);
        poller::register_detached(
            "nvme_reconnect_probe",
            Duration::from_millis(1),
            move || match probe.poll() {
                ProbeStatus::Pending => 0,
                ProbeStatus::Failed(e) => {
                    let ctx = pending.take().expect("probe fired twice");
                    error!("{}: reconnect failed: {}", ctx.name, e);
                    NvmeController::_complete_reset(ctx, e as i32);
                    -1
                }
                ProbeStatus::Ready(new_ctrlr) => {
                    let mut ctx = pending.take().expect("probe fired twice");

                    if let Some(c) = NVME_CONTROLLERS.lookup_by_name(&ctx.name)
                    {
                        let mut controller = c.lock();
                        controller.trid_changed = false;
                        if let Some(inner) = controller.inner.as_mut() {
                            inner.ctrlr = new_ctrlr.clone();
                        }
                        register_aer_callback(
                            &new_ctrlr,
                            controller.name.clone(),
                        );
                    }

                    ctx.handle = new_ctrlr;
                    NvmeController::_reset_recreate_channels(ctx);
                    -1
                }
            },
        );
    }

    fn _reset_recreate_channels(ctx: ResetCtx) {
        debug!(
            "{}: controller successfully reset, reinitializing I/O channels",
            ctx.name
        );

        let io_device = ctx.io_device.clone();
        io_device.traverse_io_channels(
            ctx,
            NvmeController::_reset_create_channels,
            NvmeController::_reset_create_channels_done,
        );
    }

    fn _reset_create_channels(
        channel: &mut NvmeIoChannelInner,
        reset_ctx: &mut ResetCtx,
    ) -> i32 {
        // Make sure no concurrent shutdown takes place.
        if channel.is_shutdown() {
            return 0;
        }

        debug!("{}: reinitializing I/O channel", reset_ctx.name);
        let rc = channel.reinitialize(&reset_ctx.name, &reset_ctx.handle);
        if rc != 0 {
            error!(
                "{} failed to reinitialize I/O channel, rc = {}",
                reset_ctx.name, rc
            );
        }
        rc
    }

    fn _reset_create_channels_done(status: i32, reset_ctx: ResetCtx) {
        debug!(
            "{} controller reset completed, status = {}",
            reset_ctx.name, status
        );
        NvmeController::_complete_reset(reset_ctx, status);
    }

    fn _complete_reset(mut reset_ctx: ResetCtx, status: i32) {
        let success = status == 0;

        // Lookup controller carefully, as it can be removed while reset
        // in progress.
        let mut destruct = false;
        if let Some(c) = NVME_CONTROLLERS.lookup_by_name(&reset_ctx.name) {
            let mut controller = c.lock();

            controller
                .state_machine
                .clear_flag_exclusively(ControllerFlag::ResetActive)
                .expect("Reset flag improperly cleared during reset");

            if success {
                let _ = controller
                    .state_machine
                    .transition_checked(Resetting, Running);
                controller.clear_active_trid_failure();
                controller.reset_start = None;
            } else {
                let _ = controller.state_machine.transition_checked(
                    Resetting,
                    Faulted(ControllerFailureReason::ResetFailed),
                );
                let idx = controller.active_trid_idx;
                controller.trids[idx].is_failed = true;
            }

            destruct = controller.destruct_pending;
        }

        // Drain pending resets on every channel with the final status; the
        // drain itself happens channel by channel on the owning cores.
        let drain_status = if success {
            IoStatus::Success
        } else {
            IoStatus::Failed
        };
        fn drain_channel(
            channel: &mut NvmeIoChannelInner,
            status: &mut IoStatus,
        ) -> i32 {
            channel.drain_pending_resets(*status);
            channel.flush_queued_reqs();
            0
        }

        fn drain_done(_status: i32, _ctx: IoStatus) {}

        reset_ctx
            .io_device
            .traverse_io_channels(drain_status, drain_channel, drain_done);

        if let Some(cb) = reset_ctx.cb.take() {
            cb(success);
        }

        if destruct {
            debug!(
                "{}: continuing deferred shutdown after reset",
                reset_ctx.name
            );
            return;
        }

        if !success {
            NvmeController::handle_reset_failure(&reset_ctx.name);
        }
    }

    /// Picks the next step after a failed reset: trid rotation, immediate
    /// destruction, a delayed reconnect, or giving up.
    fn handle_reset_failure(name: &str) {
        let carc = match NVME_CONTROLLERS.lookup_by_name(name) {
            Some(c) => c,
            None => return,
        };

        let cfg = nvme_bdev_running_config();
        let mut controller = carc.lock();

        // The loss budget bounds the whole reconnect cycle.
        if cfg.ctrlr_loss_timeout_sec > 0 {
            if let Some(elapsed) = controller.reset_elapsed() {
                if elapsed.as_secs() >= cfg.ctrlr_loss_timeout_sec as u64 {
                    error!(
                        "{}: controller loss timeout expired, giving up",
                        name
                    );
                    let _ = controller.state_machine.transition(Faulted(
                        ControllerFailureReason::ResetTimeout,
                    ));
                    drop(controller);
                    schedule_destroy(name);
                    return;
                }
            }
        }

        if controller.has_alternate_trid() {
            // Rotate and retry right away on the alternate path.
            controller.rotate_active_trid(false);
            let name = name.to_string();
            drop(controller);
            Reactors::current()
                .expect("reset completion must run on a reactor")
                .send_msg(move || retry_reset(&name));
            return;
        }

        if cfg.ctrlr_loss_timeout_sec == 0 {
            info!("{}: no reconnect policy, deleting controller", name);
            drop(controller);
            schedule_destroy(name);
            return;
        }

        if cfg.reconnect_delay_sec > 0 {
            let _ = controller.state_machine.transition(ReconnectDelayed);
            let delay = Duration::from_secs(cfg.reconnect_delay_sec as u64);
            let name = name.to_string();
            drop(controller);

            debug!("arming reconnect timer ({:?})", delay);
            Reactors::current()
                .expect("reset completion must run on a reactor")
                .send_future(async move {
                    crate::core::engine_sleep(delay).await.ok();
                    retry_reset(&name);
                });
        }
        // Without a reconnect delay the controller stays Faulted until an
        // explicit reset or shutdown.
    }

    // -- failover ----------------------------------------------------------

    /// Fails the active path over to the next transport id. Rejected while
    /// a reset is in progress or the controller is being destructed.
    pub fn failover(
        &mut self,
        remove_active_trid: bool,
    ) -> Result<(), CoreError> {
        if self.destruct_pending
            || matches!(self.get_state(), Unconfiguring | Unconfigured)
        {
            return Err(CoreError::ResetDispatch {
                source: Errno::ENXIO,
            });
        }
        if self.state_machine.has_flag(ControllerFlag::ResetActive) {
            return Err(CoreError::ResetDispatch {
                source: Errno::EBUSY,
            });
        }

        self.trids[self.active_trid_idx].is_failed = true;

        if !self.rotate_active_trid(remove_active_trid) {
            warn!("{}: no alternate trid to fail over to", self.name);

            let cfg = nvme_bdev_running_config();
            if cfg.ctrlr_loss_timeout_sec == 0 {
                schedule_destroy(&self.name);
                return Ok(());
            }

            // Arm the reconnect path against the sole (failed) trid.
            if self.trids.is_empty() {
                return Err(CoreError::ResetDispatch {
                    source: Errno::ENXIO,
                });
            }
        }

        self.reset(Box::new(|success| {
            debug!("failover reset completed, success = {}", success);
        }))
    }

    // -- ANA ---------------------------------------------------------------

    /// Issues an ANA log page read and applies the result to the attached
    /// namespaces. Only one read is in flight at a time; a second request
    /// is rejected with Busy.
    pub fn update_ana_states(&mut self) -> Result<(), CoreError> {
        self.state_machine
            .set_flag_exclusively(ControllerFlag::AnaLogUpdateActive)
            .map_err(|_| CoreError::ControllerBusy {
                source: Errno::EBUSY,
                name: self.name.clone(),
            })?;

        let inner = match self.inner.as_ref() {
            Some(i) => i,
            None => {
                let _ = self
                    .state_machine
                    .clear_flag_exclusively(ControllerFlag::AnaLogUpdateActive);
                return Err(CoreError::DeviceRemoved {
                    name: self.name.clone(),
                });
            }
        };

        for ns in &inner.namespaces {
            ns.set_ana_state_updating(true);
        }

        let name = self.name.clone();
        let result = inner.ctrlr.get_ana_log_page(Box::new(move |result| {
            apply_ana_log_page(&name, result);
        }));

        if let Err(e) = result {
            for ns in &inner.namespaces {
                ns.set_ana_state_updating(false);
            }
            let _ = self
                .state_machine
                .clear_flag_exclusively(ControllerFlag::AnaLogUpdateActive);
            return Err(CoreError::NvmeAdminDispatch {
                source: e,
                opcode: 0x02,
            });
        }

        Ok(())
    }

    // -- shutdown ----------------------------------------------------------

    /// Shutdown the controller and all its resources: all I/O channels are
    /// torn down, active I/O is aborted and the transport is failed.
    pub fn shutdown(&mut self, cb: OpCompletion) -> Result<(), CoreError> {
        if self.state_machine.has_flag(ControllerFlag::ResetActive) {
            // Deferred until the running reset completes.
            self.destruct_pending = true;
            return Err(CoreError::ControllerBusy {
                source: Errno::EAGAIN,
                name: self.name.clone(),
            });
        }

        self.state_machine.transition(Unconfiguring).map_err(|_| {
            error!(
                "{} controller is in {} state, cannot shutdown",
                self.name,
                self.state_machine.current_state(),
            );
            CoreError::ResetDispatch {
                source: Errno::EBUSY,
            }
        })?;

        debug!("{} shutting down the controller", self.name);

        let ctx = ShutdownCtx {
            name: self.get_name(),
            cb: Some(cb),
        };

        let inner = self.inner.as_ref().expect("controller has no inner");
        inner.io_device.traverse_io_channels(
            ctx,
            NvmeController::_shutdown_channels,
            NvmeController::_shutdown_channels_done,
        );

        Ok(())
    }

    fn _shutdown_channels(
        channel: &mut NvmeIoChannelInner,
        ctx: &mut ShutdownCtx,
    ) -> i32 {
        debug!("{}: shutting down I/O channel", ctx.name);
        channel.shutdown()
    }

    fn _shutdown_channels_done(result: i32, mut ctx: ShutdownCtx) {
        debug!("{} all I/O channels shut down", ctx.name);

        let controller = NVME_CONTROLLERS
            .lookup_by_name(&ctx.name)
            .expect("Controller disappeared while being shutdown");
        let mut controller = controller.lock();

        if result != 0 {
            error!(
                "{} failed to shutdown I/O channels, rc = {}. Shutdown aborted.",
                ctx.name, result
            );
            let _ = controller.state_machine.transition(Faulted(
                ControllerFailureReason::Shutdown,
            ));
            if let Some(cb) = ctx.cb.take() {
                cb(false);
            }
            return;
        }

        // Fail the controller to complete all remaining requests after all
        // I/O channels are closed.
        if let Some(inner) = controller.inner.as_mut() {
            inner.ctrlr.fail();
            inner.namespaces.clear();
        }

        controller
            .state_machine
            .transition(Unconfigured)
            .expect("failed to transition controller to Unconfigured state");

        drop(controller);
        debug!("{} shutdown complete", ctx.name);
        if let Some(cb) = ctx.cb.take() {
            cb(true);
        }
    }

    // -- events ------------------------------------------------------------

    /// Notifies all listeners of this controller.
    fn notify_listeners(&self, event: DeviceEventType) -> usize {
        self.event_dispatcher.dispatch_event(event, &self.name)
    }

    /// Register listener to monitor device events related to this
    /// controller.
    pub fn register_device_listener(
        &self,
        listener: DeviceEventSink,
    ) -> Result<(), CoreError> {
        self.event_dispatcher.add_listener(listener);
        debug!("{} added event listener", self.name);
        Ok(())
    }

    fn populate_namespaces(&mut self) -> bool {
        let name = self.name.clone();
        let inner = self.inner.as_mut().expect("no inner controller yet");

        let namespaces = inner
            .ctrlr
            .active_ns_list()
            .into_iter()
            .filter_map(|nsid| inner.ctrlr.namespace(nsid))
            .map(|ns| Arc::new(NvmeNamespace::new(&name, ns)))
            .collect::<Vec<_>>();

        if namespaces.is_empty() {
            warn!(
                "{}: no active namespaces reported by the NVMe controller",
                self.name
            );
        } else {
            debug!(
                "{}: {} namespace(s) successfully populated",
                self.name,
                namespaces.len()
            );
        }

        let ok = !namespaces.is_empty();
        inner.namespaces = namespaces;

        if !ok {
            self.state_machine
                .transition(Faulted(ControllerFailureReason::NamespaceInit))
                .expect("failed to fault controller on ns enumeration failure");
        }

        ok
    }
}

impl Drop for NvmeController {
    fn drop(&mut self) {
        let curr_state = self.get_state();
        debug!("{} dropping controller (state={:?})", self.name, curr_state);

        // Controller must be properly unconfigured to prevent dangerous
        // side-effects, like active qpairs referring to a gone controller.
        assert!(
            matches!(curr_state, New | Unconfigured),
            "{} dropping active controller in {:?} state",
            self.name,
            curr_state
        );

        if let Some(inner) = self.inner.take() {
            debug!("{}: stopping admin queue poller", self.name);
            inner.adminq_poller.stop();
            drop(inner.io_device);
            info!("{}: NVMe controller successfully detached", self.name);
        }
    }
}

/// Poll to process completions on the admin queue. A persistent failure is
/// reported to the controller's listeners exactly once.
fn nvme_poll_adminq(
    name: &str,
    ctrlr: &Arc<dyn TransportCtrlr>,
    failure_reported: &mut bool,
) -> i32 {
    let result = ctrlr.process_admin_completions();

    if result < 0 {
        if !*failure_reported {
            *failure_reported = true;
            error!(
                "{}: process adminq failed: {}",
                name,
                Errno::from_i32(-result)
            );

            if let Some(c) = NVME_CONTROLLERS.lookup_by_name(name) {
                let controller = c.lock();
                let num_listeners = controller.notify_listeners(
                    DeviceEventType::AdminCommandCompletionFailed,
                );
                debug!(
                    "{}: {} listeners notified of admin command completion failure",
                    name, num_listeners
                );
            }
        }
        return 1;
    }

    *failure_reported = false;
    if result == 0 {
        0
    } else {
        1
    }
}

/// Applies a completed ANA log page read to the controller's namespaces.
fn apply_ana_log_page(name: &str, result: Result<Vec<u8>, Errno>) {
    let carc = match NVME_CONTROLLERS.lookup_by_name(name) {
        Some(c) => c,
        None => return,
    };
    let controller = carc.lock();

    let namespaces = controller.namespaces();

    match result.map_err(|e| CoreError::NvmeAdminDispatch {
        source: e,
        opcode: 0x02,
    }) {
        Ok(buf) => match AnaLogPage::decode(&buf) {
            Ok(page) => {
                for group in &page.groups {
                    for ns in namespaces
                        .iter()
                        .filter(|ns| ns.ana_group_id() == group.ana_group_id)
                    {
                        debug!(
                            "{}: nsid {} ANA state -> {:?}",
                            name,
                            ns.nsid(),
                            group.ana_state
                        );
                        ns.set_ana_state(group.ana_state);
                    }
                }
            }
            Err(e) => {
                error!("{}: malformed ANA log page: {:?}", name, e);
            }
        },
        Err(e) => {
            error!("{}: ANA log page read failed: {:?}", name, e);
        }
    }

    for ns in &namespaces {
        ns.set_ana_state_updating(false);
    }

    let _ = controller
        .state_machine
        .clear_flag_exclusively(ControllerFlag::AnaLogUpdateActive);
}

/// AER dispatch: ANA changes refresh the log page, namespace attribute
/// changes re-read the geometry.
fn register_aer_callback(ctrlr: &Arc<dyn TransportCtrlr>, name: String) {
    ctrlr.set_aer_callback(Box::new(move |event| {
        debug!("{}: received AER event: {:?}", name, event);
        match event {
            AsyncEvent::AnaChange => {
                if let Some(c) = NVME_CONTROLLERS.lookup_by_name(&name) {
                    let mut controller = c.lock();
                    if let Err(e) = controller.update_ana_states() {
                        // An update is already in flight; the states it
                        // applies will reflect this change too.
                        debug!("{}: ANA update not started: {}", name, e);
                    }
                }
            }
            AsyncEvent::NsAttrChanged(nsid) => {
                super::device::nvme_bdev_ns_changed(&name, nsid);
            }
            AsyncEvent::ReservationLogAvail => {
                debug!("{}: reservation log available", name);
            }
        }
    }));
}

/// Retries a reset after trid rotation or a reconnect delay.
fn retry_reset(name: &str) {
    let carc = match NVME_CONTROLLERS.lookup_by_name(name) {
        Some(c) => c,
        None => return,
    };

    let mut controller = carc.lock();
    if let Err(e) = controller.reset(Box::new(|success| {
        debug!("scheduled reset completed, success = {}", success);
    })) {
        warn!("{}: scheduled reset not started: {}", controller.name, e);
    }
}

/// Initiates a reset in response to a failed qpair detected by a channel
/// poller.
pub(super) fn reset_on_qpair_failure(name: &str) {
    let carc = match NVME_CONTROLLERS.lookup_by_name(name) {
        Some(c) => c,
        None => return,
    };

    let mut controller = carc.lock();
    if controller.get_state() != Running {
        return;
    }

    warn!("{}: resetting controller after qpair failure", name);
    if let Err(e) = controller.reset(Box::new(|success| {
        debug!("qpair failure reset completed, success = {}", success);
    })) {
        debug!("{}: reset not started: {}", name, e);
    }
}

/// Schedules asynchronous controller destruction from a context that may
/// hold no locks afterwards.
fn schedule_destroy(name: &str) {
    let name = name.to_string();
    Reactors::primary().send_future(async move {
        if let Err(e) = destroy_device(name.clone()).await {
            error!("{}: deferred destroy failed: {:?}", name, e);
        }
    });
}

/// Connects a controller and inserts it into the global list. The future
/// resolves once the controller is Running with namespaces populated.
pub async fn connect_controller(
    name: &str,
    trid: NvmeTransportId,
    transport: Arc<dyn NvmeTransport>,
    opts: options::NvmeControllerOpts,
) -> Result<(), CoreError> {
    if NVME_CONTROLLERS.lookup_by_name(name).is_some() {
        return Err(CoreError::BdevAlreadyExists {
            name: String::from(name),
        });
    }

    let controller =
        NvmeController::new(name, trid.clone(), transport.clone(), opts.clone());
    NVME_CONTROLLERS
        .insert_controller(String::from(name), Arc::new(Mutex::new(controller)));

    let mut probe = match transport.connect(&trid, &opts) {
        Ok(p) => p,
        Err(e) => {
            NVME_CONTROLLERS.remove_by_name(name).ok();
            return Err(e);
        }
    };

    let (s, r) = oneshot::channel::<Result<(), Errno>>();
    let probe_name = String::from(name);
    let mut sender = Some(s);

    poller::register_detached(
        "nvme_attach_probe",
        Duration::from_millis(1),
        move || match probe.poll() {
            ProbeStatus::Pending => 0,
            ProbeStatus::Failed(e) => {
                sender.take().map(|s| s.send(Err(e)).ok());
                -1
            }
            ProbeStatus::Ready(ctrlr) => {
                let result = connected_attach_cb(&probe_name, ctrlr);
                sender.take().map(|s| s.send(result).ok());
                -1
            }
        },
    );

    let result = r.await.expect("attach probe poller vanished");

    match result {
        Ok(()) => Ok(()),
        Err(e) => {
            NVME_CONTROLLERS.remove_by_name(name).ok();
            Err(CoreError::OpenBdev {
                source: e,
            })
        }
    }
}

/// Finalizes controller attachment once the transport probe delivered the
/// controller handle.
fn connected_attach_cb(
    name: &str,
    ctrlr: Arc<dyn TransportCtrlr>,
) -> Result<(), Errno> {
    let carc = NVME_CONTROLLERS
        .lookup_by_name(name)
        .expect("no controller in the list");

    let mut controller = carc.lock();
    controller
        .state_machine
        .transition(Initializing)
        .expect("failed to transition controller into Initializing state");

    let cid = CONTROLLER_IDS.fetch_add(1, Ordering::Relaxed);
    controller.set_id(cid);
    controller.inner = Some(NvmeControllerInner::new(
        ctrlr.clone(),
        controller.get_name(),
    ));

    if !controller.populate_namespaces() {
        error!("{}: failed to populate namespaces", name);
        return Err(Errno::ENXIO);
    }

    register_aer_callback(&ctrlr, controller.get_name());

    controller
        .state_machine
        .transition(Running)
        .expect("failed to transition controller into Running state");

    info!("{}: NVMe controller successfully attached", name);
    Ok(())
}

/// Destroy target controller and notify all listeners about device removal.
pub async fn destroy_device(name: String) -> Result<(), CoreError> {
    let carc = NVME_CONTROLLERS.lookup_by_name(&name).ok_or(
        CoreError::BdevNotFound {
            name: String::from(&name),
        },
    )?;

    // 1. Detach the controller's namespaces from their bdevs, so no new
    // I/O paths reference it.
    super::device::detach_controller(&name);

    // 2. Initiate controller shutdown, which shuts down all I/O resources
    // of the controller. A reset in flight defers the shutdown; retry
    // until the reset cycle notices the pending destruct.
    loop {
        let (s, r) = oneshot::channel::<bool>();
        let result = {
            let mut controller = carc.lock();

            if matches!(controller.get_state(), New | Unconfigured) {
                break;
            }

            controller.shutdown(Box::new(move |success| {
                s.send(success).ok();
            }))
        };

        match result {
            Ok(()) => {
                if !r.await.unwrap_or(false) {
                    error!("{:?}: failed to shutdown controller", name);
                    return Err(CoreError::ResetFailed {});
                }
                break;
            }
            Err(CoreError::ControllerBusy {
                ..
            }) => {
                // Reset in progress; it will see destruct_pending.
                crate::core::engine_sleep(Duration::from_millis(10))
                    .await
                    .ok();
            }
            Err(e) => return Err(e),
        }
    }

    // 3. Remove controller from the list so that a new controller with the
    // same name can be inserted.
    if NVME_CONTROLLERS.remove_by_name(&name).is_err() {
        warn!("{}: no controller record found, proceeding with removal", name);
    } else {
        debug!("{}: removed from controller list", name);
    }

    debug!("{}: notifying listeners about device removal", name);
    {
        let controller = carc.lock();
        let num_listeners =
            controller.notify_listeners(DeviceEventType::DeviceRemoved);
        debug!(
            "{}: {} listeners notified about device removal",
            name, num_listeners
        );
    }

    Ok(())
}

pub mod options {
    /// Structure that holds the NVMe controller options; exposes more
    /// control over the connection than the per-bdev defaults.
    #[derive(Debug, Clone)]
    pub struct NvmeControllerOpts {
        admin_timeout_ms: u32,
        keep_alive_timeout_ms: u32,
        transport_retry_count: u8,
        fabrics_connect_timeout_us: u64,
        host_nqn: String,
    }

    impl NvmeControllerOpts {
        pub fn admin_timeout_ms(&self) -> u32 {
            self.admin_timeout_ms
        }

        pub fn keep_alive_timeout_ms(&self) -> u32 {
            self.keep_alive_timeout_ms
        }

        pub fn transport_retry_count(&self) -> u8 {
            self.transport_retry_count
        }

        pub fn host_nqn(&self) -> &str {
            &self.host_nqn
        }
    }

    impl Default for NvmeControllerOpts {
        fn default() -> Self {
            let cfg = crate::bdev::nvmx::nvme_bdev_running_config();
            Self {
                admin_timeout_ms: (cfg.timeout_admin_us / 1_000) as u32,
                keep_alive_timeout_ms: cfg.keep_alive_timeout_ms,
                transport_retry_count: cfg.transport_retry_count as u8,
                fabrics_connect_timeout_us: 1_000_000,
                host_nqn: format!(
                    "{}:host",
                    crate::constants::NVME_NQN_PREFIX
                ),
            }
        }
    }

    #[derive(Debug, Default)]
    pub struct Builder {
        admin_timeout_ms: Option<u32>,
        keep_alive_timeout_ms: Option<u32>,
        transport_retry_count: Option<u8>,
        fabrics_connect_timeout_us: Option<u64>,
        host_nqn: Option<String>,
    }

    #[allow(dead_code)]
    impl Builder {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_admin_timeout_ms(mut self, timeout: u32) -> Self {
            self.admin_timeout_ms = Some(timeout);
            self
        }

        pub fn with_fabrics_connect_timeout_us(mut self, timeout: u64) -> Self {
            self.fabrics_connect_timeout_us = Some(timeout);
            self
        }

        pub fn with_transport_retry_count(mut self, count: u8) -> Self {
            self.transport_retry_count = Some(count);
            self
        }

        pub fn with_keep_alive_timeout_ms(mut self, timeout: u32) -> Self {
            self.keep_alive_timeout_ms = Some(timeout);
            self
        }

        pub fn with_hostnqn<T: Into<String>>(mut self, host_nqn: T) -> Self {
            self.host_nqn = Some(host_nqn.into());
            self
        }

        /// Builder to override default values
        pub fn build(self) -> NvmeControllerOpts {
            let mut opts = NvmeControllerOpts::default();

            if let Some(timeout_ms) = self.admin_timeout_ms {
                opts.admin_timeout_ms = timeout_ms;
            }
            if let Some(timeout_us) = self.fabrics_connect_timeout_us {
                opts.fabrics_connect_timeout_us = timeout_us;
            }
            if let Some(retries) = self.transport_retry_count {
                opts.transport_retry_count = retries;
            }
            if let Some(timeout_ms) = self.keep_alive_timeout_ms {
                opts.keep_alive_timeout_ms = timeout_ms;
            }
            if let Some(host_nqn) = self.host_nqn {
                opts.host_nqn = host_nqn;
            }

            opts
        }
    }

    #[cfg(test)]
    mod test {
        use super::*;

        #[test]
        fn nvme_default_controller_options() {
            let opts = Builder::new()
                .with_admin_timeout_ms(1)
                .with_fabrics_connect_timeout_us(1)
                .with_transport_retry_count(1)
                .build();

            assert_eq!(opts.admin_timeout_ms, 1);
            assert_eq!(opts.fabrics_connect_timeout_us, 1);
            assert_eq!(opts.transport_retry_count, 1);
        }
    }
}
