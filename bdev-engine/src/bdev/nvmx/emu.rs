//! The loopback NVMe target: an in-memory subsystem reachable through the
//! transport traits. It backs namespaces with process memory, delivers
//! completions asynchronously through queue polling, and exposes the
//! failure injection knobs (connect failures, status injection, controller
//! removal, qpair loss) that drive the reset and failover machinery.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering},
        Arc,
        Weak,
    },
};

use nix::errno::Errno;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::core::{
    CoreError,
    GenericStatusCode,
    MediaErrorStatusCode,
    NvmeCommandStatus,
    NvmeStatus,
};

use super::{
    controller::options::NvmeControllerOpts,
    transport::{
        NvmeCompletion,
        NvmeRequest,
        NvmeRequestCb,
        NvmeRequestOp,
        NvmeTransport,
        NvmeTransportId,
        ProbeStatus,
        TransportCtrlr,
        TransportNamespace,
        TransportProbe,
        TransportQpair,
    },
    utils::{AnaGroupDescriptor, AnaLogPage, AnaState, AsyncEvent},
};

/// Default submission queue depth of emulated qpairs.
const EMU_DEFAULT_SQ_DEPTH: u32 = 128;

/// Callbacks ride controller queues between creation and delivery; both
/// happen on the controller's owner reactor.
struct SendCb<T>(T);

unsafe impl<T> Send for SendCb<T> {}

/// Listen addresses of all emulated subsystems.
static EMU_TARGETS: Lazy<Mutex<HashMap<String, Arc<EmuSubsystem>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// A namespace of an emulated subsystem.
pub struct EmuNamespace {
    nsid: u32,
    uuid: Uuid,
    block_len: u32,
    num_blocks: AtomicU64,
    ana_group: u32,
    data: Mutex<Vec<u8>>,
}

impl EmuNamespace {
    /// Raw view of the namespace contents; test helper.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl TransportNamespace for EmuNamespace {
    fn nsid(&self) -> u32 {
        self.nsid
    }

    fn uuid(&self) -> Option<Uuid> {
        Some(self.uuid)
    }

    fn nguid(&self) -> Option<[u8; 16]> {
        Some(*self.uuid.as_bytes())
    }

    fn eui64(&self) -> Option<[u8; 8]> {
        None
    }

    fn csi(&self) -> u8 {
        // NVM command set.
        0
    }

    fn num_sectors(&self) -> u64 {
        self.num_blocks.load(Ordering::Acquire)
    }

    fn sector_size(&self) -> u32 {
        self.block_len
    }

    fn md_size(&self) -> u32 {
        0
    }

    fn optimal_io_boundary(&self) -> u64 {
        0
    }

    fn supports_compare(&self) -> bool {
        true
    }

    fn supports_deallocate(&self) -> bool {
        true
    }

    fn supports_write_zeroes(&self) -> bool {
        true
    }

    fn ana_group_id(&self) -> u32 {
        self.ana_group
    }
}

/// An emulated NVMe subsystem: namespaces, ANA groups, listeners and the
/// failure injection state shared by its controllers.
pub struct EmuSubsystem {
    nqn: String,
    namespaces: Mutex<HashMap<u32, Arc<EmuNamespace>>>,
    ana_states: Mutex<HashMap<u32, AnaState>>,
    ana_change_count: AtomicU64,
    next_cntlid: AtomicU16,
    fixed_cntlid: AtomicU16,
    removed: AtomicBool,
    fail_connect_count: AtomicU32,
    fail_qpairs: AtomicBool,
    resets: AtomicU64,
    sq_depth: AtomicU32,
    inject_io_errors: Mutex<VecDeque<NvmeCommandStatus>>,
    controllers: Mutex<Vec<Weak<EmuCtrlr>>>,
}

impl EmuSubsystem {
    pub fn create(nqn: &str) -> Arc<EmuSubsystem> {
        Arc::new(EmuSubsystem {
            nqn: String::from(nqn),
            namespaces: Mutex::new(HashMap::new()),
            ana_states: Mutex::new(HashMap::new()),
            ana_change_count: AtomicU64::new(0),
            next_cntlid: AtomicU16::new(1),
            fixed_cntlid: AtomicU16::new(0),
            removed: AtomicBool::new(false),
            fail_connect_count: AtomicU32::new(0),
            fail_qpairs: AtomicBool::new(false),
            resets: AtomicU64::new(0),
            sq_depth: AtomicU32::new(EMU_DEFAULT_SQ_DEPTH),
            inject_io_errors: Mutex::new(VecDeque::new()),
            controllers: Mutex::new(Vec::new()),
        })
    }

    pub fn nqn(&self) -> &str {
        &self.nqn
    }

    /// Makes the subsystem reachable on the given address.
    pub fn listen(self: &Arc<Self>, traddr: &str, svcid: &str) {
        let addr = format!("{}:{}", traddr, svcid);
        info!("{}: emulated subsystem listening on {}", self.nqn, addr);
        EMU_TARGETS.lock().insert(addr, self.clone());
    }

    /// Stops listening on the given address.
    pub fn unlisten(&self, traddr: &str, svcid: &str) {
        EMU_TARGETS.lock().remove(&format!("{}:{}", traddr, svcid));
    }

    /// Adds a namespace backed by zeroed memory.
    pub fn add_namespace(
        &self,
        nsid: u32,
        num_blocks: u64,
        block_len: u32,
        ana_group: u32,
    ) -> Arc<EmuNamespace> {
        let ns = Arc::new(EmuNamespace {
            nsid,
            uuid: Uuid::new_v4(),
            block_len,
            num_blocks: AtomicU64::new(num_blocks),
            ana_group,
            data: Mutex::new(vec![0; (num_blocks * block_len as u64) as usize]),
        });

        self.namespaces.lock().insert(nsid, ns.clone());
        self.ana_states
            .lock()
            .entry(ana_group)
            .or_insert(AnaState::Optimized);
        ns
    }

    /// Adds a namespace sharing identity and data with an existing one;
    /// used to present one namespace through a second subsystem.
    pub fn add_shared_namespace(&self, ns: &Arc<EmuNamespace>) {
        self.namespaces.lock().insert(ns.nsid, ns.clone());
        self.ana_states
            .lock()
            .entry(ns.ana_group)
            .or_insert(AnaState::Optimized);
    }

    /// Changes the state of an ANA group; controllers receive an ANA-change
    /// async event.
    pub fn set_ana_state(&self, ana_group: u32, state: AnaState) {
        self.ana_states.lock().insert(ana_group, state);
        self.ana_change_count.fetch_add(1, Ordering::AcqRel);
        self.post_aer(AsyncEvent::AnaChange);
    }

    pub fn ana_state(&self, ana_group: u32) -> AnaState {
        *self
            .ana_states
            .lock()
            .get(&ana_group)
            .unwrap_or(&AnaState::Optimized)
    }

    /// Grows or shrinks a namespace; controllers receive an attribute
    /// changed event.
    pub fn resize_namespace(&self, nsid: u32, num_blocks: u64) {
        if let Some(ns) = self.namespaces.lock().get(&nsid) {
            ns.num_blocks.store(num_blocks, Ordering::Release);
            ns.data
                .lock()
                .resize((num_blocks * ns.block_len as u64) as usize, 0);
        }
        self.post_aer(AsyncEvent::NsAttrChanged(nsid));
    }

    /// The next `count` I/O submissions complete with `status`.
    pub fn inject_io_error(&self, status: NvmeCommandStatus, count: usize) {
        let mut q = self.inject_io_errors.lock();
        for _ in 0 .. count {
            q.push_back(status);
        }
    }

    /// Fails the next `count` connect and controller-reset attempts.
    pub fn fail_next_connects(&self, count: u32) {
        self.fail_connect_count.store(count, Ordering::Release);
    }

    pub fn pending_connect_failures(&self) -> u32 {
        self.fail_connect_count.load(Ordering::Acquire)
    }

    /// Marks every qpair of this subsystem failed (transport loss).
    pub fn fail_qpairs(&self, fail: bool) {
        self.fail_qpairs.store(fail, Ordering::Release);
    }

    /// Number of controller-level reset attempts seen by this subsystem.
    pub fn reset_count(&self) -> u64 {
        self.resets.load(Ordering::Acquire)
    }

    /// Simulates surprise removal of the subsystem.
    pub fn remove(&self) {
        warn!("{}: emulated subsystem removed", self.nqn);
        self.removed.store(true, Ordering::Release);
    }

    pub fn restore(&self) {
        self.removed.store(false, Ordering::Release);
    }

    /// Caps emulated submission queues; queue-full submissions see ENOMEM.
    pub fn set_sq_depth(&self, depth: u32) {
        self.sq_depth.store(depth, Ordering::Release);
    }

    /// Forces the cntlid the next controllers report; zero restores
    /// sequential allocation.
    pub fn set_fixed_cntlid(&self, cntlid: u16) {
        self.fixed_cntlid.store(cntlid, Ordering::Release);
    }

    fn alloc_cntlid(&self) -> u16 {
        let fixed = self.fixed_cntlid.load(Ordering::Acquire);
        if fixed != 0 {
            fixed
        } else {
            self.next_cntlid.fetch_add(1, Ordering::AcqRel)
        }
    }

    fn post_aer(&self, event: AsyncEvent) {
        let mut ctrlrs = self.controllers.lock();
        ctrlrs.retain(|w| w.strong_count() > 0);
        for c in ctrlrs.iter().filter_map(|w| w.upgrade()) {
            c.aer_pending.lock().push_back(event);
        }
    }

    fn build_ana_log_page(&self) -> Vec<u8> {
        let namespaces = self.namespaces.lock();
        let states = self.ana_states.lock();

        let groups = states
            .iter()
            .map(|(group, state)| AnaGroupDescriptor {
                ana_group_id: *group,
                ana_state: *state,
                nsids: namespaces
                    .values()
                    .filter(|ns| ns.ana_group == *group)
                    .map(|ns| ns.nsid)
                    .collect(),
            })
            .collect();

        AnaLogPage {
            change_count: self.ana_change_count.load(Ordering::Acquire),
            groups,
        }
        .encode()
    }
}

type AdminCompletion = SendCb<Box<dyn FnOnce()>>;

/// An emulated controller: one per connect.
pub struct EmuCtrlr {
    subsystem: Arc<EmuSubsystem>,
    cntlid: u16,
    failed: Arc<AtomicBool>,
    aer_cb: Mutex<Option<Arc<dyn Fn(AsyncEvent) + Send + Sync>>>,
    aer_pending: Mutex<VecDeque<AsyncEvent>>,
    admin_queue: Mutex<VecDeque<AdminCompletion>>,
}

impl TransportCtrlr for EmuCtrlr {
    fn cntlid(&self) -> u16 {
        self.cntlid
    }

    fn subnqn(&self) -> String {
        self.subsystem.nqn.clone()
    }

    fn is_removed(&self) -> bool {
        self.subsystem.removed.load(Ordering::Acquire)
    }

    fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    fn fail(&self) {
        self.failed.store(true, Ordering::Release);
    }

    fn reset(&self) -> Result<(), Errno> {
        self.subsystem.resets.fetch_add(1, Ordering::AcqRel);

        if self.is_removed() {
            return Err(Errno::ENODEV);
        }

        let pending =
            self.subsystem.fail_connect_count.load(Ordering::Acquire);
        if pending > 0 {
            self.subsystem
                .fail_connect_count
                .store(pending - 1, Ordering::Release);
            return Err(Errno::ECONNREFUSED);
        }

        self.failed.store(false, Ordering::Release);
        Ok(())
    }

    fn process_admin_completions(&self) -> i32 {
        if self.is_removed() {
            return -(Errno::ENODEV as i32);
        }
        if self.is_failed() {
            return -(Errno::ENXIO as i32);
        }

        let mut processed = 0;

        // Deliver pending async events through the registered callback.
        // The callback runs without the registration lock held: it may
        // take controller locks that other threads hold while swapping
        // the callback.
        loop {
            let event = self.aer_pending.lock().pop_front();
            match event {
                Some(e) => {
                    let cb = self.aer_cb.lock().clone();
                    if let Some(cb) = cb {
                        cb(e);
                    }
                    processed += 1;
                }
                None => break,
            }
        }

        loop {
            let next = self.admin_queue.lock().pop_front();
            match next {
                Some(cpl) => {
                    (cpl.0)();
                    processed += 1;
                }
                None => break,
            }
        }

        processed
    }

    fn admin_cmd(&self, opc: u8, cb: NvmeRequestCb) -> Result<(), Errno> {
        if self.is_removed() {
            return Err(Errno::ENODEV);
        }
        if self.is_failed() {
            return Err(Errno::ENXIO);
        }

        trace!("{}: admin command {:#x} queued", self.subsystem.nqn, opc);

        let status = match self.subsystem.inject_io_errors.lock().pop_front()
        {
            Some(s) => s,
            None => NvmeCommandStatus::success(),
        };

        self.admin_queue
            .lock()
            .push_back(SendCb(Box::new(move || cb(status))));
        Ok(())
    }

    fn get_ana_log_page(
        &self,
        cb: Box<dyn FnOnce(Result<Vec<u8>, Errno>)>,
    ) -> Result<(), Errno> {
        if self.is_removed() {
            return Err(Errno::ENODEV);
        }

        let page = self.subsystem.build_ana_log_page();
        self.admin_queue
            .lock()
            .push_back(SendCb(Box::new(move || cb(Ok(page)))));
        Ok(())
    }

    fn set_aer_callback(&self, cb: Box<dyn Fn(AsyncEvent) + Send + Sync>) {
        *self.aer_cb.lock() = Some(Arc::from(cb));
    }

    fn active_ns_list(&self) -> Vec<u32> {
        let mut ids = self
            .subsystem
            .namespaces
            .lock()
            .keys()
            .copied()
            .collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }

    fn namespace(&self, nsid: u32) -> Option<Arc<dyn TransportNamespace>> {
        self.subsystem
            .namespaces
            .lock()
            .get(&nsid)
            .cloned()
            .map(|ns| ns as Arc<dyn TransportNamespace>)
    }

    fn alloc_io_qpair(&self) -> Result<Box<dyn TransportQpair>, Errno> {
        if self.is_removed() {
            return Err(Errno::ENODEV);
        }

        Ok(Box::new(EmuQpair {
            subsystem: self.subsystem.clone(),
            ctrlr_failed: self.failed_flag(),
            connected: false,
            queue: VecDeque::new(),
        }))
    }
}

impl EmuCtrlr {
    // The qpair observes the controller's failed state without keeping the
    // whole controller alive.
    fn failed_flag(&self) -> Arc<AtomicBool> {
        self.failed.clone()
    }
}

/// An emulated qpair. Submissions apply to the shared namespace data right
/// away; completions are queued and reaped on the next poll.
struct EmuQpair {
    subsystem: Arc<EmuSubsystem>,
    ctrlr_failed: Arc<AtomicBool>,
    connected: bool,
    queue: VecDeque<NvmeCompletion>,
}

impl EmuQpair {
    fn execute(&self, req: &NvmeRequest) -> NvmeCommandStatus {
        if let Some(status) =
            self.subsystem.inject_io_errors.lock().pop_front()
        {
            return status;
        }

        let ns = match self.subsystem.namespaces.lock().get(&req.nsid) {
            Some(ns) => ns.clone(),
            None => {
                return NvmeCommandStatus::error_dnr(NvmeStatus::Generic(
                    GenericStatusCode::InvalidNamespace,
                ))
            }
        };

        let block_len = ns.block_len as u64;
        let start = (req.offset_blocks * block_len) as usize;
        let len = (req.num_blocks * block_len) as usize;

        let mut data = ns.data.lock();
        if start + len > data.len() {
            return NvmeCommandStatus::error_dnr(NvmeStatus::Generic(
                GenericStatusCode::InvalidFieldInCommand,
            ));
        }

        match req.op {
            NvmeRequestOp::Read => {
                let mut at = start;
                for iov in &req.iovs {
                    let dst = unsafe { iov.as_mut_slice() };
                    dst.copy_from_slice(&data[at .. at + dst.len()]);
                    at += dst.len();
                }
            }
            NvmeRequestOp::Write => {
                let mut at = start;
                for iov in &req.iovs {
                    let src = unsafe { iov.as_slice() };
                    data[at .. at + src.len()].copy_from_slice(src);
                    at += src.len();
                }
            }
            NvmeRequestOp::Compare => {
                let mut at = start;
                for iov in &req.iovs {
                    let src = unsafe { iov.as_slice() };
                    if data[at .. at + src.len()] != *src {
                        return NvmeCommandStatus::error(
                            NvmeStatus::MediaError(
                                MediaErrorStatusCode::CompareFailure,
                            ),
                        );
                    }
                    at += src.len();
                }
            }
            NvmeRequestOp::WriteZeroes | NvmeRequestOp::Unmap => {
                data[start .. start + len].fill(0);
            }
            NvmeRequestOp::Flush => {}
        }

        NvmeCommandStatus::success()
    }
}

impl TransportQpair for EmuQpair {
    fn connect(&mut self) -> i32 {
        if self.subsystem.removed.load(Ordering::Acquire) {
            return -(Errno::ENODEV as i32);
        }
        let pending =
            self.subsystem.fail_connect_count.load(Ordering::Acquire);
        if pending > 0 {
            self.subsystem
                .fail_connect_count
                .store(pending - 1, Ordering::Release);
            return -(Errno::ECONNREFUSED as i32);
        }
        self.connected = true;
        0
    }

    fn disconnect(&mut self) -> Vec<NvmeCompletion> {
        self.connected = false;

        // Queued requests abort on disconnect.
        self.queue
            .drain(..)
            .map(|mut c| {
                c.status = NvmeCommandStatus::error(NvmeStatus::Generic(
                    GenericStatusCode::AbortedSqDeletion,
                ));
                c
            })
            .collect()
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn is_failed(&self) -> bool {
        self.subsystem.fail_qpairs.load(Ordering::Acquire)
            || self.ctrlr_failed.load(Ordering::Acquire)
    }

    fn submit(
        &mut self,
        req: NvmeRequest,
    ) -> Result<(), (Errno, NvmeRequest)> {
        if !self.connected || self.is_failed() {
            return Err((Errno::ENXIO, req));
        }
        if self.queue.len()
            >= self.subsystem.sq_depth.load(Ordering::Acquire) as usize
        {
            return Err((Errno::ENOMEM, req));
        }

        let status = self.execute(&req);
        self.queue.push_back(NvmeCompletion {
            tag: req.tag,
            status,
            cb: req.cb,
        });
        Ok(())
    }

    fn process_completions(
        &mut self,
        max: u32,
    ) -> Result<Vec<NvmeCompletion>, Errno> {
        if self.is_failed() {
            return Err(Errno::ENXIO);
        }

        let limit = if max == 0 {
            self.queue.len()
        } else {
            std::cmp::min(max as usize, self.queue.len())
        };

        Ok(self.queue.drain(.. limit).collect())
    }

    fn abort(&mut self, tag: u64) -> Vec<NvmeCompletion> {
        let mut aborted = Vec::new();
        let mut keep = VecDeque::new();

        while let Some(mut c) = self.queue.pop_front() {
            if c.tag == tag {
                c.status = NvmeCommandStatus::error(NvmeStatus::Generic(
                    GenericStatusCode::AbortedByRequest,
                ));
                aborted.push(c);
            } else {
                keep.push_back(c);
            }
        }

        self.queue = keep;
        aborted
    }
}

/// An in-flight emulated connect.
struct EmuProbe {
    subsystem: Arc<EmuSubsystem>,
    opts_hostnqn: String,
}

impl TransportProbe for EmuProbe {
    fn poll(&mut self) -> ProbeStatus {
        if self.subsystem.removed.load(Ordering::Acquire) {
            return ProbeStatus::Failed(Errno::ENODEV);
        }

        let pending =
            self.subsystem.fail_connect_count.load(Ordering::Acquire);
        if pending > 0 {
            self.subsystem
                .fail_connect_count
                .store(pending - 1, Ordering::Release);
            return ProbeStatus::Failed(Errno::ECONNREFUSED);
        }

        trace!(
            "{}: host '{}' attached",
            self.subsystem.nqn,
            self.opts_hostnqn
        );

        let ctrlr = Arc::new(EmuCtrlr {
            subsystem: self.subsystem.clone(),
            cntlid: self.subsystem.alloc_cntlid(),
            failed: Arc::new(AtomicBool::new(false)),
            aer_cb: Mutex::new(None),
            aer_pending: Mutex::new(VecDeque::new()),
            admin_queue: Mutex::new(VecDeque::new()),
        });

        self.subsystem
            .controllers
            .lock()
            .push(Arc::downgrade(&ctrlr));

        ProbeStatus::Ready(ctrlr)
    }
}

/// The loopback transport.
#[derive(Default)]
pub struct EmuTransport;

impl NvmeTransport for EmuTransport {
    fn connect(
        &self,
        trid: &NvmeTransportId,
        opts: &NvmeControllerOpts,
    ) -> Result<Box<dyn TransportProbe>, CoreError> {
        let subsystem = EMU_TARGETS
            .lock()
            .get(&trid.address())
            .cloned()
            .ok_or(CoreError::OpenBdev {
                source: Errno::ECONNREFUSED,
            })?;

        Ok(Box::new(EmuProbe {
            subsystem,
            opts_hostnqn: opts.host_nqn().to_string(),
        }))
    }
}
