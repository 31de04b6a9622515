//! The transport surface the NVMe driver consumes. Concrete transports
//! (fabric or loopback) live below these traits; the driver itself only
//! relies on the async submission/completion contract they describe.

use std::{fmt::Debug, sync::Arc};

use nix::errno::Errno;
use uuid::Uuid;

use crate::core::{CoreError, IoVec, NvmeCommandStatus};

use super::utils::AsyncEvent;

/// Transport id: the tuple that locates a controller.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct NvmeTransportId {
    trtype: String,
    traddr: String,
    trsvcid: String,
    subnqn: String,
}

impl Debug for NvmeTransportId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Transport ID: {}: {}: {}: {}:",
            self.trtype(),
            self.traddr(),
            self.subnqn(),
            self.svcid()
        )
    }
}

impl NvmeTransportId {
    pub fn trtype(&self) -> String {
        self.trtype.clone()
    }

    pub fn traddr(&self) -> String {
        self.traddr.clone()
    }

    pub fn subnqn(&self) -> String {
        self.subnqn.clone()
    }

    pub fn svcid(&self) -> String {
        self.trsvcid.clone()
    }

    /// The listen address this id points at.
    pub fn address(&self) -> String {
        format!("{}:{}", self.traddr, self.trsvcid)
    }
}

#[derive(Debug)]
#[allow(clippy::upper_case_acronyms)]
enum TransportType {
    TCP = 0x3,
}

impl Default for TransportType {
    fn default() -> Self {
        Self::TCP
    }
}

impl From<TransportType> for String {
    fn from(t: TransportType) -> Self {
        match t {
            TransportType::TCP => String::from("tcp"),
        }
    }
}

#[derive(Default, Debug)]
pub struct Builder {
    trtype: TransportType,
    svcid: String,
    traddr: String,
    subnqn: String,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            ..Default::default()
        }
    }

    /// the address to connect to
    pub fn with_traddr(mut self, traddr: &str) -> Self {
        self.traddr = traddr.to_string();
        self
    }

    /// svcid (port) to connect to
    pub fn with_svcid(mut self, svcid: &str) -> Self {
        self.svcid = svcid.to_string();
        self
    }

    /// target nqn
    pub fn with_subnqn(mut self, subnqn: &str) -> Self {
        self.subnqn = subnqn.to_string();
        self
    }

    /// builder for transport ids; currently always TCP
    pub fn build(self) -> NvmeTransportId {
        NvmeTransportId {
            trtype: String::from(TransportType::TCP),
            traddr: self.traddr,
            trsvcid: self.svcid,
            subnqn: self.subnqn,
        }
    }
}

/// Completion callback of a single transport command. Invoked on the thread
/// that polls the owning queue.
pub type NvmeRequestCb = Box<dyn FnOnce(NvmeCommandStatus)>;

/// Block operation carried by an I/O request.
#[derive(Debug)]
pub enum NvmeRequestOp {
    Read,
    Write,
    Compare,
    WriteZeroes,
    Unmap,
    Flush,
}

/// An I/O request as handed to a transport qpair.
pub struct NvmeRequest {
    pub nsid: u32,
    pub op: NvmeRequestOp,
    pub offset_blocks: u64,
    pub num_blocks: u64,
    pub iovs: Vec<IoVec>,
    /// Caller chosen identifier, used to abort the request.
    pub tag: u64,
    pub cb: NvmeRequestCb,
}

impl Debug for NvmeRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} nsid {} at {}+{} (tag {:#x})",
            self.op, self.nsid, self.offset_blocks, self.num_blocks, self.tag
        )
    }
}

/// A finished request as returned by completion processing. The transport
/// never invokes the callback itself: the caller runs it once no transport
/// state is borrowed, so callbacks are free to submit again.
pub struct NvmeCompletion {
    pub tag: u64,
    pub status: NvmeCommandStatus,
    pub cb: NvmeRequestCb,
}

impl NvmeCompletion {
    /// Invokes the callback with the recorded status.
    pub fn complete(self) {
        (self.cb)(self.status)
    }
}

/// Outcome of polling a connect probe.
pub enum ProbeStatus {
    /// Still connecting, keep polling.
    Pending,
    /// Controller attached.
    Ready(Arc<dyn TransportCtrlr>),
    /// Connection failed.
    Failed(Errno),
}

/// An in-progress controller connection.
pub trait TransportProbe: Send {
    fn poll(&mut self) -> ProbeStatus;
}

/// A transport: connects transport ids to controllers.
pub trait NvmeTransport: Send + Sync + 'static {
    fn connect(
        &self,
        trid: &NvmeTransportId,
        opts: &super::controller::options::NvmeControllerOpts,
    ) -> Result<Box<dyn TransportProbe>, CoreError>;
}

/// An attached controller as seen through the transport.
pub trait TransportCtrlr: Send + Sync {
    /// Controller id; unique within one subsystem.
    fn cntlid(&self) -> u16;

    /// NQN of the subsystem this controller belongs to.
    fn subnqn(&self) -> String;

    /// Whether the transport reported the controller removed. Removal is
    /// not recoverable locally.
    fn is_removed(&self) -> bool;

    /// Whether the controller is failed and refuses new submissions.
    fn is_failed(&self) -> bool;

    /// Force-fails the controller; queued admin and I/O commands abort.
    fn fail(&self);

    /// Synchronous controller-level reset: tears the admin connection down
    /// and re-establishes it.
    fn reset(&self) -> Result<(), Errno>;

    /// Processes admin completions. Returns the number processed, or a
    /// negated errno when the admin qpair is unusable.
    fn process_admin_completions(&self) -> i32;

    /// Submits a raw admin command.
    fn admin_cmd(
        &self,
        opc: u8,
        cb: NvmeRequestCb,
    ) -> Result<(), Errno>;

    /// Reads the ANA log page. At most one read is in flight at a time per
    /// caller; the callback is invoked from admin completion processing.
    fn get_ana_log_page(
        &self,
        cb: Box<dyn FnOnce(Result<Vec<u8>, Errno>)>,
    ) -> Result<(), Errno>;

    /// Registers the async event callback.
    fn set_aer_callback(&self, cb: Box<dyn Fn(AsyncEvent) + Send + Sync>);

    /// Active namespace ids.
    fn active_ns_list(&self) -> Vec<u32>;

    fn namespace(&self, nsid: u32) -> Option<Arc<dyn TransportNamespace>>;

    /// Allocates an I/O qpair; connection is a separate step.
    fn alloc_io_qpair(&self) -> Result<Box<dyn TransportQpair>, Errno>;
}

/// An I/O queue pair against one controller. Qpairs are bound to the
/// reactor that allocated them.
pub trait TransportQpair {
    fn connect(&mut self) -> i32;

    /// Disconnects the qpair; queued requests come back aborted for the
    /// caller to complete.
    fn disconnect(&mut self) -> Vec<NvmeCompletion>;

    fn is_connected(&self) -> bool;

    /// Whether the transport failed the qpair; a failed qpair triggers a
    /// controller reset.
    fn is_failed(&self) -> bool;

    /// Submits an I/O request. On failure the request is handed back so the
    /// caller can queue or fail it; `ENOMEM` means the submission queue is
    /// full and the request should be retried after the next completion.
    fn submit(&mut self, req: NvmeRequest)
        -> Result<(), (Errno, NvmeRequest)>;

    /// Reaps up to `max` completions (0 means no limit); the caller invokes
    /// their callbacks.
    fn process_completions(
        &mut self,
        max: u32,
    ) -> Result<Vec<NvmeCompletion>, Errno>;

    /// Aborts queued requests carrying the tag; the aborted requests come
    /// back for the caller to complete.
    fn abort(&mut self, tag: u64) -> Vec<NvmeCompletion>;
}

/// A namespace as reported by the controller.
pub trait TransportNamespace: Send + Sync {
    fn nsid(&self) -> u32;

    fn uuid(&self) -> Option<Uuid>;

    fn nguid(&self) -> Option<[u8; 16]>;

    fn eui64(&self) -> Option<[u8; 8]>;

    /// Command set identifier.
    fn csi(&self) -> u8;

    fn num_sectors(&self) -> u64;

    fn sector_size(&self) -> u32;

    fn md_size(&self) -> u32;

    fn optimal_io_boundary(&self) -> u64;

    fn supports_compare(&self) -> bool;

    fn supports_deallocate(&self) -> bool;

    fn supports_write_zeroes(&self) -> bool;

    /// ANA group this namespace belongs to.
    fn ana_group_id(&self) -> u32;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_transport_id() {
        let transport = Builder::new()
            .with_subnqn("nqn.2021-01-01:test.nqn")
            .with_svcid("4420")
            .with_traddr("127.0.0.1")
            .build();

        assert_eq!(transport.traddr(), "127.0.0.1");
        assert_eq!(transport.subnqn(), "nqn.2021-01-01:test.nqn");
        assert_eq!(transport.svcid(), "4420");
        assert_eq!(transport.trtype(), "tcp");
        assert_eq!(transport.address(), "127.0.0.1:4420");
    }
}
