//! A namespace as attached to one controller, with its ANA view. ANA state
//! is written by the controller's owner reactor when a log page read
//! completes and read from every I/O path, hence the atomics.

use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc,
};

use uuid::Uuid;

use super::{transport::TransportNamespace, utils::AnaState};

#[derive(Debug)]
pub struct NvmeNamespace {
    ctrlr_name: String,
    ns: NsRef,
    ana_state: AtomicU32,
    ana_state_updating: AtomicBool,
}

struct NsRef(Arc<dyn TransportNamespace>);

impl std::fmt::Debug for NsRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ns {}", self.0.nsid())
    }
}

impl NvmeNamespace {
    pub fn new(ctrlr_name: &str, ns: Arc<dyn TransportNamespace>) -> Self {
        Self {
            ctrlr_name: String::from(ctrlr_name),
            ns: NsRef(ns),
            ana_state: AtomicU32::new(AnaState::Optimized as u32),
            ana_state_updating: AtomicBool::new(false),
        }
    }

    /// Name of the controller this namespace is attached through.
    pub fn ctrlr_name(&self) -> &str {
        &self.ctrlr_name
    }

    pub fn nsid(&self) -> u32 {
        self.ns.0.nsid()
    }

    pub fn uuid(&self) -> Option<Uuid> {
        self.ns.0.uuid()
    }

    pub fn nguid(&self) -> Option<[u8; 16]> {
        self.ns.0.nguid()
    }

    pub fn eui64(&self) -> Option<[u8; 8]> {
        self.ns.0.eui64()
    }

    pub fn csi(&self) -> u8 {
        self.ns.0.csi()
    }

    pub fn block_len(&self) -> u64 {
        self.ns.0.sector_size() as u64
    }

    pub fn num_blocks(&self) -> u64 {
        self.ns.0.num_sectors()
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.num_blocks() * self.block_len()
    }

    pub fn md_size(&self) -> u64 {
        self.ns.0.md_size() as u64
    }

    pub fn alignment(&self) -> u64 {
        self.ns.0.optimal_io_boundary()
    }

    pub fn supports_compare(&self) -> bool {
        self.ns.0.supports_compare()
    }

    pub fn supports_deallocate(&self) -> bool {
        self.ns.0.supports_deallocate()
    }

    pub fn supports_write_zeroes(&self) -> bool {
        self.ns.0.supports_write_zeroes()
    }

    pub fn ana_group_id(&self) -> u32 {
        self.ns.0.ana_group_id()
    }

    // -- ANA ---------------------------------------------------------------

    pub fn ana_state(&self) -> AnaState {
        AnaState::from_u8(self.ana_state.load(Ordering::Acquire) as u8)
            .unwrap_or(AnaState::Inaccessible)
    }

    pub fn set_ana_state(&self, state: AnaState) {
        self.ana_state.store(state as u32, Ordering::Release);
    }

    /// Whether an ANA log page read for this namespace is in flight.
    pub fn ana_state_updating(&self) -> bool {
        self.ana_state_updating.load(Ordering::Acquire)
    }

    pub fn set_ana_state_updating(&self, updating: bool) {
        self.ana_state_updating.store(updating, Ordering::Release);
    }

    /// Namespace identity equivalence: every identifier defined on both
    /// sides must match, at least one must be defined, and the command set
    /// must agree. Two namespaces passing this check back the same bdev.
    pub fn matches(&self, other: &NvmeNamespace) -> bool {
        if self.csi() != other.csi() {
            return false;
        }

        let mut compared = false;

        if let (Some(a), Some(b)) = (self.uuid(), other.uuid()) {
            if a != b {
                return false;
            }
            compared = true;
        }
        if let (Some(a), Some(b)) = (self.nguid(), other.nguid()) {
            if a != b {
                return false;
            }
            compared = true;
        }
        if let (Some(a), Some(b)) = (self.eui64(), other.eui64()) {
            if a != b {
                return false;
            }
            compared = true;
        }

        compared
    }
}
