//! I/O qpair wrapper, one per (controller, reactor).

use std::{
    cell::RefCell,
    fmt::{Debug, Formatter},
    rc::Rc,
    sync::Arc,
};

use nix::errno::Errno;

use crate::core::CoreError;

use super::transport::{NvmeRequest, TransportCtrlr, TransportQpair};

/// I/O QPair state.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub enum QPairState {
    /// QPair is not connected.
    Disconnected,
    /// QPair is connected.
    Connected,
    /// QPair is dropped.
    Dropped,
}

impl std::fmt::Display for QPairState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            QPairState::Disconnected => "Disconnected",
            QPairState::Connected => "Connected",
            QPairState::Dropped => "Dropped",
        };
        write!(f, "{}", s)
    }
}

/// I/O QPair.
pub struct QPair {
    inner: Rc<RefCell<Inner>>,
}

struct Inner {
    qpair: Box<dyn TransportQpair>,
    ctrlr_name: String,
    state: QPairState,
}

impl Debug for QPair {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("QPair")
            .field("ctrlr_name", &inner.ctrlr_name)
            .field("state", &inner.state)
            .finish()
    }
}

impl Clone for QPair {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Drop for QPair {
    fn drop(&mut self) {
        if Rc::strong_count(&self.inner) > 1 {
            return;
        }

        let aborted = {
            let mut inner = self.inner.borrow_mut();
            let aborted = inner.qpair.disconnect();
            inner.state = QPairState::Dropped;
            trace!("{}: I/O qpair disconnected", inner.ctrlr_name);
            aborted
        };

        // Abort queued requests towards their submitters, outside of any
        // transport borrow.
        for c in aborted {
            c.complete();
        }
    }
}

impl QPair {
    /// Creates a qpair for the target NVMe controller.
    pub(super) fn create(
        ctrlr: &Arc<dyn TransportCtrlr>,
        ctrlr_name: &str,
    ) -> Result<Self, CoreError> {
        let qpair = ctrlr.alloc_io_qpair().map_err(|e| {
            error!("{}: failed to allocate I/O qpair: {}", ctrlr_name, e);
            CoreError::GetIoChannel {
                name: ctrlr_name.to_string(),
            }
        })?;

        let qpair = Self {
            inner: Rc::new(RefCell::new(Inner {
                qpair,
                ctrlr_name: ctrlr_name.to_owned(),
                state: QPairState::Disconnected,
            })),
        };

        trace!(?qpair, "I/O qpair created for controller");
        Ok(qpair)
    }

    /// Returns QPair state.
    #[inline(always)]
    pub fn state(&self) -> QPairState {
        self.inner.borrow().state
    }

    #[inline(always)]
    fn set_state(&self, state: QPairState) {
        self.inner.borrow_mut().state = state;
    }

    /// Connects a qpair synchronously.
    pub(crate) fn connect(&self) -> i32 {
        // Idempotency for multiple allocations of the same handle on the
        // same thread; we don't reconnect every time.
        if self.state() == QPairState::Connected {
            trace!(?self, "I/O qpair already connected");
            return 0;
        }

        assert_eq!(
            self.state(),
            QPairState::Disconnected,
            "Invalid QPair state"
        );

        let status = self.inner.borrow_mut().qpair.connect();

        self.set_state(if status == 0 {
            QPairState::Connected
        } else {
            QPairState::Disconnected
        });

        trace!(?self, ?status, "I/O qpair connected");
        status
    }

    /// Whether the qpair accepts submissions.
    pub fn is_connected(&self) -> bool {
        self.state() == QPairState::Connected
            && self.inner.borrow().qpair.is_connected()
    }

    /// Whether the transport failed this qpair.
    pub fn is_failed(&self) -> bool {
        self.inner.borrow().qpair.is_failed()
    }

    /// Submits an I/O request. On failure the request is handed back.
    pub fn submit(
        &self,
        req: NvmeRequest,
    ) -> Result<(), (Errno, NvmeRequest)> {
        self.inner.borrow_mut().qpair.submit(req)
    }

    /// Polls for completions and invokes their callbacks. Callbacks run
    /// with no transport state borrowed, so they may submit again.
    pub fn process_completions(&self, max: u32) -> Result<u32, Errno> {
        let completions =
            self.inner.borrow_mut().qpair.process_completions(max)?;
        let n = completions.len() as u32;
        for c in completions {
            c.complete();
        }
        Ok(n)
    }

    /// Aborts queued requests with the given tag, completing them towards
    /// their submitters. Returns the number aborted.
    pub fn abort(&self, tag: u64) -> u32 {
        let aborted = self.inner.borrow_mut().qpair.abort(tag);
        let n = aborted.len() as u32;
        for c in aborted {
            c.complete();
        }
        n
    }
}
