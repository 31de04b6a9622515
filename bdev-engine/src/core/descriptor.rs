//! Descriptors: open handles on a bdev, carrying the holder's event
//! callback. When the guard is dropped the descriptor is closed; closing
//! the last descriptor of a removed bdev continues the destruct.

use std::{
    fmt::{Debug, Error, Formatter},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use crate::core::{
    bdev_io::BdevChannel,
    Bdev,
    CoreError,
    DeviceEventType,
    IoChannel,
    Reactors,
};

type EventCb = Box<dyn Fn(DeviceEventType, &str) + Send + Sync>;

pub(crate) struct DescInner {
    bdev: Bdev,
    write: bool,
    event_cb: EventCb,
    closed: AtomicBool,
}

impl DescInner {
    pub(crate) fn new(bdev: Bdev, write: bool, event_cb: EventCb) -> Self {
        Self {
            bdev,
            write,
            event_cb,
            closed: AtomicBool::new(false),
        }
    }

    /// Invokes the holder's event callback unless the descriptor is already
    /// on its way out.
    pub(crate) fn deliver_event(&self, event: DeviceEventType) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        (self.event_cb)(event, self.bdev.name());
    }
}

/// RAII wrapper for an open descriptor. When this structure is dropped, the
/// descriptor is closed.
pub struct DescriptorGuard {
    inner: Arc<DescInner>,
}

impl DescriptorGuard {
    pub(crate) fn new(inner: Arc<DescInner>) -> Self {
        Self {
            inner,
        }
    }

    /// Return the bdev associated with this descriptor, a descriptor cannot
    /// exist without a bdev.
    pub fn bdev(&self) -> Bdev {
        self.inner.bdev.clone()
    }

    /// Whether this descriptor grants write access.
    pub fn is_write(&self) -> bool {
        self.inner.write
    }

    /// Acquires the per-thread I/O channel of the underlying bdev.
    pub fn io_channel(&self) -> Result<IoChannel<BdevChannel>, CoreError> {
        self.inner.bdev.get_io_channel()
    }

    /// claim the bdev for exclusive access on behalf of the given module.
    pub fn claim(&self, module: &str) -> Result<(), CoreError> {
        self.inner.bdev.claim(module)
    }

    /// unclaim a bdev previously claimed
    pub fn unclaim(&self) {
        self.inner.bdev.release_claim()
    }

    /// Explicitly closes the descriptor.
    pub fn close(self) {
        drop(self)
    }
}

/// When we get removed we might be asked to close ourselves, however, this
/// request might come from a different thread than the one that owns the
/// registry. Closing therefore hops to the primary reactor when needed.
impl Drop for DescriptorGuard {
    fn drop(&mut self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let inner = self.inner.clone();
        let close = move || {
            let bdev = inner.bdev.clone();
            bdev.descriptor_closed(&inner);
        };

        match Reactors::current() {
            Some(r) if r.is_primary() => close(),
            _ => Reactors::primary().send_msg(close),
        }
    }
}

impl Debug for DescriptorGuard {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        write!(
            f,
            "Descriptor for bdev: {} (write: {})",
            self.inner.bdev.name(),
            self.inner.write
        )
    }
}
