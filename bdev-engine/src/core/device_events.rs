//! Device event listeners and dispatchers. Listeners are held weakly so a
//! consumer that went away does not keep receiving events.

use std::{
    fmt::{Debug, Error, Formatter},
    sync::{Arc, Weak},
};

use parking_lot::Mutex;

/// Events delivered to descriptor holders and device listeners.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum DeviceEventType {
    /// Device has been removed.
    DeviceRemoved,
    /// Device has been resized.
    DeviceResized,
    /// Driver pushed a media management batch.
    MediaManagement,
    /// An admin command on the underlying controller failed to complete.
    AdminCommandCompletionFailed,
}

/// Implemented by consumers that monitor device events.
pub trait DeviceEventListener: Send + Sync {
    fn handle_device_event(&self, evt: DeviceEventType, dev_name: &str);

    fn get_listener_name(&self) -> String {
        "unnamed device event listener".to_string()
    }
}

/// A reference to a device event listener.
#[derive(Clone)]
pub struct DeviceEventSink {
    inner: Arc<dyn DeviceEventListener>,
}

impl Debug for DeviceEventSink {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        write!(f, "DeviceEventSink('{}')", self.get_listener_name())
    }
}

impl DeviceEventSink {
    pub fn new(listener: Arc<dyn DeviceEventListener>) -> Self {
        Self {
            inner: listener,
        }
    }

    fn into_weak(self) -> Weak<dyn DeviceEventListener> {
        Arc::downgrade(&self.inner)
    }

    pub fn get_listener_name(&self) -> String {
        self.inner.get_listener_name()
    }
}

/// Fans device events out to the registered listeners.
#[derive(Default)]
pub struct DeviceEventDispatcher {
    listeners: Mutex<Vec<Weak<dyn DeviceEventListener>>>,
}

impl DeviceEventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a listener.
    pub fn add_listener(&self, listener: DeviceEventSink) {
        self.listeners.lock().push(listener.into_weak());
    }

    /// Dispatches an event to every live listener and prunes dead ones.
    /// Listener callbacks run without the dispatcher lock held.
    pub fn dispatch_event(&self, evt: DeviceEventType, dev_name: &str) -> usize {
        let listeners = {
            let mut guard = self.listeners.lock();
            guard.retain(|w| w.strong_count() > 0);
            guard
                .iter()
                .filter_map(|w| w.upgrade())
                .collect::<Vec<_>>()
        };

        for l in &listeners {
            l.handle_device_event(evt, dev_name);
        }
        listeners.len()
    }

    /// Number of live listeners.
    pub fn count(&self) -> usize {
        let mut guard = self.listeners.lock();
        guard.retain(|w| w.strong_count() > 0);
        guard.len()
    }
}

impl Debug for DeviceEventDispatcher {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        write!(f, "DeviceEventDispatcher({} listeners)", self.count())
    }
}
