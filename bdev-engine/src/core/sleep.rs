//! Reactor friendly sleeping. The returned receiver resolves on the calling
//! reactor once the duration has elapsed; awaiting it never blocks the core.

use std::time::{Duration, Instant};

use futures::channel::oneshot;

use crate::core::poller;

/// Completes after `duration`, driven by a one-shot poller on the calling
/// reactor. Must be called from a reactor thread.
pub fn engine_sleep(duration: Duration) -> oneshot::Receiver<()> {
    let (s, r) = oneshot::channel::<()>();
    let deadline = Instant::now() + duration;
    let mut sender = Some(s);

    poller::register_detached("sleep", Duration::from_millis(1), move || {
        if Instant::now() < deadline {
            return 0;
        }
        if let Some(s) = sender.take() {
            // The waiter may have gone away; that is not an error.
            s.send(()).ok();
        }
        -1
    });

    r
}
