//! Per-bdev LBA range locks.
//!
//! A range lock serializes conflicting block ranges of one bdev across all
//! channels; the fused compare-and-write emulation takes one for the span it
//! operates on. Grants are FIFO per conflicting range: an unlock re-scans
//! the pending list in arrival order and admits every request that no
//! longer conflicts. The grant callback runs on the reactor that requested
//! the lock.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::core::reactor::{current_core, Reactors};

/// A contiguous range of blocks.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct LbaRange {
    pub offset: u64,
    pub len: u64,
}

impl LbaRange {
    pub fn new(offset: u64, len: u64) -> Self {
        Self {
            offset,
            len,
        }
    }

    pub fn overlaps(&self, other: &LbaRange) -> bool {
        self.offset < other.offset + other.len
            && other.offset < self.offset + self.len
    }
}

/// Grant callbacks are created and invoked on the same reactor; the wrapper
/// only rides the global table in between.
struct GrantCb(Box<dyn FnOnce()>);

unsafe impl Send for GrantCb {}

struct PendingLock {
    range: LbaRange,
    core: u32,
    cb: GrantCb,
}

#[derive(Default)]
struct RangeState {
    active: Vec<LbaRange>,
    pending: Vec<PendingLock>,
}

static RANGE_LOCKS: Lazy<Mutex<HashMap<String, RangeState>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Locks a block range of the named bdev. The callback fires on the calling
/// reactor once the range is held; synchronously when it is free.
pub fn lock_lba_range(
    bdev_name: &str,
    range: LbaRange,
    cb: impl FnOnce() + 'static,
) {
    let grant = {
        let mut locks = RANGE_LOCKS.lock();
        let state = locks.entry(bdev_name.to_string()).or_default();

        if state.active.iter().any(|r| r.overlaps(&range)) {
            trace!(
                "{}: range {:?} conflicts with an active lock, queued",
                bdev_name,
                range
            );
            state.pending.push(PendingLock {
                range,
                core: current_core(),
                cb: GrantCb(Box::new(cb)),
            });
            None
        } else {
            state.active.push(range);
            Some(cb)
        }
    };

    if let Some(cb) = grant {
        cb();
    }
}

/// Releases a previously granted range and admits newly compatible waiters.
pub fn unlock_lba_range(bdev_name: &str, range: LbaRange) {
    let granted = {
        let mut locks = RANGE_LOCKS.lock();
        let state = match locks.get_mut(bdev_name) {
            Some(s) => s,
            None => {
                warn!("{}: unlock of unknown range {:?}", bdev_name, range);
                return;
            }
        };

        match state.active.iter().position(|r| *r == range) {
            Some(at) => {
                state.active.remove(at);
            }
            None => {
                warn!("{}: unlock of unheld range {:?}", bdev_name, range);
                return;
            }
        }

        // Admit pending locks in arrival order.
        let mut granted = Vec::new();
        let mut i = 0;
        while i < state.pending.len() {
            let conflicts = state.active.iter().any(|r| {
                r.overlaps(&state.pending[i].range)
            }) || granted
                .iter()
                .any(|g: &PendingLock| g.range.overlaps(&state.pending[i].range));

            if conflicts {
                i += 1;
            } else {
                granted.push(state.pending.remove(i));
            }
        }

        for g in &granted {
            state.active.push(g.range);
        }

        if state.active.is_empty() && state.pending.is_empty() {
            locks.remove(bdev_name);
        }

        granted
    };

    for g in granted {
        match Reactors::get_by_core(g.core) {
            Some(r) => r.send_msg(move || (g.cb.0)()),
            None => error!("range lock waiter's reactor {} is gone", g.core),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn range_overlap() {
        let a = LbaRange::new(0, 8);
        assert!(a.overlaps(&LbaRange::new(7, 1)));
        assert!(a.overlaps(&LbaRange::new(0, 1)));
        assert!(!a.overlaps(&LbaRange::new(8, 8)));
        assert!(LbaRange::new(4, 8).overlaps(&a));
    }
}
