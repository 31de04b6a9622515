//! Shared test harness: one engine per test binary, tests serialized
//! against each other, and helpers to drive reactors from the test thread.

#![allow(dead_code)]

use std::{
    future::Future,
    time::{Duration, Instant},
};

use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard};

use bdev_engine::{core::EngineEnvironment, subsys::Config};

/// Number of reactor cores the test engine runs with.
pub const TEST_CORES: u32 = 2;

static ENGINE: Lazy<EngineEnvironment> =
    Lazy::new(|| EngineEnvironment::init(TEST_CORES));

static TEST_LOCK: Mutex<()> = Mutex::new(());

/// Serializes a test against the others in this binary and resets the
/// configuration to defaults when the guard drops.
pub struct TestGuard {
    _guard: MutexGuard<'static, ()>,
}

impl Drop for TestGuard {
    fn drop(&mut self) {
        Config::update(|cfg| *cfg = Default::default());
    }
}

/// Entry point every test calls first.
pub fn engine() -> (&'static EngineEnvironment, TestGuard) {
    let guard = TestGuard {
        _guard: TEST_LOCK.lock(),
    };
    (&ENGINE, guard)
}

/// Runs a `Send` future on the primary reactor and blocks for its result.
pub fn run<F, T>(f: F) -> T
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    futures::executor::block_on(ENGINE.spawn_on_primary(f))
        .expect("reactor dropped the result")
}

/// Builds a (possibly non-`Send`) future on the given core and blocks for
/// its result.
pub fn run_on<F, Fut, T>(core: u32, f: F) -> T
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = T> + 'static,
    T: Send + 'static,
{
    futures::executor::block_on(ENGINE.spawn_local_on(core, f))
        .expect("reactor dropped the result")
}

/// Polls a condition from the test thread until it holds or the timeout
/// expires. Returns whether the condition was met.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}
