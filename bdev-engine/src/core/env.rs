//! Engine bring-up and teardown: reactors, bdev modules and configuration.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Once,
};

use futures::{channel::oneshot, Future};

use crate::{
    core::{ModuleRegistry, Reactors},
    logger,
    subsys::Config,
};

static LOGGER_INIT: Once = Once::new();
static ENV_RUNNING: AtomicBool = AtomicBool::new(false);

/// The running engine environment. Creating it launches the reactors and
/// initializes the registered bdev modules; `fini` tears everything down.
pub struct EngineEnvironment {
    reactor_count: u32,
}

impl EngineEnvironment {
    /// Brings the engine up with the given number of reactor cores.
    pub fn init(reactor_count: u32) -> Self {
        LOGGER_INIT.call_once(|| {
            logger::init("INFO");
        });

        assert!(
            !ENV_RUNNING.swap(true, Ordering::AcqRel),
            "engine environment already running"
        );

        let cfg = Config::get();
        debug!("engine starting with config: {:?}", cfg);

        crate::bdev::register_modules();

        Reactors::init(reactor_count);
        Reactors::launch_all();

        // Run module initialization on the primary reactor and wait for any
        // asynchronously initializing module to acknowledge.
        let (s, r) = oneshot::channel::<()>();
        Reactors::primary().send_future(async move {
            ModuleRegistry::get().init_modules();
            while ModuleRegistry::get().init_pending() > 0 {
                crate::core::engine_sleep(
                    std::time::Duration::from_millis(1),
                )
                .await
                .ok();
            }
            s.send(()).ok();
        });
        futures::executor::block_on(r).expect("module init never completed");

        info!("engine environment started ({} cores)", reactor_count);

        Self {
            reactor_count,
        }
    }

    pub fn reactor_count(&self) -> u32 {
        self.reactor_count
    }

    /// Runs a future on the primary reactor, returning a receiver for its
    /// result. The caller may block on the receiver from a non-reactor
    /// thread.
    pub fn spawn_on_primary<F, T>(&self, f: F) -> oneshot::Receiver<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (s, r) = oneshot::channel::<T>();
        Reactors::primary().send_future(async move {
            s.send(f.await).ok();
        });
        r
    }

    /// Runs a future on the given core.
    pub fn spawn_on_core<F, T>(
        &self,
        core: u32,
        f: F,
    ) -> oneshot::Receiver<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (s, r) = oneshot::channel::<T>();
        Reactors::get_by_core(core)
            .expect("no such core")
            .send_future(async move {
                s.send(f.await).ok();
            });
        r
    }

    /// Builds a future on the target core and runs it there. Unlike
    /// `spawn_on_core` the future itself does not have to be `Send`, only
    /// its constructor; this is the entry point for driving channels and
    /// handles, which are bound to the reactor they were created on.
    pub fn spawn_local_on<F, Fut, T>(
        &self,
        core: u32,
        f: F,
    ) -> oneshot::Receiver<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + 'static,
        T: Send + 'static,
    {
        let (s, r) = oneshot::channel::<T>();
        Reactors::get_by_core(core)
            .expect("no such core")
            .send_msg(move || {
                crate::core::Reactor::spawn_local(async move {
                    s.send(f().await).ok();
                });
            });
        r
    }

    /// Tears the environment down: module fini followed by reactor
    /// shutdown.
    pub fn fini(self) {
        let (s, r) = oneshot::channel::<()>();
        Reactors::primary().send_future(async move {
            ModuleRegistry::get().fini_modules();
            while ModuleRegistry::get().fini_pending() > 0 {
                crate::core::engine_sleep(
                    std::time::Duration::from_millis(1),
                )
                .await
                .ok();
            }
            s.send(()).ok();
        });
        futures::executor::block_on(r).ok();

        Reactors::stop_all();
        ENV_RUNNING.store(false, Ordering::Release);
        info!("engine environment stopped");
    }
}

/// Requests the reactors to stop; used from signal-style teardown paths
/// where no environment handle is around.
pub fn engine_env_stop() {
    Reactors::stop_all();
    ENV_RUNNING.store(false, Ordering::Release);
}
