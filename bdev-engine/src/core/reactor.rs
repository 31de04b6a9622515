//! Cooperative, thread-per-core reactors. A reactor owns every object that
//! was created on it; other reactors communicate with it exclusively by
//! message passing. Messages are simple closures executed in FIFO order on
//! the target core. Alongside the message queue each reactor runs a local
//! futures executor and the poller list, so long running operations are
//! split across poll iterations instead of blocking.
//!
//! The deferred queue is the completion reentrancy guard: a completion that
//! would otherwise re-enter a submission path is pushed there and runs at
//! the top of the next iteration of the owning core.

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    fmt::{self, Display, Formatter},
    slice::Iter,
    thread,
    time::Duration,
};

use crossbeam::channel::{unbounded, Receiver, Sender};
use futures::{
    executor::{LocalPool, LocalSpawner},
    task::LocalSpawnExt,
    Future,
};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::core::poller;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReactorState {
    Init,
    Running,
    Shutdown,
    Delayed,
}

impl Display for ReactorState {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let s = match self {
            ReactorState::Init => "Init",
            ReactorState::Running => "Running",
            ReactorState::Shutdown => "Shutdown",
            ReactorState::Delayed => "Delayed",
        };
        write!(f, "{}", s)
    }
}

/// A unit of work sent to a reactor.
type Message = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug)]
pub struct Reactors(Vec<Reactor>);

unsafe impl Sync for Reactors {}
unsafe impl Send for Reactors {}

unsafe impl Sync for Reactor {}
unsafe impl Send for Reactor {}

pub static REACTOR_LIST: OnceCell<Reactors> = OnceCell::new();

/// Join handles of the launched reactor threads, collected at shutdown.
static REACTOR_THREADS: Mutex<Vec<thread::JoinHandle<()>>> = Mutex::new(Vec::new());

pub struct Reactor {
    /// the logical core this reactor is created on
    core: u32,
    /// represents the state of the reactor
    flags: Cell<ReactorState>,
    /// sender and receiver ends of the message queue
    sx: Sender<Message>,
    rx: Receiver<Message>,
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("core", &self.core)
            .field("queued", &self.rx.len())
            .finish()
    }
}

thread_local! {
    /// Core of the reactor owning the current thread, if any.
    static CURRENT_CORE: Cell<Option<u32>> = Cell::new(None);
    /// Local futures executor of the current reactor.
    static LOCAL_POOL: RefCell<Option<LocalPool>> = RefCell::new(None);
    /// Spawner for the local executor, usable while the pool is running.
    static LOCAL_SPAWNER: RefCell<Option<LocalSpawner>> = RefCell::new(None);
    /// Closures deferred to the next poll iteration of this core.
    static DEFERRED: RefCell<VecDeque<Box<dyn FnOnce()>>> =
        RefCell::new(VecDeque::new());
}

impl Reactors {
    /// initialize the reactor subsystem for the requested number of cores
    pub fn init(count: u32) {
        assert!(count > 0, "at least one reactor core is required");
        REACTOR_LIST.get_or_init(|| {
            Reactors(
                (0 .. count)
                    .map(|c| {
                        debug!("init core: {}", c);
                        Reactor::new(c)
                    })
                    .collect::<Vec<_>>(),
            )
        });
    }

    /// launch every reactor onto its own OS thread
    pub fn launch_all() {
        let mut threads = REACTOR_THREADS.lock();
        for r in Reactors::iter() {
            let core = r.core;
            let handle = thread::Builder::new()
                .name(format!("core_{}", core))
                .spawn(move || {
                    Reactors::get_by_core(core)
                        .expect("reactor disappeared")
                        .poll_reactor();
                })
                .expect("failed to launch reactor thread");
            threads.push(handle);
        }

        // Wait for every reactor to come online before handing out work.
        for r in Reactors::iter() {
            while r.get_state() != ReactorState::Running {
                thread::yield_now();
            }
        }
    }

    /// stop all reactors and join their threads
    pub fn stop_all() {
        for r in Reactors::iter() {
            r.shutdown();
        }

        let mut threads = REACTOR_THREADS.lock();
        for t in threads.drain(..) {
            if t.join().is_err() {
                error!("reactor thread panicked during shutdown");
            }
        }
    }

    /// get a reference to a reactor on the given core
    pub fn get_by_core(core: u32) -> Option<&'static Reactor> {
        Reactors::iter().find(|c| c.core == core)
    }

    /// get the reactor associated with the current thread, if this thread
    /// belongs to a reactor
    pub fn current() -> Option<&'static Reactor> {
        CURRENT_CORE
            .with(|c| c.get())
            .and_then(Reactors::get_by_core)
    }

    /// the primary reactor, on which all registry mutation takes place
    pub fn primary() -> &'static Reactor {
        Reactors::iter().next().expect("reactor subsystem uninitialized")
    }

    pub fn iter() -> Iter<'static, Reactor> {
        REACTOR_LIST
            .get()
            .expect("reactor subsystem uninitialized")
            .0
            .iter()
    }

    /// number of reactors
    pub fn count() -> u32 {
        REACTOR_LIST.get().map_or(0, |r| r.0.len() as u32)
    }
}

/// Core of the reactor owning the calling thread. Panics when called from a
/// non-reactor thread.
pub fn current_core() -> u32 {
    CURRENT_CORE
        .with(|c| c.get())
        .expect("not called from a reactor thread")
}

impl Reactor {
    fn new(core: u32) -> Self {
        let (sx, rx) = unbounded::<Message>();
        Self {
            core,
            flags: Cell::new(ReactorState::Init),
            sx,
            rx,
        }
    }

    /// the logical core this reactor runs on
    pub fn core(&self) -> u32 {
        self.core
    }

    /// whether this reactor is the primary one
    pub fn is_primary(&self) -> bool {
        self.core == Reactors::primary().core
    }

    /// returns the current state of the reactor
    pub fn get_state(&self) -> ReactorState {
        self.flags.get()
    }

    fn set_state(&self, state: ReactorState) {
        match state {
            ReactorState::Init
            | ReactorState::Delayed
            | ReactorState::Shutdown
            | ReactorState::Running => self.flags.set(state),
        }
    }

    /// enqueue a closure to run on this reactor; ordering between messages
    /// from the same sender is FIFO
    pub fn send_msg<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.sx.send(Box::new(f)).is_err() {
            error!("reactor {}: message queue is gone", self.core);
        }
    }

    /// enqueue a future to be executed on this reactor
    pub fn send_future<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.send_msg(move || {
            Reactor::spawn_local(future);
        });
    }

    /// spawn a (possibly non-Send) future on the current reactor; must be
    /// called from a reactor thread
    pub fn spawn_local<F>(future: F)
    where
        F: Future<Output = ()> + 'static,
    {
        LOCAL_SPAWNER.with(|s| {
            s.borrow()
                .as_ref()
                .expect("no local executor on this thread")
                .spawn_local(future)
                .expect("failed to spawn future on local executor");
        });
    }

    /// defer a closure to the next poll iteration of the owning core; unlike
    /// `send_msg` the closure does not have to be `Send`, so this must be
    /// called from the owning thread itself
    pub fn defer<F>(&self, f: F)
    where
        F: FnOnce() + 'static,
    {
        assert_eq!(
            CURRENT_CORE.with(|c| c.get()),
            Some(self.core),
            "defer() called from a foreign thread"
        );
        DEFERRED.with(|d| d.borrow_mut().push_back(Box::new(f)));
    }

    /// request this reactor to stop polling
    pub fn shutdown(&self) {
        debug!("shutdown requested for core {}", self.core);
        let core = self.core;
        self.send_msg(move || {
            let r = Reactors::get_by_core(core).expect("own core is gone");
            r.set_state(ReactorState::Shutdown);
        });
    }

    /// run a single iteration of this reactor: drain messages, poll the
    /// pollers, run deferred work and advance local futures
    fn poll_once(&self) -> bool {
        let mut busy = false;

        // Bound the batch so pollers keep running under message load.
        for _ in 0 .. 64 {
            match self.rx.try_recv() {
                Ok(msg) => {
                    msg();
                    busy = true;
                }
                Err(_) => break,
            }
        }

        loop {
            let f = DEFERRED.with(|d| d.borrow_mut().pop_front());
            match f {
                Some(f) => {
                    f();
                    busy = true;
                }
                None => break,
            }
        }

        busy |= poller::poll_all();

        // Take the pool out while running it, so that futures are free to
        // spawn new futures through the spawner.
        let mut pool = LOCAL_POOL.with(|p| p.borrow_mut().take());
        if let Some(p) = pool.as_mut() {
            busy |= p.try_run_one();
            p.run_until_stalled();
        }
        LOCAL_POOL.with(|p| *p.borrow_mut() = pool);

        busy
    }

    /// poll this reactor until it is asked to shut down
    pub fn poll_reactor(&self) {
        CURRENT_CORE.with(|c| c.set(Some(self.core)));

        let pool = LocalPool::new();
        LOCAL_SPAWNER.with(|s| *s.borrow_mut() = Some(pool.spawner()));
        LOCAL_POOL.with(|p| *p.borrow_mut() = Some(pool));

        info!("reactor {} polling started", self.core);
        self.set_state(ReactorState::Running);

        loop {
            match self.get_state() {
                ReactorState::Running | ReactorState::Init => {
                    if !self.poll_once() {
                        // Idle: yield the core instead of spinning hot.
                        thread::sleep(Duration::from_micros(100));
                    }
                }
                ReactorState::Delayed => {
                    thread::sleep(Duration::from_millis(1));
                    self.poll_once();
                }
                ReactorState::Shutdown => {
                    break;
                }
            }
        }

        // Give queued work one last chance before the core goes away.
        while self.poll_once() {}

        info!("reactor {} polling stopped", self.core);

        LOCAL_POOL.with(|p| p.borrow_mut().take());
        LOCAL_SPAWNER.with(|s| s.borrow_mut().take());
        CURRENT_CORE.with(|c| c.set(None));
    }
}
