//! Pollers are non-blocking functions invoked periodically by the reactor
//! that registered them. A period of zero means "every iteration". The poll
//! function returns a busy indication: a positive value when work was done,
//! zero when idle, and a negative value to unregister the poller (one-shot
//! timers use this).

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    time::{Duration, Instant},
};

struct PollerEntry {
    name: String,
    alive: Rc<Cell<bool>>,
    period: Duration,
    next_run: Instant,
    poll_fn: Box<dyn FnMut() -> i32>,
}

thread_local! {
    /// Pollers registered on the current reactor.
    static POLLERS: RefCell<Vec<PollerEntry>> = RefCell::new(Vec::new());
    /// Pollers registered while the active list was being polled.
    static INCOMING: RefCell<Vec<PollerEntry>> = RefCell::new(Vec::new());
    /// Set while `poll_all` walks the active list.
    static POLLING: Cell<bool> = Cell::new(false);
}

/// Runs every due poller of the calling reactor once. Returns true when any
/// poller reported work done.
pub(crate) fn poll_all() -> bool {
    let mut entries = POLLERS.with(|p| std::mem::take(&mut *p.borrow_mut()));
    POLLING.with(|p| p.set(true));

    let now = Instant::now();
    let mut busy = false;

    entries.retain_mut(|e| {
        if !e.alive.get() {
            return false;
        }
        if now < e.next_run {
            return true;
        }
        e.next_run = now + e.period;

        let rc = (e.poll_fn)();
        if rc > 0 {
            busy = true;
        }
        if rc < 0 {
            trace!("poller '{}' unregistered itself", e.name);
            e.alive.set(false);
            return false;
        }
        e.alive.get()
    });

    POLLING.with(|p| p.set(false));
    POLLERS.with(|p| {
        let mut pollers = p.borrow_mut();
        entries.append(&mut pollers);
        *pollers = entries;
        INCOMING.with(|i| pollers.append(&mut i.borrow_mut()));
    });

    busy
}

fn register(entry: PollerEntry) {
    if POLLING.with(|p| p.get()) {
        INCOMING.with(|i| i.borrow_mut().push(entry));
    } else {
        POLLERS.with(|p| p.borrow_mut().push(entry));
    }
}

/// Registers a detached poller that cannot be stopped from the outside; it
/// runs until its poll function returns a negative value.
pub(crate) fn register_detached<F>(name: &str, interval: Duration, poll_fn: F)
where
    F: FnMut() -> i32 + 'static,
{
    register(PollerEntry {
        name: String::from(name),
        alive: Rc::new(Cell::new(true)),
        period: interval,
        next_run: Instant::now(),
        poll_fn: Box::new(poll_fn),
    });
}

/// A registered poller. Dropping the handle unregisters the poller on the
/// next poll iteration of the owning core.
pub struct Poller {
    name: String,
    alive: Rc<Cell<bool>>,
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("name", &self.name)
            .field("alive", &self.alive.get())
            .finish()
    }
}

impl Poller {
    /// Stops the poller.
    pub fn stop(self) {
        self.alive.set(false);
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.alive.set(false);
    }
}

/// Poller builder.
#[derive(Default)]
pub struct Builder {
    name: Option<String>,
    interval: Duration,
    poll_fn: Option<Box<dyn FnMut() -> i32>>,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Poll interval in microseconds; zero polls on every iteration.
    pub fn with_interval(mut self, period_us: u64) -> Self {
        self.interval = Duration::from_micros(period_us);
        self
    }

    pub fn with_poll_fn<F>(mut self, poll_fn: F) -> Self
    where
        F: FnMut() -> i32 + 'static,
    {
        self.poll_fn = Some(Box::new(poll_fn));
        self
    }

    /// Registers the poller on the calling reactor.
    pub fn build(self) -> Poller {
        let name = self.name.unwrap_or_else(|| String::from("unnamed"));
        let alive = Rc::new(Cell::new(true));

        register(PollerEntry {
            name: name.clone(),
            alive: alive.clone(),
            period: self.interval,
            next_run: Instant::now(),
            poll_fn: self.poll_fn.expect("can not start poller without poll_fn"),
        });

        Poller {
            name,
            alive,
        }
    }
}
