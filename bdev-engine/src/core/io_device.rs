//! I/O devices and their per-thread channels.
//!
//! An I/O device is an opaque key with typed channel context callbacks. For
//! every (reactor, device) pair at most one channel exists; acquiring it
//! creates the context on first use and reference counts it afterwards. The
//! channel context is owned by the reactor it was created on and is never
//! touched from another thread: cross-thread operations walk the channels
//! one reactor at a time via `traverse_io_channels`.

use std::{
    any::Any,
    cell::{Cell, RefCell},
    collections::HashMap,
    fmt::{Debug, Formatter},
    marker::PhantomData,
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
    sync::Arc,
};

use nix::errno::Errno;

use crate::core::{
    reactor::{current_core, Reactors},
    CoreError,
};

/// Device instance ids are process-wide unique and never reused.
static DEVICE_IDS: AtomicU64 = AtomicU64::new(1);

type CreateCb = Box<dyn Fn() -> Result<Box<dyn Any>, Errno> + Send + Sync>;
type DestroyCb = Box<dyn Fn(Box<dyn Any>) + Send + Sync>;

/// An io-device: a named key producing per-reactor channels with a typed
/// context.
pub struct IoDevice {
    id: u64,
    name: String,
    create_cb: CreateCb,
    destroy_cb: DestroyCb,
}

impl Debug for IoDevice {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoDevice")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

struct ChannelSlot {
    device: Arc<IoDevice>,
    ctx: RefCell<Option<Box<dyn Any>>>,
    refs: Cell<u64>,
}

thread_local! {
    /// Channels that exist on the current reactor, keyed by device id.
    static CHANNELS: RefCell<HashMap<u64, Rc<ChannelSlot>>> =
        RefCell::new(HashMap::new());
}

impl IoDevice {
    /// Registers a new io-device with typed channel context `C`.
    pub fn new<C: 'static>(
        name: &str,
        create: impl Fn() -> Result<C, Errno> + Send + Sync + 'static,
        destroy: impl Fn(C) + Send + Sync + 'static,
    ) -> Arc<IoDevice> {
        let id = DEVICE_IDS.fetch_add(1, Ordering::Relaxed);
        trace!("creating io device '{}' (id={})", name, id);

        Arc::new(IoDevice {
            id,
            name: String::from(name),
            create_cb: Box::new(move || {
                create().map(|c| Box::new(c) as Box<dyn Any>)
            }),
            destroy_cb: Box::new(move |any| {
                match any.downcast::<C>() {
                    Ok(c) => destroy(*c),
                    Err(_) => {
                        error!("channel context type mismatch on destroy")
                    }
                }
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the channel of this device for the current reactor, creating
    /// it on first acquisition. Must be called from a reactor thread.
    pub fn get_io_channel<C: 'static>(
        self: &Arc<Self>,
    ) -> Result<IoChannel<C>, CoreError> {
        let core = current_core();

        let existing =
            CHANNELS.with(|map| map.borrow().get(&self.id).cloned());

        let slot = match existing {
            Some(slot) => slot,
            None => {
                // The constructor may acquire channels of other devices, so
                // the registry must not be borrowed while it runs.
                let ctx = (self.create_cb)().map_err(|source| {
                    error!(
                        "{}: failed to create I/O channel on core {}: {}",
                        self.name, core, source
                    );
                    CoreError::GetIoChannel {
                        name: self.name.clone(),
                    }
                })?;

                trace!("{}: I/O channel created on core {}", self.name, core);

                let slot = Rc::new(ChannelSlot {
                    device: self.clone(),
                    ctx: RefCell::new(Some(ctx)),
                    refs: Cell::new(0),
                });
                CHANNELS.with(|map| {
                    map.borrow_mut().insert(self.id, slot.clone())
                });
                slot
            }
        };

        slot.refs.set(slot.refs.get() + 1);

        Ok(IoChannel {
            slot,
            _ctx: PhantomData,
        })
    }

    /// Walks every existing channel of this device, one reactor at a time.
    /// `visit` runs on the reactor owning each channel; a non-zero return
    /// aborts the walk. `done` runs on the originating reactor with the
    /// final status once the last channel replied.
    pub fn traverse_io_channels<C, X>(
        self: &Arc<Self>,
        ctx: X,
        visit: fn(&mut C, &mut X) -> i32,
        done: fn(i32, X),
    ) where
        C: 'static,
        X: Send + 'static,
    {
        let traverse = Traverse::<C, X> {
            device: self.clone(),
            cores: Reactors::iter().map(|r| r.core()).collect(),
            next: 0,
            status: 0,
            originator: current_core(),
            ctx,
            visit,
            done,
            _ctx: PhantomData,
        };

        next_hop(traverse);
    }
}

impl Drop for IoDevice {
    fn drop(&mut self) {
        trace!("io device '{}' (id={}) gone", self.name, self.id);
    }
}

struct Traverse<C, X> {
    device: Arc<IoDevice>,
    cores: Vec<u32>,
    next: usize,
    status: i32,
    originator: u32,
    ctx: X,
    visit: fn(&mut C, &mut X) -> i32,
    done: fn(i32, X),
    _ctx: PhantomData<fn() -> C>,
}

fn next_hop<C: 'static, X: Send + 'static>(mut t: Traverse<C, X>) {
    if t.status != 0 || t.next == t.cores.len() {
        let originator = Reactors::get_by_core(t.originator)
            .expect("originating reactor is gone");
        originator.send_msg(move || (t.done)(t.status, t.ctx));
        return;
    }

    let core = t.cores[t.next];
    t.next += 1;

    Reactors::get_by_core(core)
        .expect("reactor is gone")
        .send_msg(move || {
            let slot = CHANNELS
                .with(|map| map.borrow().get(&t.device.id).cloned());

            if let Some(slot) = slot {
                let mut any = slot.ctx.borrow_mut();
                let c = any
                    .as_mut()
                    .expect("channel context gone while referenced")
                    .downcast_mut::<C>()
                    .expect("channel context type mismatch");
                t.status = (t.visit)(c, &mut t.ctx);
            }

            next_hop(t);
        });
}

/// Reference to the per-(reactor, device) channel context. The context can
/// only be used on the reactor that owns it; when the last reference on
/// that reactor is dropped the destroy callback runs.
pub struct IoChannel<C> {
    slot: Rc<ChannelSlot>,
    _ctx: PhantomData<C>,
}

impl<C: 'static> IoChannel<C> {
    /// Borrows the channel context for the duration of the closure.
    pub fn with<R>(&self, f: impl FnOnce(&mut C) -> R) -> R {
        let mut any = self.slot.ctx.borrow_mut();
        let c = any
            .as_mut()
            .expect("channel context gone while referenced")
            .downcast_mut::<C>()
            .expect("channel context type mismatch");
        f(c)
    }

    /// Name of the device this channel belongs to.
    pub fn device_name(&self) -> &str {
        self.slot.device.name()
    }

    pub fn device(&self) -> &Arc<IoDevice> {
        &self.slot.device
    }
}

impl<C> Clone for IoChannel<C> {
    fn clone(&self) -> Self {
        self.slot.refs.set(self.slot.refs.get() + 1);
        Self {
            slot: self.slot.clone(),
            _ctx: PhantomData,
        }
    }
}

impl<C> Debug for IoChannel<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "io channel for device '{}' ({} refs)",
            self.slot.device.name(),
            self.slot.refs.get(),
        )
    }
}

impl<C> Drop for IoChannel<C> {
    fn drop(&mut self) {
        let refs = self.slot.refs.get() - 1;
        self.slot.refs.set(refs);

        if refs > 0 {
            return;
        }

        let id = self.slot.device.id;
        CHANNELS.with(|map| map.borrow_mut().remove(&id));

        if let Some(ctx) = self.slot.ctx.borrow_mut().take() {
            trace!("{}: destroying I/O channel", self.slot.device.name);
            (self.slot.device.destroy_cb)(ctx);
        }
    }
}
