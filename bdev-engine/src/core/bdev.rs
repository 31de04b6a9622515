//! The bdev registry: named block devices, aliases, claims, descriptors and
//! the register/unregister life cycle.
//!
//! The name tree and module list are only mutated on the primary reactor;
//! lookups may happen from any thread. A bdev becomes visible to `open`
//! callers only after the examine pipeline has drained, and is destructed
//! only after the last descriptor has been closed.

use std::{
    collections::HashMap,
    fmt::{Debug, Display, Formatter},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
};

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::core::{
    bdev_io::BdevChannel,
    bdev_module::examine_bdev,
    descriptor::{DescInner, DescriptorGuard},
    BdevIo,
    BlockDeviceIoStats,
    CoreError,
    DeviceEventType,
    IoChannel,
    IoDevice,
    IoType,
    Reactors,
};

/// Outcome of a backend destruct call.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DestructStatus {
    /// Resources were torn down synchronously.
    Complete,
    /// The backend finishes asynchronously and calls `Bdev::destruct_done`.
    Async,
}

/// The function table every bdev backend implements.
pub trait BdevOps: Send + Sync + 'static {
    /// Tear down backend resources. Returning `Async` defers the final
    /// release until the backend calls `Bdev::destruct_done`.
    fn destruct(&self) -> DestructStatus {
        DestructStatus::Complete
    }

    /// Submit an I/O to the backend. The backend owns the request until it
    /// completes it; completion may happen inside this call or later.
    fn submit_request(&self, io: BdevIo);

    /// Whether the backend supports the given I/O type.
    fn io_type_supported(&self, io_type: IoType) -> bool;

    /// Per-thread channel context of the backend, type erased. The bdev
    /// layer keeps it alive for the lifetime of its own channel.
    fn open_channel(&self) -> Result<Box<dyn std::any::Any>, CoreError>;

    /// Human readable details for introspection.
    fn dump_info_json(&self) -> serde_json::Value {
        serde_json::json!({})
    }

    /// Configuration that reconstitutes this bdev, if any.
    fn write_config_json(&self) -> Option<serde_json::Value> {
        None
    }
}

pub(crate) struct BdevInner {
    name: String,
    product_name: String,
    uuid: Uuid,
    module: String,
    block_len: u32,
    num_blocks: AtomicU64,
    /// log2 of the required payload alignment; 0 means none.
    required_alignment: u8,
    optimal_io_boundary: u64,
    split_on_optimal_io_boundary: bool,
    md_len: u32,
    ops: Arc<dyn BdevOps>,
    io_device: Mutex<Option<Arc<IoDevice>>>,
    aliases: RwLock<Vec<String>>,
    claimed_by: Mutex<Option<String>>,
    pub(crate) descriptors: Mutex<Vec<Arc<DescInner>>>,
    removing: AtomicBool,
    available: AtomicBool,
    examine_pending: AtomicU32,
    unregister_cb: Mutex<Option<Box<dyn FnOnce(i32) + Send>>>,
}

/// Newtype structure that represents a block device. Once obtained from the
/// registry the operations on the bdev are safe; removal is routed through
/// the primary reactor while lookups may happen anywhere.
#[derive(Clone)]
pub struct Bdev(pub(crate) Arc<BdevInner>);

struct Registry {
    bdevs: HashMap<String, Bdev>,
    /// alias -> bdev name
    aliases: HashMap<String, String>,
}

static BDEV_REGISTRY: Lazy<RwLock<Registry>> = Lazy::new(|| {
    RwLock::new(Registry {
        bdevs: HashMap::new(),
        aliases: HashMap::new(),
    })
});

impl Debug for Bdev {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bdev")
            .field("name", &self.0.name)
            .field("module", &self.0.module)
            .field("num_blocks", &self.0.num_blocks.load(Ordering::Relaxed))
            .field("block_len", &self.0.block_len)
            .finish()
    }
}

impl Display for Bdev {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.name)
    }
}

impl Bdev {
    pub fn builder() -> Builder {
        Builder::default()
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn product_name(&self) -> &str {
        &self.0.product_name
    }

    pub fn uuid(&self) -> Uuid {
        self.0.uuid
    }

    pub fn uuid_as_string(&self) -> String {
        self.0.uuid.hyphenated().to_string()
    }

    /// Returns the name of driver module for the given Bdev.
    pub fn driver(&self) -> &str {
        &self.0.module
    }

    pub fn block_len(&self) -> u32 {
        self.0.block_len
    }

    pub fn num_blocks(&self) -> u64 {
        self.0.num_blocks.load(Ordering::Acquire)
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.num_blocks() * self.block_len() as u64
    }

    /// log2 of the required payload alignment
    pub fn alignment(&self) -> u8 {
        self.0.required_alignment
    }

    pub fn optimal_io_boundary(&self) -> u64 {
        self.0.optimal_io_boundary
    }

    pub fn split_on_optimal_io_boundary(&self) -> bool {
        self.0.split_on_optimal_io_boundary
    }

    pub fn md_len(&self) -> u32 {
        self.0.md_len
    }

    pub(crate) fn ops(&self) -> &Arc<dyn BdevOps> {
        &self.0.ops
    }

    pub fn io_type_supported(&self, io_type: IoType) -> bool {
        self.0.ops.io_type_supported(io_type)
    }

    pub fn dump_info_json(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name(),
            "aliases": self.aliases(),
            "uuid": self.uuid_as_string(),
            "product_name": self.product_name(),
            "module": self.driver(),
            "block_len": self.block_len(),
            "num_blocks": self.num_blocks(),
            "claimed_by": self.claimed_by(),
            "driver_specific": self.0.ops.dump_info_json(),
        })
    }

    /// The io-device producing this bdev's per-thread channels. Only valid
    /// once the bdev is registered.
    pub(crate) fn io_device(&self) -> Arc<IoDevice> {
        self.0
            .io_device
            .lock()
            .clone()
            .expect("bdev is not registered, no io device")
    }

    /// Acquires the per-thread channel used to submit I/O to this bdev.
    pub fn get_io_channel(
        &self,
    ) -> Result<IoChannel<BdevChannel>, CoreError> {
        self.io_device().get_io_channel::<BdevChannel>()
    }

    // -- registry ----------------------------------------------------------

    /// Inserts the bdev into the registry and runs the examine pipeline.
    /// Fails when the name or any alias collides with an existing name or
    /// alias.
    pub fn register(&self) -> Result<(), CoreError> {
        assert!(
            Reactors::current().map_or(false, |r| r.is_primary()),
            "bdev registration must happen on the primary reactor"
        );

        {
            let mut reg = BDEV_REGISTRY.write();

            if reg.bdevs.contains_key(self.name())
                || reg.aliases.contains_key(self.name())
            {
                return Err(CoreError::BdevAlreadyExists {
                    name: self.name().to_string(),
                });
            }

            reg.bdevs.insert(self.name().to_string(), self.clone());
        }

        // The io-device exists for as long as the bdev stays registered; the
        // channel constructor must not keep the bdev alive on its own.
        let weak = Arc::downgrade(&self.0);
        *self.0.io_device.lock() = Some(IoDevice::new::<BdevChannel>(
            self.name(),
            move || match weak.upgrade() {
                Some(inner) => BdevChannel::new(&Bdev(inner)),
                None => Err(nix::errno::Errno::ENODEV),
            },
            BdevChannel::destroy,
        ));

        info!("{:?}: bdev registered", self);
        examine_bdev(self);
        Ok(())
    }

    /// Flags the bdev removed and delivers a remove event to every open
    /// descriptor. The final destruct happens when the last descriptor
    /// closes; `cb` fires with the destruct status afterwards.
    pub fn unregister<F>(&self, cb: F)
    where
        F: FnOnce(i32) + Send + 'static,
    {
        if self.0.removing.swap(true, Ordering::AcqRel) {
            warn!("{:?}: unregister already in progress", self);
            cb(libc::EALREADY);
            return;
        }

        *self.0.unregister_cb.lock() = Some(Box::new(cb));
        info!("{:?}: unregistering bdev", self);

        let descriptors = self.0.descriptors.lock().clone();
        if descriptors.is_empty() {
            self.do_destruct();
            return;
        }

        for d in descriptors {
            d.deliver_event(DeviceEventType::DeviceRemoved);
        }

        // Descriptor holders close in response to the remove event; the
        // last close continues the destruct.
    }

    /// Called when a descriptor has been closed.
    pub(crate) fn descriptor_closed(&self, desc: &Arc<DescInner>) {
        let mut descriptors = self.0.descriptors.lock();
        descriptors.retain(|d| !Arc::ptr_eq(d, desc));
        let empty = descriptors.is_empty();
        drop(descriptors);

        if empty && self.0.removing.load(Ordering::Acquire) {
            self.do_destruct();
        }
    }

    fn do_destruct(&self) {
        debug!("{:?}: destructing bdev", self);
        match self.0.ops.destruct() {
            DestructStatus::Complete => self.destruct_done(0),
            DestructStatus::Async => {
                debug!("{:?}: deferred destruct", self)
            }
        }
    }

    /// Completes an unregister; called by the core for synchronous destructs
    /// and by backends once an asynchronous destruct finished.
    pub fn destruct_done(&self, status: i32) {
        {
            let mut reg = BDEV_REGISTRY.write();
            reg.bdevs.remove(self.name());
            let name = self.name().to_string();
            reg.aliases.retain(|_, v| *v != name);
        }

        // Channels still held keep the io-device alive through their slots.
        self.0.io_device.lock().take();

        info!("{:?}: bdev unregistered", self);

        if let Some(cb) = self.0.unregister_cb.lock().take() {
            cb(status);
        }
    }

    /// Looks up a Bdev by its name or alias. Bdevs still in examine and
    /// bdevs being removed are not returned.
    pub fn lookup_by_name(name: &str) -> Option<Self> {
        let reg = BDEV_REGISTRY.read();
        let bdev = match reg.bdevs.get(name) {
            Some(b) => Some(b),
            None => reg
                .aliases
                .get(name)
                .and_then(|real| reg.bdevs.get(real)),
        }?;

        if !bdev.0.available.load(Ordering::Acquire)
            || bdev.0.removing.load(Ordering::Acquire)
        {
            return None;
        }
        Some(bdev.clone())
    }

    /// Looks up a Bdev by its name, returning CoreError if the Bdev does
    /// not exist.
    pub fn get_by_name(name: &str) -> Result<Self, CoreError> {
        Self::lookup_by_name(name).ok_or_else(|| CoreError::BdevNotFound {
            name: name.to_string(),
        })
    }

    /// Looks up a Bdev by its uuid.
    pub fn lookup_by_uuid_str(uuid: &str) -> Option<Self> {
        BdevIter::new().find(|b| b.uuid_as_string() == uuid.to_lowercase())
    }

    /// Internal lookup that also returns bdevs still under examine; virtual
    /// bdev modules build on top of bdevs before they go public.
    pub(crate) fn lookup_unchecked(name: &str) -> Option<Self> {
        let reg = BDEV_REGISTRY.read();
        match reg.bdevs.get(name) {
            Some(b) => Some(b.clone()),
            None => reg
                .aliases
                .get(name)
                .and_then(|real| reg.bdevs.get(real))
                .cloned(),
        }
    }

    /// Number of registered bdevs, examined or not.
    pub fn bdev_count() -> usize {
        BDEV_REGISTRY.read().bdevs.len()
    }

    // -- descriptors -------------------------------------------------------

    /// Opens the bdev by name, returning a descriptor. Opening for write
    /// fails when the bdev has been claimed by a module.
    pub fn open_by_name(
        name: &str,
        read_write: bool,
        event_cb: impl Fn(DeviceEventType, &str) + Send + Sync + 'static,
    ) -> Result<DescriptorGuard, CoreError> {
        match Self::lookup_by_name(name) {
            Some(bdev) => bdev.open(read_write, event_cb),
            None => Err(CoreError::BdevNotFound {
                name: name.to_string(),
            }),
        }
    }

    /// Opens the current Bdev. A Bdev can be opened multiple times resulting
    /// in a new descriptor for each call.
    pub fn open(
        &self,
        read_write: bool,
        event_cb: impl Fn(DeviceEventType, &str) + Send + Sync + 'static,
    ) -> Result<DescriptorGuard, CoreError> {
        if self.0.removing.load(Ordering::Acquire) {
            return Err(CoreError::BdevNotFound {
                name: self.name().to_string(),
            });
        }

        if read_write {
            if let Some(claimant) = self.claimed_by() {
                warn!(
                    "{:?}: open for write blocked, claimed by '{}'",
                    self, claimant
                );
                return Err(CoreError::OpenBdev {
                    source: nix::errno::Errno::EPERM,
                });
            }
        }

        let inner = Arc::new(DescInner::new(
            self.clone(),
            read_write,
            Box::new(event_cb),
        ));
        self.0.descriptors.lock().push(inner.clone());

        Ok(DescriptorGuard::new(inner))
    }

    /// Number of open descriptors.
    pub fn open_count(&self) -> usize {
        self.0.descriptors.lock().len()
    }

    // -- claims ------------------------------------------------------------

    /// Takes the exclusive write claim for `module`. Fails when another
    /// module holds the claim already.
    pub fn claim(&self, module: &str) -> Result<(), CoreError> {
        let mut claimed = self.0.claimed_by.lock();
        match claimed.as_ref() {
            Some(claimant) if claimant != module => {
                Err(CoreError::BdevAlreadyClaimed {
                    name: self.name().to_string(),
                    claimant: claimant.clone(),
                })
            }
            Some(_) => Err(CoreError::BdevAlreadyClaimed {
                name: self.name().to_string(),
                claimant: module.to_string(),
            }),
            None => {
                debug!("{:?}: claimed by module '{}'", self, module);
                *claimed = Some(module.to_string());
                Ok(())
            }
        }
    }

    /// Releases the claim held on this bdev.
    pub fn release_claim(&self) {
        let mut claimed = self.0.claimed_by.lock();
        if let Some(claimant) = claimed.take() {
            debug!("{:?}: claim of module '{}' released", self, claimant);
        }
    }

    pub fn claimed_by(&self) -> Option<String> {
        self.0.claimed_by.lock().clone()
    }

    pub fn is_claimed(&self) -> bool {
        self.0.claimed_by.lock().is_some()
    }

    // -- aliases -----------------------------------------------------------

    /// Adds an alias; aliases share the bdev name uniqueness domain.
    pub fn alias_add(&self, alias: &str) -> Result<(), CoreError> {
        let mut reg = BDEV_REGISTRY.write();
        if reg.bdevs.contains_key(alias) || reg.aliases.contains_key(alias) {
            return Err(CoreError::BdevAlreadyExists {
                name: alias.to_string(),
            });
        }
        reg.aliases
            .insert(alias.to_string(), self.name().to_string());
        self.0.aliases.write().push(alias.to_string());
        Ok(())
    }

    /// Removes an alias of this bdev.
    pub fn alias_del(&self, alias: &str) -> Result<(), CoreError> {
        let mut aliases = self.0.aliases.write();
        let pos = aliases.iter().position(|a| a == alias).ok_or_else(|| {
            CoreError::BdevNotFound {
                name: alias.to_string(),
            }
        })?;
        aliases.remove(pos);
        BDEV_REGISTRY.write().aliases.remove(alias);
        Ok(())
    }

    pub fn aliases(&self) -> Vec<String> {
        self.0.aliases.read().clone()
    }

    // -- events ------------------------------------------------------------

    /// Updates the block count and notifies all descriptor holders.
    pub fn notify_blockcnt_change(&self, num_blocks: u64) {
        let old = self.0.num_blocks.swap(num_blocks, Ordering::AcqRel);
        if old == num_blocks {
            return;
        }

        info!(
            "{:?}: device resized from {} to {} blocks",
            self, old, num_blocks
        );

        for d in self.0.descriptors.lock().iter() {
            d.deliver_event(DeviceEventType::DeviceResized);
        }
    }

    /// Pushes a media management event batch to every descriptor holder.
    pub fn notify_media_management(&self) {
        for d in self.0.descriptors.lock().iter() {
            d.deliver_event(DeviceEventType::MediaManagement);
        }
    }

    // -- examine -----------------------------------------------------------

    pub(crate) fn examine_start(&self, n: u32) {
        self.0.examine_pending.fetch_add(n, Ordering::AcqRel);
    }

    pub(crate) fn examine_done(&self) {
        if self.0.examine_pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.available.store(true, Ordering::Release);
            debug!("{:?}: examine complete, bdev available", self);
        }
    }

    /// Whether the bdev finished examine and may be opened.
    pub fn is_available(&self) -> bool {
        self.0.available.load(Ordering::Acquire)
    }

    // -- statistics --------------------------------------------------------

    /// Aggregates per-channel I/O statistics across all reactors.
    pub async fn stats_async(&self) -> Result<BlockDeviceIoStats, CoreError> {
        use merge::Merge;

        struct StatsCtx {
            stats: BlockDeviceIoStats,
            sender: Option<futures::channel::oneshot::Sender<BlockDeviceIoStats>>,
        }

        fn account(channel: &mut BdevChannel, ctx: &mut StatsCtx) -> i32 {
            ctx.stats.merge(channel.stats());
            0
        }

        fn account_done(_status: i32, mut ctx: StatsCtx) {
            let stats = ctx.stats;
            ctx.sender
                .take()
                .expect("stats sender may not be None")
                .send(stats)
                .ok();
        }

        let (s, r) = futures::channel::oneshot::channel();
        self.io_device().traverse_io_channels(
            StatsCtx {
                stats: BlockDeviceIoStats::default(),
                sender: Some(s),
            },
            account,
            account_done,
        );

        r.await.map_err(|_| CoreError::DeviceStatisticsFailed {
            source: nix::errno::Errno::EAGAIN,
        })
    }
}

/// Iterator over a snapshot of all available bdevs.
pub struct BdevIter {
    entries: std::vec::IntoIter<Bdev>,
}

impl BdevIter {
    pub fn new() -> Self {
        let entries = BDEV_REGISTRY
            .read()
            .bdevs
            .values()
            .filter(|b| b.is_available())
            .cloned()
            .collect::<Vec<_>>();
        Self {
            entries: entries.into_iter(),
        }
    }
}

impl Default for BdevIter {
    fn default() -> Self {
        Self::new()
    }
}

impl Iterator for BdevIter {
    type Item = Bdev;

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next()
    }
}

/// Bdev builder.
#[derive(Default)]
pub struct Builder {
    name: Option<String>,
    product_name: Option<String>,
    uuid: Option<Uuid>,
    module: Option<String>,
    block_len: u32,
    num_blocks: u64,
    required_alignment: u8,
    optimal_io_boundary: u64,
    split_on_optimal_io_boundary: bool,
    md_len: u32,
    ops: Option<Arc<dyn BdevOps>>,
}

impl Builder {
    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_product_name<S: Into<String>>(mut self, name: S) -> Self {
        self.product_name = Some(name.into());
        self
    }

    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = Some(uuid);
        self
    }

    pub fn with_module<S: Into<String>>(mut self, module: S) -> Self {
        self.module = Some(module.into());
        self
    }

    pub fn with_block_length(mut self, len: u32) -> Self {
        self.block_len = len;
        self
    }

    pub fn with_num_blocks(mut self, blocks: u64) -> Self {
        self.num_blocks = blocks;
        self
    }

    /// log2 of the required payload alignment
    pub fn with_required_alignment(mut self, align: u8) -> Self {
        self.required_alignment = align;
        self
    }

    pub fn with_optimal_io_boundary(mut self, boundary: u64) -> Self {
        self.optimal_io_boundary = boundary;
        self
    }

    pub fn with_split_on_optimal_io_boundary(mut self, split: bool) -> Self {
        self.split_on_optimal_io_boundary = split;
        self
    }

    pub fn with_md_len(mut self, md_len: u32) -> Self {
        self.md_len = md_len;
        self
    }

    pub fn with_ops(mut self, ops: Arc<dyn BdevOps>) -> Self {
        self.ops = Some(ops);
        self
    }

    pub fn build(self) -> Bdev {
        let name = self.name.expect("bdev name is required");
        let block_len = self.block_len;
        assert!(block_len > 0, "block length may not be zero");

        Bdev(Arc::new(BdevInner {
            name,
            product_name: self
                .product_name
                .unwrap_or_else(|| String::from("bdev")),
            // Backends without a stable identity get a generated one.
            uuid: self.uuid.unwrap_or_else(Uuid::new_v4),
            module: self.module.expect("owning module is required"),
            block_len,
            num_blocks: AtomicU64::new(self.num_blocks),
            required_alignment: self.required_alignment,
            optimal_io_boundary: self.optimal_io_boundary,
            split_on_optimal_io_boundary: self.split_on_optimal_io_boundary
                && self.optimal_io_boundary > 0,
            md_len: self.md_len,
            ops: self.ops.expect("bdev function table is required"),
            io_device: Mutex::new(None),
            aliases: RwLock::new(Vec::new()),
            claimed_by: Mutex::new(None),
            descriptors: Mutex::new(Vec::new()),
            removing: AtomicBool::new(false),
            available: AtomicBool::new(false),
            examine_pending: AtomicU32::new(0),
            unregister_cb: Mutex::new(None),
        }))
    }
}
