//! NVMe bdevs and multipath groups.
//!
//! A bdev group (`bdev_ctrlr`) clusters the controllers that expose the
//! same namespace set. Namespaces arriving on a new controller join the
//! bdev of the namespace they are equivalent with; a namespace without a
//! match creates and registers a fresh bdev. A controller leaving takes its
//! namespaces out and unregisters bdevs left without any.

use std::{
    collections::HashMap,
    sync::Arc,
};

use nix::errno::Errno;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};

use crate::core::{
    Bdev,
    BdevChannel,
    BdevIo,
    BdevModule,
    BdevOps,
    CoreError,
    DestructStatus,
    IoType,
    ModuleRegistry,
};

use super::{
    controller::{self, options::NvmeControllerOpts},
    handle::{self, NvmeBdevChannel},
    transport::{NvmeTransport, NvmeTransportId},
    NvmeNamespace,
    NVME_CONTROLLERS,
};

/// Name under which the NVMe bdev module registers itself.
pub const NVME_MODULE_NAME: &str = "nvmx";

struct NvmeBdevModule;

impl BdevModule for NvmeBdevModule {
    fn name(&self) -> &str {
        NVME_MODULE_NAME
    }
}

pub fn register_module() {
    ModuleRegistry::get().register(Arc::new(NvmeBdevModule));
}

/// A multipath group: the controllers sharing one namespace set, and the
/// bdevs built over it.
#[derive(Default)]
struct BdevCtrlrEntry {
    /// (controller name, cntlid); cntlids must be distinct within a group.
    ctrlrs: Vec<(String, u16)>,
    /// Names of the NVMe bdevs registered under this group.
    bdevs: Vec<String>,
}

static NVME_BDEV_CTRLRS: Lazy<Mutex<HashMap<String, BdevCtrlrEntry>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// All NVMe bdevs by bdev name; gives attach/detach access to the typed
/// backend behind the registered bdev.
static NVME_BDEVS: Lazy<Mutex<HashMap<String, Arc<NvmeBdev>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// An NVMe bdev: one namespace identity served by 1..N controllers of one
/// group.
pub struct NvmeBdev {
    name: String,
    group: String,
    ns_list: RwLock<Vec<Arc<NvmeNamespace>>>,
}

impl NvmeBdev {
    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn bdev_name(&self) -> &str {
        &self.name
    }

    /// Namespaces currently contributing paths to this bdev.
    pub fn namespaces(&self) -> Vec<Arc<NvmeNamespace>> {
        self.ns_list.read().clone()
    }

    fn matches(&self, ns: &NvmeNamespace) -> bool {
        self.ns_list.read().iter().any(|have| have.matches(ns))
    }

    /// Adds a namespace (a new path) and plugs it into every existing
    /// channel of this bdev.
    fn add_namespace(&self, bdev: &Bdev, ns: Arc<NvmeNamespace>) {
        info!(
            "{}: namespace of controller '{}' joins (multipath)",
            self.name,
            ns.ctrlr_name()
        );
        self.ns_list.write().push(ns.clone());

        fn visit(channel: &mut BdevChannel, ns: &mut Arc<NvmeNamespace>) -> i32 {
            handle::channel_add_path(channel, ns);
            0
        }
        fn done(_s: i32, _ns: Arc<NvmeNamespace>) {}

        bdev.io_device().traverse_io_channels(ns, visit, done);
    }

    /// Removes the namespace contributed by the given controller from all
    /// channels. Returns the number of namespaces left.
    fn remove_ctrlr_namespace(&self, bdev: &Bdev, ctrlr_name: &str) -> usize {
        let mut list = self.ns_list.write();
        list.retain(|ns| ns.ctrlr_name() != ctrlr_name);
        let left = list.len();
        drop(list);

        fn visit(channel: &mut BdevChannel, ctrlr: &mut String) -> i32 {
            handle::channel_remove_path(channel, ctrlr);
            0
        }
        fn done(_s: i32, _ctrlr: String) {}

        bdev.io_device()
            .traverse_io_channels(ctrlr_name.to_string(), visit, done);

        left
    }
}

impl BdevOps for NvmeBdev {
    fn destruct(&self) -> DestructStatus {
        NVME_BDEVS.lock().remove(&self.name);
        DestructStatus::Complete
    }

    fn submit_request(&self, io: BdevIo) {
        handle::submit_nvme_io(io);
    }

    fn io_type_supported(&self, io_type: IoType) -> bool {
        let supports = |f: fn(&NvmeNamespace) -> bool| {
            self.ns_list.read().first().map_or(false, |ns| f(ns))
        };

        match io_type {
            IoType::Read | IoType::Write | IoType::Flush | IoType::Reset => {
                true
            }
            IoType::Abort => true,
            IoType::Unmap => supports(NvmeNamespace::supports_deallocate),
            IoType::WriteZeros => {
                supports(NvmeNamespace::supports_write_zeroes)
            }
            IoType::Compare | IoType::CompareAndWrite => {
                supports(NvmeNamespace::supports_compare)
            }
            _ => false,
        }
    }

    fn open_channel(&self) -> Result<Box<dyn std::any::Any>, CoreError> {
        Ok(Box::new(NvmeBdevChannel::new(
            &self.name,
            self.namespaces(),
        )?))
    }

    fn dump_info_json(&self) -> serde_json::Value {
        serde_json::json!({
            "group": self.group,
            "paths": self
                .ns_list
                .read()
                .iter()
                .map(|ns| serde_json::json!({
                    "ctrlr": ns.ctrlr_name(),
                    "nsid": ns.nsid(),
                    "ana_state": format!("{:?}", ns.ana_state()),
                }))
                .collect::<Vec<_>>(),
        })
    }
}

/// Attaches a controller to a multipath group: connects it, verifies the
/// cntlid is unique within the group, and joins or creates the NVMe bdevs
/// for its namespaces. Returns the names of newly created bdevs.
pub async fn attach_controller(
    group_name: &str,
    ctrlr_name: &str,
    trid: NvmeTransportId,
    transport: Arc<dyn NvmeTransport>,
    opts: NvmeControllerOpts,
) -> Result<Vec<String>, CoreError> {
    controller::connect_controller(ctrlr_name, trid, transport, opts).await?;

    let carc = NVME_CONTROLLERS
        .lookup_by_name(ctrlr_name)
        .expect("controller vanished after connect");

    let (cntlid, namespaces) = {
        let c = carc.lock();
        (c.cntlid(), c.namespaces())
    };

    // Register in the group; duplicate cntlids make a group ambiguous and
    // are rejected.
    {
        let mut groups = NVME_BDEV_CTRLRS.lock();
        let entry = groups.entry(group_name.to_string()).or_default();

        if entry.ctrlrs.iter().any(|(_, id)| *id == cntlid) {
            drop(groups);
            error!(
                "{}: controller with cntlid {} already in group '{}'",
                ctrlr_name, cntlid, group_name
            );
            controller::destroy_device(ctrlr_name.to_string()).await.ok();
            return Err(CoreError::BdevAlreadyExists {
                name: format!("{}:cntlid:{}", group_name, cntlid),
            });
        }

        entry
            .ctrlrs
            .push((ctrlr_name.to_string(), cntlid));
    }

    let mut created = Vec::new();

    for ns in namespaces {
        // Multipath join: an equivalent namespace already backs a bdev of
        // this group.
        let existing = {
            let groups = NVME_BDEV_CTRLRS.lock();
            let bdevs = NVME_BDEVS.lock();
            groups
                .get(group_name)
                .map(|e| e.bdevs.clone())
                .unwrap_or_default()
                .into_iter()
                .filter_map(|name| bdevs.get(&name).cloned())
                .find(|nb| nb.matches(&ns))
        };

        match existing {
            Some(nb) => {
                let bdev = Bdev::lookup_unchecked(&nb.name).ok_or_else(|| {
                    CoreError::BdevNotFound {
                        name: nb.name.clone(),
                    }
                })?;
                nb.add_namespace(&bdev, ns);
            }
            None => {
                let name = create_nvme_bdev(group_name, ns)?;
                created.push(name);
            }
        }
    }

    Ok(created)
}

/// Builds and registers a fresh NVMe bdev over one namespace.
fn create_nvme_bdev(
    group_name: &str,
    ns: Arc<NvmeNamespace>,
) -> Result<String, CoreError> {
    let name = format!("{}n{}", group_name, ns.nsid());

    let nb = Arc::new(NvmeBdev {
        name: name.clone(),
        group: group_name.to_string(),
        ns_list: RwLock::new(vec![ns.clone()]),
    });

    let mut builder = Bdev::builder()
        .with_name(&name)
        .with_product_name(crate::constants::NVME_CONTROLLER_MODEL_ID)
        .with_module(NVME_MODULE_NAME)
        .with_block_length(ns.block_len() as u32)
        .with_num_blocks(ns.num_blocks())
        .with_md_len(ns.md_size() as u32)
        .with_ops(nb.clone());

    // Carry the namespace identity over when the target reports one.
    if let Some(uuid) = ns.uuid() {
        builder = builder.with_uuid(uuid);
    }
    let bdev = builder.build();

    NVME_BDEVS.lock().insert(name.clone(), nb);

    bdev.register().map_err(|e| {
        NVME_BDEVS.lock().remove(&name);
        e
    })?;

    NVME_BDEV_CTRLRS
        .lock()
        .entry(group_name.to_string())
        .or_default()
        .bdevs
        .push(name.clone());

    Ok(name)
}

/// Detaches a controller from its group: its namespaces leave their bdevs
/// and bdevs without remaining namespaces are unregistered.
pub fn detach_controller(ctrlr_name: &str) {
    let mut groups = NVME_BDEV_CTRLRS.lock();

    for (group, entry) in groups.iter_mut() {
        if !entry.ctrlrs.iter().any(|(n, _)| n == ctrlr_name) {
            continue;
        }

        debug!("{}: leaving group '{}'", ctrlr_name, group);
        entry.ctrlrs.retain(|(n, _)| n != ctrlr_name);

        let bdevs = entry.bdevs.clone();
        for name in bdevs {
            let nb = match NVME_BDEVS.lock().get(&name).cloned() {
                Some(nb) => nb,
                None => continue,
            };
            let bdev = match Bdev::lookup_unchecked(&name) {
                Some(b) => b,
                None => continue,
            };

            if nb.remove_ctrlr_namespace(&bdev, ctrlr_name) == 0 {
                info!("{}: last path gone, unregistering bdev", name);
                entry.bdevs.retain(|b| *b != name);
                crate::core::Reactors::primary().send_msg(move || {
                    bdev.unregister(|_| {});
                });
            }
        }
    }

    groups.retain(|_, e| !e.ctrlrs.is_empty() || !e.bdevs.is_empty());
}

/// Handles a namespace attribute change: re-reads the geometry and
/// propagates a resize to the bdev.
pub(super) fn nvme_bdev_ns_changed(ctrlr_name: &str, nsid: u32) {
    let ns = match NVME_CONTROLLERS
        .lookup_by_name(ctrlr_name)
        .and_then(|c| c.lock().namespace(nsid))
    {
        Some(ns) => ns,
        None => return,
    };

    let new_blocks = ns.num_blocks();

    let bdevs = NVME_BDEVS.lock().values().cloned().collect::<Vec<_>>();
    for nb in bdevs {
        let has = nb
            .ns_list
            .read()
            .iter()
            .any(|n| n.ctrlr_name() == ctrlr_name && n.nsid() == nsid);
        if has {
            if let Some(bdev) = Bdev::lookup_unchecked(&nb.name) {
                bdev.notify_blockcnt_change(new_blocks);
            }
        }
    }
}

/// Submits an admin command with a custom opcode through any healthy
/// controller of the group, honoring the bdev retry budget.
pub async fn nvme_admin_custom(
    group_name: &str,
    opcode: u8,
) -> Result<(), CoreError> {
    let retry_limit = super::nvme_bdev_running_config().bdev_retry_count;
    let mut attempts = 0_i32;

    loop {
        let ctrlrs = NVME_BDEV_CTRLRS
            .lock()
            .get(group_name)
            .map(|e| e.ctrlrs.clone())
            .unwrap_or_default();

        // Route to a controller whose admin queue is healthy.
        let healthy = ctrlrs
            .iter()
            .filter_map(|(name, _)| NVME_CONTROLLERS.lookup_by_name(name))
            .find(|c| {
                let c = c.lock();
                c.get_state() == super::NvmeControllerState::Running
                    && c.transport_ctrlr().map_or(false, |t| !t.is_failed())
            });

        let ctrlr = match healthy {
            Some(c) => c,
            None => {
                return Err(CoreError::NvmeAdminDispatch {
                    source: Errno::ENXIO,
                    opcode: opcode as u16,
                })
            }
        };

        let transport_ctrlr = {
            let c = ctrlr.lock();
            c.transport_ctrlr().ok_or(CoreError::NvmeAdminDispatch {
                source: Errno::ENXIO,
                opcode: opcode as u16,
            })?
        };

        let (s, r) = futures::channel::oneshot::channel();
        transport_ctrlr
            .admin_cmd(
                opcode,
                Box::new(move |status| {
                    s.send(status).ok();
                }),
            )
            .map_err(|e| CoreError::NvmeAdminDispatch {
                source: e,
                opcode: opcode as u16,
            })?;

        let status = r.await.map_err(|_| CoreError::NvmeAdminFailed {
            source: Errno::EIO,
            opcode: opcode as u16,
        })?;

        if status.succeeded() {
            return Ok(());
        }

        attempts += 1;
        if !status.is_retryable()
            || (retry_limit >= 0 && attempts > retry_limit)
        {
            return Err(CoreError::NvmeAdminFailed {
                source: Errno::EIO,
                opcode: opcode as u16,
            });
        }
    }
}

/// Lists the controllers of a multipath group.
pub fn group_controllers(group_name: &str) -> Vec<String> {
    NVME_BDEV_CTRLRS
        .lock()
        .get(group_name)
        .map(|e| e.ctrlrs.iter().map(|(n, _)| n.clone()).collect())
        .unwrap_or_default()
}
