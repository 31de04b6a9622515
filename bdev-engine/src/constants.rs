/// Data plane's NVMe controller model ID.
pub const NVME_CONTROLLER_MODEL_ID: &str = "Engine NVMe controller";

/// NVMe NQN prefix.
pub const NVME_NQN_PREFIX: &str = "nqn.2019-05.io.engine";

/// Partition driver name.
pub const PART_DRIVER: &str = "part";

/// Maximum number of scatter/gather entries a split child may carry.
pub const BDEV_IO_NUM_CHILD_IOV: usize = 32;
