//! Per-subsystem option sections of the engine configuration.

use serde::{Deserialize, Serialize};

/// Try to read an environment variable and if set, parse it into the target
/// type, falling back to the given default on absence or parse failure.
fn try_from_env<T>(name: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Generic bdev layer options.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct BdevOpts {
    /// number of bdev IO structures in the shared mempool
    pub bdev_io_pool_size: u32,
    /// number of bdev IO structures cached per thread
    pub bdev_io_cache_size: u32,
}

impl Default for BdevOpts {
    fn default() -> Self {
        Self {
            bdev_io_pool_size: try_from_env("BDEV_IO_POOL_SIZE", 65535),
            bdev_io_cache_size: try_from_env("BDEV_IO_CACHE_SIZE", 512),
        }
    }
}

/// NVMe bdev driver options.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct NvmeBdevOpts {
    /// timeout for IO commands, in microseconds
    pub timeout_us: u64,
    /// timeout for admin commands, in microseconds
    pub timeout_admin_us: u64,
    /// keep-alive timeout, in milliseconds
    pub keep_alive_timeout_ms: u32,
    /// transport retry count
    pub transport_retry_count: u32,
    /// admin queue polling period, in microseconds
    pub nvme_adminq_poll_period_us: u64,
    /// ioq polling period, in microseconds
    pub nvme_ioq_poll_period_us: u64,
    /// number of requests per nvme IO queue
    pub io_queue_requests: u32,
    /// attempts per I/O in the bdev layer before the I/O fails;
    /// -1 retries without bound
    pub bdev_retry_count: i32,
    /// upper bound on reconnect attempts after controller loss, in seconds;
    /// -1 never gives up, 0 deletes the controller right away
    pub ctrlr_loss_timeout_sec: i32,
    /// delay between reconnect attempts, in seconds; 0 disables reconnects
    pub reconnect_delay_sec: u32,
    /// time after which queued I/O fails while reconnects continue,
    /// in seconds; 0 disables the fast path failure
    pub fast_io_fail_timeout_sec: u32,
}

impl Default for NvmeBdevOpts {
    fn default() -> Self {
        Self {
            timeout_us: try_from_env("NVME_TIMEOUT_US", 5_000_000),
            timeout_admin_us: try_from_env("NVME_TIMEOUT_ADMIN_US", 5_000_000),
            keep_alive_timeout_ms: try_from_env("NVME_KATO_MS", 1_000),
            transport_retry_count: try_from_env("NVME_QPAIR_RETRY_COUNT", 0),
            nvme_adminq_poll_period_us: try_from_env(
                "NVME_ADMINQ_POLL_PERIOD_US",
                1_000,
            ),
            nvme_ioq_poll_period_us: try_from_env("NVME_IOQ_POLL_PERIOD_US", 0),
            io_queue_requests: try_from_env("NVME_IO_QUEUE_REQUESTS", 0),
            bdev_retry_count: try_from_env("NVME_BDEV_RETRY_COUNT", 0),
            ctrlr_loss_timeout_sec: try_from_env(
                "NVME_CTRLR_LOSS_TIMEOUT_SEC",
                -1,
            ),
            reconnect_delay_sec: try_from_env("NVME_RECONNECT_DELAY_SEC", 0),
            fast_io_fail_timeout_sec: try_from_env(
                "NVME_FAST_IO_FAIL_TIMEOUT_SEC",
                0,
            ),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn nvme_bdev_opts_defaults() {
        let opts = NvmeBdevOpts::default();
        assert_eq!(opts.bdev_retry_count, 0);
        assert_eq!(opts.ctrlr_loss_timeout_sec, -1);
        assert_eq!(opts.reconnect_delay_sec, 0);
        assert_eq!(opts.fast_io_fail_timeout_sec, 0);
    }
}
