//!
//! core contains the primary abstractions around the engine primitives.
use std::fmt::{Debug, Formatter};

use nix::errno::Errno;
use snafu::Snafu;

pub use bdev::{Bdev, BdevIter, BdevOps, DestructStatus};
pub use bdev_io::{
    BdevChannel,
    BdevIo,
    BouncePolicy,
    IoCompletionFn,
    IoStatus,
    IoType,
};
pub use bdev_module::{BdevModule, ModuleOpStatus, ModuleRegistry};
pub use block_device::{
    BlockDevice,
    BlockDeviceDescriptor,
    BlockDeviceHandle,
    BlockDeviceIoStats,
    DeviceIoController,
    DeviceTimeoutAction,
    IoCompletionCallback,
    OpCompletionCallback,
    ReadOptions,
};
pub use descriptor::DescriptorGuard;
pub use device_events::{
    DeviceEventDispatcher,
    DeviceEventListener,
    DeviceEventSink,
    DeviceEventType,
};
pub use dma::{DmaBuf, DmaError, IoVec};
pub use env::{engine_env_stop, EngineEnvironment};
pub use handle::BdevHandle;
pub use io_device::{IoChannel, IoDevice};
pub use mempool::MemoryPool;
pub use nvme::{
    GenericStatusCode,
    MediaErrorStatusCode,
    NvmeCommandStatus,
    NvmeStatus,
    PathStatusCode,
};
pub use reactor::{current_core, Reactor, ReactorState, Reactors, REACTOR_LIST};
pub use sleep::engine_sleep;

pub use lock::LbaRange;

mod bdev;
mod bdev_io;
mod bdev_module;
mod block_device;
mod descriptor;
mod device_events;
mod dma;
mod env;
mod handle;
mod io_device;
pub mod lock;
pub mod mempool;
mod nvme;
pub mod poller;
mod reactor;
pub mod sleep;

/// Obtain the full error chain
pub trait VerboseError {
    fn verbose(&self) -> String;
}

impl<T> VerboseError for T
where
    T: std::error::Error,
{
    /// loops through the error chain and formats into a single string
    /// containing all the lower level errors
    fn verbose(&self) -> String {
        let mut msg = format!("{self}");
        let mut opt_source = self.source();
        while let Some(source) = opt_source {
            msg = format!("{msg}: {source}");
            opt_source = source.source();
        }
        msg
    }
}

#[derive(Debug, Snafu, Clone)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum CoreError {
    #[snafu(display("bdev {} not found", name))]
    BdevNotFound {
        name: String,
    },
    #[snafu(display("bdev {} already exists", name))]
    BdevAlreadyExists {
        name: String,
    },
    #[snafu(display("bdev {} already claimed by module {}", name, claimant))]
    BdevAlreadyClaimed {
        name: String,
        claimant: String,
    },
    #[snafu(display("bdev module {} not found", name))]
    BdevModuleNotFound {
        name: String,
    },
    #[snafu(display("failed to open bdev"))]
    OpenBdev {
        source: Errno,
    },
    #[snafu(display("invalid descriptor for bdev {}", name))]
    InvalidDescriptor {
        name: String,
    },
    #[snafu(display("failed to get IO channel for {}", name))]
    GetIoChannel {
        name: String,
    },
    InvalidOffset {
        offset: u64,
    },
    #[snafu(display(
        "Failed to dispatch write at offset {} length {}",
        offset,
        len
    ))]
    WriteDispatch {
        source: Errno,
        offset: u64,
        len: u64,
    },
    #[snafu(display(
        "Failed to dispatch compare at offset {} length {}",
        offset,
        len
    ))]
    CompareDispatch {
        source: Errno,
        offset: u64,
        len: u64,
    },
    #[snafu(display(
        "Failed to dispatch read at offset {} length {}",
        offset,
        len
    ))]
    ReadDispatch {
        source: Errno,
        offset: u64,
        len: u64,
    },
    #[snafu(display(
        "Failed to dispatch unmap at offset {} length {}",
        offset,
        len
    ))]
    UnmapDispatch {
        source: Errno,
        offset: u64,
        len: u64,
    },
    #[snafu(display(
        "Failed to dispatch write-zeroes at offset {} length {}",
        offset,
        len
    ))]
    WriteZeroesDispatch {
        source: Errno,
        offset: u64,
        len: u64,
    },
    #[snafu(display("Failed to dispatch reset: {}", source))]
    ResetDispatch {
        source: Errno,
    },
    #[snafu(display("Failed to dispatch flush: {}", source))]
    FlushDispatch {
        source: Errno,
    },
    #[snafu(display("Failed to dispatch abort: {}", source))]
    AbortDispatch {
        source: Errno,
    },
    #[snafu(display(
        "Failed to dispatch NVMe Admin command {:x}h: {}",
        opcode,
        source
    ))]
    NvmeAdminDispatch {
        source: Errno,
        opcode: u16,
    },
    #[snafu(display(
        "Failed to dispatch NVMe IO passthru command {:x}h: {}",
        opcode,
        source
    ))]
    NvmeIoPassthruDispatch {
        source: Errno,
        opcode: u16,
    },
    #[snafu(display(
        "Write failed at offset {} length {} with status {:?}",
        offset,
        len,
        status
    ))]
    WriteFailed {
        status: IoCompletionStatus,
        offset: u64,
        len: u64,
    },
    #[snafu(display(
        "Read failed at offset {} length {} with status {:?}",
        offset,
        len,
        status
    ))]
    ReadFailed {
        status: IoCompletionStatus,
        offset: u64,
        len: u64,
    },
    #[snafu(display(
        "Compare failed at offset {} length {} with status {:?}",
        offset,
        len,
        status
    ))]
    CompareFailed {
        status: IoCompletionStatus,
        offset: u64,
        len: u64,
    },
    #[snafu(display("Reset failed"))]
    ResetFailed {},
    #[snafu(display(
        "Write zeroes failed at offset {} length {}",
        offset,
        len
    ))]
    WriteZeroesFailed {
        offset: u64,
        len: u64,
    },
    #[snafu(display("NVMe Admin command {:x}h failed: {}", opcode, source))]
    NvmeAdminFailed {
        source: Errno,
        opcode: u16,
    },
    #[snafu(display("NVMe IO Passthru command {:x}h failed", opcode))]
    NvmeIoPassthruFailed {
        opcode: u16,
    },
    #[snafu(display("the operation is invalid for this bdev: {}", source))]
    NotSupported {
        source: Errno,
    },
    #[snafu(display("failed to configure reactor: {}", source))]
    ReactorConfigureFailed {
        source: Errno,
    },
    #[snafu(display("Failed to allocate DMA buffer of {} bytes", size))]
    DmaAllocationFailed {
        size: u64,
    },
    #[snafu(display("Failed to get I/O satistics for device: {}", source))]
    DeviceStatisticsFailed {
        source: Errno,
    },
    #[snafu(display("No devices available for I/O"))]
    NoDevicesAvailable {},
    #[snafu(display("Invalid NVMe device handle: {}", msg))]
    InvalidNvmeDeviceHandle {
        msg: String,
    },
    #[snafu(display("errno: {} Device Flush {}", source, name))]
    DeviceFlush {
        source: Errno,
        name: String,
    },
    #[snafu(display("Device {} has been removed", name))]
    DeviceRemoved {
        name: String,
    },
    #[snafu(display("Controller {} is busy: {}", name, source))]
    ControllerBusy {
        source: Errno,
        name: String,
    },
}

/// Represent error as Errno value.
pub trait ToErrno {
    fn to_errno(self) -> Errno;
}

/// Map CoreError to errno code.
impl ToErrno for CoreError {
    fn to_errno(self) -> Errno {
        match self {
            Self::BdevNotFound {
                ..
            } => Errno::ENODEV,
            Self::BdevAlreadyExists {
                ..
            } => Errno::EEXIST,
            Self::BdevAlreadyClaimed {
                ..
            } => Errno::EPERM,
            Self::BdevModuleNotFound {
                ..
            } => Errno::ENODEV,
            Self::OpenBdev {
                source,
            } => source,
            Self::InvalidDescriptor {
                ..
            } => Errno::ENODEV,
            Self::GetIoChannel {
                ..
            } => Errno::ENXIO,
            Self::InvalidOffset {
                ..
            } => Errno::EINVAL,
            Self::WriteDispatch {
                source, ..
            }
            | Self::ReadDispatch {
                source, ..
            }
            | Self::CompareDispatch {
                source, ..
            }
            | Self::UnmapDispatch {
                source, ..
            }
            | Self::WriteZeroesDispatch {
                source, ..
            }
            | Self::ResetDispatch {
                source, ..
            }
            | Self::FlushDispatch {
                source, ..
            }
            | Self::AbortDispatch {
                source, ..
            }
            | Self::NvmeAdminDispatch {
                source, ..
            }
            | Self::NvmeIoPassthruDispatch {
                source, ..
            } => source,
            Self::WriteFailed {
                ..
            }
            | Self::ReadFailed {
                ..
            }
            | Self::CompareFailed {
                ..
            }
            | Self::ResetFailed {
                ..
            }
            | Self::WriteZeroesFailed {
                ..
            }
            | Self::NvmeIoPassthruFailed {
                ..
            } => Errno::EIO,
            Self::NvmeAdminFailed {
                source, ..
            } => source,
            Self::NotSupported {
                source, ..
            } => source,
            Self::ReactorConfigureFailed {
                source, ..
            } => source,
            Self::DmaAllocationFailed {
                ..
            } => Errno::ENOMEM,
            Self::DeviceStatisticsFailed {
                source, ..
            } => source,
            Self::NoDevicesAvailable {
                ..
            } => Errno::ENODEV,
            Self::InvalidNvmeDeviceHandle {
                ..
            } => Errno::EINVAL,
            Self::DeviceFlush {
                source, ..
            } => source,
            Self::DeviceRemoved {
                ..
            } => Errno::ENXIO,
            Self::ControllerBusy {
                source, ..
            } => source,
        }
    }
}

/// I/O submission failure.
#[derive(Debug, Copy, Clone, Eq, PartialOrd, PartialEq)]
pub enum IoSubmissionFailure {
    Read,
    Write,
}

// Generic I/O completion status for block devices, which supports per-protocol
// error domains.
#[derive(Copy, Clone, Eq, PartialOrd, PartialEq)]
pub enum IoCompletionStatus {
    Success,
    NvmeError(NvmeStatus),
    IoSubmissionError(IoSubmissionFailure),
    AdminCommandError,
    Aborted,
}

impl Debug for IoCompletionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            IoCompletionStatus::Success => write!(f, "Success"),
            IoCompletionStatus::NvmeError(s) => write!(f, "NvmeError/{s:?}"),
            IoCompletionStatus::IoSubmissionError(s) => {
                write!(f, "IoSubmissionError/{s:?}")
            }
            IoCompletionStatus::AdminCommandError => {
                write!(f, "AdminCommandError")
            }
            IoCompletionStatus::Aborted => write!(f, "Aborted"),
        }
    }
}

impl From<NvmeStatus> for IoCompletionStatus {
    fn from(s: NvmeStatus) -> Self {
        if s == NvmeStatus::Generic(GenericStatusCode::Success) {
            IoCompletionStatus::Success
        } else {
            IoCompletionStatus::NvmeError(s)
        }
    }
}

impl From<IoStatus> for IoCompletionStatus {
    fn from(s: IoStatus) -> Self {
        match s {
            IoStatus::Success => IoCompletionStatus::Success,
            IoStatus::Aborted => IoCompletionStatus::Aborted,
            IoStatus::NoMemory => IoCompletionStatus::IoSubmissionError(
                IoSubmissionFailure::Write,
            ),
            _ => IoCompletionStatus::NvmeError(NvmeStatus::Generic(
                GenericStatusCode::InternalDeviceError,
            )),
        }
    }
}
