//! Crate-wide error taxonomy.
//!
//! Every public operation in this crate returns `Result<T, Error>`; there is
//! no panicking control flow outside of tests. Errors are grouped into
//! sub-enums by kind (argument/state/device/volume/cluster/ecc/concurrency/
//! resource), the way the fatfs crate's (unused) `storage::err!` macro groups
//! `ReadError`/`WriteError`/`EraseError` and the way `hyrax_err` groups
//! `IoError`/`FsError` under one top-level `Error`.

use core::fmt::{self, Debug, Display};

/// Invalid argument or name error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ArgError {
    InvalidPath,
    NameTooLong,
    IllegalChar,
    /// Mixed case in a name that cannot be represented by the NTRes case
    /// bits; the caller should fall back to an LFN entry.
    MixedCaseDemotesToLfn,
}

impl Display for ArgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArgError::InvalidPath => "invalid path",
            ArgError::NameTooLong => "name too long",
            ArgError::IllegalChar => "name contains illegal characters",
            ArgError::MixedCaseDemotesToLfn => "mixed case name demotes to LFN",
        };
        f.write_str(s)
    }
}

/// Object lifecycle / state error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum StateError {
    NotOpen,
    AlreadyOpen,
    NotMounted,
    NotPresent,
    AlreadyExists,
    /// A handle observed a `refresh` counter mismatch against its volume.
    Stale,
}

impl Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StateError::NotOpen => "not open",
            StateError::AlreadyOpen => "already open",
            StateError::NotMounted => "not mounted",
            StateError::NotPresent => "not present",
            StateError::AlreadyExists => "already exists",
            StateError::Stale => "stale handle (volume was refreshed)",
        };
        f.write_str(s)
    }
}

/// Device driver error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum DeviceError {
    Io,
    Timeout,
    NotPresent,
    InvalidLowFormat,
    InvalidConfig,
}

impl Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceError::Io => "device I/O error",
            DeviceError::Timeout => "device timeout",
            DeviceError::NotPresent => "device not present",
            DeviceError::InvalidLowFormat => "invalid low-level format",
            DeviceError::InvalidConfig => "invalid device configuration",
        };
        f.write_str(s)
    }
}

/// Volume / filesystem level error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum VolumeError {
    PartitionNotFound,
    BadSuperblock,
    DirectoryFull,
    DeviceFull,
    EntryCorrupt,
    LabelNotFound,
    LabelInvalid,
    /// A named file or directory does not exist under the path searched.
    NotFound,
    /// `rmdir` target still has entries.
    NotEmpty,
}

impl Display for VolumeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VolumeError::PartitionNotFound => "partition not found",
            VolumeError::BadSuperblock => "bad superblock",
            VolumeError::DirectoryFull => "directory full",
            VolumeError::DeviceFull => "device full",
            VolumeError::EntryCorrupt => "directory entry corrupt",
            VolumeError::LabelNotFound => "volume label not found",
            VolumeError::LabelInvalid => "volume label invalid",
            VolumeError::NotFound => "file or directory not found",
            VolumeError::NotEmpty => "directory not empty",
        };
        f.write_str(s)
    }
}

/// Cluster chain error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ClusterError {
    EndOfChain,
    ClusterInvalid,
    ChainCorrupt,
}

impl Display for ClusterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClusterError::EndOfChain => "end of chain reached",
            ClusterError::ClusterInvalid => "cluster number invalid",
            ClusterError::ChainCorrupt => "cluster chain corrupt",
        };
        f.write_str(s)
    }
}

/// NAND ECC error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum EccError {
    /// Bit errors were corrected; informational, not a failure.
    Corrected,
    /// Correctable, but the correction count crossed the configured
    /// advisory threshold.
    CriticalCorrection,
    Uncorrectable,
}

impl Display for EccError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EccError::Corrected => "ECC corrected bit error(s)",
            EccError::CriticalCorrection => "ECC critical correction threshold exceeded",
            EccError::Uncorrectable => "ECC uncorrectable error",
        };
        f.write_str(s)
    }
}

/// Concurrency / OS-port error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConcurrencyError {
    LockFailed,
    LockTimeout,
    OsInitFailure,
}

impl Display for ConcurrencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConcurrencyError::LockFailed => "lock acquisition failed",
            ConcurrencyError::LockTimeout => "lock timed out",
            ConcurrencyError::OsInitFailure => "OS port initialization failure",
        };
        f.write_str(s)
    }
}

/// Pool / allocation error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ResourceError {
    Memory,
    NoBufferAvailable,
}

impl Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceError::Memory => "memory allocation failed",
            ResourceError::NoBufferAvailable => "no buffer available",
        };
        f.write_str(s)
    }
}

/// The crate-wide error type. Every fallible public operation returns
/// `Result<T, Error>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    Arg(ArgError),
    State(StateError),
    Device(DeviceError),
    Volume(VolumeError),
    Cluster(ClusterError),
    Ecc(EccError),
    Concurrency(ConcurrencyError),
    Resource(ResourceError),
}

macro_rules! from_kind {
    ($variant:ident, $ty:ty) => {
        impl From<$ty> for Error {
            fn from(e: $ty) -> Self {
                Error::$variant(e)
            }
        }
    };
}

from_kind!(Arg, ArgError);
from_kind!(State, StateError);
from_kind!(Device, DeviceError);
from_kind!(Volume, VolumeError);
from_kind!(Cluster, ClusterError);
from_kind!(Ecc, EccError);
from_kind!(Concurrency, ConcurrencyError);
from_kind!(Resource, ResourceError);

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Arg(e) => Display::fmt(e, f),
            Error::State(e) => Display::fmt(e, f),
            Error::Device(e) => Display::fmt(e, f),
            Error::Volume(e) => Display::fmt(e, f),
            Error::Cluster(e) => Display::fmt(e, f),
            Error::Ecc(e) => Display::fmt(e, f),
            Error::Concurrency(e) => Display::fmt(e, f),
            Error::Resource(e) => Display::fmt(e, f),
        }
    }
}

crate::using_std! {
    impl std::error::Error for Error {}
}

pub type Result<T> = core::result::Result<T, Error>;

/// Adapts a driver's read/write/erase errors (themselves opaque `Debug`
/// types, as in the fatfs crate's `Storage::ReadErr`/`WriteErr`) into the
/// crate-wide taxonomy. Drivers that cannot distinguish failure causes
/// should prefer `DeviceError::Io`.
pub fn device_err<E: Debug>(_e: E) -> Error {
    Error::Device(DeviceError::Io)
}
