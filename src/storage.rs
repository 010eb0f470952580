//! The typed-sector `Storage` trait and the narrower, object-safe
//! `DriverOps` contract that sits behind the suite's driver registry
//! (spec §4.2, §6 "Driver API").
//!
//! The fatfs crate pulls its `Storage` trait from a private git remote
//! (`storage-traits`) that is not fetchable here; this module vendors an
//! equivalent trait in-crate instead of fabricating a stand-in dependency
//! (noted in DESIGN.md). Shape and naming (`read_sector`/`write_sector`,
//! `SECTOR_SIZE` as an `ArrayLength`) follow what the fatfs crate's call
//! sites (`fat::mod`, `fat::table`, `gpt`) already assume of it.

use crate::error::{DeviceError, Error};

use generic_array::{ArrayLength, GenericArray};
use core::fmt::Debug;

/// A caller-provided tag on every sector read/write (spec §3 "Sector",
/// §4.1). Descriptive only: it drives cache-region selection and
/// journaling, the medium does not validate it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectorType {
    Management,
    Directory,
    File,
    Unknown,
}

/// Implementors provide typed, whole-sector access to a block-addressable
/// medium. `SECTOR_SIZE` is a type-level upper bound (see
/// `config::MaxSectorSize`); the *live* sector size of a given medium is a
/// runtime quantity (`query().sector_size`) that must be `<= SECTOR_SIZE`.
#[allow(non_camel_case_types)]
pub trait Storage {
    type SECTOR_SIZE: ArrayLength<u8>;

    type ReadErr: Debug;
    type WriteErr: Debug;
    type EraseErr: Debug;

    /// Reads one sector. `sector_idx` is a logical sector number relative to
    /// the start of this `Storage`'s addressable space (a partition, for
    /// FAT core callers).
    fn read_sector(
        &mut self,
        sector_idx: u64,
        buffer: &mut GenericArray<u8, Self::SECTOR_SIZE>,
    ) -> Result<(), Self::ReadErr>;

    /// Writes one sector.
    fn write_sector(
        &mut self,
        sector_idx: u64,
        buffer: &GenericArray<u8, Self::SECTOR_SIZE>,
    ) -> Result<(), Self::WriteErr>;

    /// Number of sectors addressable on this medium.
    fn sector_count(&self) -> u64;

    /// Erases a sector (sets it to the medium's erased value). Mediums
    /// without a native erase primitive can implement this as a zero-fill
    /// write; flash-backed mediums should erase the containing block.
    fn erase_sector(&mut self, sector_idx: u64) -> Result<(), Self::EraseErr>;
}

/// `ioctl` opcodes (spec §4.2): refresh, low-level format/mount/unmount,
/// compact (FTL-backed devices only), per-sector release (trim-like hint),
/// and physical page/block maintenance ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlOp {
    Refresh,
    LowLevelFormat,
    LowLevelMount,
    LowLevelUnmount,
    /// Garbage-collect / wear-level now, rather than waiting for the next
    /// allocation to trigger it (FTL-backed devices only).
    Compact,
    /// Trim-like hint: the sector's contents are no longer needed.
    Release { sector: u64, count: u32 },
    PhysPageRead { block: u32, page: u32 },
    PhysPageWrite { block: u32, page: u32 },
    PhysBlockErase { block: u32 },
}

/// Argument/result payload for `ioctl`. Most opcodes carry their argument
/// inline in `IoctlOp`; this carries page/block data buffers for the
/// physical maintenance opcodes, passed by the driver registry's caller.
#[derive(Debug)]
pub enum IoctlArg<'a> {
    None,
    Buf(&'a mut [u8]),
}

/// Static device attributes, returned by `query` (spec §3 "Device").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub sector_size: u32,
    pub sector_count: u64,
    pub fixed: bool,
}

/// Opaque, driver-specific configuration blob passed to `open`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceConfig {
    pub unit_nbr: u8,
}

/// The narrow, object-safe contract every driver implements and registers
/// under a name in the suite's `DriverRegistry` (spec §4.2/§6 "Driver API").
/// Unlike `Storage`, this operates on plain byte slices sized by the
/// caller to whole sectors (`cnt * sector_size`), since a `dyn DriverOps`
/// cannot be generic over a type-level sector size.
pub trait DriverOps: Send {
    fn name_get(&self) -> &str;

    fn init(&mut self) -> Result<(), Error>;

    fn open(&mut self, cfg: DeviceConfig) -> Result<(), Error>;

    fn close(&mut self) -> Result<(), Error>;

    /// Reads `cnt` whole sectors starting at `start` into `dest`
    /// (`dest.len() == cnt as usize * sector_size`).
    fn read(&mut self, dest: &mut [u8], start: u64, cnt: u32) -> Result<(), Error>;

    /// Writes `cnt` whole sectors starting at `start` from `src`.
    fn write(&mut self, src: &[u8], start: u64, cnt: u32) -> Result<(), Error>;

    fn query(&self) -> Result<DeviceInfo, Error>;

    fn ioctl(&mut self, op: IoctlOp, arg: IoctlArg<'_>) -> Result<(), Error>;
}

/// Adapts a type-level-sized `Storage` implementation to the object-safe
/// `DriverOps` contract, so concrete mediums (e.g. `device::RamStorage`)
/// can be written once against the typed trait and still be registered
/// into the suite's dynamic driver table. This is the "capability set"
/// pattern from the design notes (§9): `Storage` is the capability,
/// `DriverOps` is the vtable the registry stores.
pub struct StorageAsDriver<S: Storage> {
    name: &'static str,
    sector_size: u32,
    fixed: bool,
    inner: Option<S>,
    make: fn() -> S,
}

impl<S: Storage> StorageAsDriver<S> {
    pub fn new(name: &'static str, sector_size: u32, fixed: bool, make: fn() -> S) -> Self {
        Self { name, sector_size, fixed, inner: None, make }
    }
}

impl<S: Storage> DriverOps for StorageAsDriver<S> {
    fn name_get(&self) -> &str {
        self.name
    }

    fn init(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn open(&mut self, _cfg: DeviceConfig) -> Result<(), Error> {
        if self.inner.is_some() {
            return Err(crate::error::StateError::AlreadyOpen.into());
        }
        self.inner = Some((self.make)());
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        if self.inner.take().is_none() {
            return Err(crate::error::StateError::NotOpen.into());
        }
        Ok(())
    }

    fn read(&mut self, dest: &mut [u8], start: u64, cnt: u32) -> Result<(), Error> {
        let sector_size = self.sector_size as usize;
        let storage = self.inner.as_mut().ok_or(Error::State(crate::error::StateError::NotOpen))?;
        if dest.len() != sector_size * cnt as usize {
            return Err(DeviceError::InvalidConfig.into());
        }
        for i in 0..cnt as u64 {
            let mut buf: GenericArray<u8, S::SECTOR_SIZE> = GenericArray::default();
            storage.read_sector(start + i, &mut buf).map_err(crate::error::device_err)?;
            let off = (i as usize) * sector_size;
            dest[off..off + sector_size].copy_from_slice(&buf.as_slice()[..sector_size]);
        }
        Ok(())
    }

    fn write(&mut self, src: &[u8], start: u64, cnt: u32) -> Result<(), Error> {
        let sector_size = self.sector_size as usize;
        let storage = self.inner.as_mut().ok_or(Error::State(crate::error::StateError::NotOpen))?;
        if src.len() != sector_size * cnt as usize {
            return Err(DeviceError::InvalidConfig.into());
        }
        for i in 0..cnt as u64 {
            let mut buf: GenericArray<u8, S::SECTOR_SIZE> = GenericArray::default();
            let off = (i as usize) * sector_size;
            buf.as_mut_slice()[..sector_size].copy_from_slice(&src[off..off + sector_size]);
            storage.write_sector(start + i, &buf).map_err(crate::error::device_err)?;
        }
        Ok(())
    }

    fn query(&self) -> Result<DeviceInfo, Error> {
        let storage = self.inner.as_ref().ok_or(Error::State(crate::error::StateError::NotOpen))?;
        Ok(DeviceInfo {
            sector_size: self.sector_size,
            sector_count: storage.sector_count(),
            fixed: self.fixed,
        })
    }

    fn ioctl(&mut self, op: IoctlOp, _arg: IoctlArg<'_>) -> Result<(), Error> {
        match op {
            IoctlOp::Refresh => Ok(()),
            _ => Err(DeviceError::InvalidConfig.into()),
        }
    }
}

crate::using_std! {
    use std::fmt;

    impl fmt::Display for SectorType {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let s = match self {
                SectorType::Management => "management",
                SectorType::Directory => "directory",
                SectorType::File => "file",
                SectorType::Unknown => "unknown",
            };
            f.write_str(s)
        }
    }
}
