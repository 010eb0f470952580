//! C bindings: a BSP-supplied `eDisk_*` block driver wrapped as a
//! [`crate::storage::Storage`] impl, plus a small `extern "C"` surface over
//! [`crate::api::Suite`] for a C host to mount a volume and do file I/O
//! without linking in the Rust API directly.
//!
//! `EDiskStorage` keeps the teacher's shape (an FFI-backed disk driver
//! calling out to four `eDisk_*` functions a board support package provides)
//! but implements it against this crate's own vendored `Storage` trait
//! instead of the teacher's `storage_traits` crate, which this workspace
//! does not depend on.

// The `Suite`-backed bindings below need `alloc`/`Box`, so they only exist
// when `Suite` itself does (see `api.rs`'s module doc). Under `no_std` this
// module still provides `edisk::EDiskStorage`, which a `no_std` host wires
// directly into its own `Storage`/`FatFs<S>` generics instead.
crate::using_std! {

use crate::api::Suite;
use crate::config::SuiteConfig;
use crate::storage::DeviceConfig;
use crate::volume::AccessMode;
use crate::cache::CacheMode;

use std::boxed::Box;

/// Opaque handle returned to C; owns the suite and the single device/volume
/// it was mounted with. A real deployment would let C address multiple
/// devices/volumes by id instead of hardcoding volume 0, but one disk is
/// all `edisk` exposes.
pub struct SuiteHandle {
    suite: Suite,
    volume: crate::volume::VolumeId,
}

/// Creates a suite over one `eDisk`-backed volume and mounts it (format on
/// first use if the superblock doesn't validate). Returns null on failure.
#[no_mangle]
pub extern "C" fn suite_new_edisk(drive_num: u8, size_in_sectors: u64) -> *mut SuiteHandle {
    let mut suite = match Suite::new(SuiteConfig::default()) {
        Ok(s) => s,
        Err(_) => return core::ptr::null_mut(),
    };

    let driver = edisk::EDiskDriver::new(drive_num, size_in_sectors);
    let device_id = match suite.register_driver(Box::new(driver)) {
        Ok(id) => id,
        Err(_) => return core::ptr::null_mut(),
    };
    if suite.device_open(device_id, DeviceConfig { unit_nbr: drive_num }).is_err() {
        return core::ptr::null_mut();
    }

    let volume = match suite.volume_mount(device_id, 0, AccessMode::RdWr, CacheMode::WriteBack) {
        Ok(v) => v,
        Err(_) => match suite.fmt(device_id, 0, 1) {
            Ok(v) => v,
            Err(_) => return core::ptr::null_mut(),
        },
    };

    Box::into_raw(Box::new(SuiteHandle { suite, volume }))
}

#[no_mangle]
pub extern "C" fn suite_free(handle: *mut SuiteHandle) {
    if !handle.is_null() {
        unsafe { drop(Box::from_raw(handle)) };
    }
}

/// Opens (creating if absent) a file by a NUL-terminated path and returns a
/// file handle index, or `u32::MAX` on failure.
#[no_mangle]
pub extern "C" fn suite_open(handle: *mut SuiteHandle, path: *const core::ffi::c_char, create: bool, read_only: bool) -> u32 {
    let h = unsafe { match handle.as_mut() { Some(h) => h, None => return u32::MAX } };
    let path = unsafe { match std::ffi::CStr::from_ptr(path).to_str() { Ok(s) => s, Err(_) => return u32::MAX } };
    match h.suite.open(h.volume, path, create, read_only, 0) {
        Ok(fh) => fh_index(fh) as u32,
        Err(_) => u32::MAX,
    }
}

#[no_mangle]
pub extern "C" fn suite_read(handle: *mut SuiteHandle, file: u32, buf: *mut u8, len: usize) -> i64 {
    let h = unsafe { match handle.as_mut() { Some(h) => h, None => return -1 } };
    let out = unsafe { core::slice::from_raw_parts_mut(buf, len) };
    match h.suite.read(crate::api::FileHandle::from_index(file as usize), out) {
        Ok(n) => n as i64,
        Err(_) => -1,
    }
}

#[no_mangle]
pub extern "C" fn suite_write(handle: *mut SuiteHandle, file: u32, buf: *const u8, len: usize) -> i64 {
    let h = unsafe { match handle.as_mut() { Some(h) => h, None => return -1 } };
    let data = unsafe { core::slice::from_raw_parts(buf, len) };
    match h.suite.write(crate::api::FileHandle::from_index(file as usize), data) {
        Ok(n) => n as i64,
        Err(_) => -1,
    }
}

#[no_mangle]
pub extern "C" fn suite_close(handle: *mut SuiteHandle, file: u32) -> bool {
    let h = unsafe { match handle.as_mut() { Some(h) => h, None => return false } };
    h.suite.close(crate::api::FileHandle::from_index(file as usize), 0).is_ok()
}

fn fh_index(fh: crate::api::FileHandle) -> usize {
    fh.into_index()
}

} // using_std! (Suite-backed bindings)

pub mod edisk {
    use crate::error::{DeviceError, Error};
    use crate::storage::{DeviceConfig, DeviceInfo, DriverOps, IoctlArg, IoctlOp, Storage};

    use generic_array::GenericArray;
    use typenum::consts::U512;

    /// One BSP-addressed disk, identified by `drive_num` the way the
    /// `eDisk_*` functions below expect it.
    pub struct EDiskStorage {
        pub drive_num: u8,
        pub size_in_sectors: u64,
    }

    /// Direct `DriverOps` impl for [`EDiskStorage`].
    ///
    /// `StorageAsDriver` takes its medium from a non-capturing `fn() -> S`
    /// factory so it can defer construction to `open()`; `drive_num` and
    /// `size_in_sectors` here are runtime values handed in by the C caller,
    /// which a bare fn pointer can't close over. Since both are known up
    /// front there is nothing to defer, so this implements `DriverOps`
    /// directly instead, gating on `opened` the same way `StorageAsDriver`
    /// gates on `inner: Option<S>`.
    pub struct EDiskDriver {
        storage: EDiskStorage,
        opened: bool,
    }

    impl EDiskDriver {
        pub fn new(drive_num: u8, size_in_sectors: u64) -> Self {
            Self {
                storage: EDiskStorage { drive_num, size_in_sectors },
                opened: false,
            }
        }
    }

    impl DriverOps for EDiskDriver {
        fn name_get(&self) -> &str {
            "edisk"
        }

        fn init(&mut self) -> Result<(), Error> {
            Ok(())
        }

        fn open(&mut self, _cfg: DeviceConfig) -> Result<(), Error> {
            if self.opened {
                return Err(crate::error::StateError::AlreadyOpen.into());
            }
            self.opened = true;
            Ok(())
        }

        fn close(&mut self) -> Result<(), Error> {
            if !self.opened {
                return Err(crate::error::StateError::NotOpen.into());
            }
            self.opened = false;
            Ok(())
        }

        fn read(&mut self, dest: &mut [u8], start: u64, cnt: u32) -> Result<(), Error> {
            if !self.opened {
                return Err(crate::error::StateError::NotOpen.into());
            }
            let sector_size = 512usize;
            if dest.len() != sector_size * cnt as usize {
                return Err(DeviceError::InvalidConfig.into());
            }
            for i in 0..cnt as u64 {
                let mut buf: GenericArray<u8, U512> = GenericArray::default();
                self.storage.read_sector(start + i, &mut buf).map_err(crate::error::device_err)?;
                let off = (i as usize) * sector_size;
                dest[off..off + sector_size].copy_from_slice(&buf.as_slice()[..sector_size]);
            }
            Ok(())
        }

        fn write(&mut self, src: &[u8], start: u64, cnt: u32) -> Result<(), Error> {
            if !self.opened {
                return Err(crate::error::StateError::NotOpen.into());
            }
            let sector_size = 512usize;
            if src.len() != sector_size * cnt as usize {
                return Err(DeviceError::InvalidConfig.into());
            }
            for i in 0..cnt as u64 {
                let mut buf: GenericArray<u8, U512> = GenericArray::default();
                let off = (i as usize) * sector_size;
                buf.as_mut_slice()[..sector_size].copy_from_slice(&src[off..off + sector_size]);
                self.storage.write_sector(start + i, &buf).map_err(crate::error::device_err)?;
            }
            Ok(())
        }

        fn query(&self) -> Result<DeviceInfo, Error> {
            if !self.opened {
                return Err(crate::error::StateError::NotOpen.into());
            }
            Ok(DeviceInfo {
                sector_size: 512,
                sector_count: self.storage.sector_count(),
                fixed: true,
            })
        }

        fn ioctl(&mut self, op: IoctlOp, _arg: IoctlArg<'_>) -> Result<(), Error> {
            match op {
                IoctlOp::Refresh => Ok(()),
                _ => Err(DeviceError::InvalidConfig.into()),
            }
        }
    }

    #[repr(C)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub enum DResult {
        ResOk = 0,
        ResError = 1,
        ResWrPrt = 2,
        ResNotRdy = 3,
        ResParErr = 4,
    }

    extern "C" {
        fn eDisk_Read(drv: u8, buff: *mut u8, sector: u32, count: u32) -> DResult;
        fn eDisk_Write(drv: u8, buff: *const u8, sector: u32, count: u32) -> DResult;
    }

    impl Storage for EDiskStorage {
        type SECTOR_SIZE = U512;
        type ReadErr = DResult;
        type WriteErr = DResult;
        type EraseErr = DResult;

        fn read_sector(&mut self, sector_idx: u64, buffer: &mut GenericArray<u8, U512>) -> Result<(), DResult> {
            if sector_idx >= self.size_in_sectors {
                return Err(DResult::ResParErr);
            }
            match unsafe { eDisk_Read(self.drive_num, buffer.as_mut_slice().as_mut_ptr(), sector_idx as u32, 1) } {
                DResult::ResOk => Ok(()),
                e => Err(e),
            }
        }

        fn write_sector(&mut self, sector_idx: u64, buffer: &GenericArray<u8, U512>) -> Result<(), DResult> {
            if sector_idx >= self.size_in_sectors {
                return Err(DResult::ResParErr);
            }
            match unsafe { eDisk_Write(self.drive_num, buffer.as_slice().as_ptr(), sector_idx as u32, 1) } {
                DResult::ResOk => Ok(()),
                e => Err(e),
            }
        }

        fn sector_count(&self) -> u64 {
            self.size_in_sectors
        }

        fn erase_sector(&mut self, sector_idx: u64) -> Result<(), DResult> {
            let mut full: GenericArray<u8, U512> = GenericArray::default();
            full.iter_mut().for_each(|b| *b = 0xFF);
            self.write_sector(sector_idx, &full)
        }
    }

    impl From<DResult> for Error {
        fn from(_: DResult) -> Self {
            DeviceError::Io.into()
        }
    }
}
