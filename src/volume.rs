//! Volume lifecycle, partition binding, and per-volume sector cache
//! coordination (spec §4.5/§9; state names kept from `original_source`'s
//! `Source/fs_vol.h`).
//!
//! A `Volume` binds one partition (or the whole device, when
//! `partition_nbr == 0`) to a `DeviceId` and carries its own
//! `cache::SectorCache`; `VolumeTable` is the suite-wide arena that owns
//! volumes by stable `VolumeId`, the same arena-by-id approach
//! `device::DriverRegistry` uses for devices (design note, spec §9: "cyclic
//! driver/volume references... arena index instead of back-pointers").
//!
//! Like the driver registry, the table itself needs heap allocation
//! (`Vec<Volume>`) and is only built under `std`; see `device.rs`'s module
//! doc for the corresponding `no_std` story.

use crate::cache::{CacheMode, SectorCache};
use crate::device::{Device, DeviceId};
use crate::error::{Error, StateError, VolumeError};
use crate::gpt::Gpt;
use crate::storage::SectorType;

use typenum::consts::U8;

/// Default per-region cache capacity for every volume. A deployment that
/// needs region sizes tuned per volume would parameterize `Volume` over
/// `NM`/`ND`/`NF` directly instead; fixed at `U8` here keeps the arena's
/// element type uniform, which `VolumeTable` (a single `Vec<Volume>`)
/// requires.
pub type CacheCap = U8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VolumeId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Rd,
    RdWr,
}

/// Lifecycle state. Names and the `Closing` transient are kept from
/// `fs_vol.h`'s `FS_VOL_STATE_*` defines; `spec.md` never names `Closing`
/// but also never forbids it, so it is kept as a supplemental detail
/// (recorded in DESIGN.md) rather than collapsed into `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeState {
    Closed,
    Opening,
    Open,
    Mounted,
    Closing,
}

crate::using_std! {

/// One bound partition (or whole device) plus its sector cache.
pub struct Volume {
    id: VolumeId,
    device_id: DeviceId,
    partition_nbr: u8,
    access_mode: AccessMode,
    state: VolumeState,

    part_start_lba: u64,
    part_sector_count: u64,

    /// Copied from the bound device's `refresh_cnt` the last time this
    /// volume observed it; file/dir handles carry their own copy and
    /// compare it against `Volume::refresh_cnt` to detect a media change
    /// they haven't yet been told about (`StateError::Stale`).
    refresh_cnt: u32,

    open_file_count: u32,
    open_dir_count: u32,

    label: Option<[u8; 11]>,

    cache: SectorCache<CacheCap, CacheCap, CacheCap>,
}

impl Volume {
    pub fn new(id: VolumeId, device_id: DeviceId, partition_nbr: u8, access_mode: AccessMode, cache_mode: CacheMode) -> Self {
        Self {
            id,
            device_id,
            partition_nbr,
            access_mode,
            state: VolumeState::Closed,
            part_start_lba: 0,
            part_sector_count: 0,
            refresh_cnt: 0,
            open_file_count: 0,
            open_dir_count: 0,
            label: None,
            cache: SectorCache::new(cache_mode),
        }
    }

    pub fn id(&self) -> VolumeId {
        self.id
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn state(&self) -> VolumeState {
        self.state
    }

    pub fn access_mode(&self) -> AccessMode {
        self.access_mode
    }

    pub fn refresh_cnt(&self) -> u32 {
        self.refresh_cnt
    }

    pub fn sector_count(&self) -> u64 {
        self.part_sector_count
    }

    /// Compares a handle's last-observed refresh counter against this
    /// volume's current one (spec §4.5 staleness check).
    pub fn check_fresh(&self, observed: u32) -> Result<(), Error> {
        if observed != self.refresh_cnt {
            Err(StateError::Stale.into())
        } else {
            Ok(())
        }
    }

    /// Opens the volume against its bound device: requires the device
    /// `Present`, binds the addressed partition (whole device when
    /// `partition_nbr == 0`), per spec §4.5/§4.6's GPT-partition-or-whole-
    /// device rule. `Closed -> Opening -> Open`.
    pub fn open(&mut self, device: &mut Device) -> Result<(), Error> {
        if self.state != VolumeState::Closed {
            return Err(StateError::AlreadyOpen.into());
        }
        self.state = VolumeState::Opening;

        let info = match device.info() {
            Ok(info) => info,
            Err(e) => {
                self.state = VolumeState::Closed;
                return Err(e);
            }
        };

        let bind = self.bind_partition(device, info.sector_count);
        match bind {
            Ok((start, count)) => {
                self.part_start_lba = start;
                self.part_sector_count = count;
                self.refresh_cnt = device.refresh_cnt();
                self.state = VolumeState::Open;
                log::debug!(
                    "volume opened on device partition {} (lba {}..{})",
                    self.partition_nbr,
                    start,
                    start + count
                );
                Ok(())
            }
            Err(e) => {
                self.state = VolumeState::Closed;
                Err(e)
            }
        }
    }

    fn bind_partition(&self, device: &mut Device, device_sector_count: u64) -> Result<(u64, u64), Error> {
        if self.partition_nbr == 0 {
            return Ok((0, device_sector_count));
        }

        let info = device.info()?;
        let sector_size = info.sector_size as usize;
        let mut buf = alloc_scratch(sector_size);

        device.read(&mut buf, 1, 1)?;
        let gpt = Gpt::from_header_bytes(&buf)?;

        let idx = (self.partition_nbr - 1) as u32;
        if idx >= gpt.num_partition_entries() {
            return Err(VolumeError::PartitionNotFound.into());
        }

        let entries_per_sector = sector_size / gpt.partition_entry_size().max(1) as usize;
        let entry_sector = gpt.partition_entries_starting_lba() + (idx as usize / entries_per_sector.max(1)) as u64;
        let entry_in_sector = (idx as usize) % entries_per_sector.max(1);

        device.read(&mut buf, entry_sector, 1)?;
        let off = entry_in_sector * gpt.partition_entry_size() as usize;
        let entry = gpt.entry_from_bytes(&buf[off..])?;

        let start = entry.first_lba();
        let end = entry.last_lba();
        if end < start {
            return Err(VolumeError::BadSuperblock.into());
        }
        Ok((start, end - start + 1))
    }

    /// Marks the volume mounted; called by FAT core once its own
    /// superblock validation passes. `Open -> Mounted`.
    pub fn mark_mounted(&mut self) -> Result<(), Error> {
        if self.state != VolumeState::Open {
            return Err(StateError::NotOpen.into());
        }
        self.state = VolumeState::Mounted;
        Ok(())
    }

    pub fn require_mounted(&self) -> Result<(), Error> {
        if self.state != VolumeState::Mounted {
            return Err(StateError::NotMounted.into());
        }
        Ok(())
    }

    /// Re-probes the bound device after a media-change event, invalidating
    /// the cache (refusing if dirty data would be lost) and bumping the
    /// refresh counter so open handles observe staleness (spec §4.5).
    pub fn refresh(&mut self, device: &mut Device) -> Result<(), Error> {
        device.refresh()?;
        self.cache.invalidate()?;
        self.refresh_cnt = device.refresh_cnt();
        self.part_start_lba = 0;
        self.part_sector_count = 0;
        self.state = VolumeState::Open;
        Ok(())
    }

    /// Reads one sector at a volume-relative (not absolute) sector number,
    /// through the cache.
    pub fn rd(&mut self, device: &mut Device, ty: SectorType, sector: u64, out: &mut [u8]) -> Result<(), Error> {
        self.check_bounds(sector)?;
        if self.cache.read(ty, sector, out).is_some() {
            return Ok(());
        }
        device.read(out, self.part_start_lba + sector, 1)?;
        self.cache.admit_clean(ty, sector, out);
        Ok(())
    }

    /// Writes one sector at a volume-relative sector number, through the
    /// cache (spec §4.1 cache modes).
    pub fn wr(&mut self, device: &mut Device, ty: SectorType, sector: u64, bytes: &[u8]) -> Result<(), Error> {
        if self.access_mode == AccessMode::Rd {
            return Err(StateError::NotMounted.into());
        }
        self.check_bounds(sector)?;
        use crate::cache::WriteOutcome;
        match self.cache.write(ty, sector, bytes)? {
            WriteOutcome::PassThrough => {
                device.write(bytes, self.part_start_lba + sector, 1)
            }
            WriteOutcome::WriteThrough { evicted } => {
                if let Some((evicted_sector, data)) = evicted {
                    device.write(data.as_slice(), self.part_start_lba + evicted_sector, 1)?;
                }
                device.write(bytes, self.part_start_lba + sector, 1)
            }
            WriteOutcome::WriteBack { evicted } => {
                if let Some((evicted_sector, data)) = evicted {
                    device.write(data.as_slice(), self.part_start_lba + evicted_sector, 1)?;
                }
                Ok(())
            }
        }
    }

    fn check_bounds(&self, sector: u64) -> Result<(), Error> {
        if sector >= self.part_sector_count {
            return Err(VolumeError::DeviceFull.into());
        }
        Ok(())
    }

    /// Trim-like hint forwarded to the device that `sector..sector+count` is
    /// no longer needed.
    pub fn release(&mut self, device: &mut Device, sector: u64, count: u32) -> Result<(), Error> {
        use crate::storage::{IoctlArg, IoctlOp};
        device.ioctl(IoctlOp::Release { sector: self.part_start_lba + sector, count }, IoctlArg::None)
    }

    pub fn cache_flush(&mut self, device: &mut Device) -> Result<(), Error> {
        let part_start = self.part_start_lba;
        self.cache.flush(|_ty, sector, bytes| device.write(bytes, part_start + sector, 1))
    }

    pub fn cache_invalidate(&mut self) -> Result<(), Error> {
        self.cache.invalidate()
    }

    pub fn cache_mode(&self) -> CacheMode {
        self.cache.mode()
    }

    /// Re-configures the cache's write policy (spec §10 "cache_assign"),
    /// flushing any dirty entries under the old policy first since region
    /// capacities are fixed at construction and a mode swap rebuilds all
    /// three regions empty.
    pub fn cache_reassign(&mut self, device: &mut Device, mode: CacheMode) -> Result<(), Error> {
        self.cache_flush(device)?;
        self.cache = SectorCache::new(mode);
        Ok(())
    }

    pub fn label_get(&self) -> Option<&[u8; 11]> {
        self.label.as_ref()
    }

    pub fn label_set(&mut self, label: [u8; 11]) {
        self.label = Some(label);
    }

    pub fn inc_file_open(&mut self) {
        self.open_file_count += 1;
    }

    pub fn dec_file_open(&mut self) {
        self.open_file_count = self.open_file_count.saturating_sub(1);
    }

    pub fn inc_dir_open(&mut self) {
        self.open_dir_count += 1;
    }

    pub fn dec_dir_open(&mut self) {
        self.open_dir_count = self.open_dir_count.saturating_sub(1);
    }

    /// Flushes the cache and transitions to `Closed`, refusing while any
    /// file or directory handle is still open (spec §4.5).
    pub fn close(&mut self, device: &mut Device) -> Result<(), Error> {
        if self.open_file_count != 0 || self.open_dir_count != 0 {
            return Err(StateError::AlreadyOpen.into());
        }
        if self.state == VolumeState::Closed {
            return Err(StateError::NotOpen.into());
        }
        self.state = VolumeState::Closing;
        self.cache_flush(device)?;
        self.state = VolumeState::Closed;
        Ok(())
    }
}

/// Scratch read buffer for partition-table probing, sized to the device's
/// live sector size. Only used at `open` time, not on the hot read/write
/// path (which goes through `cache::SectorCache`'s fixed `MaxSectorSize`
/// buffers), so a small heap allocation here is acceptable even though the
/// rest of this module avoids one.
fn alloc_scratch(len: usize) -> AllocScratch {
    AllocScratch::new(len)
}

} // using_std! (Volume)

crate::using_std! {
    pub use self::std_impl::*;

    mod std_impl {
        use std::vec;
        use std::vec::Vec;
        use std::ops::{Deref, DerefMut};

        pub struct AllocScratch(Vec<u8>);

        impl AllocScratch {
            pub fn new(len: usize) -> Self {
                Self(vec![0u8; len])
            }
        }

        impl Deref for AllocScratch {
            type Target = [u8];
            fn deref(&self) -> &[u8] {
                &self.0
            }
        }

        impl DerefMut for AllocScratch {
            fn deref_mut(&mut self) -> &mut [u8] {
                &mut self.0
            }
        }
    }
}

crate::using_std! {
    use crate::device::DriverRegistry;
    use std::vec::Vec;

    /// Suite-wide arena of volumes, indexed by stable `VolumeId` (spec §9).
    pub struct VolumeTable {
        volumes: Vec<Volume>,
        capacity: usize,
    }

    impl VolumeTable {
        pub fn new(capacity: usize) -> Self {
            Self { volumes: Vec::with_capacity(capacity), capacity }
        }

        pub fn insert(&mut self, device_id: DeviceId, partition_nbr: u8, access_mode: AccessMode, cache_mode: CacheMode) -> Result<VolumeId, Error> {
            if self.volumes.len() >= self.capacity {
                return Err(crate::error::ResourceError::Memory.into());
            }
            let id = VolumeId(self.volumes.len());
            self.volumes.push(Volume::new(id, device_id, partition_nbr, access_mode, cache_mode));
            Ok(id)
        }

        pub fn get(&self, id: VolumeId) -> Option<&Volume> {
            self.volumes.get(id.0)
        }

        pub fn get_mut(&mut self, id: VolumeId) -> Option<&mut Volume> {
            self.volumes.get_mut(id.0)
        }
    }

    /// Opens a volume and its bound device together, the common path a
    /// host takes at mount time (spec §4.5). `registry`/`table` are
    /// expected to already be held under the suite lock by the caller.
    pub fn open_volume(table: &mut VolumeTable, registry: &mut DriverRegistry, id: VolumeId) -> Result<(), Error> {
        let device_id = table.get(id).ok_or(Error::State(StateError::NotOpen))?.device_id();
        let device = registry.get_mut(device_id).ok_or(Error::State(StateError::NotOpen))?;
        let volume = table.get_mut(id).ok_or(Error::State(StateError::NotOpen))?;
        volume.open(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, DriverRegistry, RamStorage};
    use crate::storage::{DeviceConfig, StorageAsDriver};
    use typenum::consts::U512;

    fn make_registry() -> (DriverRegistry, DeviceId) {
        let mut registry = DriverRegistry::new(4);
        let driver = StorageAsDriver::new("ram", 512, true, || RamStorage::<U512>::new(64, 512));
        let id = registry.register(std::boxed::Box::new(driver)).unwrap();
        registry.get_mut(id).unwrap().open(DeviceConfig::default()).unwrap();
        (registry, id)
    }

    #[test]
    fn whole_device_volume_opens() {
        let (mut registry, device_id) = make_registry();
        let mut volume = Volume::new(VolumeId(0), device_id, 0, AccessMode::RdWr, CacheMode::WriteBack);
        let device = registry.get_mut(device_id).unwrap();
        volume.open(device).unwrap();
        assert_eq!(volume.state(), VolumeState::Open);
        assert_eq!(volume.sector_count(), 64);
    }

    #[test]
    fn rd_wr_round_trips_through_cache() {
        let (mut registry, device_id) = make_registry();
        let mut volume = Volume::new(VolumeId(0), device_id, 0, AccessMode::RdWr, CacheMode::WriteBack);
        {
            let device = registry.get_mut(device_id).unwrap();
            volume.open(device).unwrap();
        }

        let data = [7u8; 512];
        let mut out = [0u8; 512];
        {
            let device = registry.get_mut(device_id).unwrap();
            volume.wr(device, SectorType::File, 3, &data).unwrap();
            volume.rd(device, SectorType::File, 3, &mut out).unwrap();
        }
        assert_eq!(out, data);
    }

    #[test]
    fn close_refuses_with_open_handles() {
        let (mut registry, device_id) = make_registry();
        let mut volume = Volume::new(VolumeId(0), device_id, 0, AccessMode::RdWr, CacheMode::WriteBack);
        let device = registry.get_mut(device_id).unwrap();
        volume.open(device).unwrap();
        volume.mark_mounted().unwrap();
        volume.inc_file_open();
        assert!(volume.close(device).is_err());
        volume.dec_file_open();
        assert!(volume.close(device).is_ok());
    }
}
