//! The POSIX-like suite surface (spec §5 "File/Directory API", §9 "Suite").
//!
//! Everywhere else in this crate, a caller hands its own `S: Storage` to
//! `fat::FatFs<S>` directly. `Suite` is the other way in: it owns a
//! `device::DriverRegistry` and a `volume::VolumeTable` behind stable
//! handles, and bridges the two into `FatFs` through [`VolumeAsStorage`],
//! the same "capability set" adapter shape `storage::StorageAsDriver` uses
//! in the opposite direction. Open files and directories live in their own
//! fixed-capacity arenas, sized once at `Suite::new` from `SuiteConfig`, the
//! same arena-by-index approach `DriverRegistry`/`VolumeTable` already use
//! for devices and volumes (spec §9 design note on cyclic references).
//!
//! `VolumeAsStorage` re-mounts a `FatFs` fresh on every call rather than
//! caching one across the suite's lifetime: its borrows of `Device`/`Volume`
//! only live for the one call, and the alternative (storing a long-lived
//! `FatFs<VolumeAsStorage<'static>>`) would need unsafe lifetime erasure for
//! no real benefit, since the boot sector re-read each call is absorbed by
//! `Volume`'s own cache after the first access.

// Every type this module touches (`Device`, `DriverRegistry`, `Volume`,
// `VolumeTable`, and the `Vec`/`Box`/`String` arenas below) only exists under
// `std`, so the whole module body lives behind `using_std!` rather than just
// the `Suite` struct.
crate::using_std! {

use crate::config::{MaxSectorSize, SuiteConfig};
use crate::device::{Device, DeviceId, DriverRegistry};
use crate::error::{ArgError, Error, ResourceError, StateError, VolumeError};
use crate::fat::{self, FatFs, RootDir};
use crate::fat::table::Cluster;
use crate::mutex::FileLock;
use crate::storage::{DeviceConfig, DriverOps, SectorType, Storage};
use crate::volume::{AccessMode, Volume, VolumeId, VolumeTable};
use crate::cache::CacheMode;

use generic_array::GenericArray;

use std::boxed::Box;
use std::string::String;
use std::vec::Vec;
use std::sync::Mutex as StdMutex;
use std::format;

/// Bridges one bound `&mut Device` + `&mut Volume` pair into a `Storage`
/// impl `fat::FatFs<S>` can mount. `SECTOR_SIZE` is fixed at the crate-wide
/// upper bound (`config::MaxSectorSize`) since a volume's *live* sector size
/// is a runtime quantity; every call slices the fixed-size buffer down to
/// `sector_size` before handing it to `Volume::rd`/`wr`. Every sector is
/// tagged `SectorType::Unknown` (routed to the cache's management region):
/// `FatFs`'s generic core never threads a `SectorType` through its calls, so
/// there is no finer-grained tag available here to forward.
pub struct VolumeAsStorage<'a> {
    device: &'a mut Device,
    volume: &'a mut Volume,
    sector_size: usize,
}

impl<'a> Storage for VolumeAsStorage<'a> {
    type SECTOR_SIZE = MaxSectorSize;
    type ReadErr = Error;
    type WriteErr = Error;
    type EraseErr = Error;

    fn read_sector(&mut self, sector_idx: u64, buffer: &mut GenericArray<u8, MaxSectorSize>) -> Result<(), Error> {
        self.volume.rd(self.device, SectorType::Unknown, sector_idx, &mut buffer.as_mut_slice()[..self.sector_size])
    }

    fn write_sector(&mut self, sector_idx: u64, buffer: &GenericArray<u8, MaxSectorSize>) -> Result<(), Error> {
        self.volume.wr(self.device, SectorType::Unknown, sector_idx, &buffer.as_slice()[..self.sector_size])
    }

    fn sector_count(&self) -> u64 {
        self.volume.sector_count()
    }

    fn erase_sector(&mut self, sector_idx: u64) -> Result<(), Error> {
        let mut full: GenericArray<u8, MaxSectorSize> = GenericArray::default();
        full.iter_mut().for_each(|b| *b = 0xFF);
        self.volume.wr(self.device, SectorType::Unknown, sector_idx, &full.as_slice()[..self.sector_size])
    }
}

/// Binds `registry`/`volumes` into a `VolumeAsStorage` and hands it to `f`.
/// A free function (not a `Suite` method) so callers can hold it alongside
/// a borrow of `Suite`'s other fields (`files`, `dirs`, `working_dir`)
/// without the whole-`self` borrow a method call would require.
fn with_storage<F, R>(registry: &mut DriverRegistry, volumes: &mut VolumeTable, id: VolumeId, f: F) -> Result<R, Error>
where
    F: FnOnce(VolumeAsStorage<'_>) -> Result<R, Error>,
{
    let device_id = volumes.get(id).ok_or(Error::State(StateError::NotOpen))?.device_id();
    let device = registry.get_mut(device_id).ok_or(Error::State(StateError::NotOpen))?;
    let sector_size = device.info()?.sector_size as usize;
    let volume = volumes.get_mut(id).ok_or(Error::State(StateError::NotOpen))?;
    f(VolumeAsStorage { device, volume, sector_size })
}

/// As [`with_storage`], but mounts a fresh `FatFs` over the adapter first.
fn with_fatfs<F, R>(registry: &mut DriverRegistry, volumes: &mut VolumeTable, id: VolumeId, f: F) -> Result<R, Error>
where
    F: FnOnce(&mut FatFs<VolumeAsStorage<'_>>) -> Result<R, Error>,
{
    with_storage(registry, volumes, id, |storage| {
        let mut fs = FatFs::mount(storage)?;
        f(&mut fs)
    })
}

/// Logs a `ClusterFree`+`EntryDelete` transaction ahead of freeing `cluster`
/// (when it holds real content; `cluster < 2` marks an empty file/dir and
/// there's nothing to free) and deleting the directory run at `pos`, commits
/// it, performs both mutations, then clears the log. Both operands are
/// already known before either mutation runs, so this is write-ahead in the
/// full sense: a crash between the free and the delete_run is recovered by
/// replay alone. The `EntryDelete` record only carries the SFN slot's
/// address (`sfn_sector`/`sfn_offset`), matching the one byte
/// `apply_committed_records` marks as deleted on replay; a crash mid-way
/// through a preceding long-name run leaves those LFN slots stale but the
/// entry itself is no longer findable by name, which is what matters.
fn journal_free_and_delete<S: Storage>(fs: &mut FatFs<S>, parent: RootDir, cluster: Cluster, pos: fat::dir::DirPos) -> Result<(), Error> {
    let mut txn = fs.journal_begin();
    if cluster >= 2 {
        txn.log(fat::journal::Record {
            kind: fat::journal::RecordKind::ClusterFree,
            txn_id: 0,
            dir_sector: 0,
            dir_offset: 0,
            cluster_a: cluster,
            cluster_b: 0,
        })?;
    }
    txn.log(fat::journal::Record {
        kind: fat::journal::RecordKind::EntryDelete,
        txn_id: 0,
        dir_sector: pos.sfn_sector,
        dir_offset: pos.sfn_offset,
        cluster_a: 0,
        cluster_b: 0,
    })?;
    let records = txn.commit()?;
    fs.journal_commit(&records)?;
    if cluster >= 2 {
        fs.free_chain(cluster)?;
    }
    fat::dir::delete_run(fs, parent, pos)?;
    fs.journal_clear()
}

/// Logs (write-ahead) an `EntryUpdate` record bounding the directory-entry
/// rewrite `update_entry` is about to make. The record carries no entry
/// payload (a stale `cluster_a` is the best it can redo), so replay treats
/// it as a transaction boundary only, same as `EntryCreate` — the file's
/// own cluster-chain steps (`fat::file::log_cluster_step`) already
/// journaled the durable part of this write.
fn log_entry_update<S: Storage>(fs: &mut FatFs<S>, pos: &fat::dir::DirPos, cluster: Cluster) -> Result<(), Error> {
    let mut txn = fs.journal_begin();
    txn.log(fat::journal::Record {
        kind: fat::journal::RecordKind::EntryUpdate,
        txn_id: 0,
        dir_sector: pos.sfn_sector,
        dir_offset: pos.sfn_offset,
        cluster_a: cluster,
        cluster_b: 0,
    })?;
    let records = txn.commit()?;
    fs.journal_commit(&records)
}

/// Per-task working-directory capability (spec §6 "working directory
/// support"). A real RTOS host would key this per calling task; the default
/// impl below assumes one control-plane caller, which is what every
/// `demos/`/test caller here actually is.
pub trait TaskLocal: Send + Sync {
    fn get(&self) -> Option<String>;
    fn set(&self, path: String);
}

#[derive(Default)]
pub struct SingleThreadedWorkingDir {
    inner: StdMutex<Option<String>>,
}

impl TaskLocal for SingleThreadedWorkingDir {
    fn get(&self) -> Option<String> {
        self.inner.lock().unwrap().clone()
    }

    fn set(&self, path: String) {
        *self.inner.lock().unwrap() = Some(path);
    }
}

/// Stable handle to an open file (spec §5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHandle(usize);

impl FileHandle {
    /// For FFI callers (`bindings.rs`) that can only pass a plain integer
    /// across the C boundary.
    pub fn from_index(i: usize) -> Self {
        Self(i)
    }

    pub fn into_index(self) -> usize {
        self.0
    }
}

/// Stable handle to an open directory scan (spec §5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirHandle(usize);

/// One readdir result: reassembled name plus the attributes a caller needs
/// to tell files from directories.
#[derive(Debug, Clone)]
pub struct DirEntryInfo {
    pub name: String,
    pub is_dir: bool,
    pub size: u32,
}

/// An open file's cursor plus the metadata needed to persist it back to its
/// directory entry on write/truncate (spec §5 "open/read/write/seek/
/// truncate/close").
struct OpenFile {
    volume: VolumeId,
    file: fat::file::File,
    entry: fat::dir::DirEntry,
    dir_pos: fat::dir::DirPos,
    parent: RootDir,
    refresh_cnt: u32,
    read_only: bool,
}

struct FileSlot {
    lock: FileLock,
    file: Option<OpenFile>,
}

impl Default for FileSlot {
    fn default() -> Self {
        Self { lock: FileLock::new(), file: None }
    }
}

/// An open directory scan's position (spec §5 "opendir/readdir/closedir").
/// `readdir` re-walks a fresh `DirScanner` from the start and skips `index`
/// entries on every call rather than keeping a live scanner across calls
/// (which would have to outlive the per-call `VolumeAsStorage` borrow);
/// acceptable since directories here are small and `index` only grows.
struct OpenDir {
    volume: VolumeId,
    location: RootDir,
    index: usize,
    refresh_cnt: u32,
}

/// The suite: owns every device, volume, open file, and open directory
/// behind stable handles (spec §9 "Global mutable state... a suite-level
/// state object initialized once").
pub struct Suite {
    config: SuiteConfig,
    registry: DriverRegistry,
    volumes: VolumeTable,
    files: Vec<FileSlot>,
    dirs: Vec<Option<OpenDir>>,
    working_dir: Box<dyn TaskLocal>,
}

impl Suite {
    pub fn new(config: SuiteConfig) -> Result<Self, Error> {
        config.validate()?;
        let files = (0..config.max_files).map(|_| FileSlot::default()).collect();
        let dirs = (0..config.max_dirs).map(|_| None).collect();
        Ok(Self {
            registry: DriverRegistry::new(config.max_devices),
            volumes: VolumeTable::new(config.max_volumes),
            files,
            dirs,
            working_dir: Box::new(SingleThreadedWorkingDir::default()),
            config,
        })
    }

    // -- device/volume lifecycle ------------------------------------------------

    pub fn register_driver(&mut self, driver: Box<dyn DriverOps>) -> Result<DeviceId, Error> {
        self.registry.register(driver)
    }

    pub fn device_open(&mut self, id: DeviceId, cfg: DeviceConfig) -> Result<(), Error> {
        self.registry.get_mut(id).ok_or(Error::State(StateError::NotOpen))?.open(cfg)
    }

    pub fn device_close(&mut self, id: DeviceId) -> Result<(), Error> {
        self.registry.get_mut(id).ok_or(Error::State(StateError::NotOpen))?.close()
    }

    pub fn device_refresh(&mut self, id: DeviceId) -> Result<(), Error> {
        self.registry.get_mut(id).ok_or(Error::State(StateError::NotOpen))?.refresh()
    }

    /// Formats a fresh FAT volume over `device_id`'s partition `partition_nbr`
    /// (0 = whole device) and mounts it (spec §4.6/§6 "fmt").
    pub fn fmt(&mut self, device_id: DeviceId, partition_nbr: u8, sectors_per_cluster: u8) -> Result<VolumeId, Error> {
        let id = self.volumes.insert(device_id, partition_nbr, AccessMode::RdWr, CacheMode::WriteBack)?;
        crate::volume::open_volume(&mut self.volumes, &mut self.registry, id)?;
        with_storage(&mut self.registry, &mut self.volumes, id, |storage| {
            FatFs::format(storage, sectors_per_cluster).map(|_fs| ())
        })?;
        self.volumes.get_mut(id).ok_or(Error::State(StateError::NotOpen))?.mark_mounted()?;
        Ok(id)
    }

    /// Binds and mounts an already-formatted FAT volume (spec §4.5/§4.6).
    /// Before handing the volume back, replays its metadata journal so a
    /// transaction left committed-but-unapplied by a crash in the previous
    /// session is finished before anything else touches the volume.
    pub fn volume_mount(&mut self, device_id: DeviceId, partition_nbr: u8, access_mode: AccessMode, cache_mode: CacheMode) -> Result<VolumeId, Error> {
        let id = self.volumes.insert(device_id, partition_nbr, access_mode, cache_mode)?;
        crate::volume::open_volume(&mut self.volumes, &mut self.registry, id)?;
        with_fatfs(&mut self.registry, &mut self.volumes, id, |fs| fs.journal_replay().map(|_| ()))?;
        self.volumes.get_mut(id).ok_or(Error::State(StateError::NotOpen))?.mark_mounted()?;
        Ok(id)
    }

    pub fn volume_close(&mut self, id: VolumeId) -> Result<(), Error> {
        let device_id = self.volumes.get(id).ok_or(Error::State(StateError::NotOpen))?.device_id();
        let device = self.registry.get_mut(device_id).ok_or(Error::State(StateError::NotOpen))?;
        let volume = self.volumes.get_mut(id).ok_or(Error::State(StateError::NotOpen))?;
        volume.close(device)
    }

    pub fn is_mounted(&self, id: VolumeId) -> bool {
        matches!(self.volumes.get(id).map(|v| v.state()), Some(crate::volume::VolumeState::Mounted))
    }

    pub fn query(&self, device_id: DeviceId) -> Result<crate::storage::DeviceInfo, Error> {
        self.registry.get(device_id).ok_or(Error::State(StateError::NotOpen))?.info()
    }

    pub fn refresh(&mut self, id: VolumeId) -> Result<(), Error> {
        let device_id = self.volumes.get(id).ok_or(Error::State(StateError::NotOpen))?.device_id();
        let device = self.registry.get_mut(device_id).ok_or(Error::State(StateError::NotOpen))?;
        let volume = self.volumes.get_mut(id).ok_or(Error::State(StateError::NotOpen))?;
        volume.refresh(device)
    }

    /// Raw volume-relative sector read, bypassing FAT semantics (spec §6
    /// "rd"); used by diagnostics and by hosts that want direct sector
    /// access alongside the file API.
    pub fn rd(&mut self, id: VolumeId, sector: u64, out: &mut [u8]) -> Result<(), Error> {
        let device_id = self.volumes.get(id).ok_or(Error::State(StateError::NotOpen))?.device_id();
        let device = self.registry.get_mut(device_id).ok_or(Error::State(StateError::NotOpen))?;
        let volume = self.volumes.get_mut(id).ok_or(Error::State(StateError::NotOpen))?;
        volume.rd(device, SectorType::Unknown, sector, out)
    }

    pub fn wr(&mut self, id: VolumeId, sector: u64, bytes: &[u8]) -> Result<(), Error> {
        let device_id = self.volumes.get(id).ok_or(Error::State(StateError::NotOpen))?.device_id();
        let device = self.registry.get_mut(device_id).ok_or(Error::State(StateError::NotOpen))?;
        let volume = self.volumes.get_mut(id).ok_or(Error::State(StateError::NotOpen))?;
        volume.wr(device, SectorType::Unknown, sector, bytes)
    }

    pub fn cache_assign(&mut self, id: VolumeId, mode: CacheMode) -> Result<(), Error> {
        let device_id = self.volumes.get(id).ok_or(Error::State(StateError::NotOpen))?.device_id();
        let device = self.registry.get_mut(device_id).ok_or(Error::State(StateError::NotOpen))?;
        let volume = self.volumes.get_mut(id).ok_or(Error::State(StateError::NotOpen))?;
        volume.cache_reassign(device, mode)
    }

    pub fn cache_flush(&mut self, id: VolumeId) -> Result<(), Error> {
        let device_id = self.volumes.get(id).ok_or(Error::State(StateError::NotOpen))?.device_id();
        let device = self.registry.get_mut(device_id).ok_or(Error::State(StateError::NotOpen))?;
        let volume = self.volumes.get_mut(id).ok_or(Error::State(StateError::NotOpen))?;
        volume.cache_flush(device)
    }

    pub fn cache_invalidate(&mut self, id: VolumeId) -> Result<(), Error> {
        self.volumes.get_mut(id).ok_or(Error::State(StateError::NotOpen))?.cache_invalidate()
    }

    /// Volume label, read from the FAT boot sector's BPB field (spec §6
    /// "label_get"/"label_set"). `Volume::label_get`/`label_set` track a
    /// separate in-memory label (e.g. for non-FAT partition naming) and are
    /// intentionally not used here.
    pub fn label_get(&mut self, id: VolumeId) -> Result<[u8; 11], Error> {
        with_fatfs(&mut self.registry, &mut self.volumes, id, |fs| Ok(fs.volume_label()))
    }

    pub fn label_set(&mut self, id: VolumeId, label: [u8; 11]) -> Result<(), Error> {
        with_fatfs(&mut self.registry, &mut self.volumes, id, |fs| fs.set_volume_label(label))
    }

    pub fn chdir(&mut self, path: &str) -> Result<(), Error> {
        if !self.config.working_dir_support {
            return Err(crate::error::DeviceError::InvalidConfig.into());
        }
        let full = self.normalize_path(path);
        self.working_dir.set(full);
        Ok(())
    }

    // -- path resolution ------------------------------------------------

    fn normalize_path(&self, path: &str) -> String {
        if path.starts_with('/') {
            path.to_string()
        } else {
            let cwd = self.working_dir.get().unwrap_or_else(|| "/".to_string());
            format!("{}/{}", cwd.trim_end_matches('/'), path)
        }
    }

    fn resolve_components(&mut self, id: VolumeId, comps: &[&str]) -> Result<RootDir, Error> {
        let mut location = with_fatfs(&mut self.registry, &mut self.volumes, id, |fs| Ok(fs.root_dir()))?;
        for comp in comps {
            let found = with_fatfs(&mut self.registry, &mut self.volumes, id, |fs| fat::dir::find(fs, location, comp))?;
            match found {
                Some(f) if f.entry.attributes.is_dir() => {
                    location = RootDir::Chain { start_cluster: f.entry.cluster_num() };
                }
                _ => return Err(VolumeError::NotFound.into()),
            }
        }
        Ok(location)
    }

    fn resolve_location(&mut self, id: VolumeId, path: &str) -> Result<RootDir, Error> {
        let full = self.normalize_path(path);
        let comps: Vec<&str> = full.split('/').filter(|s| !s.is_empty()).collect();
        self.resolve_components(id, &comps)
    }

    fn resolve_parent(&mut self, id: VolumeId, path: &str) -> Result<(RootDir, String), Error> {
        let full = self.normalize_path(path);
        let mut comps: Vec<&str> = full.split('/').filter(|s| !s.is_empty()).collect();
        let leaf = comps.pop().ok_or(Error::from(ArgError::InvalidPath))?.to_string();
        let parent = self.resolve_components(id, &comps)?;
        Ok((parent, leaf))
    }

    // -- files ------------------------------------------------

    fn alloc_file_slot(&mut self, of: OpenFile) -> Result<usize, Error> {
        for (i, slot) in self.files.iter_mut().enumerate() {
            if slot.file.is_none() {
                slot.file = Some(of);
                return Ok(i);
            }
        }
        Err(ResourceError::Memory.into())
    }

    fn take_file(&mut self, handle: FileHandle) -> Result<OpenFile, Error> {
        self.files.get_mut(handle.0).and_then(|s| s.file.take()).ok_or(Error::State(StateError::NotOpen))
    }

    fn put_file(&mut self, handle: FileHandle, of: OpenFile) {
        if let Some(slot) = self.files.get_mut(handle.0) {
            slot.file = Some(of);
        }
    }

    /// Opens (optionally creating) a file (spec §5 "open").
    pub fn open(&mut self, id: VolumeId, path: &str, create: bool, read_only: bool, task_id: u32) -> Result<FileHandle, Error> {
        self.volumes.get(id).ok_or(Error::State(StateError::NotOpen))?.require_mounted()?;
        let (parent, leaf) = self.resolve_parent(id, path)?;

        let found = with_fatfs(&mut self.registry, &mut self.volumes, id, |fs| fat::dir::find(fs, parent, &leaf))?;
        let (entry, dir_pos) = match found {
            Some(f) => {
                if f.entry.attributes.is_dir() {
                    return Err(VolumeError::EntryCorrupt.into());
                }
                (f.entry, f.pos)
            }
            None => {
                if !create {
                    return Err(VolumeError::NotFound.into());
                }
                with_fatfs(&mut self.registry, &mut self.volumes, id, |fs| {
                    let mut txn = fs.journal_begin();
                    txn.log(fat::journal::Record {
                        kind: fat::journal::RecordKind::EntryCreate,
                        txn_id: 0,
                        dir_sector: 0,
                        dir_offset: 0,
                        cluster_a: 0,
                        cluster_b: 0,
                    })?;
                    let records = txn.commit()?;
                    fs.journal_commit(&records)?;
                    fat::dir::create(fs, parent, &leaf, false, 0)?;
                    fs.journal_clear()
                })?;
                let found = with_fatfs(&mut self.registry, &mut self.volumes, id, |fs| fat::dir::find(fs, parent, &leaf))?
                    .ok_or(Error::from(VolumeError::EntryCorrupt))?;
                (found.entry, found.pos)
            }
        };

        let file = fat::file::File::open(entry.cluster_num(), entry.file_size);
        let refresh_cnt = self.volumes.get(id).ok_or(Error::State(StateError::NotOpen))?.refresh_cnt();
        let of = OpenFile { volume: id, file, entry, dir_pos, parent, refresh_cnt, read_only };

        let slot = self.alloc_file_slot(of)?;
        if self.config.file_lock_support {
            if let Err(e) = self.files[slot].lock.acquire(task_id) {
                self.files[slot].file = None;
                return Err(e);
            }
        }
        self.volumes.get_mut(id).ok_or(Error::State(StateError::NotOpen))?.inc_file_open();
        Ok(FileHandle(slot))
    }

    pub fn read(&mut self, handle: FileHandle, buf: &mut [u8]) -> Result<usize, Error> {
        let mut of = self.take_file(handle)?;
        let id = of.volume;
        if let Err(e) = self.volumes.get(id).ok_or(Error::State(StateError::NotOpen)).and_then(|v| v.check_fresh(of.refresh_cnt)) {
            self.put_file(handle, of);
            return Err(e);
        }
        let result = with_fatfs(&mut self.registry, &mut self.volumes, id, |fs| of.file.read(fs, buf));
        self.put_file(handle, of);
        result
    }

    pub fn write(&mut self, handle: FileHandle, buf: &[u8]) -> Result<usize, Error> {
        let mut of = self.take_file(handle)?;
        if of.read_only {
            self.put_file(handle, of);
            return Err(ArgError::InvalidPath.into());
        }
        let id = of.volume;
        if let Err(e) = self.volumes.get(id).ok_or(Error::State(StateError::NotOpen)).and_then(|v| v.check_fresh(of.refresh_cnt)) {
            self.put_file(handle, of);
            return Err(e);
        }
        let parent = of.parent;
        let dir_pos = of.dir_pos;

        let result = with_fatfs(&mut self.registry, &mut self.volumes, id, |fs| {
            let n = of.file.write(fs, buf)?;
            of.entry.set_cluster_num(of.file.first_cluster());
            of.entry.file_size = of.file.len();
            log_entry_update(fs, &dir_pos, of.entry.cluster_num())?;
            fat::dir::update_entry(fs, parent, dir_pos, &of.entry)?;
            fs.journal_clear()?;
            Ok(n)
        });
        self.put_file(handle, of);
        result
    }

    pub fn seek(&mut self, handle: FileHandle, from: fat::file::SeekFrom) -> Result<u64, Error> {
        let mut of = self.take_file(handle)?;
        let id = of.volume;
        let result = with_fatfs(&mut self.registry, &mut self.volumes, id, |fs| of.file.seek(fs, from));
        self.put_file(handle, of);
        result
    }

    pub fn truncate(&mut self, handle: FileHandle, new_size: u32) -> Result<(), Error> {
        let mut of = self.take_file(handle)?;
        if of.read_only {
            self.put_file(handle, of);
            return Err(ArgError::InvalidPath.into());
        }
        let id = of.volume;
        let parent = of.parent;
        let dir_pos = of.dir_pos;
        let result = with_fatfs(&mut self.registry, &mut self.volumes, id, |fs| {
            of.file.truncate(fs, new_size)?;
            of.entry.set_cluster_num(of.file.first_cluster());
            of.entry.file_size = of.file.len();
            log_entry_update(fs, &dir_pos, of.entry.cluster_num())?;
            fat::dir::update_entry(fs, parent, dir_pos, &of.entry)?;
            fs.journal_clear()
        });
        self.put_file(handle, of);
        result
    }

    pub fn close(&mut self, handle: FileHandle, task_id: u32) -> Result<(), Error> {
        let id = self.files.get(handle.0).and_then(|s| s.file.as_ref()).ok_or(Error::State(StateError::NotOpen))?.volume;
        if self.config.file_lock_support {
            self.files[handle.0].lock.release(task_id)?;
        }
        if let Some(v) = self.volumes.get_mut(id) {
            v.dec_file_open();
        }
        self.files[handle.0].file = None;
        Ok(())
    }

    // -- directories ------------------------------------------------

    fn alloc_dir_slot(&mut self, od: OpenDir) -> Result<usize, Error> {
        for (i, slot) in self.dirs.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(od);
                return Ok(i);
            }
        }
        Err(ResourceError::Memory.into())
    }

    pub fn mkdir(&mut self, id: VolumeId, path: &str) -> Result<(), Error> {
        self.volumes.get(id).ok_or(Error::State(StateError::NotOpen))?.require_mounted()?;
        let (parent, leaf) = self.resolve_parent(id, path)?;
        if with_fatfs(&mut self.registry, &mut self.volumes, id, |fs| fat::dir::find(fs, parent, &leaf))?.is_some() {
            return Err(StateError::AlreadyExists.into());
        }

        let cluster = with_fatfs(&mut self.registry, &mut self.volumes, id, |fs| fs.alloc_cluster())?;
        // Reused clusters can carry stale non-zero bytes; DirScanner reads a
        // 0x00 first byte as the end-of-directory marker, so the new
        // directory's sectors must be zeroed before anything scans them.
        with_fatfs(&mut self.registry, &mut self.volumes, id, |fs| {
            let zero: GenericArray<u8, MaxSectorSize> = GenericArray::default();
            for sector in fs.cluster_to_sector_range(cluster) {
                fs.write_sector(sector, &zero)?;
            }
            Ok(())
        })?;
        with_fatfs(&mut self.registry, &mut self.volumes, id, |fs| {
            let mut txn = fs.journal_begin();
            txn.log(fat::journal::Record {
                kind: fat::journal::RecordKind::ClusterAlloc,
                txn_id: 0,
                dir_sector: 0,
                dir_offset: 0,
                cluster_a: cluster,
                cluster_b: 0,
            })?;
            let records = txn.commit()?;
            fs.journal_commit(&records)?;
            fat::dir::create(fs, parent, &leaf, true, cluster)?;
            fs.journal_clear()
        })?;
        Ok(())
    }

    pub fn rmdir(&mut self, id: VolumeId, path: &str) -> Result<(), Error> {
        self.volumes.get(id).ok_or(Error::State(StateError::NotOpen))?.require_mounted()?;
        let (parent, leaf) = self.resolve_parent(id, path)?;
        let found = with_fatfs(&mut self.registry, &mut self.volumes, id, |fs| fat::dir::find(fs, parent, &leaf))?
            .ok_or(Error::from(VolumeError::NotFound))?;
        if !found.entry.attributes.is_dir() {
            return Err(VolumeError::EntryCorrupt.into());
        }

        let location = RootDir::Chain { start_cluster: found.entry.cluster_num() };
        let empty = with_fatfs(&mut self.registry, &mut self.volumes, id, |fs| {
            let mut scanner = fat::dir::DirScanner::new(fs, location);
            Ok(scanner.next_entry()?.is_none())
        })?;
        if !empty {
            return Err(VolumeError::NotEmpty.into());
        }

        with_fatfs(&mut self.registry, &mut self.volumes, id, |fs| journal_free_and_delete(fs, parent, found.entry.cluster_num(), found.pos))?;
        Ok(())
    }

    pub fn remove(&mut self, id: VolumeId, path: &str) -> Result<(), Error> {
        self.volumes.get(id).ok_or(Error::State(StateError::NotOpen))?.require_mounted()?;
        let (parent, leaf) = self.resolve_parent(id, path)?;
        let found = with_fatfs(&mut self.registry, &mut self.volumes, id, |fs| fat::dir::find(fs, parent, &leaf))?
            .ok_or(Error::from(VolumeError::NotFound))?;
        if found.entry.attributes.is_dir() {
            return Err(VolumeError::EntryCorrupt.into());
        }

        let cluster = found.entry.cluster_num();
        with_fatfs(&mut self.registry, &mut self.volumes, id, |fs| journal_free_and_delete(fs, parent, cluster, found.pos))?;
        Ok(())
    }

    /// Renames/moves a file or empty directory (spec §5 "rename"):
    /// recreated as a fresh entry at the destination (preserving its first
    /// cluster and, for files, its size) and deleted at the source.
    pub fn rename(&mut self, id: VolumeId, from: &str, to: &str) -> Result<(), Error> {
        self.volumes.get(id).ok_or(Error::State(StateError::NotOpen))?.require_mounted()?;
        let (from_parent, from_leaf) = self.resolve_parent(id, from)?;
        let (to_parent, to_leaf) = self.resolve_parent(id, to)?;

        let found = with_fatfs(&mut self.registry, &mut self.volumes, id, |fs| fat::dir::find(fs, from_parent, &from_leaf))?
            .ok_or(Error::from(VolumeError::NotFound))?;
        if with_fatfs(&mut self.registry, &mut self.volumes, id, |fs| fat::dir::find(fs, to_parent, &to_leaf))?.is_some() {
            return Err(StateError::AlreadyExists.into());
        }

        let is_dir = found.entry.attributes.is_dir();
        let cluster = found.entry.cluster_num();
        let size = found.entry.file_size;

        with_fatfs(&mut self.registry, &mut self.volumes, id, |fs| {
            fat::dir::create(fs, to_parent, &to_leaf, is_dir, cluster)?;
            if !is_dir && size != 0 {
                let moved = fat::dir::find(fs, to_parent, &to_leaf)?.ok_or(Error::from(VolumeError::EntryCorrupt))?;
                let mut e = moved.entry;
                e.file_size = size;
                fat::dir::update_entry(fs, to_parent, moved.pos, &e)?;
            }
            Ok(())
        })?;
        with_fatfs(&mut self.registry, &mut self.volumes, id, |fs| {
            let mut txn = fs.journal_begin();
            txn.log(fat::journal::Record {
                kind: fat::journal::RecordKind::EntryDelete,
                txn_id: 0,
                dir_sector: found.pos.sfn_sector,
                dir_offset: found.pos.sfn_offset,
                cluster_a: 0,
                cluster_b: 0,
            })?;
            let records = txn.commit()?;
            fs.journal_commit(&records)?;
            fat::dir::delete_run(fs, from_parent, found.pos)?;
            fs.journal_clear()
        })?;
        Ok(())
    }

    pub fn opendir(&mut self, id: VolumeId, path: &str) -> Result<DirHandle, Error> {
        self.volumes.get(id).ok_or(Error::State(StateError::NotOpen))?.require_mounted()?;
        let location = self.resolve_location(id, path)?;
        let refresh_cnt = self.volumes.get(id).ok_or(Error::State(StateError::NotOpen))?.refresh_cnt();
        let od = OpenDir { volume: id, location, index: 0, refresh_cnt };
        let slot = self.alloc_dir_slot(od)?;
        self.volumes.get_mut(id).ok_or(Error::State(StateError::NotOpen))?.inc_dir_open();
        Ok(DirHandle(slot))
    }

    /// Returns the next entry, or `None` at the end of the directory.
    /// Re-walks a fresh `DirScanner` from the start every call and skips
    /// `index` entries (see `OpenDir`'s doc comment); fine for the small
    /// directories this crate targets, but `O(n^2)` over a large one.
    pub fn readdir(&mut self, handle: DirHandle) -> Result<Option<DirEntryInfo>, Error> {
        let (id, location, index) = {
            let od = self.dirs.get(handle.0).and_then(|d| d.as_ref()).ok_or(Error::State(StateError::NotOpen))?;
            (od.volume, od.location, od.index)
        };

        let found = with_fatfs(&mut self.registry, &mut self.volumes, id, |fs| {
            let mut scanner = fat::dir::DirScanner::new(fs, location);
            let mut i = 0usize;
            loop {
                match scanner.next_entry()? {
                    Some(f) if i == index => return Ok(Some(f)),
                    Some(_) => i += 1,
                    None => return Ok(None),
                }
            }
        })?;

        match found {
            Some(f) => {
                if let Some(od) = self.dirs.get_mut(handle.0).and_then(|d| d.as_mut()) {
                    od.index = index + 1;
                }
                let name = if f.long_name_len > 0 {
                    decode_ucs2(&f.long_name[..f.long_name_len])
                } else {
                    let sfn = crate::fat::sfn::Sfn { name: f.entry.sfn, ext: f.entry.ext, nt_res: f.entry.nt_res };
                    let (buf, len) = sfn.display();
                    String::from_utf8_lossy(&buf[..len]).into_owned()
                };
                Ok(Some(DirEntryInfo { name, is_dir: f.entry.attributes.is_dir(), size: f.entry.file_size }))
            }
            None => Ok(None),
        }
    }

    pub fn closedir(&mut self, handle: DirHandle) -> Result<(), Error> {
        let id = self.dirs.get(handle.0).and_then(|d| d.as_ref()).ok_or(Error::State(StateError::NotOpen))?.volume;
        if let Some(v) = self.volumes.get_mut(id) {
            v.dec_dir_open();
        }
        self.dirs[handle.0] = None;
        Ok(())
    }
}

fn decode_ucs2(units: &[u16]) -> String {
    std::char::decode_utf16(units.iter().copied())
        .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

} // using_std! (Suite)

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RamStorage;
    use crate::storage::{DeviceConfig, StorageAsDriver};
    use typenum::consts::U512;

    fn make_suite() -> (Suite, VolumeId) {
        let mut suite = Suite::new(SuiteConfig::default()).unwrap();
        let driver = StorageAsDriver::new("ram", 512, true, || RamStorage::<U512>::new(4096, 512));
        let device_id = suite.register_driver(Box::new(driver)).unwrap();
        suite.device_open(device_id, DeviceConfig::default()).unwrap();
        let volume_id = suite.fmt(device_id, 0, 1).unwrap();
        (suite, volume_id)
    }

    #[test]
    fn create_write_close_reopen_read() {
        let (mut suite, vol) = make_suite();

        let h = suite.open(vol, "/hello.txt", true, false, 1).unwrap();
        let n = suite.write(h, b"hello, world!").unwrap();
        assert_eq!(n, 13);
        suite.close(h, 1).unwrap();

        let h = suite.open(vol, "/hello.txt", false, true, 1).unwrap();
        let mut buf = [0u8; 32];
        let read = suite.read(h, &mut buf).unwrap();
        assert_eq!(&buf[..read], b"hello, world!");
        suite.close(h, 1).unwrap();
    }

    #[test]
    fn mkdir_then_readdir_lists_entry() {
        let (mut suite, vol) = make_suite();

        suite.mkdir(vol, "/docs").unwrap();
        let h = suite.open(vol, "/docs/notes.txt", true, false, 1).unwrap();
        suite.write(h, b"note").unwrap();
        suite.close(h, 1).unwrap();

        let dh = suite.opendir(vol, "/docs").unwrap();
        let entry = suite.readdir(dh).unwrap().unwrap();
        assert_eq!(entry.name, "notes.txt");
        assert!(!entry.is_dir);
        assert_eq!(entry.size, 4);
        assert!(suite.readdir(dh).unwrap().is_none());
        suite.closedir(dh).unwrap();
    }

    #[test]
    fn rename_moves_entry_and_preserves_contents() {
        let (mut suite, vol) = make_suite();

        let h = suite.open(vol, "/a.txt", true, false, 1).unwrap();
        suite.write(h, b"payload").unwrap();
        suite.close(h, 1).unwrap();

        suite.rename(vol, "/a.txt", "/b.txt").unwrap();
        assert!(suite.open(vol, "/a.txt", false, true, 1).is_err());

        let h = suite.open(vol, "/b.txt", false, true, 1).unwrap();
        let mut buf = [0u8; 16];
        let n = suite.read(h, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"payload");
        suite.close(h, 1).unwrap();
    }

    #[test]
    fn rmdir_refuses_nonempty() {
        let (mut suite, vol) = make_suite();
        suite.mkdir(vol, "/d").unwrap();
        let h = suite.open(vol, "/d/f.txt", true, false, 1).unwrap();
        suite.close(h, 1).unwrap();

        assert!(suite.rmdir(vol, "/d").is_err());
        suite.remove(vol, "/d/f.txt").unwrap();
        suite.rmdir(vol, "/d").unwrap();
    }

    #[test]
    fn file_lock_refuses_foreign_close() {
        let (mut suite, vol) = make_suite();
        let h = suite.open(vol, "/locked.txt", true, false, 1).unwrap();
        assert!(suite.close(h, 2).is_err());
        suite.close(h, 1).unwrap();
    }
}
