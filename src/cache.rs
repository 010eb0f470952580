//! Buffer pool and per-volume sector cache (spec §3 "Buffer"/"Sector
//! Cache", §4.1).
//!
//! Generalizes the fatfs crate's `fat::cache::CacheEntry`
//! (`Resident`/`Dirty`/`Free`, age-ordered) from one undifferentiated LRU
//! into the three pct-sized regions (management/directory/file) spec §4.1
//! requires, selected by `storage::SectorType`. Entry/data storage is a
//! `GenericArray`, following the teacher's fixed-capacity, no-realloc idiom
//! (and `fat::file`'s sketch of a `CS: ArrayLength<_>` cache-size
//! parameter) rather than a heap-allocated structure, so the cache works
//! in `no_std` builds with no allocator.

use crate::config::MaxSectorSize;
use crate::error::{Error, ResourceError, VolumeError};
use crate::storage::SectorType;

use generic_array::{ArrayLength, GenericArray};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Free,
    Resident,
    Dirty,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    state: EntryState,
    sector: u64,
    age: u64,
}

impl Entry {
    const fn free() -> Self {
        Self { state: EntryState::Free, sector: 0, age: 0 }
    }
}

/// One pct-sized LRU region of a `SectorCache` (spec §4.1). `N` bounds how
/// many sectors this region can hold; `CacheMode` (held by the owning
/// `SectorCache`) decides whether writes land here immediately
/// (write-through) or are deferred to eviction/flush (write-back).
struct Region<N: ArrayLength<Entry> + ArrayLength<GenericArray<u8, MaxSectorSize>>> {
    entries: GenericArray<Entry, N>,
    data: GenericArray<GenericArray<u8, MaxSectorSize>, N>,
    clock: u64,
}

impl<N: ArrayLength<Entry> + ArrayLength<GenericArray<u8, MaxSectorSize>>> Region<N> {
    fn new() -> Self {
        Self {
            entries: GenericArray::generate(|_| Entry::free()),
            data: GenericArray::default(),
            clock: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        let a = self.clock;
        self.clock = self.clock.wrapping_add(1);
        a
    }

    fn find(&self, sector: u64) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.state != EntryState::Free && e.sector == sector)
    }

    fn find_free(&self) -> Option<usize> {
        self.entries.iter().position(|e| e.state == EntryState::Free)
    }

    /// Index of the least-recently-used resident (clean) entry, preferred
    /// for eviction over dirty ones (dirty entries must be written back
    /// first, per spec §4.1).
    fn lru_clean(&self) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.state == EntryState::Resident)
            .min_by_key(|(_, e)| e.age)
            .map(|(i, _)| i)
    }

    fn lru_any(&self) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.state != EntryState::Free)
            .min_by_key(|(_, e)| e.age)
            .map(|(i, _)| i)
    }

    fn touch(&mut self, idx: usize) {
        let age = self.tick();
        self.entries[idx].age = age;
    }

    fn read(&mut self, sector: u64, out: &mut [u8]) -> Option<()> {
        let idx = self.find(sector)?;
        self.touch(idx);
        out.copy_from_slice(&self.data[idx].as_slice()[..out.len()]);
        Some(())
    }

    /// Admits `bytes` at `sector`, marking the entry dirty or clean per
    /// `dirty`. Evicts the LRU clean entry (never a dirty one silently) if
    /// the region is full; returns the evicted (sector, data) pair the
    /// caller must write back if it was dirty.
    fn admit(&mut self, sector: u64, bytes: &[u8], dirty: bool) -> Result<Option<(u64, GenericArray<u8, MaxSectorSize>)>, Error> {
        if let Some(idx) = self.find(sector) {
            self.data[idx].as_mut_slice()[..bytes.len()].copy_from_slice(bytes);
            self.entries[idx].state = if dirty { EntryState::Dirty } else { EntryState::Resident };
            self.touch(idx);
            return Ok(None);
        }

        let (idx, evicted) = if let Some(idx) = self.find_free() {
            (idx, None)
        } else if let Some(idx) = self.lru_clean() {
            (idx, None)
        } else if let Some(idx) = self.lru_any() {
            // Every entry is dirty: must hand the evictee back for a
            // synchronous write-back before reuse (spec §4.1 "eviction of a
            // dirty entry writes it synchronously").
            let evicted = (self.entries[idx].sector, self.data[idx].clone());
            (idx, Some(evicted))
        } else {
            return Err(ResourceError::NoBufferAvailable.into());
        };

        self.data[idx].as_mut_slice()[..bytes.len()].copy_from_slice(bytes);
        self.entries[idx].sector = sector;
        self.entries[idx].state = if dirty { EntryState::Dirty } else { EntryState::Resident };
        self.touch(idx);
        Ok(evicted)
    }

    /// Dirty entries in ascending sector order, for locality (spec §4.1
    /// flush policy).
    fn dirty_ascending(&self) -> impl Iterator<Item = (usize, u64)> + '_ {
        let mut v: heapless_vec::Collector = heapless_vec::Collector::new();
        for (i, e) in self.entries.iter().enumerate() {
            if e.state == EntryState::Dirty {
                v.push((i, e.sector));
            }
        }
        v.sort_by_sector();
        v.into_iter()
    }

    fn mark_clean(&mut self, idx: usize) {
        if self.entries[idx].state == EntryState::Dirty {
            self.entries[idx].state = EntryState::Resident;
        }
    }

    fn has_dirty(&self) -> bool {
        self.entries.iter().any(|e| e.state == EntryState::Dirty)
    }

    fn invalidate_clean(&mut self) {
        for e in self.entries.iter_mut() {
            if e.state == EntryState::Resident {
                *e = Entry::free();
            }
        }
    }
}

// A tiny fixed-capacity sort helper so `Region::dirty_ascending` doesn't
// need `alloc` in `no_std` builds; region sizes are small (cache regions,
// not file data) so insertion sort over a bounded stack array is fine.
mod heapless_vec {
    const MAX: usize = 64;

    pub struct Collector {
        buf: [(usize, u64); MAX],
        len: usize,
    }

    impl Collector {
        pub fn new() -> Self {
            Self { buf: [(0, 0); MAX], len: 0 }
        }

        pub fn push(&mut self, v: (usize, u64)) {
            if self.len < MAX {
                self.buf[self.len] = v;
                self.len += 1;
            }
        }

        pub fn sort_by_sector(&mut self) {
            // Insertion sort: regions are small, and this keeps us off
            // `alloc`'s `sort_unstable`.
            for i in 1..self.len {
                let mut j = i;
                while j > 0 && (self.buf[j - 1].1) > (self.buf[j].1) {
                    self.buf.swap(j - 1, j);
                    j -= 1;
                }
            }
        }

        pub fn into_iter(self) -> impl Iterator<Item = (usize, u64)> {
            let Collector { buf, len } = self;
            (0..len).map(move |i| buf[i])
        }
    }
}

/// Cache write/admission policy (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    None,
    ReadOnly,
    WriteThrough,
    WriteBack,
}

/// Per-volume sector cache, split into management/directory/file regions
/// (spec §4.1). `NM`/`ND`/`NF` are the region capacities; a volume picks
/// them (indirectly, by configuring percentages against a total the host
/// sizes the type parameters to match) at `cache_assign` time.
pub struct SectorCache<NM, ND, NF>
where
    NM: ArrayLength<Entry> + ArrayLength<GenericArray<u8, MaxSectorSize>>,
    ND: ArrayLength<Entry> + ArrayLength<GenericArray<u8, MaxSectorSize>>,
    NF: ArrayLength<Entry> + ArrayLength<GenericArray<u8, MaxSectorSize>>,
{
    mgmt: Region<NM>,
    dir: Region<ND>,
    file: Region<NF>,
    mode: CacheMode,
}

impl<NM, ND, NF> SectorCache<NM, ND, NF>
where
    NM: ArrayLength<Entry> + ArrayLength<GenericArray<u8, MaxSectorSize>>,
    ND: ArrayLength<Entry> + ArrayLength<GenericArray<u8, MaxSectorSize>>,
    NF: ArrayLength<Entry> + ArrayLength<GenericArray<u8, MaxSectorSize>>,
{
    pub fn new(mode: CacheMode) -> Self {
        Self { mgmt: Region::new(), dir: Region::new(), file: Region::new(), mode }
    }

    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    fn region(&mut self, ty: SectorType) -> RegionRef<'_, NM, ND, NF> {
        match ty {
            SectorType::Management | SectorType::Unknown => RegionRef::Mgmt(&mut self.mgmt),
            SectorType::Directory => RegionRef::Dir(&mut self.dir),
            SectorType::File => RegionRef::File(&mut self.file),
        }
    }

    /// Serves a read from the cache; `None` means "miss, go to the device".
    pub fn read(&mut self, ty: SectorType, sector: u64, out: &mut [u8]) -> Option<()> {
        if self.mode == CacheMode::None {
            return None;
        }
        match self.region(ty) {
            RegionRef::Mgmt(r) => r.read(sector, out),
            RegionRef::Dir(r) => r.read(sector, out),
            RegionRef::File(r) => r.read(sector, out),
        }
    }

    /// Admits data freshly fetched from the device on a read miss.
    pub fn admit_clean(&mut self, ty: SectorType, sector: u64, bytes: &[u8]) {
        if self.mode == CacheMode::None {
            return;
        }
        let _ = match self.region(ty) {
            RegionRef::Mgmt(r) => r.admit(sector, bytes, false),
            RegionRef::Dir(r) => r.admit(sector, bytes, false),
            RegionRef::File(r) => r.admit(sector, bytes, false),
        };
    }

    /// Admits a write. Returns `Some((sector, data))` the caller must write
    /// to the device synchronously: either because the cache is
    /// write-through, or because admitting a write-back entry evicted a
    /// dirty one. A write-back write that merely updates the cache (no
    /// eviction) returns `None` — the caller does no I/O.
    pub fn write(
        &mut self,
        ty: SectorType,
        sector: u64,
        bytes: &[u8],
    ) -> Result<WriteOutcome, Error> {
        match self.mode {
            CacheMode::None | CacheMode::ReadOnly => Ok(WriteOutcome::PassThrough),
            CacheMode::WriteThrough => {
                let evicted = match self.region(ty) {
                    RegionRef::Mgmt(r) => r.admit(sector, bytes, false)?,
                    RegionRef::Dir(r) => r.admit(sector, bytes, false)?,
                    RegionRef::File(r) => r.admit(sector, bytes, false)?,
                };
                Ok(WriteOutcome::WriteThrough { evicted })
            }
            CacheMode::WriteBack => {
                let evicted = match self.region(ty) {
                    RegionRef::Mgmt(r) => r.admit(sector, bytes, true)?,
                    RegionRef::Dir(r) => r.admit(sector, bytes, true)?,
                    RegionRef::File(r) => r.admit(sector, bytes, true)?,
                };
                Ok(WriteOutcome::WriteBack { evicted })
            }
        }
    }

    /// Flushes all dirty entries in ascending-sector order per region, via
    /// `write_back`. Fails fast on the first I/O error, per spec §4.1.
    pub fn flush(&mut self, mut write_back: impl FnMut(SectorType, u64, &[u8]) -> Result<(), Error>) -> Result<(), Error> {
        for (ty, region_has_dirty, drain) in [
            (SectorType::Management, self.mgmt.has_dirty(), 0u8),
            (SectorType::Directory, self.dir.has_dirty(), 1u8),
            (SectorType::File, self.file.has_dirty(), 2u8),
        ] {
            if !region_has_dirty {
                continue;
            }
            let _ = drain;
            loop {
                let next = match ty {
                    SectorType::Management => self.mgmt.dirty_ascending().next(),
                    SectorType::Directory => self.dir.dirty_ascending().next(),
                    _ => self.file.dirty_ascending().next(),
                };
                let Some((idx, sector)) = next else { break };
                let bytes = match ty {
                    SectorType::Management => self.mgmt.data[idx].clone(),
                    SectorType::Directory => self.dir.data[idx].clone(),
                    _ => self.file.data[idx].clone(),
                };
                write_back(ty, sector, bytes.as_slice())?;
                match ty {
                    SectorType::Management => self.mgmt.mark_clean(idx),
                    SectorType::Directory => self.dir.mark_clean(idx),
                    _ => self.file.mark_clean(idx),
                };
            }
        }
        Ok(())
    }

    /// Drops all clean entries; fails (without dropping anything) if any
    /// region still has a dirty entry (spec §4.1 invalidate).
    pub fn invalidate(&mut self) -> Result<(), Error> {
        if self.mgmt.has_dirty() || self.dir.has_dirty() || self.file.has_dirty() {
            return Err(VolumeError::EntryCorrupt.into());
        }
        self.mgmt.invalidate_clean();
        self.dir.invalidate_clean();
        self.file.invalidate_clean();
        Ok(())
    }
}

enum RegionRef<'a, NM, ND, NF>
where
    NM: ArrayLength<Entry> + ArrayLength<GenericArray<u8, MaxSectorSize>>,
    ND: ArrayLength<Entry> + ArrayLength<GenericArray<u8, MaxSectorSize>>,
    NF: ArrayLength<Entry> + ArrayLength<GenericArray<u8, MaxSectorSize>>,
{
    Mgmt(&'a mut Region<NM>),
    Dir(&'a mut Region<ND>),
    File(&'a mut Region<NF>),
}

/// What a caller must do after `SectorCache::write` returns.
pub enum WriteOutcome {
    /// Caching is off; the caller must write the sector itself.
    PassThrough,
    /// Write-through: the caller must still write `sector`'s bytes to the
    /// device; `evicted` (if any) is a *different* dirty sector that also
    /// needs a synchronous write-back first.
    WriteThrough { evicted: Option<(u64, GenericArray<u8, MaxSectorSize>)> },
    /// Write-back: the write is resident only; `evicted`, if present, is a
    /// dirty sector that had to be written back to make room.
    WriteBack { evicted: Option<(u64, GenericArray<u8, MaxSectorSize>)> },
}

/// A single-sector scratch handle, owned by one logical operation at a
/// time (spec §3 "Buffer", §4.1). Bound to at most one `(sector, type)`
/// pair while `Used`/`Dirty`.
pub struct Buffer {
    data: GenericArray<u8, MaxSectorSize>,
    bound: Option<(SectorType, u64)>,
    dirty: bool,
}

impl Buffer {
    fn new() -> Self {
        Self { data: GenericArray::default(), bound: None, dirty: false }
    }

    pub fn is_free(&self) -> bool {
        self.bound.is_none()
    }

    pub fn bound_to(&self) -> Option<(SectorType, u64)> {
        self.bound
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn bytes(&self) -> &[u8] {
        self.data.as_slice()
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.data.as_mut_slice()
    }

    pub fn bind(&mut self, ty: SectorType, sector: u64) {
        self.bound = Some((ty, sector));
        self.dirty = false;
    }

    pub fn mark_dirty(&mut self) -> Result<(), Error> {
        if self.bound.is_none() {
            return Err(ResourceError::NoBufferAvailable.into());
        }
        self.dirty = true;
        Ok(())
    }

    pub fn release(&mut self) {
        self.bound = None;
        self.dirty = false;
    }
}

/// Fixed-capacity pool of `Buffer`s, reserved once at init and never
/// resized (spec §5 "Buffer pool... process-wide, fixed at init"). Sized
/// `>= 2 * max_volumes` by `config::SuiteConfig::validate`.
pub struct BufferPool<N: ArrayLength<Buffer>> {
    buffers: GenericArray<Buffer, N>,
}

impl<N: ArrayLength<Buffer>> BufferPool<N> {
    pub fn new() -> Self {
        Self { buffers: GenericArray::generate(|_| Buffer::new()) }
    }

    /// Acquires a free buffer, or `None` if the pool is exhausted (spec
    /// §7 `ResourceError::NoBufferAvailable`).
    pub fn acquire(&mut self) -> Option<BufferHandle<'_>> {
        let idx = self.buffers.iter().position(Buffer::is_free)?;
        Some(BufferHandle { pool: self, idx })
    }
}

impl<N: ArrayLength<Buffer>> Default for BufferPool<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// A borrowed, exclusively-owned buffer from a `BufferPool`. Releases its
/// slot back to the pool on drop unless the caller already called
/// `release` (scoped acquisition, per spec §4.1).
pub struct BufferHandle<'p, N: ArrayLength<Buffer>> {
    pool: &'p mut BufferPool<N>,
    idx: usize,
}

impl<'p, N: ArrayLength<Buffer>> BufferHandle<'p, N> {
    pub fn buffer(&self) -> &Buffer {
        &self.pool.buffers[self.idx]
    }

    pub fn buffer_mut(&mut self) -> &mut Buffer {
        &mut self.pool.buffers[self.idx]
    }

    pub fn release(self) {
        // Dropping runs the `Drop` impl below, which clears the binding.
    }
}

impl<'p, N: ArrayLength<Buffer>> Drop for BufferHandle<'p, N> {
    fn drop(&mut self) {
        self.pool.buffers[self.idx].release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use typenum::consts::U4;

    #[test]
    fn region_admits_and_reads() {
        let mut cache: SectorCache<U4, U4, U4> = SectorCache::new(CacheMode::WriteBack);
        let data = [1u8; 16];
        let outcome = cache.write(SectorType::File, 10, &data).unwrap();
        assert!(matches!(outcome, WriteOutcome::WriteBack { evicted: None }));

        let mut out = [0u8; 16];
        assert!(cache.read(SectorType::File, 10, &mut out).is_some());
        assert_eq!(out, data);
    }

    #[test]
    fn invalidate_fails_with_dirty_entries() {
        let mut cache: SectorCache<U4, U4, U4> = SectorCache::new(CacheMode::WriteBack);
        cache.write(SectorType::Management, 0, &[1u8; 8]).unwrap();
        assert!(cache.invalidate().is_err());
        cache.flush(|_, _, _| Ok(())).unwrap();
        assert!(cache.invalidate().is_ok());
    }

    #[test]
    fn flush_is_ascending_by_sector() {
        let mut cache: SectorCache<U4, U4, U4> = SectorCache::new(CacheMode::WriteBack);
        cache.write(SectorType::Directory, 5, &[5u8; 4]).unwrap();
        cache.write(SectorType::Directory, 1, &[1u8; 4]).unwrap();
        cache.write(SectorType::Directory, 3, &[3u8; 4]).unwrap();

        let mut seen = heapless_vec::Collector::new();
        cache
            .flush(|_, sector, _| {
                seen.push((0, sector));
                Ok(())
            })
            .unwrap();
        let order: Vec<u64> = seen.into_iter().map(|(_, s)| s).collect();
        assert_eq!(order, vec![1, 3, 5]);
    }
}
