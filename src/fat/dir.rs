//! Directory entries and directory scanning.
//!
//! Keeps the teacher's 8+3 `FileName`/`FileExt`/`DirEntry` physical field
//! layout (`fat::dir::DirEntry`, previously with a `todo!()` body for
//! encoding and a single-cluster-only, `U512`-only iterator); extends it
//! with LFN-aware scan/create/delete over any `FatFs<S>`, fixed-region or
//! cluster-chain directories alike.

use crate::error::{ClusterError, Error, VolumeError};
use crate::fat::sfn::{self, Sfn};
use crate::fat::lfn::{self, LfnEntry};
use crate::fat::table::{self, Cluster};
use crate::fat::{FatFs, RootDir};
use crate::storage::Storage;

use generic_array::GenericArray;

use core::convert::TryInto;

pub enum Attribute {
    ReadOnly = 0x01,
    Hidden = 0x02,
    System = 0x04,
    VolumeId = 0x08,
    Directory = 0x10,
    Archive = 0x20,
}

#[repr(transparent)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttributeSet {
    inner: u8,
}

impl AttributeSet {
    pub fn is_dir(&self) -> bool {
        self.inner & (Attribute::Directory as u8) != 0
    }

    pub fn is_lfn(&self) -> bool {
        self.inner == crate::fat::lfn::LFN_ATTR
    }

    pub fn set_dir(&mut self) {
        self.inner |= Attribute::Directory as u8;
    }
}

/// A directory entry, physically a 32-byte on-disk slot (SFN layout;
/// `from_bytes`/`to_bytes` match the classic FAT directory entry field
/// offsets).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirEntry {
    pub sfn: [u8; 8],
    pub ext: [u8; 3],
    pub attributes: AttributeSet,
    pub nt_res: u8,
    pub creation_time_tenth_secs: u8,
    pub creation_time: u16,
    pub creation_date: u16,
    pub last_access_date: u16,
    cluster_hi: u16,
    pub last_modif_time: u16,
    pub last_modif_date: u16,
    cluster_lo: u16,
    pub file_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Exists,
    Deleted,
    End,
}

impl DirEntry {
    pub fn state(&self) -> State {
        match self.sfn[0] {
            0x00 => State::End,
            0xE5 => State::Deleted,
            _ => State::Exists,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new_file(sfn: Sfn, cluster: Cluster, size: u32) -> Self {
        let mut d = Self { sfn: sfn.name, ext: sfn.ext, nt_res: sfn.nt_res, file_size: size, ..Self::default() };
        d.set_cluster_num(cluster);
        d
    }

    pub fn new_dir(sfn: Sfn, cluster: Cluster) -> Self {
        let mut d = Self::new_file(sfn, cluster, 0);
        d.attributes.set_dir();
        d
    }

    pub fn cluster_num(&self) -> Cluster {
        ((self.cluster_hi as u32) << 16) | self.cluster_lo as u32
    }

    pub fn set_cluster_num(&mut self, c: Cluster) {
        self.cluster_hi = (c >> 16) as u16;
        self.cluster_lo = c as u16;
    }

    pub fn from_bytes(arr: &[u8; 32]) -> Self {
        macro_rules! e {
            ($ty:tt, $offset:literal) => {
                $ty::from_le_bytes(arr[$offset..($offset + core::mem::size_of::<$ty>())].try_into().unwrap())
            };
        }

        Self {
            sfn: arr[0..8].try_into().unwrap(),
            ext: arr[8..11].try_into().unwrap(),
            attributes: AttributeSet { inner: arr[11] },
            nt_res: arr[12],
            creation_time_tenth_secs: arr[13],
            creation_time: e!(u16, 14),
            creation_date: e!(u16, 16),
            last_access_date: e!(u16, 18),
            cluster_hi: e!(u16, 20),
            last_modif_time: e!(u16, 22),
            last_modif_date: e!(u16, 24),
            cluster_lo: e!(u16, 26),
            file_size: e!(u32, 28),
        }
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        let mut arr = [0u8; 32];
        arr[0..8].copy_from_slice(&self.sfn);
        arr[8..11].copy_from_slice(&self.ext);
        arr[11] = self.attributes.inner;
        arr[12] = self.nt_res;
        arr[13] = self.creation_time_tenth_secs;
        arr[14..16].copy_from_slice(&self.creation_time.to_le_bytes());
        arr[16..18].copy_from_slice(&self.creation_date.to_le_bytes());
        arr[18..20].copy_from_slice(&self.last_access_date.to_le_bytes());
        arr[20..22].copy_from_slice(&self.cluster_hi.to_le_bytes());
        arr[22..24].copy_from_slice(&self.last_modif_time.to_le_bytes());
        arr[24..26].copy_from_slice(&self.last_modif_date.to_le_bytes());
        arr[26..28].copy_from_slice(&self.cluster_lo.to_le_bytes());
        arr[28..32].copy_from_slice(&self.file_size.to_le_bytes());
        arr
    }

    pub fn sfn_checksum(&self) -> u8 {
        let mut raw = [0u8; 11];
        raw[0..8].copy_from_slice(&self.sfn);
        raw[8..11].copy_from_slice(&self.ext);
        let mut sum: u8 = 0;
        for &b in raw.iter() {
            sum = sum.rotate_right(1).wrapping_add(b);
        }
        sum
    }
}

/// One located entry: the 32-byte SFN slot plus where its run of (LFN +
/// SFN) entries begins and ends, as `(sector, offset-in-sector)` pairs —
/// needed so callers (rename/remove) can overwrite the whole run.
#[derive(Debug, Clone, Copy)]
pub struct DirPos {
    pub run_start_sector: u64,
    pub run_start_offset: u16,
    pub sfn_sector: u64,
    pub sfn_offset: u16,
}

#[derive(Clone, Copy)]
enum Cursor {
    Fixed { sector: u32, end: u32 },
    Chain { cluster: Cluster, sector_in_cluster: u32 },
}

impl Cursor {
    fn start(loc: RootDir) -> Self {
        match loc {
            RootDir::Fixed { start_sector, sector_count } => Cursor::Fixed { sector: start_sector, end: start_sector + sector_count },
            RootDir::Chain { start_cluster } => Cursor::Chain { cluster: start_cluster, sector_in_cluster: 0 },
        }
    }

    fn current_sector<S: Storage>(&self, fs: &FatFs<S>) -> Option<u64> {
        match *self {
            Cursor::Fixed { sector, end } => if sector < end { Some(sector as u64) } else { None },
            Cursor::Chain { cluster, sector_in_cluster } => Some(fs.cluster_to_sector_range(cluster).start + sector_in_cluster as u64),
        }
    }

    /// Advances by one sector. With `extend`, a chain directory that runs
    /// out of allocated clusters grows by one (directory growth); a fixed
    /// root that runs out never grows (spec §4.6: fixed root is a hard
    /// cap). Returns `false` when the directory has no more sectors.
    fn advance<S: Storage>(&mut self, fs: &mut FatFs<S>, extend: bool) -> Result<bool, Error> {
        match self {
            Cursor::Fixed { sector, end } => {
                *sector += 1;
                Ok(*sector < *end)
            }
            Cursor::Chain { cluster, sector_in_cluster } => {
                let spc = fs.boot_sector().bpb.logical_sectors_per_cluster as u32;
                *sector_in_cluster += 1;
                if *sector_in_cluster < spc {
                    return Ok(true);
                }
                let raw = fs.fat_get(*cluster)?;
                if table::is_eoc(fs.geometry(), raw) {
                    if extend {
                        let next = fs.extend_chain(*cluster)?;
                        *cluster = next;
                        *sector_in_cluster = 0;
                        Ok(true)
                    } else {
                        Ok(false)
                    }
                } else if table::is_free(fs.geometry(), raw) || table::is_bad(fs.geometry(), raw) {
                    Err(ClusterError::ChainCorrupt.into())
                } else {
                    *cluster = raw;
                    *sector_in_cluster = 0;
                    Ok(true)
                }
            }
        }
    }
}

/// Scans a directory (fixed region or cluster chain) 32 bytes at a time,
/// reassembling LFN runs into long names.
pub struct DirScanner<'f, S: Storage> {
    fs: &'f mut FatFs<S>,
    cursor: Cursor,
    sector_buf: GenericArray<u8, S::SECTOR_SIZE>,
    buf_sector: Option<u64>,
    offset_in_sector: usize,
    lfn_chars: [u16; lfn::LFN_MAX_NAME_CHARS],
    lfn_len: usize,
    run_start: Option<(u64, u16)>,
    done: bool,
}

/// One SFN entry found by a scan, with its reassembled long name (if any
/// LFN fragments preceded it) and its position for later rename/remove.
pub struct Found {
    pub entry: DirEntry,
    pub long_name: [u16; lfn::LFN_MAX_NAME_CHARS],
    pub long_name_len: usize,
    pub pos: DirPos,
}

impl<'f, S: Storage> DirScanner<'f, S> {
    pub fn new(fs: &'f mut FatFs<S>, location: RootDir) -> Self {
        Self {
            fs,
            cursor: Cursor::start(location),
            sector_buf: GenericArray::default(),
            buf_sector: None,
            offset_in_sector: 0,
            lfn_chars: [0; lfn::LFN_MAX_NAME_CHARS],
            lfn_len: 0,
            run_start: None,
            done: false,
        }
    }

    fn ensure_sector_loaded(&mut self) -> Result<bool, Error> {
        let sector = match self.cursor.current_sector(self.fs) {
            Some(s) => s,
            None => return Ok(false),
        };
        if self.buf_sector != Some(sector) {
            self.fs.read_sector(sector, &mut self.sector_buf)?;
            self.buf_sector = Some(sector);
        }
        Ok(true)
    }

    fn sector_size(&self) -> usize {
        self.sector_buf.len()
    }

    /// Returns the next SFN entry with its reassembled name, or `None` at
    /// the end-of-directory marker.
    pub fn next_entry(&mut self) -> Result<Option<Found>, Error> {
        if self.done {
            return Ok(None);
        }
        loop {
            if !self.ensure_sector_loaded()? {
                self.done = true;
                return Ok(None);
            }
            let sector = self.buf_sector.unwrap();
            let raw: [u8; 32] = self.sector_buf.as_slice()[self.offset_in_sector..self.offset_in_sector + 32].try_into().unwrap();

            if self.run_start.is_none() {
                self.run_start = Some((sector, self.offset_in_sector as u16));
            }

            let first_byte = raw[0];
            let is_lfn = raw[11] == lfn::LFN_ATTR;

            if first_byte == 0x00 {
                self.done = true;
                return Ok(None);
            }

            if first_byte == 0xE5 {
                self.run_start = None;
                self.lfn_len = 0;
                self.advance_entry()?;
                continue;
            }

            if is_lfn {
                let e = LfnEntry::unpack(&raw);
                let start = (e.ordinal as usize - 1) * lfn::LFN_CHARS_PER_ENTRY;
                for (i, &c) in e.chars.iter().enumerate() {
                    if start + i < self.lfn_chars.len() {
                        self.lfn_chars[start + i] = c;
                    }
                }
                if e.is_last {
                    self.lfn_len = start + lfn::LFN_CHARS_PER_ENTRY;
                    while self.lfn_len > 0 && self.lfn_chars[self.lfn_len - 1] == 0 {
                        self.lfn_len -= 1;
                    }
                }
                self.advance_entry()?;
                continue;
            }

            let entry = DirEntry::from_bytes(&raw);
            let pos = DirPos {
                run_start_sector: self.run_start.unwrap().0,
                run_start_offset: self.run_start.unwrap().1,
                sfn_sector: sector,
                sfn_offset: self.offset_in_sector as u16,
            };
            let found = Found { entry, long_name: self.lfn_chars, long_name_len: self.lfn_len, pos };
            self.lfn_len = 0;
            self.run_start = None;
            self.advance_entry()?;
            return Ok(Some(found));
        }
    }

    fn advance_entry(&mut self) -> Result<(), Error> {
        self.offset_in_sector += 32;
        if self.offset_in_sector >= self.sector_size() {
            self.offset_in_sector = 0;
            if !self.cursor.advance(self.fs, false)? {
                self.done = true;
            }
            self.buf_sector = None;
        }
        Ok(())
    }
}

/// Finds a (short or long) `name` in the directory at `location`.
pub fn find<S: Storage>(fs: &mut FatFs<S>, location: RootDir, name: &str) -> Result<Option<Found>, Error> {
    let mut target = [0u16; lfn::LFN_MAX_NAME_CHARS];
    let target_len = lfn::encode_ucs2(name, &mut target);
    let target_sfn = match sfn::classify(name) {
        sfn::Classification::Short(s) => Some(s),
        sfn::Classification::NeedsLfn => None,
    };

    let mut scanner = DirScanner::new(fs, location);
    while let Some(found) = scanner.next_entry()? {
        if let Some(sfn) = target_sfn {
            if found.entry.sfn == sfn.name && found.entry.ext == sfn.ext {
                return Ok(Some(found));
            }
        } else if found.long_name_len == target_len && found.long_name[..target_len] == target[..target_len] {
            return Ok(Some(found));
        }
    }
    Ok(None)
}

/// Writes a full LFN+SFN run for `name` into the first run of free slots
/// found in `location` (extending the directory by one cluster if it is
/// chain-backed and full). Numeric-tail collisions are resolved by
/// retrying with an incremented tail, up to 1000 attempts.
pub fn create<S: Storage>(fs: &mut FatFs<S>, location: RootDir, name: &str, is_dir: bool, first_cluster: Cluster) -> Result<DirPos, Error> {
    let mut ucs2 = [0u16; lfn::LFN_MAX_NAME_CHARS];
    let ucs2_len = lfn::encode_ucs2(name, &mut ucs2);

    let sfn = match sfn::classify(name) {
        sfn::Classification::Short(s) => s,
        sfn::Classification::NeedsLfn => {
            let mut chosen = None;
            for i in 1..1000u32 {
                let candidate = sfn::numeric_tail(name, i);
                if find_sfn(fs, location, &candidate)?.is_none() {
                    chosen = Some(candidate);
                    break;
                }
            }
            chosen.ok_or(Error::from(VolumeError::DeviceFull))?
        }
    };

    let needs_lfn = !matches!(sfn::classify(name), sfn::Classification::Short(_));
    let lfn_entries = if needs_lfn { lfn::entries_needed(ucs2_len) as usize } else { 0 };
    let slots_needed = lfn_entries + 1;

    let mut entry = if is_dir { DirEntry::new_dir(sfn, first_cluster) } else { DirEntry::new_file(sfn, first_cluster, 0) };
    let checksum = entry.sfn_checksum();

    let run_start = find_free_run(fs, location, slots_needed)?;

    let mut raws: [[u8; 32]; lfn::LFN_MAX_ENTRIES as usize + 1] = [[0u8; 32]; lfn::LFN_MAX_ENTRIES as usize + 1];
    let mut n = 0;
    if needs_lfn {
        lfn::pack_all(&ucs2[..ucs2_len], checksum, |raw| {
            raws[n] = raw;
            n += 1;
        });
    }
    raws[n] = entry.to_bytes();
    n += 1;

    write_run(fs, location, run_start, &raws[..n])?;

    let sfn_slot_index = n - 1;
    let sfn_pos = advance_pos(fs, location, run_start, sfn_slot_index)?;

    Ok(DirPos { run_start_sector: run_start.0, run_start_offset: run_start.1, sfn_sector: sfn_pos.0, sfn_offset: sfn_pos.1 })
}

/// Marks every entry in the run `[start, start+count)` as deleted
/// (`0xE5`), atomically from the caller's perspective (spec §4.7: the
/// whole LFN+SFN run is retired together, under the journal in the full
/// suite; here, a straight sequential overwrite).
pub fn delete_run<S: Storage>(fs: &mut FatFs<S>, location: RootDir, pos: DirPos) -> Result<(), Error> {
    let mut cursor = Cursor::start(location);
    let mut sector = cursor.current_sector(fs).ok_or(Error::from(VolumeError::EntryCorrupt))?;
    while sector != pos.run_start_sector {
        if !cursor.advance(fs, false)? {
            return Err(VolumeError::EntryCorrupt.into());
        }
        sector = cursor.current_sector(fs).unwrap();
    }

    let mut offset = pos.run_start_offset as usize;
    loop {
        let mut buf: GenericArray<u8, S::SECTOR_SIZE> = GenericArray::default();
        fs.read_sector(sector, &mut buf)?;
        buf.as_mut_slice()[offset] = 0xE5;
        fs.write_sector(sector, &buf)?;

        if sector == pos.sfn_sector && offset == pos.sfn_offset as usize {
            return Ok(());
        }

        offset += 32;
        if offset >= buf.len() {
            offset = 0;
            if !cursor.advance(fs, false)? {
                return Err(VolumeError::EntryCorrupt.into());
            }
            sector = cursor.current_sector(fs).unwrap();
        }
    }
}

/// Overwrites just the 32-byte SFN slot at `pos` (name/attributes unchanged,
/// used to persist a file's size and first-cluster after writes land).
pub fn update_entry<S: Storage>(fs: &mut FatFs<S>, location: RootDir, pos: DirPos, entry: &DirEntry) -> Result<(), Error> {
    let mut cursor = Cursor::start(location);
    let mut sector = cursor.current_sector(fs).ok_or(Error::from(VolumeError::EntryCorrupt))?;
    while sector != pos.sfn_sector {
        if !cursor.advance(fs, false)? {
            return Err(VolumeError::EntryCorrupt.into());
        }
        sector = cursor.current_sector(fs).unwrap();
    }
    let mut buf: GenericArray<u8, S::SECTOR_SIZE> = GenericArray::default();
    fs.read_sector(sector, &mut buf)?;
    let offset = pos.sfn_offset as usize;
    buf.as_mut_slice()[offset..offset + 32].copy_from_slice(&entry.to_bytes());
    fs.write_sector(sector, &buf)
}

fn find_sfn<S: Storage>(fs: &mut FatFs<S>, location: RootDir, sfn: &Sfn) -> Result<Option<Found>, Error> {
    let mut scanner = DirScanner::new(fs, location);
    while let Some(found) = scanner.next_entry()? {
        if found.entry.sfn == sfn.name && found.entry.ext == sfn.ext {
            return Ok(Some(found));
        }
    }
    Ok(None)
}

/// Finds (or makes room for, by extending a chain-backed directory) a
/// run of `count` consecutive free/deleted/end slots, returning the
/// `(sector, offset)` of its first slot.
fn find_free_run<S: Storage>(fs: &mut FatFs<S>, location: RootDir, count: usize) -> Result<(u64, u16), Error> {
    let mut cursor = Cursor::start(location);
    let mut run_len = 0usize;
    let mut run_start: Option<(u64, u16)> = None;

    loop {
        let sector = match cursor.current_sector(fs) {
            Some(s) => s,
            None => {
                if !cursor.advance(fs, true)? {
                    return Err(VolumeError::DeviceFull.into());
                }
                continue;
            }
        };
        let mut buf: GenericArray<u8, S::SECTOR_SIZE> = GenericArray::default();
        fs.read_sector(sector, &mut buf)?;
        let sector_size = buf.len();

        let mut offset = 0usize;
        while offset < sector_size {
            let b0 = buf.as_slice()[offset];
            if b0 == 0x00 || b0 == 0xE5 {
                if run_start.is_none() {
                    run_start = Some((sector, offset as u16));
                }
                run_len += 1;
                if run_len >= count {
                    return Ok(run_start.unwrap());
                }
            } else {
                run_start = None;
                run_len = 0;
            }
            offset += 32;
        }

        if !cursor.advance(fs, true)? {
            return Err(VolumeError::DeviceFull.into());
        }
    }
}

fn write_run<S: Storage>(fs: &mut FatFs<S>, location: RootDir, start: (u64, u16), raws: &[[u8; 32]]) -> Result<(), Error> {
    let mut cursor = Cursor::start(location);
    let mut sector = cursor.current_sector(fs).ok_or(Error::from(VolumeError::EntryCorrupt))?;
    while sector != start.0 {
        if !cursor.advance(fs, true)? {
            return Err(VolumeError::EntryCorrupt.into());
        }
        sector = cursor.current_sector(fs).ok_or(Error::from(VolumeError::EntryCorrupt))?;
    }
    let mut offset = start.1 as usize;

    for raw in raws {
        let mut buf: GenericArray<u8, S::SECTOR_SIZE> = GenericArray::default();
        fs.read_sector(sector, &mut buf)?;
        buf.as_mut_slice()[offset..offset + 32].copy_from_slice(raw);
        fs.write_sector(sector, &buf)?;

        offset += 32;
        if offset >= buf.len() {
            offset = 0;
            if !cursor.advance(fs, true)? {
                return Err(VolumeError::EntryCorrupt.into());
            }
            sector = cursor.current_sector(fs).ok_or(Error::from(VolumeError::EntryCorrupt))?;
        }
    }
    Ok(())
}

fn advance_pos<S: Storage>(fs: &mut FatFs<S>, location: RootDir, start: (u64, u16), steps: usize) -> Result<(u64, u16), Error> {
    let mut cursor = Cursor::start(location);
    let mut sector = cursor.current_sector(fs).ok_or(Error::from(VolumeError::EntryCorrupt))?;
    while sector != start.0 {
        if !cursor.advance(fs, false)? {
            return Err(VolumeError::EntryCorrupt.into());
        }
        sector = cursor.current_sector(fs).ok_or(Error::from(VolumeError::EntryCorrupt))?;
    }
    let mut offset = start.1 as usize;
    let sector_size = fs.boot_sector().bpb.bytes_per_logical_sector as usize;

    for _ in 0..steps {
        offset += 32;
        if offset >= sector_size {
            offset = 0;
            if !cursor.advance(fs, false)? {
                return Err(VolumeError::EntryCorrupt.into());
            }
            sector = cursor.current_sector(fs).ok_or(Error::from(VolumeError::EntryCorrupt))?;
        }
    }
    Ok((sector, offset as u16))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RamStorage;
    use typenum::consts::U512;

    #[test]
    fn create_then_find_short_name() {
        let storage = RamStorage::<U512>::new(4096, 512);
        let mut fs = FatFs::format(storage, 1).unwrap();
        let root = fs.root_dir();

        let cluster = fs.alloc_cluster().unwrap();
        create(&mut fs, root, "HELLO.TXT", false, cluster).unwrap();

        let found = find(&mut fs, root, "HELLO.TXT").unwrap().unwrap();
        assert_eq!(found.entry.cluster_num(), cluster);
        assert!(!found.entry.attributes.is_dir());
    }

    #[test]
    fn create_then_find_long_name() {
        let storage = RamStorage::<U512>::new(4096, 512);
        let mut fs = FatFs::format(storage, 1).unwrap();
        let root = fs.root_dir();

        let cluster = fs.alloc_cluster().unwrap();
        create(&mut fs, root, "a long mixedCase name.txt", false, cluster).unwrap();

        let found = find(&mut fs, root, "a long mixedCase name.txt").unwrap().unwrap();
        assert_eq!(found.entry.cluster_num(), cluster);
        assert_eq!(found.long_name_len, "a long mixedCase name.txt".chars().count());
    }

    #[test]
    fn delete_removes_entry_from_scan() {
        let storage = RamStorage::<U512>::new(4096, 512);
        let mut fs = FatFs::format(storage, 1).unwrap();
        let root = fs.root_dir();

        let cluster = fs.alloc_cluster().unwrap();
        create(&mut fs, root, "GONE.TXT", false, cluster).unwrap();
        let found = find(&mut fs, root, "GONE.TXT").unwrap().unwrap();

        delete_run(&mut fs, root, found.pos).unwrap();
        assert!(find(&mut fs, root, "GONE.TXT").unwrap().is_none());
    }
}
