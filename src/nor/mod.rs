//! NOR flash translation layer (spec §8 "NOR FTL").
//!
//! A log-structured remapper: each erase block starts with a header
//! sector (`{magic, erase_count}`) followed by fixed-size record slots.
//! Updating a logical sector appends a new record to the current *active*
//! block and invalidates the old one in place (flash only clears bits, so
//! invalidation is a second, narrower write to the same physical sector
//! rather than a rewrite of its whole content); running out of slots in
//! the active block triggers garbage collection, which copies the
//! surviving valid records of the best reclaim candidate into the spare
//! block and erases the reclaimed one. Wear leveling overrides the normal
//! "most garbage" GC candidate once the erase-count spread exceeds
//! `erase_diff_threshold` (spec §6 `nor_erase_count_diff_threshold`),
//! forcibly reclaiming the least-erased full block instead.
//!
//! Sized like `nand::NandFtl`: a `GenericArray` of per-block bookkeeping
//! bounded by `config::MaxFtlBlocks`, no heap allocation required.

use crate::error::{DeviceError, Error, VolumeError};
use crate::storage::Storage;

use generic_array::{ArrayLength, GenericArray};

use core::convert::TryInto;

const BLOCK_MAGIC: u32 = 0x4E4F_5248; // "NORH"
const RECORD_MAGIC: u32 = 0x4E4F_5231; // "NOR1"
const ERASED_U32: u32 = 0xFFFF_FFFF;

/// Flags byte trailing each record. Flash only clears bits, so each state
/// is reachable from the previous one by clearing a bit, never setting one.
const FLAGS_COMMITTED: u8 = 0xFE; // bit 0 cleared: payload+crc fully programmed
const FLAGS_INVALID: u8 = 0xFC; // bit 1 also cleared: superseded by a newer record

/// magic(4) + logical_sector(4) + seq(4) + crc32(4) + flags(1).
const TRAILER_LEN: usize = 17;

fn payload_len(sector_size: usize) -> usize {
    sector_size - TRAILER_LEN
}

struct RecordView<'a> {
    #[allow(dead_code)]
    payload: &'a [u8],
    logical_sector: u32,
    seq: u32,
    #[allow(dead_code)]
    crc: u32,
    flags: u8,
}

fn parse_record(buf: &[u8]) -> Option<RecordView<'_>> {
    let plen = payload_len(buf.len());
    let magic = u32::from_le_bytes(buf[plen..plen + 4].try_into().ok()?);
    if magic != RECORD_MAGIC {
        return None;
    }
    let logical_sector = u32::from_le_bytes(buf[plen + 4..plen + 8].try_into().ok()?);
    let seq = u32::from_le_bytes(buf[plen + 8..plen + 12].try_into().ok()?);
    let crc = u32::from_le_bytes(buf[plen + 12..plen + 16].try_into().ok()?);
    let flags = buf[plen + 16];
    Some(RecordView { payload: &buf[..plen], logical_sector, seq, crc, flags })
}

fn record_crc(payload: &[u8], logical_sector: u32, seq: u32) -> u32 {
    let mut tmp = [0u8; 4096];
    let mut n = 0;
    tmp[n..n + payload.len()].copy_from_slice(payload);
    n += payload.len();
    tmp[n..n + 4].copy_from_slice(&RECORD_MAGIC.to_le_bytes());
    n += 4;
    tmp[n..n + 4].copy_from_slice(&logical_sector.to_le_bytes());
    n += 4;
    tmp[n..n + 4].copy_from_slice(&seq.to_le_bytes());
    n += 4;
    crc::crc32::checksum_ieee(&tmp[..n])
}

fn build_record(buf: &mut [u8], payload: &[u8], logical_sector: u32, seq: u32, flags: u8) {
    let plen = payload_len(buf.len());
    buf[..payload.len()].copy_from_slice(payload);
    for b in &mut buf[payload.len()..plen] {
        *b = 0xFF;
    }
    let crc = record_crc(&buf[..plen], logical_sector, seq);
    buf[plen..plen + 4].copy_from_slice(&RECORD_MAGIC.to_le_bytes());
    buf[plen + 4..plen + 8].copy_from_slice(&logical_sector.to_le_bytes());
    buf[plen + 8..plen + 12].copy_from_slice(&seq.to_le_bytes());
    buf[plen + 12..plen + 16].copy_from_slice(&crc.to_le_bytes());
    buf[plen + 16] = flags;
}

#[derive(Debug, Clone, Copy, Default)]
struct BlockMeta {
    erase_count: u32,
    used_slots: u32,
    valid_slots: u32,
}

impl BlockMeta {
    fn is_free(&self) -> bool {
        self.used_slots == 0
    }

    fn is_full(&self, slots_per_block: u32) -> bool {
        self.used_slots >= slots_per_block
    }

    fn garbage(&self) -> u32 {
        self.used_slots - self.valid_slots
    }
}

/// Where a logical sector's current record lives.
#[derive(Debug, Clone, Copy)]
struct Location {
    block: u32,
    slot: u32,
}

pub struct NorFtl<S: Storage, N: ArrayLength<BlockMeta>> {
    storage: S,
    #[allow(dead_code)]
    sector_size: usize,
    sectors_per_block: u32,
    slots_per_block: u32,
    block_count: u32,
    erase_diff_threshold: u32,
    active_block: u32,
    next_seq: u32,
    blocks: GenericArray<BlockMeta, N>,
}

impl<S: Storage, N: ArrayLength<BlockMeta>> NorFtl<S, N> {
    fn header_sector(&self, block: u32) -> u64 {
        block as u64 * self.sectors_per_block as u64
    }

    fn record_sector(&self, block: u32, slot: u32) -> u64 {
        self.header_sector(block) + 1 + slot as u64
    }

    /// Number of logical sectors this FTL exposes: every block's record
    /// slots except one block held back as the always-free GC spare.
    pub fn logical_sector_count(&self) -> u32 {
        (self.block_count - 1) * self.slots_per_block
    }

    /// Low-level format: erases every block and writes a fresh header to
    /// each, with block 0 as the initial active block.
    pub fn format(storage: S, sectors_per_block: u32, block_count: u32, erase_diff_threshold: u32) -> Result<Self, Error> {
        if sectors_per_block < 2 || block_count < 2 {
            return Err(DeviceError::InvalidConfig.into());
        }

        let sector_size = GenericArray::<u8, S::SECTOR_SIZE>::default().as_slice().len();

        let mut ftl = Self {
            storage,
            sector_size,
            sectors_per_block,
            slots_per_block: sectors_per_block - 1,
            block_count,
            erase_diff_threshold,
            active_block: 0,
            next_seq: 1,
            blocks: GenericArray::default(),
        };

        for b in 0..block_count {
            ftl.erase_and_init_header(b, 0)?;
        }
        ftl.active_block = 0;
        Ok(ftl)
    }

    fn erase_and_init_header(&mut self, block: u32, erase_count: u32) -> Result<(), Error> {
        for s in 0..self.sectors_per_block {
            self.storage.erase_sector(self.header_sector(block) + s as u64).map_err(crate::error::device_err)?;
        }
        let mut hdr: GenericArray<u8, S::SECTOR_SIZE> = GenericArray::default();
        for b in hdr.iter_mut() {
            *b = 0xFF;
        }
        let buf = hdr.as_mut_slice();
        buf[0..4].copy_from_slice(&BLOCK_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&erase_count.to_le_bytes());
        buf[8] = FLAGS_COMMITTED;
        self.storage.write_sector(self.header_sector(block), &hdr).map_err(crate::error::device_err)?;

        self.blocks[block as usize] = BlockMeta { erase_count, used_slots: 0, valid_slots: 0 };
        Ok(())
    }

    /// Mounts a previously-formatted region, rebuilding block bookkeeping
    /// and resolving any crash-window duplicate (two committed records for
    /// the same logical sector, left by a write whose old-record
    /// invalidation never landed).
    pub fn mount(mut storage: S, sectors_per_block: u32, block_count: u32, erase_diff_threshold: u32) -> Result<Self, Error> {
        if sectors_per_block < 2 || block_count < 2 {
            return Err(DeviceError::InvalidConfig.into());
        }

        let mut probe: GenericArray<u8, S::SECTOR_SIZE> = GenericArray::default();
        storage.read_sector(0, &mut probe).map_err(crate::error::device_err)?;
        let magic = u32::from_le_bytes(probe.as_slice()[0..4].try_into().unwrap());
        if magic != BLOCK_MAGIC {
            return Err(VolumeError::BadSuperblock.into());
        }
        let sector_size = probe.as_slice().len();

        let mut ftl = Self {
            storage,
            sector_size,
            sectors_per_block,
            slots_per_block: sectors_per_block - 1,
            block_count,
            erase_diff_threshold,
            active_block: 0,
            next_seq: 1,
            blocks: GenericArray::default(),
        };

        let mut active_candidate = None;
        let mut max_seq = 0u32;

        for block in 0..block_count {
            let mut hdr: GenericArray<u8, S::SECTOR_SIZE> = GenericArray::default();
            ftl.storage.read_sector(ftl.header_sector(block), &mut hdr).map_err(crate::error::device_err)?;
            let hmagic = u32::from_le_bytes(hdr.as_slice()[0..4].try_into().unwrap());
            if hmagic != BLOCK_MAGIC {
                return Err(VolumeError::BadSuperblock.into());
            }
            let erase_count = u32::from_le_bytes(hdr.as_slice()[4..8].try_into().unwrap());

            let mut used = 0u32;
            let mut valid = 0u32;
            for slot in 0..ftl.slots_per_block {
                let mut rec: GenericArray<u8, S::SECTOR_SIZE> = GenericArray::default();
                ftl.storage.read_sector(ftl.record_sector(block, slot), &mut rec).map_err(crate::error::device_err)?;
                match parse_record(rec.as_slice()) {
                    None => break, // erased (or torn/uncommitted) tail: rest of block is still free
                    Some(r) => {
                        used += 1;
                        if r.flags == FLAGS_COMMITTED {
                            valid += 1;
                            if r.seq > max_seq {
                                max_seq = r.seq;
                            }
                        }
                    }
                }
            }

            ftl.blocks[block as usize] = BlockMeta { erase_count, used_slots: used, valid_slots: valid };
            if used < ftl.slots_per_block && active_candidate.is_none() {
                active_candidate = Some(block);
            }
        }

        ftl.active_block = active_candidate.unwrap_or(0);
        ftl.next_seq = max_seq.wrapping_add(1);

        ftl.reconcile_duplicates()?;
        if ftl.blocks[ftl.active_block as usize].is_full(ftl.slots_per_block) {
            ftl.reclaim()?;
        }

        Ok(ftl)
    }

    /// Scans for logical sectors with more than one `FLAGS_COMMITTED`
    /// record (the crash window between committing a new record and
    /// invalidating the old one) and invalidates every copy but the
    /// highest-`seq` one.
    fn reconcile_duplicates(&mut self) -> Result<(), Error> {
        for logical in 0..self.logical_sector_count() {
            let locations = self.find_all_committed(logical)?;
            if locations.len() <= 1 {
                continue;
            }
            let winner = locations.iter().max_by_key(|item| item.1).map(|item| item.0).unwrap();
            for (loc, _) in locations.into_iter() {
                if loc.block != winner.block || loc.slot != winner.slot {
                    self.invalidate(loc)?;
                }
            }
        }
        Ok(())
    }

    fn find_all_committed(&mut self, logical: u32) -> Result<heap_free_vec::LocVec, Error> {
        let mut out = heap_free_vec::LocVec::new();
        for block in 0..self.block_count {
            let meta = self.blocks[block as usize];
            for slot in 0..meta.used_slots {
                let mut rec: GenericArray<u8, S::SECTOR_SIZE> = GenericArray::default();
                self.storage.read_sector(self.record_sector(block, slot), &mut rec).map_err(crate::error::device_err)?;
                if let Some(r) = parse_record(rec.as_slice()) {
                    if r.flags == FLAGS_COMMITTED && r.logical_sector == logical {
                        out.push((Location { block, slot }, r.seq));
                    }
                }
            }
        }
        Ok(out)
    }

    fn find_committed(&mut self, logical: u32) -> Result<Option<(Location, u32)>, Error> {
        let all = self.find_all_committed(logical)?;
        Ok(all.into_iter().max_by_key(|item| item.1))
    }

    fn invalidate(&mut self, loc: Location) -> Result<(), Error> {
        let sector = self.record_sector(loc.block, loc.slot);
        let mut rec: GenericArray<u8, S::SECTOR_SIZE> = GenericArray::default();
        self.storage.read_sector(sector, &mut rec).map_err(crate::error::device_err)?;
        let plen = payload_len(rec.as_slice().len());
        rec.as_mut_slice()[plen + 16] = FLAGS_INVALID;
        self.storage.write_sector(sector, &rec).map_err(crate::error::device_err)?;
        self.blocks[loc.block as usize].valid_slots -= 1;
        Ok(())
    }

    /// Reads the current content of `logical`; zero-filled if never
    /// written.
    pub fn read_sector(&mut self, logical: u32, out: &mut [u8]) -> Result<(), Error> {
        if logical >= self.logical_sector_count() {
            return Err(VolumeError::EntryCorrupt.into());
        }
        match self.find_committed(logical)? {
            Some((loc, _)) => {
                let sector = self.record_sector(loc.block, loc.slot);
                let mut rec: GenericArray<u8, S::SECTOR_SIZE> = GenericArray::default();
                self.storage.read_sector(sector, &mut rec).map_err(crate::error::device_err)?;
                let plen = payload_len(rec.as_slice().len());
                let n = out.len().min(plen);
                out[..n].copy_from_slice(&rec.as_slice()[..n]);
                Ok(())
            }
            None => {
                for b in out.iter_mut() {
                    *b = 0;
                }
                Ok(())
            }
        }
    }

    /// Writes `data` as the new content of `logical`, appending a record
    /// to the active block (reclaiming first if it's full) and
    /// invalidating the previous record, if any.
    pub fn write_sector(&mut self, logical: u32, data: &[u8]) -> Result<(), Error> {
        if logical >= self.logical_sector_count() {
            return Err(VolumeError::EntryCorrupt.into());
        }
        if self.blocks[self.active_block as usize].is_full(self.slots_per_block) {
            self.reclaim()?;
        }

        let old = self.find_committed(logical)?;

        let slot = self.blocks[self.active_block as usize].used_slots;
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);

        let mut buf: GenericArray<u8, S::SECTOR_SIZE> = GenericArray::default();
        build_record(buf.as_mut_slice(), data, logical, seq, FLAGS_COMMITTED);
        let sector = self.record_sector(self.active_block, slot);
        self.storage.write_sector(sector, &buf).map_err(crate::error::device_err)?;

        self.blocks[self.active_block as usize].used_slots += 1;
        self.blocks[self.active_block as usize].valid_slots += 1;

        if let Some((loc, _)) = old {
            self.invalidate(loc)?;
        }

        Ok(())
    }

    /// Picks a reclaim victim, copies its surviving records into the
    /// current free block, erases the victim, and makes the
    /// (now-compacted) former-free block the new active block.
    fn reclaim(&mut self) -> Result<(), Error> {
        let spare = (0..self.block_count)
            .find(|&b| self.blocks[b as usize].is_free())
            .ok_or(Error::from(VolumeError::DeviceFull))?;

        let victim = self.pick_gc_victim(spare)?;

        let mut new_slot = 0u32;
        for slot in 0..self.blocks[victim as usize].used_slots {
            let mut rec: GenericArray<u8, S::SECTOR_SIZE> = GenericArray::default();
            self.storage.read_sector(self.record_sector(victim, slot), &mut rec).map_err(crate::error::device_err)?;
            if let Some(r) = parse_record(rec.as_slice()) {
                if r.flags == FLAGS_COMMITTED {
                    self.storage.write_sector(self.record_sector(spare, new_slot), &rec).map_err(crate::error::device_err)?;
                    new_slot += 1;
                }
            }
        }
        self.blocks[spare as usize] = BlockMeta { erase_count: self.blocks[spare as usize].erase_count, used_slots: new_slot, valid_slots: new_slot };

        let victim_erase_count = self.blocks[victim as usize].erase_count;
        self.erase_and_init_header(victim, victim_erase_count + 1)?;

        self.active_block = spare;
        Ok(())
    }

    fn pick_gc_victim(&self, exclude: u32) -> Result<u32, Error> {
        let min_ec = (0..self.block_count).filter(|&b| b != exclude).map(|b| self.blocks[b as usize].erase_count).min().unwrap_or(0);
        let max_ec = (0..self.block_count).filter(|&b| b != exclude).map(|b| self.blocks[b as usize].erase_count).max().unwrap_or(0);

        let candidates = (0..self.block_count).filter(|&b| b != exclude && self.blocks[b as usize].used_slots > 0);

        if max_ec.saturating_sub(min_ec) > self.erase_diff_threshold {
            candidates.min_by_key(|&b| self.blocks[b as usize].erase_count).ok_or_else(|| VolumeError::DeviceFull.into())
        } else {
            candidates.max_by_key(|&b| self.blocks[b as usize].garbage()).ok_or_else(|| VolumeError::DeviceFull.into())
        }
    }

    pub fn into_storage(self) -> S {
        self.storage
    }
}

/// A tiny fixed-capacity stand-in for `Vec<(Location, u32)>`, sized for the
/// handful of crash-window duplicates `reconcile_duplicates`/`find_committed`
/// ever expect to see for one logical sector.
mod heap_free_vec {
    use super::Location;

    pub struct LocVec {
        items: [(Location, u32); 8],
        len: usize,
    }

    impl LocVec {
        pub fn new() -> Self {
            Self { items: [(Location { block: 0, slot: 0 }, 0); 8], len: 0 }
        }

        pub fn push(&mut self, item: (Location, u32)) {
            if self.len < self.items.len() {
                self.items[self.len] = item;
                self.len += 1;
            }
        }

        pub fn len(&self) -> usize {
            self.len
        }

        pub fn iter(&self) -> impl Iterator<Item = &(Location, u32)> {
            self.items[..self.len].iter()
        }
    }

    impl IntoIterator for LocVec {
        type Item = (Location, u32);
        type IntoIter = core::iter::Take<core::array::IntoIter<(Location, u32), 8>>;

        fn into_iter(self) -> Self::IntoIter {
            self.items.into_iter().take(self.len)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RamStorage;
    use typenum::consts::{U512, U64};

    fn new_ftl() -> NorFtl<RamStorage<U512>, U64> {
        let storage = RamStorage::<U512>::new(8 * 4, 512);
        NorFtl::format(storage, 4, 8, 2).unwrap()
    }

    #[test]
    fn unwritten_sector_reads_zero() {
        let mut ftl = new_ftl();
        let mut out = [0xAAu8; 64];
        ftl.read_sector(0, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn write_then_read_back() {
        let mut ftl = new_ftl();
        let data = [0x7Bu8; 64];
        ftl.write_sector(2, &data).unwrap();

        let mut out = [0u8; 64];
        ftl.read_sector(2, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn overwrite_invalidates_previous_record() {
        let mut ftl = new_ftl();
        ftl.write_sector(1, &[0x11u8; 64]).unwrap();
        ftl.write_sector(1, &[0x22u8; 64]).unwrap();

        let mut out = [0u8; 64];
        ftl.read_sector(1, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0x22));
        assert_eq!(ftl.blocks[ftl.active_block as usize].valid_slots, 1);
    }

    #[test]
    fn filling_active_block_triggers_reclaim() {
        let mut ftl = new_ftl();
        let slots = ftl.slots_per_block;
        // Repeatedly rewrite the same logical sector: each write invalidates
        // the previous record, so the active block fills with garbage and
        // must be reclaimed well before logical capacity is exhausted.
        for i in 0..slots * 2 {
            ftl.write_sector(0, &[i as u8; 64]).unwrap();
        }
        let mut out = [0u8; 64];
        ftl.read_sector(0, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == (slots * 2 - 1) as u8));
    }
}
