//! NAND flash translation layer (spec §8 "NAND FTL").
//!
//! A logical block is backed by an optional *data* block plus an optional
//! *update* block that absorbs new page writes; a read checks the update
//! block first, falling back to the data block, and a write always lands
//! in the update block. Once the update block has no room left for
//! another page, `fold` merges data+update into a freshly erased block and
//! the logical block goes back to having just a data block.
//!
//! Wear leveling picks the free physical block with the lowest erase
//! count whenever this FTL needs one (for a new update block or a fold
//! target); bad-block retirement goes through `bbm::BadBlockMap`, which
//! enforces the configured `nand_max_bad_blk_cnt` tolerance.
//!
//! Sized the way `cache::SectorCache`'s regions are: a `GenericArray`
//! bounded by a type-level block-count ceiling (`config::MaxFtlBlocks`)
//! rather than a heap-allocated `Vec`, so this works with no allocator.

pub mod bbm;
pub mod block;
pub mod ecc;

use crate::config::{MaxFtlBlocks, NandStaticGeometry};
use crate::error::{DeviceError, Error, VolumeError};
use crate::storage::Storage;

use bbm::BadBlockMap;
use block::{LogicalBlock, PhysBlock};
use ecc::{EccAlgorithm, HammingEcc};

use generic_array::{ArrayLength, GenericArray};

/// A `NandFtl` sized for up to `config::MaxFtlBlocks` physical blocks —
/// the common case; callers with a smaller, tighter bound can name
/// `NandFtl<S, N>` directly instead.
pub type DefaultNandFtl<S> = NandFtl<S, MaxFtlBlocks>;

pub struct NandFtl<S: Storage, N: ArrayLength<LogicalBlock> + ArrayLength<u32>> {
    storage: S,
    ecc: HammingEcc,
    page_size: u32,
    pages_per_block: u32,
    block_count: u32,
    logical_block_count: u32,
    bad_blocks: BadBlockMap,
    blocks: GenericArray<LogicalBlock, N>,
    erase_counts: GenericArray<u32, N>,
}

impl<S: Storage, N: ArrayLength<LogicalBlock> + ArrayLength<u32>> NandFtl<S, N> {
    /// Builds a fresh (unformatted) FTL over `storage`. A fraction of the
    /// physical blocks are held back as spares for update/fold blocks and
    /// bad-block replacements and are never handed out as logical blocks.
    pub fn new(storage: S, geometry: NandStaticGeometry, max_bad_blk_cnt: u32) -> Result<Self, Error> {
        if geometry.block_count == 0 || geometry.pages_per_block == 0 {
            return Err(DeviceError::InvalidConfig.into());
        }

        let mut ecc = HammingEcc::new();
        ecc.setup(geometry.page_size)?;

        let spare_blocks = core::cmp::max(2, geometry.block_count / 16);
        if spare_blocks >= geometry.block_count {
            return Err(DeviceError::InvalidConfig.into());
        }
        let logical_block_count = geometry.block_count - spare_blocks;

        Ok(Self {
            storage,
            ecc,
            page_size: geometry.page_size,
            pages_per_block: geometry.pages_per_block,
            block_count: geometry.block_count,
            logical_block_count,
            bad_blocks: BadBlockMap::new(geometry.block_count, max_bad_blk_cnt),
            blocks: GenericArray::generate(|_| LogicalBlock::empty()),
            erase_counts: GenericArray::default(),
        })
    }

    pub fn logical_block_count(&self) -> u32 {
        self.logical_block_count
    }

    pub fn pages_per_block(&self) -> u32 {
        self.pages_per_block
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn bad_block_count(&self) -> u32 {
        self.bad_blocks.bad_count()
    }

    pub fn into_storage(self) -> S {
        self.storage
    }

    fn check_logical(&self, logical_block: u32) -> Result<(), Error> {
        if logical_block >= self.logical_block_count {
            return Err(VolumeError::EntryCorrupt.into());
        }
        Ok(())
    }

    fn phys_sector(&self, phys: PhysBlock, page: u32) -> u64 {
        phys as u64 * self.pages_per_block as u64 + page as u64
    }

    /// Reads `page` of `logical_block`. Returns a zero-filled buffer for a
    /// page that was never written (no data or update block assigned).
    pub fn read_page(
        &mut self,
        logical_block: u32,
        page: u32,
        buf: &mut GenericArray<u8, S::SECTOR_SIZE>,
    ) -> Result<(), Error> {
        self.check_logical(logical_block)?;

        match self.blocks[logical_block as usize].read_source(page) {
            Some((phys, _)) => {
                let sector = self.phys_sector(phys, page);
                self.storage.read_sector(sector, buf).map_err(crate::error::device_err)
            }
            None => {
                for b in buf.iter_mut() {
                    *b = 0;
                }
                Ok(())
            }
        }
    }

    /// Writes `page` of `logical_block` into its update block, assigning
    /// one and/or folding the block first if needed.
    pub fn write_page(
        &mut self,
        logical_block: u32,
        page: u32,
        buf: &GenericArray<u8, S::SECTOR_SIZE>,
    ) -> Result<(), Error> {
        self.check_logical(logical_block)?;

        if self.blocks[logical_block as usize].is_update_full(self.pages_per_block) {
            self.fold(logical_block)?;
        }
        if self.blocks[logical_block as usize].needs_update_block() {
            let phys = self.alloc_free_block()?;
            self.blocks[logical_block as usize].update_block = Some(phys);
        }

        let phys = self.blocks[logical_block as usize]
            .update_block
            .expect("update block assigned above");
        let sector = self.phys_sector(phys, page);

        match self.storage.write_sector(sector, buf) {
            Ok(()) => {
                self.blocks[logical_block as usize].mark_update_page(page);
                Ok(())
            }
            Err(_) => {
                log::warn!("nand: program failure on physical block {}, retiring", phys);
                self.bad_blocks.mark_bad(phys)?;
                self.blocks[logical_block as usize].update_block = None;
                self.write_page(logical_block, page, buf)
            }
        }
    }

    /// Merges `logical_block`'s data and update blocks into a freshly
    /// allocated block, page by page, then retires both source blocks
    /// back to the free pool (erased, with their erase count bumped).
    fn fold(&mut self, logical_block: u32) -> Result<(), Error> {
        let old = self.blocks[logical_block as usize];
        let new_phys = self.alloc_free_block()?;

        let mut buf: GenericArray<u8, S::SECTOR_SIZE> = GenericArray::default();
        for page in 0..self.pages_per_block {
            match old.read_source(page) {
                Some((phys, _)) => {
                    let src = self.phys_sector(phys, page);
                    self.storage.read_sector(src, &mut buf).map_err(crate::error::device_err)?;
                }
                None => {
                    for b in buf.iter_mut() {
                        *b = 0xFF;
                    }
                }
            }
            let dst = self.phys_sector(new_phys, page);
            self.storage.write_sector(dst, &buf).map_err(crate::error::device_err)?;
        }

        if let Some(old_data) = old.data_block {
            self.erase_block(old_data)?;
        }
        if let Some(old_update) = old.update_block {
            self.erase_block(old_update)?;
        }

        self.blocks[logical_block as usize].adopt_folded(new_phys);
        Ok(())
    }

    fn erase_block(&mut self, phys: PhysBlock) -> Result<(), Error> {
        for page in 0..self.pages_per_block {
            let sector = self.phys_sector(phys, page);
            self.storage.erase_sector(sector).map_err(crate::error::device_err)?;
        }
        self.erase_counts[phys as usize] = self.erase_counts[phys as usize].wrapping_add(1);
        Ok(())
    }

    /// Picks the lowest-erase-count physical block that is neither bad nor
    /// already assigned to any logical block (wear leveling).
    fn alloc_free_block(&mut self) -> Result<PhysBlock, Error> {
        let mut best: Option<(u32, u32)> = None;

        'outer: for b in 0..self.block_count {
            if self.bad_blocks.is_bad(b) {
                continue;
            }
            for lb in self.blocks.iter() {
                if lb.data_block == Some(b) || lb.update_block == Some(b) {
                    continue 'outer;
                }
            }
            let ec = self.erase_counts[b as usize];
            if best.map_or(true, |(_, best_ec)| ec < best_ec) {
                best = Some((b, ec));
            }
        }

        best.map(|(b, _)| b).ok_or_else(|| VolumeError::DeviceFull.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RamStorage;
    use typenum::consts::{U512, U64};

    fn geometry() -> NandStaticGeometry {
        NandStaticGeometry {
            page_size: 512,
            spare_size: 16,
            pages_per_block: 4,
            block_count: 32,
        }
    }

    fn new_ftl() -> NandFtl<RamStorage<U512>, U64> {
        let geo = geometry();
        let storage = RamStorage::<U512>::new((geo.block_count * geo.pages_per_block) as usize, 512);
        NandFtl::new(storage, geo, 4).unwrap()
    }

    #[test]
    fn unwritten_page_reads_zero() {
        let mut ftl = new_ftl();
        let mut buf = GenericArray::<u8, U512>::default();
        buf[0] = 0xAA;
        ftl.read_page(0, 0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut ftl = new_ftl();
        let mut buf = GenericArray::<u8, U512>::default();
        buf[0] = 0x42;
        ftl.write_page(2, 1, &buf).unwrap();

        let mut out = GenericArray::<u8, U512>::default();
        ftl.read_page(2, 1, &mut out).unwrap();
        assert_eq!(out[0], 0x42);
    }

    #[test]
    fn filling_update_block_triggers_fold() {
        let mut ftl = new_ftl();
        let pages_per_block = ftl.pages_per_block();
        let mut buf = GenericArray::<u8, U512>::default();

        for page in 0..pages_per_block {
            buf[0] = page as u8;
            ftl.write_page(5, page, &buf).unwrap();
        }
        // One more write past a full update block must fold first.
        buf[0] = 0xFF;
        ftl.write_page(5, 0, &buf).unwrap();

        for page in 1..pages_per_block {
            let mut out = GenericArray::<u8, U512>::default();
            ftl.read_page(5, page, &mut out).unwrap();
            assert_eq!(out[0], page as u8);
        }
        let mut out = GenericArray::<u8, U512>::default();
        ftl.read_page(5, 0, &mut out).unwrap();
        assert_eq!(out[0], 0xFF);
    }

    #[test]
    fn out_of_range_logical_block_errors() {
        let mut ftl = new_ftl();
        let buf = GenericArray::<u8, U512>::default();
        assert!(ftl.write_page(ftl.logical_block_count() + 100, 0, &buf).is_err());
    }
}
