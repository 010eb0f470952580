//! Bad-block bitmap and `max_bad_blk_cnt` tolerance (spec §6/§8).
//!
//! Grounded on `util::BitMap` (the "capacity set" fixed-capacity pattern
//! already used by `cache::SectorCache`); `block_count` is a runtime
//! quantity bounded by the type-level `config::MaxFtlBlocks`, the same way
//! `config::MaxSectorSize` bounds the runtime sector size.

use crate::config::MaxFtlBlocks;
use crate::error::{Error, VolumeError};
use crate::util::BitMap;

/// Tracks blocks that are unusable, whether marked bad at the factory or
/// retired at runtime after a program/erase failure or an uncorrectable
/// ECC error this FTL could not recover from.
#[derive(Debug, Clone)]
pub struct BadBlockMap {
    bits: BitMap<MaxFtlBlocks>,
    block_count: u32,
    max_bad: u32,
    bad_count: u32,
}

impl BadBlockMap {
    pub fn new(block_count: u32, max_bad: u32) -> Self {
        Self {
            bits: BitMap::new(),
            block_count,
            max_bad,
            bad_count: 0,
        }
    }

    pub fn is_bad(&self, block: u32) -> bool {
        if block >= self.block_count {
            return true;
        }
        self.bits.get(block as usize).unwrap_or(true)
    }

    pub fn bad_count(&self) -> u32 {
        self.bad_count
    }

    pub fn over_tolerance(&self) -> bool {
        self.bad_count > self.max_bad
    }

    /// Retires `block`. Returns `Err(VolumeError::DeviceFull)` once the
    /// bad-block count exceeds the configured tolerance (spec §6
    /// `nand_max_bad_blk_cnt`) — the caller should treat the medium as out
    /// of spares at that point, not merely this one block as gone.
    pub fn mark_bad(&mut self, block: u32) -> Result<(), Error> {
        if block >= self.block_count {
            return Err(VolumeError::EntryCorrupt.into());
        }
        let was_bad = self
            .bits
            .set(block as usize, true)
            .map_err(|_| Error::from(VolumeError::EntryCorrupt))?;
        if !was_bad {
            self.bad_count += 1;
        }
        if self.over_tolerance() {
            return Err(VolumeError::DeviceFull.into());
        }
        Ok(())
    }

    /// Next good block at or after `start`, wrapping once around the
    /// whole range. `None` if every block is bad.
    pub fn next_good(&self, start: u32) -> Option<u32> {
        if self.block_count == 0 {
            return None;
        }
        (0..self.block_count)
            .map(|i| (start + i) % self.block_count)
            .find(|&b| !self.is_bad(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_map_has_no_bad_blocks() {
        let map = BadBlockMap::new(16, 4);
        for b in 0..16 {
            assert!(!map.is_bad(b));
        }
        assert_eq!(map.bad_count(), 0);
    }

    #[test]
    fn marking_bad_is_idempotent() {
        let mut map = BadBlockMap::new(16, 4);
        map.mark_bad(3).unwrap();
        map.mark_bad(3).unwrap();
        assert_eq!(map.bad_count(), 1);
        assert!(map.is_bad(3));
    }

    #[test]
    fn exceeding_tolerance_surfaces_device_full() {
        let mut map = BadBlockMap::new(16, 2);
        map.mark_bad(0).unwrap();
        map.mark_bad(1).unwrap();
        let err = map.mark_bad(2).unwrap_err();
        assert_eq!(err, Error::Volume(VolumeError::DeviceFull));
    }

    #[test]
    fn next_good_skips_bad_blocks_and_wraps() {
        let mut map = BadBlockMap::new(4, 4);
        map.mark_bad(1).unwrap();
        map.mark_bad(2).unwrap();
        assert_eq!(map.next_good(1), Some(3));
        map.mark_bad(3).unwrap();
        map.mark_bad(0).unwrap();
        assert_eq!(map.next_good(1), None);
    }
}
