//! Compile-time / init-time configuration (spec §6's configuration table).
//!
//! The fatfs crate expresses its configuration matrix as Cargo features
//! (`no_std`, `bindings`, `external_mutex`, ...); pool sizing, on the other
//! hand, is a per-deployment quantity in the original source (`fs_cfg_fs.h`
//! constants), so we follow `fat::file`'s `CS: ArrayLength<_>` sketch for the
//! type-level knobs (cache region capacities, bitmap lengths) and a plain
//! struct, built once by the host at init, for the rest.

use typenum::consts::{U16, U4096};
use typenum::marker_traits::Unsigned;

/// Type-level upper bound on the number of erase blocks a NAND/NOR FTL
/// tracks (bad-block bitmap length, per-block erase-count table). Like
/// `MaxSectorSize`, the live `block_count` (from `NandStaticGeometry` or a
/// NOR device's queried geometry) is a runtime quantity `<=` this bound.
pub type MaxFtlBlocks = U4096;

/// Largest sector size this crate's fixed-capacity scratch buffers support.
/// Runtime sector size (512/1024/2048/4096, §6) is always `<=` this.
pub type MaxSectorSize = U4096;

/// Default on-media GPT/FAT sector size, used as a minimum.
pub const MIN_SECTOR_SIZE: u32 = 512;
pub const MAX_SECTOR_SIZE: u32 = U4096::U32;

/// Legal sector sizes, per spec §4.6/§8.
pub const VALID_SECTOR_SIZES: [u32; 4] = [512, 1024, 2048, 4096];

pub fn is_valid_sector_size(size: u32) -> bool {
    VALID_SECTOR_SIZES.contains(&size)
}

/// NAND partitioning scheme (spec §6: "ONFI" auto-detected or "Static" fully
/// specified) -- a tagged union, per the design note on "union configuration
/// types".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NandPartitionType {
    /// Geometry auto-detected from the ONFI parameter page.
    Onfi,
    /// Geometry fully specified by `NandStaticGeometry`.
    Static(NandStaticGeometry),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NandStaticGeometry {
    pub page_size: u32,
    pub spare_size: u32,
    pub pages_per_block: u32,
    pub block_count: u32,
}

/// One (start, len) span of usable spare-area bytes, per spec §6 "NAND
/// free-spare map" / §4.4 `free_spare_map`. A NAND part typically reserves
/// some spare bytes for the manufacturer bad-block mark and ECC engine; the
/// remainder is carved up by this map for FTL metadata + our own ECC
/// codewords.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpareSpan {
    pub start: u16,
    pub len: u16,
}

/// Up to 16 spans is generous for any real NAND part's spare layout.
pub type MaxSpareSpans = U16;

#[derive(Debug, Clone, Copy)]
pub struct FreeSpareMap {
    spans: [SpareSpan; 16],
    count: usize,
}

impl FreeSpareMap {
    pub const fn new() -> Self {
        Self {
            spans: [SpareSpan { start: 0, len: 0 }; 16],
            count: 0,
        }
    }

    pub fn push(&mut self, span: SpareSpan) -> Result<(), crate::error::Error> {
        if self.count >= self.spans.len() {
            return Err(crate::error::ResourceError::Memory.into());
        }
        self.spans[self.count] = span;
        self.count += 1;
        Ok(())
    }

    pub fn spans(&self) -> &[SpareSpan] {
        &self.spans[..self.count]
    }

    pub fn total_bytes(&self) -> u32 {
        self.spans().iter().map(|s| s.len as u32).sum()
    }
}

impl Default for FreeSpareMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Pool sizes and feature toggles, built once by the host and handed to
/// `Suite::new` (see `volume.rs`). Mirrors the "Global mutable state...
/// maps to a suite-level state object initialized once" design note.
#[derive(Debug, Clone, Copy)]
pub struct SuiteConfig {
    pub max_devices: usize,
    pub max_volumes: usize,
    pub max_files: usize,
    pub max_dirs: usize,
    /// Must be `>= 2 * max_volumes` (one for a file op, one for a
    /// directory/FAT op, per volume, concurrently in flight).
    pub max_buffers: usize,

    pub read_only: bool,
    pub working_dir_support: bool,
    pub file_lock_support: bool,

    /// Wear-level headroom set aside (not used for live data) on NOR media,
    /// as a percentage of erase blocks.
    pub nor_reserved_pct: u8,
    /// Maximum spread tolerated between the least- and most-erased NOR
    /// blocks before wear leveling intervenes.
    pub nor_erase_count_diff_threshold: u32,

    pub nand_partition_type: NandPartitionType,
    /// Tolerated bad-block count before the NAND FTL refuses to mount.
    pub nand_max_bad_blk_cnt: u32,
}

impl SuiteConfig {
    pub const fn validate(&self) -> Result<(), crate::error::Error> {
        if self.max_devices == 0 || self.max_volumes == 0 {
            return Err(crate::error::Error::Device(crate::error::DeviceError::InvalidConfig));
        }
        if self.max_buffers < 2 * self.max_volumes {
            return Err(crate::error::Error::Device(crate::error::DeviceError::InvalidConfig));
        }
        Ok(())
    }
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            max_devices: 4,
            max_volumes: 4,
            max_files: 8,
            max_dirs: 4,
            max_buffers: 8,

            read_only: false,
            working_dir_support: true,
            file_lock_support: true,

            nor_reserved_pct: 10,
            nor_erase_count_diff_threshold: 10,

            nand_partition_type: NandPartitionType::Onfi,
            nand_max_bad_blk_cnt: 20,
        }
    }
}
