//! The FAT Boot Sector / BIOS Parameter Block, generalized off the fatfs
//! crate's FAT32-only, 512B-only version to the full FAT12/16/32 range of
//! spec §4.6 (BPB field layout, FAT-type selection by cluster count).
//!
//! Field docs largely follow [this page](https://en.wikipedia.org/wiki/Design_of_the_FAT_file_system),
//! as the teacher's version did; FAT12/16 fields (`max_root_dir_entries`,
//! `total_logical_sectors`, `logical_sectors_per_fat`) that FAT32 zeroes out
//! are now read and used instead of being treated as always-zero.

use crate::config::{is_valid_sector_size, MaxSectorSize};
use crate::error::{Error, VolumeError};

use generic_array::GenericArray;

use core::convert::TryInto;

/// Which of the three on-disk FAT layouts a volume uses, selected by
/// cluster count at format time (spec §4.6: `<4085` FAT12, `<65525` FAT16,
/// else FAT32).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatType {
    Fat12,
    Fat16,
    Fat32,
}

impl FatType {
    pub fn from_cluster_count(cluster_count: u32) -> Self {
        if cluster_count < 4085 {
            FatType::Fat12
        } else if cluster_count < 65525 {
            FatType::Fat16
        } else {
            FatType::Fat32
        }
    }

    /// Bits occupied by one FAT table entry.
    pub fn entry_bits(self) -> u32 {
        match self {
            FatType::Fat12 => 12,
            FatType::Fat16 => 16,
            FatType::Fat32 => 32,
        }
    }

    /// The end-of-chain marker's minimum value (entries `>=` this are EOC).
    pub fn eoc_min(self) -> u32 {
        match self {
            FatType::Fat12 => 0x0FF8,
            FatType::Fat16 => 0xFFF8,
            FatType::Fat32 => 0x0FFF_FFF8,
        }
    }

    pub fn bad_cluster_marker(self) -> u32 {
        match self {
            FatType::Fat12 => 0x0FF7,
            FatType::Fat16 => 0xFFF7,
            FatType::Fat32 => 0x0FFF_FFF7,
        }
    }

    /// Mask applied to a raw entry value (FAT32 entries reserve their top 4
    /// bits).
    pub fn value_mask(self) -> u32 {
        match self {
            FatType::Fat12 => 0x0FFF,
            FatType::Fat16 => 0xFFFF,
            FatType::Fat32 => 0x0FFF_FFFF,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootSector {
    pub oem_name: [u8; 8],
    pub bpb: BiosParameterBlock,
}

impl BootSector {
    pub fn new(sector_size: u16, sectors_per_cluster: u8, starting_lba: u32, ending_lba: u32) -> Self {
        Self {
            oem_name: *b"r3-fatfs",
            bpb: BiosParameterBlock::new(sector_size, sectors_per_cluster, starting_lba, ending_lba),
        }
    }

    pub fn read(sector: &[u8]) -> Result<Self, Error> {
        if sector.len() < 512 || sector[510] != 0x55 || sector[511] != 0xAA {
            return Err(VolumeError::BadSuperblock.into());
        }
        Ok(Self {
            oem_name: sector[3..11].try_into().unwrap(),
            bpb: BiosParameterBlock::read(sector)?,
        })
    }

    pub fn write(&self, sector: &mut [u8]) {
        sector[3..11].copy_from_slice(&self.oem_name);
        self.bpb.write(sector);
        sector[510] = 0x55;
        sector[511] = 0xAA;
    }

    pub fn starting_fat_sector(&self) -> u32 {
        self.bpb.num_reserved_logical_sectors as u32 + self.bpb.hidden_preceeding_sectors
    }

    /// Total sectors on the volume, from whichever of the 16/32-bit fields
    /// is populated.
    pub fn total_sectors(&self) -> u32 {
        if self.bpb.total_logical_sectors != 0 {
            self.bpb.total_logical_sectors as u32
        } else {
            self.bpb.total_logical_sectors_extended
        }
    }

    /// Sectors occupied by one FAT table, from whichever of the 16/32-bit
    /// fields is populated.
    pub fn fat_size_sectors(&self) -> u32 {
        if self.bpb.logical_sectors_per_fat != 0 {
            self.bpb.logical_sectors_per_fat as u32
        } else {
            self.bpb.logical_sectors_per_fat_extended
        }
    }

    /// Sectors occupied by the fixed-region root directory (0 on FAT32,
    /// which roots into a cluster chain instead).
    pub fn root_dir_sectors(&self) -> u32 {
        let bytes = self.bpb.max_root_dir_entries as u32 * 32;
        let sector_size = self.bpb.bytes_per_logical_sector as u32;
        (bytes + sector_size - 1) / sector_size.max(1)
    }

    pub fn first_data_sector(&self) -> u32 {
        self.starting_fat_sector()
            + self.bpb.num_file_alloc_tables as u32 * self.fat_size_sectors()
            + self.root_dir_sectors()
    }

    pub fn cluster_count(&self) -> u32 {
        let data_sectors = self.total_sectors().saturating_sub(self.first_data_sector());
        data_sectors / self.bpb.logical_sectors_per_cluster.max(1) as u32
    }

    pub fn fat_type(&self) -> FatType {
        FatType::from_cluster_count(self.cluster_count())
    }

    /// BPB sanity checks (spec §4.6): sector size in the legal set, sectors
    /// per cluster a power of two, at least one FAT table, at least one
    /// reserved sector, and (FAT12/16 only) a nonzero, sector-aligned root
    /// directory entry count.
    pub fn validate(&self) -> Result<(), Error> {
        if !is_valid_sector_size(self.bpb.bytes_per_logical_sector as u32) {
            return Err(VolumeError::BadSuperblock.into());
        }
        let spc = self.bpb.logical_sectors_per_cluster;
        if spc == 0 || !spc.is_power_of_two() {
            return Err(VolumeError::BadSuperblock.into());
        }
        if self.bpb.num_file_alloc_tables == 0 {
            return Err(VolumeError::BadSuperblock.into());
        }
        if self.bpb.num_reserved_logical_sectors == 0 {
            return Err(VolumeError::BadSuperblock.into());
        }
        if self.total_sectors() == 0 {
            return Err(VolumeError::BadSuperblock.into());
        }
        match self.fat_type() {
            FatType::Fat12 | FatType::Fat16 => {
                if self.bpb.max_root_dir_entries == 0 {
                    return Err(VolumeError::BadSuperblock.into());
                }
                let sector_size = self.bpb.bytes_per_logical_sector;
                if (self.bpb.max_root_dir_entries as u32 * 32) % sector_size as u32 != 0 {
                    return Err(VolumeError::BadSuperblock.into());
                }
            }
            FatType::Fat32 => {
                if self.bpb.root_dir_cluster_num < 2 {
                    return Err(VolumeError::BadSuperblock.into());
                }
            }
        }
        Ok(())
    }
}

/// FAT32 Extended BIOS Parameter Block (covers the DOS 3.31 and DOS 2.0
/// BPBs it extends; FAT12/16 volumes populate the 16-bit `..._logical_*`
/// fields this struct carries alongside the 32-bit extended ones instead of
/// leaving them zero).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BiosParameterBlock {
    pub bytes_per_logical_sector: u16,
    pub logical_sectors_per_cluster: u8,
    pub num_reserved_logical_sectors: u16,
    pub num_file_alloc_tables: u8,
    pub max_root_dir_entries: u16,
    pub total_logical_sectors: u16,
    pub media_descriptor: u8,
    pub logical_sectors_per_fat: u16,

    pub phys_sectors_per_track: u16,
    pub num_heads: u16,
    pub hidden_preceeding_sectors: u32,
    pub total_logical_sectors_extended: u32,

    /// FAT32 only; 0 on FAT12/16 (the corresponding 16-bit field above is
    /// used instead).
    pub logical_sectors_per_fat_extended: u32,
    pub drive_desc_mirroring_flags: u16,
    pub version: u16,
    pub root_dir_cluster_num: u32,
    pub fs_info_logical_sector_num: u16,
    pub boot_sector_backup_logical_sector_start_num: u16,

    pub phys_drive_number: u8,
    pub volume_id: u32,
    pub volume_label: [u8; 11],
    pub file_system_type: [u8; 8],

    /// First cluster of the metadata journal's dedicated chain, allocated
    /// at format time (spec §4.8). Not part of the classic BPB layout;
    /// placed in the unused bytes between `file_system_type` and the
    /// 0x1FE boot signature.
    pub journal_start_cluster: u32,
}

impl BiosParameterBlock {
    pub fn new(sector_size: u16, sectors_per_cluster: u8, starting_lba: u32, ending_lba: u32) -> Self {
        let total_sectors = ending_lba - starting_lba;
        let cluster_count = total_sectors / sectors_per_cluster.max(1) as u32;
        let fat_type = FatType::from_cluster_count(cluster_count);

        let fat_entries_per_sector = match fat_type {
            FatType::Fat12 => sector_size as u32 * 8 / 12,
            FatType::Fat16 => sector_size as u32 / 2,
            FatType::Fat32 => sector_size as u32 / 4,
        };
        let fat_size_sectors = (cluster_count + fat_entries_per_sector - 1) / fat_entries_per_sector.max(1);

        let (total_16, total_32, fat_16, fat_32, root_entries, root_cluster) = match fat_type {
            FatType::Fat32 => (0u16, total_sectors, 0u16, fat_size_sectors, 0u16, 2u32),
            _ => {
                let total_16 = if total_sectors <= u16::MAX as u32 { total_sectors as u16 } else { 0 };
                let total_32 = if total_16 == 0 { total_sectors } else { 0 };
                (total_16, total_32, fat_size_sectors as u16, 0u32, 512u16, 0u32)
            }
        };

        Self {
            bytes_per_logical_sector: sector_size,
            logical_sectors_per_cluster: sectors_per_cluster,
            num_reserved_logical_sectors: if matches!(fat_type, FatType::Fat32) { 32 } else { 1 },
            num_file_alloc_tables: 2,
            max_root_dir_entries: root_entries,
            total_logical_sectors: total_16,
            media_descriptor: 0xF8,
            logical_sectors_per_fat: fat_16,

            phys_sectors_per_track: 0x0010,
            num_heads: 0x0004,
            hidden_preceeding_sectors: starting_lba,
            total_logical_sectors_extended: total_32,

            logical_sectors_per_fat_extended: fat_32,
            drive_desc_mirroring_flags: 0,
            version: 0,
            root_dir_cluster_num: root_cluster,
            fs_info_logical_sector_num: if matches!(fat_type, FatType::Fat32) { 1 } else { 0 },
            boot_sector_backup_logical_sector_start_num: 0,

            phys_drive_number: 0x80,
            volume_id: 0,
            volume_label: *b"NO NAME    ",
            file_system_type: match fat_type {
                FatType::Fat12 => *b"FAT12   ",
                FatType::Fat16 => *b"FAT16   ",
                FatType::Fat32 => *b"FAT32   ",
            },
            // Filled in by `FatFs::format` once the journal chain is
            // allocated; not yet known when the BPB is first built.
            journal_start_cluster: 0,
        }
    }

    pub fn read(sector: &[u8]) -> Result<Self, Error> {
        if sector.len() < 94 {
            return Err(VolumeError::BadSuperblock.into());
        }

        macro_rules! e {
            ($ty:tt, $offset:literal) => {
                $ty::from_le_bytes(sector[$offset..($offset + core::mem::size_of::<$ty>())].try_into().unwrap())
            };
        }

        Ok(Self {
            bytes_per_logical_sector: e!(u16, 0x00B),
            logical_sectors_per_cluster: e!(u8, 0x00D),
            num_reserved_logical_sectors: e!(u16, 0x00E),
            num_file_alloc_tables: e!(u8, 0x010),
            max_root_dir_entries: e!(u16, 0x011),
            total_logical_sectors: e!(u16, 0x013),
            media_descriptor: e!(u8, 0x015),
            logical_sectors_per_fat: e!(u16, 0x016),

            phys_sectors_per_track: e!(u16, 0x018),
            num_heads: e!(u16, 0x01A),
            hidden_preceeding_sectors: e!(u32, 0x01C),
            total_logical_sectors_extended: e!(u32, 0x020),
            logical_sectors_per_fat_extended: e!(u32, 0x024),
            drive_desc_mirroring_flags: e!(u16, 0x028),
            version: e!(u16, 0x02A),
            root_dir_cluster_num: e!(u32, 0x02C),
            fs_info_logical_sector_num: e!(u16, 0x030),
            boot_sector_backup_logical_sector_start_num: e!(u16, 0x032),
            phys_drive_number: e!(u8, 0x040),
            volume_id: e!(u32, 0x043),
            volume_label: sector[0x047..0x052].try_into().unwrap(),
            file_system_type: sector[0x052..0x05A].try_into().unwrap(),
            journal_start_cluster: e!(u32, 0x05A),
        })
    }

    pub fn write(&self, sector: &mut [u8]) {
        macro_rules! w {
            ($val:expr, $offset:literal) => {
                sector[$offset..($offset + $val.to_le_bytes().len())].copy_from_slice(&$val.to_le_bytes())
            };
        }

        w!(self.bytes_per_logical_sector, 0x00B);
        sector[0x00D] = self.logical_sectors_per_cluster;
        w!(self.num_reserved_logical_sectors, 0x00E);
        sector[0x010] = self.num_file_alloc_tables;
        w!(self.max_root_dir_entries, 0x011);
        w!(self.total_logical_sectors, 0x013);
        sector[0x015] = self.media_descriptor;
        w!(self.logical_sectors_per_fat, 0x016);

        w!(self.phys_sectors_per_track, 0x018);
        w!(self.num_heads, 0x01A);
        w!(self.hidden_preceeding_sectors, 0x01C);
        w!(self.total_logical_sectors_extended, 0x020);
        w!(self.logical_sectors_per_fat_extended, 0x024);
        w!(self.drive_desc_mirroring_flags, 0x028);
        w!(self.version, 0x02A);
        w!(self.root_dir_cluster_num, 0x02C);
        w!(self.fs_info_logical_sector_num, 0x030);
        w!(self.boot_sector_backup_logical_sector_start_num, 0x032);
        sector[0x040] = self.phys_drive_number;
        w!(self.volume_id, 0x043);
        sector[0x047..0x052].copy_from_slice(&self.volume_label);
        sector[0x052..0x05A].copy_from_slice(&self.file_system_type);
        w!(self.journal_start_cluster, 0x05A);
    }
}

/// Scratch alias used by callers that want a zeroed, max-size sector buffer
/// to format/read a boot sector through before the live sector size is
/// known.
pub type BootSectorBuf = GenericArray<u8, MaxSectorSize>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fat_type_thresholds() {
        assert_eq!(FatType::from_cluster_count(100), FatType::Fat12);
        assert_eq!(FatType::from_cluster_count(5000), FatType::Fat16);
        assert_eq!(FatType::from_cluster_count(70000), FatType::Fat32);
    }

    #[test]
    fn round_trips_through_bytes() {
        let bs = BootSector::new(512, 8, 0, 200_000);
        let mut buf = [0u8; 512];
        bs.write(&mut buf);
        let parsed = BootSector::read(&buf).unwrap();
        assert_eq!(parsed.bpb.bytes_per_logical_sector, 512);
        assert_eq!(parsed.bpb.logical_sectors_per_cluster, 8);
        parsed.validate().unwrap();
    }
}
