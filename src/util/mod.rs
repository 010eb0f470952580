//! Small bit-level helpers shared by the cache, FAT core, and the NAND/NOR
//! FTLs (bad-block and free-block bitmaps).

pub mod bitmap;
pub mod bits;

pub use bitmap::{BitMap, BitMapLen};
pub use bits::Bits;
