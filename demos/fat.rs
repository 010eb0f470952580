//! Formats a RAM-backed `FatFs`, writes a short file through the raw
//! cluster-chain API, then reads it back and prints the boot sector and
//! geometry `FatFs` derived from it.
//!
//! Run with --no-default-features (this needs `std` for `RamStorage`).

use embedfs::device::RamStorage;
use embedfs::fat::file::{File, SeekFrom};
use embedfs::fat::FatFs;

use typenum::consts::U512;

fn main() {
    let storage = RamStorage::<U512>::new(4096, 512);
    let mut fs = FatFs::format(storage, 1).unwrap();

    println!("fat type: {:?}", fs.fat_type());
    println!("geometry: {:?}", fs.geometry());
    println!("oem name: {:?}", core::str::from_utf8(&fs.boot_sector().oem_name));

    let mut file = File::open(0, 0);
    let written = file.write(&mut fs, b"hello from a freshly formatted volume\n").unwrap();
    println!("wrote {} bytes to cluster {:?}", written, file.first_cluster());

    file.seek(&mut fs, SeekFrom::Start(0)).unwrap();
    let mut buf = [0u8; 64];
    let n = file.read(&mut fs, &mut buf).unwrap();
    println!("read back: {:?}", core::str::from_utf8(&buf[..n]));
}
