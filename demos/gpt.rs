//! Builds a minimal synthetic GPT header + single partition entry inside a
//! RAM disk's sectors, then parses them back with `Gpt::read_gpt` and
//! `Gpt::get_partition_entry` the way a caller would off a real disk.
//!
//! Run with --no-default-features (this needs `std` for `RamStorage`).

use embedfs::device::RamStorage;
use embedfs::gpt::Gpt;
use embedfs::storage::Storage;

use generic_array::GenericArray;
use typenum::consts::U512;

fn write_header(storage: &mut RamStorage<U512>) {
    let mut sector: GenericArray<u8, U512> = GenericArray::default();
    sector[0..8].copy_from_slice(b"EFI PART");
    sector[8..12].copy_from_slice(&1u32.to_le_bytes()); // revision
    sector[12..16].copy_from_slice(&92u32.to_le_bytes()); // header_size
    sector[24..32].copy_from_slice(&1u64.to_le_bytes()); // current_lba
    sector[32..40].copy_from_slice(&4095u64.to_le_bytes()); // backup_lba
    sector[40..48].copy_from_slice(&34u64.to_le_bytes()); // first_usable_lba
    sector[48..56].copy_from_slice(&4062u64.to_le_bytes()); // last_usable_lba
    sector[72..80].copy_from_slice(&2u64.to_le_bytes()); // partition entries at LBA 2
    sector[80..84].copy_from_slice(&1u32.to_le_bytes()); // one entry
    sector[84..88].copy_from_slice(&128u32.to_le_bytes()); // entry size
    storage.write_sector(1, &sector).unwrap();
}

fn write_partition_entry(storage: &mut RamStorage<U512>) {
    let mut sector: GenericArray<u8, U512> = GenericArray::default();
    sector[0..16].copy_from_slice(&embedfs::gpt::Guid::microsoft_basic_data().to_bytes());
    sector[32..40].copy_from_slice(&2048u64.to_le_bytes()); // first_lba
    sector[40..48].copy_from_slice(&4061u64.to_le_bytes()); // last_lba
    storage.write_sector(2, &sector).unwrap();
}

fn main() {
    let mut storage = RamStorage::<U512>::new(4096, 512);
    write_header(&mut storage);
    write_partition_entry(&mut storage);

    let gpt = Gpt::read_gpt(&mut storage).unwrap();
    println!("{:?}", gpt);

    let entry = gpt.get_partition_entry(&mut storage, 0).unwrap();
    println!("{:?}", entry);
    println!("first_lba={} last_lba={}", entry.first_lba(), entry.last_lba());
}
