//! Walks through the `Suite` surface over a RAM disk: register a driver,
//! format a volume, create a couple of files and a subdirectory, then list
//! the root via `opendir`/`readdir`.
//!
//! Run with --no-default-features (the suite needs `std`/`alloc`).

use embedfs::api::Suite;
use embedfs::config::SuiteConfig;
use embedfs::device::RamStorage;
use embedfs::storage::{DeviceConfig, StorageAsDriver};

use typenum::consts::U512;

fn main() {
    let mut suite = Suite::new(SuiteConfig::default()).unwrap();

    let driver = StorageAsDriver::new("ram", 512, true, || RamStorage::<U512>::new(2048, 512));
    let device_id = suite.register_driver(Box::new(driver)).unwrap();
    suite.device_open(device_id, DeviceConfig::default()).unwrap();

    let volume = suite.fmt(device_id, 0, 1).unwrap();

    suite.mkdir(volume, "/logs").unwrap();

    let f = suite.open(volume, "/logs/boot.txt", true, false, 0).unwrap();
    suite.write(f, b"first boot\n").unwrap();
    suite.close(f, 0).unwrap();

    let f = suite.open(volume, "/README", true, false, 0).unwrap();
    suite.write(f, b"hello from the ram disk\n").unwrap();
    suite.close(f, 0).unwrap();

    let dir = suite.opendir(volume, "/").unwrap();
    while let Some(entry) = suite.readdir(dir).unwrap() {
        println!("{:>8} {}  {}", entry.size, if entry.is_dir { "d" } else { "-" }, entry.name);
    }
    suite.closedir(dir).unwrap();
}
