//! Integration tests driving the public `Suite` surface end to end over a
//! RAM disk: format, mount, file/dir I/O, and a simulated card-eject to
//! exercise the removable-media staleness path.
//!
//! Requires `std` (run with --no-default-features).

use std::cell::Cell;
use std::rc::Rc;

use embedfs::api::Suite;
use embedfs::config::SuiteConfig;
use embedfs::device::RamStorage;
use embedfs::error::{DeviceError, Error};
use embedfs::storage::{DeviceConfig, DeviceInfo, DriverOps, IoctlArg, IoctlOp, StorageAsDriver};

use typenum::consts::U512;

fn make_suite() -> (Suite, embedfs::volume::VolumeId) {
    let mut suite = Suite::new(SuiteConfig::default()).unwrap();
    let driver = StorageAsDriver::new("ram", 512, true, || RamStorage::<U512>::new(4096, 512));
    let device_id = suite.register_driver(Box::new(driver)).unwrap();
    suite.device_open(device_id, DeviceConfig::default()).unwrap();
    let volume_id = suite.fmt(device_id, 0, 1).unwrap();
    (suite, volume_id)
}

#[test]
fn round_trips_many_files_across_a_nested_directory() {
    let (mut suite, vol) = make_suite();

    suite.mkdir(vol, "/a").unwrap();
    suite.mkdir(vol, "/a/b").unwrap();

    for i in 0..20 {
        let path = format!("/a/b/file{}.txt", i);
        let h = suite.open(vol, &path, true, false, 1).unwrap();
        suite.write(h, format!("contents {}", i).as_bytes()).unwrap();
        suite.close(h, 1).unwrap();
    }

    let dh = suite.opendir(vol, "/a/b").unwrap();
    let mut seen = 0;
    while suite.readdir(dh).unwrap().is_some() {
        seen += 1;
    }
    suite.closedir(dh).unwrap();
    assert_eq!(seen, 20);

    let h = suite.open(vol, "/a/b/file7.txt", false, true, 1).unwrap();
    let mut buf = [0u8; 32];
    let n = suite.read(h, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"contents 7");
    suite.close(h, 1).unwrap();
}

#[test]
fn mixed_case_name_round_trips_through_lfn() {
    let (mut suite, vol) = make_suite();

    let h = suite.open(vol, "/MixedCase.Txt", true, false, 1).unwrap();
    suite.write(h, b"lfn payload").unwrap();
    suite.close(h, 1).unwrap();

    let dh = suite.opendir(vol, "/").unwrap();
    let entry = suite.readdir(dh).unwrap().unwrap();
    suite.closedir(dh).unwrap();
    assert_eq!(entry.name, "MixedCase.Txt");

    let h = suite.open(vol, "/MixedCase.Txt", false, true, 1).unwrap();
    let mut buf = [0u8; 32];
    let n = suite.read(h, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"lfn payload");
    suite.close(h, 1).unwrap();
}

#[test]
fn truncate_shrinks_file_and_frees_tail_clusters() {
    let (mut suite, vol) = make_suite();

    let h = suite.open(vol, "/big.bin", true, false, 1).unwrap();
    let data = vec![0xAAu8; 8192];
    suite.write(h, &data).unwrap();
    suite.truncate(h, 10).unwrap();
    suite.close(h, 1).unwrap();

    let h = suite.open(vol, "/big.bin", false, true, 1).unwrap();
    let mut buf = [0u8; 32];
    let n = suite.read(h, &mut buf).unwrap();
    assert_eq!(n, 10);
    suite.close(h, 1).unwrap();
}

/// A driver whose `ioctl(Refresh)` fails once `present` is cleared, so tests
/// can simulate a card being pulled mid-session without touching the real
/// `device`/`volume` modules.
struct EjectableRam {
    present: Rc<Cell<bool>>,
    storage: RamStorage<U512>,
    opened: bool,
}

impl DriverOps for EjectableRam {
    fn name_get(&self) -> &str {
        "ejectable-ram"
    }

    fn init(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn open(&mut self, _cfg: DeviceConfig) -> Result<(), Error> {
        self.opened = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        self.opened = false;
        Ok(())
    }

    fn read(&mut self, dest: &mut [u8], start: u64, cnt: u32) -> Result<(), Error> {
        if !self.present.get() {
            return Err(DeviceError::NotPresent.into());
        }
        use embedfs::storage::Storage;
        for i in 0..cnt as u64 {
            let mut buf = generic_array::GenericArray::<u8, U512>::default();
            self.storage.read_sector(start + i, &mut buf).map_err(|_| Error::Device(DeviceError::Io))?;
            let off = (i as usize) * 512;
            dest[off..off + 512].copy_from_slice(buf.as_slice());
        }
        Ok(())
    }

    fn write(&mut self, src: &[u8], start: u64, cnt: u32) -> Result<(), Error> {
        if !self.present.get() {
            return Err(DeviceError::NotPresent.into());
        }
        use embedfs::storage::Storage;
        for i in 0..cnt as u64 {
            let mut buf = generic_array::GenericArray::<u8, U512>::default();
            let off = (i as usize) * 512;
            buf.as_mut_slice().copy_from_slice(&src[off..off + 512]);
            self.storage.write_sector(start + i, &buf).map_err(|_| Error::Device(DeviceError::Io))?;
        }
        Ok(())
    }

    fn query(&self) -> Result<DeviceInfo, Error> {
        use embedfs::storage::Storage;
        Ok(DeviceInfo { sector_size: 512, sector_count: self.storage.sector_count(), fixed: false })
    }

    fn ioctl(&mut self, op: IoctlOp, _arg: IoctlArg<'_>) -> Result<(), Error> {
        match op {
            IoctlOp::Refresh if self.present.get() => Ok(()),
            IoctlOp::Refresh => Err(DeviceError::NotPresent.into()),
            _ => Err(DeviceError::InvalidConfig.into()),
        }
    }
}

#[test]
fn removable_media_loss_is_observed_as_not_present() {
    let present = Rc::new(Cell::new(true));

    let mut suite = Suite::new(SuiteConfig::default()).unwrap();
    let driver = EjectableRam { present: present.clone(), storage: RamStorage::<U512>::new(4096, 512), opened: false };
    let device_id = suite.register_driver(Box::new(driver)).unwrap();
    suite.device_open(device_id, DeviceConfig::default()).unwrap();
    let vol = suite.fmt(device_id, 0, 1).unwrap();

    let mut sector = [0u8; 512];
    suite.rd(vol, 0, &mut sector).unwrap();

    present.set(false);
    assert!(suite.refresh(vol).is_err());
    assert!(suite.rd(vol, 0, &mut sector).is_err());

    present.set(true);
    suite.refresh(vol).unwrap();
    suite.rd(vol, 0, &mut sector).unwrap();
}
