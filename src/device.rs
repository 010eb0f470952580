//! Device registry and lifecycle (spec §3 "Device", §4.2, §9 "Global
//! mutable state... maps to a suite-level state object").
//!
//! Drivers are registered into a fixed-capacity, suite-wide table at init,
//! identified by name (`"nor"`, `"nand"`, `"ram"`, `"sdcard"`, `"sd"`,
//! `"ide"`, `"msc"`). `Device` wraps one `dyn DriverOps` with the
//! open/closed/present bookkeeping spec §3 describes; `DeviceId` is the
//! stable arena index volumes hold instead of a raw pointer/reference back
//! into this table (design note §9's "cyclic driver/volume references").
//!
//! The registry itself needs heap allocation for its `dyn DriverOps` table
//! and is therefore only built when `no_std` is disabled (std test/demo
//! builds); genuinely allocation-free, no_std deployments wire concrete
//! `Storage` + `fat::FatFs<S>` generics directly instead of going through
//! dynamic dispatch (recorded in DESIGN.md).

use crate::error::{DeviceError, Error, StateError};
use crate::storage::{DeviceConfig, DeviceInfo, DriverOps, IoctlArg, IoctlOp};

/// Stable handle to a slot in a `DriverRegistry`. Cheap to copy and to hand
/// out to volumes; the registry itself is looked up under the suite lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceState {
    Closed,
    Open,
    Present,
}

crate::using_std! {

use std::boxed::Box;
use std::vec::Vec;

/// One named medium (spec §3 "Device"). Owns the driver trait object and
/// tracks open/closed/present state; `fixed` devices (RAM, NOR, NAND) never
/// transition to absent, removable ones (SD, USB MSC) do.
pub struct Device {
    driver: Box<dyn DriverOps>,
    state: DeviceState,
    info: Option<DeviceInfo>,
    refresh_cnt: u32,
}

impl Device {
    fn new(driver: Box<dyn DriverOps>) -> Self {
        Self { driver, state: DeviceState::Closed, info: None, refresh_cnt: 0 }
    }

    pub fn name(&self) -> &str {
        self.driver.name_get()
    }

    pub fn is_present(&self) -> bool {
        matches!(self.state, DeviceState::Present)
    }

    pub fn refresh_cnt(&self) -> u32 {
        self.refresh_cnt
    }

    pub fn open(&mut self, cfg: DeviceConfig) -> Result<(), Error> {
        if self.state != DeviceState::Closed {
            return Err(StateError::AlreadyOpen.into());
        }
        self.driver.init()?;
        self.driver.open(cfg)?;
        let info = self.driver.query()?;
        self.info = Some(info);
        self.state = DeviceState::Present;
        log::debug!("device {} opened ({} sectors x {}B)", self.name(), info.sector_count, info.sector_size);
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), Error> {
        if self.state == DeviceState::Closed {
            return Err(StateError::NotOpen.into());
        }
        self.driver.close()?;
        self.state = DeviceState::Closed;
        self.info = None;
        Ok(())
    }

    /// Re-probes a removable device after a media-change event. Volumes
    /// bound to this device must themselves transition back to `Open` and
    /// call this before any further I/O (spec §4.5).
    pub fn refresh(&mut self) -> Result<(), Error> {
        match self.driver.ioctl(IoctlOp::Refresh, IoctlArg::None) {
            Ok(()) => {
                self.info = Some(self.driver.query()?);
                self.state = DeviceState::Present;
                self.refresh_cnt = self.refresh_cnt.wrapping_add(1);
                Ok(())
            }
            Err(e) => {
                self.state = DeviceState::Open;
                log::warn!("device {} refresh failed: {}", self.name(), e);
                Err(e)
            }
        }
    }

    pub fn info(&self) -> Result<DeviceInfo, Error> {
        self.info.ok_or(Error::State(StateError::NotOpen))
    }

    /// Whole-sector read, tolerating removable-media absence by marking the
    /// device `Open` (not `Present`) and surfacing `DeviceError::NotPresent`
    /// (spec §4.2/§4.5).
    pub fn read(&mut self, dest: &mut [u8], start: u64, cnt: u32) -> Result<(), Error> {
        self.require_present()?;
        let r = self.driver.read(dest, start, cnt);
        if r.is_err() {
            self.state = DeviceState::Open;
        }
        r
    }

    pub fn write(&mut self, src: &[u8], start: u64, cnt: u32) -> Result<(), Error> {
        self.require_present()?;
        let r = self.driver.write(src, start, cnt);
        if r.is_err() {
            self.state = DeviceState::Open;
        }
        r
    }

    pub fn ioctl(&mut self, op: IoctlOp, arg: IoctlArg<'_>) -> Result<(), Error> {
        self.require_present()?;
        self.driver.ioctl(op, arg)
    }

    fn require_present(&self) -> Result<(), Error> {
        if self.state != DeviceState::Present {
            return Err(DeviceError::NotPresent.into());
        }
        Ok(())
    }
}

/// Fixed-capacity, suite-wide driver/device table (spec §9's "registry that
/// owns both devices and volumes by stable identifier").
pub struct DriverRegistry {
    devices: Vec<Device>,
    capacity: usize,
}

impl DriverRegistry {
    pub fn new(capacity: usize) -> Self {
        Self { devices: Vec::with_capacity(capacity), capacity }
    }

    /// Registers a driver, returning the stable id a volume can later bind
    /// to. Does not open the device; `open` is a separate, explicit step
    /// (spec §3 "Device" lifecycle).
    pub fn register(&mut self, driver: Box<dyn DriverOps>) -> Result<DeviceId, Error> {
        if self.devices.len() >= self.capacity {
            return Err(crate::error::ResourceError::Memory.into());
        }
        let id = DeviceId(self.devices.len());
        self.devices.push(Device::new(driver));
        Ok(id)
    }

    pub fn get(&self, id: DeviceId) -> Option<&Device> {
        self.devices.get(id.0)
    }

    pub fn get_mut(&mut self, id: DeviceId) -> Option<&mut Device> {
        self.devices.get_mut(id.0)
    }

    pub fn find_by_name(&self, name: &str) -> Option<DeviceId> {
        self.devices.iter().position(|d| d.name() == name).map(DeviceId)
    }
}

} // using_std!

crate::using_std! {
    use crate::storage::Storage;
    use generic_array::{ArrayLength, GenericArray};
    use std::vec::Vec;
    use std::vec;

    /// A heap-backed RAM disk (spec §6 driver name `"ram"`); used by tests
    /// and `demos/` in place of a real BSP. Fixed (non-removable).
    pub struct RamStorage<N: ArrayLength<u8>> {
        sectors: Vec<u8>,
        sector_size: usize,
        _n: core::marker::PhantomData<N>,
    }

    impl<N: ArrayLength<u8>> RamStorage<N> {
        pub fn new(sector_count: usize, sector_size: usize) -> Self {
            Self {
                sectors: vec![0u8; sector_count * sector_size],
                sector_size,
                _n: core::marker::PhantomData,
            }
        }
    }

    impl<N: ArrayLength<u8>> Storage for RamStorage<N> {
        type SECTOR_SIZE = N;
        type ReadErr = ();
        type WriteErr = ();
        type EraseErr = ();

        fn read_sector(&mut self, sector_idx: u64, buffer: &mut GenericArray<u8, N>) -> Result<(), ()> {
            let off = sector_idx as usize * self.sector_size;
            if off + self.sector_size > self.sectors.len() {
                return Err(());
            }
            buffer.as_mut_slice()[..self.sector_size].copy_from_slice(&self.sectors[off..off + self.sector_size]);
            Ok(())
        }

        fn write_sector(&mut self, sector_idx: u64, buffer: &GenericArray<u8, N>) -> Result<(), ()> {
            let off = sector_idx as usize * self.sector_size;
            if off + self.sector_size > self.sectors.len() {
                return Err(());
            }
            self.sectors[off..off + self.sector_size].copy_from_slice(&buffer.as_slice()[..self.sector_size]);
            Ok(())
        }

        fn sector_count(&self) -> u64 {
            (self.sectors.len() / self.sector_size) as u64
        }

        fn erase_sector(&mut self, sector_idx: u64) -> Result<(), ()> {
            let off = sector_idx as usize * self.sector_size;
            if off + self.sector_size > self.sectors.len() {
                return Err(());
            }
            self.sectors[off..off + self.sector_size].fill(0xFF);
            Ok(())
        }
    }
}
