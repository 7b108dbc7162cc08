//! Shared Control Region.
//!
//! One memory segment created by the server at startup and mapped by every
//! client. It holds the device table, the flat input array and the layer
//! ring.
//!
//! Ownership rules:
//! - The device table is written once by [`ShmRegion::publish_devices`]
//!   before the region is handed to anyone, and is read-only afterwards.
//! - A device's input sub-range has a single writer (the server's input
//!   update path). Readers copy record by record and may see a mix of old and
//!   new records, never a torn record.
//! - Each ring slot carries a sequence counter that is odd while a client is
//!   writing it. Readers retry until they observe the same even value before
//!   and after copying.

use std::cell::UnsafeCell;
use std::ffi::CString;
use std::fs::File;
use std::io;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::ptr::{self, NonNull};
use std::sync::atomic::{fence, AtomicU32, Ordering};

use bytemuck::{Pod, Zeroable};
use thiserror::Error;

use crate::types::LayerSlot;

/// "HLO1"
pub const SHM_MAGIC: u32 = 0x484c_4f31;
pub const SHM_VERSION: u32 = 1;

pub const MAX_DEVICES: usize = 8;
pub const MAX_INPUTS: usize = 256;
pub const DEVICE_NAME_LEN: usize = 32;

/// Number of slots in the layer ring
pub const N_SLOTS: usize = 3;

/// How many times a slot read is retried while a writer holds it
const SLOT_READ_RETRIES: usize = 1024;

#[derive(Debug, Error)]
pub enum ShmError {
    #[error("shared memory I/O: {0}")]
    Io(#[from] io::Error),

    #[error("region is {got} bytes, expected at least {expected}")]
    TooSmall { expected: usize, got: usize },

    #[error("bad magic {0:#x}")]
    BadMagic(u32),

    #[error("layout version {0} not supported")]
    VersionMismatch(u32),

    #[error("too many devices: {0}")]
    TooManyDevices(usize),

    #[error("too many inputs: {0}")]
    TooManyInputs(usize),

    #[error("no device {0}")]
    InvalidDevice(u32),

    #[error("device {device} owns {expected} inputs, got {got}")]
    InputCountMismatch {
        device: u32,
        expected: usize,
        got: usize,
    },

    #[error("slot {0} is outside the layer ring")]
    InvalidSlot(u32),

    #[error("slot {0} stayed busy while reading")]
    SlotBusy(u32),
}

/// Device descriptor in the shared device table.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct SharedDevice {
    pub name: [u8; DEVICE_NAME_LEN],
    pub kind: u32,
    pub first_input_index: u32,
    pub num_inputs: u32,
    _pad: u32,
}

impl SharedDevice {
    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(DEVICE_NAME_LEN);
        std::str::from_utf8(&self.name[..len]).unwrap_or("")
    }
}

/// One input value.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct InputRecord {
    pub timestamp_ns: u64,
    pub name: u32,
    pub active: u32,
    pub value: [f32; 4],
}

/// What the server knows about a device when it builds the device table.
#[derive(Debug, Clone)]
pub struct DeviceLayout {
    pub name: String,
    pub kind: u32,
    pub num_inputs: u32,
}

#[repr(C)]
struct RingSlot {
    seq: AtomicU32,
    _pad: u32,
    data: UnsafeCell<LayerSlot>,
}

#[repr(C)]
struct SharedLayout {
    magic: u32,
    version: u32,
    num_devices: u32,
    num_inputs: u32,
    devices: [SharedDevice; MAX_DEVICES],
    inputs: [InputRecord; MAX_INPUTS],
    slots: [RingSlot; N_SLOTS],
}

/// A mapping of the Shared Control Region.
pub struct ShmRegion {
    ptr: NonNull<SharedLayout>,
    fd: OwnedFd,
}

// Safety: all access to the mapping goes through volatile copies or atomics.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    /// Size of the region in bytes
    pub const SIZE: usize = mem::size_of::<SharedLayout>();

    /// Create a fresh, zeroed region backed by an anonymous memfd.
    pub fn create(name: &str) -> Result<Self, ShmError> {
        let c_name = CString::new(name)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid name"))?;

        let raw = unsafe { libc::memfd_create(c_name.as_ptr(), libc::MFD_CLOEXEC) };
        if raw < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        if unsafe { libc::ftruncate(fd.as_raw_fd(), Self::SIZE as libc::off_t) } < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let region = Self::map(fd)?;
        unsafe {
            let layout = region.ptr.as_ptr();
            ptr::write_volatile(ptr::addr_of_mut!((*layout).magic), SHM_MAGIC);
            ptr::write_volatile(ptr::addr_of_mut!((*layout).version), SHM_VERSION);
        }
        Ok(region)
    }

    /// Map a region received from the server, validating its header.
    pub fn open(fd: OwnedFd) -> Result<Self, ShmError> {
        let file = File::from(fd);
        let len = file.metadata()?.len() as usize;
        if len < Self::SIZE {
            return Err(ShmError::TooSmall {
                expected: Self::SIZE,
                got: len,
            });
        }

        let region = Self::map(OwnedFd::from(file))?;
        let (magic, version) = unsafe {
            let layout = region.ptr.as_ptr();
            (
                ptr::read_volatile(ptr::addr_of!((*layout).magic)),
                ptr::read_volatile(ptr::addr_of!((*layout).version)),
            )
        };
        if magic != SHM_MAGIC {
            return Err(ShmError::BadMagic(magic));
        }
        if version != SHM_VERSION {
            return Err(ShmError::VersionMismatch(version));
        }
        Ok(region)
    }

    fn map(fd: OwnedFd) -> Result<Self, ShmError> {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                Self::SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }
        let ptr = NonNull::new(ptr as *mut SharedLayout)
            .ok_or_else(|| io::Error::other("mmap returned null"))?;
        Ok(Self { ptr, fd })
    }

    /// Descriptor to hand to clients
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// Duplicate the backing descriptor
    pub fn try_clone_fd(&self) -> io::Result<OwnedFd> {
        self.fd.try_clone()
    }

    /// Fill the device table and assign each device its input sub-range.
    ///
    /// Takes `&mut self`: this must happen before the region is shared.
    pub fn publish_devices(&mut self, devices: &[DeviceLayout]) -> Result<(), ShmError> {
        if devices.len() > MAX_DEVICES {
            return Err(ShmError::TooManyDevices(devices.len()));
        }
        let total: usize = devices.iter().map(|d| d.num_inputs as usize).sum();
        if total > MAX_INPUTS {
            return Err(ShmError::TooManyInputs(total));
        }

        let layout = self.ptr.as_ptr();
        let mut first_input_index = 0u32;
        for (i, dev) in devices.iter().enumerate() {
            let mut name = [0u8; DEVICE_NAME_LEN];
            let bytes = dev.name.as_bytes();
            let n = bytes.len().min(DEVICE_NAME_LEN - 1);
            name[..n].copy_from_slice(&bytes[..n]);

            let entry = SharedDevice {
                name,
                kind: dev.kind,
                first_input_index,
                num_inputs: dev.num_inputs,
                _pad: 0,
            };
            unsafe {
                ptr::write_volatile(ptr::addr_of_mut!((*layout).devices[i]), entry);
            }
            first_input_index += dev.num_inputs;
        }

        unsafe {
            ptr::write_volatile(ptr::addr_of_mut!((*layout).num_devices), devices.len() as u32);
            ptr::write_volatile(ptr::addr_of_mut!((*layout).num_inputs), total as u32);
        }
        Ok(())
    }

    pub fn num_devices(&self) -> u32 {
        unsafe { ptr::read_volatile(ptr::addr_of!((*self.ptr.as_ptr()).num_devices)) }
    }

    /// Read one entry of the device table
    pub fn device(&self, id: u32) -> Option<SharedDevice> {
        if id >= self.num_devices() || id as usize >= MAX_DEVICES {
            return None;
        }
        Some(unsafe { ptr::read_volatile(ptr::addr_of!((*self.ptr.as_ptr()).devices[id as usize])) })
    }

    fn input_range(&self, device_id: u32) -> Result<(usize, usize), ShmError> {
        let dev = self.device(device_id).ok_or(ShmError::InvalidDevice(device_id))?;
        let first = dev.first_input_index as usize;
        let count = dev.num_inputs as usize;
        if first + count > MAX_INPUTS {
            return Err(ShmError::TooManyInputs(first + count));
        }
        Ok((first, count))
    }

    /// Copy a device's fresh input values into its sub-range.
    pub fn write_inputs(&self, device_id: u32, inputs: &[InputRecord]) -> Result<(), ShmError> {
        let (first, count) = self.input_range(device_id)?;
        if inputs.len() != count {
            return Err(ShmError::InputCountMismatch {
                device: device_id,
                expected: count,
                got: inputs.len(),
            });
        }

        let layout = self.ptr.as_ptr();
        for (i, input) in inputs.iter().enumerate() {
            unsafe {
                ptr::write_volatile(ptr::addr_of_mut!((*layout).inputs[first + i]), *input);
            }
        }
        Ok(())
    }

    /// Snapshot a device's input sub-range
    pub fn read_inputs(&self, device_id: u32) -> Result<Vec<InputRecord>, ShmError> {
        let (first, count) = self.input_range(device_id)?;
        let layout = self.ptr.as_ptr();
        Ok((first..first + count)
            .map(|i| unsafe { ptr::read_volatile(ptr::addr_of!((*layout).inputs[i])) })
            .collect())
    }

    fn ring_slot(&self, slot_id: u32) -> Result<&RingSlot, ShmError> {
        if slot_id as usize >= N_SLOTS {
            return Err(ShmError::InvalidSlot(slot_id));
        }
        Ok(unsafe { &(*self.ptr.as_ptr()).slots[slot_id as usize] })
    }

    /// Publish a frame into a ring slot (client side).
    pub fn write_slot(&self, slot_id: u32, slot: &LayerSlot) -> Result<(), ShmError> {
        let cell = self.ring_slot(slot_id)?;

        // A writer that died mid-update leaves the counter odd; start from
        // the even value below it.
        let start = cell.seq.load(Ordering::Relaxed) & !1;
        cell.seq.store(start | 1, Ordering::Relaxed);
        fence(Ordering::Release);
        unsafe { ptr::write_volatile(cell.data.get(), *slot) };
        cell.seq.store(start.wrapping_add(2), Ordering::Release);
        Ok(())
    }

    /// Copy a ring slot out, retrying while a writer holds it.
    pub fn read_slot(&self, slot_id: u32) -> Result<LayerSlot, ShmError> {
        let cell = self.ring_slot(slot_id)?;

        for _ in 0..SLOT_READ_RETRIES {
            let before = cell.seq.load(Ordering::Acquire);
            if before & 1 != 0 {
                std::hint::spin_loop();
                continue;
            }
            let data = unsafe { ptr::read_volatile(cell.data.get()) };
            fence(Ordering::Acquire);
            if cell.seq.load(Ordering::Relaxed) == before {
                return Ok(data);
            }
        }
        Err(ShmError::SlotBusy(slot_id))
    }

    /// Current sequence counter of a slot
    pub fn slot_sequence(&self, slot_id: u32) -> Result<u32, ShmError> {
        Ok(self.ring_slot(slot_id)?.seq.load(Ordering::Acquire))
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, Self::SIZE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LayerEntry;

    fn region_with_devices() -> ShmRegion {
        let mut region = ShmRegion::create("halo-test").unwrap();
        region
            .publish_devices(&[
                DeviceLayout {
                    name: "hmd".into(),
                    kind: 1,
                    num_inputs: 1,
                },
                DeviceLayout {
                    name: "left-controller".into(),
                    kind: 2,
                    num_inputs: 3,
                },
            ])
            .unwrap();
        region
    }

    #[test]
    fn test_device_table_assigns_ranges() {
        let region = region_with_devices();
        assert_eq!(region.num_devices(), 2);

        let hmd = region.device(0).unwrap();
        assert_eq!(hmd.name(), "hmd");
        assert_eq!((hmd.first_input_index, hmd.num_inputs), (0, 1));

        let left = region.device(1).unwrap();
        assert_eq!(left.name(), "left-controller");
        assert_eq!((left.first_input_index, left.num_inputs), (1, 3));

        assert!(region.device(2).is_none());
    }

    #[test]
    fn test_too_many_inputs_rejected() {
        let mut region = ShmRegion::create("halo-test").unwrap();
        let err = region
            .publish_devices(&[DeviceLayout {
                name: "big".into(),
                kind: 0,
                num_inputs: MAX_INPUTS as u32 + 1,
            }])
            .unwrap_err();
        assert!(matches!(err, ShmError::TooManyInputs(_)));
    }

    #[test]
    fn test_inputs_visible_through_second_mapping() {
        let region = region_with_devices();
        let client = ShmRegion::open(region.try_clone_fd().unwrap()).unwrap();

        let inputs: Vec<InputRecord> = (0..3)
            .map(|i| InputRecord {
                timestamp_ns: 100 + i,
                name: i as u32,
                active: 1,
                value: [i as f32, 0.0, 0.0, 0.0],
            })
            .collect();
        region.write_inputs(1, &inputs).unwrap();

        assert_eq!(client.read_inputs(1).unwrap(), inputs);
        // The other device's range is untouched.
        assert_eq!(client.read_inputs(0).unwrap(), vec![InputRecord::default()]);
    }

    #[test]
    fn test_write_inputs_checks_count() {
        let region = region_with_devices();
        let err = region.write_inputs(0, &[]).unwrap_err();
        assert!(matches!(err, ShmError::InputCountMismatch { expected: 1, got: 0, .. }));
        assert!(matches!(
            region.write_inputs(9, &[]),
            Err(ShmError::InvalidDevice(9))
        ));
    }

    #[test]
    fn test_slot_written_by_client_is_read_by_server() {
        let server = region_with_devices();
        let client = ShmRegion::open(server.try_clone_fd().unwrap()).unwrap();

        let mut slot = LayerSlot::default();
        slot.num_layers = 1;
        slot.layers[0] = LayerEntry {
            swapchain_ids: [2, 3],
            flip_y: 1,
            ..Default::default()
        };
        client.write_slot(1, &slot).unwrap();

        assert_eq!(server.read_slot(1).unwrap(), slot);
        assert_eq!(server.slot_sequence(1).unwrap(), 2);
    }

    #[test]
    fn test_slot_busy_while_writer_holds_it() {
        let region = region_with_devices();
        let cell = region.ring_slot(0).unwrap();
        cell.seq.store(5, Ordering::Release);
        assert!(matches!(region.read_slot(0), Err(ShmError::SlotBusy(0))));

        // A later write recovers from the abandoned odd counter.
        region.write_slot(0, &LayerSlot::default()).unwrap();
        assert_eq!(region.slot_sequence(0).unwrap(), 6);
        assert!(region.read_slot(0).is_ok());
    }

    #[test]
    fn test_slot_out_of_range() {
        let region = region_with_devices();
        assert!(matches!(
            region.read_slot(N_SLOTS as u32),
            Err(ShmError::InvalidSlot(_))
        ));
    }

    #[test]
    fn test_open_rejects_foreign_memfd() {
        let raw = unsafe { libc::memfd_create(c"other".as_ptr(), libc::MFD_CLOEXEC) };
        assert!(raw >= 0);
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        assert!(matches!(ShmRegion::open(fd), Err(ShmError::TooSmall { .. })));
    }
}
