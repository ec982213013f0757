use std::sync::{Arc, Mutex};
use usb_device::class::UsbClass;
use usbd_msd::storage::{BlockDevice, BlockDeviceError, BLOCK_SIZE};
use usbd_msd::subclass::scsi::Scsi;

pub mod bbb;
pub mod scsi;

use self::bbb::{Csw, DummyUsbBus};

pub const IO_BUFFER_LEN: usize = BLOCK_SIZE * 8;

pub type TestScsi<'alloc> = Scsi<'alloc, DummyUsbBus, SharedDisk, Vec<u8>>;

/// Delivers endpoint events to the class the way a device controller would,
/// until nothing is left to deliver. Packets queued on a stalled OUT pipe
/// stay where they are, like a host that stopped sending.
pub fn pump(scsi: &mut TestScsi<'_>, bus: &DummyUsbBus) {
    for _ in 0..200_000 {
        if bus.take_in_complete() {
            UsbClass::endpoint_in_complete(scsi, bbb::in_address());
            continue;
        }
        if bus.has_out_packet() && !bus.out_stalled() {
            UsbClass::endpoint_out(scsi, bbb::out_address());
            continue;
        }
        return;
    }
    panic!("bus did not go quiescent");
}

/// Drains the IN endpoint after a command cycle: every queued packet but
/// the last is DATA-phase payload, the last one is the CSW.
pub fn collect_response(bus: &DummyUsbBus) -> (Vec<u8>, Csw) {
    let mut packets = vec![];
    while let Some(packet) = bus.read_packet() {
        packets.push(packet);
    }
    let csw = Csw::from_bytes(packets.pop().expect("no CSW queued").as_slice());
    (packets.concat(), csw)
}

/// An in-memory block device shared with the test body, with fault
/// injection switches.
#[derive(Clone)]
pub struct SharedDisk {
    inner: Arc<Mutex<DiskInner>>,
}

struct DiskInner {
    data: Vec<u8>,
    init_fails: bool,
    reads_left: Option<u32>,
    writes_left: Option<u32>,
}

impl SharedDisk {
    /// A disk of `blocks` blocks, block `n` filled with the byte `n`.
    pub fn new(blocks: u32) -> Self {
        let data = (0..blocks)
            .flat_map(|lba| [lba as u8; BLOCK_SIZE])
            .collect();
        Self {
            inner: Arc::new(Mutex::new(DiskInner {
                data,
                init_fails: false,
                reads_left: None,
                writes_left: None,
            })),
        }
    }

    pub fn block(&self, lba: u32) -> Vec<u8> {
        let lock = self.inner.lock().unwrap();
        let start = lba as usize * BLOCK_SIZE;
        lock.data[start..start + BLOCK_SIZE].to_vec()
    }

    pub fn fail_init(&self) {
        self.inner.lock().unwrap().init_fails = true;
    }

    /// Allow `count` more block reads, then fail them.
    pub fn fail_reads_after(&self, count: u32) {
        self.inner.lock().unwrap().reads_left = Some(count);
    }

    /// Allow `count` more block writes, then fail them.
    pub fn fail_writes_after(&self, count: u32) {
        self.inner.lock().unwrap().writes_left = Some(count);
    }
}

fn take_budget(budget: &mut Option<u32>) -> Result<(), BlockDeviceError> {
    match budget {
        None => Ok(()),
        Some(0) => Err(BlockDeviceError),
        Some(left) => {
            *left -= 1;
            Ok(())
        }
    }
}

impl BlockDevice for SharedDisk {
    fn init(&mut self) -> Result<(), BlockDeviceError> {
        if self.inner.lock().unwrap().init_fails {
            Err(BlockDeviceError)
        } else {
            Ok(())
        }
    }

    fn max_lba(&self) -> u32 {
        (self.inner.lock().unwrap().data.len() / BLOCK_SIZE) as u32
    }

    fn read_block(&mut self, lba: u32, dst: &mut [u8]) -> Result<(), BlockDeviceError> {
        let mut lock = self.inner.lock().unwrap();
        take_budget(&mut lock.reads_left)?;
        let start = lba as usize * BLOCK_SIZE;
        dst.copy_from_slice(&lock.data[start..start + BLOCK_SIZE]);
        Ok(())
    }

    fn write_block(&mut self, lba: u32, src: &[u8]) -> Result<(), BlockDeviceError> {
        let mut lock = self.inner.lock().unwrap();
        take_budget(&mut lock.writes_left)?;
        let start = lba as usize * BLOCK_SIZE;
        lock.data[start..start + BLOCK_SIZE].copy_from_slice(src);
        Ok(())
    }
}
