//! Host-side view of the Bulk Only Transport: an in-memory USB bus with one
//! bulk endpoint pair and codecs for the wrappers.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use usb_device::bus::{PollResult, UsbBus};
use usb_device::class_prelude::{EndpointAddress, EndpointType};
use usb_device::{UsbDirection, UsbError};

const CBW_SIGNATURE_LE: [u8; 4] = 0x43425355u32.to_le_bytes();
const CSW_SIGNATURE_LE: [u8; 4] = 0x53425355u32.to_le_bytes();

const MAX_CB_LEN: usize = 16;
const CBW_LEN: usize = 31;
const CSW_LEN: usize = 13;

pub const EP_OUT_INDEX: usize = 1;
pub const EP_IN_INDEX: usize = 2;

pub fn out_address() -> EndpointAddress {
    EndpointAddress::from_parts(EP_OUT_INDEX, UsbDirection::Out)
}

pub fn in_address() -> EndpointAddress {
    EndpointAddress::from_parts(EP_IN_INDEX, UsbDirection::In)
}

#[derive(Debug, Eq, PartialEq)]
pub enum CommandStatus {
    Passed = 0x00,
    Failed = 0x01,
    PhaseError = 0x02,
}

pub enum DataDirection {
    Out,
    In,
}

pub struct Cbw {
    pub tag: u32,
    pub data_transfer_len: u32,
    pub direction: DataDirection,
    pub block: Vec<u8>,
}

impl Cbw {
    pub fn into_bytes(self) -> Vec<u8> {
        assert!((1..=MAX_CB_LEN).contains(&self.block.len()));

        let mut bytes = vec![];
        bytes.extend_from_slice(CBW_SIGNATURE_LE.as_slice()); // signature
        bytes.extend_from_slice(self.tag.to_le_bytes().as_slice()); // tag
        bytes.extend_from_slice(self.data_transfer_len.to_le_bytes().as_slice());

        let direction = match self.direction {
            DataDirection::In => 1_u8 << 7,
            DataDirection::Out => 0u8,
        };
        bytes.push(direction); // flags
        bytes.push(0); // lun
        bytes.push(self.block.len() as u8); // command block length

        let mut block = vec![0u8; MAX_CB_LEN];
        block[..self.block.len()].copy_from_slice(self.block.as_slice());
        bytes.extend_from_slice(block.as_slice()); // command block

        assert_eq!(CBW_LEN, bytes.len());
        bytes
    }
}

#[derive(Debug, Eq, PartialEq)]
pub struct Csw {
    pub tag: u32,
    pub residue: u32,
    pub status: CommandStatus,
}

impl Csw {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        assert_eq!(CSW_LEN, bytes.len());
        assert_eq!(CSW_SIGNATURE_LE, bytes[..4]);

        let tag = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        let residue = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let status = match bytes[12] {
            0x00 => CommandStatus::Passed,
            0x01 => CommandStatus::Failed,
            0x02 => CommandStatus::PhaseError,
            _ => panic!("invalid status code"),
        };

        Self {
            tag,
            residue,
            status,
        }
    }
}

struct DummyEp {
    addr: EndpointAddress,
    max_packet_size: u16,
    stalled: bool,
    packets: VecDeque<Vec<u8>>,
}

impl DummyEp {
    fn new(addr: EndpointAddress, max_packet_size: u16) -> Self {
        Self {
            addr,
            max_packet_size,
            stalled: false,
            packets: VecDeque::new(),
        }
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        for chunk in bytes.chunks(self.max_packet_size as usize) {
            self.packets.push_back(chunk.to_vec());
        }
    }
}

#[derive(Clone)]
pub struct DummyUsbBus {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    enabled: bool,
    ep_in: Option<DummyEp>,
    ep_out: Option<DummyEp>,
    /// IN packets queued by the device and not yet acknowledged as
    /// transmitted.
    pending_in_complete: usize,
}

impl DummyUsbBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                enabled: false,
                ep_in: None,
                ep_out: None,
                pending_in_complete: 0,
            })),
        }
    }

    /// Write a Command Block Wrapper as if written by a USB host
    pub fn write_cbw(&self, cbw: Cbw) {
        self.write_data(cbw.into_bytes().as_slice());
    }

    /// Write data as if written by a USB host during an OUT data transfer
    pub fn write_data(&self, data: &[u8]) {
        let mut lock = self.inner.lock().unwrap();
        lock.ep_out.as_mut().unwrap().write_bytes(data);
    }

    /// Read a single packet as if read by a USB host
    pub fn read_packet(&self) -> Option<Vec<u8>> {
        let mut lock = self.inner.lock().unwrap();
        lock.ep_in.as_mut().unwrap().packets.pop_front()
    }

    pub fn has_out_packet(&self) -> bool {
        let lock = self.inner.lock().unwrap();
        lock.ep_out
            .as_ref()
            .map(|ep| !ep.packets.is_empty())
            .unwrap_or(false)
    }

    /// Pops one pending "IN packet collected" event.
    pub fn take_in_complete(&self) -> bool {
        let mut lock = self.inner.lock().unwrap();
        if lock.pending_in_complete > 0 {
            lock.pending_in_complete -= 1;
            true
        } else {
            false
        }
    }

    pub fn out_stalled(&self) -> bool {
        let lock = self.inner.lock().unwrap();
        lock.ep_out.as_ref().map(|ep| ep.stalled).unwrap_or(false)
    }

    pub fn in_stalled(&self) -> bool {
        let lock = self.inner.lock().unwrap();
        lock.ep_in.as_ref().map(|ep| ep.stalled).unwrap_or(false)
    }

    /// What a host does with CLEAR_FEATURE(ENDPOINT_HALT) on both pipes
    pub fn clear_stalls(&self) {
        let mut lock = self.inner.lock().unwrap();
        if let Some(ep) = lock.ep_in.as_mut() {
            ep.stalled = false;
        }
        if let Some(ep) = lock.ep_out.as_mut() {
            ep.stalled = false;
        }
    }
}

impl UsbBus for DummyUsbBus {
    fn alloc_ep(
        &mut self,
        ep_dir: UsbDirection,
        _ep_addr: Option<EndpointAddress>,
        ep_type: EndpointType,
        max_packet_size: u16,
        _interval: u8,
    ) -> usb_device::Result<EndpointAddress> {
        let mut lock = self.inner.lock().unwrap();
        assert!(!lock.enabled);

        if matches!(ep_type, EndpointType::Control) {
            return Ok(EndpointAddress::from_parts(0, ep_dir));
        }

        let addr = match ep_dir {
            UsbDirection::Out => {
                let addr = out_address();
                lock.ep_out.replace(DummyEp::new(addr, max_packet_size));
                addr
            }
            UsbDirection::In => {
                let addr = in_address();
                lock.ep_in.replace(DummyEp::new(addr, max_packet_size));
                addr
            }
        };

        Ok(addr)
    }

    fn enable(&mut self) {
        self.inner.lock().unwrap().enabled = true;
    }

    fn reset(&self) {}

    fn set_device_address(&self, _addr: u8) {}

    fn write(&self, ep_addr: EndpointAddress, buf: &[u8]) -> usb_device::Result<usize> {
        let mut lock = self.inner.lock().unwrap();
        let ep = lock.ep_in.as_mut().unwrap();

        if ep.addr != ep_addr {
            return Err(UsbError::InvalidEndpoint);
        }
        if buf.len() > ep.max_packet_size as usize {
            return Err(UsbError::BufferOverflow);
        }

        ep.write_bytes(buf);
        lock.pending_in_complete += 1;

        Ok(buf.len())
    }

    fn read(&self, ep_addr: EndpointAddress, buf: &mut [u8]) -> usb_device::Result<usize> {
        let mut lock = self.inner.lock().unwrap();
        let ep = lock.ep_out.as_mut().unwrap();

        if ep.addr != ep_addr {
            return Err(UsbError::InvalidEndpoint);
        }

        if let Some(n) = ep.packets.front().map(|p| p.len()) {
            if n > buf.len() {
                return Err(UsbError::BufferOverflow);
            }
        }

        match ep.packets.pop_front() {
            Some(packet) => {
                buf[..packet.len()].copy_from_slice(packet.as_slice());
                Ok(packet.len())
            }
            None => Err(UsbError::WouldBlock),
        }
    }

    fn set_stalled(&self, ep_addr: EndpointAddress, stalled: bool) {
        let mut lock = self.inner.lock().unwrap();

        if let Some(ep) = lock.ep_in.as_mut() {
            if ep.addr == ep_addr {
                ep.stalled = stalled;
                return;
            }
        }

        if let Some(ep) = lock.ep_out.as_mut() {
            if ep.addr == ep_addr {
                ep.stalled = stalled;
            }
        }
    }

    fn is_stalled(&self, ep_addr: EndpointAddress) -> bool {
        let lock = self.inner.lock().unwrap();

        if let Some(ep) = lock.ep_in.as_ref() {
            if ep.addr == ep_addr {
                return ep.stalled;
            }
        }

        if let Some(ep) = lock.ep_out.as_ref() {
            if ep.addr == ep_addr {
                return ep.stalled;
            }
        }

        false
    }

    fn suspend(&self) {}

    fn resume(&self) {}

    fn poll(&self) -> PollResult {
        PollResult::None
    }
}
