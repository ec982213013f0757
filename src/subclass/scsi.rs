//! USB SCSI
//!
//! The [UsbClass] face of the device: descriptors, the two class-specific
//! control requests, and the routing of bulk endpoint events into the
//! transport engine.
//!
//! [UsbClass]: usb_device::class::UsbClass

use crate::fmt::{error, info};
use crate::scsi::target::ScsiTarget;
use crate::storage::{BlockDevice, BLOCK_SIZE};
use crate::transport::bbb::{BulkOnly, BulkOnlyError, MAX_LUN, TRANSPORT_BBB};
use crate::CLASS_MASS_STORAGE;
use core::borrow::BorrowMut;
use usb_device::bus::{InterfaceNumber, UsbBus, UsbBusAllocator};
use usb_device::class::{ControlIn, ControlOut, UsbClass};
use usb_device::control::{Recipient, RequestType};
use usb_device::descriptor::DescriptorWriter;
use usb_device::endpoint::EndpointAddress;

/// SCSI device subclass code
pub const SUBCLASS_SCSI: u8 = 0x06; // SCSI Transparent command set

const CLASS_SPECIFIC_BULK_ONLY_MASS_STORAGE_RESET: u8 = 0xFF;
const CLASS_SPECIFIC_GET_MAX_LUN: u8 = 0xFE;

/// SCSI USB Mass Storage device over Bulk Only Transport
///
/// A complete removable-drive function: plug an implementation of
/// [BlockDevice] in and register the class with a
/// [UsbDevice](usb_device::device::UsbDevice). Commands are executed
/// in-class; there is nothing to poll beyond the usual device poll.
///
/// [BlockDevice]: crate::storage::BlockDevice
pub struct Scsi<'alloc, Bus: UsbBus, D: BlockDevice, Buf: BorrowMut<[u8]>> {
    interface: InterfaceNumber,
    transport: BulkOnly<'alloc, Bus, ScsiTarget<D, Buf>>,
}

impl<'alloc, Bus, D, Buf> Scsi<'alloc, Bus, D, Buf>
where
    Bus: UsbBus + 'alloc,
    D: BlockDevice,
    Buf: BorrowMut<[u8]>,
{
    /// Creates the Mass Storage function and attempts to bring the storage
    /// up. A medium that fails to initialise leaves the unit "not ready"
    /// (the host sees `MEDIUM NOT PRESENT`); initialisation is retried on
    /// every USB bus reset.
    ///
    /// # Arguments
    /// * `alloc` - [UsbBusAllocator]
    /// * `storage` - the backing medium
    /// * `buf` - the IO buffer decoupling USB packets from storage blocks.
    ///   **Required** to hold a whole number of blocks, at least one;
    ///   several blocks deep is recommended for streaming throughput
    ///
    /// # Errors
    /// * [BufferTooSmall]
    /// * [BufferNotBlockSized]
    ///
    /// # Panics
    /// Panics if endpoint allocation fails.
    ///
    /// [BufferTooSmall]: crate::transport::bbb::BulkOnlyError::BufferTooSmall
    /// [BufferNotBlockSized]: crate::transport::bbb::BulkOnlyError::BufferNotBlockSized
    /// [UsbBusAllocator]: usb_device::bus::UsbBusAllocator
    pub fn new(
        alloc: &'alloc UsbBusAllocator<Bus>,
        storage: D,
        buf: Buf,
    ) -> Result<Self, BulkOnlyError> {
        let buf_len = buf.borrow().len();
        if buf_len < BLOCK_SIZE {
            return Err(BulkOnlyError::BufferTooSmall);
        }
        if buf_len % BLOCK_SIZE != 0 {
            return Err(BulkOnlyError::BufferNotBlockSized);
        }

        let mut target = ScsiTarget::new(storage, buf);
        target.initialize();

        Ok(Scsi {
            interface: alloc.interface(),
            transport: BulkOnly::new(alloc, target),
        })
    }

    /// Abandons the command in flight and readies the transport for the
    /// next CBW.
    ///
    /// Wired internally to the Bulk-Only Mass Storage Reset class request;
    /// public for transports that deliver class requests out of band.
    pub fn bulk_only_reset(&mut self) {
        self.transport.bulk_only_reset();
    }
}

impl<Bus, D, Buf> UsbClass<Bus> for Scsi<'_, Bus, D, Buf>
where
    Bus: UsbBus,
    D: BlockDevice,
    Buf: BorrowMut<[u8]>,
{
    fn get_configuration_descriptors(
        &self,
        writer: &mut DescriptorWriter,
    ) -> usb_device::Result<()> {
        writer.iad(
            self.interface,
            1,
            CLASS_MASS_STORAGE,
            SUBCLASS_SCSI,
            TRANSPORT_BBB,
            None,
        )?;
        writer.interface(self.interface, CLASS_MASS_STORAGE, SUBCLASS_SCSI, TRANSPORT_BBB)?;

        self.transport.write_endpoint_descriptors(writer)?;

        Ok(())
    }

    fn reset(&mut self) {
        self.transport.reset();
        // storage that failed to come up gets another chance on each bus
        // reset
        self.transport.handler.initialize();
    }

    fn control_in(&mut self, xfer: ControlIn<Bus>) {
        let req = xfer.request();

        // not interested in this request
        if !(req.request_type == RequestType::Class && req.recipient == Recipient::Interface) {
            return;
        }

        match req.request {
            // Spec. section 3.2
            CLASS_SPECIFIC_GET_MAX_LUN => {
                info!("usb: scsi: Recv GET MAX LUN");
                if xfer.accept_with(&[MAX_LUN]).is_err() {
                    error!("usb: scsi: failed to accept GET MAX LUN");
                }
            }
            _ => {}
        }
    }

    fn control_out(&mut self, xfer: ControlOut<Bus>) {
        let req = xfer.request();

        if !(req.request_type == RequestType::Class && req.recipient == Recipient::Interface) {
            return;
        }

        match req.request {
            // Spec. section 3.1
            CLASS_SPECIFIC_BULK_ONLY_MASS_STORAGE_RESET => {
                self.transport.bulk_only_reset();
                xfer.accept().ok();
            }
            _ => {}
        }
    }

    fn endpoint_out(&mut self, addr: EndpointAddress) {
        if addr == self.transport.out_address() {
            self.transport.on_packet_received();
        }
    }

    fn endpoint_in_complete(&mut self, addr: EndpointAddress) {
        if addr == self.transport.in_address() {
            self.transport.on_packet_sent();
        }
    }
}
