//! Bulk Only Transport (BBB/BOT)
//!
//! The phase machine framing one SCSI command at a time: a 31-byte Command
//! Block Wrapper arrives on the OUT endpoint, DATA-phase bytes move in the
//! direction the wrapper fixed, and a 13-byte Command Status Wrapper closes
//! the cycle. The engine is driven from transport events: one call per
//! received OUT packet and one per completed IN packet.

use crate::endian::{le32, put_le32};
use crate::fmt::{debug, error, info, trace, warn};
use crate::transport::{CommandHandler, CommandStatus};
use core::cmp::min;
use usb_device::bus::{UsbBus, UsbBusAllocator};
use usb_device::descriptor::DescriptorWriter;
use usb_device::endpoint::{Endpoint, EndpointAddress, In, Out};
use usb_device::UsbError;

/// Bulk Only Transport interface protocol
pub(crate) const TRANSPORT_BBB: u8 = 0x50;

/// Bulk endpoints run at the full-speed maximum. CBW validation relies on a
/// wrapper arriving as a single packet.
pub(crate) const PACKET_SIZE: usize = 64;

/// Highest addressable Logical Unit: a single LUN 0.
pub(crate) const MAX_LUN: u8 = 0;

const CBW_SIGNATURE_LE: [u8; 4] = 0x43425355u32.to_le_bytes();
const CSW_SIGNATURE_LE: [u8; 4] = 0x53425355u32.to_le_bytes();

const CBW_LEN: usize = 31;
const CSW_LEN: usize = 13;

struct InvalidCbwError; // Inner transport-specific error

/// Bulk Only Transport configuration error
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BulkOnlyError {
    /// The IO buffer cannot hold a single storage block
    BufferTooSmall,
    /// The IO buffer length is not a multiple of the block size
    BufferNotBlockSized,
}

#[derive(Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum Phase {
    Idle,    // waiting for a CBW
    Command, // CBW accepted, command dispatch in flight
    Data,    // moving DATA-phase bytes, direction fixed by the CBW
    Status,  // CSW queued for transmission
}

#[repr(u8)]
#[derive(Default, Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum DataDirection {
    #[default]
    Out,
    In,
}

/// Bulk Only Transport engine
///
/// Owns the two bulk endpoints and the transfer bookkeeping for the command
/// in flight; everything SCSI happens behind the [CommandHandler].
///
/// [CommandHandler]: crate::transport::CommandHandler
pub struct BulkOnly<'alloc, Bus: UsbBus, H: CommandHandler> {
    out_ep: Endpoint<'alloc, Bus, Out>,
    in_ep: Endpoint<'alloc, Bus, In>,
    pub(crate) handler: H,
    phase: Phase,
    cbw: CommandBlockWrapper,
    /// DATA-phase bytes moved so far, per direction.
    bytes_sent: u32,
    bytes_received: u32,
    /// What the handler said the DATA phase would carry.
    device_expect: u32,
    /// Length of the IN packet currently in flight.
    last_tx: usize,
}

impl<'alloc, Bus, H> BulkOnly<'alloc, Bus, H>
where
    Bus: UsbBus,
    H: CommandHandler,
{
    /// Allocates the bulk endpoint pair (OUT first, so it lands on the
    /// lower endpoint number) and wraps `handler`.
    ///
    /// # Panics
    /// Panics if endpoint allocation fails.
    pub(crate) fn new(alloc: &'alloc UsbBusAllocator<Bus>, handler: H) -> Self {
        BulkOnly {
            out_ep: alloc.bulk(PACKET_SIZE as u16),
            in_ep: alloc.bulk(PACKET_SIZE as u16),
            handler,
            phase: Phase::Idle,
            cbw: Default::default(),
            bytes_sent: 0,
            bytes_received: 0,
            device_expect: 0,
            last_tx: 0,
        }
    }

    pub(crate) fn write_endpoint_descriptors(
        &self,
        writer: &mut DescriptorWriter,
    ) -> Result<(), UsbError> {
        writer.endpoint(&self.out_ep)?;
        writer.endpoint(&self.in_ep)?;
        Ok(())
    }

    pub(crate) fn out_address(&self) -> EndpointAddress {
        self.out_ep.address()
    }

    pub(crate) fn in_address(&self) -> EndpointAddress {
        self.in_ep.address()
    }

    /// USB bus reset: stalls are cleared by the bus, the transfer state
    /// starts over.
    pub(crate) fn reset(&mut self) {
        info!("usb: bbb: Recv reset");
        self.in_ep.unstall();
        self.out_ep.unstall();
        self.enter_idle();
    }

    /// Bulk-Only Mass Storage Reset class request.
    ///
    /// Abandons the command in flight; half-received write data is flushed
    /// or dropped. Endpoint stalls stay in place, clearing them is the
    /// host's job.
    pub(crate) fn bulk_only_reset(&mut self) {
        info!("usb: bbb: Bulk-Only Mass Storage Reset");
        if matches!(self.phase, Phase::Data) && matches!(self.cbw.direction, DataDirection::Out) {
            let _ = self.handler.commit();
        }
        self.phase = Phase::Idle;
    }

    /// A packet arrived on the OUT endpoint.
    pub(crate) fn on_packet_received(&mut self) {
        let mut packet = [0u8; PACKET_SIZE];
        let count = match self.out_ep.read(&mut packet) {
            Ok(count) => count,
            Err(UsbError::WouldBlock) => return,
            Err(_) => {
                error!("usb: bbb: out endpoint read failed");
                return;
            }
        };
        trace!("usb: bbb: Read bytes: {}", count);

        match self.phase {
            Phase::Idle => self.begin_transaction(&packet[..count]),
            Phase::Data => self.rx_data(&packet[..count]),
            _ => warn!("usb: bbb: dropped {} received bytes outside a data phase", count),
        }
    }

    /// The IN packet queued last has been collected by the host.
    pub(crate) fn on_packet_sent(&mut self) {
        match self.phase {
            Phase::Status => {
                trace!("usb: bbb: CSW delivered");
                self.enter_idle();
            }
            Phase::Data => {
                let sent = self.last_tx;
                self.bytes_sent += sent as u32;
                let host_expect = self.cbw.data_transfer_len;

                if matches!(self.cbw.direction, DataDirection::Out) {
                    error!("usb: bbb: transmit completion during an OUT data phase");
                    self.stall_both();
                    self.send_csw(CommandStatus::PhaseError, self.bytes_sent);
                    return;
                }
                if self.bytes_sent > host_expect {
                    error!("usb: bbb: sent more than the host asked for");
                    self.stall_both();
                    self.send_csw(CommandStatus::PhaseError, self.bytes_sent);
                    return;
                }

                if self.bytes_sent == host_expect {
                    self.send_csw(CommandStatus::Passed, self.bytes_sent);
                } else if sent < self.packet_size() {
                    // a short packet terminates the transfer early
                    self.send_csw(CommandStatus::Passed, self.bytes_sent);
                } else {
                    self.transmit_next();
                }
            }
            Phase::Idle | Phase::Command => {
                trace!("usb: bbb: transmit completion outside a transfer");
            }
        }
    }

    /// Treats a received packet as a CBW, dispatches the command and sorts
    /// out any host/device disagreement about the DATA phase.
    fn begin_transaction(&mut self, data: &[u8]) {
        let cbw = match CommandBlockWrapper::parse(data) {
            Ok(cbw) => cbw,
            Err(InvalidCbwError) => {
                // Spec. 6.6.1
                error!("usb: bbb: invalid CBW, stalling both endpoints");
                self.stall_both();
                // the failure CSW must not echo a stale wrapper
                self.cbw = Default::default();
                self.send_csw(CommandStatus::Failed, 0);
                return;
            }
        };
        info!(
            "usb: bbb: Recv CBW: tag {} transfer len {} lun {}",
            cbw.tag, cbw.data_transfer_len, cbw.lun,
        );

        self.phase = Phase::Command;
        self.cbw = cbw;
        self.bytes_sent = 0;
        self.bytes_received = 0;
        self.device_expect = 0;

        let block = cbw.block;
        let expect = match self.handler.begin(&block[..cbw.block_len]) {
            Ok(expect) => expect,
            Err(_) => {
                debug!("usb: bbb: command rejected, sending CSW with failed status");
                self.send_csw(CommandStatus::Failed, 0);
                return;
            }
        };
        self.device_expect = expect;
        debug!("usb: bbb: bytes in data phase: {}", expect);

        let host_expect = self.cbw.data_transfer_len;
        if expect == 0 && host_expect == 0 {
            self.send_csw(CommandStatus::Passed, 0);
            return;
        }
        if expect != host_expect {
            // spec. 6.7: one side expects a DATA phase the other will not
            // take part in
            if expect == 0 || host_expect == 0 {
                self.stall_in();
                self.send_csw(CommandStatus::PhaseError, 0);
                return;
            }
            if expect < host_expect && matches!(self.cbw.direction, DataDirection::Out) {
                self.stall_both();
                self.send_csw(CommandStatus::PhaseError, 0);
                return;
            }
            // otherwise carry on; the residue reports what actually moved
            info!("usb: bbb: host and device disagree on the transfer length");
        }

        self.phase = Phase::Data;
        if matches!(self.cbw.direction, DataDirection::In) {
            self.transmit_next();
        }
    }

    /// Queues the next IN data packet, or closes the phase when the handler
    /// runs out of data or fails.
    fn transmit_next(&mut self) {
        let host_expect = self.cbw.data_transfer_len;
        let packet_size = self.packet_size();

        match self.handler.to_host(packet_size) {
            Err(_) => {
                error!("usb: bbb: data phase failed");
                if self.bytes_sent < host_expect {
                    self.stall_in();
                }
                self.send_csw(CommandStatus::Failed, self.bytes_sent);
            }
            Ok(None) => {
                // out of data with the host still listening: honest short
                // transfer
                if self.bytes_sent < host_expect {
                    self.stall_in();
                }
                self.send_csw(CommandStatus::Passed, self.bytes_sent);
            }
            Ok(Some(chunk)) => {
                // never hand the host more than it asked for
                let remaining = (host_expect - self.bytes_sent) as usize;
                let count = min(chunk.len(), remaining);
                match self.in_ep.write(&chunk[..count]) {
                    Ok(written) => self.last_tx = written,
                    Err(UsbError::WouldBlock) => {
                        warn!("usb: bbb: in endpoint busy, chunk dropped")
                    }
                    Err(_) => error!("usb: bbb: in endpoint write failed"),
                }
            }
        }
    }

    /// Forwards received DATA-phase bytes to the handler and commits when
    /// the transfer is complete.
    fn rx_data(&mut self, data: &[u8]) {
        if matches!(self.cbw.direction, DataDirection::In) {
            error!("usb: bbb: received data during an IN data phase");
            self.stall_both();
            self.send_csw(CommandStatus::PhaseError, self.bytes_received);
            return;
        }

        self.bytes_received += data.len() as u32;
        trace!(
            "usb: bbb: received {} of {} bytes",
            self.bytes_received,
            self.cbw.data_transfer_len,
        );

        if self.handler.from_host(data).is_err() {
            error!("usb: bbb: handler rejected host data");
            // learn how far the medium got for the residue
            let committed = match self.handler.commit() {
                Ok(count) => count,
                Err(err) => err.committed,
            };
            if self.bytes_received < self.cbw.data_transfer_len {
                self.stall_out();
            }
            self.send_csw(CommandStatus::Failed, committed);
            return;
        }

        // commit once the host has sent everything it promised, or
        // everything the command expects
        if self.bytes_received == self.cbw.data_transfer_len
            || self.bytes_received == self.device_expect
        {
            match self.handler.commit() {
                Ok(count) => self.send_csw(CommandStatus::Passed, count),
                Err(err) => {
                    error!("usb: bbb: commit failed after {} bytes", err.committed);
                    self.stall_out();
                    self.send_csw(CommandStatus::Failed, err.committed);
                }
            }
        }
    }

    /// Queues the CSW for the current command. `processed` is what the
    /// device actually moved; the residue reports the shortfall against the
    /// host's expectation.
    fn send_csw(&mut self, status: CommandStatus, processed: u32) {
        let residue = self.cbw.data_transfer_len.saturating_sub(processed);
        if residue != 0 {
            info!("usb: bbb: CSW residue: {}", residue);
        }
        info!("usb: bbb: Send CSW: {}", status);

        let mut csw = [0u8; CSW_LEN];
        csw[..4].copy_from_slice(&CSW_SIGNATURE_LE);
        put_le32(&mut csw[4..8], self.cbw.tag);
        put_le32(&mut csw[8..12], residue);
        csw[12] = status as u8;

        self.phase = Phase::Status;
        // queued even onto a stalled endpoint; the host collects it after
        // clearing the stall
        match self.in_ep.write(&csw) {
            Ok(count) => self.last_tx = count,
            Err(UsbError::WouldBlock) => warn!("usb: bbb: in endpoint busy, CSW not queued"),
            Err(_) => error!("usb: bbb: failed to queue CSW"),
        }
    }

    fn enter_idle(&mut self) {
        self.phase = Phase::Idle;
        self.cbw = Default::default();
        self.bytes_sent = 0;
        self.bytes_received = 0;
        self.device_expect = 0;
        self.last_tx = 0;
    }

    #[inline]
    fn packet_size(&self) -> usize {
        self.in_ep.max_packet_size() as usize // same for both In and Out EPs
    }

    #[inline]
    fn stall_both(&self) {
        self.stall_in();
        self.stall_out();
    }

    #[inline]
    fn stall_in(&self) {
        info!("usb: bbb: Stall IN ep");
        self.in_ep.stall();
    }

    #[inline]
    fn stall_out(&self) {
        info!("usb: bbb: Stall OUT ep");
        self.out_ep.stall();
    }
}

#[derive(Default, Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
struct CommandBlockWrapper {
    tag: u32,
    data_transfer_len: u32,
    direction: DataDirection,
    lun: u8,
    block_len: usize,
    block: [u8; 16],
}

impl CommandBlockWrapper {
    /// Validates and decodes a wrapper. Spec. 6.2.1: exactly 31 bytes, the
    /// right signature, an addressable LUN and a command block length in
    /// (0, 16].
    fn parse(value: &[u8]) -> Result<Self, InvalidCbwError> {
        const MIN_CB_LEN: usize = 1;
        const MAX_CB_LEN: usize = 16;

        if value.len() != CBW_LEN || !value.starts_with(&CBW_SIGNATURE_LE) {
            return Err(InvalidCbwError);
        }

        let lun = value[13] & 0b00001111;
        if lun > MAX_LUN {
            return Err(InvalidCbwError);
        }

        let block_len = (value[14] & 0b00011111) as usize;
        if !(MIN_CB_LEN..=MAX_CB_LEN).contains(&block_len) {
            return Err(InvalidCbwError);
        }

        Ok(CommandBlockWrapper {
            tag: le32(&value[4..8]),
            data_transfer_len: le32(&value[8..12]),
            direction: if value[12] & (1 << 7) != 0 {
                DataDirection::In
            } else {
                DataDirection::Out
            },
            lun,
            block_len,
            block: value[15..31].try_into().unwrap(), // ok, cause we checked a length
        })
    }
}
