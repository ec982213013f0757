//! SCSI direct-access target
//!
//! Owns the logical unit, the sense latch and the streaming IO buffer, and
//! executes one CDB at a time against the backing [BlockDevice]. Commands
//! that move bulk data run in instalments: the transport drains or fills the
//! IO buffer packet by packet and comes back through [CommandHandler] for
//! more, with `lba_offset` tracking how far into the transfer the medium is.
//!
//! [BlockDevice]: crate::storage::BlockDevice
//! [CommandHandler]: crate::transport::CommandHandler

use crate::buffer::Buffer;
use crate::chs::{lba_to_chs_limits, ChsLimits};
use crate::endian::{be16, be32, put_be16, put_be32};
use crate::fmt::{debug, error, info, warn};
use crate::scsi::sense::{
    SenseData, SenseKey, ASC_ASCQ_FORMAT_COMMAND_FAILED, ASC_ASCQ_INVALID_COMMAND,
    ASC_ASCQ_INVALID_FIELD_IN_CDB, ASC_ASCQ_LBA_OUT_OF_RANGE, ASC_ASCQ_LUN_NOT_READY,
    ASC_ASCQ_MEDIUM_MAY_HAVE_CHANGED, ASC_ASCQ_MEDIUM_NOT_PRESENT, ASC_ASCQ_NO_ADDITIONAL_SENSE,
    ASC_ASCQ_PERIPHERAL_DEVICE_WRITE_FAULT, ASC_ASCQ_UNRECOVERED_READ_ERROR,
    FIXED_FORMAT_SENSE_LEN,
};
use crate::scsi::{
    CheckCondition, CommitError, FORMAT_UNIT, GROUP_CDB10, GROUP_CDB10_ALT, GROUP_CDB12,
    GROUP_CDB6, GROUP_CODE_MASK, INQUIRY, LOAD_UNLOAD, MODE_SENSE_6,
    PREVENT_ALLOW_MEDIUM_REMOVAL, READ_10, READ_6, READ_CAPACITY_10, READ_FORMAT_CAPACITIES,
    REPORT_LUNS, REQUEST_SENSE, SEND_DIAGNOSTIC, TEST_UNIT_READY, WRITE_10, WRITE_6,
};
use crate::storage::{BlockDevice, BLOCK_SIZE};
use crate::transport::CommandHandler;
use core::borrow::BorrowMut;
use core::cmp::min;

/// Standard INQUIRY response: direct-access block device, removable medium,
/// left-aligned space-padded ASCII identification strings (SPC 4.4.1).
const INQUIRY_DATA: [u8; 36] = [
    0x00, // connected, direct-access block device
    0x80, // removable medium
    0x00, // no standard claimed
    0x01, // response data format
    0x1f, // 36 bytes in total
    0x00, 0x00, 0x00, // no extra capabilities
    b'U', b'S', b'B', b'D', b'-', b'M', b'S', b'D', // 8-byte T10 vendor id
    b'S', b'D', b' ', b'C', b'A', b'R', b'D', b' ', b'R', b'E', b'A', b'D', b'E', b'R', b' ',
    b' ', // 16-byte product id
    b'1', b'.', b'0', b'0', // 4-byte product revision
];

/// One 8-byte entry, LUN 0.
const REPORT_LUNS_DATA: [u8; 16] = [
    0x00, 0x00, 0x00, 0x08, // lun list length
    0x00, 0x00, 0x00, 0x00, // reserved
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // lun 0
];

const FLEXIBLE_DISK_PAGE_CODE: u8 = 0x05;
const FLEXIBLE_DISK_PAGE_LEN: u8 = 0x1e;
const FLEXIBLE_DISK_PAGE_SIZE: usize = 2 + FLEXIBLE_DISK_PAGE_LEN as usize;
// nominal medium transfer rate reported in the flexible disk page
const FLEXIBLE_DISK_TRANSFER_RATE: u16 = 0x3c00;

const MODE_PAGE_CODE_MASK: u8 = 0x3f;
const MODE_PAGE_RETURN_ALL: u8 = 0x3f;
const MODE_PARAMETER_HEADER_LEN: usize = 4;

const CAPACITY_DESCRIPTOR_TYPE_FORMATTED: u32 = 0x02;

/// Transfer lengths are 16 bits at most, so a READ(6) length of 0 means 256
/// blocks (SBC 5.5).
const CDB6_ZERO_TRANSFER_BLOCKS: u32 = 256;

/// The command block under execution, zero-padded; its length was checked
/// against the group code before it was stored.
#[derive(Copy, Clone)]
struct Cdb {
    bytes: [u8; 16],
}

impl Cdb {
    const NONE: Cdb = Cdb { bytes: [0; 16] };

    fn copy_from(cdb: &[u8]) -> Cdb {
        let mut bytes = [0u8; 16];
        bytes[..cdb.len()].copy_from_slice(cdb);
        Cdb { bytes }
    }

    fn opcode(&self) -> u8 {
        self.bytes[0]
    }
}

#[derive(Copy, Clone)]
struct LogicalUnit {
    starting_lba: u32,
    block_count: u32,
}

/// A single-LUN SCSI target over a [BlockDevice].
pub struct ScsiTarget<D: BlockDevice, Buf: BorrowMut<[u8]>> {
    storage: D,
    ready: bool,
    lun: LogicalUnit,
    sense: SenseData,
    flexible_disk_page: [u8; FLEXIBLE_DISK_PAGE_SIZE],
    io: Buffer<Buf>,
    cdb: Cdb,
    /// Blocks already moved for the active READ/WRITE. Survives transport
    /// re-entries within one command; reset by `begin`.
    lba_offset: u32,
}

impl<D: BlockDevice, Buf: BorrowMut<[u8]>> ScsiTarget<D, Buf> {
    pub(crate) fn new(storage: D, buf: Buf) -> Self {
        ScsiTarget {
            storage,
            ready: false,
            lun: LogicalUnit {
                starting_lba: 0,
                block_count: 0,
            },
            sense: SenseData::no_sense(),
            flexible_disk_page: [0; FLEXIBLE_DISK_PAGE_SIZE],
            io: Buffer::new(buf),
            cdb: Cdb::NONE,
            lba_offset: 0,
        }
    }

    /// Brings the medium up and builds the capacity-derived data. A no-op
    /// once ready; safe to call again after a failed attempt.
    pub(crate) fn initialize(&mut self) {
        if self.ready {
            return;
        }

        if self.storage.init().is_err() {
            warn!("scsi: storage init failed, unit stays not ready");
            return;
        }

        let block_count = self.storage.max_lba();
        if block_count == 0 {
            warn!("scsi: storage reports no blocks, unit stays not ready");
            return;
        }
        info!("scsi: medium up, {} blocks", block_count);

        self.lun = LogicalUnit {
            starting_lba: 0,
            block_count,
        };
        self.flexible_disk_page = flexible_disk_page(&lba_to_chs_limits(block_count));

        // first command cycle must tell the host the medium (re)appeared
        self.sense = SenseData::no_sense();
        self.sense
            .set(SenseKey::UnitAttention, ASC_ASCQ_MEDIUM_MAY_HAVE_CHANGED);
        self.ready = true;
    }

    fn set_sense(&mut self, key: SenseKey, asc_ascq: u16) -> CheckCondition {
        self.sense.set(key, asc_ascq);
        CheckCondition
    }

    fn validate_cdb(&mut self, cdb: &[u8]) -> Result<(), CheckCondition> {
        let Some(&opcode) = cdb.first() else {
            error!("scsi: empty cdb");
            return Err(self.set_sense(SenseKey::HardwareError, ASC_ASCQ_NO_ADDITIONAL_SENSE));
        };

        // some hosts wrap these 6-byte commands in a 12-byte block; accept
        if (opcode == REQUEST_SENSE || opcode == INQUIRY) && cdb.len() == 12 {
            return Ok(());
        }

        let expected = match opcode & GROUP_CODE_MASK {
            GROUP_CDB6 => 6,
            GROUP_CDB10 | GROUP_CDB10_ALT => 10,
            GROUP_CDB12 => 12,
            _ => {
                warn!("scsi: unsupported cdb group for opcode {}", opcode);
                return Err(self.set_sense(SenseKey::IllegalRequest, ASC_ASCQ_INVALID_COMMAND));
            }
        };
        if cdb.len() != expected {
            warn!("scsi: cdb length {} does not match opcode {}", cdb.len(), opcode);
            return Err(self.set_sense(SenseKey::IllegalRequest, ASC_ASCQ_INVALID_COMMAND));
        }
        Ok(())
    }

    /// Commands a unit without a working medium can still answer.
    fn may_execute(&self, opcode: u8) -> bool {
        match opcode {
            INQUIRY | REPORT_LUNS | REQUEST_SENSE | SEND_DIAGNOSTIC | TEST_UNIT_READY => true,
            _ => self.ready,
        }
    }

    /// LBA and block count of the stored READ/WRITE CDB.
    fn transfer_params(&self) -> (u32, u32) {
        let cdb = &self.cdb.bytes;
        match self.cdb.opcode() {
            READ_6 | WRITE_6 => {
                let lba =
                    ((cdb[1] & 0x1f) as u32) << 16 | (cdb[2] as u32) << 8 | cdb[3] as u32;
                let count = match cdb[4] {
                    0 => CDB6_ZERO_TRANSFER_BLOCKS,
                    n => n as u32,
                };
                (lba, count)
            }
            _ => (be32(&cdb[2..6]), be16(&cdb[7..9]) as u32),
        }
    }

    fn write_response(&mut self, data: &[u8]) -> Result<(), CheckCondition> {
        if self.io.write(data).is_err() {
            error!("scsi: response does not fit the io buffer");
            return Err(self.set_sense(SenseKey::HardwareError, ASC_ASCQ_NO_ADDITIONAL_SENSE));
        }
        Ok(())
    }

    fn test_unit_ready(&mut self) -> Result<u32, CheckCondition> {
        info!("scsi: TEST UNIT READY");
        if !self.ready {
            return Err(self.set_sense(SenseKey::NotReady, ASC_ASCQ_MEDIUM_NOT_PRESENT));
        }
        // a pending sense condition makes the unit not ready until fetched
        if !self.sense.is_clear() {
            return Err(CheckCondition);
        }
        Ok(0)
    }

    fn request_sense(&mut self) -> Result<u32, CheckCondition> {
        info!("scsi: REQUEST SENSE");
        if self.cdb.bytes[1] & 0x01 != 0 {
            warn!("scsi: descriptor sense format requested, cannot serve");
            return Err(self.set_sense(SenseKey::IllegalRequest, ASC_ASCQ_INVALID_FIELD_IN_CDB));
        }

        let data = self.sense.encode();
        self.sense = SenseData::no_sense();
        self.write_response(&data)?;
        Ok(FIXED_FORMAT_SENSE_LEN as u32)
    }

    fn format_unit(&mut self) -> Result<u32, CheckCondition> {
        info!("scsi: FORMAT UNIT");
        // required command, meaningless for this medium
        Err(self.set_sense(SenseKey::MediumError, ASC_ASCQ_FORMAT_COMMAND_FAILED))
    }

    fn inquiry(&mut self) -> Result<u32, CheckCondition> {
        info!("scsi: INQUIRY");
        self.write_response(&INQUIRY_DATA)?;
        Ok(INQUIRY_DATA.len() as u32)
    }

    fn mode_sense6(&mut self) -> Result<u32, CheckCondition> {
        info!("scsi: MODE SENSE(6)");
        let page_code = self.cdb.bytes[2] & MODE_PAGE_CODE_MASK;
        let allocation_length = self.cdb.bytes[4] as usize;

        // SPC 4.3.4.6: an allocation length of zero is not an error
        if allocation_length == 0 {
            return Ok(0);
        }

        match page_code {
            MODE_PAGE_RETURN_ALL => {
                let total = MODE_PARAMETER_HEADER_LEN + FLEXIBLE_DISK_PAGE_SIZE;
                self.write_response(&mode_parameter_header(total))?;
                let page = self.flexible_disk_page;
                self.write_response(&page)?;
            }
            _ => {
                // hosts take a bare header as "no such page"
                debug!("scsi: unsupported mode page {}", page_code);
                self.write_response(&mode_parameter_header(MODE_PARAMETER_HEADER_LEN))?;
            }
        }
        Ok(self.io.limit(allocation_length) as u32)
    }

    fn load_unload(&mut self) -> Result<u32, CheckCondition> {
        info!("scsi: LOAD UNLOAD");
        Ok(0)
    }

    fn send_diagnostic(&mut self) -> Result<u32, CheckCondition> {
        info!("scsi: SEND DIAGNOSTIC");
        Ok(0)
    }

    fn prevent_allow_medium_removal(&mut self) -> Result<u32, CheckCondition> {
        info!("scsi: PREVENT ALLOW MEDIUM REMOVAL");
        if self.cdb.bytes[4] & 0x01 != 0 {
            // nothing here can hold the medium in
            return Err(self.set_sense(SenseKey::IllegalRequest, ASC_ASCQ_INVALID_FIELD_IN_CDB));
        }
        Ok(0)
    }

    fn read_format_capacities(&mut self) -> Result<u32, CheckCondition> {
        info!("scsi: READ FORMAT CAPACITIES");
        let allocation_length = be16(&self.cdb.bytes[7..9]) as usize;

        let mut data = [0u8; 12];
        data[3] = 0x08; // one 8-byte capacity descriptor
        put_be32(&mut data[4..8], self.lun.block_count);
        put_be32(
            &mut data[8..12],
            CAPACITY_DESCRIPTOR_TYPE_FORMATTED << 24 | BLOCK_SIZE as u32,
        );
        self.write_response(&data)?;
        Ok(self.io.limit(allocation_length) as u32)
    }

    fn read_capacity10(&mut self) -> Result<u32, CheckCondition> {
        info!("scsi: READ CAPACITY(10)");
        if self.cdb.bytes[8] & 0x01 != 0 {
            warn!("scsi: partial medium indicator set, cannot serve");
            return Err(self.set_sense(SenseKey::IllegalRequest, ASC_ASCQ_INVALID_FIELD_IN_CDB));
        }

        let mut data = [0u8; 8];
        put_be32(&mut data[..4], self.lun.block_count.saturating_sub(1));
        put_be32(&mut data[4..], BLOCK_SIZE as u32);
        self.write_response(&data)?;
        Ok(data.len() as u32)
    }

    fn report_luns(&mut self) -> Result<u32, CheckCondition> {
        info!("scsi: REPORT LUNS");
        let allocation_length = be32(&self.cdb.bytes[6..10]) as usize;
        let count = min(allocation_length, REPORT_LUNS_DATA.len());
        self.write_response(&REPORT_LUNS_DATA[..count])?;
        Ok(count as u32)
    }

    fn read(&mut self) -> Result<u32, CheckCondition> {
        let (lba, count) = self.transfer_params();
        self.stream_read(lba, count)?;
        Ok(count * BLOCK_SIZE as u32)
    }

    fn write(&mut self) -> Result<u32, CheckCondition> {
        let (lba, count) = self.transfer_params();
        // validates the range; no data has arrived yet
        self.stream_write(lba, count)?;
        Ok(count * BLOCK_SIZE as u32)
    }

    /// Fills the IO buffer with blocks from the medium, continuing at
    /// `lba_offset`. Called again for the same CDB whenever the transport
    /// has drained the buffer.
    fn stream_read(&mut self, lba: u32, block_count: u32) -> Result<(), CheckCondition> {
        if self.lba_offset == 0 {
            info!("scsi: READ {} blocks starting at lba {}", block_count, lba);
        }

        if lba
            .checked_add(block_count)
            .map_or(true, |end| end > self.lun.block_count)
        {
            warn!("scsi: read past the end of the unit");
            return Err(self.set_sense(SenseKey::IllegalRequest, ASC_ASCQ_LBA_OUT_OF_RANGE));
        }
        if self.lba_offset == block_count {
            return Ok(());
        }
        if self.lba_offset > block_count {
            error!("scsi: lba offset ran past the transfer");
            return Err(self.set_sense(SenseKey::HardwareError, ASC_ASCQ_NO_ADDITIONAL_SENSE));
        }

        while self.lba_offset < block_count && self.io.available_write() >= BLOCK_SIZE {
            let medium_lba = self.lun.starting_lba + lba + self.lba_offset;
            let (io, storage) = (&mut self.io, &mut self.storage);
            if io
                .write_with(BLOCK_SIZE, |block| storage.read_block(medium_lba, block))
                .is_err()
            {
                error!("scsi: reading lba {} failed", medium_lba);
                return Err(self.set_sense(SenseKey::MediumError, ASC_ASCQ_UNRECOVERED_READ_ERROR));
            }
            self.lba_offset += 1;
        }
        Ok(())
    }

    /// Drains whole blocks from the IO buffer onto the medium, continuing at
    /// `lba_offset`. A trailing partial block is pushed back until the rest
    /// of it arrives.
    fn stream_write(&mut self, lba: u32, block_count: u32) -> Result<(), CheckCondition> {
        if self.lba_offset == 0 && self.io.total() == 0 {
            info!("scsi: WRITE {} blocks starting at lba {}", block_count, lba);
        }

        if lba
            .checked_add(block_count)
            .map_or(true, |end| end > self.lun.block_count)
        {
            warn!("scsi: write past the end of the unit");
            return Err(self.set_sense(SenseKey::IllegalRequest, ASC_ASCQ_LBA_OUT_OF_RANGE));
        }
        if self.lba_offset == block_count {
            return Ok(());
        }
        if self.lba_offset > block_count {
            error!("scsi: lba offset ran past the transfer");
            return Err(self.set_sense(SenseKey::HardwareError, ASC_ASCQ_NO_ADDITIONAL_SENSE));
        }

        while self.lba_offset < block_count {
            let medium_lba = self.lun.starting_lba + lba + self.lba_offset;
            let (io, storage) = (&mut self.io, &mut self.storage);

            let block = io.read(BLOCK_SIZE);
            if block.is_empty() {
                break;
            }
            if block.len() < BLOCK_SIZE {
                let partial = block.len();
                debug!("scsi: holding {} bytes until the block completes", partial);
                io.unread(partial);
                break;
            }
            if storage.write_block(medium_lba, block).is_err() {
                error!("scsi: writing lba {} failed", medium_lba);
                return Err(self.set_sense(
                    SenseKey::MediumError,
                    ASC_ASCQ_PERIPHERAL_DEVICE_WRITE_FAULT,
                ));
            }
            self.lba_offset += 1;
        }
        Ok(())
    }

    fn bytes_committed(&self) -> u32 {
        self.lba_offset * BLOCK_SIZE as u32
    }

    /// Flushes buffered host data to the medium and frees the buffer for the
    /// next run of packets.
    fn flush_writes(&mut self) -> Result<u32, CommitError> {
        if !self.ready {
            self.set_sense(SenseKey::IllegalRequest, ASC_ASCQ_LUN_NOT_READY);
            return Err(CommitError {
                committed: self.bytes_committed(),
            });
        }

        match self.cdb.opcode() {
            WRITE_6 | WRITE_10 => {}
            opcode => {
                error!("scsi: commit for non-write opcode {}", opcode);
                self.set_sense(SenseKey::HardwareError, ASC_ASCQ_NO_ADDITIONAL_SENSE);
                return Err(CommitError {
                    committed: self.bytes_committed(),
                });
            }
        }

        let (lba, count) = self.transfer_params();
        if self.stream_write(lba, count).is_err() {
            return Err(CommitError {
                committed: self.bytes_committed(),
            });
        }

        self.io.reset();
        Ok(self.bytes_committed())
    }
}

impl<D: BlockDevice, Buf: BorrowMut<[u8]>> CommandHandler for ScsiTarget<D, Buf> {
    fn begin(&mut self, cdb: &[u8]) -> Result<u32, CheckCondition> {
        self.validate_cdb(cdb)?;

        self.cdb = Cdb::copy_from(cdb);
        self.lba_offset = 0;
        self.io.reset();

        if !self.may_execute(self.cdb.opcode()) {
            debug!("scsi: unit not ready, rejecting opcode {}", self.cdb.opcode());
            return Err(self.set_sense(SenseKey::IllegalRequest, ASC_ASCQ_LUN_NOT_READY));
        }

        match self.cdb.opcode() {
            TEST_UNIT_READY => self.test_unit_ready(),
            REQUEST_SENSE => self.request_sense(),
            FORMAT_UNIT => self.format_unit(),
            READ_6 | READ_10 => self.read(),
            WRITE_6 | WRITE_10 => self.write(),
            INQUIRY => self.inquiry(),
            MODE_SENSE_6 => self.mode_sense6(),
            LOAD_UNLOAD => self.load_unload(),
            SEND_DIAGNOSTIC => self.send_diagnostic(),
            PREVENT_ALLOW_MEDIUM_REMOVAL => self.prevent_allow_medium_removal(),
            READ_FORMAT_CAPACITIES => self.read_format_capacities(),
            READ_CAPACITY_10 => self.read_capacity10(),
            REPORT_LUNS => self.report_luns(),
            opcode => {
                warn!("scsi: unsupported opcode {}", opcode);
                Err(self.set_sense(SenseKey::IllegalRequest, ASC_ASCQ_INVALID_COMMAND))
            }
        }
    }

    fn to_host(&mut self, max: usize) -> Result<Option<&[u8]>, CheckCondition> {
        if !self.may_execute(self.cdb.opcode()) {
            return Err(self.set_sense(SenseKey::IllegalRequest, ASC_ASCQ_LUN_NOT_READY));
        }
        if matches!(self.cdb.opcode(), WRITE_6 | WRITE_10) {
            error!("scsi: data to host requested for a write command");
            return Err(self.set_sense(SenseKey::HardwareError, ASC_ASCQ_NO_ADDITIONAL_SENSE));
        }

        // a completely filled and completely drained buffer means a
        // streaming read has more blocks to fetch
        if self.io.is_full() && self.io.available_read() == 0 {
            self.io.reset();
            match self.cdb.opcode() {
                READ_6 | READ_10 => {
                    let (lba, count) = self.transfer_params();
                    self.stream_read(lba, count)?;
                }
                opcode => {
                    error!("scsi: buffer filled by non-read opcode {}", opcode);
                    return Err(
                        self.set_sense(SenseKey::HardwareError, ASC_ASCQ_NO_ADDITIONAL_SENSE)
                    );
                }
            }
        }

        let chunk = self.io.read(max);
        if chunk.is_empty() {
            Ok(None)
        } else {
            Ok(Some(chunk))
        }
    }

    fn from_host(&mut self, data: &[u8]) -> Result<(), CheckCondition> {
        if !self.ready {
            return Err(self.set_sense(SenseKey::IllegalRequest, ASC_ASCQ_LUN_NOT_READY));
        }
        if !matches!(self.cdb.opcode(), WRITE_6 | WRITE_10) {
            error!("scsi: data from host for a non-write command");
            return Err(self.set_sense(SenseKey::HardwareError, ASC_ASCQ_NO_ADDITIONAL_SENSE));
        }
        if self.io.write(data).is_err() {
            error!("scsi: io buffer overflow on data from host");
            return Err(self.set_sense(SenseKey::HardwareError, ASC_ASCQ_NO_ADDITIONAL_SENSE));
        }

        // a full buffer flushes immediately to make room for the next packet
        if self.io.is_full() {
            self.flush_writes().map_err(|_| CheckCondition)?;
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<u32, CommitError> {
        self.flush_writes()
    }
}

fn mode_parameter_header(total_len: usize) -> [u8; MODE_PARAMETER_HEADER_LEN] {
    // mode data length counts everything after itself; no block descriptors
    [(total_len - 1) as u8, 0x00, 0x00, 0x00]
}

fn flexible_disk_page(limits: &ChsLimits) -> [u8; FLEXIBLE_DISK_PAGE_SIZE] {
    let mut page = [0u8; FLEXIBLE_DISK_PAGE_SIZE];
    page[0] = FLEXIBLE_DISK_PAGE_CODE;
    page[1] = FLEXIBLE_DISK_PAGE_LEN;
    put_be16(&mut page[2..4], FLEXIBLE_DISK_TRANSFER_RATE);
    page[4] = limits.head_count;
    page[5] = limits.track_sector_count;
    put_be16(&mut page[6..8], BLOCK_SIZE as u16);
    put_be16(&mut page[8..10], limits.cylinder_count);
    page
}
