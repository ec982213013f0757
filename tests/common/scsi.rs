//! Host-side CDB builders.

use usbd_msd::scsi;

pub fn test_unit_ready() -> Vec<u8> {
    vec![scsi::TEST_UNIT_READY, 0, 0, 0, 0, 0]
}

pub fn request_sense(alloc_len: u8) -> Vec<u8> {
    vec![scsi::REQUEST_SENSE, 0, 0, 0, alloc_len, 0]
}

pub fn inquiry(alloc_len: u16) -> Vec<u8> {
    let alloc = alloc_len.to_be_bytes();
    vec![scsi::INQUIRY, 0, 0, alloc[0], alloc[1], 0]
}

pub fn mode_sense6(page_code: u8, alloc_len: u8) -> Vec<u8> {
    vec![scsi::MODE_SENSE_6, 0, page_code, 0, alloc_len, 0]
}

pub fn prevent_allow_medium_removal(prevent: u8) -> Vec<u8> {
    vec![scsi::PREVENT_ALLOW_MEDIUM_REMOVAL, 0, 0, 0, prevent, 0]
}

pub fn read_capacity10() -> Vec<u8> {
    vec![scsi::READ_CAPACITY_10, 0, 0, 0, 0, 0, 0, 0, 0, 0]
}

pub fn report_luns(alloc_len: u32) -> Vec<u8> {
    let mut cdb = vec![0u8; 12];
    cdb[0] = scsi::REPORT_LUNS;
    cdb[6..10].copy_from_slice(&alloc_len.to_be_bytes());
    cdb
}

pub fn read6(lba: u32, blocks: u8) -> Vec<u8> {
    vec![
        scsi::READ_6,
        ((lba >> 16) & 0x1f) as u8,
        (lba >> 8) as u8,
        lba as u8,
        blocks,
        0,
    ]
}

pub fn read10(lba: u32, blocks: u16) -> Vec<u8> {
    cdb10(scsi::READ_10, lba, blocks)
}

pub fn write10(lba: u32, blocks: u16) -> Vec<u8> {
    cdb10(scsi::WRITE_10, lba, blocks)
}

/// An opcode nothing dispatches.
pub fn unknown() -> Vec<u8> {
    vec![0xff; 12]
}

fn cdb10(opcode: u8, lba: u32, blocks: u16) -> Vec<u8> {
    let mut cdb = vec![0u8; 10];
    cdb[0] = opcode;
    cdb[2..6].copy_from_slice(&lba.to_be_bytes());
    cdb[7..9].copy_from_slice(&blocks.to_be_bytes());
    cdb
}
