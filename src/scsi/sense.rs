//! Fixed-format sense data (SPC 4.5.3)
//!
//! A single latch holds the cause of the most recent command failure.
//! Setting it overwrites whatever was there; REQUEST SENSE returns and
//! clears it.

use crate::endian::put_be16;
use num_enum::TryFromPrimitive;

/// On-wire length of the fixed-format record served to the host.
pub const FIXED_FORMAT_SENSE_LEN: usize = 18;

const RESPONSE_CODE_CURRENT_FIXED: u8 = 0x70;
const ADDITIONAL_SENSE_LEN: u8 = 0x0a;

/* ASC/ASCQ assignments, SPC 4.5.6, packed big-endian on the wire */
pub const ASC_ASCQ_NO_ADDITIONAL_SENSE: u16 = 0x0000;
pub const ASC_ASCQ_PERIPHERAL_DEVICE_WRITE_FAULT: u16 = 0x0300;
pub const ASC_ASCQ_LUN_NOT_READY: u16 = 0x0400;
pub const ASC_ASCQ_UNRECOVERED_READ_ERROR: u16 = 0x1100;
pub const ASC_ASCQ_INVALID_COMMAND: u16 = 0x2000;
pub const ASC_ASCQ_LBA_OUT_OF_RANGE: u16 = 0x2100;
pub const ASC_ASCQ_INVALID_FIELD_IN_CDB: u16 = 0x2400;
pub const ASC_ASCQ_MEDIUM_MAY_HAVE_CHANGED: u16 = 0x2800;
pub const ASC_ASCQ_FORMAT_COMMAND_FAILED: u16 = 0x3101;
pub const ASC_ASCQ_MEDIUM_NOT_PRESENT: u16 = 0x3a00;

/// Sense key, SPC 4.5.6 Table 27
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SenseKey {
    NoSense = 0x00,
    RecoveredError = 0x01,
    NotReady = 0x02,
    MediumError = 0x03,
    HardwareError = 0x04,
    IllegalRequest = 0x05,
    UnitAttention = 0x06,
    DataProtect = 0x07,
    BlankCheck = 0x08,
    AbortedCommand = 0x0b,
}

pub(crate) struct SenseData {
    key: SenseKey,
    asc_ascq: u16,
}

impl SenseData {
    pub const fn no_sense() -> Self {
        SenseData {
            key: SenseKey::NoSense,
            asc_ascq: ASC_ASCQ_NO_ADDITIONAL_SENSE,
        }
    }

    pub fn set(&mut self, key: SenseKey, asc_ascq: u16) {
        self.key = key;
        self.asc_ascq = asc_ascq;
    }

    pub fn is_clear(&self) -> bool {
        matches!(self.key, SenseKey::NoSense) && self.asc_ascq == ASC_ASCQ_NO_ADDITIONAL_SENSE
    }

    #[cfg(test)]
    pub fn key(&self) -> SenseKey {
        self.key
    }

    #[cfg(test)]
    pub fn asc_ascq(&self) -> u16 {
        self.asc_ascq
    }

    /// Serialises the latch into the 18-byte fixed-format record.
    pub fn encode(&self) -> [u8; FIXED_FORMAT_SENSE_LEN] {
        let mut data = [0u8; FIXED_FORMAT_SENSE_LEN];
        data[0] = RESPONSE_CODE_CURRENT_FIXED;
        data[2] = self.key as u8 & 0x0f;
        data[7] = ADDITIONAL_SENSE_LEN;
        put_be16(&mut data[12..14], self.asc_ascq);
        data
    }
}
