//! USB Mass Storage transport

use crate::scsi::{CheckCondition, CommitError};

pub mod bbb;

/// The status of a Mass Storage command.
///
/// Refer to the USB-MS doc.
#[repr(u8)]
#[derive(Default, Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandStatus {
    #[default]
    Passed = 0x00,
    Failed = 0x01,
    PhaseError = 0x02,
}

/// The command-set side of a transport: everything the transport needs to
/// run the DATA phase of one command at a time.
///
/// A failed call latches sense data on the handler; the transport only
/// translates the failure into a CSW and leaves retrieval of the cause to a
/// later REQUEST SENSE.
pub trait CommandHandler {
    /// Starts a new command. Returns the number of bytes the handler will
    /// produce or consume during the DATA phase (0 = no DATA phase).
    fn begin(&mut self, cdb: &[u8]) -> Result<u32, CheckCondition>;

    /// Hands out the next device→host byte run, at most `max` bytes.
    /// `Ok(None)` means the command has no more data. The borrow is valid
    /// until the next call on the handler.
    fn to_host(&mut self, max: usize) -> Result<Option<&[u8]>, CheckCondition>;

    /// Accepts the next host→device byte run.
    fn from_host(&mut self, data: &[u8]) -> Result<(), CheckCondition>;

    /// Flushes completed blocks of host data to the medium and reports the
    /// total bytes written for this command, even on failure.
    fn commit(&mut self) -> Result<u32, CommitError>;
}
