//! USB Mass Storage device for [usb-device]
//!
//! A self-contained SCSI direct-access target (removable medium, 512-byte
//! blocks) exposed over the Bulk Only Transport. Point it at anything that
//! implements [BlockDevice] — an SD card, a flash region, a RAM disk — and
//! the host sees a standard removable drive.
//!
//! The crate owns the whole class-protocol surface:
//! * Bulk Only Transport phase machine (CBW / DATA / CSW, stall policy,
//!   residue accounting) — [bbb]
//! * SCSI command set: INQUIRY, REQUEST SENSE, TEST UNIT READY, MODE
//!   SENSE(6), READ CAPACITY(10), READ FORMAT CAPACITIES, REPORT LUNS,
//!   READ(6)/(10), WRITE(6)/(10) and friends — [scsi]
//! * Class-specific control requests (GET MAX LUN, Bulk-Only Mass Storage
//!   Reset) — [Scsi]
//!
//! # Features
//! | Feature | Description                           |
//! | ------- |---------------------------------------|
//! | `defmt` | Enable logging via [defmt](https://crates.io/crates/defmt) crate |
//!
//! [usb-device]: https://crates.io/crates/usb-device
//! [BlockDevice]: crate::storage::BlockDevice
//! [bbb]: crate::transport::bbb
//! [scsi]: crate::scsi
//! [Scsi]: crate::subclass::scsi::Scsi

#![no_std]

pub(crate) mod buffer;
pub(crate) mod chs;
pub(crate) mod endian;
pub(crate) mod fmt;
pub mod scsi;
pub mod storage;
pub mod subclass;
pub mod transport;

/// USB Mass Storage Class code
pub const CLASS_MASS_STORAGE: u8 = 0x08;
