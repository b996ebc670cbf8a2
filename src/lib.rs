//! Integrity checker for the bad-block metadata of CPX00 NAND flash dumps.
//!
//! The CPX00 stores its firmware and data on an ST-Micro NAND512W3A2C
//! managed by the Datalight FlashFX driver, which sets aside 96 blocks at
//! the end of the device for bad-block replacement. This crate inspects a
//! raw dump of such a device and diagnoses whether the factory bad-block
//! markers, the two redundant BBM header copies, and their replacement
//! maps all tell a consistent story.
//!
//! The analysis runs in three stages over one [`session::ScanSession`]:
//! the factory-marker scan ([`badblocks`]), the dual header decode
//! ([`bbm::scan`]), and the three-way reconciliation ([`bbm::validate`]).
//! Independent byte-pattern passes ([`detect`]) can be run over the same
//! image as additional diagnostics.

pub mod badblocks;
pub mod bbm;
pub mod cursor;
pub mod detect;
pub mod geometry;
pub mod report;
pub mod session;

use thiserror::Error;

/// Errors that abort a scan stage.
///
/// Consistency problems (parity failures, unexpected constants, map
/// mismatches) are findings, not errors; they go to the report and the
/// scan continues.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The data ended inside a fixed-layout read.
    #[error("unexpected end of data at offset {0:08X}")]
    UnexpectedEof(u32),

    /// The fixed field block could not be decoded.
    #[error("malformed BBM header: {0}")]
    Header(#[from] deku::DekuError),

    /// Both signature search passes came up empty.
    #[error("BBM header signature not found")]
    SignatureNotFound,
}
