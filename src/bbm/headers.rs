//! The on-device BBM header record.
//!
//! FlashFX stores two redundant copies of its bad-block metadata near the
//! end of the device, each introduced by an 8-byte signature and a fixed
//! little-endian field block, followed by the replacement map: one 32-bit
//! slot per reserved block. Scalar fields carry an odd-parity bit in their
//! top position; map slots are either sentinel constants or a block index
//! with bit 31 set.

use deku::prelude::*;

/// The 8-byte signature introducing each BBM header copy.
pub const BBM_SIGNATURE: [u8; 8] = [0xDB, 0xC0, 0x95, 0x77, 0x7A, 0x5C, 0xF7, 0x2C];

/// Replacement-map capacity of the reserved area on a NAND512 device.
pub const MAP_CAPACITY: usize = 96;

pub const FREE_SPARE_MARKER: u32 = 0xFFFF_FFFF;
pub const HEADER_BLOCK_MARKER: u32 = 0x7FFF_FFFF;
pub const FACTORY_BAD_MARKER: u32 = 0x7FFF_FFFE;
pub const RESERVED_MARKER_1: u32 = 0x7FFF_FFFD;
pub const RESERVED_MARKER_2: u32 = 0x7FFF_FFFC;

/// Expected field values for a well-formed NAND512 BBM header.
pub const EXPECTED_DATA_BLOCKS: u32 = 0x8000_0FA0;
pub const EXPECTED_BLOCK_SIZE: u16 = 0x4000;
pub const EXPECTED_MAP_SIZE: u16 = 512;
pub const EXPECTED_IN_PROGRESS: u16 = 0xFFFF;
pub const EXPECTED_RESERVED: u16 = 0xFFFF;

/// The fixed field block immediately following the signature.
#[derive(Debug, Copy, Clone, Eq, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct RawBbmHeader {
    pub data_blocks: u32,
    pub block_size: u16,
    pub status: u16,
    pub data_blocks_copy: u32,
    pub block_size_copy: u16,
    pub map_size: u16,
    pub in_progress_idx: u16,
    pub spare_blocks: u16,
    pub spare_blocks_copy: u16,
    pub reserved: u16,
}

impl RawBbmHeader {
    /// Encoded size of the fixed field block.
    pub const SIZE: usize = 24;

    /// Number of replacement-map entries implied by the spare-block count.
    ///
    /// Both copies must agree and the masked value must be plausible;
    /// otherwise the reserved-area capacity is assumed. The result may
    /// still exceed [`MAP_CAPACITY`]; the decoder validates that
    /// explicitly.
    pub fn map_len(&self) -> usize {
        let spares = self.spare_blocks & 0x7FFF;
        if self.spare_blocks == self.spare_blocks_copy && spares < 1000 {
            spares as usize
        } else {
            MAP_CAPACITY
        }
    }
}

/// Odd-parity property of a field whose top bit is the parity bit: the
/// total set-bit count, parity bit included, must be odd.
pub trait ParityCheck {
    fn has_odd_parity(&self) -> bool;
}

impl ParityCheck for u16 {
    fn has_odd_parity(&self) -> bool {
        self.count_ones() & 1 == 1
    }
}

impl ParityCheck for u32 {
    fn has_odd_parity(&self) -> bool {
        self.count_ones() & 1 == 1
    }
}

/// Classification of one replacement-map slot.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Marker {
    /// Spare block not yet consumed by a replacement.
    FreeSpare,

    /// The spare block holding the BBM header itself.
    HeaderBlock,

    /// Factory-bad block inside the reserved area.
    FactoryBad,

    /// Reserved sentinel value.
    Reserved,

    /// This spare replaces the given data-area block.
    Replacement(u32),

    /// No valid interpretation of the bit pattern.
    Malformed,
}

impl Marker {
    /// Classify a raw 32-bit map slot. Pure function of the bit pattern.
    pub fn classify(raw: u32) -> Self {
        match raw {
            FREE_SPARE_MARKER => Self::FreeSpare,
            HEADER_BLOCK_MARKER => Self::HeaderBlock,
            FACTORY_BAD_MARKER => Self::FactoryBad,
            RESERVED_MARKER_1 | RESERVED_MARKER_2 => Self::Reserved,
            raw if raw & 0x8000_0000 != 0 => Self::Replacement(raw & 0x7FFF_FFFF),
            _ => Self::Malformed,
        }
    }

    /// Whether this slot stands for an actual replaced block (counted when
    /// comparing against the bad-block table).
    pub fn is_real_entry(&self) -> bool {
        matches!(self, Self::Replacement(_) | Self::FactoryBad)
    }
}

/// One decoded BBM header copy.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BbmHeader {
    /// Absolute offset of the signature within the image.
    pub offset: u32,

    /// The fixed field block.
    pub fields: RawBbmHeader,

    /// Raw replacement-map slots, in map order.
    pub map: Vec<u32>,
}

impl BbmHeader {
    /// Number of map slots standing for actual replaced blocks.
    pub fn real_entries(&self) -> usize {
        self.map
            .iter()
            .filter(|&&raw| Marker::classify(raw).is_real_entry())
            .count()
    }
}

#[test]
fn test_parity() {
    // 0x8000_0FA0: parity bit set, 6 data bits set -> 7 total, odd.
    assert!(0x8000_0FA0u32.has_odd_parity());
    assert!(!0x0000_0FA0u32.has_odd_parity());

    assert!(0x4000u16.has_odd_parity());
    assert!(!0xC000u16.has_odd_parity());
    assert!(!0x0000u16.has_odd_parity());
    assert!(!0xFFFFu16.has_odd_parity());
}

#[test]
fn test_marker_classification() {
    assert_eq!(Marker::classify(0xFFFF_FFFF), Marker::FreeSpare);
    assert_eq!(Marker::classify(0x7FFF_FFFF), Marker::HeaderBlock);
    assert_eq!(Marker::classify(0x7FFF_FFFE), Marker::FactoryBad);
    assert_eq!(Marker::classify(0x7FFF_FFFD), Marker::Reserved);
    assert_eq!(Marker::classify(0x7FFF_FFFC), Marker::Reserved);
    assert_eq!(Marker::classify(0x8000_0003), Marker::Replacement(3));
    assert_eq!(Marker::classify(0x8000_0000), Marker::Replacement(0));
    assert_eq!(Marker::classify(0x0000_0123), Marker::Malformed);

    assert!(Marker::classify(0x8000_0003).is_real_entry());
    assert!(Marker::classify(0x7FFF_FFFE).is_real_entry());
    assert!(!Marker::classify(0xFFFF_FFFF).is_real_entry());
}

#[test]
fn test_map_len_derivation() {
    let mut raw = RawBbmHeader {
        data_blocks: EXPECTED_DATA_BLOCKS,
        block_size: EXPECTED_BLOCK_SIZE,
        status: 0,
        data_blocks_copy: EXPECTED_DATA_BLOCKS,
        block_size_copy: EXPECTED_BLOCK_SIZE,
        map_size: EXPECTED_MAP_SIZE,
        in_progress_idx: EXPECTED_IN_PROGRESS,
        spare_blocks: 96,
        spare_blocks_copy: 96,
        reserved: EXPECTED_RESERVED,
    };
    assert_eq!(raw.map_len(), 96);

    // Copies disagree: fall back to capacity.
    raw.spare_blocks_copy = 95;
    assert_eq!(raw.map_len(), MAP_CAPACITY);

    // Masked value out of range: fall back to capacity.
    raw.spare_blocks = 1000;
    raw.spare_blocks_copy = 1000;
    assert_eq!(raw.map_len(), MAP_CAPACITY);

    // The parity bit does not contribute to the count, but both copies
    // must match bit-for-bit.
    raw.spare_blocks = 0x8000 | 42;
    raw.spare_blocks_copy = 0x8000 | 42;
    assert_eq!(raw.map_len(), 42);
}

#[test]
fn test_raw_header_layout() -> anyhow::Result<()> {
    let raw = RawBbmHeader {
        data_blocks: 0x8000_0FA0,
        block_size: 0x4000,
        status: 0x0000,
        data_blocks_copy: 0x8000_0FA0,
        block_size_copy: 0x4000,
        map_size: 512,
        in_progress_idx: 0xFFFF,
        spare_blocks: 96,
        spare_blocks_copy: 96,
        reserved: 0xFFFF,
    };

    let bytes = raw.to_bytes()?;
    assert_eq!(bytes.len(), RawBbmHeader::SIZE);
    // Little-endian field order: data blocks first...
    assert_eq!(&bytes[..4], &[0xA0, 0x0F, 0x00, 0x80]);
    // ...block size and status next...
    assert_eq!(&bytes[4..8], &[0x00, 0x40, 0x00, 0x00]);
    // ...reserved word last.
    assert_eq!(&bytes[22..], &[0xFF, 0xFF]);

    let (_, decoded) = RawBbmHeader::from_bytes((bytes.as_slice(), 0))?;
    assert_eq!(decoded, raw);
    Ok(())
}
