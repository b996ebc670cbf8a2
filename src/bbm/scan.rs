//! Locating and decoding the two BBM header copies.
//!
//! The headers live in the reserved area at the end of the device, so the
//! search starts at 97.5% of the image and scans forward for the 8-byte
//! signature. If the data runs out before a signature turns up, the caller
//! may authorize one retry from offset 0 (useful on partial dumps); a
//! second miss is fatal to header decoding.

use crate::cursor::{ByteCursor, ByteOffset};
use crate::geometry::DeviceGeometry;
use crate::report::Report;
use crate::ScanError;

use super::headers::{
    BbmHeader, Marker, ParityCheck, RawBbmHeader, BBM_SIGNATURE, EXPECTED_BLOCK_SIZE,
    EXPECTED_DATA_BLOCKS, EXPECTED_IN_PROGRESS, EXPECTED_MAP_SIZE, EXPECTED_RESERVED,
    MAP_CAPACITY,
};

use bytes::Buf;
use deku::DekuContainerRead;

use std::io::{Read, Seek};

/// Exact-match automaton for the header signature.
///
/// Any mismatch resets to the initial state; the mismatched byte is
/// consumed, not re-examined (so an overlapping prefix does not resync).
#[derive(Debug, Default)]
struct SigMatcher {
    matched: usize,
    start: ByteOffset,
}

impl SigMatcher {
    /// Feed one byte; returns the signature's start offset on a full match.
    fn step(&mut self, offset: ByteOffset, byte: u8) -> Option<ByteOffset> {
        if self.matched == 0 {
            if byte == BBM_SIGNATURE[0] {
                self.start = offset;
                self.matched = 1;
            }
        } else if byte == BBM_SIGNATURE[self.matched] {
            self.matched += 1;
            if self.matched == BBM_SIGNATURE.len() {
                self.matched = 0;
                return Some(self.start);
            }
        } else {
            self.matched = 0;
        }

        None
    }
}

/// Decode both BBM header copies, low table first.
///
/// `confirm_retry` is consulted at most once, when the signature search
/// exhausts the data without a match.
pub fn decode_headers<R: Read + Seek>(
    cursor: &mut ByteCursor<R>,
    geometry: &DeviceGeometry,
    report: &mut Report,
    mut confirm_retry: impl FnMut() -> bool,
) -> Result<(BbmHeader, BbmHeader), ScanError> {
    // Position within the last 2.5% of the image.
    let start = (u64::from(cursor.len()) * 975 / 1000) as ByteOffset;
    cursor.seek(start)?;

    let mut retried = false;

    let offset = find_signature(cursor, report, &mut retried, &mut confirm_retry)?;
    let low = decode_one(cursor, geometry, report, offset, 0)?;

    let offset = find_signature(cursor, report, &mut retried, &mut confirm_retry)?;
    let high = decode_one(cursor, geometry, report, offset, 1)?;

    Ok((low, high))
}

/// Scan forward from the current position for the next signature.
fn find_signature<R: Read + Seek>(
    cursor: &mut ByteCursor<R>,
    report: &mut Report,
    retried: &mut bool,
    confirm_retry: &mut dyn FnMut() -> bool,
) -> Result<ByteOffset, ScanError> {
    let mut matcher = SigMatcher::default();

    loop {
        match cursor.read_byte()? {
            Some(byte) => {
                if let Some(offset) = matcher.step(cursor.position() - 1, byte) {
                    return Ok(offset);
                }
            }
            None if !*retried => {
                report.line("BBM header signature not found!")?;
                if !confirm_retry() {
                    return Err(ScanError::SignatureNotFound);
                }
                *retried = true;
                matcher = SigMatcher::default();
                cursor.seek(0)?;
            }
            None => {
                report.line("BBM header signature not found during retry!")?;
                return Err(ScanError::SignatureNotFound);
            }
        }
    }
}

/// Decode one header copy starting right after its signature, reporting
/// every field check and map-entry classification along the way.
fn decode_one<R: Read + Seek>(
    cursor: &mut ByteCursor<R>,
    geometry: &DeviceGeometry,
    report: &mut Report,
    sig_offset: ByteOffset,
    headers_seen: usize,
) -> Result<BbmHeader, ScanError> {
    let block = sig_offset / geometry.bytes_per_block();
    report.line(&format!(
        "Found BBM header at: {sig_offset:08X}, block {block:X} ({block})"
    ))?;

    let mut fixed = [0u8; RawBbmHeader::SIZE];
    if !cursor.read_into(&mut fixed)? {
        return Err(ScanError::UnexpectedEof(cursor.position()));
    }
    let (_, fields) = RawBbmHeader::from_bytes((&fixed[..], 0))?;

    report_fields(report, &fields, headers_seen)?;

    let wanted = fields.map_len();
    let take = wanted.min(MAP_CAPACITY);
    if wanted > MAP_CAPACITY {
        report.line(&format!(
            "Spare count implies {wanted} map entries but the reserved area holds {MAP_CAPACITY}; reading {MAP_CAPACITY}"
        ))?;
    }

    let mut raw_map = vec![0u8; take * 4];
    if !cursor.read_into(&mut raw_map)? {
        return Err(ScanError::UnexpectedEof(cursor.position()));
    }
    let mut buf = &raw_map[..];
    let mut map = Vec::with_capacity(take);
    while buf.has_remaining() {
        map.push(buf.get_u32_le());
    }

    report.line(&format!("Map({headers_seen}) entries:"))?;
    for (idx, &raw) in map.iter().enumerate() {
        let verdict = match Marker::classify(raw) {
            Marker::HeaderBlock => "OK (BBM header block)",
            Marker::FactoryBad => "OK (factory bad block in spare area)",
            Marker::Reserved => "RESERVED!!",
            Marker::FreeSpare => "OK (free spare block)",
            Marker::Replacement(_) => "OK",
            Marker::Malformed => "Bad!!",
        };
        report.line(&format!("{idx:2}: {raw:08X} {verdict}"))?;
    }

    Ok(BbmHeader {
        offset: sig_offset,
        fields,
        map,
    })
}

fn report_fields(
    report: &mut Report,
    fields: &RawBbmHeader,
    headers_seen: usize,
) -> Result<(), ScanError> {
    let blocks = fields.data_blocks;
    report.line(&format!(
        "Number of data blocks= {:08X} ({}), parity is {}",
        blocks & 0x7FFF_FFFF,
        blocks & 0x7FFF_FFFF,
        ok_bad(blocks.has_odd_parity())
    ))?;
    report.line(&format!(
        " Value for number of data blocks is {}",
        as_expected(blocks == EXPECTED_DATA_BLOCKS)
    ))?;

    let size = fields.block_size;
    report.line(&format!(
        "Data block size= {:04X} ({}), parity is {}",
        size & 0x7FFF,
        size & 0x7FFF,
        ok_bad(size.has_odd_parity())
    ))?;
    report.line(&format!(
        " Value for data block size is {}",
        as_expected(size == EXPECTED_BLOCK_SIZE)
    ))?;

    match (fields.status, headers_seen) {
        (0x0000, 0) => report.line("This is the LOW table")?,
        (0x0000, _) => {
            report.line("Header status is BAD, the low table has already been located!!")?
        }
        (0xFFFF, 0) => report.line("Header status is BAD, the low table HAS NOT been located!!")?,
        (0xFFFF, _) => report.line("This is the HIGH table")?,
        (status, _) => report.line(&format!(
            "Header status is BAD, unknown value found ({status:04X})!!"
        ))?,
    }

    let copy = fields.data_blocks_copy;
    report.line(&format!(
        "Copy of number of data blocks= {:08X} ({}), parity is {}",
        copy & 0x7FFF_FFFF,
        copy & 0x7FFF_FFFF,
        ok_bad(copy.has_odd_parity())
    ))?;
    report.line(&format!(
        " Value for copy of number of data blocks is {}",
        as_expected(copy == EXPECTED_DATA_BLOCKS)
    ))?;
    report.line(&format!(
        " Number of blocks {}",
        matching((blocks & 0x7FFF_FFFF) == (copy & 0x7FFF_FFFF))
    ))?;

    let copy = fields.block_size_copy;
    report.line(&format!(
        "Copy of data block size= {:04X} ({}), parity is {}",
        copy & 0x7FFF,
        copy & 0x7FFF,
        ok_bad(copy.has_odd_parity())
    ))?;
    report.line(&format!(
        " Value for copy of data block size is {}",
        as_expected(copy == EXPECTED_BLOCK_SIZE)
    ))?;
    report.line(&format!(
        " Block sizes {}",
        matching((size & 0x7FFF) == (copy & 0x7FFF))
    ))?;

    let map_size = fields.map_size;
    report.line(&format!(
        "Map size= {map_size:04X} ({map_size}), parity is {}",
        ok_bad(map_size.has_odd_parity())
    ))?;
    report.line(&format!(
        " Value for map size is {}",
        as_expected(map_size == EXPECTED_MAP_SIZE)
    ))?;

    let in_progress = fields.in_progress_idx;
    report.line(&format!(
        "In-progress index= {in_progress:04X} ({in_progress}), parity is {}",
        ok_bad(in_progress.has_odd_parity())
    ))?;
    report.line(&format!(
        " Value for in-progress index is {}",
        as_expected(in_progress == EXPECTED_IN_PROGRESS)
    ))?;

    let spares = fields.spare_blocks;
    report.line(&format!(
        "Number of spare blocks= {:04X} ({}), parity is {}",
        spares & 0x7FFF,
        spares & 0x7FFF,
        ok_bad(spares.has_odd_parity())
    ))?;
    report.line(&format!(
        " Value for spare blocks is {}",
        as_expected(plausible_spares(spares))
    ))?;

    let copy = fields.spare_blocks_copy;
    report.line(&format!(
        "Copy of number of spare blocks= {:04X} ({}), parity is {}",
        copy & 0x7FFF,
        copy & 0x7FFF,
        ok_bad(copy.has_odd_parity())
    ))?;
    report.line(&format!(
        " Value for copy of spare blocks is {}",
        as_expected(plausible_spares(copy))
    ))?;
    report.line(&format!(
        " Number of spare blocks {}",
        matching((spares & 0x7FFF) == (copy & 0x7FFF))
    ))?;

    let reserved = fields.reserved;
    report.line(&format!(
        "Reserved entry= {reserved:04X} ({reserved}), parity is {}",
        ok_bad(reserved.has_odd_parity())
    ))?;
    report.line(&format!(
        " Value for reserved entry is {}",
        as_expected(reserved == EXPECTED_RESERVED)
    ))?;

    Ok(())
}

fn plausible_spares(raw: u16) -> bool {
    let spares = raw & 0x7FFF;
    spares != 0 && spares < 1000
}

fn ok_bad(ok: bool) -> &'static str {
    if ok {
        "Ok"
    } else {
        "bad!!"
    }
}

fn as_expected(ok: bool) -> &'static str {
    if ok {
        "as expected"
    } else {
        "not as expected!!"
    }
}

fn matching(ok: bool) -> &'static str {
    if ok {
        "match"
    } else {
        "do not match!!"
    }
}

#[cfg(test)]
use crate::bbm::testimg;
#[cfg(test)]
use std::cell::Cell;

#[cfg(test)]
const TEST_GEOMETRY: DeviceGeometry = DeviceGeometry {
    blocks: 64,
    pages_per_block: 2,
    bytes_per_page_main: 64,
    bytes_per_page_spare: 16,
};

#[cfg(test)]
fn match_signature(bytes: &[u8]) -> Option<ByteOffset> {
    let mut matcher = SigMatcher::default();
    bytes
        .iter()
        .enumerate()
        .find_map(|(i, &b)| matcher.step(i as ByteOffset, b))
}

#[test]
fn test_signature_match() {
    let mut bytes = vec![0x00, 0xDB, 0x11];
    bytes.extend(BBM_SIGNATURE);
    assert_eq!(match_signature(&bytes), Some(3));
}

#[test]
fn test_signature_mismatch_consumes_byte() {
    // An overlapping prefix does not resync: the second 0xDB is consumed
    // by the failed match, so this sequence never matches.
    let mut bytes = vec![0xDB];
    bytes.extend(BBM_SIGNATURE);
    bytes.truncate(8);
    assert_eq!(match_signature(&bytes), None);

    // ...but a clean restart afterward still does.
    let mut bytes = vec![0xDB, 0xDB, 0x00];
    bytes.extend(BBM_SIGNATURE);
    assert_eq!(match_signature(&bytes), Some(3));
}

#[test]
fn test_decode_pair() -> anyhow::Result<()> {
    let map = [
        super::headers::HEADER_BLOCK_MARKER,
        0x8000_0003,
        super::headers::FREE_SPARE_MARKER,
    ];

    let mut builder = testimg::ImageBuilder::for_geometry(&TEST_GEOMETRY);
    builder
        .header(10_020, &testimg::fields(0x0000, 3), &map)
        .header(10_120, &testimg::fields(0xFFFF, 3), &map);
    let mut cursor = builder.into_cursor();

    let mut report = Report::new();
    let (low, high) = decode_headers(&mut cursor, &TEST_GEOMETRY, &mut report, || {
        unreachable!("no retry expected")
    })?;

    assert_eq!(low.offset, 10_020);
    assert_eq!(high.offset, 10_120);
    assert_eq!(low.fields.status, 0x0000);
    assert_eq!(high.fields.status, 0xFFFF);
    assert_eq!(low.map, map);
    assert_eq!(high.map, map);
    assert_eq!(low.real_entries(), 1);
    Ok(())
}

#[test]
fn test_retry_declined() -> anyhow::Result<()> {
    let mut cursor = testimg::ImageBuilder::erased(2048).into_cursor();
    let mut report = Report::new();

    let asked = Cell::new(0);
    let result = decode_headers(&mut cursor, &TEST_GEOMETRY, &mut report, || {
        asked.set(asked.get() + 1);
        false
    });

    assert!(matches!(result, Err(ScanError::SignatureNotFound)));
    assert_eq!(asked.get(), 1);
    Ok(())
}

#[test]
fn test_retry_rescans_from_start() -> anyhow::Result<()> {
    // Headers live early in the image, before the 97.5% starting point, so
    // only the confirmed retry finds them.
    let map = [0x8000_0001, super::headers::FREE_SPARE_MARKER];

    let mut builder = testimg::ImageBuilder::erased(4096);
    builder
        .header(100, &testimg::fields(0x0000, 2), &map)
        .header(200, &testimg::fields(0xFFFF, 2), &map);
    let mut cursor = builder.into_cursor();

    let mut report = Report::new();
    let asked = Cell::new(0);
    let (low, high) = decode_headers(&mut cursor, &TEST_GEOMETRY, &mut report, || {
        asked.set(asked.get() + 1);
        true
    })?;

    assert_eq!(asked.get(), 1);
    assert_eq!(low.offset, 100);
    assert_eq!(high.offset, 200);
    Ok(())
}

#[test]
fn test_truncated_header_is_an_error() -> anyhow::Result<()> {
    // Signature right at the end of the data: the fixed fields can't be
    // read.
    let mut bytes = vec![0xFFu8; 1024];
    bytes[1014..1022].copy_from_slice(&BBM_SIGNATURE);

    let mut cursor = ByteCursor::new(std::io::Cursor::new(bytes))?;
    let mut report = Report::new();
    let result = decode_headers(&mut cursor, &TEST_GEOMETRY, &mut report, || false);
    assert!(matches!(result, Err(ScanError::UnexpectedEof(_))));
    Ok(())
}
