//! One scan session over one device image.
//!
//! The session owns every per-run resource: the cursor over the byte
//! source, the device geometry, and the report fan-out. Nothing survives
//! between runs; two sessions over the same image produce identical
//! findings.

use crate::badblocks::{find_bad_blocks, BadBlockTable};
use crate::bbm::{cross_validate, decode_headers};
use crate::cursor::ByteCursor;
use crate::detect::{scan_ascending_runs, scan_constant_runs};
use crate::geometry::DeviceGeometry;
use crate::report::Report;
use crate::ScanError;

use std::io::{self, Read, Seek};

#[derive(Debug)]
pub struct ScanSession<R> {
    cursor: ByteCursor<R>,
    geometry: DeviceGeometry,
    report: Report,
}

impl<R: Read + Seek> ScanSession<R> {
    pub fn new(source: R, geometry: DeviceGeometry, report: Report) -> io::Result<Self> {
        Ok(Self {
            cursor: ByteCursor::new(source)?,
            geometry,
            report,
        })
    }

    /// The full bad-block analysis: marker scan, dual header decode,
    /// cross-validation.
    ///
    /// Stage failures degrade rather than abort: a truncated image yields
    /// a partial table, a missing or malformed header leaves the table
    /// findings standing and skips validation. The returned table carries
    /// the per-block match results.
    pub fn check_bad_blocks(
        &mut self,
        confirm_retry: impl FnMut() -> bool,
    ) -> Result<BadBlockTable, ScanError> {
        let mut table = find_bad_blocks(&mut self.cursor, &self.geometry, &mut self.report)?;

        match decode_headers(
            &mut self.cursor,
            &self.geometry,
            &mut self.report,
            confirm_retry,
        ) {
            Ok((low, high)) => {
                cross_validate(&low, &high, &mut table, &mut self.report)?;
            }
            // Both search passes came up empty; that was already reported.
            Err(ScanError::SignatureNotFound) => (),
            Err(e) => {
                self.report
                    .line(&format!("BBM header decode aborted: {e}"))?;
            }
        }

        Ok(table)
    }

    /// Optional pass: runs of the 0xE7 fill byte, 7 bytes or longer.
    pub fn find_e7_runs(&mut self) -> Result<(), ScanError> {
        scan_constant_runs(&mut self.cursor, &mut self.report, "E7", 0xE7, 7, true)
    }

    /// Optional pass: zero runs, 13 bytes or longer, reported only once
    /// complete.
    pub fn find_zero_runs(&mut self) -> Result<(), ScanError> {
        scan_constant_runs(&mut self.cursor, &mut self.report, "Zeros", 0x00, 13, false)
    }

    /// Optional pass: strictly-incrementing byte sequences.
    pub fn find_sequences(&mut self) -> Result<(), ScanError> {
        scan_ascending_runs(&mut self.cursor, &mut self.report)
    }

    /// Flush the report and release the byte source.
    pub fn finish(mut self) -> Result<(), ScanError> {
        self.report.flush()?;
        Ok(())
    }
}

#[cfg(test)]
use crate::bbm::headers::{FACTORY_BAD_MARKER, FREE_SPARE_MARKER, HEADER_BLOCK_MARKER};
#[cfg(test)]
use crate::bbm::testimg::{fields, ImageBuilder};
#[cfg(test)]
use crate::geometry::NAND512;
#[cfg(test)]
use crate::report::MemorySink;

#[cfg(test)]
fn session_with_capture(
    image: Vec<u8>,
    geometry: DeviceGeometry,
) -> (ScanSession<io::Cursor<Vec<u8>>>, MemorySink) {
    let sink = MemorySink::new();
    let mut report = Report::new();
    report.add_sink(Box::new(sink.clone()));

    let session = ScanSession::new(io::Cursor::new(image), geometry, report).unwrap();
    (session, sink)
}

#[cfg(test)]
fn full_device_image(corrupt_high_entry: bool) -> Vec<u8> {
    // Two bad blocks: 3 (replaced by a spare) and 4093 (a factory-bad
    // spare, synthetic key (95 - 2) + 4000).
    let map = [
        HEADER_BLOCK_MARKER,
        0x8000_0003,
        FACTORY_BAD_MARKER,
        FREE_SPARE_MARKER,
    ];
    let mut high_map = map;
    if corrupt_high_entry {
        high_map[1] = 0x8000_0007;
    }

    let low_offset = (4094 * NAND512.bytes_per_block()) as usize;
    let high_offset = (4095 * NAND512.bytes_per_block()) as usize;

    let mut builder = ImageBuilder::for_geometry(&NAND512);
    builder
        .mark_bad(&NAND512, 3)
        .mark_bad(&NAND512, 4093)
        .header(low_offset, &fields(0x0000, 4), &map)
        .header(high_offset, &fields(0xFFFF, 4), &high_map);

    builder.into_bytes()
}

#[test]
fn test_round_trip_full_match() -> anyhow::Result<()> {
    let (mut session, sink) = session_with_capture(full_device_image(false), NAND512);

    let table = session.check_bad_blocks(|| unreachable!("no retry expected"))?;
    session.finish()?;

    assert_eq!(table.len(), 2);
    assert!(table.entries().iter().all(|e| e.matched));

    let output = sink.contents();
    assert!(output.contains("This is the LOW table"));
    assert!(output.contains("This is the HIGH table"));
    assert!(output.contains("Replacement map contents match"));
    Ok(())
}

#[test]
fn test_single_corrupt_entry_is_reported() -> anyhow::Result<()> {
    let (mut session, sink) = session_with_capture(full_device_image(true), NAND512);

    let table = session.check_bad_blocks(|| unreachable!("no retry expected"))?;
    session.finish()?;

    let output = sink.contents();
    assert_eq!(output.matches("BBM maps do not match").count(), 1);
    assert!(!output.contains("Replacement map contents match"));

    // Block 3's replacement was the corrupted slot, so it stays unmatched.
    let unmatched: Vec<u32> = table.unmatched().map(|e| e.block).collect();
    assert_eq!(unmatched, [3]);
    assert!(output.contains("has no replacement-map entry"));
    Ok(())
}

#[cfg(test)]
const SMALL_GEOMETRY: DeviceGeometry = DeviceGeometry {
    blocks: 64,
    pages_per_block: 2,
    bytes_per_page_main: 64,
    bytes_per_page_spare: 16,
};

#[cfg(test)]
fn small_image() -> Vec<u8> {
    let map = [HEADER_BLOCK_MARKER, 0x8000_0003, FREE_SPARE_MARKER];

    let mut builder = ImageBuilder::for_geometry(&SMALL_GEOMETRY);
    builder
        .mark_bad(&SMALL_GEOMETRY, 3)
        .header(10_000, &fields(0x0000, 3), &map)
        .header(10_160, &fields(0xFFFF, 3), &map);

    builder.into_bytes()
}

#[cfg(test)]
fn run_everything(image: Vec<u8>) -> anyhow::Result<(BadBlockTable, String)> {
    let (mut session, sink) = session_with_capture(image, SMALL_GEOMETRY);

    let table = session.check_bad_blocks(|| false)?;
    session.find_e7_runs()?;
    session.find_zero_runs()?;
    session.find_sequences()?;
    session.finish()?;

    Ok((table, sink.contents()))
}

#[test]
fn test_pipeline_is_idempotent() -> anyhow::Result<()> {
    let image = small_image();

    let (first_table, first_output) = run_everything(image.clone())?;
    let (second_table, second_output) = run_everything(image)?;

    assert_eq!(first_table, second_table);
    assert_eq!(first_output, second_output);
    assert!(first_output.contains("Replacement map contents match"));
    Ok(())
}
