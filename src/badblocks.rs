//! Factory bad-block marker scan.
//!
//! A factory-bad block carries a non-0xFF byte at a fixed spot in the spare
//! area of its first page. Sampling that one byte per block across the
//! whole device yields the ground-truth bad-block table that the BBM
//! replacement maps are later reconciled against.

use crate::cursor::ByteCursor;
use crate::geometry::DeviceGeometry;
use crate::report::Report;
use crate::ScanError;

use std::io::{Read, Seek};

/// One factory-bad block found by the marker scan.
///
/// `matched` starts false and is set exactly once when cross-validation
/// confirms a corresponding replacement-map entry.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BadBlockEntry {
    pub block: u32,
    pub matched: bool,
}

/// Bad blocks in strictly increasing block order (the scan visits blocks in
/// index order, so entries are unique by construction).
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct BadBlockTable {
    entries: Vec<BadBlockEntry>,
}

impl BadBlockTable {
    pub(crate) fn push(&mut self, block: u32) {
        self.entries.push(BadBlockEntry {
            block,
            matched: false,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[BadBlockEntry] {
        &self.entries
    }

    /// Mark `block` as matched by a replacement-map entry.
    ///
    /// Returns whether the block was present in the table.
    pub fn mark(&mut self, block: u32) -> bool {
        match self.entries.iter_mut().find(|e| e.block == block) {
            Some(entry) => {
                entry.matched = true;
                true
            }
            None => false,
        }
    }

    /// Entries that no replacement-map entry accounted for.
    pub fn unmatched(&self) -> impl Iterator<Item = &BadBlockEntry> {
        self.entries.iter().filter(|e| !e.matched)
    }
}

/// Sample the factory bad-block marker of every block.
///
/// Premature end of data aborts the loop; the partial table is still
/// reported and returned so the rest of the scan can proceed with it.
pub fn find_bad_blocks<R: Read + Seek>(
    cursor: &mut ByteCursor<R>,
    geometry: &DeviceGeometry,
    report: &mut Report,
) -> Result<BadBlockTable, ScanError> {
    report.line("Searching for bad block markers...")?;

    let rpt = howudoin::new()
        .label("Scanning bad-block markers")
        .set_len(u64::from(geometry.blocks));

    let mut table = BadBlockTable::default();
    for block in 0..geometry.blocks {
        let offset = block * geometry.bytes_per_block() + geometry.bad_marker_offset();
        if let Err(e) = cursor.seek(offset) {
            report.line(&format!("Bad-block scan aborted: {e}"))?;
            break;
        }

        match cursor.read_byte() {
            Ok(Some(0xFF)) => (),
            Ok(Some(_)) => table.push(block),
            Ok(None) => {
                report.line("Bad-block scan: unexpected end of data")?;
                break;
            }
            Err(e) => {
                report.line(&format!("Bad-block scan aborted: {e}"))?;
                break;
            }
        }

        rpt.inc();
    }
    rpt.close();

    let list = table
        .entries()
        .iter()
        .map(|e| format!("{:X} ({})", e.block, e.block))
        .collect::<Vec<_>>()
        .join(" ");
    report.line(&format!("({}) bad blocks found in file: {list}", table.len()))?;

    Ok(table)
}

#[cfg(test)]
use std::io;

#[cfg(test)]
const TEST_GEOMETRY: DeviceGeometry = DeviceGeometry {
    blocks: 16,
    pages_per_block: 4,
    bytes_per_page_main: 32,
    bytes_per_page_spare: 8,
};

#[test]
fn test_find_bad_blocks_small() -> anyhow::Result<()> {
    let mut image = vec![0xFFu8; TEST_GEOMETRY.total_bytes() as usize];
    for block in [2u32, 9] {
        let marker =
            block * TEST_GEOMETRY.bytes_per_block() + TEST_GEOMETRY.bad_marker_offset();
        image[marker as usize] = 0x00;
    }

    let mut cursor = ByteCursor::new(io::Cursor::new(image))?;
    let mut report = Report::new();
    let table = find_bad_blocks(&mut cursor, &TEST_GEOMETRY, &mut report)?;

    let blocks: Vec<u32> = table.entries().iter().map(|e| e.block).collect();
    assert_eq!(blocks, [2, 9]);
    assert!(table.entries().iter().all(|e| !e.matched));
    Ok(())
}

#[test]
fn test_find_bad_blocks_full_device() -> anyhow::Result<()> {
    use crate::geometry::NAND512;

    let mut image = vec![0xFFu8; NAND512.total_bytes() as usize];
    for block in [3u32, 4095] {
        let marker = block * NAND512.bytes_per_block() + NAND512.bad_marker_offset();
        image[marker as usize] = 0xA5;
    }

    let mut cursor = ByteCursor::new(io::Cursor::new(image))?;
    let mut report = Report::new();
    let table = find_bad_blocks(&mut cursor, &NAND512, &mut report)?;

    assert_eq!(
        table.entries(),
        [
            BadBlockEntry {
                block: 3,
                matched: false
            },
            BadBlockEntry {
                block: 4095,
                matched: false
            },
        ]
    );
    Ok(())
}

#[test]
fn test_truncated_image_keeps_partial_table() -> anyhow::Result<()> {
    // Cut the image off after 8 blocks; the scan keeps what it found.
    let mut image =
        vec![0xFFu8; (TEST_GEOMETRY.bytes_per_block() * 8) as usize];
    let marker = 5 * TEST_GEOMETRY.bytes_per_block() + TEST_GEOMETRY.bad_marker_offset();
    image[marker as usize] = 0x00;

    let mut cursor = ByteCursor::new(io::Cursor::new(image))?;
    let mut report = Report::new();
    let table = find_bad_blocks(&mut cursor, &TEST_GEOMETRY, &mut report)?;

    let blocks: Vec<u32> = table.entries().iter().map(|e| e.block).collect();
    assert_eq!(blocks, [5]);
    Ok(())
}
