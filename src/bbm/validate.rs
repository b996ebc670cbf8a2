//! Reconciling the two decoded headers against the bad-block table.
//!
//! Three independently-derived data sets must tell the same story: the
//! factory markers sampled from the blocks, the low table's replacement
//! map, and the high table's replacement map. Every check reports a
//! finding; none of them stops the scan.

use crate::badblocks::BadBlockTable;
use crate::report::Report;
use crate::ScanError;

use super::headers::{BbmHeader, Marker};

/// Headers further apart than this no longer sit in adjacent reserved
/// blocks.
const MAX_HEADER_DISTANCE: u32 = 16900;

/// Outcome of a cross-validation pass.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ValidationSummary {
    /// Whether entry-by-entry reconciliation ran (it is skipped when the
    /// entry counts disagree).
    pub reconciled: bool,

    /// Reconciliation mismatches found.
    pub mismatches: u32,
}

impl ValidationSummary {
    pub fn is_full_match(&self) -> bool {
        self.reconciled && self.mismatches == 0
    }
}

/// Reconcile both headers with each other and with the bad-block table,
/// marking table entries confirmed by the replacement maps.
pub fn cross_validate(
    low: &BbmHeader,
    high: &BbmHeader,
    table: &mut BadBlockTable,
    report: &mut Report,
) -> Result<ValidationSummary, ScanError> {
    // Wrapping like the source's unsigned arithmetic: a high header found
    // before the low one shows up as a huge distance, reported as Bad.
    let distance = high.offset.wrapping_sub(low.offset);
    report.line(&format!(
        "Distance between headers= {distance} bytes, {}",
        if distance < MAX_HEADER_DISTANCE {
            "OK"
        } else {
            "Bad!!"
        }
    ))?;

    let low_count = low.real_entries();
    let high_count = high.real_entries();
    if table.len() != low_count || table.len() != high_count {
        report.line("*****************************************")?;
        report.line("*        BADLY FORMED BBM HEADER        *")?;
        report.line("*    The number of bad blocks do not    *")?;
        report.line("* match the number of block map entries *")?;
        report.line("*****************************************")?;
        report.line(&format!("Bad block count= {}", table.len()))?;
        report.line(&format!("BBM map #0 count= {low_count}"))?;
        report.line(&format!("BBM map #1 count= {high_count}"))?;
        return Ok(ValidationSummary {
            reconciled: false,
            mismatches: 0,
        });
    }

    report.line(&format!(
        "BBM maps contain same number of entries ({low_count})"
    ))?;

    if low.map.len() != high.map.len() {
        report.line(&format!(
            "Replacement maps decoded to different lengths ({} and {}); comparing the common prefix",
            low.map.len(),
            high.map.len()
        ))?;
    }

    let mut mismatches = 0u32;
    for (idx, (&low_raw, &high_raw)) in low.map.iter().zip(&high.map).enumerate() {
        let low_marker = Marker::classify(low_raw);
        let high_marker = Marker::classify(high_raw);

        // Free spares and the header blocks themselves have nothing to
        // reconcile.
        if matches!(low_marker, Marker::FreeSpare | Marker::HeaderBlock)
            || matches!(high_marker, Marker::FreeSpare | Marker::HeaderBlock)
        {
            continue;
        }

        match (low_marker, high_marker) {
            (Marker::Replacement(block), Marker::Replacement(other)) if block == other => {
                if table.mark(block) {
                    report.line(&format!(
                        "{idx:2}: Replaced block {block:3X} found in bad block table"
                    ))?;
                } else {
                    report.line(&format!(
                        "{idx:2}: Replaced block {block:3X} NOT found in bad block table!!"
                    ))?;
                    mismatches += 1;
                }
            }
            (Marker::Replacement(block), Marker::Replacement(other)) => {
                report.line(&format!(
                    "{idx:2}: BBM maps do not match; header #0 map contains= {block:X}, header #1 map contains= {other:X}"
                ))?;
                mismatches += 1;
            }
            (Marker::FactoryBad, Marker::FactoryBad) => {
                // Spare-area entries are not real block indices; give them
                // a distinguishable synthetic key.
                let synthetic = (95 - idx as u32) + 4000;
                if table.mark(synthetic) {
                    report.line(&format!(
                        "{idx:2}: Spare area bad block {synthetic:3X} found in bad block table"
                    ))?;
                } else {
                    report.line(&format!(
                        "{idx:2}: Spare area bad block {synthetic:3X} NOT found in bad block table!!"
                    ))?;
                    mismatches += 1;
                }
            }
            _ => {
                report.line(&format!(
                    "{idx:2}: BBM maps do not match; header #0 map contains= {low_raw:08X}, header #1 map contains= {high_raw:08X}"
                ))?;
                mismatches += 1;
            }
        }
    }

    if mismatches == 0 {
        report.line("+----------------------------------+")?;
        report.line("|  Replacement map contents match  |")?;
        report.line("+----------------------------------+")?;
    }

    for entry in table.unmatched() {
        report.line(&format!(
            "Bad block {:X} ({}) has no replacement-map entry",
            entry.block, entry.block
        ))?;
    }

    Ok(ValidationSummary {
        reconciled: true,
        mismatches,
    })
}

#[cfg(test)]
use super::headers::{FACTORY_BAD_MARKER, FREE_SPARE_MARKER, HEADER_BLOCK_MARKER};
#[cfg(test)]
use crate::bbm::testimg;

#[cfg(test)]
fn header_at(offset: u32, status: u16, map: &[u32]) -> BbmHeader {
    BbmHeader {
        offset,
        fields: testimg::fields(status, map.len() as u16),
        map: map.to_vec(),
    }
}

#[cfg(test)]
fn table_of(blocks: &[u32]) -> BadBlockTable {
    let mut table = BadBlockTable::default();
    for &block in blocks {
        table.push(block);
    }
    table
}

#[test]
fn test_full_match() -> anyhow::Result<()> {
    let map = [
        HEADER_BLOCK_MARKER,
        0x8000_0003,
        FACTORY_BAD_MARKER,
        FREE_SPARE_MARKER,
    ];
    let low = header_at(0, 0x0000, &map);
    let high = header_at(100, 0xFFFF, &map);

    // The factory-bad slot at index 2 synthesizes key (95 - 2) + 4000.
    let mut table = table_of(&[3, 4093]);

    let mut report = Report::new();
    let summary = cross_validate(&low, &high, &mut table, &mut report)?;

    assert!(summary.is_full_match());
    assert!(table.entries().iter().all(|e| e.matched));
    Ok(())
}

#[test]
fn test_count_mismatch_skips_reconciliation() -> anyhow::Result<()> {
    let map = [0x8000_0003, 0x8000_0005, FREE_SPARE_MARKER];
    let low = header_at(0, 0x0000, &map);
    let high = header_at(100, 0xFFFF, &map);

    let mut table = table_of(&[3]);

    let mut report = Report::new();
    let summary = cross_validate(&low, &high, &mut table, &mut report)?;

    assert!(!summary.reconciled);
    assert!(!summary.is_full_match());
    assert!(table.entries().iter().all(|e| !e.matched));
    Ok(())
}

#[test]
fn test_replacement_absent_from_table() -> anyhow::Result<()> {
    let map = [0x8000_0003, 0x8000_0007];
    let low = header_at(0, 0x0000, &map);
    let high = header_at(100, 0xFFFF, &map);

    // Block 7 is claimed replaced but carries no factory marker; block 9
    // is marked bad but never replaced.
    let mut table = table_of(&[3, 9]);

    let mut report = Report::new();
    let summary = cross_validate(&low, &high, &mut table, &mut report)?;

    assert!(summary.reconciled);
    assert_eq!(summary.mismatches, 1);
    assert!(!summary.is_full_match());

    let unmatched: Vec<u32> = table.unmatched().map(|e| e.block).collect();
    assert_eq!(unmatched, [9]);
    Ok(())
}

#[test]
fn test_headers_disagree() -> anyhow::Result<()> {
    let low = header_at(0, 0x0000, &[0x8000_0003]);
    let high = header_at(100, 0xFFFF, &[0x8000_0004]);

    let mut table = table_of(&[3]);

    let mut report = Report::new();
    let summary = cross_validate(&low, &high, &mut table, &mut report)?;

    assert_eq!(summary.mismatches, 1);
    assert!(!table.entries()[0].matched);
    Ok(())
}

#[test]
fn test_mixed_marker_kinds_mismatch() -> anyhow::Result<()> {
    // Replacement on one side, factory-bad on the other: irreconcilable.
    let low = header_at(0, 0x0000, &[0x8000_0003]);
    let high = header_at(100, 0xFFFF, &[FACTORY_BAD_MARKER]);

    let mut table = table_of(&[3]);

    let mut report = Report::new();
    let summary = cross_validate(&low, &high, &mut table, &mut report)?;

    assert_eq!(summary.mismatches, 1);
    Ok(())
}

#[test]
fn test_free_spare_slots_are_skipped() -> anyhow::Result<()> {
    // A free slot on either side skips the index, even when the other side
    // holds a replacement: no mismatch, but nothing gets marked either.
    let low = header_at(0, 0x0000, &[FREE_SPARE_MARKER, 0x8000_0003, 0x8000_0009]);
    let high = header_at(100, 0xFFFF, &[0x8000_0009, 0x8000_0003, FREE_SPARE_MARKER]);

    let mut table = table_of(&[3, 9]);

    let mut report = Report::new();
    let summary = cross_validate(&low, &high, &mut table, &mut report)?;

    assert_eq!(summary.mismatches, 0);
    let unmatched: Vec<u32> = table.unmatched().map(|e| e.block).collect();
    assert_eq!(unmatched, [9]);
    Ok(())
}
