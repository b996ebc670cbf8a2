//! Byte-stream pattern detectors.
//!
//! These are optional diagnostic passes over the raw image, independent of
//! the bad-block analysis. Each detector is a small tagged-state automaton
//! fed one byte at a time; a driver function runs a full pass from offset 0
//! and reports every emitted event.
//!
//! Two patterns are of interest on CPX00 dumps: runs of a single fill byte
//! (0xE7 page fill, 0x00 erased-to-zero areas) and strictly-incrementing
//! byte sequences left behind by test patterns.

use crate::cursor::{ByteCursor, ByteOffset};
use crate::report::Report;
use crate::ScanError;

use std::io::{Read, Seek};

/// A completed pattern run.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RunRecord {
    pub start: ByteOffset,
    pub length: u32,
    pub kind: RunKind,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RunKind {
    /// A run of one repeated byte value.
    Constant(u8),

    /// A run of strictly-incrementing byte values.
    Ascending,
}

/// Events emitted by [`RunDetector`].
///
/// A run is announced as soon as it reaches the report threshold, while its
/// final length is still unknown; the `Ended` event carries the total.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RunEvent {
    Started { start: ByteOffset },
    Ended(RunRecord),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum RunState {
    /// Not inside a run of the target byte.
    Idle,

    /// Inside a run still shorter than the report threshold.
    Counting { start: ByteOffset, count: u32 },

    /// Inside an announced run; `count` keeps growing until a break.
    Running { start: ByteOffset, count: u32 },
}

/// Detects runs of a constant byte meeting a minimum length.
#[derive(Debug)]
pub struct RunDetector {
    target: u8,
    threshold: u32,
    state: RunState,
}

impl RunDetector {
    /// `threshold` is the minimum consecutive occurrences of `target`
    /// before a run is announced.
    pub fn new(target: u8, threshold: u32) -> Self {
        assert!(threshold >= 1);
        Self {
            target,
            threshold,
            state: RunState::Idle,
        }
    }

    /// Feed one byte at absolute `offset`.
    pub fn step(&mut self, offset: ByteOffset, byte: u8) -> Option<RunEvent> {
        let (state, event) = match self.state {
            RunState::Idle if byte == self.target => Self::grow(offset, 0, self.threshold),
            RunState::Idle => (RunState::Idle, None),

            RunState::Counting { start, count } if byte == self.target => {
                Self::grow(start, count, self.threshold)
            }
            // Too short to report; the run is discarded.
            RunState::Counting { .. } => (RunState::Idle, None),

            RunState::Running { start, count } if byte == self.target => (
                RunState::Running {
                    start,
                    count: count + 1,
                },
                None,
            ),
            RunState::Running { start, count } => (RunState::Idle, Some(self.ended(start, count))),
        };

        self.state = state;
        event
    }

    /// End of data: flush an announced run's final length.
    pub fn flush(&mut self) -> Option<RunEvent> {
        match std::mem::replace(&mut self.state, RunState::Idle) {
            RunState::Running { start, count } => Some(self.ended(start, count)),
            _ => None,
        }
    }

    fn grow(start: ByteOffset, count: u32, threshold: u32) -> (RunState, Option<RunEvent>) {
        let count = count + 1;
        if count == threshold {
            (RunState::Running { start, count }, Some(RunEvent::Started { start }))
        } else {
            (RunState::Counting { start, count }, None)
        }
    }

    fn ended(&self, start: ByteOffset, length: u32) -> RunEvent {
        RunEvent::Ended(RunRecord {
            start,
            length,
            kind: RunKind::Constant(self.target),
        })
    }
}

/// Detects strictly-incrementing byte runs longer than 8 bytes.
///
/// The comparison is `last + 1` without wraparound: 0xFF followed by 0x00
/// breaks the run. An in-progress run is never emitted at end of data.
#[derive(Debug, Default)]
pub struct AscendingRunDetector {
    run: Option<(ByteOffset, u32, u8)>,
}

impl AscendingRunDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one byte at absolute `offset`.
    pub fn step(&mut self, offset: ByteOffset, byte: u8) -> Option<RunRecord> {
        match self.run {
            Some((start, count, last)) if last.checked_add(1) == Some(byte) => {
                self.run = Some((start, count + 1, byte));
                None
            }
            Some((start, count, _)) => {
                self.run = Some((offset, 1, byte));
                (count > 8).then_some(RunRecord {
                    start,
                    length: count,
                    kind: RunKind::Ascending,
                })
            }
            None => {
                self.run = Some((offset, 1, byte));
                None
            }
        }
    }
}

/// Run a constant-byte pass over the whole image, reporting announced runs
/// and their final lengths. Zero runs are reported only once complete, so
/// `announce_start` is off for them.
pub fn scan_constant_runs<R: Read + Seek>(
    cursor: &mut ByteCursor<R>,
    report: &mut Report,
    label: &str,
    target: u8,
    threshold: u32,
    announce_start: bool,
) -> Result<(), ScanError> {
    cursor.seek(0)?;
    let mut detector = RunDetector::new(target, threshold);

    loop {
        let event = match cursor.read_byte() {
            Ok(Some(byte)) => detector.step(cursor.position() - 1, byte),
            Ok(None) => {
                if let Some(event) = detector.flush() {
                    report_run_event(report, label, announce_start, event)?;
                }
                break;
            }
            Err(e) => {
                report.line(&format!("{label} run scan aborted: {e}"))?;
                break;
            }
        };

        if let Some(event) = event {
            report_run_event(report, label, announce_start, event)?;
        }
    }

    Ok(())
}

fn report_run_event(
    report: &mut Report,
    label: &str,
    announce_start: bool,
    event: RunEvent,
) -> Result<(), ScanError> {
    match event {
        RunEvent::Started { start } if announce_start => {
            report.line(&format!("{label} run started @ {start:08X}"))?;
        }
        RunEvent::Started { .. } => (),
        RunEvent::Ended(run) => {
            report.line(&format!("{label} @ {:08X}, {} bytes", run.start, run.length))?;
        }
    }
    Ok(())
}

/// Run the ascending-sequence pass over the whole image.
pub fn scan_ascending_runs<R: Read + Seek>(
    cursor: &mut ByteCursor<R>,
    report: &mut Report,
) -> Result<(), ScanError> {
    cursor.seek(0)?;
    let mut detector = AscendingRunDetector::new();

    loop {
        match cursor.read_byte() {
            Ok(Some(byte)) => {
                if let Some(run) = detector.step(cursor.position() - 1, byte) {
                    report.line(&format!("Sequence @ {:08X}, {} bytes", run.start, run.length))?;
                }
            }
            Ok(None) => break,
            Err(e) => {
                report.line(&format!("Sequence scan aborted: {e}"))?;
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
fn drive(detector: &mut RunDetector, bytes: &[u8]) -> Vec<RunEvent> {
    let mut events: Vec<_> = bytes
        .iter()
        .enumerate()
        .filter_map(|(i, &b)| detector.step(i as ByteOffset, b))
        .collect();
    events.extend(detector.flush());
    events
}

#[test]
fn test_e7_run_below_threshold() {
    let mut detector = RunDetector::new(0xE7, 7);
    assert!(drive(&mut detector, &[0xE7; 6]).is_empty());

    let mut detector = RunDetector::new(0xE7, 7);
    let mut bytes = vec![0xE7; 6];
    bytes.push(0x00);
    assert!(drive(&mut detector, &bytes).is_empty());
}

#[test]
fn test_e7_run_at_threshold() {
    let mut detector = RunDetector::new(0xE7, 7);
    let mut bytes = vec![0xE7; 7];
    bytes.push(0x00);
    assert_eq!(
        drive(&mut detector, &bytes),
        [
            RunEvent::Started { start: 0 },
            RunEvent::Ended(RunRecord {
                start: 0,
                length: 7,
                kind: RunKind::Constant(0xE7),
            }),
        ]
    );
}

#[test]
fn test_e7_run_flushed_at_end_of_data() {
    let mut detector = RunDetector::new(0xE7, 7);
    assert_eq!(
        drive(&mut detector, &[0xE7; 20]),
        [
            RunEvent::Started { start: 0 },
            RunEvent::Ended(RunRecord {
                start: 0,
                length: 20,
                kind: RunKind::Constant(0xE7),
            }),
        ]
    );
}

#[test]
fn test_zero_run_boundary() {
    let mut detector = RunDetector::new(0x00, 13);
    let mut bytes = vec![0x00; 12];
    bytes.push(0xAA);
    assert!(drive(&mut detector, &bytes).is_empty());

    let mut detector = RunDetector::new(0x00, 13);
    let mut bytes = vec![0xAA, 0xAA];
    bytes.extend([0x00; 13]);
    bytes.push(0xAA);
    assert_eq!(
        drive(&mut detector, &bytes),
        [
            RunEvent::Started { start: 2 },
            RunEvent::Ended(RunRecord {
                start: 2,
                length: 13,
                kind: RunKind::Constant(0x00),
            }),
        ]
    );
}

#[test]
fn test_interrupted_run_restarts() {
    let mut detector = RunDetector::new(0xE7, 3);
    let bytes = [0xE7, 0xE7, 0x00, 0xE7, 0xE7, 0xE7, 0x00];
    assert_eq!(
        drive(&mut detector, &bytes),
        [
            RunEvent::Started { start: 3 },
            RunEvent::Ended(RunRecord {
                start: 3,
                length: 3,
                kind: RunKind::Constant(0xE7),
            }),
        ]
    );
}

#[cfg(test)]
fn drive_ascending(bytes: &[u8]) -> Vec<RunRecord> {
    let mut detector = AscendingRunDetector::new();
    bytes
        .iter()
        .enumerate()
        .filter_map(|(i, &b)| detector.step(i as ByteOffset, b))
        .collect()
}

#[test]
fn test_ascending_boundary() {
    // Nine ascending bytes broken by a non-successor: one record.
    let runs = drive_ascending(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 0]);
    assert_eq!(
        runs,
        [RunRecord {
            start: 0,
            length: 9,
            kind: RunKind::Ascending,
        }]
    );

    // Eight is not enough.
    assert!(drive_ascending(&[1, 2, 3, 4, 5, 6, 7, 8, 0]).is_empty());
}

#[test]
fn test_ascending_no_emission_at_end_of_data() {
    // The run is still in progress when the data ends, so nothing comes out.
    assert!(drive_ascending(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]).is_empty());
}

#[test]
fn test_ascending_does_not_wrap() {
    // 0xFF -> 0x00 breaks the run even though it wraps arithmetically.
    let bytes = [0xF5, 0xF6, 0xF7, 0xF8, 0xF9, 0xFA, 0xFB, 0xFC, 0xFD, 0xFE, 0xFF, 0x00, 0x01];
    let runs = drive_ascending(&bytes);
    assert_eq!(
        runs,
        [RunRecord {
            start: 0,
            length: 11,
            kind: RunKind::Ascending,
        }]
    );
}
