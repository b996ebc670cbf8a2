//! Line-oriented report output.
//!
//! Every detector transition and validator check produces one line, and
//! each line is duplicated verbatim to every attached sink (interactive
//! display, persisted log, test capture). Format strings therefore exist
//! exactly once, at the call site.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

/// Fan-out writer for report lines.
#[derive(Default)]
pub struct Report {
    sinks: Vec<Box<dyn Write>>,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach another destination; lines are written to all of them.
    pub fn add_sink(&mut self, sink: Box<dyn Write>) {
        self.sinks.push(sink);
    }

    /// Emit one line to every sink.
    pub fn line(&mut self, text: &str) -> io::Result<()> {
        for sink in &mut self.sinks {
            writeln!(sink, "{text}")?;
        }
        Ok(())
    }

    /// Flush all sinks; called on every exit path of a scan.
    pub fn flush(&mut self) -> io::Result<()> {
        for sink in &mut self.sinks {
            sink.flush()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Report")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

/// An in-memory sink, cloneable so callers can keep a handle on the
/// captured output after handing the sink to a [`Report`].
#[derive(Debug, Clone, Default)]
pub struct MemorySink(Arc<Mutex<Vec<u8>>>);

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far, lossily decoded.
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_fan_out() -> io::Result<()> {
    let first = MemorySink::new();
    let second = MemorySink::new();

    let mut report = Report::new();
    report.add_sink(Box::new(first.clone()));
    report.add_sink(Box::new(second.clone()));

    report.line("one")?;
    report.line("two")?;
    report.flush()?;

    assert_eq!(first.contents(), "one\ntwo\n");
    assert_eq!(first.contents(), second.contents());
    Ok(())
}
