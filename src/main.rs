//! Command-line front end for the BBM integrity checker.
//!
//! Takes a dump of the NAND device (prompting for a path when none is
//! given), writes every finding both to the terminal and to a log file
//! next to the input, and optionally runs the byte-pattern diagnostic
//! passes.

use anyhow::{ensure, Context, Result};
use clap::Parser;

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};

use bbm_check::geometry::NAND512;
use bbm_check::report::Report;
use bbm_check::session::ScanSession;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// Path to the NAND image file (prompted for when omitted)
    image: Option<PathBuf>,

    /// Where to write the report log (defaults to `<image-stem>_out.txt`
    /// next to the input)
    #[clap(long)]
    report: Option<PathBuf>,

    /// Also scan for runs of the 0xE7 fill byte
    #[clap(long)]
    e7_runs: bool,

    /// Also scan for runs of zero bytes
    #[clap(long)]
    zero_runs: bool,

    /// Also scan for ascending byte sequences
    #[clap(long)]
    sequences: bool,
}

fn main() -> Result<()> {
    let args = Cli::parse();

    let image_path = match &args.image {
        Some(path) => path.clone(),
        None => prompt_for_path()?,
    };
    let image = File::open(&image_path)
        .with_context(|| format!("cannot open {}", image_path.display()))?;

    let report_path = args
        .report
        .clone()
        .unwrap_or_else(|| default_report_path(&image_path));
    let log = File::create(&report_path)
        .with_context(|| format!("cannot create {}", report_path.display()))?;

    let mut report = Report::new();
    report.add_sink(Box::new(io::stdout()));
    report.add_sink(Box::new(BufWriter::new(log)));

    let title = format!("{} version {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    report.line(&title)?;
    report.line(&"=".repeat(title.len()))?;

    howudoin::init(howudoin::consumers::TermLine::default());

    let mut session = ScanSession::new(BufReader::new(image), NAND512, report)?;

    // Flush whatever was collected even when a stage failed partway.
    let scanned = run_scan(&mut session, &args);
    let finished = session.finish();
    scanned?;
    finished?;
    Ok(())
}

fn run_scan<R: Read + Seek>(session: &mut ScanSession<R>, args: &Cli) -> Result<()> {
    session.check_bad_blocks(confirm_retry)?;

    if args.e7_runs {
        session.find_e7_runs()?;
    }
    if args.zero_runs {
        session.find_zero_runs()?;
    }
    if args.sequences {
        session.find_sequences()?;
    }

    Ok(())
}

fn prompt_for_path() -> Result<PathBuf> {
    print!("NAND image file: ");
    io::stdout().flush()?;

    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    let path = line.trim();
    ensure!(!path.is_empty(), "no input file given");

    Ok(PathBuf::from(path))
}

fn confirm_retry() -> bool {
    print!("Try again from the beginning of the file? [y/N] ");
    if io::stdout().flush().is_err() {
        return false;
    }

    let mut line = String::new();
    match io::stdin().read_line(&mut line) {
        Ok(_) => matches!(line.trim(), "y" | "Y" | "yes" | "Yes"),
        Err(_) => false,
    }
}

fn default_report_path(image: &Path) -> PathBuf {
    let stem = image.file_stem().unwrap_or_default().to_string_lossy();
    image.with_file_name(format!("{stem}_out.txt"))
}
