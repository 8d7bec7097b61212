//! Corrects bit errors in a raw NAND dump, page by page.
//!
//! The input is a dump taken with the out-of-band area included (e.g. `nanddump --oob`, or a
//! programmer's "raw" read), so that every page is followed by its spare bytes and the BCH
//! parity can be checked. The output is the same dump with every correctable chunk repaired,
//! or just the page data with `--strip-spare`.
//!
//! Exits with status 2 if any page could not be fully corrected, or 1 if the dump itself could
//! not be processed (including when the command line is wrong).

use anyhow::{Context, Result};
use clap::{Args, Parser, ValueEnum};

use std::fs::File;
use std::ffi::OsString;
use std::io::{self, BufReader, BufWriter, IsTerminal, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use mtk_nand_correct::{
    ecc::{BchCorrector, PageReport, PageStatus, RepairPolicy},
    nand::{EccParameters, PageGeometry, Region},
    presets::{self, Preset},
    stream::{OutputMode, Reporter, RunStatistics, StreamDriver},
};

fn parse_preset(name: &str) -> Result<Preset, String> {
    presets::find(name).copied().ok_or_else(|| {
        let known: Vec<_> = presets::PRESETS.iter().map(|p| p.name).collect();
        format!("unknown preset (known: {})", known.join(", "))
    })
}

fn parse_int(s: &str) -> Result<u32, std::num::ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

#[derive(Args, Debug)]
struct EccOptions {
    /// The controller configuration the dump was written with
    #[clap(long, default_value = "mt8167-4x", value_parser = parse_preset)]
    preset: Preset,

    /// Override the raw page geometry, as PAGE+SPARE (e.g. 4096+256)
    #[clap(long)]
    geometry: Option<PageGeometry>,

    /// Override the number of ECC chunks (sectors) per page
    #[clap(long, conflicts_with = "spare_layout")]
    chunks: Option<usize>,

    /// Override the number of bit errors correctable per chunk
    #[clap(long)]
    strength: Option<u32>,

    /// Override the primitive polynomial of the Galois field (decimal or 0x-prefixed hex)
    #[clap(long, value_parser = parse_int)]
    prim_poly: Option<u32>,

    /// Override the number of protected spare (FDM) bytes after each sector's data
    #[clap(long, conflicts_with = "spare_layout")]
    fdm_size: Option<usize>,

    /// Use the split layout instead: all data first, then the parity of each chunk at these
    /// OFFSET+LEN regions of the spare area (comma-separated)
    #[clap(long, value_delimiter = ',')]
    spare_layout: Vec<Region>,

    /// Data bytes per chunk in the split layout (default: the page divided among the regions)
    #[clap(long, requires = "spare_layout")]
    chunk_size: Option<usize>,

    /// Take the bits of each byte MSB-first instead of LSB-first
    #[clap(long)]
    no_swap_bits: bool,
}

impl EccOptions {
    fn build(&self) -> Result<(EccParameters, BchCorrector)> {
        let mut preset = self.preset;
        if let Some(geometry) = self.geometry {
            preset.geometry = geometry;
        }
        if let Some(chunks) = self.chunks {
            preset.sectors = chunks;
        }
        if let Some(t) = self.strength {
            preset.code.t = t;
        }
        if let Some(prim_poly) = self.prim_poly {
            preset.code.prim_poly = prim_poly;
        }
        if let Some(fdm_size) = self.fdm_size {
            preset.fdm_size = fdm_size;
        }
        if self.no_swap_bits {
            preset.code.swap_bits = false;
        }

        if self.spare_layout.is_empty() {
            preset.build()
        } else {
            preset.build_split(self.spare_layout.clone(), self.chunk_size)
        }
    }
}

#[derive(ValueEnum, Debug, Copy, Clone)]
enum Policy {
    /// Keep the corrected chunks of a page even if others in it are uncorrectable
    Partial,

    /// Leave a page exactly as read unless every chunk in it could be recovered
    WholePage,
}

impl From<Policy> for RepairPolicy {
    fn from(value: Policy) -> Self {
        match value {
            Policy::Partial => RepairPolicy::Partial,
            Policy::WholePage => RepairPolicy::WholePage,
        }
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// The raw dump to correct, or `-` for stdin
    input: Option<PathBuf>,

    /// Where to write the corrected dump, or `-` for stdout
    #[clap(short, long)]
    output: Option<PathBuf>,

    #[clap(flatten)]
    ecc: EccOptions,

    /// What to do with pages that are only partly correctable
    #[clap(long, value_enum, default_value_t = Policy::Partial)]
    repair_policy: Policy,

    /// Write only the page data, without the spare areas
    #[clap(long)]
    strip_spare: bool,

    /// Report on every page, not just the damaged ones
    #[clap(short, long)]
    verbose: bool,
}

/// `-` stands for stdin/stdout, as does leaving the path out
fn named_path(path: Option<&Path>) -> Option<&Path> {
    path.filter(|p| *p != Path::new("-"))
}

/// Open the input, also returning its length if it's a regular file
fn open_input(path: Option<&Path>) -> Result<(Box<dyn Read>, Option<u64>)> {
    let Some(named) = named_path(path) else {
        anyhow::ensure!(
            path.is_some() || !io::stdin().is_terminal(),
            "No input given, and stdin is a terminal"
        );
        return Ok((Box::new(io::stdin().lock()), None));
    };

    let file = File::open(named).with_context(|| format!("Opening {}", named.display()))?;
    let len = file
        .metadata()
        .ok()
        .filter(|m| m.is_file())
        .map(|m| m.len());
    Ok((Box::new(BufReader::new(file)), len))
}

fn open_output(path: Option<&Path>) -> Result<Box<dyn Write>> {
    let Some(named) = named_path(path) else {
        anyhow::ensure!(
            path.is_some() || !io::stdout().is_terminal(),
            "No output given, and stdout is a terminal"
        );
        return Ok(Box::new(BufWriter::new(io::stdout().lock())));
    };

    let file = File::create(named).with_context(|| format!("Creating {}", named.display()))?;
    Ok(Box::new(BufWriter::new(file)))
}

/// Reports damaged pages (or all of them, if verbose) on stderr, with a progress bar when the
/// page count is known in advance
struct StderrReporter {
    verbose: bool,
    rpt: Option<howudoin::Tx>,
}

impl StderrReporter {
    fn new(verbose: bool, pages: Option<u64>) -> Self {
        let rpt = pages.filter(|_| !verbose).map(|pages| {
            howudoin::init(howudoin::consumers::TermLine::default());
            let rpt = howudoin::new().label("Correcting pages");
            rpt.set_len(Some(pages));
            rpt
        });

        Self { verbose, rpt }
    }

    fn finish(self) {
        if let Some(rpt) = self.rpt {
            rpt.finish();
            howudoin::disable();
            thread::sleep(Duration::from_millis(10)); // Give howudoin time to shut down
        }
    }
}

impl Reporter for StderrReporter {
    fn page(&mut self, report: &PageReport) {
        if self.verbose || report.overall != PageStatus::Clean {
            match &self.rpt {
                // Printing over the progress line would garble it
                Some(rpt) if report.overall.is_uncorrectable() => {
                    rpt.add_warn(report.to_string());
                }
                Some(rpt) => {
                    rpt.add_info(report.to_string());
                }
                None => {
                    let marker = match report.overall {
                        PageStatus::Clean => "*",
                        PageStatus::Corrected => "!",
                        PageStatus::PartiallyUncorrectable | PageStatus::FullyUncorrectable => {
                            "-"
                        }
                    };
                    eprintln!("[{marker}] {report}");
                }
            }
        }

        if let Some(rpt) = &self.rpt {
            rpt.inc();
        }
    }
}

fn print_summary(stats: &RunStatistics) {
    eprintln!(
        "[+] {} pages: {} clean ({} erased), {} corrected ({} bits), {} uncorrectable",
        stats.pages_processed,
        stats.pages_clean,
        stats.pages_erased,
        stats.pages_corrected,
        stats.total_bit_errors_corrected,
        stats.pages_uncorrectable,
    );
}

fn run(args: Cli) -> Result<RunStatistics> {
    let (params, corrector) = args.ecc.build()?;
    let shape = corrector.shape();
    if args.verbose {
        eprintln!(
            "[*] {}+{} pages, {} chunks of {} bytes, t={} ({} parity bytes)",
            params.page_size(),
            params.spare_size(),
            params.chunk_count(),
            params.chunk_data_size(),
            shape.capacity,
            shape.parity_len,
        );
    }

    let output_mode = match args.strip_spare {
        true => OutputMode::StripSpare,
        false => OutputMode::Raw,
    };
    let mut driver = StreamDriver::new(
        &params,
        &corrector,
        shape,
        args.repair_policy.into(),
        output_mode,
    )?;

    let (mut input, input_len) = open_input(args.input.as_deref())?;
    let mut output = open_output(args.output.as_deref())?;

    let raw_page_size = params.raw_page_size() as u64;
    if let Some(len) = input_len.filter(|len| len % raw_page_size != 0) {
        eprintln!(
            "[!] Input is {len} bytes, not a multiple of the {raw_page_size}-byte raw page; \
             is the geometry right?"
        );
    }

    let mut reporter = StderrReporter::new(args.verbose, input_len.map(|l| l / raw_page_size));
    let result = driver.run(&mut *input, &mut *output, &mut reporter);
    reporter.finish();
    let stats = result.context("Correction aborted")?;

    print_summary(&stats);
    if let Some(page) = stats.first_tainted_spare.filter(|_| args.strip_spare) {
        eprintln!(
            "[!] Spare areas hold metadata (first seen on page {page}), which was not written out"
        );
    }

    Ok(stats)
}

/// Status for runs where some pages could not be fully corrected
const EXIT_UNCORRECTABLE: u8 = 2;

/// Parse the command line without letting clap pick the exit status, since its usage-error
/// status would collide with [EXIT_UNCORRECTABLE]
fn parse_args<I, T>(args: I) -> Result<Cli, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    Cli::try_parse_from(args)
}

/// `--help` and `--version` succeed; anything else wrong with the command line is fatal
fn usage_status(error: &clap::Error) -> u8 {
    match error.exit_code() {
        0 => 0,
        _ => 1,
    }
}

fn main() -> ExitCode {
    let args = match parse_args(std::env::args_os()) {
        Ok(args) => args,
        Err(error) => {
            let _ = error.print();
            return ExitCode::from(usage_status(&error));
        }
    };

    match run(args) {
        Ok(stats) if stats.is_clean() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::from(EXIT_UNCORRECTABLE),
        Err(error) => {
            eprintln!("[-] {error:#}");
            ExitCode::FAILURE
        }
    }
}

#[test]
fn test_usage_errors_are_fatal() {
    let cases: [&[&str]; 4] = [
        &["nand-correct", "--preset", "bogus"],
        &["nand-correct", "--spare-layout", "8+x"],
        &["nand-correct", "--chunks", "4", "--spare-layout", "8+23"],
        &["nand-correct", "--repair-policy", "some"],
    ];
    for bad in cases {
        let error = parse_args(bad.iter().copied()).unwrap_err();
        assert_eq!(usage_status(&error), 1, "{bad:?}");
        assert_ne!(usage_status(&error), EXIT_UNCORRECTABLE);
    }

    for info in ["--help", "--version"] {
        let error = parse_args(["nand-correct", info]).unwrap_err();
        assert_eq!(usage_status(&error), 0, "{info}");
    }
}

#[test]
fn test_parse_args() -> Result<()> {
    let args = parse_args([
        "nand-correct",
        "--preset",
        "mt8167-8x",
        "--prim-poly",
        "0x4443",
        "--strength",
        "13",
        "--geometry",
        "4096+224",
        "--spare-layout",
        "8+23,64+23,120+23,176+23",
        "-o",
        "-",
        "dump.bin",
    ])?;
    assert_eq!(args.ecc.spare_layout.len(), 4);
    assert_eq!(args.input, Some(PathBuf::from("dump.bin")));

    let (params, corrector) = args.ecc.build()?;
    assert_eq!(params.chunk_count(), 4);
    assert_eq!(params.raw_page_size(), 4320);
    assert_eq!(corrector.shape().parity_len, 23);

    Ok(())
}

#[test]
fn test_reporter_routes_through_progress() {
    use mtk_nand_correct::ecc::ChunkStatus;

    let report = PageReport {
        page_index: 7,
        chunk_statuses: vec![ChunkStatus::Corrected(2), ChunkStatus::Uncorrectable],
        overall: PageStatus::PartiallyUncorrectable,
        erased: false,
        repaired: true,
        primitive_failure: None,
    };

    // Without howudoin initialized the handle is inert, so nothing reaches the terminal
    let mut reporter = StderrReporter {
        verbose: false,
        rpt: Some(howudoin::new()),
    };
    reporter.page(&report);
    reporter.page(&PageReport {
        overall: PageStatus::Corrected,
        chunk_statuses: vec![ChunkStatus::Corrected(2), ChunkStatus::Clean],
        ..report.clone()
    });
    assert!(reporter.rpt.is_some());
}
