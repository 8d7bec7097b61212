//! The streaming pass over a raw dump: read a page, correct it, write it, repeat.
//!
//! Pages are handled strictly in order, with one page in memory at a time, so this works as a
//! filter in the middle of a pipeline. Only the structure of the stream itself (a torn final
//! page, or an I/O error) can stop a run; bad pages are reported and passed through.

use std::io::{self, Read, Write};

use thiserror::Error;

use crate::ecc::{ChunkStatus, CodeShape, Corrector, PageProcessor, PageReport, RepairPolicy};
use crate::nand::{EccParameters, InvalidLayout, PageUtil};
use crate::util::ReadExt;

/// A fatal problem with the stream; pages before the failure have already been written
#[derive(Error, Debug)]
pub enum StreamError {
    #[error(
        "input truncated: page {page_index} is {len} of {expected} bytes \
         ({pages_written} complete pages written)"
    )]
    TruncatedInput {
        page_index: u64,
        len: usize,
        expected: usize,
        pages_written: u64,
    },

    #[error("I/O error after {pages_written} pages written")]
    Io {
        pages_written: u64,
        #[source]
        source: io::Error,
    },
}

impl StreamError {
    /// How many complete pages made it to the output before the failure
    pub fn pages_written(&self) -> u64 {
        match self {
            Self::TruncatedInput { pages_written, .. } | Self::Io { pages_written, .. } => {
                *pages_written
            }
        }
    }
}

/// What is written out for each page
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum OutputMode {
    /// The full raw page, spare area included; output is the same length as input
    #[default]
    Raw,

    /// Only the data regions of each chunk, in chunk order
    StripSpare,
}

/// Totals over a whole run
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct RunStatistics {
    pub pages_processed: u64,
    pub pages_clean: u64,
    pub pages_corrected: u64,
    pub pages_uncorrectable: u64,

    /// Pages found fully erased (also counted as clean)
    pub pages_erased: u64,

    pub total_bit_errors_corrected: u64,

    /// The first page with protected spare bytes that are neither all-0xFF nor all-0x00, i.e.
    /// OOB metadata that is lost when the spare area is stripped
    pub first_tainted_spare: Option<u64>,
}

impl RunStatistics {
    /// Fold one page's report into the totals
    pub fn record(&mut self, report: &PageReport) {
        use crate::ecc::PageStatus::*;

        self.pages_processed += 1;
        match report.overall {
            Clean => self.pages_clean += 1,
            Corrected => self.pages_corrected += 1,
            PartiallyUncorrectable | FullyUncorrectable => self.pages_uncorrectable += 1,
        }
        if report.erased {
            self.pages_erased += 1;
        }
        self.total_bit_errors_corrected += report.bits_corrected();
    }

    /// Was every page recovered?
    pub fn is_clean(&self) -> bool {
        self.pages_uncorrectable == 0
    }
}

/// The side channel for per-page diagnostics
pub trait Reporter {
    fn page(&mut self, report: &PageReport);
}

/// Discards all reports
impl Reporter for () {
    fn page(&mut self, _report: &PageReport) {}
}

/// Collects every report, for inspection afterward
impl Reporter for Vec<PageReport> {
    fn page(&mut self, report: &PageReport) {
        self.push(report.clone());
    }
}

/// Reads raw pages, corrects them, and writes them out
pub struct StreamDriver<'p, C: ?Sized> {
    processor: PageProcessor<'p, C>,
    output_mode: OutputMode,
}

impl<'p, C: Corrector + ?Sized> StreamDriver<'p, C> {
    pub fn new(
        params: &'p EccParameters,
        corrector: &'p C,
        shape: CodeShape,
        policy: RepairPolicy,
        output_mode: OutputMode,
    ) -> Result<Self, InvalidLayout> {
        Ok(Self {
            processor: PageProcessor::new(params, corrector, shape, policy)?,
            output_mode,
        })
    }

    /// Run over the whole input, until EOF at a page boundary.
    pub fn run<R, W, P>(
        &mut self,
        input: &mut R,
        output: &mut W,
        reporter: &mut P,
    ) -> Result<RunStatistics, StreamError>
    where
        R: Read + ?Sized,
        W: Write + ?Sized,
        P: Reporter + ?Sized,
    {
        let params = self.processor.params();
        let mut stats = RunStatistics::default();
        let mut page = vec![0u8; params.raw_page_size()];

        loop {
            let io_error = |source| StreamError::Io {
                pages_written: stats.pages_processed,
                source,
            };

            let len = input.read_full(&mut page).map_err(io_error)?;
            if len == 0 {
                break;
            }
            if len < page.len() {
                return Err(StreamError::TruncatedInput {
                    page_index: stats.pages_processed,
                    len,
                    expected: page.len(),
                    pages_written: stats.pages_processed,
                });
            }

            let report = self.processor.process(stats.pages_processed, &mut page);
            self.write_page(output, &page).map_err(io_error)?;

            if stats.first_tainted_spare.is_none() && has_tainted_spare(params, &page, &report) {
                stats.first_tainted_spare = Some(report.page_index);
            }
            stats.record(&report);
            reporter.page(&report);
        }

        output.flush().map_err(|source| StreamError::Io {
            pages_written: stats.pages_processed,
            source,
        })?;

        Ok(stats)
    }

    fn write_page<W: Write + ?Sized>(&self, output: &mut W, page: &[u8]) -> io::Result<()> {
        match self.output_mode {
            OutputMode::Raw => output.write_all(page),
            OutputMode::StripSpare => {
                for chunk in self.processor.params().chunks() {
                    output.write_all(&page[chunk.data.range()])?;
                }
                Ok(())
            }
        }
    }
}

/// Does any recovered chunk of this page carry meaningful protected spare bytes?
fn has_tainted_spare(params: &EccParameters, page: &[u8], report: &PageReport) -> bool {
    if report.erased {
        return false;
    }

    params
        .chunks()
        .iter()
        .zip(&report.chunk_statuses)
        .filter(|(_, status)| **status != ChunkStatus::Uncorrectable)
        .filter_map(|(chunk, _)| chunk.protected_spare)
        .map(|region| &page[region.range()])
        .any(|spare| !spare.is_erased() && !spare.is_zeroed())
}
