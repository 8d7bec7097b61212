//! Correction of whole pages, and the per-page report.

use std::fmt;

use super::chunk::{Chunk, ChunkCorrector, ChunkStatus};
use super::{CodeShape, Corrector};
use crate::nand::{EccParameters, InvalidLayout, PageUtil};

/// The overall state of a page after correction
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PageStatus {
    /// Every chunk was clean
    Clean,

    /// Every chunk was clean or corrected, with at least one corrected
    Corrected,

    /// Some, but not all, chunks were uncorrectable
    PartiallyUncorrectable,

    /// Every chunk was uncorrectable
    FullyUncorrectable,
}

impl PageStatus {
    /// Fold a page's chunk statuses into the page status
    pub fn from_chunks(statuses: &[ChunkStatus]) -> Self {
        let uncorrectable = statuses
            .iter()
            .filter(|&&s| s == ChunkStatus::Uncorrectable)
            .count();
        let corrected = statuses
            .iter()
            .any(|s| matches!(s, ChunkStatus::Corrected(_)));

        match uncorrectable {
            0 if corrected => Self::Corrected,
            0 => Self::Clean,
            n if n == statuses.len() => Self::FullyUncorrectable,
            _ => Self::PartiallyUncorrectable,
        }
    }

    /// Does this status leave bad data in the output?
    pub fn is_uncorrectable(&self) -> bool {
        matches!(
            self,
            Self::PartiallyUncorrectable | Self::FullyUncorrectable
        )
    }
}

impl fmt::Display for PageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Clean => "clean",
            Self::Corrected => "corrected",
            Self::PartiallyUncorrectable => "partially uncorrectable",
            Self::FullyUncorrectable => "fully uncorrectable",
        })
    }
}

/// What to do with a page's successful corrections when other chunks of it are uncorrectable
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum RepairPolicy {
    /// Apply every correction that could be made
    #[default]
    Partial,

    /// Leave the page exactly as read unless every chunk could be made good
    WholePage,
}

/// The diagnostic record for one page
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PageReport {
    pub page_index: u64,
    pub chunk_statuses: Vec<ChunkStatus>,
    pub overall: PageStatus,

    /// The whole raw page was in the erased state
    pub erased: bool,

    /// Corrections were written into the page
    pub repaired: bool,

    /// Set when the correction primitive failed on this page
    pub primitive_failure: Option<String>,
}

impl PageReport {
    /// Number of bit errors fixed in the output page (zero if the repair was withheld)
    pub fn bits_corrected(&self) -> u64 {
        if !self.repaired {
            return 0;
        }
        self.chunk_statuses
            .iter()
            .map(|s| u64::from(s.bit_errors()))
            .sum()
    }
}

impl fmt::Display for PageReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page {}: {}", self.page_index, self.overall)?;
        if self.erased {
            return write!(f, " (erased)");
        }

        write!(f, " [")?;
        for (index, status) in self.chunk_statuses.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{index}: {status}")?;
        }
        write!(f, "]")?;

        if self.overall == PageStatus::Corrected || self.overall == PageStatus::Clean {
            return Ok(());
        }
        if let Some(failure) = &self.primitive_failure {
            write!(f, " (decoder failure: {failure})")?;
        } else if !self.repaired && self.chunk_statuses.iter().any(|s| s.bit_errors() > 0) {
            write!(f, " (repairs withheld)")?;
        }
        Ok(())
    }
}

/// Corrects whole raw pages, one at a time
pub struct PageProcessor<'p, C: ?Sized> {
    params: &'p EccParameters,
    chunks: ChunkCorrector<'p, C>,
    policy: RepairPolicy,

    /// The page as read, for rolling back corrections
    original: Vec<u8>,
}

impl<'p, C: Corrector + ?Sized> PageProcessor<'p, C> {
    /// Pair a layout with a corrector, checking that the corrector's code fits the layout
    pub fn new(
        params: &'p EccParameters,
        corrector: &'p C,
        shape: CodeShape,
        policy: RepairPolicy,
    ) -> Result<Self, InvalidLayout> {
        shape.check(params)?;

        Ok(Self {
            params,
            chunks: ChunkCorrector::new(corrector, shape.capacity),
            policy,
            original: Vec::with_capacity(params.raw_page_size()),
        })
    }

    pub fn params(&self) -> &'p EccParameters {
        self.params
    }

    /// Correct one raw page in place, in chunk order, and report on it.
    ///
    /// A page is never rejected: uncorrectable chunks, and even failures of the corrector, are
    /// recorded in the report.
    pub fn process(&mut self, page_index: u64, page: &mut [u8]) -> PageReport {
        assert_eq!(
            page.len(),
            self.params.raw_page_size(),
            "page buffer is not one raw page"
        );
        let chunk_count = self.params.chunk_count();

        if page.is_erased() {
            return PageReport {
                page_index,
                chunk_statuses: vec![ChunkStatus::Clean; chunk_count],
                overall: PageStatus::Clean,
                erased: true,
                repaired: false,
                primitive_failure: None,
            };
        }

        self.original.clear();
        self.original.extend_from_slice(page);

        let mut chunk_statuses = Vec::with_capacity(chunk_count);
        for layout in self.params.chunks() {
            match self.chunks.correct(Chunk::new(layout, page)) {
                Ok(status) => chunk_statuses.push(status),
                Err(error) => {
                    // The page cannot be trusted to any degree; emit it as read
                    page.copy_from_slice(&self.original);
                    return PageReport {
                        page_index,
                        chunk_statuses: vec![ChunkStatus::Uncorrectable; chunk_count],
                        overall: PageStatus::FullyUncorrectable,
                        erased: false,
                        repaired: false,
                        primitive_failure: Some(error.to_string()),
                    };
                }
            }
        }

        let overall = PageStatus::from_chunks(&chunk_statuses);
        let mut repaired = chunk_statuses.iter().any(|s| s.bit_errors() > 0);
        if repaired && overall.is_uncorrectable() && self.policy == RepairPolicy::WholePage {
            page.copy_from_slice(&self.original);
            repaired = false;
        }

        PageReport {
            page_index,
            chunk_statuses,
            overall,
            erased: false,
            repaired,
            primitive_failure: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecc::fake::FakeCorrector;
    use crate::nand::{Region, SplitLayout};

    use ChunkStatus::*;

    /// 4 chunks of 16 bytes, each with 4 bytes of parity in a 32-byte spare area
    fn params() -> EccParameters {
        EccParameters::split(SplitLayout {
            page_size: 64,
            spare_size: 32,
            chunk_data_size: 16,
            parity_size: 4,
            error_capacity: 8,
            spare_layout: (0..4).map(|i| Region::new(4 + i * 8, 4)).collect(),
        })
        .unwrap()
    }

    /// A page whose chunks carry the given fake "parity" codes
    fn page(codes: [u8; 4]) -> Vec<u8> {
        let mut page: Vec<u8> = (0..96).map(|i| i as u8 | 0x40).collect();
        for (i, code) in codes.into_iter().enumerate() {
            page[64 + 4 + i * 8] = code;
        }
        page
    }

    #[test]
    fn test_page_status() {
        assert_eq!(PageStatus::from_chunks(&[Clean, Clean]), PageStatus::Clean);
        assert_eq!(
            PageStatus::from_chunks(&[Clean, Corrected(2)]),
            PageStatus::Corrected
        );
        assert_eq!(
            PageStatus::from_chunks(&[Corrected(1), Uncorrectable]),
            PageStatus::PartiallyUncorrectable
        );
        assert_eq!(
            PageStatus::from_chunks(&[Uncorrectable, Uncorrectable]),
            PageStatus::FullyUncorrectable
        );
    }

    #[test]
    fn test_process_statuses() {
        let params = params();
        let corrector = FakeCorrector::new(4, 8);
        let mut processor =
            PageProcessor::new(&params, &corrector, corrector.shape(), RepairPolicy::Partial)
                .unwrap();

        let mut clean = page([0, 0, 0, 0]);
        let expected = clean.clone();
        let report = processor.process(0, &mut clean);
        assert_eq!(report.overall, PageStatus::Clean);
        assert_eq!(report.chunk_statuses, [Clean; 4]);
        assert!(!report.repaired);
        assert_eq!(clean, expected);

        let mut fixable = page([0, 0, 3, 0]);
        let report = processor.process(1, &mut fixable);
        assert_eq!(report.page_index, 1);
        assert_eq!(report.overall, PageStatus::Corrected);
        assert_eq!(report.chunk_statuses, [Clean, Clean, Corrected(3), Clean]);
        assert_eq!(report.bits_corrected(), 3);
        assert!(fixable[32..48].iter().all(|&x| x == 0));
        assert_eq!(fixable[..32], expected[..32]);
        assert_eq!(fixable[48..64], expected[48..64]);

        let mut broken = page([0x80, 0x80, 0x80, 0x80]);
        let before = broken.clone();
        let report = processor.process(2, &mut broken);
        assert_eq!(report.overall, PageStatus::FullyUncorrectable);
        assert_eq!(report.bits_corrected(), 0);
        assert_eq!(broken, before);

        assert_eq!(corrector.calls.get(), 12);
    }

    #[test]
    fn test_partial_repair() {
        let params = params();
        let corrector = FakeCorrector::new(4, 8);
        let mut processor =
            PageProcessor::new(&params, &corrector, corrector.shape(), RepairPolicy::Partial)
                .unwrap();

        // The uncorrectable chunk comes first; the later chunks are still processed
        let mut page = page([0x80, 2, 0, 5]);
        let before = page.clone();
        let report = processor.process(7, &mut page);
        assert_eq!(
            report.chunk_statuses,
            [Uncorrectable, Corrected(2), Clean, Corrected(5)]
        );
        assert_eq!(report.overall, PageStatus::PartiallyUncorrectable);
        assert!(report.repaired);
        assert_eq!(report.bits_corrected(), 7);

        assert_eq!(page[..16], before[..16]);
        assert!(page[16..32].iter().all(|&x| x == 0));
        assert!(page[48..64].iter().all(|&x| x == 0));
    }

    #[test]
    fn test_whole_page_policy() {
        let params = params();
        let corrector = FakeCorrector::new(4, 8);
        let mut processor =
            PageProcessor::new(&params, &corrector, corrector.shape(), RepairPolicy::WholePage)
                .unwrap();

        let mut page_bytes = page([0x80, 2, 0, 5]);
        let before = page_bytes.clone();
        let report = processor.process(0, &mut page_bytes);
        assert_eq!(report.overall, PageStatus::PartiallyUncorrectable);
        assert!(!report.repaired);
        assert_eq!(report.bits_corrected(), 0);
        assert_eq!(page_bytes, before);
        assert!(report.to_string().ends_with("(repairs withheld)"));

        // Fully-correctable pages are still repaired
        let mut page_bytes = page([0, 2, 0, 0]);
        let report = processor.process(1, &mut page_bytes);
        assert!(report.repaired);
        assert!(page_bytes[16..32].iter().all(|&x| x == 0));
    }

    #[test]
    fn test_primitive_failure() {
        let params = params();
        let corrector = FakeCorrector::new(4, 8);
        let mut processor =
            PageProcessor::new(&params, &corrector, corrector.shape(), RepairPolicy::Partial)
                .unwrap();

        let mut page = page([1, 0xEE, 0, 0]);
        let before = page.clone();
        let report = processor.process(3, &mut page);
        assert_eq!(report.overall, PageStatus::FullyUncorrectable);
        assert_eq!(report.chunk_statuses, [Uncorrectable; 4]);
        assert_eq!(
            report.primitive_failure.as_deref(),
            Some("fake primitive fault")
        );
        // The correction of chunk 0 was rolled back
        assert_eq!(page, before);
    }

    #[test]
    fn test_erased_page() {
        let params = params();
        let corrector = FakeCorrector::new(4, 8);
        let mut processor =
            PageProcessor::new(&params, &corrector, corrector.shape(), RepairPolicy::Partial)
                .unwrap();

        let mut page = vec![0xFF; 96];
        let report = processor.process(0, &mut page);
        assert!(report.erased);
        assert_eq!(report.overall, PageStatus::Clean);
        assert_eq!(report.to_string(), "page 0: clean (erased)");
        assert_eq!(corrector.calls.get(), 0);
    }

    #[test]
    fn test_code_must_fit_layout() {
        let params = params();
        let corrector = FakeCorrector::new(4, 8);
        let shape = corrector.shape();
        let rejection = |shape: CodeShape| {
            PageProcessor::new(&params, &corrector, shape, RepairPolicy::Partial).err()
        };

        assert_eq!(rejection(shape), None);
        assert_eq!(
            rejection(CodeShape {
                parity_len: 5,
                ..shape
            }),
            Some(InvalidLayout::ParityMismatch { layout: 4, code: 5 })
        );
        assert_eq!(
            rejection(CodeShape {
                capacity: 6,
                ..shape
            }),
            Some(InvalidLayout::CapacityMismatch { layout: 8, code: 6 })
        );
        assert_eq!(
            rejection(CodeShape {
                max_message_len: 15,
                ..shape
            }),
            Some(InvalidLayout::MessageTooLong {
                chunk: 0,
                len: 16,
                max: 15
            })
        );
    }

    #[test]
    fn test_report_display() {
        let report = PageReport {
            page_index: 12,
            chunk_statuses: vec![Clean, Corrected(3), Uncorrectable],
            overall: PageStatus::PartiallyUncorrectable,
            erased: false,
            repaired: true,
            primitive_failure: None,
        };
        assert_eq!(
            report.to_string(),
            "page 12: partially uncorrectable [0: clean, 1: corrected(3), 2: uncorrectable]"
        );
    }
}
