//! The layout of raw NAND pages: where the data, protected spare bytes, and BCH parity of each
//! ECC chunk live within one page as read with its out-of-band area.
//!
//! Two layouts are supported:
//!
//! ```text
//! Split:        | data 0 | data 1 | ... | data N | spare: .. parity 0 .. parity 1 .. |
//!
//! Interleaved:  | data 0 | fdm 0 | parity 0 | data 1 | fdm 1 | parity 1 | ... | (unused) |
//! ```
//!
//! The interleaved ("sector") layout is what MediaTek's NFI controller writes: the page is a
//! sequence of sectors, each holding its share of the page data, a few bytes of free/spare
//! metadata ("FDM"), and the parity covering both.

use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use thiserror::Error;

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this page contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;

    /// Does this page contain the all-0s bit pattern?
    fn is_zeroed(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }

    fn is_zeroed(&self) -> bool {
        self.iter().all(|&x| x == 0x00)
    }
}

/// A byte range within a raw page
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub struct Region {
    pub offset: usize,
    pub len: usize,
}

impl Region {
    pub const fn new(offset: usize, len: usize) -> Self {
        Self { offset, len }
    }

    pub fn end(&self) -> usize {
        self.offset + self.len
    }

    /// Like [Region::end], but `None` if the end is past `usize::MAX`
    pub fn checked_end(&self) -> Option<usize> {
        self.offset.checked_add(self.len)
    }

    pub fn range(&self) -> Range<usize> {
        self.offset..self.end()
    }

    /// The same region, moved `base` bytes further into the page
    pub fn shifted(self, base: usize) -> Self {
        Self::new(base + self.offset, self.len)
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.offset, self.len)
    }
}

/// Parse strings like "OFFSET+LEN"
impl FromStr for Region {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (offset, len) = parse_pair(s)?;
        Ok(Region::new(offset, len))
    }
}

/// The dimensions of a raw page
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PageGeometry {
    pub page_size: usize,
    pub spare_size: usize,
}

/// Parse strings like "PAGE+SPARE"
impl FromStr for PageGeometry {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (page_size, spare_size) = parse_pair(s)?;
        Ok(PageGeometry {
            page_size,
            spare_size,
        })
    }
}

fn parse_pair(s: &str) -> anyhow::Result<(usize, usize)> {
    let [a, b]: [&str; 2] = s
        .split('+')
        .collect::<Vec<_>>()
        .try_into()
        .map_err(|_| anyhow::anyhow!("expected #+#"))?;
    Ok((a.trim().parse()?, b.trim().parse()?))
}

/// Why a set of layout constants does not describe a usable page layout
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum InvalidLayout {
    #[error("page size, chunk size and parity size must all be nonzero")]
    ZeroSize,

    #[error("{given} parity regions given for {chunks} chunks")]
    ChunkCountMismatch { chunks: usize, given: usize },

    #[error("page size {page_size} does not split into {sectors} equal sectors")]
    UnevenSectors { page_size: usize, sectors: usize },

    #[error("chunk {chunk}: region {region} lies outside the {limit}-byte area")]
    OutOfBounds {
        chunk: usize,
        region: Region,
        limit: usize,
    },

    #[error("chunk {chunk}: parity region is {len} bytes, expected {expected}")]
    ParityLength {
        chunk: usize,
        len: usize,
        expected: usize,
    },

    #[error("a {page_size}+{spare_size}-byte raw page is too large")]
    TooLarge { page_size: usize, spare_size: usize },

    #[error("region {first} overlaps region {second}")]
    Overlap { first: Region, second: Region },

    #[error("layout reserves {layout} parity bytes per chunk, but the code produces {code}")]
    ParityMismatch { layout: usize, code: usize },

    #[error("layout expects t={layout}, but the code corrects t={code}")]
    CapacityMismatch { layout: u32, code: u32 },

    #[error("chunk {chunk}: {len}-byte message exceeds the code's maximum of {max}")]
    MessageTooLong { chunk: usize, len: usize, max: usize },
}

/// Where one ECC chunk lives within the raw page
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ChunkLayout {
    /// The chunk's share of the page's main data
    pub data: Region,

    /// Spare-area bytes covered by the same codeword (appended to the data to form the message)
    pub protected_spare: Option<Region>,

    /// The BCH parity for this chunk
    pub parity: Region,
}

impl ChunkLayout {
    /// Length of the codeword message (data plus protected spare)
    pub fn message_len(&self) -> usize {
        self.data.len + self.protected_spare.map_or(0, |r| r.len)
    }

    /// Every region of the chunk: data, protected spare (if any), then parity
    pub fn regions(&self) -> impl Iterator<Item = Region> {
        [Some(self.data), self.protected_spare, Some(self.parity)]
            .into_iter()
            .flatten()
    }
}

/// The split layout: all data first, with each chunk's parity somewhere in the spare area
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SplitLayout {
    pub page_size: usize,
    pub spare_size: usize,
    pub chunk_data_size: usize,
    pub parity_size: usize,
    pub error_capacity: u32,

    /// One region per chunk, with offsets relative to the start of the spare area
    pub spare_layout: Vec<Region>,
}

/// The interleaved (sector) layout
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct InterleavedLayout {
    pub page_size: usize,
    pub spare_size: usize,
    pub sectors: usize,
    pub fdm_size: usize,
    pub parity_size: usize,
    pub error_capacity: u32,
}

/// The complete, validated ECC geometry of one raw page.
///
/// Every region lies within the raw page, no two regions overlap, and the data regions, in
/// order, add up to the page size. Built once and shared read-only.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct EccParameters {
    page_size: usize,
    spare_size: usize,
    chunk_data_size: usize,
    parity_size: usize,
    error_capacity: u32,
    chunks: Box<[ChunkLayout]>,
}

impl EccParameters {
    /// Build the split layout.
    ///
    /// If the page size is not a multiple of the chunk size, the final chunk is shortened to
    /// cover only the remaining data bytes.
    pub fn split(layout: SplitLayout) -> Result<Self, InvalidLayout> {
        let SplitLayout {
            page_size,
            spare_size,
            chunk_data_size,
            parity_size,
            error_capacity,
            spare_layout,
        } = layout;

        if page_size == 0 || chunk_data_size == 0 || parity_size == 0 {
            return Err(InvalidLayout::ZeroSize);
        }
        check_raw_size(page_size, spare_size)?;

        let chunk_count = page_size.div_ceil(chunk_data_size);
        if spare_layout.len() != chunk_count {
            return Err(InvalidLayout::ChunkCountMismatch {
                chunks: chunk_count,
                given: spare_layout.len(),
            });
        }

        let mut chunks = Vec::with_capacity(chunk_count);
        for (index, &parity) in spare_layout.iter().enumerate() {
            if parity.checked_end().map_or(true, |end| end > spare_size) {
                return Err(InvalidLayout::OutOfBounds {
                    chunk: index,
                    region: parity,
                    limit: spare_size,
                });
            }

            let offset = index * chunk_data_size;
            let len = std::cmp::min(chunk_data_size, page_size - offset);
            chunks.push(ChunkLayout {
                data: Region::new(offset, len),
                protected_spare: None,
                parity: parity.shifted(page_size),
            });
        }

        Self {
            page_size,
            spare_size,
            chunk_data_size,
            parity_size,
            error_capacity,
            chunks: chunks.into(),
        }
        .validate()
    }

    /// Build the interleaved layout; the sectors must divide the page evenly.
    pub fn interleaved(layout: InterleavedLayout) -> Result<Self, InvalidLayout> {
        let InterleavedLayout {
            page_size,
            spare_size,
            sectors,
            fdm_size,
            parity_size,
            error_capacity,
        } = layout;

        if page_size == 0 || sectors == 0 || parity_size == 0 {
            return Err(InvalidLayout::ZeroSize);
        }
        if page_size % sectors != 0 {
            return Err(InvalidLayout::UnevenSectors { page_size, sectors });
        }
        check_raw_size(page_size, spare_size)?;

        // Offsets saturate rather than wrap, so oversized sectors fail the bounds check
        let chunk_data_size = page_size / sectors;
        let sector_size = chunk_data_size
            .saturating_add(fdm_size)
            .saturating_add(parity_size);
        let chunks = (0..sectors)
            .map(|index| {
                let base = index.saturating_mul(sector_size);
                let fdm = base.saturating_add(chunk_data_size);
                ChunkLayout {
                    data: Region::new(base, chunk_data_size),
                    protected_spare: (fdm_size > 0).then(|| Region::new(fdm, fdm_size)),
                    parity: Region::new(fdm.saturating_add(fdm_size), parity_size),
                }
            })
            .collect();

        Self {
            page_size,
            spare_size,
            chunk_data_size,
            parity_size,
            error_capacity,
            chunks,
        }
        .validate()
    }

    /// Check the region invariants of an assembled layout; afterward, no region end overflows
    fn validate(self) -> Result<Self, InvalidLayout> {
        let raw = self.raw_page_size();
        let mut all = Vec::new();

        for (index, chunk) in self.chunks.iter().enumerate() {
            if chunk.parity.len != self.parity_size {
                return Err(InvalidLayout::ParityLength {
                    chunk: index,
                    len: chunk.parity.len,
                    expected: self.parity_size,
                });
            }

            for region in chunk.regions() {
                if region.checked_end().map_or(true, |end| end > raw) {
                    return Err(InvalidLayout::OutOfBounds {
                        chunk: index,
                        region,
                        limit: raw,
                    });
                }
                all.push(region);
            }
        }

        // Sorted by offset, any overlap shows up between neighbors
        all.sort();
        for pair in all.windows(2) {
            if pair[0].end() > pair[1].offset {
                return Err(InvalidLayout::Overlap {
                    first: pair[0],
                    second: pair[1],
                });
            }
        }

        debug_assert_eq!(
            self.chunks.iter().map(|c| c.data.len).sum::<usize>(),
            self.page_size
        );

        Ok(self)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn spare_size(&self) -> usize {
        self.spare_size
    }

    /// The size of one page as stored in the dump, data and spare together
    pub fn raw_page_size(&self) -> usize {
        self.page_size + self.spare_size
    }

    /// The nominal data bytes per chunk (the last chunk of a split layout may be shorter)
    pub fn chunk_data_size(&self) -> usize {
        self.chunk_data_size
    }

    pub fn parity_size(&self) -> usize {
        self.parity_size
    }

    pub fn error_capacity(&self) -> u32 {
        self.error_capacity
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunks(&self) -> &[ChunkLayout] {
        &self.chunks
    }

    /// The parity regions of all chunks, relative to the start of the spare area, or `None` if
    /// some parity lives within the main data area (as in the interleaved layout)
    pub fn spare_layout(&self) -> Option<Vec<Region>> {
        self.chunks
            .iter()
            .map(|c| {
                let offset = c.parity.offset.checked_sub(self.page_size)?;
                Some(Region::new(offset, c.parity.len))
            })
            .collect()
    }
}

fn check_raw_size(page_size: usize, spare_size: usize) -> Result<(), InvalidLayout> {
    match page_size.checked_add(spare_size) {
        Some(_) => Ok(()),
        None => Err(InvalidLayout::TooLarge {
            page_size,
            spare_size,
        }),
    }
}

#[cfg(test)]
fn split_4k(spare_layout: Vec<Region>) -> SplitLayout {
    SplitLayout {
        page_size: 4096,
        spare_size: 224,
        chunk_data_size: 1024,
        parity_size: 23,
        error_capacity: 13,
        spare_layout,
    }
}

#[cfg(test)]
fn spare_regions(stride: usize) -> Vec<Region> {
    (0..4).map(|i| Region::new(i * stride + 8, 23)).collect()
}

#[test]
fn test_split_layout() -> anyhow::Result<()> {
    let params = EccParameters::split(split_4k(spare_regions(56)))?;
    assert_eq!(params.chunk_count(), 4);
    assert_eq!(params.raw_page_size(), 4096 + 224);

    let chunk = params.chunks()[2];
    assert_eq!(chunk.data, Region::new(2048, 1024));
    assert_eq!(chunk.parity, Region::new(4096 + 2 * 56 + 8, 23));
    assert_eq!(chunk.message_len(), 1024);
    assert_eq!(params.spare_layout(), Some(spare_regions(56)));

    Ok(())
}

#[test]
fn test_split_short_final_chunk() -> anyhow::Result<()> {
    let params = EccParameters::split(SplitLayout {
        page_size: 2500,
        spare_size: 64,
        chunk_data_size: 1024,
        parity_size: 8,
        error_capacity: 4,
        spare_layout: vec![Region::new(0, 8), Region::new(8, 8), Region::new(16, 8)],
    })?;

    let lens: Vec<_> = params.chunks().iter().map(|c| c.data.len).collect();
    assert_eq!(lens, [1024, 1024, 452]);
    assert_eq!(params.chunks()[2].data, Region::new(2048, 452));

    Ok(())
}

#[test]
fn test_split_invalid() {
    assert_eq!(
        EccParameters::split(split_4k(spare_regions(56)[..3].to_vec())),
        Err(InvalidLayout::ChunkCountMismatch {
            chunks: 4,
            given: 3
        })
    );

    // Regions 20 bytes apart, but 23 bytes long
    assert!(matches!(
        EccParameters::split(split_4k(spare_regions(20))),
        Err(InvalidLayout::Overlap { .. })
    ));

    // Last region runs past the spare area
    let mut regions = spare_regions(56);
    regions[3] = Region::new(210, 23);
    assert_eq!(
        EccParameters::split(split_4k(regions)),
        Err(InvalidLayout::OutOfBounds {
            chunk: 3,
            region: Region::new(210, 23),
            limit: 224
        })
    );

    let mut regions = spare_regions(56);
    regions[1].len = 22;
    assert!(matches!(
        EccParameters::split(split_4k(regions)),
        Err(InvalidLayout::ParityLength { chunk: 1, .. })
    ));

    let mut layout = split_4k(spare_regions(56));
    layout.chunk_data_size = 0;
    assert_eq!(EccParameters::split(layout), Err(InvalidLayout::ZeroSize));
}

#[test]
fn test_oversized_layouts() {
    // Regions whose ends don't fit in a usize are out of bounds, not a panic
    let mut regions = spare_regions(56);
    regions[0] = Region::new(usize::MAX, 23);
    assert_eq!(
        EccParameters::split(split_4k(regions)),
        Err(InvalidLayout::OutOfBounds {
            chunk: 0,
            region: Region::new(usize::MAX, 23),
            limit: 224
        })
    );

    let mut layout = split_4k(spare_regions(56));
    layout.spare_size = usize::MAX;
    assert!(matches!(
        EccParameters::split(layout),
        Err(InvalidLayout::TooLarge { .. })
    ));

    let layout = InterleavedLayout {
        page_size: 4096,
        spare_size: 256,
        sectors: 4,
        fdm_size: usize::MAX,
        parity_size: 56,
        error_capacity: 32,
    };
    assert!(matches!(
        EccParameters::interleaved(layout),
        Err(InvalidLayout::OutOfBounds { chunk: 0, .. })
    ));
    assert!(matches!(
        EccParameters::interleaved(InterleavedLayout {
            fdm_size: 8,
            parity_size: usize::MAX,
            ..layout
        }),
        Err(InvalidLayout::OutOfBounds { chunk: 0, .. })
    ));
    assert!(matches!(
        EccParameters::interleaved(InterleavedLayout {
            fdm_size: 8,
            parity_size: usize::MAX / 2,
            ..layout
        }),
        Err(InvalidLayout::OutOfBounds { chunk: 0, .. })
    ));
}

#[test]
fn test_interleaved_layout() -> anyhow::Result<()> {
    let layout = InterleavedLayout {
        page_size: 4096,
        spare_size: 256,
        sectors: 4,
        fdm_size: 8,
        parity_size: 56,
        error_capacity: 32,
    };
    let params = EccParameters::interleaved(layout)?;

    let chunk = params.chunks()[1];
    assert_eq!(chunk.data, Region::new(1088, 1024));
    assert_eq!(chunk.protected_spare, Some(Region::new(2112, 8)));
    assert_eq!(chunk.parity, Region::new(2120, 56));
    assert_eq!(chunk.message_len(), 1032);
    assert_eq!(params.chunks()[3].parity.end(), 4352);
    assert_eq!(params.spare_layout(), None);

    // One more byte of parity per sector no longer fits
    assert!(matches!(
        EccParameters::interleaved(InterleavedLayout {
            parity_size: 57,
            ..layout
        }),
        Err(InvalidLayout::OutOfBounds { chunk: 3, .. })
    ));

    assert_eq!(
        EccParameters::interleaved(InterleavedLayout {
            sectors: 3,
            ..layout
        }),
        Err(InvalidLayout::UnevenSectors {
            page_size: 4096,
            sectors: 3
        })
    );

    Ok(())
}

#[test]
fn test_parse_geometry() -> anyhow::Result<()> {
    let geometry: PageGeometry = "4096+256".parse()?;
    assert_eq!(geometry.page_size, 4096);
    assert_eq!(geometry.spare_size, 256);
    assert_eq!("64+23".parse::<Region>()?, Region::new(64, 23));

    assert!("4096".parse::<PageGeometry>().is_err());
    assert!("4096+x".parse::<PageGeometry>().is_err());
    assert!("1+2+3".parse::<Region>().is_err());

    Ok(())
}
