//! Correction of a single ECC chunk, in place within its page buffer.

use std::fmt;

use super::{Correction, Corrector, PrimitiveError};
use crate::nand::{ChunkLayout, PageUtil};

/// What correcting one chunk found
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ChunkStatus {
    /// No bit errors (or an erased chunk)
    Clean,

    /// This many bit errors were found and fixed
    Corrected(u32),

    /// Too many bit errors; the chunk's bytes were left as read
    Uncorrectable,
}

impl ChunkStatus {
    /// Number of bits this status says were fixed
    pub fn bit_errors(&self) -> u32 {
        match self {
            Self::Corrected(n) => *n,
            _ => 0,
        }
    }
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clean => write!(f, "clean"),
            Self::Corrected(n) => write!(f, "corrected({n})"),
            Self::Uncorrectable => write!(f, "uncorrectable"),
        }
    }
}

/// One chunk of a raw page: its layout, and the page buffer it lives in
#[derive(Debug)]
pub struct Chunk<'a> {
    layout: &'a ChunkLayout,
    page: &'a mut [u8],
}

impl<'a> Chunk<'a> {
    /// Borrow one chunk out of a raw page buffer, which must contain all of its regions
    pub fn new(layout: &'a ChunkLayout, page: &'a mut [u8]) -> Self {
        let end = layout.regions().map(|r| r.end()).max();
        assert!(
            end <= Some(page.len()),
            "chunk does not fit in page buffer"
        );
        Self { layout, page }
    }

    pub fn data(&self) -> &[u8] {
        &self.page[self.layout.data.range()]
    }

    pub fn protected_spare(&self) -> Option<&[u8]> {
        self.layout.protected_spare.map(|r| &self.page[r.range()])
    }

    pub fn parity(&self) -> &[u8] {
        &self.page[self.layout.parity.range()]
    }

    /// Is every byte of the chunk (data, spare and parity) in the erased state?
    pub fn is_erased(&self) -> bool {
        self.data().is_erased()
            && self.protected_spare().map_or(true, PageUtil::is_erased)
            && self.parity().is_erased()
    }

    /// Gather the codeword message (data followed by protected spare) into `buf`
    fn read_message(&self, buf: &mut Vec<u8>) {
        buf.clear();
        buf.extend_from_slice(self.data());
        if let Some(spare) = self.protected_spare() {
            buf.extend_from_slice(spare);
        }
    }

    /// Scatter a corrected message and parity back over the chunk's regions
    fn write_back(&mut self, message: &[u8], parity: &[u8]) {
        let (data, spare) = message.split_at(self.layout.data.len);
        self.page[self.layout.data.range()].copy_from_slice(data);
        if let Some(region) = self.layout.protected_spare {
            self.page[region.range()].copy_from_slice(spare);
        }
        self.page[self.layout.parity.range()].copy_from_slice(parity);
    }
}

/// Drives a [Corrector] over chunks, applying its corrections in place
pub struct ChunkCorrector<'c, C: ?Sized> {
    corrector: &'c C,

    /// Any larger error count from the corrector is a fault
    capacity: u32,

    message: Vec<u8>,
}

impl<'c, C: Corrector + ?Sized> ChunkCorrector<'c, C> {
    pub fn new(corrector: &'c C, capacity: u32) -> Self {
        Self {
            corrector,
            capacity,
            message: Vec::new(),
        }
    }

    pub fn corrector(&self) -> &'c C {
        self.corrector
    }

    /// Correct one chunk.
    ///
    /// Corrections are written back only when the corrector reports success; an uncorrectable
    /// chunk is left exactly as read. Correcting a clean chunk changes nothing.
    pub fn correct(&mut self, mut chunk: Chunk<'_>) -> Result<ChunkStatus, PrimitiveError> {
        // Erased chunks were never programmed, so they carry no valid parity
        if chunk.is_erased() {
            return Ok(ChunkStatus::Clean);
        }

        chunk.read_message(&mut self.message);

        match self.corrector.correct(&self.message, chunk.parity())? {
            Correction::Clean => Ok(ChunkStatus::Clean),
            Correction::Uncorrectable => Ok(ChunkStatus::Uncorrectable),
            Correction::Corrected {
                message,
                parity,
                errors,
            } => {
                if errors > self.capacity {
                    return Err(PrimitiveError::Failed(format!(
                        "corrector reported {errors} errors, beyond its capacity of {}",
                        self.capacity
                    )));
                }
                if message.len() != self.message.len() || parity.len() != chunk.parity().len() {
                    return Err(PrimitiveError::Failed(
                        "corrector returned a codeword of the wrong size".into(),
                    ));
                }
                if errors == 0 {
                    return Ok(ChunkStatus::Clean);
                }

                chunk.write_back(&message, &parity);
                Ok(ChunkStatus::Corrected(errors))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bch::tests::{flip, XorShift};
    use crate::bch::{Bch, BchConfig};
    use crate::ecc::fake::FakeCorrector;
    use crate::ecc::BchCorrector;
    use crate::nand::Region;

    /// A 64-byte buffer with one chunk: data at 4..36, spare at 40..44, parity at 48..55
    const LAYOUT: ChunkLayout = ChunkLayout {
        data: Region::new(4, 32),
        protected_spare: Some(Region::new(40, 4)),
        parity: Region::new(48, 7),
    };

    fn bch_page() -> anyhow::Result<(BchCorrector, Vec<u8>)> {
        let bch = Bch::new(BchConfig {
            prim_poly: 0x201B,
            t: 4,
            swap_bits: true,
        })?;

        let mut page: Vec<u8> = (0..64).map(|i| (i * 7) as u8).collect();
        let mut message = page[LAYOUT.data.range()].to_vec();
        message.extend_from_slice(&page[40..44]);
        let parity = bch.encode(&message)?;
        page[LAYOUT.parity.range()].copy_from_slice(&parity);

        Ok((BchCorrector::new(bch), page))
    }

    #[test]
    fn test_correct_in_place() -> anyhow::Result<()> {
        let (corrector, page) = bch_page()?;
        let mut chunks = ChunkCorrector::new(&corrector, 4);
        let mut rng = XorShift(0x9E3779B97F4A7C15);

        // Flip bits of a blank codeword, then map the damage onto the page's regions
        for k in 1..=4 {
            let mut bad = page.clone();
            for bit in rng.distinct(k, 36 * 8 + corrector.bch().ecc_bits()) {
                let mut message = vec![0u8; 36];
                let mut parity = vec![0u8; 7];
                flip(&mut message, &mut parity, bit, true);
                for (i, x) in message.iter().enumerate() {
                    let offset = if i < 32 { 4 + i } else { 40 + i - 32 };
                    bad[offset] ^= x;
                }
                for (i, x) in parity.iter().enumerate() {
                    bad[48 + i] ^= x;
                }
            }

            let status = chunks.correct(Chunk::new(&LAYOUT, &mut bad))?;
            assert_eq!(status, ChunkStatus::Corrected(k as u32));
            assert_eq!(bad, page);

            // Idempotent: a second pass finds nothing to do
            let status = chunks.correct(Chunk::new(&LAYOUT, &mut bad))?;
            assert_eq!(status, ChunkStatus::Clean);
            assert_eq!(bad, page);
        }

        Ok(())
    }

    #[test]
    fn test_bytes_outside_chunk_untouched() -> anyhow::Result<()> {
        let (corrector, page) = bch_page()?;
        let mut chunks = ChunkCorrector::new(&corrector, 4);

        // Bytes between regions are not part of the codeword; damage there is not "corrected"
        let mut bad = page.clone();
        bad[0] ^= 0xFF;
        bad[38] ^= 0x0F;
        bad[60] ^= 0x80;
        assert_eq!(
            chunks.correct(Chunk::new(&LAYOUT, &mut bad))?,
            ChunkStatus::Clean
        );

        bad[10] ^= 0x01;
        assert_eq!(
            chunks.correct(Chunk::new(&LAYOUT, &mut bad))?,
            ChunkStatus::Corrected(1)
        );
        assert_eq!(bad[10], page[10]);
        assert_eq!(bad[0], page[0] ^ 0xFF);
        assert_eq!(bad[38], page[38] ^ 0x0F);

        Ok(())
    }

    #[test]
    fn test_uncorrectable_left_alone() -> anyhow::Result<()> {
        let (corrector, page) = bch_page()?;
        let mut chunks = ChunkCorrector::new(&corrector, 4);

        let mut bad = page.clone();
        for offset in [4, 9, 15, 22, 30, 41] {
            bad[offset] ^= 0x11;
        }
        let corrupted = bad.clone();

        assert_eq!(
            chunks.correct(Chunk::new(&LAYOUT, &mut bad))?,
            ChunkStatus::Uncorrectable
        );
        assert_eq!(bad, corrupted);

        Ok(())
    }

    #[test]
    fn test_erased_chunk_skips_decoder() -> anyhow::Result<()> {
        let corrector = FakeCorrector::new(7, 4);
        let mut chunks = ChunkCorrector::new(&corrector, 4);

        let mut page = vec![0xFF; 64];
        assert_eq!(
            chunks.correct(Chunk::new(&LAYOUT, &mut page))?,
            ChunkStatus::Clean
        );
        assert_eq!(corrector.calls.get(), 0);

        // Bytes outside the chunk's regions don't count against erasure
        page[0] = 0;
        assert_eq!(
            chunks.correct(Chunk::new(&LAYOUT, &mut page))?,
            ChunkStatus::Clean
        );
        assert_eq!(corrector.calls.get(), 0);

        Ok(())
    }

    #[test]
    fn test_fake_outcomes() -> anyhow::Result<()> {
        let corrector = FakeCorrector::new(7, 4);
        let mut chunks = ChunkCorrector::new(&corrector, 4);
        let mut page = vec![0x33; 64];

        page[48] = 3;
        assert_eq!(
            chunks.correct(Chunk::new(&LAYOUT, &mut page))?,
            ChunkStatus::Corrected(3)
        );
        assert!(page[4..36].iter().all(|&x| x == 0));
        assert!(page[40..44].iter().all(|&x| x == 0));
        assert_eq!(page[48], 0);
        assert_eq!(page[36], 0x33);

        page[48] = 9;
        assert_eq!(
            chunks.correct(Chunk::new(&LAYOUT, &mut page))?,
            ChunkStatus::Uncorrectable
        );

        page[48] = 0xEE;
        assert!(chunks.correct(Chunk::new(&LAYOUT, &mut page)).is_err());

        Ok(())
    }
}
