//! The hardware ECC configurations of known controllers.
//!
//! MediaTek's NFI controller on the MT8167 reads pages as a run of sectors (see
//! [crate::nand]), each protected by its own BCH codeword over the sector data and its FDM
//! bytes. The ECC engine can be set up for 1 KiB or 512 B sectors; the strengths below are
//! the ones it uses to fill a 256-byte spare area.

use anyhow::{Context, Result};

use crate::bch::{Bch, BchConfig};
use crate::ecc::BchCorrector;
use crate::nand::{EccParameters, InterleavedLayout, PageGeometry, Region, SplitLayout};

/// One fixed controller configuration
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Preset {
    pub name: &'static str,
    pub geometry: PageGeometry,

    /// How many sectors (ECC chunks) share each page
    pub sectors: usize,

    /// Bytes of protected spare metadata stored after each sector's data
    pub fdm_size: usize,

    pub code: BchConfig,
}

/// Four 1 KiB sectors, 32 bits correctable in each
pub const MT8167_4X: Preset = Preset {
    name: "mt8167-4x",
    geometry: PageGeometry {
        page_size: 4096,
        spare_size: 256,
    },
    sectors: 4,
    fdm_size: 8,
    code: BchConfig {
        prim_poly: 0x4443,
        t: 32,
        swap_bits: true,
    },
};

/// Eight 512 B sectors, 12 bits correctable in each
pub const MT8167_8X: Preset = Preset {
    name: "mt8167-8x",
    geometry: PageGeometry {
        page_size: 4096,
        spare_size: 256,
    },
    sectors: 8,
    fdm_size: 8,
    code: BchConfig {
        prim_poly: 0x201B,
        t: 12,
        swap_bits: true,
    },
};

pub const PRESETS: &[Preset] = &[MT8167_4X, MT8167_8X];

/// Look up a preset by name.
pub fn find(name: &str) -> Option<&'static Preset> {
    PRESETS.iter().find(|p| p.name.eq_ignore_ascii_case(name))
}

impl Preset {
    /// Build the codec and the interleaved page layout it implies.
    pub fn build(&self) -> Result<(EccParameters, BchCorrector)> {
        let bch = Bch::new(self.code).context("Invalid BCH parameters")?;
        let params = EccParameters::interleaved(InterleavedLayout {
            page_size: self.geometry.page_size,
            spare_size: self.geometry.spare_size,
            sectors: self.sectors,
            fdm_size: self.fdm_size,
            parity_size: bch.ecc_bytes(),
            error_capacity: bch.t(),
        })
        .with_context(|| format!("Invalid page layout for {}", self.name))?;

        Ok((params, BchCorrector::new(bch)))
    }

    /// Build the same code over a split layout instead: all data first, with the parity of
    /// each chunk at the given spare-area regions. The FDM size does not apply.
    ///
    /// Without a `chunk_data_size`, the page is divided evenly among the regions.
    pub fn build_split(
        &self,
        spare_layout: Vec<Region>,
        chunk_data_size: Option<usize>,
    ) -> Result<(EccParameters, BchCorrector)> {
        let bch = Bch::new(self.code).context("Invalid BCH parameters")?;
        let chunk_data_size = match chunk_data_size {
            Some(size) => size,
            None => {
                anyhow::ensure!(!spare_layout.is_empty(), "No parity regions given");
                self.geometry.page_size.div_ceil(spare_layout.len())
            }
        };

        let params = EccParameters::split(SplitLayout {
            page_size: self.geometry.page_size,
            spare_size: self.geometry.spare_size,
            chunk_data_size,
            parity_size: bch.ecc_bytes(),
            error_capacity: bch.t(),
            spare_layout,
        })
        .context("Invalid split page layout")?;

        Ok((params, BchCorrector::new(bch)))
    }
}

#[test]
fn test_presets() -> Result<()> {
    let (params, corrector) = MT8167_4X.build()?;
    assert_eq!(params.raw_page_size(), 4352);
    assert_eq!(params.chunk_count(), 4);
    assert_eq!(params.parity_size(), 56);
    assert_eq!(corrector.shape().capacity, 32);
    // The four sectors fill the raw page exactly
    assert_eq!(params.chunks()[3].parity.end(), 4352);
    assert_eq!(params.chunks()[1].data, Region::new(1088, 1024));
    assert_eq!(params.chunks()[1].protected_spare, Some(Region::new(2112, 8)));

    let (params, corrector) = MT8167_8X.build()?;
    assert_eq!(params.chunk_count(), 8);
    assert_eq!(params.parity_size(), 20);
    assert_eq!(corrector.shape().capacity, 12);
    assert_eq!(params.chunks()[7].parity.end(), 8 * 540);

    assert_eq!(find("MT8167-8x"), Some(&MT8167_8X));
    assert_eq!(find("mt6582"), None);

    Ok(())
}

#[test]
fn test_build_split() -> Result<()> {
    let preset = Preset {
        code: BchConfig {
            prim_poly: 0x4443,
            t: 13,
            swap_bits: true,
        },
        geometry: PageGeometry {
            page_size: 4096,
            spare_size: 224,
        },
        ..MT8167_4X
    };

    let layout: Vec<_> = (0..4).map(|i| Region::new(i * 56 + 8, 23)).collect();
    let (params, _) = preset.build_split(layout.clone(), None)?;
    assert_eq!(params.chunk_data_size(), 1024);
    assert_eq!(params.spare_layout(), Some(layout.clone()));

    // Parity regions sized for a different code are rejected
    let short: Vec<_> = (0..4).map(|i| Region::new(i * 56 + 8, 22)).collect();
    assert!(preset.build_split(short, None).is_err());

    // As is a chunk size that doesn't match the region count
    assert!(preset.build_split(layout, Some(512)).is_err());
    assert!(preset.build_split(Vec::new(), None).is_err());

    Ok(())
}

/// A whole preset page: programmed, damaged, then read back through the stream driver
#[test]
fn test_mt8167_page_round_trip() -> Result<()> {
    use crate::bch::tests::XorShift;
    use crate::ecc::{encode_page, PageStatus, RepairPolicy};
    use crate::stream::{OutputMode, StreamDriver};

    for preset in PRESETS {
        let (params, corrector) = preset.build()?;

        let mut rng = XorShift(0x8167);
        let mut page: Vec<u8> = (0..params.raw_page_size())
            .map(|_| rng.next_below(256) as u8)
            .collect();
        encode_page(&params, corrector.bch(), &mut page)?;

        // Damage each sector's data and FDM with as many errors as it can take
        let mut damaged = page.clone();
        let t = preset.code.t as usize;
        for chunk in params.chunks() {
            let bits = chunk.data.len * 8 + preset.fdm_size * 8;
            for bit in rng.distinct(t, bits) {
                damaged[chunk.data.offset + bit / 8] ^= 1 << (bit % 8);
            }
        }

        let mut driver = StreamDriver::new(
            &params,
            &corrector,
            corrector.shape(),
            RepairPolicy::Partial,
            OutputMode::Raw,
        )?;
        let mut output = Vec::new();
        let mut reports = Vec::new();
        let stats = driver.run(&mut &damaged[..], &mut output, &mut reports)?;

        assert_eq!(output, page, "{}", preset.name);
        assert_eq!(reports[0].overall, PageStatus::Corrected);
        assert_eq!(
            stats.total_bit_errors_corrected,
            (t * params.chunk_count()) as u64
        );
    }

    Ok(())
}
