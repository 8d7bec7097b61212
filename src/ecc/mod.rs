//! The correction pipeline: a [Corrector] (the BCH capability), the chunk corrector built on it,
//! and the page processor built on that.

pub mod chunk;
pub mod page;

pub use chunk::{Chunk, ChunkCorrector, ChunkStatus};
pub use page::{PageProcessor, PageReport, PageStatus, RepairPolicy};

use crate::bch::{Bch, BchError, Decoded};
use crate::nand::{EccParameters, InvalidLayout};

use thiserror::Error;

/// A failure of the correction primitive itself, as opposed to an uncorrectable codeword
#[derive(Error, Debug)]
pub enum PrimitiveError {
    #[error(transparent)]
    Bch(#[from] BchError),

    #[error("{0}")]
    Failed(String),
}

/// The outcome of a [Corrector::correct] call
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Correction {
    /// The codeword had no errors
    Clean,

    /// The codeword had `errors` bit errors, which have been fixed in these copies
    Corrected {
        message: Vec<u8>,
        parity: Vec<u8>,
        errors: u32,
    },

    /// The codeword has more errors than the code can fix
    Uncorrectable,
}

/// Represents the error-correcting capability for one codeword.
///
/// Implementors never modify the caller's buffers; corrected data is returned as copies.
pub trait Corrector {
    /// Check (and possibly correct) one codeword
    fn correct(&self, message: &[u8], parity: &[u8]) -> Result<Correction, PrimitiveError>;
}

/// The dimensions of a code, for checking it against a page layout
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CodeShape {
    /// How many bytes of parity each codeword has
    pub parity_len: usize,

    /// The maximum number of bit errors corrected per codeword
    pub capacity: u32,

    /// The longest supported message
    pub max_message_len: usize,
}

impl CodeShape {
    /// Check that this code fits every chunk of a layout
    pub fn check(&self, params: &EccParameters) -> Result<(), InvalidLayout> {
        if self.parity_len != params.parity_size() {
            return Err(InvalidLayout::ParityMismatch {
                layout: params.parity_size(),
                code: self.parity_len,
            });
        }
        if self.capacity != params.error_capacity() {
            return Err(InvalidLayout::CapacityMismatch {
                layout: params.error_capacity(),
                code: self.capacity,
            });
        }
        for (index, chunk) in params.chunks().iter().enumerate() {
            if chunk.message_len() > self.max_message_len {
                return Err(InvalidLayout::MessageTooLong {
                    chunk: index,
                    len: chunk.message_len(),
                    max: self.max_message_len,
                });
            }
        }
        Ok(())
    }
}

/// A [Corrector] backed by the in-crate BCH codec
#[derive(Debug, Clone)]
pub struct BchCorrector {
    bch: Bch,
}

impl BchCorrector {
    pub fn new(bch: Bch) -> Self {
        Self { bch }
    }

    pub fn bch(&self) -> &Bch {
        &self.bch
    }

    pub fn shape(&self) -> CodeShape {
        CodeShape {
            parity_len: self.bch.ecc_bytes(),
            capacity: self.bch.t(),
            max_message_len: self.bch.max_message_len(),
        }
    }
}

impl Corrector for BchCorrector {
    fn correct(&self, message: &[u8], parity: &[u8]) -> Result<Correction, PrimitiveError> {
        let mut message = message.to_vec();
        let mut parity = parity.to_vec();

        Ok(match self.bch.decode(&mut message, &mut parity)? {
            Decoded::Clean => Correction::Clean,
            Decoded::Corrected(errors) => Correction::Corrected {
                message,
                parity,
                errors,
            },
            Decoded::Uncorrectable => Correction::Uncorrectable,
        })
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! A deterministic stand-in for the BCH primitive

    use super::*;

    use std::cell::Cell;

    /// Treats the first byte of each parity as a count of "errors" in the message:
    ///
    /// - `0x00` or `0xFF`: clean
    /// - `1..=capacity`: that many errors; "correcting" zeroes the message and parity byte 0
    /// - `0xEE`: the primitive itself fails
    /// - anything else: uncorrectable
    pub(crate) struct FakeCorrector {
        pub(crate) parity_len: usize,
        pub(crate) capacity: u32,
        pub(crate) calls: Cell<usize>,
    }

    impl FakeCorrector {
        pub(crate) fn new(parity_len: usize, capacity: u32) -> Self {
            Self {
                parity_len,
                capacity,
                calls: Cell::new(0),
            }
        }

        pub(crate) fn shape(&self) -> CodeShape {
            CodeShape {
                parity_len: self.parity_len,
                capacity: self.capacity,
                max_message_len: usize::MAX,
            }
        }
    }

    impl Corrector for FakeCorrector {
        fn correct(&self, message: &[u8], parity: &[u8]) -> Result<Correction, PrimitiveError> {
            self.calls.set(self.calls.get() + 1);
            match parity[0] {
                0x00 | 0xFF => Ok(Correction::Clean),
                0xEE => Err(PrimitiveError::Failed("fake primitive fault".into())),
                n if u32::from(n) <= self.capacity => {
                    let mut parity = parity.to_vec();
                    parity[0] = 0;
                    Ok(Correction::Corrected {
                        message: vec![0; message.len()],
                        parity,
                        errors: n.into(),
                    })
                }
                _ => Ok(Correction::Uncorrectable),
            }
        }
    }
}

/// Fill in the parity of every chunk of a raw page, as the controller would when programming it
#[cfg(test)]
pub(crate) fn encode_page(
    params: &crate::nand::EccParameters,
    bch: &Bch,
    page: &mut [u8],
) -> anyhow::Result<()> {
    for chunk in params.chunks() {
        let mut message = page[chunk.data.range()].to_vec();
        if let Some(spare) = chunk.protected_spare {
            message.extend_from_slice(&page[spare.range()]);
        }
        page[chunk.parity.range()].copy_from_slice(&bch.encode(&message)?);
    }
    Ok(())
}

#[test]
fn test_bch_corrector_copies() -> anyhow::Result<()> {
    use crate::bch::BchConfig;

    let bch = Bch::new(BchConfig {
        prim_poly: 0x201B,
        t: 4,
        swap_bits: true,
    })?;
    let message = vec![0x5A; 256];
    let parity = bch.encode(&message)?;
    let corrector = BchCorrector::new(bch);
    assert_eq!(corrector.shape().parity_len, 7);
    assert_eq!(corrector.shape().capacity, 4);

    assert_eq!(corrector.correct(&message, &parity)?, Correction::Clean);

    let mut bad = message.clone();
    bad[17] ^= 0x21;
    match corrector.correct(&bad, &parity)? {
        Correction::Corrected {
            message: fixed,
            parity: fixed_parity,
            errors,
        } => {
            assert_eq!(errors, 2);
            assert_eq!(fixed, message);
            assert_eq!(fixed_parity, parity);
        }
        other => panic!("unexpected {other:?}"),
    }
    // The caller's copy is untouched
    assert_eq!(bad[17], 0x5A ^ 0x21);

    assert!(matches!(
        corrector.correct(&message, &parity[1..]),
        Err(PrimitiveError::Bch(BchError::ParityLength { .. }))
    ));

    Ok(())
}
