//! Arithmetic over GF(2^m), by way of exponent/logarithm tables

use super::BchError;

/// Smallest and largest field degrees supported; elements must fit in a `u16`
const MIN_DEGREE: u32 = 4;
const MAX_DEGREE: u32 = 16;

/// A binary extension field, GF(2^m), generated by a primitive polynomial
#[derive(Debug, Clone)]
pub struct GaloisField {
    degree: u32,

    /// `exp[i]` = α^i, for i in 0..n
    exp: Box<[u16]>,

    /// `log[α^i]` = i; `log[0]` is meaningless
    log: Box<[u16]>,
}

impl GaloisField {
    /// Build the tables for the field generated by `prim_poly` (e.g. `0x201B` for
    /// x^13 + x^4 + x^3 + x + 1).
    pub fn new(prim_poly: u32) -> Result<Self, BchError> {
        let degree = u32::BITS - 1 - prim_poly.leading_zeros().min(u32::BITS - 1);
        if !(MIN_DEGREE..=MAX_DEGREE).contains(&degree) {
            return Err(BchError::UnsupportedField { prim_poly });
        }

        let order = (1usize << degree) - 1;
        let mut exp = vec![0u16; order].into_boxed_slice();
        let mut log = vec![0u16; order + 1].into_boxed_slice();

        let mut x: u32 = 1;
        for i in 0..order {
            // Returning to 1 early (or collapsing to 0) means α does not generate the field
            if x == 0 || (i != 0 && x == 1) {
                return Err(BchError::NotPrimitive { prim_poly });
            }

            exp[i] = x as u16;
            log[x as usize] = i as u16;

            x <<= 1;
            if x & (1 << degree) != 0 {
                x ^= prim_poly;
            }
        }

        if x != 1 {
            return Err(BchError::NotPrimitive { prim_poly });
        }

        Ok(Self { degree, exp, log })
    }

    /// The extension degree `m`
    pub fn degree(&self) -> u32 {
        self.degree
    }

    /// The multiplicative order of α, n = 2^m - 1
    pub fn order(&self) -> usize {
        self.exp.len()
    }

    /// α^power, for any power (reduced modulo n)
    pub fn exp(&self, power: usize) -> u16 {
        self.exp[power % self.order()]
    }

    /// The discrete logarithm of a nonzero element
    pub fn log(&self, x: u16) -> usize {
        debug_assert!(x != 0, "log(0) is undefined");
        self.log[x as usize].into()
    }

    pub fn mul(&self, a: u16, b: u16) -> u16 {
        if a == 0 || b == 0 {
            return 0;
        }
        self.exp(self.log(a) + self.log(b))
    }

    /// Divide `a` by the nonzero element `b`
    pub fn div(&self, a: u16, b: u16) -> u16 {
        if a == 0 {
            return 0;
        }
        self.exp(self.log(a) + self.order() - self.log(b))
    }
}

#[test]
fn test_small_field() -> Result<(), BchError> {
    // GF(16) from x^4 + x + 1
    let field = GaloisField::new(0x13)?;
    assert_eq!(field.degree(), 4);
    assert_eq!(field.order(), 15);
    assert_eq!(field.exp(4), 0b0011);
    assert_eq!(field.exp(15), 1);
    assert_eq!(field.log(0b0011), 4);

    for a in 1..16u16 {
        assert_eq!(field.mul(a, field.div(1, a)), 1);
        assert_eq!(field.div(field.mul(a, 7), 7), a);
    }
    assert_eq!(field.mul(0, 9), 0);

    Ok(())
}

#[test]
fn test_rejects_bad_polynomials() {
    // x^4 + x^3 + x^2 + x + 1 is irreducible but not primitive (α has order 5)
    assert!(matches!(
        GaloisField::new(0x1F),
        Err(BchError::NotPrimitive { .. })
    ));
    // Reducible: x^4 + x^2
    assert!(matches!(
        GaloisField::new(0x14),
        Err(BchError::NotPrimitive { .. })
    ));
    assert!(matches!(
        GaloisField::new(0x7),
        Err(BchError::UnsupportedField { .. })
    ));
    assert!(GaloisField::new(0x201B).is_ok());
    assert!(GaloisField::new(0x4443).is_ok());
}
