//! A binary BCH codec, compatible with the conventions of the Linux kernel's `lib/bch.c` (and
//! therefore with dumps taken from controllers that the kernel's drivers read through it).
//!
//! The codeword is the message bits, taken MSB-first from each byte (LSB-first if `swap_bits`
//! is set), followed by `ecc_bits` parity bits, stored left-aligned in `ecc_bytes` bytes. The
//! code is shortened: only the last `8 * len + ecc_bits` positions of the full length-`2^m - 1`
//! code are ever used.
//!
//! Decoding is the textbook pipeline:
//! 1. Divide the received word by the generator polynomial; a zero remainder means no errors.
//! 2. Evaluate the remainder at α^1..α^2t to get the syndromes.
//! 3. Berlekamp-Massey turns the syndromes into the error locator polynomial σ(x).
//! 4. A Chien search finds the roots of σ(x), each of which names one flipped bit.

mod field;

pub use field::GaloisField;

use thiserror::Error;

/// Errors in configuring or invoking the codec. An uncorrectable codeword is *not* an error;
/// see [Decoded::Uncorrectable].
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum BchError {
    #[error("polynomial {prim_poly:#x} is of unsupported degree")]
    UnsupportedField { prim_poly: u32 },

    #[error("polynomial {prim_poly:#x} is not primitive")]
    NotPrimitive { prim_poly: u32 },

    #[error("error capacity t={t} is not possible in GF(2^{m})")]
    InvalidStrength { t: u32, m: u32 },

    #[error("message of {len} bytes exceeds the codeword capacity of {max} bytes")]
    MessageTooLong { len: usize, max: usize },

    #[error("parity of {len} bytes given, code uses {expected}")]
    ParityLength { len: usize, expected: usize },
}

/// Parameters of a BCH code
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BchConfig {
    /// The primitive polynomial generating GF(2^m); its degree selects `m`
    pub prim_poly: u32,

    /// How many bit errors per codeword can be corrected
    pub t: u32,

    /// Take the bits of each byte LSB-first (for both message and parity)
    pub swap_bits: bool,
}

/// The result of decoding one codeword
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Decoded {
    /// The codeword was already valid
    Clean,

    /// This many bits (somewhere in the message or parity) were flipped back
    Corrected(u32),

    /// More errors than the code can correct; nothing was modified
    Uncorrectable,
}

/// A polynomial over GF(2) of bounded degree, one bit per coefficient (bit `d` is x^d)
#[derive(Debug, Clone, Eq, PartialEq)]
struct BitPoly {
    words: Vec<u64>,
    len: usize,
}

impl BitPoly {
    fn zero(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    fn get(&self, d: usize) -> bool {
        self.words[d / 64] & (1 << (d % 64)) != 0
    }

    fn toggle(&mut self, d: usize) {
        self.words[d / 64] ^= 1 << (d % 64);
    }

    fn is_zero(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    fn xor_assign(&mut self, other: &Self) {
        for (a, b) in self.words.iter_mut().zip(&other.words) {
            *a ^= b;
        }
    }

    /// Degrees of all nonzero coefficients
    fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(|&d| self.get(d))
    }

    /// Advance the division LFSR by one input bit: `self = (self * x + bit * x^len) mod g`,
    /// where `low` holds g(x) without its leading x^len term.
    fn clock(&mut self, bit: bool, low: &Self) {
        let feedback = bit ^ self.get(self.len - 1);

        let mut carry = 0;
        for word in self.words.iter_mut() {
            let next = *word >> 63;
            *word = (*word << 1) | carry;
            carry = next;
        }
        if self.len % 64 != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1 << (self.len % 64)) - 1;
            }
        }

        if feedback {
            self.xor_assign(low);
        }
    }
}

/// A binary BCH encoder/decoder for one fixed code
#[derive(Debug, Clone)]
pub struct Bch {
    field: GaloisField,
    t: usize,
    swap_bits: bool,
    ecc_bits: usize,
    ecc_bytes: usize,

    /// The generator polynomial, minus its leading term
    generator: BitPoly,
}

impl Bch {
    pub fn new(config: BchConfig) -> Result<Self, BchError> {
        let field = GaloisField::new(config.prim_poly)?;
        let m = field.degree();

        let t = config.t as usize;
        if t == 0 || m as usize * t >= field.order() {
            return Err(BchError::InvalidStrength { t: config.t, m });
        }

        let g = generator_polynomial(&field, t);
        let ecc_bits = g.len() - 1;
        let mut generator = BitPoly::zero(ecc_bits);
        for d in (0..ecc_bits).filter(|&d| g[d]) {
            generator.toggle(d);
        }

        Ok(Self {
            ecc_bytes: (m as usize * t).div_ceil(8),
            field,
            t,
            swap_bits: config.swap_bits,
            ecc_bits,
            generator,
        })
    }

    /// Maximum number of bit errors corrected per codeword
    pub fn t(&self) -> u32 {
        self.t as u32
    }

    /// Number of meaningful parity bits (the degree of the generator polynomial)
    pub fn ecc_bits(&self) -> usize {
        self.ecc_bits
    }

    /// Number of bytes the parity occupies
    pub fn ecc_bytes(&self) -> usize {
        self.ecc_bytes
    }

    /// The longest message (in bytes) that fits in one codeword
    pub fn max_message_len(&self) -> usize {
        (self.field.order() - self.ecc_bits) / 8
    }

    /// Compute the parity for a message
    pub fn encode(&self, message: &[u8]) -> Result<Vec<u8>, BchError> {
        self.check_message(message)?;
        let remainder = self.remainder(message);

        let mut parity = vec![0u8; self.ecc_bytes];
        for d in remainder.ones() {
            let k = self.ecc_bits - 1 - d;
            parity[k / 8] |= 0x80 >> (k % 8);
        }
        for byte in parity.iter_mut() {
            *byte = self.bit_order(*byte);
        }

        Ok(parity)
    }

    /// Check a codeword, correcting it in place if it has at most `t` bit errors.
    ///
    /// The buffers are only modified when the result is [Decoded::Corrected].
    pub fn decode(&self, message: &mut [u8], parity: &mut [u8]) -> Result<Decoded, BchError> {
        self.check_message(message)?;
        if parity.len() != self.ecc_bytes {
            return Err(BchError::ParityLength {
                len: parity.len(),
                expected: self.ecc_bytes,
            });
        }

        let mut remainder = self.remainder(message);
        remainder.xor_assign(&self.load_parity(parity));
        if remainder.is_zero() {
            return Ok(Decoded::Clean);
        }

        let syndromes = self.syndromes(&remainder);
        let (locator, errors) = self.berlekamp_massey(&syndromes);
        if errors > self.t || locator.len() != errors + 1 {
            return Ok(Decoded::Uncorrectable);
        }

        let total_bits = message.len() * 8 + self.ecc_bits;
        let positions = self.chien_search(&locator, total_bits, errors);
        if positions.len() != errors {
            return Ok(Decoded::Uncorrectable);
        }

        for d in positions {
            if d < self.ecc_bits {
                let k = self.ecc_bits - 1 - d;
                parity[k / 8] ^= self.bit_order(0x80 >> (k % 8));
            } else {
                let k = total_bits - 1 - d;
                message[k / 8] ^= self.bit_order(0x80 >> (k % 8));
            }
        }

        Ok(Decoded::Corrected(errors as u32))
    }

    fn check_message(&self, message: &[u8]) -> Result<(), BchError> {
        let max = self.max_message_len();
        if message.len() > max {
            return Err(BchError::MessageTooLong {
                len: message.len(),
                max,
            });
        }
        Ok(())
    }

    /// Map a stored byte to/from MSB-first bit order
    fn bit_order(&self, byte: u8) -> u8 {
        if self.swap_bits {
            byte.reverse_bits()
        } else {
            byte
        }
    }

    /// message(x) * x^ecc_bits mod g(x)
    fn remainder(&self, message: &[u8]) -> BitPoly {
        let mut remainder = BitPoly::zero(self.ecc_bits);
        for &byte in message {
            let byte = self.bit_order(byte);
            for k in (0..8).rev() {
                remainder.clock(byte & (1 << k) != 0, &self.generator);
            }
        }
        remainder
    }

    /// Read stored parity back into polynomial form, ignoring padding bits
    fn load_parity(&self, parity: &[u8]) -> BitPoly {
        let mut poly = BitPoly::zero(self.ecc_bits);
        for k in 0..self.ecc_bits {
            if self.bit_order(parity[k / 8]) & (0x80 >> (k % 8)) != 0 {
                poly.toggle(self.ecc_bits - 1 - k);
            }
        }
        poly
    }

    /// S_j = r(α^j) for j in 1..=2t. Since g(α^j) = 0, the remainder gives the same values as
    /// the full received word.
    fn syndromes(&self, remainder: &BitPoly) -> Vec<u16> {
        let mut syndromes = vec![0u16; 2 * self.t];
        for d in remainder.ones() {
            for (j, s) in syndromes.iter_mut().enumerate() {
                *s ^= self.field.exp((j + 1) * d);
            }
        }
        syndromes
    }

    /// Find the shortest LFSR (the error locator σ(x), lowest coefficient first) generating the
    /// syndrome sequence. Returns σ with trailing zero coefficients trimmed, and its length L.
    fn berlekamp_massey(&self, syndromes: &[u16]) -> (Vec<u16>, usize) {
        let f = &self.field;

        let mut sigma = vec![1u16];
        let mut prev = vec![1u16];
        let mut prev_discrepancy = 1u16;
        let mut length = 0usize;
        let mut shift = 1usize;

        for n in 0..syndromes.len() {
            let mut discrepancy = syndromes[n];
            for i in 1..sigma.len().min(length + 1) {
                discrepancy ^= f.mul(sigma[i], syndromes[n - i]);
            }

            if discrepancy == 0 {
                shift += 1;
                continue;
            }

            let coeff = f.div(discrepancy, prev_discrepancy);
            let before = sigma.clone();
            if sigma.len() < prev.len() + shift {
                sigma.resize(prev.len() + shift, 0);
            }
            for (i, &p) in prev.iter().enumerate() {
                sigma[i + shift] ^= f.mul(coeff, p);
            }

            if 2 * length <= n {
                length = n + 1 - length;
                prev = before;
                prev_discrepancy = discrepancy;
                shift = 1;
            } else {
                shift += 1;
            }
        }

        while sigma.len() > 1 && sigma.last() == Some(&0) {
            sigma.pop();
        }

        (sigma, length)
    }

    /// Return the degrees d (within the shortened codeword) where σ(α^-d) = 0
    fn chien_search(&self, locator: &[u16], total_bits: usize, expected: usize) -> Vec<usize> {
        let f = &self.field;
        let n = f.order();
        let logs: Vec<Option<usize>> = locator
            .iter()
            .map(|&c| (c != 0).then(|| f.log(c)))
            .collect();

        let mut positions = Vec::with_capacity(expected);
        for d in 0..total_bits {
            let mut sum = 0u16;
            for (j, log) in logs.iter().enumerate() {
                if let Some(log) = log {
                    sum ^= f.exp(log + n - (j * d) % n);
                }
            }

            if sum == 0 {
                positions.push(d);
                if positions.len() == expected {
                    break;
                }
            }
        }
        positions
    }
}

/// Compute g(x), the product of the distinct minimal polynomials of α^1..α^2t, as a list of
/// binary coefficients (lowest degree first).
fn generator_polynomial(field: &GaloisField, t: usize) -> Vec<bool> {
    let n = field.order();
    let mut covered = vec![false; n];
    let mut g = vec![true];

    // Even powers share a cyclotomic coset with an odd one
    for i in (1..2 * t).step_by(2) {
        if covered[i] {
            continue;
        }

        // Minimal polynomial of α^i: the product of (x + α^e) over the coset of i
        let mut minimal = vec![1u16];
        let mut e = i;
        loop {
            covered[e] = true;
            let root = field.exp(e);
            let mut next = vec![0u16; minimal.len() + 1];
            for (k, &c) in minimal.iter().enumerate() {
                next[k + 1] ^= c;
                next[k] ^= field.mul(c, root);
            }
            minimal = next;

            e = (e * 2) % n;
            if e == i {
                break;
            }
        }
        debug_assert!(minimal.iter().all(|&c| c <= 1));

        let mut product = vec![false; g.len() + minimal.len() - 1];
        for a in (0..g.len()).filter(|&a| g[a]) {
            for b in (0..minimal.len()).filter(|&b| minimal[b] != 0) {
                product[a + b] ^= true;
            }
        }
        g = product;
    }

    g
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A deterministic xorshift sequence, for picking "random" bit positions in tests
    pub(crate) struct XorShift(pub u64);

    impl XorShift {
        pub(crate) fn next_below(&mut self, bound: usize) -> usize {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            (self.0 % bound as u64) as usize
        }

        /// `count` distinct values below `bound`
        pub(crate) fn distinct(&mut self, count: usize, bound: usize) -> Vec<usize> {
            let mut picked = Vec::with_capacity(count);
            while picked.len() < count {
                let x = self.next_below(bound);
                if !picked.contains(&x) {
                    picked.push(x);
                }
            }
            picked
        }
    }

    /// Flip bit `bit` of the codeword formed by `message` and `parity`, numbering bits in the
    /// order the codec reads them
    pub(crate) fn flip(message: &mut [u8], parity: &mut [u8], bit: usize, swap_bits: bool) {
        let (buf, bit) = match bit < message.len() * 8 {
            true => (message, bit),
            false => (parity, bit - message.len() * 8),
        };
        buf[bit / 8] ^= match swap_bits {
            true => 1 << (bit % 8),
            false => 0x80 >> (bit % 8),
        };
    }

    fn test_message(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 37 + 11) as u8).collect()
    }

    #[test]
    fn test_generator_polynomial() -> Result<(), BchError> {
        // The classic (15, 7) double-error-correcting code: x^8 + x^7 + x^6 + x^4 + 1
        let field = GaloisField::new(0x13)?;
        let g = generator_polynomial(&field, 2);
        let g = g
            .iter()
            .enumerate()
            .fold(0u32, |acc, (d, &x)| acc | (u32::from(x) << d));
        assert_eq!(g, 0x1D1);

        Ok(())
    }

    #[test]
    fn test_code_dimensions() -> Result<(), BchError> {
        let bch = Bch::new(BchConfig {
            prim_poly: 0x4443,
            t: 32,
            swap_bits: true,
        })?;
        assert_eq!(bch.ecc_bits(), 14 * 32);
        assert_eq!(bch.ecc_bytes(), 56);
        assert!(bch.max_message_len() >= 1024 + 8);

        let bch = Bch::new(BchConfig {
            prim_poly: 0x201B,
            t: 12,
            swap_bits: true,
        })?;
        assert_eq!(bch.ecc_bits(), 13 * 12);
        assert_eq!(bch.ecc_bytes(), 20);

        assert_eq!(
            Bch::new(BchConfig {
                prim_poly: 0x13,
                t: 4,
                swap_bits: false,
            })
            .unwrap_err(),
            BchError::InvalidStrength { t: 4, m: 4 }
        );

        Ok(())
    }

    #[test]
    fn test_clean_codeword() -> Result<(), BchError> {
        let bch = Bch::new(BchConfig {
            prim_poly: 0x201B,
            t: 8,
            swap_bits: false,
        })?;
        let mut message = test_message(512);
        let mut parity = bch.encode(&message)?;
        let original = (message.clone(), parity.clone());

        assert_eq!(bch.decode(&mut message, &mut parity)?, Decoded::Clean);
        assert_eq!((message, parity), original);

        // An all-zero message has all-zero parity
        assert!(bch.encode(&[0; 100])?.iter().all(|&x| x == 0));

        Ok(())
    }

    #[test]
    fn test_corrects_up_to_t() -> Result<(), BchError> {
        let mut rng = XorShift(0x2545F4914F6CDD1D);

        for swap_bits in [false, true] {
            let bch = Bch::new(BchConfig {
                prim_poly: 0x4443,
                t: 13,
                swap_bits,
            })?;
            let message = test_message(1024);
            let parity = bch.encode(&message)?;
            let bits = message.len() * 8 + bch.ecc_bits();

            for k in 1..=13 {
                let (mut bad_message, mut bad_parity) = (message.clone(), parity.clone());
                for bit in rng.distinct(k, bits) {
                    flip(&mut bad_message, &mut bad_parity, bit, swap_bits);
                }

                assert_eq!(
                    bch.decode(&mut bad_message, &mut bad_parity)?,
                    Decoded::Corrected(k as u32)
                );
                assert_eq!(bad_message, message);
                assert_eq!(bad_parity, parity);
            }
        }

        Ok(())
    }

    #[test]
    fn test_parity_only_errors() -> Result<(), BchError> {
        let bch = Bch::new(BchConfig {
            prim_poly: 0x201B,
            t: 12,
            swap_bits: true,
        })?;
        let mut message = test_message(520);
        let mut parity = bch.encode(&message)?;
        let expected = parity.clone();

        parity[0] ^= 0x01;
        parity[19] ^= 0x08;
        assert_eq!(bch.decode(&mut message, &mut parity)?, Decoded::Corrected(2));
        assert_eq!(parity, expected);

        Ok(())
    }

    #[test]
    fn test_padding_bits_ignored() -> Result<(), BchError> {
        // 13 * 3 = 39 parity bits in 5 bytes leaves one padding bit
        let bch = Bch::new(BchConfig {
            prim_poly: 0x201B,
            t: 3,
            swap_bits: false,
        })?;
        let mut message = test_message(64);
        let mut parity = bch.encode(&message)?;
        parity[4] ^= 0x01;

        assert_eq!(bch.decode(&mut message, &mut parity)?, Decoded::Clean);

        Ok(())
    }

    #[test]
    fn test_uncorrectable_untouched() -> Result<(), BchError> {
        let bch = Bch::new(BchConfig {
            prim_poly: 0x4443,
            t: 13,
            swap_bits: true,
        })?;
        let message = test_message(1024);
        let parity = bch.encode(&message)?;

        let (mut bad_message, mut bad_parity) = (message.clone(), parity.clone());
        for bit in (0..20).map(|i| i * 401 + 3) {
            flip(&mut bad_message, &mut bad_parity, bit, true);
        }
        let corrupted = (bad_message.clone(), bad_parity.clone());

        assert_eq!(
            bch.decode(&mut bad_message, &mut bad_parity)?,
            Decoded::Uncorrectable
        );
        assert_eq!((bad_message, bad_parity), corrupted);

        Ok(())
    }

    #[test]
    fn test_length_errors() -> Result<(), BchError> {
        let bch = Bch::new(BchConfig {
            prim_poly: 0x201B,
            t: 12,
            swap_bits: true,
        })?;
        let mut message = vec![0u8; bch.max_message_len() + 1];
        assert!(matches!(
            bch.encode(&message),
            Err(BchError::MessageTooLong { .. })
        ));

        message.truncate(16);
        let mut parity = vec![0u8; 3];
        assert_eq!(
            bch.decode(&mut message, &mut parity),
            Err(BchError::ParityLength {
                len: 3,
                expected: 20
            })
        );

        Ok(())
    }
}
