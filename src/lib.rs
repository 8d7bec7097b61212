//! Streaming BCH correction of raw NAND page dumps.
//!
//! The pieces, bottom-up:
//! - [`bch`]: the binary BCH codec itself
//! - [`nand`]: where data, spare, and parity live within a raw page
//! - [`ecc`]: correcting chunks and pages in place
//! - [`stream`]: running page after page from a reader to a writer
//! - [`presets`]: known controller configurations

pub mod bch;
pub mod ecc;
pub mod nand;
pub mod presets;
pub mod stream;
pub mod util;
