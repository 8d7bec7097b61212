//! Useful traits and other utilities that don't really belong anywhere else.

use std::io::{self, Read};

pub trait ReadExt {
    /// Fills `buf` from the stream, like `read_exact`, but unlike `read_exact`, is forgiving of
    /// unexpected EOF.
    ///
    /// Returns how many bytes were read: `buf.len()`, unless an EOF was encountered, in which
    /// case the count is strictly shorter (and zero only if the stream was already at EOF).
    fn read_full(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl<T: Read + ?Sized> ReadExt for T {
    fn read_full(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut cursor = 0;
        while cursor < buf.len() {
            cursor += match self.read(&mut buf[cursor..]) {
                // EOF; whatever was read so far is all there is
                Ok(0) => break,

                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
                Err(x) => return Err(x),
            };
        }

        Ok(cursor)
    }
}

#[test]
fn test_read_full() -> io::Result<()> {
    let mut buf = [0u8; 4];
    assert_eq!(io::repeat(0xAA).read_full(&mut buf)?, 4);
    assert_eq!(buf, [0xAA; 4]);

    let mut input = &[1, 2, 3, 4, 5, 6][..];
    assert_eq!(input.read_full(&mut buf)?, 4);
    assert_eq!(buf, [1, 2, 3, 4]);
    assert_eq!(input.read_full(&mut buf)?, 2);
    assert_eq!(buf[..2], [5, 6]);
    assert_eq!(input.read_full(&mut buf)?, 0);

    Ok(())
}

#[test]
fn test_read_full_short_reads() -> io::Result<()> {
    // A reader that hands out one byte per call, like a slow pipe
    struct Trickle<'a>(&'a [u8]);
    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let Some((&first, rest)) = self.0.split_first() else {
                return Ok(0);
            };
            if buf.is_empty() {
                return Ok(0);
            }
            buf[0] = first;
            self.0 = rest;
            Ok(1)
        }
    }

    let mut buf = [0u8; 3];
    let mut input = Trickle(&[7, 8, 9, 10]);
    assert_eq!(input.read_full(&mut buf)?, 3);
    assert_eq!(buf, [7, 8, 9]);
    assert_eq!(input.read_full(&mut buf)?, 1);

    Ok(())
}
