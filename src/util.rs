//! Useful traits and other utilities that don't really belong anywhere else.

use std::io::{self, Read, Write};

pub trait ReadExt {
    /// Tries to fill `buf`, like `read_exact`, but unlike `read_exact`, is forgiving of
    /// unexpected EOF.
    ///
    /// Returns how many bytes were read, which is `buf.len()` unless an EOF was encountered.
    fn read_full(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl<T: Read> ReadExt for T {
    fn read_full(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut cursor = 0;
        while cursor < buf.len() {
            cursor += match self.read(&mut buf[cursor..]) {
                // This is an EOF; it means the final read size is `cursor`
                Ok(0) => break,

                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
                Err(x) => return Err(x),
            };
        }
        Ok(cursor)
    }
}

pub trait WriteExt {
    /// Like `write_all`, but reports how much was written before the writer gave up (returned
    /// `Ok(0)`) instead of failing.
    fn write_full(&mut self, buf: &[u8]) -> io::Result<usize>;
}

impl<T: Write> WriteExt for T {
    fn write_full(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut cursor = 0;
        while cursor < buf.len() {
            cursor += match self.write(&buf[cursor..]) {
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

    let mut buf = [0u8; 8];
    assert_eq!((&[1, 2, 3][..]).read_full(&mut buf)?, 3);
    assert_eq!(buf[..4], [1, 2, 3, 0]);
    Ok(())
}

#[test]
fn test_write_full() -> io::Result<()> {
    let mut backing = [0u8; 3];
    let mut short = &mut backing[..];
    assert_eq!(short.write_full(&[9, 8, 7, 6, 5])?, 3);
    assert_eq!(backing, [9, 8, 7]);
    Ok(())
}
