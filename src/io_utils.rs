use std::io::{self, prelude::*};

use crc32fast::Hasher;

/// Counts how many bytes have been read and calculates a running CRC32
pub struct CountingCrcReader<R> {
    inner: R,
    hasher: Hasher,
    count: u64,
}

impl<R: Read> CountingCrcReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Hasher::new(),
            count: 0,
        }
    }

    pub fn position(&self) -> u64 {
        self.count
    }

    /// Consumes the reader and returns the inner reader and the checksum
    pub fn finalize(self) -> (R, u32) {
        (self.inner, self.hasher.finalize())
    }
}

impl<R: Read> Read for CountingCrcReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let res = self.inner.read(buf)?;
        self.count += res as u64;
        self.hasher.update(&buf[..res]);
        Ok(res)
    }
}

/// Counts how many bytes have been written and calculates a running CRC32.
///
/// The CRC can be restarted mid-stream with [`reset_crc`](Self::reset_crc);
/// the writer uses this to cover the data section and the summary section
/// with separate checksums over one sink.
pub struct CountingCrcWriter<W> {
    inner: W,
    hasher: Hasher,
    count: u64,
}

impl<W: Write> CountingCrcWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Hasher::new(),
            count: 0,
        }
    }

    /// The number of bytes written since construction.
    pub fn position(&self) -> u64 {
        self.count
    }

    /// The CRC of everything written since construction or the last
    /// [`reset_crc`](Self::reset_crc).
    pub fn checksum(&self) -> u32 {
        self.hasher.clone().finalize()
    }

    /// Restarts the running CRC. The byte count is unaffected.
    pub fn reset_crc(&mut self) {
        self.hasher = Hasher::new();
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Consumes the writer and returns the inner writer and the checksum
    pub fn finalize(self) -> (W, u32) {
        (self.inner, self.hasher.finalize())
    }
}

impl<W: Write> Write for CountingCrcWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let res = self.inner.write(buf)?;
        self.count += res as u64;
        self.hasher.update(&buf[..res]);
        Ok(res)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resettable_checksum() {
        let mut w = CountingCrcWriter::new(Vec::new());
        w.write_all(b"data section").unwrap();
        assert_eq!(w.checksum(), crc32fast::hash(b"data section"));
        assert_eq!(w.position(), 12);

        w.reset_crc();
        w.write_all(b"summary").unwrap();
        assert_eq!(w.checksum(), crc32fast::hash(b"summary"));
        // position keeps counting across the reset
        assert_eq!(w.position(), 19);
    }

    #[test]
    fn reader_hashes_what_it_reads() {
        let data = b"0123456789";
        let mut r = CountingCrcReader::new(&data[..]);
        let mut out = [0u8; 4];
        r.read_exact(&mut out).unwrap();
        assert_eq!(r.position(), 4);
        let (_, crc) = r.finalize();
        assert_eq!(crc, crc32fast::hash(b"0123"));
    }
}
