//! Data sources and sinks for the transfer pool.

use std::io::{self, Read, Write};

/// Supplies data for host-to-device transfers.
pub trait Source {
    /// Fills `buf` as far as possible.
    ///
    /// Returns the number of bytes written into `buf`. Anything less than `buf.len()` means the
    /// source is exhausted.
    fn fill(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Consumes data from device-to-host transfers.
pub trait Sink {
    /// Consumes all of `data`. Partial writes are errors.
    fn drain(&mut self, data: &[u8]) -> io::Result<()>;

    /// Called once after the last `drain`.
    fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A [`Source`] reading from an `io::Read` implementor until its buffer is full or EOF.
///
/// [`Source`]: trait.Source.html
#[derive(Debug)]
pub struct Reader<R>(pub R);

impl<R: Read> Source for Reader<R> {
    fn fill(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.0.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }
}

/// An endless source of zero bytes.
#[derive(Debug, Default)]
pub struct Zeros;

impl Source for Zeros {
    fn fill(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        for b in buf.iter_mut() {
            *b = 0;
        }
        Ok(buf.len())
    }
}

/// A [`Sink`] writing everything to an `io::Write` implementor.
///
/// [`Sink`]: trait.Sink.html
#[derive(Debug)]
pub struct Writer<W>(pub W);

impl<W: Write> Sink for Writer<W> {
    fn drain(&mut self, data: &[u8]) -> io::Result<()> {
        self.0.write_all(data)
    }

    fn finish(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

/// A sink that throws all data away.
#[derive(Debug, Default)]
pub struct Discard;

impl Sink for Discard {
    fn drain(&mut self, _data: &[u8]) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hands out at most 3 bytes per `read` and is interrupted once.
    struct Trickle<'a> {
        data: &'a [u8],
        interrupted: bool,
    }

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if !self.interrupted {
                self.interrupted = true;
                return Err(io::ErrorKind::Interrupted.into());
            }
            let n = buf.len().min(3).min(self.data.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    #[test]
    fn reader_fills_completely() {
        let mut src = Reader(Trickle {
            data: b"0123456789",
            interrupted: false,
        });
        let mut buf = [0; 8];
        assert_eq!(src.fill(&mut buf).unwrap(), 8);
        assert_eq!(&buf, b"01234567");
        assert_eq!(src.fill(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"89");
        assert_eq!(src.fill(&mut buf).unwrap(), 0);
    }

    #[test]
    fn zeros() {
        let mut buf = [0xff; 16];
        assert_eq!(Zeros.fill(&mut buf).unwrap(), 16);
        assert_eq!(buf, [0; 16]);
    }

    #[test]
    fn writer_short_write_fails() {
        let mut storage = [0u8; 4];
        let mut sink = Writer(&mut storage[..]);
        sink.drain(b"abc").unwrap();
        let err = sink.drain(b"de").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
    }
}
