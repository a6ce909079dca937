use bytes::{Buf, BytesMut};

use crate::error::Error;
use crate::net::TcpStream;

use super::splitter::{Line, ZeroCopyLineSplitter};

/// Marker for types that are plain bytes: any bit pattern is a valid
/// value, so they can be read straight off the wire.
///
/// # Safety
///
/// Implementors must have no padding validity requirements and no invalid
/// bit patterns (no `bool`, no enums, no references). Endianness is the
/// caller's problem.
pub unsafe trait Plain: Copy + 'static {}

macro_rules! impl_plain {
    ($($ty:ty),*) => {
        $(unsafe impl Plain for $ty {})*
    };
}

impl_plain!(u8, i8, u16, i16, u32, i32, u64, i64, u128, i128, usize, isize);

unsafe impl<T: Plain, const N: usize> Plain for [T; N] {}

/// Buffered reader over a [`TcpStream`]: exact-length reads, delimiter
/// scanning, and raw struct reads.
///
/// Bytes read past what a call needed stay buffered and are served first
/// by the next call, whichever method that is — an exact read between two
/// delimiter reads consumes from the same buffered tail.
pub struct ByteReader<'a> {
    socket: &'a TcpStream,
    buf: BytesMut,
}

impl<'a> ByteReader<'a> {
    pub fn new(socket: &'a TcpStream) -> Self {
        ByteReader {
            socket,
            buf: BytesMut::new(),
        }
    }

    /// Fill `out` completely. EOF first fails with [`Error::ShortRead`]
    /// carrying how far the read got.
    pub async fn read_exact(&mut self, out: &mut [u8]) -> Result<(), Error> {
        let buffered = out.len().min(self.buf.len());
        out[..buffered].copy_from_slice(&self.buf[..buffered]);
        self.buf.advance(buffered);

        let mut filled = buffered;
        while filled < out.len() {
            let n = self.socket.read_some(&mut out[filled..]).await?;
            if n == 0 {
                return Err(Error::ShortRead {
                    expected: out.len(),
                    got: filled,
                });
            }
            filled += n;
        }
        Ok(())
    }

    /// Read until `delim` appears, returning everything up to and
    /// including it. EOF before the delimiter is a disconnect.
    pub async fn read_until(&mut self, delim: &[u8]) -> Result<Vec<u8>, Error> {
        debug_assert!(!delim.is_empty());
        let mut chunk = [0u8; 1024];
        loop {
            if let Some(pos) = find(&self.buf, delim) {
                let end = pos + delim.len();
                let out = self.buf[..end].to_vec();
                self.buf.advance(end);
                return Ok(out);
            }
            let n = self.socket.read_some(&mut chunk).await?;
            if n == 0 {
                return Err(Error::Disconnected { code: None });
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Read exactly `size_of::<T>()` bytes as a `T`.
    pub async fn read_struct<T: Plain>(&mut self) -> Result<T, Error> {
        let mut raw = vec![0u8; std::mem::size_of::<T>()];
        self.read_exact(&mut raw).await?;
        // SAFETY: T is Plain, so any byte pattern is a valid value, and
        // read_unaligned tolerates the vec's alignment.
        Ok(unsafe { std::ptr::read_unaligned(raw.as_ptr() as *const T) })
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Line-at-a-time reader: fills a zero-copy splitter straight from the
/// socket and hands out borrowed [`Line`]s.
pub struct LineReader<'a> {
    socket: &'a TcpStream,
    splitter: ZeroCopyLineSplitter,
    chunk: usize,
}

impl<'a> LineReader<'a> {
    /// `max_line` bounds the longest acceptable line (splitter capacity).
    pub fn new(socket: &'a TcpStream, max_line: usize) -> Self {
        LineReader {
            socket,
            splitter: ZeroCopyLineSplitter::new(max_line),
            chunk: (max_line / 2).max(1),
        }
    }

    /// The next complete line, or `None` at EOF.
    ///
    /// Fails with [`Error::Overflow`] when the buffered partial line
    /// already fills the splitter.
    pub async fn read_line(&mut self) -> Result<Option<Line<'_>>, Error> {
        while !self.splitter.has_line() {
            let span = self.splitter.acquire(self.chunk);
            if span.is_empty() {
                return Err(Error::Overflow);
            }
            let n = self.socket.read_some(span).await?;
            if n == 0 {
                return Ok(None);
            }
            self.splitter.commit(n);
        }
        Ok(self.splitter.pop())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_locates_delimiters() {
        assert_eq!(find(b"line1\nline2", b"\n"), Some(5));
        assert_eq!(find(b"abc\r\ndef", b"\r\n"), Some(3));
        assert_eq!(find(b"abc", b"\n"), None);
        assert_eq!(find(b"", b"\n"), None);
        assert_eq!(find(b"\n", b"\n"), Some(0));
    }

    #[test]
    fn plain_covers_byte_arrays() {
        fn assert_plain<T: Plain>() {}
        assert_plain::<u8>();
        assert_plain::<[u8; 1024]>();
        assert_plain::<[u32; 4]>();
    }
}
