// src/buffer.rs
//! Fixed-capacity connection buffers addressed by cursors.

use std::fmt::{self, Write as _};

pub const READ_BUF_SIZE: usize = 2048;
pub const WRITE_BUF_SIZE: usize = 1024;

/// Receive buffer. Bytes `[0, read_idx)` are filled; the parser has consumed
/// `[0, checked_idx)` and the line it is assembling starts at `start_line`.
///
/// `start_line <= checked_idx <= read_idx <= capacity` always holds.
pub struct ReadBuffer {
    data: Box<[u8]>,
    read_idx: usize,
    checked_idx: usize,
    start_line: usize,
}

impl ReadBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity].into_boxed_slice(),
            read_idx: 0,
            checked_idx: 0,
            start_line: 0,
        }
    }

    pub fn is_full(&self) -> bool {
        self.read_idx == self.data.len()
    }

    /// Unfilled tail, the target of the next receive.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.read_idx..]
    }

    /// Mark `n` bytes of the spare tail as filled.
    pub fn advance(&mut self, n: usize) {
        self.read_idx = (self.read_idx + n).min(self.data.len());
    }

    /// Copy `bytes` into the tail, returning how many fit.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> usize {
        let spare = self.spare_mut();
        let n = bytes.len().min(spare.len());
        spare[..n].copy_from_slice(&bytes[..n]);
        self.advance(n);
        n
    }

    pub fn filled(&self) -> &[u8] {
        &self.data[..self.read_idx]
    }

    pub fn read_idx(&self) -> usize {
        self.read_idx
    }

    pub fn checked_idx(&self) -> usize {
        self.checked_idx
    }

    pub fn start_line(&self) -> usize {
        self.start_line
    }

    pub(crate) fn set_checked(&mut self, idx: usize) {
        debug_assert!(idx <= self.read_idx);
        self.checked_idx = idx.min(self.read_idx);
    }

    pub(crate) fn begin_line(&mut self) {
        self.start_line = self.checked_idx;
    }

    pub fn reset(&mut self) {
        self.data.fill(0);
        self.read_idx = 0;
        self.checked_idx = 0;
        self.start_line = 0;
    }
}

/// Response header buffer with a fail-closed formatted append.
pub struct WriteBuffer {
    data: Box<[u8]>,
    write_idx: usize,
}

impl WriteBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity].into_boxed_slice(),
            write_idx: 0,
        }
    }

    /// Append formatted text. If the text does not fit, nothing is written
    /// and `false` is returned.
    pub fn append(&mut self, args: fmt::Arguments<'_>) -> bool {
        let start = self.write_idx;
        let mut cursor = Bounded {
            buf: &mut self.data,
            pos: start,
        };
        match cursor.write_fmt(args) {
            Ok(()) => {
                self.write_idx = cursor.pos;
                true
            }
            Err(_) => {
                self.write_idx = start;
                false
            }
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.write_idx]
    }

    pub fn len(&self) -> usize {
        self.write_idx
    }

    pub fn is_empty(&self) -> bool {
        self.write_idx == 0
    }

    pub fn reset(&mut self) {
        self.data.fill(0);
        self.write_idx = 0;
    }
}

struct Bounded<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl fmt::Write for Bounded<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let end = self.pos.checked_add(s.len()).ok_or(fmt::Error)?;
        if end > self.buf.len() {
            return Err(fmt::Error);
        }
        self.buf[self.pos..end].copy_from_slice(s.as_bytes());
        self.pos = end;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_is_all_or_nothing() {
        let mut buf = WriteBuffer::new(16);
        assert!(buf.append(format_args!("HTTP/1.1 {}\r\n", 200)));
        assert_eq!(buf.as_bytes(), b"HTTP/1.1 200\r\n");
        assert!(!buf.append(format_args!("Content-Length: {}\r\n", 12345)));
        assert_eq!(buf.as_bytes(), b"HTTP/1.1 200\r\n");
        assert!(buf.append(format_args!("\r\n")));
        assert_eq!(buf.len(), 16);
        assert!(!buf.append(format_args!("x")));
    }

    #[test]
    fn read_buffer_tracks_fill() {
        let mut buf = ReadBuffer::new(8);
        assert_eq!(buf.extend_from_slice(b"GET /"), 5);
        assert_eq!(buf.extend_from_slice(b" HTTP"), 3);
        assert!(buf.is_full());
        assert_eq!(buf.filled(), b"GET / HT");
        buf.reset();
        assert_eq!(buf.read_idx(), 0);
        assert_eq!(buf.spare_mut().len(), 8);
    }
}
