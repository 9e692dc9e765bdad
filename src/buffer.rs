//! A growable byte buffer with a reserved prepend region, grounded on
//! `original_source/Buffer.cc`.

use std::io::{self, IoSliceMut};

use crate::sys::Socket;

const CHEAP_PREPEND: usize = 8;
const INITIAL_SIZE: usize = 1024;
const EXTRA_BUF_SIZE: usize = 65536;

pub struct Buffer {
    buf: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer {
            buf: vec![0u8; CHEAP_PREPEND + INITIAL_SIZE],
            reader_index: CHEAP_PREPEND,
            writer_index: CHEAP_PREPEND,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer_index
    }

    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader_index..self.writer_index]
    }

    pub fn retrieve(&mut self, n: usize) {
        if n < self.readable_bytes() {
            self.reader_index += n;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.reader_index = CHEAP_PREPEND;
        self.writer_index = CHEAP_PREPEND;
    }

    pub fn retrieve_all_as_vec(&mut self) -> Vec<u8> {
        let v = self.peek().to_vec();
        self.retrieve_all();
        v
    }

    /// Lossy UTF-8 decode. The original constructs a `std::string` from the
    /// raw bytes unchecked; this crate never exposes non-UTF-8 data as a
    /// `String` without the caller opting into lossy conversion explicitly.
    pub fn retrieve_all_as_string(&mut self) -> String {
        let v = self.retrieve_all_as_vec();
        String::from_utf8_lossy(&v).into_owned()
    }

    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        let end = self.writer_index + data.len();
        self.buf[self.writer_index..end].copy_from_slice(data);
        self.writer_index = end;
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.buf.resize(self.writer_index + len, 0);
        } else {
            let readable = self.readable_bytes();
            self.buf.copy_within(self.reader_index..self.writer_index, CHEAP_PREPEND);
            self.reader_index = CHEAP_PREPEND;
            self.writer_index = CHEAP_PREPEND + readable;
        }
    }

    /// Vectored read from `socket` into the buffer's writable tail plus a
    /// 64 KiB on-stack spill buffer, so a single read can absorb more than
    /// the buffer currently has room for without an extra syscall to size
    /// the growth first. Overflow into the spill buffer is appended
    /// (growing the buffer) after the read completes. When the writable
    /// tail is already at least as big as the spill buffer, the second
    /// iovec is skipped entirely: there is no room it could usefully
    /// absorb, so only the first iovec is submitted.
    pub fn read_fd(&mut self, socket: &Socket) -> io::Result<usize> {
        let writable = self.writable_bytes();

        if writable >= EXTRA_BUF_SIZE {
            let mut iov = [IoSliceMut::new(&mut self.buf[self.writer_index..])];
            let n = socket.read_vectored(&mut iov)?;
            self.writer_index += n;
            return Ok(n);
        }

        let mut extra_buf = [0u8; EXTRA_BUF_SIZE];
        let n = {
            let mut iov = [
                IoSliceMut::new(&mut self.buf[self.writer_index..]),
                IoSliceMut::new(&mut extra_buf),
            ];
            socket.read_vectored(&mut iov)?
        };

        if n <= writable {
            self.writer_index += n;
        } else {
            self.writer_index = self.buf.len();
            let extra = n - writable;
            self.append(&extra_buf[..extra]);
        }

        Ok(n)
    }
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_retrieve_round_trips() {
        let mut buf = Buffer::new();
        buf.append(b"hello");
        assert_eq!(buf.readable_bytes(), 5);
        assert_eq!(buf.peek(), b"hello");
        buf.retrieve(5);
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn retrieve_all_as_string_resets_cursors() {
        let mut buf = Buffer::new();
        buf.append(b"abc");
        assert_eq!(buf.retrieve_all_as_string(), "abc");
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn growth_beyond_initial_capacity_preserves_unread_bytes() {
        let mut buf = Buffer::new();
        let big = vec![7u8; INITIAL_SIZE * 4];
        buf.append(&big);
        assert_eq!(buf.readable_bytes(), big.len());
        assert_eq!(buf.peek(), &big[..]);
    }

    #[test]
    fn make_space_compacts_instead_of_growing_when_room_exists() {
        let mut buf = Buffer::new();
        buf.append(&vec![1u8; 900]);
        buf.retrieve(900);
        let cap_before = buf.buf.len();
        buf.append(&vec![2u8; 900]);
        assert_eq!(buf.buf.len(), cap_before);
    }

    #[test]
    fn lossy_string_does_not_panic_on_invalid_utf8() {
        let mut buf = Buffer::new();
        buf.append(&[0xff, 0xfe, b'h', b'i']);
        let s = buf.retrieve_all_as_string();
        assert!(s.ends_with("hi"));
    }
}
