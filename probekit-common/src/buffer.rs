use std::collections::VecDeque;

use bytes::{Buf, Bytes, BytesMut};

/// An ordered byte sequence: append-only at the tail, consume-only at the
/// head. Chunks are kept as received so parsers can walk contiguous
/// regions without copying and then [`Buffer::discard`] what they consumed.
#[derive(Debug, Default)]
pub struct Buffer {
    chunks: VecDeque<Bytes>,
    len: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends a chunk without copying.
    pub fn push(&mut self, chunk: Bytes) {
        if !chunk.is_empty() {
            self.len += chunk.len();
            self.chunks.push_back(chunk);
        }
    }

    /// Appends a copy of `data`.
    pub fn write(&mut self, data: &[u8]) {
        self.push(Bytes::copy_from_slice(data));
    }

    pub fn write_str(&mut self, data: &str) {
        self.write(data.as_bytes());
    }

    /// Copies out up to `n` bytes without consuming them.
    pub fn peek(&self, n: usize) -> Bytes {
        let n = n.min(self.len);
        let mut out = BytesMut::with_capacity(n);
        for chunk in &self.chunks {
            if out.len() >= n {
                break;
            }
            let take = (n - out.len()).min(chunk.len());
            out.extend_from_slice(&chunk[..take]);
        }
        out.freeze()
    }

    /// Reads and consumes `min(n, len)` bytes.
    pub fn read(&mut self, n: usize) -> Bytes {
        let n = n.min(self.len);
        if n == 0 {
            return Bytes::new();
        }
        // Fast path: the head chunk alone satisfies the read.
        if let Some(head) = self.chunks.front_mut() {
            if head.len() >= n {
                let out = head.split_to(n);
                if head.is_empty() {
                    self.chunks.pop_front();
                }
                self.len -= n;
                return out;
            }
        }
        let mut out = BytesMut::with_capacity(n);
        while out.len() < n {
            let mut head = self.chunks.pop_front().expect("length accounting");
            let take = (n - out.len()).min(head.len());
            out.extend_from_slice(&head.split_to(take));
            if !head.is_empty() {
                self.chunks.push_front(head);
            }
        }
        self.len -= n;
        out.freeze()
    }

    /// Reads exactly `n` bytes, or returns `None` leaving the buffer
    /// untouched when fewer are available.
    pub fn readn(&mut self, n: usize) -> Option<Bytes> {
        if n > self.len {
            return None;
        }
        Some(self.read(n))
    }

    /// Consumes and returns everything buffered.
    pub fn read_all(&mut self) -> Bytes {
        self.read(self.len)
    }

    /// Drops up to `n` bytes from the head; returns how many were dropped.
    pub fn discard(&mut self, n: usize) -> usize {
        let n = n.min(self.len);
        let mut left = n;
        while left > 0 {
            let head = self.chunks.front_mut().expect("length accounting");
            if head.len() > left {
                head.advance(left);
                left = 0;
            } else {
                left -= head.len();
                self.chunks.pop_front();
            }
        }
        self.len -= n;
        n
    }

    /// Visits each contiguous region in order; the visitor returns `false`
    /// to stop early.
    pub fn for_each_chunk(&self, mut visit: impl FnMut(&[u8]) -> bool) {
        for chunk in &self.chunks {
            if !visit(chunk) {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_returns_min_of_n_and_len() {
        let mut buf = Buffer::new();
        buf.write_str("hello");
        buf.write_str(" world");
        assert_eq!(buf.len(), 11);
        let out = buf.read(5);
        assert_eq!(&out[..], b"hello");
        assert_eq!(buf.len(), 6);
        let out = buf.read(100);
        assert_eq!(&out[..], b" world");
        assert!(buf.is_empty());
    }

    #[test]
    fn peek_never_consumes() {
        let mut buf = Buffer::new();
        buf.write_str("abc");
        buf.write_str("def");
        assert_eq!(&buf.peek(4)[..], b"abcd");
        assert_eq!(buf.len(), 6);
        assert_eq!(&buf.read_all()[..], b"abcdef");
    }

    #[test]
    fn readn_requires_exact_length() {
        let mut buf = Buffer::new();
        buf.write_str("ab");
        assert!(buf.readn(3).is_none());
        assert_eq!(buf.len(), 2);
        assert_eq!(&buf.readn(2).unwrap()[..], b"ab");
    }

    #[test]
    fn discard_crosses_chunk_boundaries() {
        let mut buf = Buffer::new();
        buf.write_str("abc");
        buf.write_str("def");
        assert_eq!(buf.discard(4), 4);
        assert_eq!(&buf.read_all()[..], b"ef");
    }

    #[test]
    fn for_each_chunk_surfaces_regions_in_order() {
        let mut buf = Buffer::new();
        buf.write_str("ab");
        buf.write_str("cd");
        let mut seen = Vec::new();
        buf.for_each_chunk(|c| {
            seen.push(c.to_vec());
            true
        });
        assert_eq!(seen, vec![b"ab".to_vec(), b"cd".to_vec()]);
    }
}
