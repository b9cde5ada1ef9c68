use std::{fmt, ops};

use bytes::{Buf, Bytes, BytesMut};

/// Past this size the buffer stops doubling and grows in fixed increments.
pub const PREALLOC_MAX: usize = 1024 * 1024;

/// Capacity-tracked byte buffer used for client query buffers and reply
/// overflow chunks.
///
/// Growth follows the usual small-string discipline: double the requested
/// length while it stays under [`PREALLOC_MAX`], then extend by
/// [`PREALLOC_MAX`] at a time. Callers that know the final size can hint it
/// up front with [`Buffer::with_capacity`].
#[derive(Debug, Default, Clone)]
pub struct Buffer {
    data: BytesMut,
}

impl Buffer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: BytesMut::new(),
        }
    }

    #[must_use]
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(cap),
        }
    }

    #[must_use]
    pub fn from_slice(src: &[u8]) -> Self {
        Self {
            data: BytesMut::from(src),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Make room for at least `additional` more bytes, applying the
    /// preallocation policy so that repeated small appends do not translate
    /// into repeated reallocations.
    pub fn reserve(&mut self, additional: usize) {
        let needed = self.data.len() + additional;
        if needed <= self.data.capacity() {
            return;
        }
        let target = if needed < PREALLOC_MAX {
            needed * 2
        } else {
            needed + PREALLOC_MAX
        };
        self.data.reserve(target - self.data.len());
    }

    pub fn extend_from_slice(&mut self, src: &[u8]) {
        self.reserve(src.len());
        self.data.extend_from_slice(src);
    }

    /// Grow (zero-filled) or shrink to exactly `len` bytes.
    pub fn resize(&mut self, len: usize) {
        if len > self.data.len() {
            self.reserve(len - self.data.len());
        }
        self.data.resize(len, 0);
    }

    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    /// Discard the first `cnt` bytes, keeping the rest.
    pub fn advance(&mut self, cnt: usize) {
        self.data.advance(cnt);
    }

    /// Split off and freeze the first `at` bytes.
    pub fn split_to(&mut self, at: usize) -> Bytes {
        self.data.split_to(at).freeze()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Freeze the whole content, leaving the buffer empty.
    pub fn take(&mut self) -> Bytes {
        self.data.split().freeze()
    }

    #[must_use]
    pub fn duplicate(&self) -> Self {
        Self::from_slice(&self.data)
    }
}

impl ops::Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl ops::DerefMut for Buffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Write for Buffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.extend_from_slice(s.as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fmt::Write;

    use super::{Buffer, PREALLOC_MAX};

    #[test]
    fn append_and_range() {
        let mut buf = Buffer::new();
        assert!(buf.is_empty());
        buf.extend_from_slice(b"hello");
        buf.extend_from_slice(b" world");
        assert_eq!(&buf[..], b"hello world");
        assert_eq!(&buf[6..11], b"world");
        assert_eq!(buf.len(), 11);
    }

    #[test]
    fn formatted_append() {
        let mut buf = Buffer::new();
        write!(buf, "${}\r\n", 42).unwrap();
        assert_eq!(&buf[..], b"$42\r\n");
    }

    #[test]
    fn doubling_growth_below_prealloc_max() {
        let mut buf = Buffer::new();
        buf.extend_from_slice(&[0u8; 100]);
        // The doubling policy leaves room for at least another append of the
        // same size without reallocating.
        assert!(buf.capacity() >= 200);
    }

    #[test]
    fn linear_growth_above_prealloc_max() {
        let mut buf = Buffer::new();
        buf.resize(PREALLOC_MAX + 1);
        let cap = buf.capacity();
        assert!(cap >= PREALLOC_MAX + 1);
        assert!(cap <= 2 * PREALLOC_MAX + PREALLOC_MAX);
    }

    #[test]
    fn split_preserves_tail() {
        let mut buf = Buffer::from_slice(b"*1\r\n$4\r\nping\r\n*1\r\n");
        let head = buf.split_to(14);
        assert_eq!(&head[..], b"*1\r\n$4\r\nping\r\n");
        assert_eq!(&buf[..], b"*1\r\n");
    }

    #[test]
    fn clear_keeps_capacity() {
        let mut buf = Buffer::with_capacity(64);
        buf.extend_from_slice(b"data");
        buf.clear();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 4);
    }
}
