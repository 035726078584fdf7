//! Fixed-capacity I/O buffers
//!
//! The session keeps one inbound and one outbound buffer between the
//! socket and the HTTP/2 engine. Capacity is fixed so a slow peer cannot
//! make the session balloon; writers observe how much room is left and
//! keep their own pending tail when a chunk does not fit.

/// A fixed-capacity byte buffer with explicit fill/consume accounting.
#[derive(Debug)]
pub struct IoBuffer {
    buf: Vec<u8>,
    start: usize,
    end: usize,
}

impl IoBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        IoBuffer {
            buf: vec![0; capacity],
            start: 0,
            end: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes available to read out.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn is_full(&self) -> bool {
        self.space_len() == 0
    }

    /// Room left for new bytes, after compacting consumed space away.
    pub fn space_len(&self) -> usize {
        self.buf.len() - self.len()
    }

    /// The readable region.
    pub fn data(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    /// The writable region. Compacts first so the region is contiguous.
    pub fn space(&mut self) -> &mut [u8] {
        self.compact();
        &mut self.buf[self.end..]
    }

    /// Marks `n` bytes of `space()` as filled.
    pub fn fill(&mut self, n: usize) {
        debug_assert!(self.end + n <= self.buf.len());
        self.end += n;
    }

    /// Marks `n` bytes of `data()` as consumed.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.len());
        self.start += n;
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    /// Appends as much of `data` as fits; returns how much was taken.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.space_len());
        if n > 0 {
            self.compact();
            self.buf[self.end..self.end + n].copy_from_slice(&data[..n]);
            self.end += n;
        }
        n
    }

    pub fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
    }

    fn compact(&mut self) {
        if self.start == 0 {
            return;
        }
        self.buf.copy_within(self.start..self.end, 0);
        self.end -= self.start;
        self.start = 0;
    }
}
