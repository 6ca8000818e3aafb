//! Bounded byte ring buffer for streaming audio.
//!
//! TTS engines deliver PCM in arbitrary chunk sizes while the telephone
//! network wants fixed 20 ms frames. The ring buffer sits between the two:
//! producers write whatever fits, consumers pull exact frames.

/// Default capacity used by media bridges (64 KiB, about 1.3 s of 24 kHz PCM).
pub const DEFAULT_RING_CAPACITY: usize = 64 * 1024;

/// A fixed-capacity FIFO of bytes.
#[derive(Debug)]
pub struct AudioRingBuffer {
    buf: Box<[u8]>,
    head: usize,
    len: usize,
}

impl AudioRingBuffer {
    /// Creates a buffer that holds at most `capacity` bytes.
    ///
    /// A zero capacity is bumped to one byte so writes can make progress.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity.max(1)].into_boxed_slice(),
            head: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Free space in bytes.
    pub fn available(&self) -> usize {
        self.capacity() - self.len
    }

    /// Appends as much of `data` as fits and returns the number of bytes taken.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.available());
        let cap = self.capacity();
        let tail = (self.head + self.len) % cap;

        let first = n.min(cap - tail);
        self.buf[tail..tail + first].copy_from_slice(&data[..first]);
        let rest = n - first;
        if rest > 0 {
            self.buf[..rest].copy_from_slice(&data[first..n]);
        }

        self.len += n;
        n
    }

    /// Removes and returns exactly `frame_len` bytes, or `None` if fewer are
    /// buffered.
    pub fn read_exact_frame(&mut self, frame_len: usize) -> Option<Vec<u8>> {
        if frame_len == 0 || self.len < frame_len {
            return None;
        }
        Some(self.take(frame_len))
    }

    /// Removes and returns everything buffered.
    pub fn drain_all(&mut self) -> Vec<u8> {
        self.take(self.len)
    }

    /// Discards all buffered bytes.
    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    fn take(&mut self, n: usize) -> Vec<u8> {
        let cap = self.capacity();
        let mut out = Vec::with_capacity(n);
        let first = n.min(cap - self.head);
        out.extend_from_slice(&self.buf[self.head..self.head + first]);
        if n > first {
            out.extend_from_slice(&self.buf[..n - first]);
        }
        self.head = (self.head + n) % cap;
        self.len -= n;
        if self.len == 0 {
            self.head = 0;
        }
        out
    }
}

impl Default for AudioRingBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_RING_CAPACITY)
    }
}
