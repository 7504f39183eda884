//! Byte FIFO used for per-connection buffered I/O.

use tracing::error;

/// Growable byte FIFO with amortised compaction.
///
/// Holds `read_index <= write_index <= capacity`. Bytes between the two
/// indices are readable; bytes past `write_index` are writable. Writes that
/// outgrow the writable tail resize the storage to `1.5 * (write_index +
/// need)`; reads compact the buffer once `read_index` drifts past a third of
/// the capacity so the tail stays usable.
pub struct RingBuffer {
    data: Vec<u8>,
    read_index: usize,
    write_index: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        RingBuffer {
            data: vec![0; capacity.max(1)],
            read_index: 0,
            write_index: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of bytes available to read.
    #[inline]
    pub fn readable(&self) -> usize {
        self.write_index - self.read_index
    }

    /// Number of bytes that can be written without growing.
    #[inline]
    pub fn writable(&self) -> usize {
        self.data.len() - self.write_index
    }

    #[inline]
    pub fn read_index(&self) -> usize {
        self.read_index
    }

    #[inline]
    pub fn write_index(&self) -> usize {
        self.write_index
    }

    /// Append `buf`, growing the storage when the writable tail is short.
    pub fn write_all(&mut self, buf: &[u8]) {
        if buf.len() > self.writable() {
            let new_size = (self.write_index + buf.len()) * 3 / 2;
            self.resize(new_size);
        }
        self.data[self.write_index..self.write_index + buf.len()].copy_from_slice(buf);
        self.write_index += buf.len();
    }

    /// Read up to `max` bytes, advancing the read index.
    pub fn read_up_to(&mut self, max: usize) -> Vec<u8> {
        let n = self.readable().min(max);
        let out = self.data[self.read_index..self.read_index + n].to_vec();
        self.read_index += n;
        self.compact();
        out
    }

    /// The readable bytes, in order. Does not advance the read index.
    #[inline]
    pub fn readable_slice(&self) -> &[u8] {
        &self.data[self.read_index..self.write_index]
    }

    /// The writable tail. Callers read socket data directly into this slice
    /// and then commit it with [`move_write`](Self::move_write).
    #[inline]
    pub fn writable_tail_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.write_index..]
    }

    /// Advance the read index by `n`. Returns false (and leaves the buffer
    /// untouched) when `n` exceeds the readable span.
    pub fn move_read(&mut self, n: usize) -> bool {
        if self.read_index + n > self.write_index {
            error!(
                n,
                read_index = self.read_index,
                write_index = self.write_index,
                "move_read past write index"
            );
            return false;
        }
        self.read_index += n;
        self.compact();
        true
    }

    /// Advance the write index by `n`. Returns false when `n` exceeds the
    /// writable span.
    pub fn move_write(&mut self, n: usize) -> bool {
        if self.write_index + n > self.data.len() {
            error!(
                n,
                write_index = self.write_index,
                capacity = self.data.len(),
                "move_write past capacity"
            );
            return false;
        }
        self.write_index += n;
        true
    }

    /// Resize the storage, preserving the readable bytes and rebasing the
    /// read index to zero.
    pub fn resize(&mut self, new_capacity: usize) {
        let mut next = vec![0; new_capacity.max(1)];
        let count = self.readable().min(next.len());
        next[..count].copy_from_slice(&self.data[self.read_index..self.read_index + count]);
        self.data = next;
        self.read_index = 0;
        self.write_index = count;
    }

    /// Shift the readable bytes to the front once the read index has drifted
    /// past a third of the capacity.
    pub fn compact(&mut self) {
        if self.read_index < self.data.len() / 3 {
            return;
        }
        let count = self.readable();
        self.data.copy_within(self.read_index..self.write_index, 0);
        self.read_index = 0;
        self.write_index = count;
    }
}
