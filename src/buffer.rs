use bytes::{Bytes, BytesMut};

/// Fixed-capacity staging buffer for one connection's pending writes
///
/// Accumulates small application writes until it fills (or a flush detaches
/// it), at which point the content is frozen and moves into a send command.
/// Capacity is fixed at allocation time; `used <= capacity` always holds.
#[derive(Debug)]
pub(crate) struct WriteBuffer {
    buf: BytesMut,
    capacity: usize,
}

impl WriteBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Copy as much of `data` as fits, returning the number of bytes taken
    pub(crate) fn fill(&mut self, data: &[u8]) -> usize {
        let n = self.available().min(data.len());
        self.buf.extend_from_slice(&data[..n]);
        n
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes still free in this buffer
    pub(crate) fn available(&self) -> usize {
        self.capacity - self.buf.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.buf.len() == self.capacity
    }

    /// Freeze the staged content for hand-off to the command executor
    pub(crate) fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}
