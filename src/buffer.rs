//! Per-connection ring byte buffer.
//!
//! Linear read/write cursors over a fixed-size byte array. Not a circular
//! buffer in the wraparound sense: once `write_pos` reaches capacity the
//! buffer is full until `consume` drains it back to empty, at which point
//! both cursors snap to zero. Sized for the common case of one HTTP
//! request per fill.

/// Fixed-capacity read-side buffer owned by a connection.
pub struct RingBuffer {
    data: Box<[u8]>,
    read_pos: usize,
    write_pos: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            read_pos: 0,
            write_pos: 0,
        }
    }

    /// Tail slice available for the next recv.
    pub fn writable(&mut self) -> &mut [u8] {
        &mut self.data[self.write_pos..]
    }

    /// Bytes available for the next recv without a reset.
    pub fn writable_len(&self) -> usize {
        self.data.len() - self.write_pos
    }

    /// Advance the write cursor after a successful recv.
    ///
    /// `n` exceeding the writable slice length is a caller bug.
    pub fn commit_write(&mut self, n: usize) {
        debug_assert!(
            self.write_pos + n <= self.data.len(),
            "commit_write past buffer capacity"
        );
        self.write_pos = (self.write_pos + n).min(self.data.len());
    }

    /// Bytes available for parsing.
    pub fn readable(&self) -> &[u8] {
        &self.data[self.read_pos..self.write_pos]
    }

    /// Drop `n` consumed bytes from the head. Resets both cursors to zero
    /// once the buffer is fully drained (amortized O(1) for the common
    /// one-request-per-fill case).
    pub fn consume(&mut self, n: usize) {
        self.read_pos += n;
        debug_assert!(self.read_pos <= self.write_pos);
        if self.read_pos == self.write_pos {
            self.read_pos = 0;
            self.write_pos = 0;
        }
    }

    /// Drop all buffered bytes and return to the empty state.
    pub fn reset(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// True once a recv cannot make further progress without a consume:
    /// the buffer filled up before a complete request arrived. Callers
    /// treat this as an oversized-request protocol error.
    pub fn is_full(&self) -> bool {
        self.write_pos == self.data.len()
    }
}
