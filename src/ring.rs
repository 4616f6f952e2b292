//! A bounded ring buffer for framed controller packets.
//!
//! Packets are exchanged with the Bluetooth controller in time-critical code, so they're sent
//! through a queue to be processed at a later time (eg. in the application's idle loop). The
//! engine uses two rings: one for frames headed to the controller (TX) and one for frames the
//! controller delivered (RX).
//!
//! [`FrameRing`] is a FIFO of length-prefixed byte frames over a fixed backing store. Frames are
//! never split across the wrap boundary: an allocation either yields a contiguous slot of exactly
//! the requested size, or fails. Access happens through *leases*:
//!
//! * [`FrameRing::allocate`] hands out a [`WriteLease`] for a fresh slot. Calling
//!   [`WriteLease::commit`] publishes the frame; dropping the lease without committing returns
//!   the slot to the free pool, so a half-built frame never reaches the consumer.
//! * [`FrameRing::read`] hands out a [`ReadLease`] for the oldest committed frame. Dropping the
//!   lease frees the slot.
//!
//! Leases borrow the ring mutably, so at most one lease can exist per ring at any time and the
//! single-producer/single-consumer discipline is enforced by ownership rather than by a lock.
//!
//! [`FrameRing`]: struct.FrameRing.html
//! [`FrameRing::allocate`]: struct.FrameRing.html#method.allocate
//! [`FrameRing::read`]: struct.FrameRing.html#method.read
//! [`WriteLease`]: struct.WriteLease.html
//! [`WriteLease::commit`]: struct.WriteLease.html#method.commit
//! [`ReadLease`]: struct.ReadLease.html

use byteorder::{ByteOrder, LittleEndian};
use core::ops::{Deref, DerefMut};

/// Every frame is stored with a 2-byte length prefix.
const PREFIX: usize = 2;

/// A bounded FIFO of length-prefixed byte frames.
///
/// The buffer is laid out as a bip-buffer: when the free space at the end of the backing store is
/// too small for a frame, the allocation wraps around to the front as a whole and a watermark
/// remembers where the valid data at the end stops.
pub struct FrameRing<const N: usize> {
    buf: [u8; N],
    /// Start of the oldest committed frame.
    read: usize,
    /// End of the newest committed frame (= start of free space).
    write: usize,
    /// Wrap watermark: when `write < read`, committed data ends here instead of at `write`.
    last: usize,
}

impl<const N: usize> FrameRing<N> {
    /// Creates a new, empty ring.
    pub const fn new() -> Self {
        FrameRing {
            buf: [0; N],
            read: 0,
            write: 0,
            last: N,
        }
    }

    /// Reserves a contiguous slot for a frame of exactly `len` payload bytes.
    ///
    /// Returns `None` when no contiguous slot of that size is free. The slot only becomes visible
    /// to the consumer once [`WriteLease::commit`] is called; dropping the lease instead returns
    /// the slot.
    ///
    /// [`WriteLease::commit`]: struct.WriteLease.html#method.commit
    pub fn allocate(&mut self, len: usize) -> Option<WriteLease<'_, N>> {
        if len > u16::MAX as usize {
            return None;
        }

        let total = len + PREFIX;
        let (start, wraps) = if self.write >= self.read {
            if N - self.write >= total {
                (self.write, false)
            } else if self.read > total {
                // The tail is too small, but the frame fits in front of the reader. Leave a gap of
                // at least one byte so `read == write` still means "empty".
                (0, true)
            } else {
                return None;
            }
        } else if self.read - self.write > total {
            (self.write, false)
        } else {
            return None;
        };

        Some(WriteLease {
            ring: self,
            start,
            len,
            wraps,
        })
    }

    /// Takes the oldest committed frame out of the ring.
    ///
    /// The frame's slot is freed when the returned lease is dropped.
    pub fn read(&mut self) -> Option<ReadLease<'_, N>> {
        if self.read == self.write {
            return None;
        }
        if self.write < self.read && self.read == self.last {
            // All data at the end has been consumed, continue at the front.
            self.read = 0;
            if self.read == self.write {
                return None;
            }
        }

        let start = self.read;
        let len = usize::from(LittleEndian::read_u16(&self.buf[start..]));
        Some(ReadLease {
            ring: self,
            start,
            len,
        })
    }

    /// Drains all committed frames and returns their slots to the free pool.
    pub fn clear(&mut self) {
        self.read = 0;
        self.write = 0;
        self.last = N;
    }

    /// Returns whether the ring holds no committed frames.
    pub fn is_empty(&self) -> bool {
        self.read == self.write
    }
}

impl<const N: usize> Default for FrameRing<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive access to a freshly allocated frame slot.
///
/// Dereferences to the payload bytes. The slot is committed by [`commit`] and reclaimed when the
/// lease is dropped without committing.
///
/// [`commit`]: #method.commit
pub struct WriteLease<'a, const N: usize> {
    ring: &'a mut FrameRing<N>,
    start: usize,
    len: usize,
    wraps: bool,
}

impl<'a, const N: usize> WriteLease<'a, N> {
    /// Publishes the frame, making it visible to the consuming side of the ring.
    pub fn commit(self) {
        let total = self.len + PREFIX;
        LittleEndian::write_u16(&mut self.ring.buf[self.start..], self.len as u16);
        if self.wraps {
            self.ring.last = self.ring.write;
            self.ring.write = total;
        } else {
            self.ring.write = self.start + total;
        }
    }
}

impl<'a, const N: usize> Deref for WriteLease<'a, N> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.ring.buf[self.start + PREFIX..self.start + PREFIX + self.len]
    }
}

impl<'a, const N: usize> DerefMut for WriteLease<'a, N> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.ring.buf[self.start + PREFIX..self.start + PREFIX + self.len]
    }
}

/// Exclusive access to the oldest committed frame.
///
/// Dereferences to the frame's payload. The slot is returned to the free pool when the lease is
/// dropped.
pub struct ReadLease<'a, const N: usize> {
    ring: &'a mut FrameRing<N>,
    start: usize,
    len: usize,
}

impl<'a, const N: usize> Deref for ReadLease<'a, N> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.ring.buf[self.start + PREFIX..self.start + PREFIX + self.len]
    }
}

impl<'a, const N: usize> Drop for ReadLease<'a, N> {
    fn drop(&mut self) {
        let next = self.start + self.len + PREFIX;
        if self.ring.write < self.ring.read && next == self.ring.last {
            self.ring.read = 0;
        } else {
            self.ring.read = next;
        }
    }
}
