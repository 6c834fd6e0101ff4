//! Bounded outbound message store
//!
//! Variable-length outbound datagrams live in a caller-provided byte ring.
//! Each allocation is one contiguous 4-byte-aligned run; an allocation
//! that would straddle the end of the ring wraps to the start and records
//! the skipped trailing bytes in the end-gap. At most two live segments
//! exist at any instant (one at the front, one at the back of the array).
//!
//! Releases must target either the oldest message (the ring tail) or the
//! newest (the ring head); anything else is a programming error. A tail
//! release advances past the end-gap once the tail reaches it; a head
//! release that rewinds to the array base backs up over the end-gap.
//!
//! The store itself is lock-free-agnostic: the owner wraps it in a
//! blocking mutex, and the waiter handshake (one wake per space-freeing
//! release while the waiter mailbox is empty) is driven through the
//! [`TxStore::free`] return value.

use heapless::Deque;
use ncplink_core::Error;

use crate::config::MESSAGE_QUEUE_SIZE;

pub(crate) const MSG_FLAG_SECURE: u8 = 0x02;
pub(crate) const MSG_FLAG_LEGACY: u8 = 0x04;

/// An outbound message record: an allocation in the ring plus read state.
///
/// The record is a value; the payload bytes stay in the store until the
/// message is freed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct Msg {
    /// Payload start within the ring.
    offset: u16,
    /// Bytes appended so far.
    len: u16,
    /// Size of the whole aligned allocation.
    total: u16,
    /// Read cursor for [`TxStore::read`].
    pos: u16,
    flags: u8,
}

impl Msg {
    pub fn is_secure(&self) -> bool {
        self.flags & MSG_FLAG_SECURE != 0
    }

    pub fn set_secure(&mut self, secure: bool) {
        if secure {
            self.flags |= MSG_FLAG_SECURE;
        } else {
            self.flags &= !MSG_FLAG_SECURE;
        }
    }

    pub fn is_legacy(&self) -> bool {
        self.flags & MSG_FLAG_LEGACY != 0
    }

    pub fn set_legacy(&mut self, legacy: bool) {
        if legacy {
            self.flags |= MSG_FLAG_LEGACY;
        } else {
            self.flags &= !MSG_FLAG_LEGACY;
        }
    }

    pub fn reset_pos(&mut self) {
        self.pos = 0;
    }
}

const fn align4(len: usize) -> usize {
    (len + 3) & !3
}

pub(crate) struct TxStore<'b> {
    ring: &'b mut [u8],
    /// Next allocation point.
    head: usize,
    /// Oldest live byte.
    tail: usize,
    /// Unused trailing bytes skipped by the last wrapping allocation.
    end_gap: usize,
    /// True while the waiter mailbox is empty and a wake may be posted.
    waiter_idle: bool,
    queue: Deque<Msg, MESSAGE_QUEUE_SIZE>,
}

impl<'b> TxStore<'b> {
    pub fn new(ring: &'b mut [u8]) -> Self {
        Self {
            ring,
            head: 0,
            tail: 0,
            end_gap: 0,
            waiter_idle: true,
            queue: Deque::new(),
        }
    }

    /// Reserves an aligned run for `len` payload bytes. `None` when no
    /// sufficient run exists; the caller then blocks on the waiter mailbox.
    pub fn alloc(&mut self, secure: bool, len: usize) -> Option<Msg> {
        // The arithmetic below is simplest when an empty ring restarts at
        // the array base.
        if self.head == self.tail {
            self.head = 0;
            self.tail = 0;
        }

        let total = align4(len);
        let term_end = if self.head < self.tail { self.tail } else { self.ring.len() };
        let term_start = (self.head > self.tail).then_some(self.tail);

        let offset = if self.head + total < term_end {
            // Fits in the run at the current head.
            let offset = self.head;
            self.head += total;
            offset
        } else if term_start.is_some_and(|start| total < start) {
            // Wraps to the start, leaving the end-gap behind.
            self.end_gap = self.ring.len() - self.head;
            self.head = total;
            0
        } else {
            return None;
        };

        let mut msg = Msg {
            offset: offset as u16,
            len: 0,
            total: total as u16,
            pos: 0,
            flags: 0,
        };
        msg.set_secure(secure);
        Some(msg)
    }

    /// Releases the oldest or the newest live allocation. Returns true
    /// when the caller must post exactly one wake to the waiter mailbox.
    pub fn free(&mut self, msg: &Msg) -> Result<bool, Error> {
        let offset = msg.offset as usize;
        let total = msg.total as usize;

        if offset == self.tail {
            self.tail += total;

            if self.tail + self.end_gap >= self.ring.len() {
                // The tail reached the gap left by a wrapping allocation.
                self.tail = 0;
                self.end_gap = 0;
            }
        } else if offset + total == self.head {
            self.head = offset;

            if self.head == 0 && self.end_gap != 0 {
                self.head = self.ring.len() - self.end_gap;
                self.end_gap = 0;
            }
        } else {
            error!(
                "freed message does not align with head or tail: {} {} {}",
                offset, self.tail, self.head
            );
            return Err(Error::InvalidArgs);
        }

        if self.waiter_idle {
            self.waiter_idle = false;
            return Ok(true);
        }
        Ok(false)
    }

    /// Marks the waiter mailbox empty again; called by the waiter after it
    /// consumed a wake event.
    pub fn set_waiter_idle(&mut self) {
        self.waiter_idle = true;
    }

    /// Copies into the reserved payload behind what was already appended.
    pub fn append(&mut self, msg: &mut Msg, bytes: &[u8]) -> Result<(), Error> {
        let len = msg.len as usize;
        if len + bytes.len() > msg.total as usize {
            return Err(Error::NoBufs);
        }

        let start = msg.offset as usize + len;
        self.ring[start..start + bytes.len()].copy_from_slice(bytes);
        msg.len += bytes.len() as u16;
        Ok(())
    }

    /// Copies out of the payload at the message's read cursor, returning
    /// the number of bytes produced.
    pub fn read(&self, msg: &mut Msg, out: &mut [u8]) -> usize {
        let available = (msg.len - msg.pos) as usize;
        let n = out.len().min(available);

        if n != 0 {
            let start = (msg.offset + msg.pos) as usize;
            out[..n].copy_from_slice(&self.ring[start..start + n]);
            msg.pos += n as u16;
        }
        n
    }

    /// The full appended payload.
    pub fn payload(&self, msg: &Msg) -> &[u8] {
        let start = msg.offset as usize;
        &self.ring[start..start + msg.len as usize]
    }

    pub fn enqueue(&mut self, msg: Msg) -> Result<(), Error> {
        self.queue.push_back(msg).map_err(|_| Error::NoBufs)
    }

    pub fn dequeue(&mut self) -> Option<Msg> {
        self.queue.pop_front()
    }

    pub fn queue_is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Modular distance from tail to head: live bytes plus the end-gap.
    #[cfg(test)]
    fn occupied(&self) -> usize {
        if self.head >= self.tail {
            let gap = if self.head > self.tail { self.end_gap } else { 0 };
            self.head - self.tail + gap
        } else {
            self.ring.len() - self.tail + self.head
        }
    }
}
