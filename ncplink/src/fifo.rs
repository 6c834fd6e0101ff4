//! Interrupt-to-task receive FIFO
//!
//! A fixed-capacity single-producer/single-consumer byte ring. The producer
//! runs in interrupt context, the consumer on the driver task; the two
//! sides share nothing but the atomic indices, so no lock ever spans the
//! interrupt boundary. One slot is sacrificed to distinguish full from
//! empty.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

pub(crate) struct Fifo<const N: usize> {
    buf: [UnsafeCell<u8>; N],
    /// Producer index: next slot to write.
    head: AtomicUsize,
    /// Consumer index: next slot to read.
    tail: AtomicUsize,
}

// The producer writes a slot strictly before publishing it through `head`,
// and the consumer reads it strictly before retiring it through `tail`.
unsafe impl<const N: usize> Sync for Fifo<N> {}

impl<const N: usize> Fifo<N> {
    pub const fn new() -> Self {
        Self {
            buf: [const { UnsafeCell::new(0) }; N],
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    const fn advance(index: usize) -> usize {
        if index < N - 1 { index + 1 } else { 0 }
    }

    /// Producer side. Returns `Err(byte)` when the ring is full.
    pub fn put(&self, byte: u8) -> Result<(), u8> {
        let head = self.head.load(Ordering::Relaxed);
        let new_head = Self::advance(head);

        if new_head == self.tail.load(Ordering::Acquire) {
            return Err(byte);
        }

        // Safety: `head` is owned by the single producer and the slot is
        // not yet visible to the consumer.
        unsafe { *self.buf[head].get() = byte };
        self.head.store(new_head, Ordering::Release);
        Ok(())
    }

    /// Consumer side.
    pub fn get(&self) -> Option<u8> {
        let tail = self.tail.load(Ordering::Relaxed);

        if tail == self.head.load(Ordering::Acquire) {
            return None;
        }

        // Safety: `tail` is owned by the single consumer and the producer
        // will not reuse the slot until `tail` is advanced past it.
        let byte = unsafe { *self.buf[tail].get() };
        self.tail.store(Self::advance(tail), Ordering::Release);
        Some(byte)
    }

    pub fn is_empty(&self) -> bool {
        self.tail.load(Ordering::Acquire) == self.head.load(Ordering::Acquire)
    }

    fn free(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        let used = if head >= tail { head - tail } else { N - tail + head };
        N - 1 - used
    }

    /// True when fewer than `threshold` free slots remain.
    pub fn near_full(&self, threshold: usize) -> bool {
        self.free() < threshold
    }

    /// Discards all content. Only legal while the producer is quiesced
    /// (receive interrupt disabled).
    pub fn reset(&self) {
        self.tail.store(0, Ordering::Relaxed);
        self.head.store(0, Ordering::Release);
    }
}
