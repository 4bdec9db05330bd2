//! # Ring Buffer
//!
//! Fixed-capacity single-producer single-consumer byte ring. The connection
//! lane writes inbound entries; the owning process drains them with
//! `pick_msg`.
//!
//! Both cursors only ever grow. `tail - head` is the number of readable
//! bytes and the byte at cursor `c` lives at `c % capacity`. Each side holds
//! the lock only for one copy, and writes are all-or-nothing, so a reader
//! never observes half an entry.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

struct Ring {
    buf: Box<[u8]>,
    head: usize,
    tail: usize,
}

impl Ring {
    fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn len(&self) -> usize {
        self.tail.wrapping_sub(self.head)
    }

    fn copy_in(&mut self, at: usize, data: &[u8]) {
        let cap = self.capacity();
        let start = at % cap;
        let first = data.len().min(cap - start);
        self.buf[start..start + first].copy_from_slice(&data[..first]);
        self.buf[..data.len() - first].copy_from_slice(&data[first..]);
    }

    fn copy_out(&self, at: usize, out: &mut [u8]) {
        let cap = self.capacity();
        let start = at % cap;
        let first = out.len().min(cap - start);
        let rest = out.len() - first;
        out[..first].copy_from_slice(&self.buf[start..start + first]);
        out[first..].copy_from_slice(&self.buf[..rest]);
    }
}

type Shared = Arc<Mutex<Ring>>;

// Every critical section leaves the cursors consistent, so a poisoned lock
// is still usable.
fn lock(shared: &Shared) -> MutexGuard<'_, Ring> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Create a ring of `capacity` bytes (at least 1).
pub fn ring_buffer(capacity: usize) -> (RingProducer, RingConsumer) {
    let shared = Arc::new(Mutex::new(Ring {
        buf: vec![0u8; capacity.max(1)].into_boxed_slice(),
        head: 0,
        tail: 0,
    }));
    (
        RingProducer {
            shared: Arc::clone(&shared),
        },
        RingConsumer { shared },
    )
}

/// Write side; not `Clone`, so there is exactly one.
pub struct RingProducer {
    shared: Shared,
}

impl RingProducer {
    pub fn capacity(&self) -> usize {
        lock(&self.shared).capacity()
    }

    pub fn len(&self) -> usize {
        lock(&self.shared).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when `additional` more bytes would not fit
    pub fn is_full(&self, additional: usize) -> bool {
        let ring = lock(&self.shared);
        ring.len() + additional > ring.capacity()
    }

    pub fn try_write(&mut self, data: &[u8]) -> bool {
        self.try_write_parts(&[data])
    }

    /// Write the concatenation of `parts`, or nothing at all.
    pub fn try_write_parts(&mut self, parts: &[&[u8]]) -> bool {
        let total: usize = parts.iter().map(|p| p.len()).sum();
        let mut ring = lock(&self.shared);
        if ring.len() + total > ring.capacity() {
            return false;
        }
        let mut at = ring.tail;
        for part in parts {
            ring.copy_in(at, part);
            at = at.wrapping_add(part.len());
        }
        ring.tail = at;
        true
    }
}

/// Read side; not `Clone`, so there is exactly one.
pub struct RingConsumer {
    shared: Shared,
}

impl RingConsumer {
    pub fn capacity(&self) -> usize {
        lock(&self.shared).capacity()
    }

    /// Readable bytes
    pub fn len(&self) -> usize {
        lock(&self.shared).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `out.len()` bytes without consuming them.
    pub fn peek(&self, out: &mut [u8]) -> bool {
        let ring = lock(&self.shared);
        if ring.len() < out.len() {
            return false;
        }
        ring.copy_out(ring.head, out);
        true
    }

    /// Consume exactly `out.len()` bytes, or nothing.
    pub fn try_read(&mut self, out: &mut [u8]) -> bool {
        let mut ring = lock(&self.shared);
        if ring.len() < out.len() {
            return false;
        }
        ring.copy_out(ring.head, out);
        ring.head = ring.head.wrapping_add(out.len());
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read() {
        let (mut tx, mut rx) = ring_buffer(16);
        assert!(rx.is_empty());
        assert!(tx.try_write(b"abcd"));
        assert_eq!(rx.len(), 4);

        let mut out = [0u8; 4];
        assert!(rx.try_read(&mut out));
        assert_eq!(&out, b"abcd");
        assert!(rx.is_empty());
        assert!(tx.is_empty());
    }

    #[test]
    fn full_ring_refuses_whole_entry() {
        let (mut tx, mut rx) = ring_buffer(8);
        assert!(tx.try_write(b"123456"));
        assert!(tx.is_full(3));
        assert!(!tx.try_write_parts(&[&b"ab"[..], &b"c"[..]]));
        assert_eq!(rx.len(), 6);

        let mut out = [0u8; 6];
        assert!(rx.try_read(&mut out));
        assert!(tx.try_write_parts(&[&b"ab"[..], &b"c"[..]]));
    }

    #[test]
    fn wraps_around_the_end() {
        let (mut tx, mut rx) = ring_buffer(10);
        let mut scratch = [0u8; 7];
        assert!(tx.try_write(b"0123456"));
        assert!(rx.try_read(&mut scratch));

        assert!(tx.try_write_parts(&[&b"abc"[..], &b"defgh"[..]]));
        let mut out = [0u8; 8];
        assert!(rx.peek(&mut out));
        assert_eq!(&out, b"abcdefgh");
        assert!(rx.try_read(&mut out));
        assert_eq!(&out, b"abcdefgh");
    }

    #[test]
    fn fills_to_exact_capacity_across_the_seam() {
        let (mut tx, mut rx) = ring_buffer(6);
        let mut out = [0u8; 4];
        assert!(tx.try_write(b"wxyz"));
        assert!(rx.try_read(&mut out));

        // Cursor sits at 4; six bytes wrap and leave no slack.
        assert!(tx.try_write_parts(&[&b"12"[..], &b"3456"[..]]));
        assert!(tx.is_full(1));
        assert!(!tx.try_write(b"!"));

        let mut all = [0u8; 6];
        assert!(rx.peek(&mut all));
        assert_eq!(&all, b"123456");
        assert!(rx.try_read(&mut all));
        assert_eq!(&all, b"123456");
        assert!(rx.is_empty());
        assert_eq!(rx.capacity(), 6);
    }

    #[test]
    fn short_read_consumes_nothing() {
        let (mut tx, mut rx) = ring_buffer(8);
        assert!(tx.try_write(b"xy"));
        let mut out = [0u8; 3];
        assert!(!rx.try_read(&mut out));
        assert_eq!(rx.len(), 2);
    }

    #[test]
    fn producer_and_consumer_on_different_threads() {
        let (mut tx, mut rx) = ring_buffer(64);
        const ENTRIES: u32 = 10_000;

        let writer = std::thread::spawn(move || {
            for i in 0..ENTRIES {
                let bytes = i.to_be_bytes();
                while !tx.try_write_parts(&[&bytes[..2], &bytes[2..]]) {
                    std::thread::yield_now();
                }
            }
        });

        let mut expected = 0u32;
        let mut out = [0u8; 4];
        while expected < ENTRIES {
            if rx.try_read(&mut out) {
                assert_eq!(u32::from_be_bytes(out), expected);
                expected += 1;
            } else {
                std::thread::yield_now();
            }
        }
        writer.join().unwrap();
    }
}
