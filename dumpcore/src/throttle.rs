// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Bounds the number of manual captures in flight.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};

/// Concurrent manual captures allowed at once.
pub const MAX_CONCURRENT_OPERATIONS: usize = 4;

/// A counting slot pool.
///
/// Slots are taken with a compare-and-swap and returned with a decrement
/// followed by a notification. A caller that finds no free slot waits on a
/// condition variable, without a timeout.
#[derive(Debug)]
pub struct OperationSlots {
    active: AtomicUsize,
    capacity: usize,
    lock: Mutex<()>,
    freed: Condvar,
}

/// A held slot, returned on drop.
#[derive(Debug)]
pub struct SlotGuard<'a> {
    slots: &'a OperationSlots,
}

impl OperationSlots {
    /// Creates a pool of `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        Self {
            active: AtomicUsize::new(0),
            capacity: capacity.max(1),
            lock: Mutex::new(()),
            freed: Condvar::new(),
        }
    }

    /// Number of slots currently held.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Takes a slot if one is free.
    pub fn try_acquire(&self) -> Option<SlotGuard<'_>> {
        let mut current = self.active.load(Ordering::Acquire);
        while current < self.capacity {
            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(SlotGuard { slots: self }),
                Err(actual) => current = actual,
            }
        }
        None
    }

    /// Takes a slot, blocking until one is free.
    pub fn acquire(&self) -> SlotGuard<'_> {
        loop {
            if let Some(guard) = self.try_acquire() {
                return guard;
            }

            let mut waiting = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
            while self.active.load(Ordering::Acquire) >= self.capacity {
                waiting = self
                    .freed
                    .wait(waiting)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
    }

    fn release(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
        // Taking the lock orders the decrement before a waiter's re-check.
        let _held = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.freed.notify_one();
    }
}

impl Default for OperationSlots {
    fn default() -> Self {
        Self::new(MAX_CONCURRENT_OPERATIONS)
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.slots.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn slots_are_bounded() {
        let slots = OperationSlots::new(2);
        let a = slots.try_acquire();
        let b = slots.try_acquire();
        assert!(a.is_some() && b.is_some());
        assert!(slots.try_acquire().is_none());
        assert_eq!(slots.active(), 2);

        drop(a);
        assert_eq!(slots.active(), 1);
        assert!(slots.try_acquire().is_some());
        assert_eq!(slots.active(), 1);
    }

    #[test]
    fn waiter_wakes_when_a_slot_frees() {
        let slots = Arc::new(OperationSlots::new(1));
        let held = slots.acquire();

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let slots = Arc::clone(&slots);
            std::thread::spawn(move || {
                let _slot = slots.acquire();
                tx.send(()).unwrap();
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(held);
        rx.recv_timeout(Duration::from_secs(10)).unwrap();
        waiter.join().unwrap();
        assert_eq!(slots.active(), 0);
    }

    #[test]
    fn many_threads_never_exceed_capacity() {
        let slots = Arc::new(OperationSlots::default());
        let peak = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..16)
            .map(|_| {
                let slots = Arc::clone(&slots);
                let peak = Arc::clone(&peak);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let _slot = slots.acquire();
                        peak.fetch_max(slots.active(), Ordering::AcqRel);
                        std::thread::yield_now();
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        assert!(peak.load(Ordering::Acquire) <= MAX_CONCURRENT_OPERATIONS);
        assert_eq!(slots.active(), 0);
    }
}
