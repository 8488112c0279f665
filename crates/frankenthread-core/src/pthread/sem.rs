//! Counting semaphores.
//!
//! The count and the wake sequence live in separate words. Waiters sleep on
//! the sequence (which carries the cancellation arm bit), so a cancel can
//! disturb a sleeper without ever touching the count.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::pthread::cancel::{self, CancelScope};
use crate::pthread::futex::{AddressWait, WaitWord};
use crate::runtime::Runtime;

/// Largest value a semaphore can hold.
pub const SEM_VALUE_MAX: u32 = 0x7fff_ffff;

/// Post increments the sequence by this much, leaving the arm bit alone.
const SEQ_STEP: u32 = 2;

#[derive(Debug)]
pub struct Semaphore {
    value: AtomicU32,
    seq: AtomicU32,
}

impl Semaphore {
    #[must_use]
    pub const fn new(initial: u32) -> Self {
        assert!(initial <= SEM_VALUE_MAX, "semaphore initial value too large");
        Self {
            value: AtomicU32::new(initial),
            seq: AtomicU32::new(0),
        }
    }

    /// Increment the count and wake the waiters.
    ///
    /// Every sleeper is woken, so a waiter cancelled between its wake and
    /// taking the count cannot strand the post.
    pub fn post(&self) {
        let previous = self.value.fetch_add(1, Ordering::Release);
        assert!(previous < SEM_VALUE_MAX, "semaphore overflow");
        self.seq.fetch_add(SEQ_STEP, Ordering::Release);
        Runtime::global().waits().wake_all(self.seq.address());
    }

    /// Decrement the count if positive, without blocking.
    #[must_use]
    pub fn try_wait(&self) -> bool {
        let mut current = self.value.load(Ordering::Relaxed);
        while current > 0 {
            match self.value.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    /// Decrement the count, blocking while it is zero.
    ///
    /// Cancellation point: checked before every attempt.
    pub fn wait(&self) {
        let waits = Runtime::global().waits();
        loop {
            cancel::test_cancel();
            if self.try_wait() {
                return;
            }
            let seen = cancel::arm(&self.seq);
            let _scope = CancelScope::enter(&self.seq, waits);
            // A post between the first attempt and arming already moved seq.
            if self.try_wait() {
                return;
            }
            waits.wait(&self.seq, seen, None);
        }
    }

    /// Current count, for diagnostics.
    #[must_use]
    pub fn value(&self) -> u32 {
        self.value.load(Ordering::Relaxed)
    }
}
