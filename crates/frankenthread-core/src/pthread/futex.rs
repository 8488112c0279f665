//! Address waits.
//!
//! Futex-style "sleep while the word at this address still holds the value I
//! saw" for 1, 2, 4 and 8 byte atomics. The portable backend is a fixed table
//! of [`WAIT_BUCKETS`] buckets, each a lock plus a condition variable,
//! selected by hashing the word's address. Distinct addresses may share a
//! bucket, so every wake is a broadcast on that bucket and waiters must
//! re-check their own word.
//!
//! On Linux a native backend can be selected at startup. It serves 4-byte
//! words with `FUTEX_WAIT`/`FUTEX_WAKE` and falls back to the bucket table for
//! the other sizes; wakes always reach both.

use std::sync::atomic::{AtomicU8, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::time::Tick;

/// Number of wait buckets.
pub const WAIT_BUCKETS: usize = 32;

/// Longest single native wait, in milliseconds.
pub const MAX_WAIT_MS: u64 = 0x7fff_ffff;

/// Why a wait returned.
///
/// `Woken` covers genuine wakes, spurious ones and the immediate return when
/// the word no longer held the expected value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Woken,
    TimedOut,
}

/// An atomic word that can be the target of an address wait.
pub trait WaitWord: Sync {
    type Value: Copy + Eq;

    /// Width of the word in bytes.
    const SIZE: usize;

    fn load_relaxed(&self) -> Self::Value;

    /// The value zero-extended to 64 bits.
    fn widen(value: Self::Value) -> u64;

    fn address(&self) -> usize {
        std::ptr::from_ref(self).cast::<()>() as usize
    }
}

macro_rules! wait_word {
    ($atomic:ty, $value:ty) => {
        impl WaitWord for $atomic {
            type Value = $value;
            const SIZE: usize = std::mem::size_of::<$value>();

            #[inline]
            fn load_relaxed(&self) -> $value {
                self.load(Ordering::Relaxed)
            }

            #[inline]
            fn widen(value: $value) -> u64 {
                u64::from(value)
            }
        }
    };
}

wait_word!(AtomicU8, u8);
wait_word!(AtomicU16, u16);
wait_word!(AtomicU32, u32);
wait_word!(AtomicU64, u64);

/// Sleep/wake on the value of an atomic word.
pub trait AddressWait: Sync {
    /// Block while `word` holds `expected`, until woken or `timeout` elapses.
    ///
    /// Returns immediately when the word already differs. Spurious returns
    /// are allowed; callers loop on their own condition.
    fn wait<W: WaitWord>(&self, word: &W, expected: W::Value, timeout: Option<Duration>)
    -> WaitOutcome;

    /// Wake at least one waiter on `address`.
    fn wake_one(&self, address: usize);

    /// Wake every waiter on `address`.
    fn wake_all(&self, address: usize);

    /// Timed wait taking a relative delay in ticks.
    ///
    /// Returns `false` only on timeout. Delays beyond [`MAX_WAIT_MS`] wait
    /// that long and then report a (spurious) wake.
    fn timed_wait<W: WaitWord>(&self, word: &W, expected: W::Value, delay: Tick) -> bool {
        let delay = delay.max(0).unsigned_abs();
        let ms = delay.div_ceil(1000);
        if ms > MAX_WAIT_MS {
            self.wait(word, expected, Some(Duration::from_millis(MAX_WAIT_MS)));
            return true;
        }
        self.wait(word, expected, Some(Duration::from_millis(ms))) == WaitOutcome::Woken
    }
}

struct Bucket {
    lock: Mutex<()>,
    wakeup: Condvar,
}

impl Bucket {
    const fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            wakeup: Condvar::new(),
        }
    }
}

/// Portable address-wait backend: a fixed table of hashed buckets.
pub struct WaitTable {
    buckets: [Bucket; WAIT_BUCKETS],
}

impl WaitTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            buckets: [const { Bucket::new() }; WAIT_BUCKETS],
        }
    }

    /// Bucket index for an address. Words are assumed at least 8-byte spread.
    #[must_use]
    pub const fn bucket_index(address: usize) -> usize {
        (address >> 3) % WAIT_BUCKETS
    }

    fn bucket(&self, address: usize) -> &Bucket {
        &self.buckets[Self::bucket_index(address)]
    }
}

impl Default for WaitTable {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressWait for WaitTable {
    fn wait<W: WaitWord>(
        &self,
        word: &W,
        expected: W::Value,
        timeout: Option<Duration>,
    ) -> WaitOutcome {
        let bucket = self.bucket(word.address());
        let mut guard = bucket.lock.lock();
        // Checked under the bucket lock: a waker must take the same lock
        // before broadcasting, so a change made before its wake is seen here.
        if word.load_relaxed() != expected {
            return WaitOutcome::Woken;
        }
        match timeout {
            None => {
                bucket.wakeup.wait(&mut guard);
                WaitOutcome::Woken
            }
            Some(limit) => {
                if bucket.wakeup.wait_for(&mut guard, limit).timed_out() {
                    WaitOutcome::TimedOut
                } else {
                    WaitOutcome::Woken
                }
            }
        }
    }

    fn wake_one(&self, address: usize) {
        // Buckets are shared between addresses; waking one could pick a
        // waiter on an unrelated word.
        self.wake_all(address);
    }

    fn wake_all(&self, address: usize) {
        let bucket = self.bucket(address);
        drop(bucket.lock.lock());
        bucket.wakeup.notify_all();
    }
}

/// Which address-wait backend a [`WaitService`] routes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitBackend {
    /// Hashed bucket table.
    #[default]
    Emulated,
    /// Kernel futex for 4-byte words (Linux only).
    Native,
}

impl WaitBackend {
    /// Parse a backend name, accepting a few spellings.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "emulated" | "buckets" | "portable" => Some(Self::Emulated),
            "native" | "futex" => Some(Self::Native),
            _ => None,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Emulated => "emulated",
            Self::Native => "native",
        }
    }

    /// Whether the native backend exists on this platform.
    #[must_use]
    pub const fn native_supported() -> bool {
        cfg!(any(target_os = "linux", target_os = "android"))
    }
}

const BACKEND_EMULATED: u8 = 0;
const BACKEND_NATIVE: u8 = 1;

/// The runtime's address-wait service.
///
/// The backend must be chosen before any thread waits; switching it while
/// waiters are asleep could strand them on the other backend.
pub struct WaitService {
    backend: AtomicU8,
    table: WaitTable,
}

impl WaitService {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            backend: AtomicU8::new(BACKEND_EMULATED),
            table: WaitTable::new(),
        }
    }

    /// Route waits through `backend`, returning the backend actually in use.
    pub fn select_backend(&self, backend: WaitBackend) -> WaitBackend {
        let effective = match backend {
            WaitBackend::Native if WaitBackend::native_supported() => WaitBackend::Native,
            _ => WaitBackend::Emulated,
        };
        let raw = match effective {
            WaitBackend::Native => BACKEND_NATIVE,
            WaitBackend::Emulated => BACKEND_EMULATED,
        };
        self.backend.store(raw, Ordering::Release);
        effective
    }

    #[must_use]
    pub fn backend(&self) -> WaitBackend {
        match self.backend.load(Ordering::Acquire) {
            BACKEND_NATIVE => WaitBackend::Native,
            _ => WaitBackend::Emulated,
        }
    }

    fn native(&self) -> bool {
        self.backend.load(Ordering::Relaxed) == BACKEND_NATIVE
    }
}

impl Default for WaitService {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressWait for WaitService {
    fn wait<W: WaitWord>(
        &self,
        word: &W,
        expected: W::Value,
        timeout: Option<Duration>,
    ) -> WaitOutcome {
        if W::SIZE == 4 && self.native() {
            // Truncation is exact: SIZE == 4 means the value is a u32.
            return native::wait32(word.address(), W::widen(expected) as u32, timeout);
        }
        self.table.wait(word, expected, timeout)
    }

    fn wake_one(&self, address: usize) {
        if self.native() {
            native::wake(address, 1);
        }
        self.table.wake_one(address);
    }

    fn wake_all(&self, address: usize) {
        if self.native() {
            native::wake(address, i32::MAX);
        }
        self.table.wake_all(address);
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
#[allow(unsafe_code)]
mod native {
    use std::time::Duration;

    use super::{MAX_WAIT_MS, WaitOutcome};
    use crate::errno;

    const FUTEX_WAIT_PRIVATE: libc::c_int = libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG;
    const FUTEX_WAKE_PRIVATE: libc::c_int = libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG;

    pub(super) fn wait32(address: usize, expected: u32, timeout: Option<Duration>) -> WaitOutcome {
        let timeout = timeout.map(|limit| {
            let limit = limit.min(Duration::from_millis(MAX_WAIT_MS));
            libc::timespec {
                tv_sec: limit.as_secs() as libc::time_t,
                tv_nsec: limit.subsec_nanos() as libc::c_long,
            }
        });
        let ts_ptr = timeout
            .as_ref()
            .map_or(std::ptr::null(), std::ptr::from_ref::<libc::timespec>);
        // SAFETY: the caller passes the address of a live 4-byte atomic.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_futex,
                address as *const u32,
                FUTEX_WAIT_PRIVATE,
                expected,
                ts_ptr,
            )
        };
        if rc == 0 {
            return WaitOutcome::Woken;
        }
        match errno::get() {
            errno::ETIMEDOUT => WaitOutcome::TimedOut,
            e if e == errno::EAGAIN || e == libc::EINTR => WaitOutcome::Woken,
            e => crate::runtime::fatal("futex", "futex_wait_failed", e),
        }
    }

    pub(super) fn wake(address: usize, count: i32) {
        // SAFETY: FUTEX_WAKE only uses the address as a key.
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                address as *const u32,
                FUTEX_WAKE_PRIVATE,
                count,
            );
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
mod native {
    use std::time::Duration;

    use super::WaitOutcome;

    pub(super) fn wait32(_address: usize, _expected: u32, _timeout: Option<Duration>) -> WaitOutcome {
        unreachable!("native address waits are never selected on this platform")
    }

    pub(super) fn wake(_address: usize, _count: i32) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::time::Instant;

    #[test]
    fn bucket_index_uses_address_bits_above_three() {
        assert_eq!(WaitTable::bucket_index(0), 0);
        assert_eq!(WaitTable::bucket_index(8), 1);
        assert_eq!(WaitTable::bucket_index(7), 0);
        assert_eq!(WaitTable::bucket_index(8 * WAIT_BUCKETS), 0);
    }

    #[test]
    fn mismatch_returns_without_sleeping() {
        let table = WaitTable::new();
        let word = AtomicU32::new(5);
        let start = Instant::now();
        let outcome = table.wait(&word, 4, Some(Duration::from_secs(10)));
        assert_eq!(outcome, WaitOutcome::Woken);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn matching_value_times_out() {
        let table = WaitTable::new();
        let word = AtomicU16::new(3);
        let outcome = table.wait(&word, 3, Some(Duration::from_millis(20)));
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[test]
    fn timed_wait_reports_timeout_as_false() {
        let table = WaitTable::new();
        let word = AtomicU8::new(1);
        assert!(!table.timed_wait(&word, 1, 5_000));
        assert!(table.timed_wait(&word, 0, 5_000));
    }

    #[test]
    fn wake_all_releases_every_waiter() {
        let table = Arc::new(WaitTable::new());
        let word = Arc::new(AtomicU64::new(0));
        let released = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let table = Arc::clone(&table);
            let word = Arc::clone(&word);
            let released = Arc::clone(&released);
            handles.push(std::thread::spawn(move || {
                while word.load(Ordering::Acquire) == 0 {
                    table.wait(&*word, 0, None);
                }
                released.fetch_add(1, Ordering::Relaxed);
            }));
        }
        std::thread::sleep(Duration::from_millis(20));
        word.store(1, Ordering::Release);
        table.wake_all(word.address());
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(released.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn service_defaults_to_emulated() {
        let service = WaitService::new();
        assert_eq!(service.backend(), WaitBackend::Emulated);
    }

    #[test]
    fn native_backend_round_trip() {
        let service = Arc::new(WaitService::new());
        let selected = service.select_backend(WaitBackend::Native);
        assert_eq!(WaitBackend::native_supported(), selected == WaitBackend::Native);

        let word = Arc::new(AtomicU32::new(0));
        let done = Arc::new(AtomicBool::new(false));
        let waiter = {
            let service = Arc::clone(&service);
            let word = Arc::clone(&word);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                while word.load(Ordering::Acquire) == 0 {
                    service.wait(&*word, 0, None);
                }
                done.store(true, Ordering::Release);
            })
        };
        std::thread::sleep(Duration::from_millis(10));
        word.store(1, Ordering::Release);
        service.wake_one(word.address());
        waiter.join().unwrap();
        assert!(done.load(Ordering::Acquire));
    }

    #[test]
    fn backend_names_parse_loosely() {
        assert_eq!(WaitBackend::from_str_loose("FUTEX"), Some(WaitBackend::Native));
        assert_eq!(WaitBackend::from_str_loose(""), Some(WaitBackend::Emulated));
        assert_eq!(WaitBackend::from_str_loose("spin"), None);
    }
}
