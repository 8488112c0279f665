//! Threads and the synchronisation primitives built on address waits.
//!
//! Layering, bottom up: [`futex`] provides sleep/wake on atomic words;
//! [`cancel`] registers those words so a cancel request can disturb a
//! sleeper; [`mutex`], [`sem`] and [`thread`] (join) block through both.
//! [`tls`] shares the static mutex registry lock for its slot table.

#[allow(unsafe_code)]
pub mod cancel;
pub mod futex;
pub mod mutex;
pub mod sem;
pub mod thread;
pub mod tls;

pub use cancel::{
    CleanupHandler, cleanup_pop, cleanup_push, is_cancel_requested, restore_cancel, save_cancel,
    test_cancel, with_cleanup,
};
pub use futex::{AddressWait, MAX_WAIT_MS, WAIT_BUCKETS, WaitBackend, WaitOutcome, WaitTable};
pub use mutex::{DynamicMutex, Mutex, StaticMutex, StaticMutexRegistry};
pub use sem::{SEM_VALUE_MAX, Semaphore};
pub use thread::{Thread, ThreadRef, current, spawn, spawn_detached, thread_id};
pub use tls::{TLS_DESTRUCTOR_ITERATIONS, TLS_SLOTS_MAX, ThreadLocal, ThreadLocalRegistry};
