//! # frankenthread-core
//!
//! Portable threading runtime primitives built on a small set of native
//! services: address waits (futex emulation), static and dynamic mutexes,
//! counting semaphores, thread-local slots with exit destructors,
//! cooperative cancellation, selectable clock sources and one-shot or
//! periodic timers.
//!
//! Every service hangs off a [`Runtime`]. Most callers use the process-wide
//! instance through [`Runtime::global`]; tests build private instances with
//! [`Runtime::new`].

#![deny(unsafe_code)]

pub mod config;
#[allow(unsafe_code)]
pub mod errno;
pub mod error;
pub mod pthread;
pub mod runtime;
pub mod time;
pub mod trace;

pub use config::RuntimeConfig;
pub use error::{Error, Result};
pub use pthread::cancel::{
    CleanupHandler, restore_cancel, save_cancel, test_cancel, with_cleanup,
};
pub use pthread::futex::{AddressWait, WaitBackend, WaitOutcome, WaitService, WaitTable};
pub use pthread::mutex::{DynamicMutex, Mutex, MutexGuard, StaticMutex, StaticMutexRegistry};
pub use pthread::sem::Semaphore;
pub use pthread::thread::{Thread, ThreadRef, spawn, spawn_detached};
pub use pthread::tls::{ThreadLocal, ThreadLocalRegistry};
pub use runtime::{Runtime, available_cpus};
pub use time::timer::Timer;
pub use time::{CLOCK_FREQ, ClockService, ClockSource, Tick, now, sleep_for, sleep_until};
