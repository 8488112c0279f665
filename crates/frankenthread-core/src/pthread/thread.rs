//! Thread creation, join and per-thread records.
//!
//! Every thread started here gets a reference-counted [`ThreadRecord`]
//! shared between the thread itself, its [`Thread`] handle and any
//! [`ThreadRef`]s. The trampoline binds the record to the new thread, makes
//! it killable, runs the entry function, and on the way out unbinds the
//! record, runs thread-local destructors, publishes the result and wakes
//! joiners. A detached thread's record goes away with its last reference.

use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::pthread::cancel::{self, CancelScope, CancelState, Cancelled};
use crate::pthread::futex::{AddressWait, WaitWord};
use crate::runtime::Runtime;
use crate::trace::{self, LogLevel};

/// Exit word bit: the entry function has returned (or unwound) and the result
/// is published. Bit 0 is the cancellation arm bit.
const EXITED: u32 = 1 << 31;

/// State shared by a running thread and everyone holding a handle to it.
pub(crate) struct ThreadRecord {
    pub(crate) cancel: CancelState,
    exit: AtomicU32,
    result: Mutex<Option<usize>>,
    detached: bool,
    native: OnceLock<std::thread::Thread>,
    os_id: AtomicU64,
}

impl ThreadRecord {
    fn new(detached: bool) -> Self {
        Self {
            cancel: CancelState::new(),
            exit: AtomicU32::new(0),
            result: Mutex::new(None),
            detached,
            native: OnceLock::new(),
            os_id: AtomicU64::new(0),
        }
    }

    fn has_exited(&self) -> bool {
        self.exit.load(Ordering::Acquire) & EXITED != 0
    }
}

/// A shareable reference to a runtime thread, enough to cancel it.
#[derive(Clone)]
pub struct ThreadRef {
    record: Arc<ThreadRecord>,
}

impl ThreadRef {
    /// Request cancellation.
    ///
    /// The target acts on it at its next cancellation point while killable.
    /// Cancelling a thread that already exited has no effect.
    pub fn cancel(&self) {
        self.record.cancel.request();
        // Kick the target out of any park so it reaches a cancellation point.
        if let Some(native) = self.record.native.get() {
            native.unpark();
        }
        trace::emit(
            LogLevel::Debug,
            "thread",
            "cancel_requested",
            Some(serde_json::json!({ "target": self.os_id() })),
        );
    }

    /// OS thread id, once the thread has started.
    #[must_use]
    pub fn os_id(&self) -> Option<u64> {
        match self.record.os_id.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.record.has_exited()
    }

    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.record.detached
    }

    /// Change the scheduling priority (nice value) of a started thread.
    pub fn set_priority(&self, priority: i32) -> Result<()> {
        let Some(os_id) = self.os_id() else {
            return Err(Error::Priority {
                priority,
                errno: crate::errno::ESRCH,
            });
        };
        apply_priority(os_id, priority)
    }

    /// Whether both references name the same thread.
    #[must_use]
    pub fn same_thread(&self, other: &ThreadRef) -> bool {
        Arc::ptr_eq(&self.record, &other.record)
    }
}

impl std::fmt::Debug for ThreadRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadRef")
            .field("os_id", &self.os_id())
            .field("detached", &self.record.detached)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Owning handle to a joinable runtime thread.
///
/// Dropping it without joining lets the thread run to completion on its own.
#[derive(Debug)]
pub struct Thread {
    inner: ThreadRef,
    handle: Option<JoinHandle<()>>,
}

impl Thread {
    #[must_use]
    pub fn reference(&self) -> ThreadRef {
        self.inner.clone()
    }

    /// Wait for the thread to exit.
    ///
    /// Returns the entry function's result, or `None` when the thread was
    /// cancelled. A panic in the thread is propagated to the caller. Join is
    /// a cancellation point.
    pub fn join(mut self) -> Option<usize> {
        let record = &self.inner.record;
        if let Some(me) = cancel::current_record() {
            assert!(!Arc::ptr_eq(&me, record), "thread cannot join itself");
        }
        let waits = Runtime::global().waits();
        loop {
            cancel::test_cancel();
            let seen = cancel::arm(&record.exit);
            if seen & EXITED != 0 {
                break;
            }
            let _scope = CancelScope::enter(&record.exit, waits);
            waits.wait(&record.exit, seen, None);
        }
        if let Some(handle) = self.handle.take()
            && let Err(payload) = handle.join()
        {
            panic::resume_unwind(payload);
        }
        record.result.lock().take()
    }
}

impl Deref for Thread {
    type Target = ThreadRef;

    fn deref(&self) -> &ThreadRef {
        &self.inner
    }
}

/// Start a joinable thread running `entry`.
///
/// `priority` is a nice value applied by the new thread before `entry`
/// runs; 0 leaves the inherited priority alone.
pub fn spawn<F>(entry: F, priority: i32) -> Result<Thread>
where
    F: FnOnce() -> usize + Send + 'static,
{
    let (record, handle) = start(entry, false, priority)?;
    Ok(Thread {
        inner: ThreadRef { record },
        handle: Some(handle),
    })
}

/// Start a detached thread running `entry`.
///
/// The returned reference can cancel it but not join it.
pub fn spawn_detached<F>(entry: F, priority: i32) -> Result<ThreadRef>
where
    F: FnOnce() -> usize + Send + 'static,
{
    let (record, _handle) = start(entry, true, priority)?;
    Ok(ThreadRef { record })
}

fn start<F>(entry: F, detached: bool, priority: i32) -> Result<(Arc<ThreadRecord>, JoinHandle<()>)>
where
    F: FnOnce() -> usize + Send + 'static,
{
    let record = Arc::new(ThreadRecord::new(detached));
    let child = Arc::clone(&record);
    let handle = std::thread::Builder::new()
        .spawn(move || trampoline(child, entry, priority))
        .map_err(|err| {
            trace::emit(
                LogLevel::Error,
                "thread",
                "spawn_failed",
                Some(serde_json::json!({ "error": err.to_string(), "detached": detached })),
            );
            Error::ThreadSpawn(err)
        })?;
    Ok((record, handle))
}

fn trampoline<F>(record: Arc<ThreadRecord>, entry: F, priority: i32)
where
    F: FnOnce() -> usize,
{
    let os_id = thread_id();
    record.os_id.store(os_id, Ordering::Release);
    let _ = record.native.set(std::thread::current());
    if priority != 0
        && let Err(err) = apply_priority(os_id, priority)
    {
        trace::emit(
            LogLevel::Warn,
            "thread",
            "priority_not_applied",
            Some(serde_json::json!({ "priority": priority, "errno": err.errno() })),
        );
    }

    cancel::install(Arc::clone(&record));
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let value = entry();
        cancel::assert_cleanup_stack_empty();
        value
    }));
    cancel::uninstall();

    let runtime = Runtime::global();
    runtime.thread_locals().run_exit_destructors();

    let (result, panicked) = match outcome {
        Ok(value) => (Some(value), None),
        Err(payload) if payload.is::<Cancelled>() => (None, None),
        Err(payload) => (None, Some(payload)),
    };
    *record.result.lock() = result;
    record.exit.fetch_or(EXITED, Ordering::Release);
    runtime.waits().wake_all(record.exit.address());

    if let Some(payload) = panicked {
        panic::resume_unwind(payload);
    }
}

/// The calling thread, if it was started by this runtime.
#[must_use]
pub fn current() -> Option<ThreadRef> {
    cancel::current_record().map(|record| ThreadRef { record })
}

/// OS-level id of the calling thread.
#[cfg(any(target_os = "linux", target_os = "android"))]
#[allow(unsafe_code)]
#[must_use]
pub fn thread_id() -> u64 {
    // SAFETY: gettid has no preconditions.
    let tid = unsafe { libc::syscall(libc::SYS_gettid) };
    tid as u64
}

/// OS-level id of the calling thread.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
#[must_use]
pub fn thread_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static ID: u64 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    ID.with(|id| *id)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
#[allow(unsafe_code)]
fn apply_priority(os_id: u64, priority: i32) -> Result<()> {
    // SAFETY: plain syscall wrapper; an unknown id fails with ESRCH.
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, os_id as libc::id_t, priority) };
    if rc == 0 {
        Ok(())
    } else {
        Err(Error::Priority {
            priority,
            errno: crate::errno::get(),
        })
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn apply_priority(_os_id: u64, priority: i32) -> Result<()> {
    if priority == 0 {
        Ok(())
    } else {
        Err(Error::Priority {
            priority,
            errno: crate::errno::ENOSYS,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[test]
    fn join_returns_entry_result() {
        let thread = spawn(|| 42, 0).expect("spawn");
        assert_eq!(thread.join(), Some(42));
    }

    #[test]
    fn record_reports_os_id_and_exit() {
        let thread = spawn(|| 7, 0).expect("spawn");
        let reference = thread.reference();
        assert!(!reference.is_detached());
        assert_eq!(thread.join(), Some(7));
        assert!(reference.is_finished());
        assert!(reference.os_id().is_some());
    }

    #[test]
    fn current_is_bound_inside_runtime_threads() {
        assert!(current().is_none());
        let thread = spawn(|| usize::from(current().is_some()), 0).expect("spawn");
        assert_eq!(thread.join(), Some(1));
    }

    #[test]
    fn detached_thread_runs_to_completion() {
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        let reference = spawn_detached(
            move || {
                flag.store(true, Ordering::Release);
                0
            },
            0,
        )
        .expect("spawn");
        assert!(reference.is_detached());
        for _ in 0..500 {
            if reference.is_finished() {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(reference.is_finished());
        assert!(done.load(Ordering::Acquire));
    }

    #[test]
    fn panics_propagate_through_join() {
        let thread = spawn(|| panic!("entry failed"), 0).expect("spawn");
        let caught = panic::catch_unwind(AssertUnwindSafe(move || thread.join()));
        assert!(caught.is_err());
    }

    #[test]
    #[allow(unsafe_code)]
    #[should_panic(expected = "cleanup handlers still pushed")]
    fn returning_with_pushed_cleanup_is_fatal() {
        fn unused(_: usize) {}
        let thread = spawn(
            || {
                let handler: &'static cancel::CleanupHandler =
                    Box::leak(Box::new(cancel::CleanupHandler::new(unused, 0)));
                // SAFETY: the handler is leaked, so it never moves or dies.
                unsafe { cancel::cleanup_push(handler) };
                0
            },
            0,
        )
        .expect("spawn");
        let _ = thread.join();
    }

    #[test]
    #[allow(unsafe_code)]
    fn balanced_cleanup_returns_normally() {
        fn unused(_: usize) {}
        let thread = spawn(
            || {
                let handler = cancel::CleanupHandler::new(unused, 0);
                // SAFETY: popped below, before the handler goes out of scope.
                unsafe { cancel::cleanup_push(&handler) };
                cancel::cleanup_pop();
                5
            },
            0,
        )
        .expect("spawn");
        assert_eq!(thread.join(), Some(5));
    }

    #[test]
    fn set_priority_on_unstarted_reference_fails() {
        let reference = ThreadRef {
            record: Arc::new(ThreadRecord::new(false)),
        };
        let err = reference.set_priority(1).unwrap_err();
        assert_eq!(err.errno(), crate::errno::ESRCH);
    }
}
