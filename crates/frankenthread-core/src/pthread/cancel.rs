//! Cooperative, point-based thread cancellation.
//!
//! A cancel request only sets a flag on the target's record. The target
//! notices it at the next cancellation point ([`test_cancel`], or any
//! blocking runtime call built on it) while it is killable, runs its cleanup
//! handlers from the most recently pushed down, and unwinds out of its entry
//! function. The thread's join then reports no result.
//!
//! Blocking points register the word they sleep on for the duration of the wait.
//! Those words keep bit 0 set while a waiter is armed; a cancel clears the bit
//! and wakes the address, so the waiter can never sleep through the request.
//!
//! Threads not started by this runtime have no cancellation state: every
//! function here is a no-op for them.

use std::cell::{Cell, RefCell};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::pthread::futex::{AddressWait, WaitWord};
use crate::pthread::thread::ThreadRecord;
use crate::trace::{self, LogLevel};

/// Unwind payload of a cancelled thread.
#[derive(Debug)]
pub(crate) struct Cancelled;

/// A blocked thread's wait word and the service it sleeps on.
#[derive(Clone, Copy)]
struct WaitTarget {
    address: usize,
    waits: *const (),
    wake_all: unsafe fn(*const (), usize),
}

// SAFETY: both pointers are only followed under the `CancelState` lock while
// the registering CancelScope, which borrows the word and the service, lives.
unsafe impl Send for WaitTarget {}

impl WaitTarget {
    fn new<W: AddressWait>(word: &AtomicU32, waits: &W) -> Self {
        Self {
            address: word.address(),
            waits: ptr::from_ref(waits).cast(),
            wake_all: wake_all_on::<W>,
        }
    }
}

/// # Safety
///
/// `waits` must point to a live `W`.
unsafe fn wake_all_on<W: AddressWait>(waits: *const (), address: usize) {
    // SAFETY: guaranteed by the caller.
    let waits = unsafe { &*waits.cast::<W>() };
    waits.wake_all(address);
}

/// Cross-thread half of a thread's cancellation state.
pub(crate) struct CancelState {
    killed: AtomicBool,
    /// What the thread is blocked on, if anything.
    wait_target: Mutex<Option<WaitTarget>>,
}

impl CancelState {
    pub(crate) const fn new() -> Self {
        Self {
            killed: AtomicBool::new(false),
            wait_target: Mutex::new(None),
        }
    }

    pub(crate) fn is_requested(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    /// Flag the thread and disturb the wait it is blocked in, on whichever
    /// service it registered.
    pub(crate) fn request(&self) {
        self.killed.store(true, Ordering::Release);
        let target = self.wait_target.lock();
        if let Some(target) = *target {
            // SAFETY: a registered word and service stay alive until their
            // CancelScope clears the target, which takes this same lock.
            let word = unsafe { &*(target.address as *const AtomicU32) };
            word.fetch_and(!1, Ordering::Relaxed);
            // SAFETY: as above.
            unsafe { (target.wake_all)(target.waits, target.address) };
        }
    }

    fn set_wait_target(&self, target: WaitTarget) {
        let mut slot = self.wait_target.lock();
        assert!(slot.is_none(), "nested cancellation wait");
        *slot = Some(target);
    }

    fn clear_wait_target(&self, address: usize) {
        let mut slot = self.wait_target.lock();
        assert!(
            slot.is_some_and(|target| target.address == address),
            "cleared a wait address that was not registered"
        );
        *slot = None;
    }
}

/// A cleanup handler on the calling thread's cancellation stack.
///
/// Handlers are linked in place, so the node must stay put while pushed.
/// [`with_cleanup`] takes care of that; [`cleanup_push`] leaves it to the
/// caller.
pub struct CleanupHandler {
    routine: fn(usize),
    data: usize,
    next: Cell<*const CleanupHandler>,
}

impl CleanupHandler {
    #[must_use]
    pub const fn new(routine: fn(usize), data: usize) -> Self {
        Self {
            routine,
            data,
            next: Cell::new(ptr::null()),
        }
    }
}

/// Thread-owned half of the cancellation state.
struct LocalControl {
    record: Arc<ThreadRecord>,
    killable: Cell<bool>,
    cleaners: Cell<*const CleanupHandler>,
}

thread_local! {
    static CONTROL: RefCell<Option<LocalControl>> = const { RefCell::new(None) };
}

fn with_control<R>(f: impl FnOnce(&LocalControl) -> R) -> Option<R> {
    CONTROL
        .try_with(|control| control.borrow().as_ref().map(f))
        .ok()
        .flatten()
}

/// Bind `record` to the calling thread and make it killable.
pub(crate) fn install(record: Arc<ThreadRecord>) {
    CONTROL.with(|control| {
        *control.borrow_mut() = Some(LocalControl {
            record,
            killable: Cell::new(true),
            cleaners: Cell::new(ptr::null()),
        });
    });
}

/// Panic if the calling thread still has cleanup handlers pushed.
pub(crate) fn assert_cleanup_stack_empty() {
    with_control(|control| {
        assert!(
            control.cleaners.get().is_null(),
            "thread returned with cleanup handlers still pushed"
        );
    });
}

pub(crate) fn uninstall() {
    let _ = CONTROL.try_with(|control| control.borrow_mut().take());
}

pub(crate) fn current_record() -> Option<Arc<ThreadRecord>> {
    with_control(|control| Arc::clone(&control.record))
}

/// Disable cancellation, returning the previous killable state.
pub fn save_cancel() -> bool {
    with_control(|control| control.killable.replace(false)).unwrap_or(false)
}

/// Restore a state returned by [`save_cancel`].
///
/// Cancellation must currently be disabled.
pub fn restore_cancel(state: bool) {
    with_control(|control| {
        assert!(
            !control.killable.get(),
            "restore_cancel without a matching save_cancel"
        );
        control.killable.set(state);
    });
}

/// Whether a cancel request is pending against the calling thread.
#[must_use]
pub fn is_cancel_requested() -> bool {
    with_control(|control| control.record.cancel.is_requested()).unwrap_or(false)
}

/// Cancellation point.
///
/// If the calling thread is killable and has been cancelled, run its cleanup
/// handlers and unwind. Otherwise return immediately.
pub fn test_cancel() {
    let pending = with_control(|control| {
        if control.killable.get() && control.record.cancel.is_requested() {
            control.killable.set(false);
            Some(control.cleaners.get())
        } else {
            None
        }
    })
    .flatten();
    let Some(mut node) = pending else {
        return;
    };

    while !node.is_null() {
        // SAFETY: pushed handlers stay alive until popped.
        let handler = unsafe { &*node };
        (handler.routine)(handler.data);
        node = handler.next.get();
    }
    trace::emit(
        LogLevel::Debug,
        "cancel",
        "thread_cancelled",
        Some(serde_json::json!({ "thread": crate::pthread::thread::thread_id() })),
    );
    std::panic::resume_unwind(Box::new(Cancelled));
}

fn link(handler: &CleanupHandler) -> bool {
    with_control(|control| {
        handler.next.set(control.cleaners.get());
        control.cleaners.set(ptr::from_ref(handler));
    })
    .is_some()
}

/// Push `handler` on the calling thread's cleanup stack.
///
/// # Safety
///
/// `handler` must stay alive and must not move until [`cleanup_pop`] removes
/// it from this same thread.
pub unsafe fn cleanup_push(handler: &CleanupHandler) {
    link(handler);
}

/// Pop the most recently pushed handler without running it.
pub fn cleanup_pop() {
    with_control(|control| {
        let top = control.cleaners.get();
        assert!(!top.is_null(), "cleanup stack underflow");
        // SAFETY: top was pushed by this thread and is still alive.
        control.cleaners.set(unsafe { &*top }.next.get());
    });
}

struct PopOnDrop<'h> {
    handler: &'h CleanupHandler,
    linked: bool,
}

impl Drop for PopOnDrop<'_> {
    fn drop(&mut self) {
        if !self.linked {
            return;
        }
        with_control(|control| {
            let top = control.cleaners.get();
            if ptr::eq(top, self.handler) {
                control.cleaners.set(self.handler.next.get());
            } else if !std::thread::panicking() {
                panic!("cleanup handlers popped out of order");
            }
        });
    }
}

/// Run `body` with `routine(data)` registered as a cleanup handler.
///
/// The handler runs only if the thread is cancelled inside `body`; on every
/// other exit it is popped without running.
pub fn with_cleanup<R>(routine: fn(usize), data: usize, body: impl FnOnce() -> R) -> R {
    let handler = CleanupHandler::new(routine, data);
    let _scope = PopOnDrop {
        handler: &handler,
        linked: link(&handler),
    };
    body()
}

/// Set bit 0 of a wait word, returning the armed value.
pub(crate) fn arm(word: &AtomicU32) -> u32 {
    word.fetch_or(1, Ordering::AcqRel) | 1
}

/// Registration of an armed wait word, and the service the calling thread
/// sleeps on it through, as the thread's cancellation target for the
/// lifetime of the scope.
///
/// Entering is itself a cancellation point.
pub(crate) struct CancelScope<'w> {
    word: &'w AtomicU32,
    record: Option<Arc<ThreadRecord>>,
}

impl<'w> CancelScope<'w> {
    pub(crate) fn enter<W: AddressWait>(word: &'w AtomicU32, waits: &'w W) -> Self {
        let record = with_control(|control| {
            control
                .killable
                .get()
                .then(|| Arc::clone(&control.record))
        })
        .flatten();
        if let Some(record) = &record {
            record.cancel.set_wait_target(WaitTarget::new(word, waits));
        }
        let scope = Self { word, record };
        test_cancel();
        scope
    }
}

impl Drop for CancelScope<'_> {
    fn drop(&mut self) {
        if let Some(record) = &self.record {
            record.cancel.clear_wait_target(self.word.address());
        }
    }
}
