//! Mutexes.
//!
//! Two flavours share one API:
//!
//! - [`DynamicMutex`]: wraps a native fast lock (`parking_lot`'s raw mutex),
//!   optionally recursive. Created at runtime.
//! - [`StaticMutex`]: a `const`-constructible `{locked, contention}` pair that
//!   needs no initialisation call. All static mutexes park on the single
//!   process-wide [`StaticMutexRegistry`] lock and condition variable.
//!
//! [`Mutex`] picks one of the two at construction. None of these are
//! reentrant unless built with [`DynamicMutex::new_recursive`], and none of
//! them is a cancellation point.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use parking_lot::lock_api::RawMutex as _;
use parking_lot::{Condvar, Mutex as SuperLock, MutexGuard as SuperGuard};

use crate::pthread::cancel;
use crate::pthread::tls::SlotTable;
use crate::runtime::Runtime;

/// The process-wide "super" lock and condition variable.
///
/// Besides serialising every static mutex, the lock guards the thread-local
/// slot table.
pub struct StaticMutexRegistry {
    slots: SuperLock<SlotTable>,
    variable: Condvar,
}

impl StaticMutexRegistry {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: SuperLock::new(SlotTable::new()),
            variable: Condvar::new(),
        }
    }

    pub(crate) fn slots(&self) -> SuperGuard<'_, SlotTable> {
        self.slots.lock()
    }
}

impl Default for StaticMutexRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A mutex usable from a `static` without initialisation.
#[derive(Debug)]
pub struct StaticMutex {
    locked: AtomicBool,
    /// Threads parked on the registry variable for this mutex.
    contention: AtomicU32,
}

impl StaticMutex {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            contention: AtomicU32::new(0),
        }
    }

    pub fn lock(&self) {
        self.lock_in(Runtime::global().registry());
    }

    /// Lock against an explicit registry.
    ///
    /// Cancellation is disabled for the duration, so a cancelled thread never
    /// unwinds while it holds the registry lock.
    pub fn lock_in(&self, registry: &StaticMutexRegistry) {
        let state = cancel::save_cancel();
        {
            let mut slots = registry.slots.lock();
            while self.locked.load(Ordering::Relaxed) {
                self.contention.fetch_add(1, Ordering::Relaxed);
                registry.variable.wait(&mut slots);
                self.contention.fetch_sub(1, Ordering::Relaxed);
            }
            self.locked.store(true, Ordering::Relaxed);
        }
        cancel::restore_cancel(state);
    }

    #[must_use]
    pub fn try_lock(&self) -> bool {
        self.try_lock_in(Runtime::global().registry())
    }

    #[must_use]
    pub fn try_lock_in(&self, registry: &StaticMutexRegistry) -> bool {
        let _slots = registry.slots.lock();
        if self.locked.load(Ordering::Relaxed) {
            return false;
        }
        self.locked.store(true, Ordering::Relaxed);
        true
    }

    pub fn unlock(&self) {
        self.unlock_in(Runtime::global().registry());
    }

    pub fn unlock_in(&self, registry: &StaticMutexRegistry) {
        let _slots = registry.slots.lock();
        assert!(
            self.locked.load(Ordering::Relaxed),
            "unlock of an unlocked static mutex"
        );
        self.locked.store(false, Ordering::Relaxed);
        if self.contention.load(Ordering::Relaxed) > 0 {
            registry.variable.notify_all();
        }
    }

    /// Racy snapshot, for diagnostics only.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl Default for StaticMutex {
    fn default() -> Self {
        Self::new()
    }
}

const NO_OWNER: usize = 0;

/// Per-thread token identifying lock owners.
fn owner_token() -> usize {
    thread_local! {
        static TOKEN: u8 = const { 0 };
    }
    TOKEN.with(|token| std::ptr::from_ref(token) as usize)
}

/// A runtime-initialised mutex backed by the native fast lock.
pub struct DynamicMutex {
    raw: parking_lot::RawMutex,
    owner: AtomicUsize,
    /// Lock depth; only touched by the owner.
    depth: AtomicU32,
    recursive: bool,
}

impl DynamicMutex {
    #[must_use]
    pub fn new() -> Self {
        Self::with_recursion(false)
    }

    /// A mutex the owning thread may lock again; each lock needs an unlock.
    #[must_use]
    pub fn new_recursive() -> Self {
        Self::with_recursion(true)
    }

    fn with_recursion(recursive: bool) -> Self {
        Self {
            raw: parking_lot::RawMutex::INIT,
            owner: AtomicUsize::new(NO_OWNER),
            depth: AtomicU32::new(0),
            recursive,
        }
    }

    #[must_use]
    pub fn is_recursive(&self) -> bool {
        self.recursive
    }

    pub fn lock(&self) {
        let me = owner_token();
        if self.owner.load(Ordering::Relaxed) == me {
            assert!(self.recursive, "recursive lock of a non-recursive mutex");
            self.depth.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.raw.lock();
        self.take_ownership(me);
    }

    /// Non-blocking lock. A non-recursive mutex already held by the caller
    /// reports busy.
    #[must_use]
    pub fn try_lock(&self) -> bool {
        let me = owner_token();
        if self.owner.load(Ordering::Relaxed) == me {
            if !self.recursive {
                return false;
            }
            self.depth.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        if !self.raw.try_lock() {
            return false;
        }
        self.take_ownership(me);
        true
    }

    pub fn unlock(&self) {
        assert_eq!(
            self.owner.load(Ordering::Relaxed),
            owner_token(),
            "mutex unlocked by a thread that does not hold it"
        );
        if self.depth.fetch_sub(1, Ordering::Relaxed) > 1 {
            return;
        }
        self.owner.store(NO_OWNER, Ordering::Relaxed);
        // SAFETY: ownership by the calling thread was checked above.
        #[allow(unsafe_code)]
        unsafe {
            self.raw.unlock();
        }
    }

    fn take_ownership(&self, me: usize) {
        self.owner.store(me, Ordering::Relaxed);
        self.depth.store(1, Ordering::Relaxed);
    }
}

impl Default for DynamicMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DynamicMutex {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            assert_eq!(*self.owner.get_mut(), NO_OWNER, "mutex destroyed while locked");
        }
    }
}

impl std::fmt::Debug for DynamicMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicMutex")
            .field("locked", &(self.owner.load(Ordering::Relaxed) != NO_OWNER))
            .field("recursive", &self.recursive)
            .finish()
    }
}

/// A mutex in either initialisation mode.
#[derive(Debug)]
pub enum Mutex {
    Dynamic(DynamicMutex),
    Static(StaticMutex),
}

impl Mutex {
    #[must_use]
    pub fn new() -> Self {
        Self::Dynamic(DynamicMutex::new())
    }

    #[must_use]
    pub fn new_recursive() -> Self {
        Self::Dynamic(DynamicMutex::new_recursive())
    }

    /// Statically initialised form, usable in a `static`.
    #[must_use]
    pub const fn new_static() -> Self {
        Self::Static(StaticMutex::new())
    }

    pub fn lock(&self) {
        match self {
            Self::Dynamic(mutex) => mutex.lock(),
            Self::Static(mutex) => mutex.lock(),
        }
    }

    /// Non-blocking lock; `false` means busy.
    #[must_use]
    pub fn try_lock(&self) -> bool {
        match self {
            Self::Dynamic(mutex) => mutex.try_lock(),
            Self::Static(mutex) => mutex.try_lock(),
        }
    }

    pub fn unlock(&self) {
        match self {
            Self::Dynamic(mutex) => mutex.unlock(),
            Self::Static(mutex) => mutex.unlock(),
        }
    }

    /// Lock and unlock again when the guard drops, including on unwind.
    pub fn guard(&self) -> MutexGuard<'_> {
        self.lock();
        MutexGuard { mutex: self }
    }

    #[must_use]
    pub fn is_static(&self) -> bool {
        matches!(self, Self::Static(_))
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped lock on a [`Mutex`].
#[must_use = "the mutex unlocks as soon as the guard is dropped"]
pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}
