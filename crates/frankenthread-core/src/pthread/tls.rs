//! Thread-local slots with exit destructors.
//!
//! Two layers:
//!
//! - An index allocator standing in for the OS: it hands out up to
//!   [`TLS_SLOTS_MAX`] indices, each with a generation (`seq`) bumped on
//!   every allocation and release. Per-thread values are tagged with the
//!   generation they were written under, so a freshly created slot reads 0 on
//!   every thread even when its index is being reused.
//! - The slot table, guarded by the [`StaticMutexRegistry`] lock, which
//!   remembers each live slot's destructor for thread exit.
//!
//! `get` and `set` never take a lock and leave the caller's `errno` alone.

use std::cell::RefCell;

use parking_lot::Mutex;

use crate::errno::ErrnoGuard;
use crate::error::{Error, Result};
use crate::pthread::mutex::StaticMutexRegistry;
use crate::runtime::Runtime;
use crate::trace::{self, LogLevel};

/// Maximum number of live thread-local slots.
pub const TLS_SLOTS_MAX: usize = 1024;

/// Maximum destructor passes at thread exit.
pub const TLS_DESTRUCTOR_ITERATIONS: usize = 4;

/// Handle to a thread-local slot. Holds one machine word per thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadLocal {
    index: u32,
    seq: u32,
}

thread_local! {
    /// `(seq, value)` per slot index for the calling thread.
    static VALUES: RefCell<Vec<(u32, usize)>> = const { RefCell::new(Vec::new()) };
}

impl ThreadLocal {
    /// The calling thread's value, 0 if never set.
    #[must_use]
    pub fn get(self) -> usize {
        let _errno = ErrnoGuard::new();
        VALUES
            .try_with(|values| {
                values
                    .borrow()
                    .get(self.index as usize)
                    .filter(|(seq, _)| *seq == self.seq)
                    .map_or(0, |&(_, value)| value)
            })
            .unwrap_or(0)
    }

    /// Store `value` for the calling thread.
    ///
    /// Fails only once the thread's local storage is being torn down.
    pub fn set(self, value: usize) -> Result<()> {
        let _errno = ErrnoGuard::new();
        VALUES
            .try_with(|values| {
                let mut values = values.borrow_mut();
                let index = self.index as usize;
                if values.len() <= index {
                    values.resize(index + 1, (0, 0));
                }
                values[index] = (self.seq, value);
            })
            .map_err(|_| Error::InvalidSlot)
    }

    #[must_use]
    pub fn index(self) -> u32 {
        self.index
    }
}

struct IndexAllocator {
    seq: Vec<u32>,
    in_use: Vec<bool>,
}

impl IndexAllocator {
    const fn new() -> Self {
        Self {
            seq: Vec::new(),
            in_use: Vec::new(),
        }
    }

    fn allocate(&mut self) -> Option<ThreadLocal> {
        let index = match self.in_use.iter().position(|used| !used) {
            Some(free) => free,
            None if self.in_use.len() < TLS_SLOTS_MAX => {
                self.in_use.push(false);
                self.seq.push(0);
                self.in_use.len() - 1
            }
            None => return None,
        };
        self.in_use[index] = true;
        self.seq[index] = self.seq[index].wrapping_add(1).max(1);
        Some(ThreadLocal {
            index: index as u32,
            seq: self.seq[index],
        })
    }

    fn release(&mut self, slot: ThreadLocal) {
        let index = slot.index as usize;
        self.in_use[index] = false;
        self.seq[index] = self.seq[index].wrapping_add(1);
    }
}

/// Shared by every registry: per-thread values live in one `VALUES` vector
/// keyed by index, so two registries handing out the same index would alias
/// each other's values.
static INDEXES: Mutex<IndexAllocator> = Mutex::new(IndexAllocator::new());

#[derive(Clone, Copy)]
struct SlotEntry {
    seq: u32,
    destructor: Option<fn(usize)>,
}

/// Live slots by index. Guarded by the registry lock.
pub(crate) struct SlotTable {
    entries: Vec<Option<SlotEntry>>,
    live: usize,
}

impl SlotTable {
    pub(crate) const fn new() -> Self {
        Self {
            entries: Vec::new(),
            live: 0,
        }
    }

    fn insert(&mut self, slot: ThreadLocal, destructor: Option<fn(usize)>) {
        let index = slot.index as usize;
        if self.entries.len() <= index {
            self.entries.resize(index + 1, None);
        }
        debug_assert!(self.entries[index].is_none());
        self.entries[index] = Some(SlotEntry {
            seq: slot.seq,
            destructor,
        });
        self.live += 1;
    }

    fn remove(&mut self, slot: ThreadLocal) {
        let entry = self.entries.get_mut(slot.index as usize).and_then(Option::take);
        match entry {
            Some(entry) if entry.seq == slot.seq => self.live -= 1,
            _ => panic!("destroying a thread-local slot that is not live"),
        }
    }

    /// Next slot at or after `cursor` with a destructor and a non-zero
    /// value on the calling thread.
    fn next_pending(&self, cursor: &mut usize) -> Option<(ThreadLocal, fn(usize), usize)> {
        while *cursor < self.entries.len() {
            let index = *cursor;
            *cursor += 1;
            if let Some(entry) = self.entries[index]
                && let Some(destructor) = entry.destructor
            {
                let slot = ThreadLocal {
                    index: index as u32,
                    seq: entry.seq,
                };
                let value = slot.get();
                if value != 0 {
                    return Some((slot, destructor, value));
                }
            }
        }
        None
    }
}

/// Creates and destroys slots and runs their destructors at thread exit.
pub struct ThreadLocalRegistry<'r> {
    registry: &'r StaticMutexRegistry,
}

impl<'r> ThreadLocalRegistry<'r> {
    #[must_use]
    pub fn new(registry: &'r StaticMutexRegistry) -> Self {
        Self { registry }
    }

    /// Allocate a slot. `destructor`, if any, is called at thread exit with
    /// the thread's value when that value is non-zero.
    pub fn create(&self, destructor: Option<fn(usize)>) -> Result<ThreadLocal> {
        let Some(slot) = INDEXES.lock().allocate() else {
            trace::emit(
                LogLevel::Warn,
                "tls",
                "slots_exhausted",
                Some(serde_json::json!({ "max": TLS_SLOTS_MAX })),
            );
            return Err(Error::SlotsExhausted { max: TLS_SLOTS_MAX });
        };
        self.registry.slots().insert(slot, destructor);
        Ok(slot)
    }

    /// Release a slot. Destructors are not run.
    ///
    /// No thread may still be reading or writing it.
    pub fn destroy(&self, slot: ThreadLocal) {
        self.registry.slots().remove(slot);
        INDEXES.lock().release(slot);
    }

    /// Number of live slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registry.slots().live
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run destructors for the calling thread's non-zero values.
    ///
    /// Each value is cleared before its destructor runs, and the registry
    /// lock is dropped around the call so destructors may use the runtime.
    /// A destructor that stores a new value gets called again on the next
    /// pass, up to [`TLS_DESTRUCTOR_ITERATIONS`] passes.
    pub fn run_exit_destructors(&self) {
        for _ in 0..TLS_DESTRUCTOR_ITERATIONS {
            let mut ran = false;
            let mut cursor = 0;
            loop {
                let pending = self.registry.slots().next_pending(&mut cursor);
                let Some((slot, destructor, value)) = pending else {
                    break;
                };
                if slot.set(0).is_err() {
                    return;
                }
                destructor(value);
                ran = true;
            }
            if !ran {
                return;
            }
        }
    }
}

/// Create a slot in the process-wide registry.
pub fn create(destructor: Option<fn(usize)>) -> Result<ThreadLocal> {
    Runtime::global().thread_locals().create(destructor)
}

/// Destroy a slot created with [`create`].
pub fn destroy(slot: ThreadLocal) {
    Runtime::global().thread_locals().destroy(slot);
}
