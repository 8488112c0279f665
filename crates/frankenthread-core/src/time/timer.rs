//! One-shot and periodic timers.
//!
//! Each [`Runtime`] owns a timer queue with one lazily started worker thread.
//! Callbacks run on that thread, one at a time, with the queue lock released. Re-arming or
//! dropping a timer waits for an in-flight callback of that timer to finish,
//! unless called from the callback itself.

use std::collections::{BTreeMap, BTreeSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::runtime::Runtime;
use crate::time::{Tick, duration_from_ticks};
use crate::trace::{self, LogLevel};

type Callback = Box<dyn Fn() + Send + Sync>;

struct TimerShared {
    callback: Callback,
    overruns: AtomicU32,
}

struct Entry {
    timer: Arc<TimerShared>,
    interval: Option<Duration>,
}

struct QueueState {
    entries: BTreeMap<u64, Entry>,
    /// Deadline order; each key also appears in `entries`.
    due: BTreeSet<(Instant, u64)>,
    running: Option<u64>,
    worker: Option<ThreadId>,
}

pub(crate) struct TimerQueue {
    state: Mutex<QueueState>,
    /// Signals the worker that the earliest deadline changed.
    wakeup: Condvar,
    /// Signals disarmers that a callback finished.
    idle: Condvar,
    next_id: AtomicU64,
}

/// Stand-in deadline for delays past what `Instant` can represent.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn deadline_after(base: Instant, delay: Duration) -> Instant {
    base.checked_add(delay).unwrap_or_else(|| base + FAR_FUTURE)
}

impl TimerQueue {
    pub(crate) const fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                entries: BTreeMap::new(),
                due: BTreeSet::new(),
                running: None,
                worker: None,
            }),
            wakeup: Condvar::new(),
            idle: Condvar::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn ensure_worker(&'static self) -> Result<()> {
        let mut state = self.state.lock();
        if state.worker.is_some() {
            return Ok(());
        }
        let handle = std::thread::Builder::new()
            .name("frankenthread-timer".into())
            .spawn(move || self.run())
            .map_err(|err| {
                trace::emit(
                    LogLevel::Error,
                    "timer",
                    "worker_spawn_failed",
                    Some(serde_json::json!({ "error": err.to_string() })),
                );
                Error::TimerQueue(err)
            })?;
        state.worker = Some(handle.thread().id());
        trace::emit(LogLevel::Debug, "timer", "worker_started", None);
        Ok(())
    }

    fn schedule(&self, timer: Arc<TimerShared>, delay: Duration, interval: Option<Duration>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline = deadline_after(Instant::now(), delay);
        let mut state = self.state.lock();
        let earliest = state.due.first().is_none_or(|&(first, _)| deadline < first);
        state.entries.insert(id, Entry { timer, interval });
        state.due.insert((deadline, id));
        if earliest {
            self.wakeup.notify_one();
        }
        id
    }

    fn cancel(&self, id: u64) {
        let mut state = self.state.lock();
        if state.entries.remove(&id).is_some() {
            state.due.retain(|&(_, key)| key != id);
        }
        let on_worker = state.worker == Some(std::thread::current().id());
        while state.running == Some(id) && !on_worker {
            self.idle.wait(&mut state);
        }
    }

    fn run(&self) {
        let mut state = self.state.lock();
        loop {
            let Some(&(deadline, id)) = state.due.first() else {
                self.wakeup.wait(&mut state);
                continue;
            };
            let now = Instant::now();
            if deadline > now {
                self.wakeup.wait_until(&mut state, deadline);
                continue;
            }
            state.due.remove(&(deadline, id));
            let Some(entry) = state.entries.get(&id) else {
                continue;
            };
            let timer = Arc::clone(&entry.timer);
            match entry.interval {
                Some(interval) => {
                    let (next, missed) = next_deadline(deadline, interval, now);
                    if missed > 0 {
                        timer.overruns.fetch_add(missed, Ordering::Relaxed);
                    }
                    state.due.insert((next, id));
                }
                None => {
                    state.entries.remove(&id);
                }
            }
            state.running = Some(id);
            let outcome = MutexGuard::unlocked(&mut state, || {
                panic::catch_unwind(AssertUnwindSafe(|| (timer.callback)()))
            });
            if outcome.is_err() {
                trace::emit(
                    LogLevel::Error,
                    "timer",
                    "callback_panicked",
                    Some(serde_json::json!({ "timer": id })),
                );
            }
            state.running = None;
            self.idle.notify_all();
        }
    }
}

/// First periodic deadline after `now`, and how many were skipped.
fn next_deadline(fired: Instant, interval: Duration, now: Instant) -> (Instant, u32) {
    if interval.is_zero() {
        return (now, 0);
    }
    let mut next = deadline_after(fired, interval);
    let mut missed = 0u32;
    while next <= now {
        next = deadline_after(next, interval);
        missed = missed.saturating_add(1);
    }
    (next, missed)
}

/// A timer that runs its callback on the shared timer thread.
///
/// Dropping the timer disarms it.
pub struct Timer {
    runtime: &'static Runtime,
    shared: Arc<TimerShared>,
    armed: Mutex<Option<u64>>,
}

impl Timer {
    /// Create a disarmed timer on the process-wide runtime. Starts the timer
    /// thread on first use.
    pub fn new<F>(callback: F) -> Result<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self::new_in(Runtime::global(), callback)
    }

    /// Create a disarmed timer served by `runtime`'s queue and clock.
    pub fn new_in<F>(runtime: &'static Runtime, callback: F) -> Result<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        runtime.timers().ensure_worker()?;
        Ok(Self {
            runtime,
            shared: Arc::new(TimerShared {
                callback: Box::new(callback),
                overruns: AtomicU32::new(0),
            }),
            armed: Mutex::new(None),
        })
    }

    /// Arm or disarm the timer.
    ///
    /// Any previous schedule is cancelled first. `value == 0` leaves the
    /// timer disarmed. With `absolute`, `value` is a deadline on the
    /// runtime's clock (past deadlines fire immediately); otherwise it is a
    /// delay. A positive `interval` makes the timer periodic.
    ///
    /// A callback must not re-arm its own timer while another thread is
    /// re-arming or dropping it.
    pub fn arm(&self, absolute: bool, value: Tick, interval: Tick) {
        let mut armed = self.armed.lock();
        let queue = self.runtime.timers();
        if let Some(id) = armed.take() {
            queue.cancel(id);
        }
        self.shared.overruns.store(0, Ordering::Relaxed);
        if value == 0 {
            return;
        }
        let delay = if absolute {
            value.saturating_sub(self.runtime.clock().now())
        } else {
            value
        };
        let interval = (interval > 0).then(|| duration_from_ticks(interval));
        *armed = Some(queue.schedule(
            Arc::clone(&self.shared),
            duration_from_ticks(delay),
            interval,
        ));
    }

    /// Cancel any pending expiry.
    pub fn disarm(&self) {
        self.arm(false, 0, 0);
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        let armed = *self.armed.lock();
        armed.is_some_and(|id| self.runtime.timers().state.lock().entries.contains_key(&id))
    }

    /// Periodic expirations skipped because the callback ran late, since the
    /// previous call or the last arm.
    #[must_use]
    pub fn overrun(&self) -> u32 {
        self.shared.overruns.swap(0, Ordering::Relaxed)
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(id) = self.armed.get_mut().take() {
            self.runtime.timers().cancel(id);
        }
    }
}
