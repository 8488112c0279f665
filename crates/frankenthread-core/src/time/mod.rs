//! Clocks, sleeping and timers.
//!
//! Time is measured in [`Tick`]s (microseconds). A [`ClockService`] reads one
//! of several [`ClockSource`]s; which one is decided once per process, at
//! runtime setup. Until then readings come from the performance counter and
//! the service remembers it was read early.

pub mod timer;

use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::pthread::cancel::CancelScope;
use crate::pthread::futex::{AddressWait, MAX_WAIT_MS};
use crate::runtime::Runtime;
use crate::trace::{self, LogLevel};

/// Monotonic time in microseconds. Only differences are meaningful except
/// for [`ClockSource::Wall`].
pub type Tick = i64;

/// Ticks per second.
pub const CLOCK_FREQ: Tick = 1_000_000;

/// Source selected when setup asks for "auto".
pub const DEFAULT_CLOCK_SOURCE: ClockSource = ClockSource::Multimedia;

#[must_use]
pub fn ticks_from_duration(duration: Duration) -> Tick {
    Tick::try_from(duration.as_micros()).unwrap_or(Tick::MAX)
}

/// Negative tick counts map to zero.
#[must_use]
pub fn duration_from_ticks(ticks: Tick) -> Duration {
    Duration::from_micros(ticks.max(0).unsigned_abs())
}

/// A native time base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClockSource {
    /// Fine-grained monotonic time that stops while suspended.
    Interrupt,
    /// Millisecond tick counter that keeps running through suspend.
    Tick,
    /// Millisecond-resolution monotonic timer.
    Multimedia,
    /// High-resolution performance counter.
    Perf,
    /// Wall-clock time since the Unix epoch. Not monotonic.
    Wall,
}

impl ClockSource {
    pub const ALL: [ClockSource; 5] = [
        Self::Interrupt,
        Self::Tick,
        Self::Multimedia,
        Self::Perf,
        Self::Wall,
    ];

    /// Configuration name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Interrupt => "interrupt",
            Self::Tick => "tick",
            Self::Multimedia => "multimedia",
            Self::Perf => "perf",
            Self::Wall => "wall",
        }
    }

    /// Human-readable description.
    #[must_use]
    pub const fn describe(self) -> &'static str {
        match self {
            Self::Interrupt => "Interrupt time",
            Self::Tick => "OS tick counter",
            Self::Multimedia => "Multimedia timers",
            Self::Perf => "Performance counters",
            Self::Wall => "System time (DANGEROUS!)",
        }
    }

    #[must_use]
    pub const fn is_monotonic(self) -> bool {
        !matches!(self, Self::Wall)
    }

    /// Every selectable value with its description, "auto" first as `""`.
    pub fn choices() -> impl Iterator<Item = (&'static str, &'static str)> {
        std::iter::once(("", "Auto"))
            .chain(Self::ALL.iter().map(|source| (source.name(), source.describe())))
    }

    /// Parse a configured name. `""` and `"auto"` mean "no preference".
    pub fn parse(name: &str) -> Result<Option<Self>> {
        let wanted = name.trim();
        if wanted.is_empty() || wanted.eq_ignore_ascii_case("auto") {
            return Ok(None);
        }
        Self::ALL
            .into_iter()
            .find(|source| source.name().eq_ignore_ascii_case(wanted))
            .map(Some)
            .ok_or_else(|| Error::InvalidClockSource(wanted.to_string()))
    }

    const fn to_raw(self) -> u8 {
        match self {
            Self::Interrupt => 1,
            Self::Tick => 2,
            Self::Multimedia => 3,
            Self::Perf => 4,
            Self::Wall => 5,
        }
    }

    const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Interrupt),
            2 => Some(Self::Tick),
            3 => Some(Self::Multimedia),
            4 => Some(Self::Perf),
            5 => Some(Self::Wall),
            _ => None,
        }
    }

    fn read(self, perf_epoch: Instant) -> Tick {
        match self {
            Self::Perf => ticks_from_duration(perf_epoch.elapsed()),
            Self::Wall => wall_ticks(),
            Self::Interrupt => native::interrupt(perf_epoch),
            Self::Tick => truncate_ms(native::tick(perf_epoch)),
            Self::Multimedia => truncate_ms(native::interrupt(perf_epoch)),
        }
    }
}

impl std::fmt::Display for ClockSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn truncate_ms(ticks: Tick) -> Tick {
    ticks - ticks.rem_euclid(1000)
}

fn wall_ticks() -> Tick {
    match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        Ok(since) => ticks_from_duration(since),
        Err(before) => -ticks_from_duration(before.duration()),
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
mod native {
    use std::time::Instant;

    use super::{CLOCK_FREQ, Tick};
    use crate::errno;

    fn read(clock: libc::clockid_t) -> Tick {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: ts is a valid, writable timespec.
        let rc = unsafe { libc::clock_gettime(clock, &mut ts) };
        if rc != 0 {
            crate::runtime::fatal("clock", "clock_gettime_failed", errno::get());
        }
        ts.tv_sec as Tick * CLOCK_FREQ + ts.tv_nsec as Tick / 1000
    }

    pub(super) fn interrupt(_epoch: Instant) -> Tick {
        read(libc::CLOCK_MONOTONIC)
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub(super) fn tick(_epoch: Instant) -> Tick {
        read(libc::CLOCK_BOOTTIME)
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    pub(super) fn tick(_epoch: Instant) -> Tick {
        read(libc::CLOCK_MONOTONIC)
    }
}

#[cfg(not(unix))]
mod native {
    use std::time::Instant;

    use super::{Tick, ticks_from_duration};

    pub(super) fn interrupt(epoch: Instant) -> Tick {
        ticks_from_duration(epoch.elapsed())
    }

    pub(super) fn tick(epoch: Instant) -> Tick {
        ticks_from_duration(epoch.elapsed())
    }
}

/// Reads the selected clock source.
pub struct ClockService {
    /// Raw [`ClockSource`], 0 while unselected.
    selected: AtomicU8,
    used_early: AtomicBool,
    select_lock: Mutex<()>,
    epoch: OnceLock<Instant>,
}

impl ClockService {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            selected: AtomicU8::new(0),
            used_early: AtomicBool::new(false),
            select_lock: Mutex::new(()),
            epoch: OnceLock::new(),
        }
    }

    fn epoch(&self) -> Instant {
        *self.epoch.get_or_init(Instant::now)
    }

    /// Current time on the selected source.
    #[must_use]
    pub fn now(&self) -> Tick {
        match ClockSource::from_raw(self.selected.load(Ordering::Acquire)) {
            Some(source) => source.read(self.epoch()),
            None => self.now_default(),
        }
    }

    fn now_default(&self) -> Tick {
        let _select = self.select_lock.lock();
        if let Some(source) = ClockSource::from_raw(self.selected.load(Ordering::Relaxed)) {
            return source.read(self.epoch());
        }
        self.used_early.store(true, Ordering::Relaxed);
        ClockSource::Perf.read(self.epoch())
    }

    /// The selected source, if selection happened.
    #[must_use]
    pub fn active(&self) -> Option<ClockSource> {
        ClockSource::from_raw(self.selected.load(Ordering::Acquire))
    }

    /// Whether the clock was read before a source was selected.
    #[must_use]
    pub fn used_early(&self) -> bool {
        self.used_early.load(Ordering::Relaxed)
    }

    /// Select the time base. `None` picks [`DEFAULT_CLOCK_SOURCE`].
    ///
    /// Only the first call has an effect; later calls return the source
    /// already in use. If the clock was read before selection, the
    /// performance counter stays in use so earlier readings remain
    /// comparable, and a warning is logged.
    pub fn select(&self, requested: Option<ClockSource>) -> ClockSource {
        let _select = self.select_lock.lock();
        if let Some(current) = ClockSource::from_raw(self.selected.load(Ordering::Relaxed)) {
            return current;
        }
        let wanted = requested.unwrap_or(DEFAULT_CLOCK_SOURCE);
        let chosen = if self.used_early.load(Ordering::Relaxed) && wanted != ClockSource::Perf {
            trace::emit(
                LogLevel::Warn,
                "clock",
                "clock_read_before_selection",
                Some(serde_json::json!({ "requested": wanted.name(), "active": "perf" })),
            );
            ClockSource::Perf
        } else {
            wanted
        };
        self.selected.store(chosen.to_raw(), Ordering::Release);
        trace::emit(
            LogLevel::Debug,
            "clock",
            "clock_source_selected",
            Some(serde_json::json!({ "source": chosen.name(), "description": chosen.describe() })),
        );
        chosen
    }

    /// Select by configured name.
    pub fn select_by_name(&self, name: &str) -> Result<ClockSource> {
        Ok(self.select(ClockSource::parse(name)?))
    }
}

impl Default for ClockService {
    fn default() -> Self {
        Self::new()
    }
}

const SLEEP_ARMED: u32 = 1;

/// Sleep until `clock` reaches `deadline`, waiting through `waits`.
///
/// Cancellation point on entry and after every wakeup. Each native wait is
/// capped at [`MAX_WAIT_MS`].
pub fn sleep_until_on<W: AddressWait>(clock: &ClockService, waits: &W, deadline: Tick) {
    let word = AtomicU32::new(SLEEP_ARMED);
    let _scope = CancelScope::enter(&word, waits);
    loop {
        let remaining = deadline.saturating_sub(clock.now());
        if remaining <= 0 {
            return;
        }
        let delay = duration_from_ticks(remaining).min(Duration::from_millis(MAX_WAIT_MS));
        waits.wait(&word, SLEEP_ARMED, Some(delay));
        crate::pthread::cancel::test_cancel();
    }
}

/// Current time on the process-wide clock.
#[must_use]
pub fn now() -> Tick {
    Runtime::global().clock().now()
}

/// Sleep until the process-wide clock reaches `deadline`.
pub fn sleep_until(deadline: Tick) {
    let runtime = Runtime::global();
    sleep_until_on(runtime.clock(), runtime.waits(), deadline);
}

/// Sleep for `delay` ticks.
pub fn sleep_for(delay: Tick) {
    sleep_until(now().saturating_add(delay));
}
