use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use frankenthread_core::pthread::cancel::is_cancel_requested;
use frankenthread_core::{
    CLOCK_FREQ, Runtime, Semaphore, Tick, restore_cancel, save_cancel, sleep_for, sleep_until,
    spawn, test_cancel, with_cleanup,
};
use parking_lot::Mutex;

fn settle() {
    std::thread::sleep(Duration::from_millis(40));
}

#[test]
fn cancel_runs_cleanup_lifo_before_join_returns() {
    static ORDER: Mutex<Vec<usize>> = Mutex::new(Vec::new());
    static GATE: Semaphore = Semaphore::new(0);
    fn record(tag: usize) {
        ORDER.lock().push(tag);
    }

    let thread = spawn(
        || {
            with_cleanup(record, 1, || {
                with_cleanup(record, 2, || {
                    GATE.wait();
                })
            });
            99
        },
        0,
    )
    .expect("spawn");
    settle();
    thread.cancel();
    assert_eq!(thread.join(), None);
    assert_eq!(*ORDER.lock(), vec![2, 1]);
}

#[test]
fn cancel_interrupts_long_sleep() {
    let thread = spawn(
        || {
            sleep_for(60 * CLOCK_FREQ);
            1
        },
        0,
    )
    .expect("spawn");
    settle();
    let start = std::time::Instant::now();
    thread.cancel();
    assert_eq!(thread.join(), None);
    assert!(start.elapsed() < Duration::from_secs(10));
}

#[test]
fn cancel_interrupts_sleep_until_max_deadline() {
    let thread = spawn(
        || {
            sleep_until(Tick::MAX);
            sleep_for(Tick::MAX);
            1
        },
        0,
    )
    .expect("spawn");
    settle();
    let start = std::time::Instant::now();
    thread.cancel();
    assert_eq!(thread.join(), None);
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn cancel_wakes_sleeper_on_private_runtime() {
    static PRIVATE: Runtime = Runtime::new();
    let thread = spawn(
        || {
            PRIVATE.sleep_until(PRIVATE.now() + 3 * CLOCK_FREQ);
            1
        },
        0,
    )
    .expect("spawn");
    settle();
    let start = std::time::Instant::now();
    thread.cancel();
    assert_eq!(thread.join(), None);
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn cancel_interrupts_join() {
    static NEVER: Semaphore = Semaphore::new(0);
    let sleeper = spawn(
        || {
            NEVER.wait();
            0
        },
        0,
    )
    .expect("spawn");
    let sleeper_ref = sleeper.reference();
    let joiner = spawn(move || sleeper.join().unwrap_or(7), 0).expect("spawn");
    settle();
    joiner.cancel();
    assert_eq!(joiner.join(), None);
    sleeper_ref.cancel();
    for _ in 0..500 {
        if sleeper_ref.is_finished() {
            break;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(sleeper_ref.is_finished());
}

#[test]
fn non_killable_section_defers_cancellation() {
    let reached_end = Arc::new(AtomicBool::new(false));
    let started = Arc::new(Semaphore::new(0));
    let proceed = Arc::new(Semaphore::new(0));
    let thread = {
        let reached_end = Arc::clone(&reached_end);
        let started = Arc::clone(&started);
        let proceed = Arc::clone(&proceed);
        spawn(
            move || {
                let state = save_cancel();
                assert!(state);
                started.post();
                // Not a cancellation point while disabled.
                proceed.wait();
                test_cancel();
                assert!(is_cancel_requested());
                reached_end.store(true, Ordering::SeqCst);
                restore_cancel(state);
                test_cancel();
                5
            },
            0,
        )
        .expect("spawn")
    };
    started.wait();
    thread.cancel();
    proceed.post();
    assert_eq!(thread.join(), None);
    assert!(reached_end.load(Ordering::SeqCst));
}

#[test]
fn save_restore_round_trip_keeps_state() {
    let thread = spawn(
        || {
            let outer = save_cancel();
            let inner = save_cancel();
            assert!(!inner);
            restore_cancel(inner);
            restore_cancel(outer);
            let again = save_cancel();
            restore_cancel(again);
            usize::from(outer) + usize::from(again)
        },
        0,
    )
    .expect("spawn");
    assert_eq!(thread.join(), Some(2));
}

#[test]
fn cleanup_does_not_run_without_cancel() {
    static RAN: AtomicUsize = AtomicUsize::new(0);
    fn bump(_: usize) {
        RAN.fetch_add(1, Ordering::SeqCst);
    }
    let thread = spawn(|| with_cleanup(bump, 0, || 3), 0).expect("spawn");
    assert_eq!(thread.join(), Some(3));
    assert_eq!(RAN.load(Ordering::SeqCst), 0);
}

#[test]
fn cancel_after_exit_is_harmless() {
    let thread = spawn(|| 4, 0).expect("spawn");
    let reference = thread.reference();
    assert_eq!(thread.join(), Some(4));
    reference.cancel();
    assert!(reference.is_finished());
}

#[test]
fn semaphore_count_survives_cancelled_waiter() {
    static SEM: Semaphore = Semaphore::new(0);
    let victim = spawn(
        || {
            SEM.wait();
            0
        },
        0,
    )
    .expect("spawn");
    settle();
    victim.cancel();
    assert_eq!(victim.join(), None);
    SEM.post();
    assert_eq!(SEM.value(), 1);
    assert!(SEM.try_wait());
}
