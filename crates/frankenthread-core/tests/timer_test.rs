use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use frankenthread_core::{Semaphore, Timer, now};

fn counting_timer() -> (Timer, Arc<AtomicUsize>) {
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    let timer = Timer::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    })
    .expect("timer");
    (timer, fired)
}

#[test]
fn rearming_replaces_the_pending_expiry() {
    let (timer, fired) = counting_timer();
    timer.arm(false, 50_000, 0);
    timer.arm(false, 200_000, 0);
    std::thread::sleep(Duration::from_millis(120));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    std::thread::sleep(Duration::from_millis(250));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn absolute_deadline_fires_after_it_passes() {
    let (timer, fired) = counting_timer();
    let deadline = now() + 40_000;
    timer.arm(true, deadline, 0);
    assert!(timer.is_armed());
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(now() >= deadline);
}

#[test]
fn callback_can_release_a_waiting_thread() {
    let gate = Arc::new(Semaphore::new(0));
    let poster = Arc::clone(&gate);
    let timer = Timer::new(move || poster.post()).expect("timer");
    timer.arm(false, 10_000, 0);
    gate.wait();
    assert_eq!(gate.value(), 0);
}

#[test]
fn slow_callback_reports_overruns() {
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    let timer = Timer::new(move || {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            std::thread::sleep(Duration::from_millis(60));
        }
    })
    .expect("timer");
    timer.arm(false, 5_000, 10_000);
    std::thread::sleep(Duration::from_millis(150));
    let missed = timer.overrun();
    assert!(missed >= 3, "missed {missed} periods");
    assert_eq!(timer.overrun(), 0);
    timer.disarm();
    assert!(!timer.is_armed());
}

#[test]
fn panicking_callback_does_not_stop_the_queue() {
    let (survivor, fired) = counting_timer();
    let bomb = Timer::new(|| panic!("timer callback failure")).expect("timer");
    bomb.arm(false, 5_000, 0);
    survivor.arm(false, 30_000, 0);
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}
