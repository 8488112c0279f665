use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use frankenthread_core::pthread::futex::WaitWord;
use frankenthread_core::{AddressWait, Runtime, WaitOutcome, WaitTable, spawn};

#[test]
fn mismatched_value_returns_immediately() {
    let waits = Runtime::global().waits();
    let word = AtomicU32::new(10);
    let start = Instant::now();
    assert_eq!(waits.wait(&word, 11, None), WaitOutcome::Woken);
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn wake_all_releases_waiters_on_the_same_word() {
    let word = Arc::new(AtomicU32::new(0));
    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let word = Arc::clone(&word);
            spawn(
                move || {
                    let waits = Runtime::global().waits();
                    while word.load(Ordering::Acquire) == 0 {
                        waits.wait(&*word, 0, None);
                    }
                    word.load(Ordering::Acquire) as usize
                },
                0,
            )
            .expect("spawn")
        })
        .collect();
    std::thread::sleep(Duration::from_millis(30));
    word.store(9, Ordering::Release);
    Runtime::global().waits().wake_all(word.address());
    for waiter in waiters {
        assert_eq!(waiter.join(), Some(9));
    }
}

#[test]
fn colliding_addresses_do_not_lose_wakes() {
    // Two words in the same bucket: waking one must not strand the other.
    let table = Arc::new(WaitTable::new());
    let words: Arc<[AtomicU64; 5]> = Arc::new(std::array::from_fn(|_| AtomicU64::new(0)));
    let first = 0;
    let last = words
        .iter()
        .rposition(|w| {
            WaitTable::bucket_index(w.address()) == WaitTable::bucket_index(words[0].address())
        })
        .unwrap_or(0);

    let waiter = {
        let table = Arc::clone(&table);
        let words = Arc::clone(&words);
        std::thread::spawn(move || {
            while words[first].load(Ordering::Acquire) == 0 {
                table.wait(&words[first], 0, Some(Duration::from_secs(5)));
            }
        })
    };
    std::thread::sleep(Duration::from_millis(20));
    words[last].store(1, Ordering::Release);
    table.wake_one(words[last].address());
    words[first].store(1, Ordering::Release);
    table.wake_one(words[first].address());
    waiter.join().unwrap();
}

#[test]
fn timed_wait_times_out_on_unchanged_word() {
    let word = AtomicU32::new(2);
    let start = Instant::now();
    let outcome = Runtime::global()
        .waits()
        .wait(&word, 2, Some(Duration::from_millis(25)));
    assert_eq!(outcome, WaitOutcome::TimedOut);
    assert!(start.elapsed() >= Duration::from_millis(20));
}
