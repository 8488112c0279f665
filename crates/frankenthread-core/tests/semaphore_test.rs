use std::time::Duration;

use frankenthread_core::{Runtime, Semaphore, Thread, WaitBackend, spawn};

fn use_native_waits() {
    Runtime::global().waits().select_backend(WaitBackend::Native);
}

fn finishes_within(thread: &Thread, limit: Duration) -> bool {
    let deadline = std::time::Instant::now() + limit;
    while !thread.is_finished() {
        if std::time::Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    true
}

#[test]
fn cancelled_waiter_never_strands_a_post() {
    static SEM: Semaphore = Semaphore::new(0);
    use_native_waits();
    for round in 0..200 {
        let victim = spawn(
            || {
                SEM.wait();
                1
            },
            0,
        )
        .expect("spawn");
        let survivor = spawn(
            || {
                SEM.wait();
                2
            },
            0,
        )
        .expect("spawn");
        std::thread::sleep(Duration::from_millis(1));
        SEM.post();
        victim.cancel();
        if victim.join() == Some(1) {
            SEM.post();
        }
        assert!(
            finishes_within(&survivor, Duration::from_secs(2)),
            "survivor stranded in round {round} with value {}",
            SEM.value()
        );
        assert_eq!(survivor.join(), Some(2));
        assert_eq!(SEM.value(), 0);
    }
}

#[test]
fn one_post_releases_exactly_one_of_many_sleepers() {
    static SEM: Semaphore = Semaphore::new(0);
    use_native_waits();
    let sleepers: Vec<_> = (0..4)
        .map(|tag| {
            spawn(
                move || {
                    SEM.wait();
                    tag
                },
                0,
            )
            .expect("spawn")
        })
        .collect();
    std::thread::sleep(Duration::from_millis(30));
    SEM.post();
    std::thread::sleep(Duration::from_millis(50));
    let done = sleepers.iter().filter(|thread| thread.is_finished()).count();
    assert_eq!(done, 1);
    for _ in 0..3 {
        SEM.post();
    }
    for thread in sleepers {
        assert!(thread.join().is_some());
    }
    assert_eq!(SEM.value(), 0);
}
