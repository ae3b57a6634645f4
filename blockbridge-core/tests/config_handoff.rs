use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread;
use std::time::{Duration, Instant};

use blockbridge_core::handoff;

/// Immutable configuration whose contents must always be internally consistent.
#[derive(Debug)]
struct Weights {
    version: u64,
    taps: Vec<u64>,
}

impl Weights {
    fn new(version: u64) -> Self {
        Self {
            version,
            taps: vec![version; 64],
        }
    }
}

#[test]
fn consumer_sees_monotonic_fully_built_configs() {
    const PUSHES: u64 = 5_000;
    let (mut tx, mut rx) = handoff::channel();
    let done = Arc::new(AtomicBool::new(false));

    let control = {
        let done = Arc::clone(&done);
        thread::spawn(move || {
            for version in 1..=PUSHES {
                tx.push(Weights::new(version));
                if version % 64 == 0 {
                    thread::yield_now();
                }
            }
            done.store(true, Ordering::Release);
            tx
        })
    };

    let deadline = Instant::now() + Duration::from_secs(10);
    let mut last = 0;
    loop {
        let finished = done.load(Ordering::Acquire);
        if let Some(w) = rx.poll() {
            assert!(w.version >= last, "went back from {last} to {}", w.version);
            assert!(w.taps.iter().all(|&t| t == w.version), "torn config");
            last = w.version;
        }
        if finished && last == PUSHES {
            break;
        }
        assert!(Instant::now() < deadline, "consumer never caught up");
        thread::yield_now();
    }

    let mut tx = control.join().expect("control thread panicked");
    // Everything before the consumer's node is reclaimed by the next push.
    tx.push(Weights::new(PUSHES + 1));
    assert_eq!(tx.live_nodes(), 2);
    assert_eq!(rx.latest().map(|w| w.version), Some(PUSHES));
}

#[test]
fn step_wise_consumer_observes_every_version() {
    let (mut tx, mut rx) = handoff::channel();
    let control = thread::spawn(move || {
        for version in 1..=200u64 {
            tx.push(version);
        }
        tx
    });
    let tx = control.join().expect("control thread panicked");

    let seen: Vec<u64> = (0..200).filter_map(|_| rx.poll_1().copied()).collect();
    assert_eq!(seen, (1..=200).collect::<Vec<_>>());
    assert_eq!(tx.live_nodes(), 200);
}
