//! End-to-end behaviour of the blocking primitives on a live scheduler.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use ukcore::sync::RawRwLock;
use ukcore::task::{clock, thread};
use ukcore::{Semaphore, SpinLock, ThreadBuilder, ThreadState, WaitQueue, WaitStatus};

#[test]
fn semaphore_down_blocks_until_up() {
    common::bring_up();
    let sem = Arc::new(Semaphore::new(0));
    let returned = Arc::new(AtomicBool::new(false));

    let t1 = ThreadBuilder::new()
        .name("t1")
        .spawn({
            let (sem, returned) = (sem.clone(), returned.clone());
            move || {
                sem.down();
                returned.store(true, Ordering::SeqCst);
            }
        })
        .unwrap();

    thread::yield_now();
    assert_eq!(t1.state(), ThreadState::Blocked);
    assert!(!returned.load(Ordering::SeqCst));

    let t2 = ThreadBuilder::new()
        .name("t2")
        .spawn({
            let sem = sem.clone();
            move || sem.up()
        })
        .unwrap();

    t1.join();
    t2.join();
    assert!(returned.load(Ordering::SeqCst));
    assert_eq!(sem.count(), 0);
}

#[test]
fn semaphore_up_from_another_cpu_wakes_the_waiter() {
    common::bring_up();
    let sem = Arc::new(Semaphore::new(0));

    let upper = {
        let sem = sem.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            sem.up();
        })
    };

    // The boot thread itself blocks; the idle thread keeps this CPU alive
    // until the wake from the other CPU arrives.
    sem.down();
    upper.join().unwrap();
    assert_eq!(sem.count(), 0);
}

#[test]
fn pending_writer_goes_before_later_reader() {
    common::bring_up();
    let lock = Arc::new(RawRwLock::new());
    let order = Arc::new(SpinLock::new(Vec::new()));

    // T1 (this thread) reads.
    lock.rlock();

    let writer = ThreadBuilder::new()
        .name("writer")
        .spawn({
            let (lock, order) = (lock.clone(), order.clone());
            move || {
                lock.wlock();
                order.lock().push("write");
                lock.wunlock();
            }
        })
        .unwrap();
    thread::yield_now();
    assert_eq!(lock.pending(), (0, 1));
    assert_eq!(writer.state(), ThreadState::Blocked);

    let reader = ThreadBuilder::new()
        .name("reader")
        .spawn({
            let (lock, order) = (lock.clone(), order.clone());
            move || {
                lock.rlock();
                order.lock().push("read");
                lock.runlock();
            }
        })
        .unwrap();
    thread::yield_now();
    assert_eq!(lock.pending(), (1, 1));
    assert_eq!(reader.state(), ThreadState::Blocked);

    lock.runlock();
    writer.join();
    reader.join();
    assert_eq!(*order.lock(), ["write", "read"]);
    assert_eq!(lock.pending(), (0, 0));
}

#[test]
fn write_unlock_lets_pending_readers_in_before_next_writer() {
    common::bring_up();
    let lock = Arc::new(RawRwLock::new());
    let order = Arc::new(SpinLock::new(Vec::new()));

    lock.wlock();

    let reader = ThreadBuilder::new()
        .name("reader")
        .spawn({
            let (lock, order) = (lock.clone(), order.clone());
            move || {
                lock.rlock();
                order.lock().push("read");
                lock.runlock();
            }
        })
        .unwrap();
    thread::yield_now();
    assert_eq!(reader.state(), ThreadState::Blocked);

    // Runs ahead of the reader whenever both are ready.
    let writer = ThreadBuilder::new()
        .name("writer")
        .priority(200)
        .spawn({
            let (lock, order) = (lock.clone(), order.clone());
            move || {
                lock.wlock();
                order.lock().push("write");
                lock.wunlock();
            }
        })
        .unwrap();
    thread::yield_now();
    assert_eq!(writer.state(), ThreadState::Blocked);
    assert_eq!(lock.pending(), (1, 1));

    lock.wunlock();
    reader.join();
    writer.join();
    assert_eq!(*order.lock(), ["read", "write"]);
    assert_eq!(lock.pending(), (0, 0));
    assert!(!lock.is_write_locked());
}

#[test]
fn deadline_wait_on_false_condition_times_out() {
    common::bring_up();
    let wq = WaitQueue::new();
    let start = Instant::now();

    let status = wq.wait_deadline(clock::deadline_after(Duration::from_millis(100)), || false);

    assert_eq!(status, WaitStatus::TimedOut);
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert!(wq.is_empty(), "waiter dequeues itself");
}

#[test]
fn yields_advance_counters() {
    let sched = common::bring_up();
    let snapshots = Arc::new(SpinLock::new(Vec::new()));

    let workers: Vec<_> = ["a", "b"]
        .into_iter()
        .map(|name| {
            let snapshots = snapshots.clone();
            ThreadBuilder::new()
                .name(name)
                .spawn(move || {
                    let sched = ukcore::Scheduler::this_cpu();
                    for _ in 0..5 {
                        snapshots.lock().push(sched.stats());
                        thread::yield_now();
                    }
                })
                .unwrap()
        })
        .collect();
    for worker in &workers {
        worker.join();
    }

    let snapshots = snapshots.lock();
    assert_eq!(snapshots.len(), 10);
    for pair in snapshots.windows(2) {
        assert!(pair[1].schedules > pair[0].schedules);
        assert!(pair[1].yields > pair[0].yields);
        // a and b alternate, so every yield between two snapshots switched.
        assert!(pair[1].nexts > pair[0].nexts);
    }

    // Alone on the CPU, a yield decides but does not switch.
    let before = sched.stats();
    thread::yield_now();
    let after = sched.stats();
    assert_eq!(after.schedules, before.schedules + 1);
    assert_eq!(after.yields, before.yields + 1);
    assert_eq!(after.nexts, before.nexts);
}
