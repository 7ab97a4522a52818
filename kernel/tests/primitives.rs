//! Safety and liveness of the primitives under contention, on one CPU and
//! across several.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use ukcore::sync::{RawMutex, RawRwLock};
use ukcore::task::thread;
use ukcore::{Mutex, Scheduler, Semaphore, ThreadBuilder, TimedOut, WaitQueue};

/// Spawns `n` workers on the calling CPU and joins them.
fn run_workers(n: usize, work: impl Fn(usize) + Send + Sync + 'static) {
    let work = Arc::new(work);
    let workers: Vec<_> = (0..n)
        .map(|i| {
            let work = work.clone();
            ThreadBuilder::new().spawn(move || work(i)).unwrap()
        })
        .collect();
    for worker in workers {
        worker.join();
    }
}

#[test]
fn wait_queue_add_and_remove_are_idempotent() {
    common::bring_up();
    let wq = WaitQueue::new();
    let me = thread::current();

    assert!(wq.add(&me));
    assert!(!wq.add(&me));
    assert_eq!(wq.len(), 1);
    assert!(wq.contains(&me));

    // Running, not blocked: a wake is a no-op and leaves it queued.
    assert!(!wq.wake_one());
    assert_eq!(wq.wake_all(), 0);
    assert_eq!(wq.len(), 1);

    assert!(wq.remove(&me));
    assert!(!wq.remove(&me));
    assert!(wq.is_empty());
}

#[test]
fn satisfied_condition_never_blocks() {
    common::bring_up();
    let wq = WaitQueue::new();
    let mut checks = 0;
    let status = wq.wait_timeout(Duration::from_secs(5), || {
        checks += 1;
        true
    });
    assert!(!status.timed_out());
    assert_eq!(checks, 1);
    assert!(wq.is_empty());
}

#[test]
fn semaphore_timeout_takes_at_least_the_timeout() {
    common::bring_up();
    let sem = Semaphore::new(0);
    let start = std::time::Instant::now();
    assert_eq!(sem.down_with_timeout(Duration::from_millis(30)), Err(TimedOut));
    assert!(start.elapsed() >= Duration::from_millis(30));
    assert_eq!(sem.count(), 0);
}

#[test]
fn semaphore_timeout_returns_early_on_up() {
    common::bring_up();
    let sem = Arc::new(Semaphore::new(0));
    let upper = {
        let sem = sem.clone();
        ThreadBuilder::new()
            .spawn(move || {
                thread::sleep(Duration::from_millis(10));
                sem.up();
            })
            .unwrap()
    };

    let waited = sem
        .down_with_timeout(Duration::from_secs(10))
        .expect("unit arrives well before the timeout");
    assert!(waited >= Duration::from_millis(10));
    assert!(waited < Duration::from_secs(10));
    upper.join();
}

#[test]
fn semaphore_conserves_units_across_cpus() {
    const UNITS: usize = 2;
    const CPUS: usize = 3;
    const PER_CPU: usize = 3;
    const ROUNDS: usize = 200;

    let sem = Arc::new(Semaphore::new(UNITS));
    let inside = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));

    let cpus: Vec<_> = (0..CPUS)
        .map(|_| {
            let (sem, inside, max_inside) = (sem.clone(), inside.clone(), max_inside.clone());
            common::on_new_cpu(move |_| {
                run_workers(PER_CPU, move |_| {
                    for _ in 0..ROUNDS {
                        sem.down();
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        thread::yield_now();
                        inside.fetch_sub(1, Ordering::SeqCst);
                        sem.up();
                    }
                });
            })
        })
        .collect();
    for cpu in cpus {
        cpu.join().unwrap();
    }

    assert!(max_inside.load(Ordering::SeqCst) <= UNITS);
    assert_eq!(sem.count(), UNITS);
}

#[test]
fn rwlock_excludes_writers_and_finishes_across_cpus() {
    const CPUS: usize = 2;
    const ROUNDS: usize = 100;

    let lock = Arc::new(RawRwLock::new());
    let readers = Arc::new(AtomicUsize::new(0));
    let writers = Arc::new(AtomicUsize::new(0));
    let violations = Arc::new(AtomicUsize::new(0));
    let writes = Arc::new(AtomicUsize::new(0));

    let cpus: Vec<_> = (0..CPUS)
        .map(|_| {
            let (lock, readers, writers, violations, writes) = (
                lock.clone(),
                readers.clone(),
                writers.clone(),
                violations.clone(),
                writes.clone(),
            );
            common::on_new_cpu(move |_| {
                run_workers(4, move |i| {
                    for _ in 0..ROUNDS {
                        if i % 2 == 0 {
                            lock.wlock();
                            if writers.fetch_add(1, Ordering::SeqCst) != 0
                                || readers.load(Ordering::SeqCst) != 0
                            {
                                violations.fetch_add(1, Ordering::SeqCst);
                            }
                            thread::yield_now();
                            writes.fetch_add(1, Ordering::SeqCst);
                            writers.fetch_sub(1, Ordering::SeqCst);
                            lock.wunlock();
                        } else {
                            lock.rlock();
                            readers.fetch_add(1, Ordering::SeqCst);
                            if writers.load(Ordering::SeqCst) != 0 {
                                violations.fetch_add(1, Ordering::SeqCst);
                            }
                            thread::yield_now();
                            readers.fetch_sub(1, Ordering::SeqCst);
                            lock.runlock();
                        }
                    }
                });
            })
        })
        .collect();
    for cpu in cpus {
        cpu.join().unwrap();
    }

    assert_eq!(violations.load(Ordering::SeqCst), 0);
    assert_eq!(writes.load(Ordering::SeqCst), CPUS * 2 * ROUNDS);
    assert_eq!(lock.pending(), (0, 0));
    assert!(!lock.is_write_locked());
}

#[test]
fn mutex_serializes_sleeping_critical_sections() {
    common::bring_up();
    let counter = Arc::new(Mutex::new(0usize));

    let c = counter.clone();
    run_workers(3, move |_| {
        for _ in 0..50 {
            let mut guard = c.lock();
            let seen = *guard;
            thread::yield_now();
            *guard = seen + 1;
        }
    });

    assert_eq!(*counter.lock(), 150);
    assert!(!counter.is_locked());
}

#[test]
fn recursive_mutex_counts_depth() {
    common::bring_up();
    let m = RawMutex::new_recursive();
    m.lock();
    m.lock();
    assert!(m.try_lock());
    assert_eq!(m.owner(), Some(thread::current().id()));
    m.unlock();
    m.unlock();
    assert!(m.is_locked());
    m.unlock();
    assert!(!m.is_locked());
}

#[test]
#[should_panic(expected = "locked a non-recursive mutex twice")]
fn relocking_a_plain_mutex_is_fatal() {
    common::bring_up();
    let m = RawMutex::new();
    m.lock();
    m.lock();
}

#[test]
#[should_panic(expected = "unlocked a mutex it does not own")]
fn unlocking_someone_elses_mutex_is_fatal() {
    common::bring_up();
    let m = Arc::new(RawMutex::new());
    let owner = {
        let m = m.clone();
        ThreadBuilder::new().spawn(move || m.lock()).unwrap()
    };
    owner.join();
    m.unlock();
}

#[test]
#[should_panic(expected = "recursive write lock")]
fn recursive_write_lock_is_fatal() {
    common::bring_up();
    let lock = RawRwLock::new();
    lock.wlock();
    lock.wlock();
}

#[test]
fn wake_from_interrupt_requests_a_reschedule() {
    let sched: &'static Scheduler = common::bring_up();
    let wq = Arc::new(WaitQueue::new());
    let flag = Arc::new(AtomicUsize::new(0));

    let sleeper = {
        let (wq, flag) = (wq.clone(), flag.clone());
        ThreadBuilder::new()
            .spawn(move || wq.wait(|| flag.load(Ordering::SeqCst) == 1))
            .unwrap()
    };
    thread::yield_now();
    assert_eq!(sleeper.state(), ukcore::ThreadState::Blocked);

    // What a driver's interrupt handler would do.
    flag.store(1, Ordering::SeqCst);
    assert!(sched.wake_from_interrupt(&sleeper));
    assert!(sched.need_resched());
    assert!(sched.preempt_point());
    assert!(!sched.need_resched());

    sleeper.join();
    assert!(wq.is_empty());
}
