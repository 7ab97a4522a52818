//! Per-CPU scheduler.
//!
//! One [`Scheduler`] per logical CPU, created by [`Scheduler::bring_up`] on
//! that CPU and never destroyed. It owns:
//!
//!   - the current thread (exactly one at any time),
//!   - the ready list, highest priority first, FIFO among equals,
//!   - the sleeping list: blocked threads with a wake-up deadline,
//!   - the exited list, drained lazily by [`collect`](Scheduler::collect),
//!   - the idle thread, which runs whenever nothing else is ready.
//!
//! Lock order: a wait queue's lock may be held while taking a run queue
//! lock, never the other way round. Run queue locks are IRQ-safe; the
//! switch itself happens with the lock released but interrupts still off.
//!
//! Threads never migrate: every state change of a thread that involves its
//! run queue happens under the owning scheduler's lock, from any CPU.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;

use khal::irq;
use spin::Once;

use crate::arch;
use crate::config::MAX_LCPUS;
use crate::error::SpawnError;
use crate::sync::SpinLockIrq;
use crate::task::clock;
use crate::task::thread::{Thread, ThreadFlags, ThreadState};

static SCHEDULERS: [Once<Scheduler>; MAX_LCPUS] = [const { Once::new() }; MAX_LCPUS];

struct RunQueue {
    current: Arc<Thread>,
    ready: VecDeque<Arc<Thread>>,
    sleeping: Vec<Arc<Thread>>,
    exited: Vec<Arc<Thread>>,
    /// Threads on this CPU that have not exited, idle and boot included.
    live: usize,
    schedules: u64,
    yields: u64,
    idles: u64,
    nexts: u64,
}

impl RunQueue {
    /// Capacity so that pushes on the switch and exit paths never allocate.
    fn reserve_for_live(&mut self) {
        let live = self.live;
        self.ready.reserve(live.saturating_sub(self.ready.len()));
        self.sleeping.reserve(live.saturating_sub(self.sleeping.len()));
        self.exited.reserve(live);
    }

    /// Moves sleepers whose deadline has passed back to runnable.
    fn expire_sleepers(&mut self, now: u64) {
        let mut i = 0;
        while i < self.sleeping.len() {
            let deadline = self.sleeping[i].wakeup_deadline();
            if deadline == clock::NEVER || deadline > now {
                i += 1;
                continue;
            }
            let thread = self.sleeping.swap_remove(i);
            thread.remove_flags(ThreadFlags::SLEEPING);
            if thread.state() == ThreadState::Blocked {
                thread.set_state(ThreadState::Runnable);
                // The current thread is requeued by `reschedule` itself.
                if !Arc::ptr_eq(&thread, &self.current) {
                    self.ready.push_back(thread);
                }
            }
        }
    }

    fn unsleep(&mut self, thread: &Thread) {
        if thread.flags().contains(ThreadFlags::SLEEPING) {
            thread.remove_flags(ThreadFlags::SLEEPING);
            self.sleeping.retain(|t| !core::ptr::eq(Arc::as_ptr(t), thread));
        }
    }

    /// Removes and returns the highest-priority ready thread, the oldest
    /// among equals.
    fn pick_next(&mut self) -> Option<Arc<Thread>> {
        let mut best: Option<(usize, u8)> = None;
        for (i, thread) in self.ready.iter().enumerate() {
            let prio = thread.priority();
            if best.is_none_or(|(_, p)| prio > p) {
                best = Some((i, prio));
            }
        }
        best.and_then(|(i, _)| self.ready.remove(i))
    }
}

/// A snapshot of one CPU's scheduler counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedStats {
    pub lcpu: usize,
    /// Scheduling decisions taken.
    pub schedules: u64,
    /// Explicit yields.
    pub yields: u64,
    /// Times the idle thread was switched in.
    pub idles: u64,
    /// Times the running thread changed.
    pub nexts: u64,
    /// Time spent in the idle thread.
    pub idle_time: Duration,
    /// Time since bring-up.
    pub uptime: Duration,
    /// Threads that have not exited, idle included.
    pub threads: usize,
    pub ready: usize,
    pub sleeping: usize,
    /// Exited threads not yet reclaimed.
    pub exited: usize,
}

impl fmt::Display for SchedStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "lcpu {}: {} schedules, {} yields, {} idles, {} switches, idle {:?} of {:?}, {} threads ({} ready)",
            self.lcpu,
            self.schedules,
            self.yields,
            self.idles,
            self.nexts,
            self.idle_time,
            self.uptime,
            self.threads,
            self.ready
        )
    }
}

/// The scheduler of one logical CPU.
pub struct Scheduler {
    lcpu: usize,
    rq: SpinLockIrq<RunQueue>,
    idle: Arc<Thread>,
    need_resched: AtomicBool,
    started_at: u64,
}

impl Scheduler {
    /// Creates the scheduler of the calling CPU, adopting the calling
    /// context as its boot thread. Returns the existing one if the CPU is
    /// already up.
    pub fn bring_up() -> Result<&'static Scheduler, SpawnError> {
        let lcpu = khal::cpu::id();
        assert!(lcpu < MAX_LCPUS, "lcpu {} beyond MAX_LCPUS ({})", lcpu, MAX_LCPUS);
        SCHEDULERS[lcpu].try_call_once(|| {
            let boot = Arc::new(Thread::adopt(lcpu)?);
            let idle = Arc::new(Thread::idle(lcpu)?);
            let mut rq = RunQueue {
                current: boot,
                ready: VecDeque::new(),
                sleeping: Vec::new(),
                exited: Vec::new(),
                live: 2,
                schedules: 0,
                yields: 0,
                idles: 0,
                nexts: 0,
            };
            rq.reserve_for_live();
            log::info!(
                "lcpu {}: scheduler up, {} backend",
                lcpu,
                arch::backend().name()
            );
            Ok(Scheduler {
                lcpu,
                rq: SpinLockIrq::new(rq),
                idle,
                need_resched: AtomicBool::new(false),
                started_at: clock::now(),
            })
        })
    }

    /// The calling CPU's scheduler.
    ///
    /// Panics if the CPU was never brought up.
    pub fn this_cpu() -> &'static Scheduler {
        let lcpu = khal::cpu::id();
        Self::for_lcpu(lcpu).unwrap_or_else(|| panic!("no scheduler on lcpu {}", lcpu))
    }

    pub fn for_lcpu(lcpu: usize) -> Option<&'static Scheduler> {
        SCHEDULERS.get(lcpu)?.get()
    }

    pub fn lcpu(&self) -> usize {
        self.lcpu
    }

    pub fn idle_thread(&self) -> &Arc<Thread> {
        &self.idle
    }

    /// The thread currently running on this scheduler's CPU.
    pub fn current(&self) -> Arc<Thread> {
        self.rq.lock().current.clone()
    }

    /// Makes a new thread runnable on this CPU.
    pub fn add(&self, thread: &Arc<Thread>) {
        assert_eq!(thread.lcpu(), self.lcpu, "{} belongs to another CPU", thread);
        assert_eq!(
            thread.state(),
            ThreadState::Initializing,
            "{} added twice",
            thread
        );
        {
            let mut rq = self.rq.lock();
            rq.live += 1;
            rq.reserve_for_live();
            thread.set_state(ThreadState::Runnable);
            rq.ready.push_back(thread.clone());
        }
        self.collect();
    }

    /// Declares an exited thread reclaimable. The memory goes away on a
    /// later [`collect`](Self::collect) pass, not here.
    pub fn remove(&self, thread: &Arc<Thread>) {
        assert_eq!(thread.lcpu(), self.lcpu, "{} belongs to another CPU", thread);
        assert_eq!(
            thread.state(),
            ThreadState::Exited,
            "remove of live thread {}",
            thread
        );
        thread.insert_flags(ThreadFlags::REAPED);
    }

    /// Records a thread that has just marked itself blocked. With a
    /// wake-up deadline it goes on the sleeping list.
    pub fn block(&self, thread: &Arc<Thread>) {
        let mut rq = self.rq.lock();
        if thread.state() == ThreadState::Blocked
            && thread.wakeup_deadline() != clock::NEVER
            && !thread.flags().contains(ThreadFlags::SLEEPING)
        {
            thread.insert_flags(ThreadFlags::SLEEPING);
            rq.sleeping.push(thread.clone());
        }
    }

    /// Makes a blocked thread runnable again. Never switches.
    pub fn wake(&self, thread: &Arc<Thread>) -> bool {
        assert_eq!(thread.lcpu(), self.lcpu, "{} belongs to another CPU", thread);
        let mut rq = self.rq.lock();
        if thread.state() != ThreadState::Blocked {
            return false;
        }
        thread.set_state(ThreadState::Runnable);
        rq.unsleep(thread);
        // Still on its CPU between marking itself blocked and switching
        // away: it notices on its own.
        if !Arc::ptr_eq(thread, &rq.current) {
            rq.ready.push_back(thread.clone());
        }
        true
    }

    /// [`wake`](Self::wake) for interrupt handlers: also asks for a
    /// reschedule at the next preemption point.
    pub fn wake_from_interrupt(&self, thread: &Arc<Thread>) -> bool {
        let woken = self.wake(thread);
        if woken {
            self.need_resched.store(true, Ordering::Release);
        }
        woken
    }

    /// The end of a wait: the thread leaves the sleeping list and runs on.
    pub(crate) fn unblock(&self, thread: &Arc<Thread>) {
        let mut rq = self.rq.lock();
        thread.set_wakeup_deadline(clock::NEVER);
        rq.unsleep(thread);
        thread.set_state(ThreadState::Running);
    }

    /// Gives up the CPU to the best ready thread, if any.
    pub fn yield_now(&self) {
        self.rq.lock().yields += 1;
        self.reschedule();
    }

    /// Picks the next thread and switches to it. Returns `false` if the
    /// caller keeps the CPU.
    ///
    /// A caller that is still running (or was woken before getting here)
    /// goes to the back of the ready list; a blocked or exited one stays
    /// off it.
    pub(crate) fn reschedule(&self) -> bool {
        debug_assert_eq!(khal::cpu::id(), self.lcpu, "reschedule from a foreign CPU");
        self.need_resched.store(false, Ordering::Relaxed);

        let flags = irq::save_and_disable();
        let (prev_ctx, next_ctx) = {
            let mut rq = self.rq.lock();
            let now = clock::now();
            rq.schedules += 1;
            rq.expire_sleepers(now);

            let prev_state = rq.current.state();
            let requeue = matches!(prev_state, ThreadState::Running | ThreadState::Runnable);
            if requeue {
                rq.current.set_state(ThreadState::Runnable);
                if !rq.current.is_idle() {
                    let prev = rq.current.clone();
                    rq.ready.push_back(prev);
                }
            }

            let next = rq.pick_next().unwrap_or_else(|| self.idle.clone());
            if Arc::ptr_eq(&next, &rq.current) {
                if requeue {
                    next.set_state(ThreadState::Running);
                }
                drop(rq);
                irq::restore(flags);
                return false;
            }

            rq.nexts += 1;
            if next.is_idle() {
                rq.idles += 1;
            }
            rq.current.account_out(now);
            next.account_in(now);
            next.set_state(ThreadState::Running);

            // `prev` stays referenced from a list, a wait queue or its
            // exit bookkeeping; nothing on this stack may keep it alive.
            let prev = core::mem::replace(&mut rq.current, next);
            log::trace!("lcpu {}: {} -> {}", self.lcpu, prev, rq.current);
            (prev.context_ptr(), rq.current.context_ptr())
        };

        // SAFETY: IRQs are off, this CPU owns both threads, `prev` is the
        // running context and `next` is suspended or never run.
        unsafe { arch::backend().switch(prev_ctx, next_ctx) };
        irq::restore(flags);
        true
    }

    /// Yields if an interrupt or the timer asked for it.
    pub fn preempt_point(&self) -> bool {
        if self.need_resched.swap(false, Ordering::AcqRel) {
            self.yield_now();
            true
        } else {
            false
        }
    }

    pub fn need_resched(&self) -> bool {
        self.need_resched.load(Ordering::Acquire)
    }

    /// Timer interrupt hook: counts the tick and requests a reschedule when
    /// the current thread's slice is used up, a sleeper is due, or work
    /// arrived while idling.
    pub fn timer_tick(&self) {
        clock::tick();
        let rq = self.rq.lock();
        let now = clock::now();
        let current = &rq.current;
        let slice = current.timeslice_ns();
        let slice_used = slice != 0 && now.saturating_sub(current.switched_in_at()) >= slice;
        let sleeper_due = rq.sleeping.iter().any(|t| {
            let deadline = t.wakeup_deadline();
            deadline != clock::NEVER && deadline <= now
        });
        let idle_with_work = current.is_idle() && !rq.ready.is_empty();
        if slice_used || sleeper_due || idle_with_work {
            self.need_resched.store(true, Ordering::Release);
        }
    }

    /// Terminates the running thread.
    pub(crate) fn exit_current(&self) -> ! {
        {
            let me = self.current();
            assert!(!me.is_idle(), "the idle thread cannot exit");
            {
                let mut rq = self.rq.lock();
                me.set_state(ThreadState::Exited);
                rq.live -= 1;
                rq.exited.push(me.clone());
            }
            log::debug!("{} exited after {:?}", me, me.exec_time());
            me.exit_queue().wake_all();
        }
        self.reschedule();
        unreachable!("exited thread was scheduled again");
    }

    /// Drops the scheduler's references to exited threads nobody will
    /// observe any more: detached ones, removed ones, and ones whose last
    /// handle is the exited list. Only runs on the owning CPU, so a thread
    /// still switching away from its stack is never freed under it.
    pub fn collect(&self) -> usize {
        if khal::cpu::id() != self.lcpu {
            return 0;
        }
        let doomed: Vec<Arc<Thread>> = {
            let mut rq = self.rq.lock();
            let current = rq.current.clone();
            let (doomed, mut keep): (Vec<_>, Vec<_>) = core::mem::take(&mut rq.exited)
                .into_iter()
                .partition(|t| !Arc::ptr_eq(t, &current) && t.reclaimable(1));
            keep.reserve(rq.live);
            rq.exited = keep;
            doomed
        };
        let reclaimed = doomed.len();
        if reclaimed > 0 {
            log::debug!("lcpu {}: reclaimed {} threads", self.lcpu, reclaimed);
        }
        reclaimed
    }

    pub(crate) fn idle_loop(&self) -> ! {
        loop {
            self.collect();
            if !self.reschedule() {
                khal::cpu::halt();
            }
        }
    }

    /// Hands the CPU to `first`, a thread added to this scheduler that has
    /// never run. The bring-up context is abandoned and never resumes;
    /// whatever it still holds on its stack is leaked.
    pub fn start(&self, first: Arc<Thread>) -> ! {
        assert_eq!(khal::cpu::id(), self.lcpu, "start from a foreign CPU");
        irq::disable();
        let next_ctx = {
            let mut rq = self.rq.lock();
            let pos = rq
                .ready
                .iter()
                .position(|t| Arc::ptr_eq(t, &first))
                .unwrap_or_else(|| panic!("{} is not ready on lcpu {}", first, self.lcpu));
            let first = rq.ready.remove(pos).expect("position is in range");

            let now = clock::now();
            first.account_in(now);
            first.set_state(ThreadState::Running);
            let boot = core::mem::replace(&mut rq.current, first);
            boot.account_out(now);
            boot.set_state(ThreadState::Exited);
            boot.insert_flags(ThreadFlags::REAPED);
            rq.live -= 1;
            rq.nexts += 1;
            rq.schedules += 1;
            log::info!("lcpu {}: starting {}", self.lcpu, rq.current);
            rq.current.context_ptr()
        };
        drop(first);
        // SAFETY: IRQs are off and `next_ctx` belongs to a never-run thread
        // that is now current on this CPU.
        unsafe { arch::backend().start(next_ctx) }
    }

    /// CPU time of a thread owned by this scheduler, read consistently
    /// with the switch path.
    pub(crate) fn exec_time_of(&self, thread: &Thread) -> Duration {
        let _rq = self.rq.lock();
        thread.exec_time_at(clock::now())
    }

    pub fn stats(&self) -> SchedStats {
        let rq = self.rq.lock();
        SchedStats {
            lcpu: self.lcpu,
            schedules: rq.schedules,
            yields: rq.yields,
            idles: rq.idles,
            nexts: rq.nexts,
            idle_time: self.idle.exec_time_at(clock::now()),
            uptime: clock::since(self.started_at),
            threads: rq.live,
            ready: rq.ready.len(),
            sleeping: rq.sleeping.len(),
            exited: rq.exited.len(),
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("lcpu", &self.lcpu)
            .field("need_resched", &self.need_resched())
            .finish_non_exhaustive()
    }
}
