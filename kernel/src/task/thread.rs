//! Threads: identity, attributes, state machine and owned resources.
//!
//! ```text
//!   Initializing ──add──▶ Runnable ◀──wake── Blocked
//!                            │  ▲               ▲
//!                   schedule │  │ yield         │ wait
//!                            ▼  │               │
//!                           Running ────────────┘
//!                              │
//!                         exit │
//!                              ▼
//!                            Exited ──join/remove/detached──▶ reclaimed
//! ```
//!
//! A thread is bound to the scheduler it was added to for its whole life.
//! It is shared as `Arc<Thread>`: the scheduler lists, wait queues and user
//! handles each hold one.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use core::time::Duration;

use bitflags::bitflags;

use crate::arch::{self, ContextBlob};
use crate::config;
use crate::error::SpawnError;
use crate::sync::{SpinLock, WaitQueue};
use crate::task::clock;
use crate::task::sched::Scheduler;
use crate::task::stack::{Stack, TlsArea};

// ── Thread identifiers ──────────────────────────────────────────

/// Monotonically increasing thread id counter.
static NEXT_TID: AtomicU64 = AtomicU64::new(1);

/// Unique, never reused identity of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(u64);

impl ThreadId {
    fn alloc() -> Self {
        ThreadId(NEXT_TID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

// ── State ───────────────────────────────────────────────────────

/// Scheduling state of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    /// Created, not yet handed to a scheduler.
    Initializing = 0,
    /// Ready to run (or running but about to be switched out).
    Runnable = 1,
    /// The current thread of its CPU.
    Running = 2,
    /// Waiting for a wake or a deadline.
    Blocked = 3,
    /// Finished; resources reclaimed lazily.
    Exited = 4,
}

impl ThreadState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ThreadState::Initializing,
            1 => ThreadState::Runnable,
            2 => ThreadState::Running,
            3 => ThreadState::Blocked,
            _ => ThreadState::Exited,
        }
    }
}

bitflags! {
    /// Bookkeeping bits of a thread.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadFlags: u32 {
        /// Nobody will join it; reclaimed as soon as it exits.
        const DETACHED = 1 << 0;
        /// Exit observed (joined or removed); may be reclaimed.
        const REAPED   = 1 << 1;
        /// On its scheduler's sleeping list.
        const SLEEPING = 1 << 2;
        /// The per-CPU idle thread.
        const IDLE     = 1 << 3;
        /// The bring-up context adopted by `Scheduler::bring_up`.
        const BOOT     = 1 << 4;
    }
}

type Entry = Box<dyn FnOnce() + Send + 'static>;

// ── Thread ──────────────────────────────────────────────────────

/// A unit of execution.
pub struct Thread {
    id: ThreadId,
    name: Option<&'static str>,
    priority: u8,
    /// Nanoseconds; 0 means no timeslice.
    timeslice_ns: u64,
    /// Logical CPU of the owning scheduler.
    lcpu: usize,
    state: AtomicU8,
    flags: AtomicU32,
    context: ContextBlob,
    // The boot thread runs on memory it does not own.
    stack: Option<Stack>,
    tls: Option<TlsArea>,
    tls_ptr: usize,
    entry: SpinLock<Option<Entry>>,
    exec_time: AtomicU64,
    switched_in_at: AtomicU64,
    /// Current thread of its CPU. Only changed under the run queue lock.
    on_cpu: AtomicBool,
    wakeup_deadline: AtomicU64,
    exit_wq: WaitQueue,
}

impl Thread {
    fn new(
        builder: &ThreadBuilder,
        lcpu: usize,
        flags: ThreadFlags,
        entry: Entry,
    ) -> Result<Self, SpawnError> {
        let stack = Stack::alloc(builder.stack_size)?;
        let tls = TlsArea::alloc(builder.tls_size)?;
        let backend = arch::backend();
        let context = ContextBlob::alloc(backend)?;
        let tls_ptr = tls.pointer();
        // SAFETY: a fresh zeroed blob of the backend's size, the top of a
        // stack nobody else uses, and that stack's TLS block.
        unsafe { backend.init(context.as_mut_ptr(), stack.top(), tls_ptr) };

        Ok(Self {
            id: ThreadId::alloc(),
            name: builder.name,
            priority: builder.priority,
            timeslice_ns: builder.timeslice.map_or(0, clock::as_ns),
            lcpu,
            state: AtomicU8::new(ThreadState::Initializing as u8),
            flags: AtomicU32::new(flags.bits()),
            context,
            stack: Some(stack),
            tls: Some(tls),
            tls_ptr,
            entry: SpinLock::new(Some(entry)),
            exec_time: AtomicU64::new(0),
            switched_in_at: AtomicU64::new(0),
            on_cpu: AtomicBool::new(false),
            wakeup_deadline: AtomicU64::new(clock::NEVER),
            exit_wq: WaitQueue::new(),
        })
    }

    /// Wraps the context that is already running on `lcpu` (the bring-up
    /// code) so the scheduler can switch away from it. It has no stack of
    /// its own to reclaim and keeps the TLS pointer it runs with.
    pub(crate) fn adopt(lcpu: usize) -> Result<Self, SpawnError> {
        Ok(Self {
            id: ThreadId::alloc(),
            name: Some("boot"),
            priority: config::DEFAULT_PRIORITY,
            timeslice_ns: 0,
            lcpu,
            state: AtomicU8::new(ThreadState::Running as u8),
            flags: AtomicU32::new(ThreadFlags::BOOT.bits()),
            context: ContextBlob::alloc(arch::backend())?,
            stack: None,
            tls: None,
            tls_ptr: khal::tls::get(),
            entry: SpinLock::new(None),
            exec_time: AtomicU64::new(0),
            switched_in_at: AtomicU64::new(clock::now()),
            on_cpu: AtomicBool::new(true),
            wakeup_deadline: AtomicU64::new(clock::NEVER),
            exit_wq: WaitQueue::new(),
        })
    }

    /// Builds the idle thread of `lcpu`. It is never on the ready list.
    pub(crate) fn idle(lcpu: usize) -> Result<Self, SpawnError> {
        let builder = ThreadBuilder::new().name("idle").priority(0);
        let entry: Entry = Box::new(move || {
            Scheduler::for_lcpu(lcpu)
                .expect("idle thread without a scheduler")
                .idle_loop()
        });
        let thread = Self::new(&builder, lcpu, ThreadFlags::IDLE, entry)?;
        thread.set_state(ThreadState::Runnable);
        Ok(thread)
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> Option<&'static str> {
        self.name
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// Configured timeslice, if any.
    pub fn timeslice(&self) -> Option<Duration> {
        (self.timeslice_ns != 0).then(|| Duration::from_nanos(self.timeslice_ns))
    }

    pub(crate) fn timeslice_ns(&self) -> u64 {
        self.timeslice_ns
    }

    /// Logical CPU whose scheduler owns this thread.
    pub fn lcpu(&self) -> usize {
        self.lcpu
    }

    /// The scheduler that owns this thread.
    pub fn scheduler(&self) -> &'static Scheduler {
        Scheduler::for_lcpu(self.lcpu).expect("thread bound to a CPU without a scheduler")
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn flags(&self) -> ThreadFlags {
        ThreadFlags::from_bits_truncate(self.flags.load(Ordering::SeqCst))
    }

    pub(crate) fn insert_flags(&self, flags: ThreadFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::SeqCst);
    }

    pub(crate) fn remove_flags(&self, flags: ThreadFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::SeqCst);
    }

    pub fn is_detached(&self) -> bool {
        self.flags().contains(ThreadFlags::DETACHED)
    }

    pub fn is_idle(&self) -> bool {
        self.flags().contains(ThreadFlags::IDLE)
    }

    /// Gives up the right to join: the thread is reclaimed once it exits.
    pub fn detach(&self) {
        self.insert_flags(ThreadFlags::DETACHED);
    }

    pub(crate) fn context_ptr(&self) -> *mut u8 {
        self.context.as_mut_ptr()
    }

    /// Bytes of stack owned by the thread (0 for the boot thread).
    pub fn stack_size(&self) -> usize {
        self.stack.as_ref().map_or(0, Stack::size)
    }

    /// Bytes of TLS block owned by the thread, TCB included.
    pub fn tls_size(&self) -> usize {
        self.tls.as_ref().map_or(0, TlsArea::size)
    }

    /// TLS pointer the thread runs with.
    pub fn tls_pointer(&self) -> usize {
        self.tls_ptr
    }

    pub(crate) fn wakeup_deadline(&self) -> u64 {
        self.wakeup_deadline.load(Ordering::SeqCst)
    }

    pub(crate) fn set_wakeup_deadline(&self, deadline: u64) {
        self.wakeup_deadline.store(deadline, Ordering::SeqCst);
    }

    pub(crate) fn switched_in_at(&self) -> u64 {
        self.switched_in_at.load(Ordering::Relaxed)
    }

    /// Charges the time since the last switch-in and stops the meter.
    /// Called under the run queue lock.
    pub(crate) fn account_out(&self, now: u64) {
        let ran = now.saturating_sub(self.switched_in_at());
        self.exec_time.fetch_add(ran, Ordering::Relaxed);
        self.on_cpu.store(false, Ordering::Relaxed);
    }

    /// Starts the meter. Called under the run queue lock.
    pub(crate) fn account_in(&self, now: u64) {
        self.switched_in_at.store(now, Ordering::Relaxed);
        self.on_cpu.store(true, Ordering::Relaxed);
    }

    /// Accumulated CPU time up to `now`. The caller holds the owning run
    /// queue lock, so the meter cannot stop or start underneath.
    pub(crate) fn exec_time_at(&self, now: u64) -> Duration {
        let mut ns = self.exec_time.load(Ordering::Relaxed);
        if self.on_cpu.load(Ordering::Relaxed) {
            ns = ns.saturating_add(now.saturating_sub(self.switched_in_at()));
        }
        Duration::from_nanos(ns)
    }

    /// Accumulated CPU time, including the current run if the thread is on
    /// its CPU. Never decreases.
    pub fn exec_time(&self) -> Duration {
        match Scheduler::for_lcpu(self.lcpu) {
            Some(sched) => sched.exec_time_of(self),
            None => self.exec_time_at(clock::now()),
        }
    }

    /// Whether the idle collector may drop the scheduler's reference.
    /// `holders` is the number of references the caller itself holds.
    pub(crate) fn reclaimable(self: &Arc<Self>, holders: usize) -> bool {
        self.state() == ThreadState::Exited
            && (self.flags().intersects(ThreadFlags::DETACHED | ThreadFlags::REAPED)
                || Arc::strong_count(self) <= holders)
    }

    /// Waits for the thread to exit, then removes it from its scheduler.
    ///
    /// Joining a detached thread or the calling thread itself is misuse.
    pub fn join(self: &Arc<Self>) {
        assert!(!self.is_detached(), "join of detached thread {}", self.id);
        assert!(
            !Arc::ptr_eq(self, &current()),
            "thread {} cannot join itself",
            self.id
        );
        self.exit_wq.wait(|| self.state() == ThreadState::Exited);
        self.scheduler().remove(self);
        log::debug!("joined {}", self);
    }

    pub(crate) fn exit_queue(&self) -> &WaitQueue {
        &self.exit_wq
    }

    pub(crate) fn take_entry(&self) -> Option<Entry> {
        self.entry.lock().take()
    }
}

// SAFETY: the context blob is only read and written by the backend on the
// owning CPU, inside a switch; everything else is atomics or locked.
unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl fmt::Display for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name {
            Some(name) => write!(f, "{}({})", self.id, name),
            None => write!(f, "{}", self.id),
        }
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("lcpu", &self.lcpu)
            .field("state", &self.state())
            .field("flags", &self.flags())
            .finish()
    }
}

// ── Creation ────────────────────────────────────────────────────

/// Thread attributes, consumed by [`spawn`](Self::spawn).
///
/// ```ignore
/// let worker = ThreadBuilder::new()
///     .name("worker")
///     .priority(200)
///     .spawn(|| do_work())?;
/// worker.join();
/// ```
#[derive(Debug, Clone)]
pub struct ThreadBuilder {
    name: Option<&'static str>,
    priority: u8,
    timeslice: Option<Duration>,
    detached: bool,
    stack_size: usize,
    tls_size: usize,
}

impl ThreadBuilder {
    pub fn new() -> Self {
        Self {
            name: None,
            priority: config::DEFAULT_PRIORITY,
            timeslice: config::DEFAULT_TIMESLICE,
            detached: false,
            stack_size: config::DEFAULT_STACK_SIZE,
            tls_size: config::DEFAULT_TLS_SIZE,
        }
    }

    pub fn name(mut self, name: &'static str) -> Self {
        self.name = Some(name);
        self
    }

    /// Higher runs first. Equal priorities take turns.
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Preemption budget checked by `Scheduler::timer_tick`; `None` runs
    /// until the thread yields or blocks. A zero slice is invalid.
    pub fn timeslice(mut self, timeslice: Option<Duration>) -> Self {
        self.timeslice = timeslice;
        self
    }

    pub fn detached(mut self, detached: bool) -> Self {
        self.detached = detached;
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn tls_size(mut self, size: usize) -> Self {
        self.tls_size = size;
        self
    }

    /// Creates the thread on the calling CPU's scheduler.
    pub fn spawn<F>(self, f: F) -> Result<Arc<Thread>, SpawnError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn_on(Scheduler::this_cpu(), f)
    }

    /// Creates the thread on `sched`, which may belong to another CPU.
    pub fn spawn_on<F>(self, sched: &'static Scheduler, f: F) -> Result<Arc<Thread>, SpawnError>
    where
        F: FnOnce() + Send + 'static,
    {
        assert!(
            self.stack_size >= config::MIN_STACK_SIZE,
            "stack of {} bytes is below the minimum of {}",
            self.stack_size,
            config::MIN_STACK_SIZE
        );
        assert!(self.timeslice != Some(Duration::ZERO), "zero timeslice");

        let flags = if self.detached {
            ThreadFlags::DETACHED
        } else {
            ThreadFlags::empty()
        };
        let thread = Arc::new(Thread::new(&self, sched.lcpu(), flags, Box::new(f))?);
        log::debug!("spawned {} on lcpu {} (prio {})", thread, sched.lcpu(), thread.priority);
        sched.add(&thread);
        Ok(thread)
    }
}

impl Default for ThreadBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns a thread with default attributes on the calling CPU.
pub fn spawn<F>(f: F) -> Result<Arc<Thread>, SpawnError>
where
    F: FnOnce() + Send + 'static,
{
    ThreadBuilder::new().spawn(f)
}

/// First code every thread runs, entered from a never-run context with
/// interrupts disabled.
pub(crate) extern "C" fn trampoline() -> ! {
    // No `Arc<Thread>` may outlive this scope: the stack is abandoned at
    // exit and whatever it still holds would leak.
    let entry = current().take_entry();
    khal::irq::enable();
    if let Some(entry) = entry {
        entry();
    }
    exit()
}

// ── Operations on the calling thread ────────────────────────────

/// The running thread of this CPU.
pub fn current() -> Arc<Thread> {
    Scheduler::this_cpu().current()
}

/// Id of the running thread, or `None` on a CPU without a scheduler.
pub fn current_id() -> Option<ThreadId> {
    Scheduler::for_lcpu(khal::cpu::id()).map(|sched| sched.current().id())
}

/// Gives the CPU to another ready thread, if any.
pub fn yield_now() {
    Scheduler::this_cpu().yield_now();
}

/// Terminates the calling thread.
pub fn exit() -> ! {
    Scheduler::this_cpu().exit_current()
}

/// Blocks the caller for at least `d`.
pub fn sleep(d: Duration) {
    sleep_until(clock::deadline_after(d));
}

/// Blocks the caller until `deadline` ([`clock::now`] units). Returns at
/// once for a deadline that has passed or is [`clock::NEVER`].
pub fn sleep_until(deadline: u64) {
    if deadline == clock::NEVER || clock::expired(deadline) {
        return;
    }
    let nobody = WaitQueue::new();
    let _ = nobody.wait_deadline(deadline, || false);
}
