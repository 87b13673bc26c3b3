//! Thread objects and their lifecycle.
//!
//! `ThreadManager` is the public namespace for everything that creates,
//! inspects, or tears down threads; it never touches the ready heap or the
//! policy directly, it delegates to the global [`crate::dispatcher`].

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::collab::StackAllocator;
use crate::dispatcher::{with_dispatcher, with_dispatcher_mut};
use crate::sync::LockId;

/// Monotonically increasing, non-zero thread identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(u64);

impl ThreadId {
    /// Constructs a `ThreadId` from a raw value. Only meant for tests and
    /// for the allocator in this module; callers never mint their own ids.
    pub fn from_raw(raw: u64) -> ThreadId {
        ThreadId(raw)
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

fn allocate_thread_id() -> ThreadId {
    ThreadId(NEXT_THREAD_ID.fetch_add(1, Ordering::SeqCst))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    Semaphore,
    Lock(LockId),
    CondVar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Ready,
    Running,
    Blocked(BlockReason),
    Terminated,
}

/// A single schedulable thread.
pub struct Thread {
    pub id: ThreadId,
    pub name: String,
    pub state: ThreadState,
    pub base_priority: i32,
    /// Effective priority: `max(base_priority, donations)`. Recomputed by
    /// [`crate::donation`] whenever a donor's priority changes.
    pub priority: i32,
    pub nice: i32,
    pub recent_cpu: crate::fixed_point::Fixed,
    pub stack: Box<[u8]>,
    pub cpu_time_ticks: u64,
    /// Locks currently held by this thread; donation walks these to find
    /// what priority this thread owes its waiters.
    pub holding_locks: Vec<LockId>,
    /// The single lock this thread is blocked acquiring, if any. `None`
    /// while `state` is not `Blocked(BlockReason::Lock(_))`.
    pub waiting_on_lock: Option<LockId>,
    /// Fifo stamp assigned the last time this thread entered the ready
    /// heap; used to break priority ties.
    pub last_fifo: u64,
    pub(crate) exit_code: Option<i32>,
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("priority", &self.priority)
            .field("base_priority", &self.base_priority)
            .field("nice", &self.nice)
            .finish()
    }
}

pub struct ThreadStats {
    pub id: ThreadId,
    pub name: String,
    pub state: ThreadState,
    pub priority: i32,
    pub cpu_time_ticks: u64,
}

/// Namespace for thread creation, exit, and inspection. No instances of
/// this type ever exist; every method operates on the global dispatcher.
pub struct ThreadManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    StackAllocationFailed,
}

impl ThreadManager {
    /// Creates a new thread in the `Ready` state with the given name and
    /// base priority, using `allocator` to obtain its stack.
    pub fn spawn(
        name: &str,
        base_priority: i32,
        stack_size: usize,
        allocator: &mut dyn StackAllocator,
    ) -> Result<ThreadId, SpawnError> {
        let stack = allocator
            .alloc_stack(stack_size)
            .ok_or(SpawnError::StackAllocationFailed)?;
        let id = allocate_thread_id();
        let thread = Thread {
            id,
            name: String::from(name),
            state: ThreadState::Ready,
            base_priority,
            priority: base_priority,
            nice: 0,
            recent_cpu: crate::fixed_point::Fixed::ZERO,
            stack,
            cpu_time_ticks: 0,
            holding_locks: Vec::new(),
            waiting_on_lock: None,
            last_fifo: 0,
            exit_code: None,
        };
        log::info!("thread {} ({}) created at priority {}", id, name, base_priority);
        with_dispatcher_mut(|d| d.admit(thread));
        Ok(id)
    }

    /// Terminates the calling thread. Never returns.
    pub fn exit(exit_code: i32) -> ! {
        let id = Self::current_id().expect("thread_exit called with no current thread");
        log::info!("thread {} exiting with code {}", id, exit_code);
        with_dispatcher_mut(|d| d.retire(id, exit_code));
        crate::dispatcher::SchedulerManager::yield_now();
        unreachable!("retired thread was rescheduled")
    }

    pub fn current_id() -> Option<ThreadId> {
        with_dispatcher(|d| d.current_thread())
    }

    pub fn with_current<F, R>(f: F) -> Option<R>
    where
        F: FnOnce(&Thread) -> R,
    {
        with_dispatcher(|d| {
            let id = d.current_thread()?;
            d.thread(id).map(f)
        })
    }

    pub fn priority(id: ThreadId) -> Option<i32> {
        with_dispatcher(|d| d.thread(id).map(|t| t.priority))
    }

    /// Sets a thread's base priority. Under MLFQS this is a no-op: nice
    /// values, not direct priority sets, drive priority there. Always
    /// yields afterward, even if the new priority didn't change anything
    /// visible — a thread lowering its own priority below a ready thread's
    /// needs to give that thread a chance to run.
    pub fn set_priority(id: ThreadId, new_base_priority: i32) {
        with_dispatcher_mut(|d| d.set_base_priority(id, new_base_priority));
        crate::dispatcher::SchedulerManager::yield_now();
    }

    pub fn set_nice(id: ThreadId, nice: i32) {
        with_dispatcher_mut(|d| d.set_nice(id, nice));
    }

    pub fn nice(id: ThreadId) -> Option<i32> {
        with_dispatcher(|d| d.thread(id).map(|t| t.nice))
    }

    pub fn stats() -> Vec<ThreadStats> {
        with_dispatcher(|d| d.all_thread_stats())
    }

    pub(crate) fn exit_code(id: ThreadId) -> Option<i32> {
        with_dispatcher(|d| d.thread(id).and_then(|t| t.exit_code))
    }
}

impl Thread {
    pub(crate) fn mark_terminated(&mut self, exit_code: i32) {
        self.state = ThreadState::Terminated;
        self.exit_code = Some(exit_code);
    }
}
