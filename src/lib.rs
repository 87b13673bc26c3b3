//! Preemptive thread scheduler core: a bounded-heap ready queue behind two
//! interchangeable policies (strict priority with donation, and MLFQS),
//! plus the synchronization primitives built on top of it.
//!
//! Everything architecture-specific — the actual context switch, stack
//! memory, and interrupt masking — is pushed behind the traits in
//! [`collab`]; a host kernel implements them, this crate only does
//! bookkeeping.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod collab;
pub mod dispatcher;
pub mod donation;
pub mod fixed_point;
pub mod heap;
pub mod mlfqs;
pub mod sync;
pub mod thread;

pub use collab::{ContextSwitch, InterruptControl, InterruptLevel, StackAllocator};
pub use dispatcher::{Dispatcher, PolicyKind, SchedulerConfig, SchedulerManager};
pub use heap::HEAP_CAPACITY;
pub use sync::{CondVar, Lock, LockId, Semaphore};
pub use thread::{BlockReason, SpawnError, Thread, ThreadId, ThreadManager, ThreadState, ThreadStats};

/// Lowest valid priority.
pub const PRI_MIN: i32 = 0;
/// Priority newly created threads get under the strict-priority policy.
pub const PRI_DEFAULT: i32 = 31;
/// Highest valid priority.
pub const PRI_MAX: i32 = 63;

/// Lowest valid niceness under MLFQS.
pub const NICE_MIN: i32 = -20;
/// Niceness newly created threads get under MLFQS.
pub const NICE_DEFAULT: i32 = 0;
/// Highest valid niceness under MLFQS.
pub const NICE_MAX: i32 = 20;

/// Ticks a thread runs before the dispatcher forces a reschedule.
pub const TIME_SLICE_TICKS: u32 = 4;

#[cfg(test)]
mod integration_tests {
    use super::*;
    use alloc::boxed::Box;
    use collab::{GlobalStackAllocator, RecordingContextSwitch, SingleCpuInterruptControl};

    // The dispatcher lives in a single process-wide static, so tests that
    // touch it must not run concurrently with each other.
    static TEST_GUARD: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn init_priority_scheduler() {
        dispatcher::SchedulerManager::init(
            SchedulerConfig {
                policy: PolicyKind::Priority,
            },
            Box::new(SingleCpuInterruptControl::new()),
            Box::new(RecordingContextSwitch::new()),
        );
    }

    fn spawn(name: &str, priority: i32) -> ThreadId {
        let mut allocator = GlobalStackAllocator;
        ThreadManager::spawn(name, priority, 4096, &mut allocator).expect("spawn failed")
    }

    #[test]
    fn higher_priority_thread_runs_first() {
        let _guard = TEST_GUARD.lock().unwrap_or_else(|e| e.into_inner());
        init_priority_scheduler();
        let main = spawn("main", PRI_DEFAULT);
        assert_eq!(ThreadManager::current_id(), Some(main));
        let low = spawn("low", 10);
        let high = spawn("high", 50);

        // `main` (still running) goes back to the heap, `high` takes over.
        let next = dispatcher::with_dispatcher_mut(|d| d.reschedule());
        assert_eq!(next, Some(high));

        // Once `high` exits, `main` (priority 31) outranks `low` (10).
        dispatcher::with_dispatcher_mut(|d| d.retire(high, 0));
        let next = dispatcher::with_dispatcher_mut(|d| d.reschedule());
        assert_eq!(next, Some(main));

        // `main` goes back to the heap behind nothing else but `low`.
        let next = dispatcher::with_dispatcher_mut(|d| d.reschedule());
        assert_eq!(next, Some(low));
    }

    #[test]
    fn priority_donation_raises_holder_above_waiter() {
        let _guard = TEST_GUARD.lock().unwrap_or_else(|e| e.into_inner());
        init_priority_scheduler();
        let _main = spawn("main", PRI_DEFAULT);
        let lock = Lock::new();

        let low = spawn("low", 10);
        // Simulate `low` acquiring the lock while it is current.
        dispatcher::with_dispatcher_mut(|d| {
            d.threads.get_mut(&low).unwrap().state = thread::ThreadState::Running;
        });

        dispatcher::with_dispatcher_mut(|d| {
            let lock_state = d.locks.get_mut(&lock.id()).unwrap();
            lock_state.owner = Some(low);
        });
        dispatcher::with_dispatcher_mut(|d| {
            d.thread_mut(low).unwrap().holding_locks.push(lock.id());
        });

        let high = spawn("high", 50);
        dispatcher::with_dispatcher_mut(|d| donation::donate_for_wait(d, high, lock.id()));

        assert_eq!(ThreadManager::priority(low), Some(50));
    }

    #[test]
    fn mlfqs_priority_falls_as_recent_cpu_rises() {
        let _guard = TEST_GUARD.lock().unwrap_or_else(|e| e.into_inner());
        dispatcher::SchedulerManager::init(
            SchedulerConfig {
                policy: PolicyKind::Mlfqs,
            },
            Box::new(SingleCpuInterruptControl::new()),
            Box::new(RecordingContextSwitch::new()),
        );
        let main = spawn("main", PRI_DEFAULT);
        let before = ThreadManager::priority(main).unwrap();
        for _ in 0..400 {
            dispatcher::SchedulerManager::tick();
        }
        let after = ThreadManager::priority(main).unwrap();
        assert!(after <= before);
    }
}
