//! The dispatcher: mechanism (ready heap, current thread, ticks) plus the
//! two interchangeable policies (strict priority with donation, MLFQS).
//!
//! Policy is not a trait object here: the two policies are fixed at boot
//! and share almost all of their bookkeeping, so `PolicyKind` is a plain
//! enum matched on in the handful of places policy actually diverges
//! (`set_priority`, `on_tick`, a new thread's initial priority).

use alloc::boxed::Box;
use alloc::vec::Vec;
use alloc::collections::BTreeMap;

use crate::collab::{ContextSwitch, InterruptControl};
use crate::donation;
use crate::fixed_point::Fixed;
use crate::heap::{HeapEntry, PriorityHeap};
use crate::mlfqs;
use crate::sync::{LockId, LockState};
use crate::thread::{BlockReason, Thread, ThreadId, ThreadState, ThreadStats};
use crate::{NICE_DEFAULT, PRI_DEFAULT, TIME_SLICE_TICKS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    Priority,
    Mlfqs,
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub policy: PolicyKind,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            policy: PolicyKind::Priority,
        }
    }
}

/// Mechanism and policy state for one (single-CPU) scheduler instance.
pub struct Dispatcher {
    pub(crate) threads: BTreeMap<ThreadId, Thread>,
    pub(crate) ready: PriorityHeap,
    pub(crate) locks: BTreeMap<LockId, LockState>,
    next_lock_id: u64,
    fifo_counter: u64,
    current: Option<ThreadId>,
    ticks: u64,
    timeslice_remaining: u32,
    pub(crate) load_avg: Fixed,
    policy: PolicyKind,
    interrupt: Box<dyn InterruptControl>,
    context_switch: Box<dyn ContextSwitch>,
}

impl Dispatcher {
    pub fn new(
        config: SchedulerConfig,
        interrupt: Box<dyn InterruptControl>,
        context_switch: Box<dyn ContextSwitch>,
    ) -> Self {
        Dispatcher {
            threads: BTreeMap::new(),
            ready: PriorityHeap::new(),
            locks: BTreeMap::new(),
            next_lock_id: 1,
            fifo_counter: 0,
            current: None,
            ticks: 0,
            timeslice_remaining: TIME_SLICE_TICKS,
            load_avg: Fixed::ZERO,
            policy: config.policy,
            interrupt,
            context_switch,
        }
    }

    pub fn policy(&self) -> PolicyKind {
        self.policy
    }

    pub fn thread(&self, id: ThreadId) -> Option<&Thread> {
        self.threads.get(&id)
    }

    pub fn thread_mut(&mut self, id: ThreadId) -> Option<&mut Thread> {
        self.threads.get_mut(&id)
    }

    pub fn current_thread(&self) -> Option<ThreadId> {
        self.current
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    fn next_fifo(&mut self) -> u64 {
        self.fifo_counter += 1;
        self.fifo_counter
    }

    /// Admits a freshly created thread into the ready heap.
    pub fn admit(&mut self, mut thread: Thread) {
        if self.policy == PolicyKind::Mlfqs {
            thread.nice = NICE_DEFAULT;
            thread.priority = mlfqs::compute_priority(thread.recent_cpu, thread.nice);
        }
        let fifo = self.next_fifo();
        thread.last_fifo = fifo;
        let id = thread.id;
        let priority = thread.priority;
        self.threads.insert(id, thread);
        if self.current.is_none() {
            self.current = Some(id);
            self.threads.get_mut(&id).unwrap().state = ThreadState::Running;
        } else {
            self.push_ready(id, priority, fifo);
        }
    }

    /// Pushes `id` onto the ready heap. The heap is at a fixed capacity
    /// (`HEAP_CAPACITY`); a thread becomes READY iff it is in the heap, so
    /// a push that can't fit is a fatal invariant violation, not a
    /// recoverable error — there is no valid state to fall back to where
    /// the thread is READY but absent from the heap.
    fn push_ready(&mut self, id: ThreadId, priority: i32, fifo: u64) {
        self.ready
            .push(HeapEntry { tid: id, priority, fifo })
            .expect("ready heap full: exceeded HEAP_CAPACITY ready threads");
    }

    /// Re-admits `id` into the ready heap at its current effective
    /// priority, stamping a fresh fifo value.
    pub(crate) fn make_ready(&mut self, id: ThreadId) {
        let fifo = self.next_fifo();
        let priority = match self.threads.get_mut(&id) {
            Some(t) => {
                t.state = ThreadState::Ready;
                t.last_fifo = fifo;
                t.priority
            }
            None => return,
        };
        self.push_ready(id, priority, fifo);
    }

    /// Picks the next thread to run and performs the context switch,
    /// pushing the previously-running thread back onto the ready heap
    /// first (unless it blocked or exited). Returns the new current
    /// thread, or `None` if nothing was ready (idle).
    pub fn reschedule(&mut self) -> Option<ThreadId> {
        let prev = self.current;
        if let Some(prev_id) = prev {
            if let Some(t) = self.threads.get(&prev_id) {
                if t.state == ThreadState::Running {
                    self.make_ready(prev_id);
                }
            }
        }
        let next_entry = self.ready.pop();
        let next = next_entry.map(|e| e.tid);
        if let Some(next_id) = next {
            if let Some(t) = self.threads.get_mut(&next_id) {
                t.state = ThreadState::Running;
            }
        }
        self.current = next;
        self.timeslice_remaining = TIME_SLICE_TICKS;
        self.context_switch.switch(prev, next);
        self.current
    }

    pub fn block_current(&mut self, reason: BlockReason) {
        if let Some(id) = self.current {
            if let Some(t) = self.threads.get_mut(&id) {
                t.state = ThreadState::Blocked(reason);
                if let BlockReason::Lock(lock_id) = reason {
                    t.waiting_on_lock = Some(lock_id);
                }
            }
        }
    }

    pub fn wake(&mut self, id: ThreadId) {
        let blocked = matches!(
            self.threads.get(&id).map(|t| t.state),
            Some(ThreadState::Blocked(_))
        );
        if blocked {
            if let Some(t) = self.threads.get_mut(&id) {
                t.waiting_on_lock = None;
            }
            self.make_ready(id);
        }
    }

    pub fn retire(&mut self, id: ThreadId, exit_code: i32) {
        self.ready.remove(id);
        if let Some(t) = self.threads.get_mut(&id) {
            t.mark_terminated(exit_code);
        }
        if self.current == Some(id) {
            self.current = None;
        }
    }

    pub fn set_base_priority(&mut self, id: ThreadId, new_base_priority: i32) {
        if self.policy == PolicyKind::Mlfqs {
            return;
        }
        donation::set_base_priority_and_update(self, id, new_base_priority);
    }

    pub fn set_nice(&mut self, id: ThreadId, nice: i32) {
        if let Some(t) = self.threads.get_mut(&id) {
            t.nice = nice;
            if self.policy == PolicyKind::Mlfqs {
                let priority = mlfqs::compute_priority(t.recent_cpu, t.nice);
                t.priority = priority;
                self.reposition_if_ready(id);
            }
        }
    }

    pub(crate) fn reposition_if_ready(&mut self, id: ThreadId) {
        if let Some(entry) = self.ready.remove(id) {
            let priority = self.threads.get(&id).map(|t| t.priority).unwrap_or(entry.priority);
            self.push_ready(id, priority, entry.fifo);
        }
    }

    pub fn load_avg_x100(&self) -> i32 {
        self.load_avg.mul_int(100).round()
    }

    pub fn recent_cpu_x100(&self, id: ThreadId) -> Option<i32> {
        self.thread(id).map(|t| t.recent_cpu.mul_int(100).round())
    }

    pub fn all_thread_stats(&self) -> Vec<ThreadStats> {
        self.threads
            .values()
            .map(|t| ThreadStats {
                id: t.id,
                name: t.name.clone(),
                state: t.state,
                priority: t.priority,
                cpu_time_ticks: t.cpu_time_ticks,
            })
            .collect()
    }

    /// Advances the tick count; returns `true` if the caller should
    /// reschedule (timeslice expired, or MLFQS recomputed priorities).
    pub fn on_tick(&mut self) -> bool {
        self.ticks += 1;
        if let Some(id) = self.current {
            if let Some(t) = self.threads.get_mut(&id) {
                t.cpu_time_ticks += 1;
                if self.policy == PolicyKind::Mlfqs {
                    t.recent_cpu = t.recent_cpu.add_int(1);
                }
            }
        }

        let mut need_resched = false;
        if self.policy == PolicyKind::Mlfqs {
            // Every tick: the running thread's recent_cpu just grew, so its
            // priority is recomputed immediately, not deferred.
            if let Some(id) = self.current {
                if let Some(t) = self.threads.get(&id) {
                    let priority = mlfqs::compute_priority(t.recent_cpu, t.nice);
                    if priority != t.priority {
                        self.threads.get_mut(&id).unwrap().priority = priority;
                        need_resched = true;
                    }
                }
            }
            // Once per second: recompute load_avg, then recent_cpu and
            // priority for every thread.
            if self.ticks % mlfqs::TICKS_PER_SECOND as u64 == 0 {
                mlfqs::recompute_load_avg(self);
                mlfqs::recompute_all_recent_cpu(self);
                mlfqs::recompute_all_priorities(self);
                need_resched = true;
            }
        }

        if self.timeslice_remaining > 0 {
            self.timeslice_remaining -= 1;
        }
        if self.timeslice_remaining == 0 {
            need_resched = true;
        }
        need_resched
    }

    /// Highest-priority thread currently waiting on `lock_id`, if any.
    pub fn highest_priority_waiter(&self, lock_id: LockId) -> Option<ThreadId> {
        let lock = self.locks.get(&lock_id)?;
        lock.waiters
            .iter()
            .copied()
            .max_by_key(|tid| self.thread(*tid).map(|t| t.priority).unwrap_or(i32::MIN))
    }

    pub fn next_lock_id(&mut self) -> LockId {
        let id = LockId::from_raw(self.next_lock_id);
        self.next_lock_id += 1;
        id
    }

    pub fn interrupt_control(&self) -> &dyn InterruptControl {
        self.interrupt.as_ref()
    }
}

static DISPATCHER: spin::Mutex<Option<Dispatcher>> = spin::Mutex::new(None);

pub fn with_dispatcher<F, R>(f: F) -> R
where
    F: FnOnce(&Dispatcher) -> R,
{
    let guard = DISPATCHER.lock();
    let dispatcher = guard.as_ref().expect("dispatcher not initialized");
    f(dispatcher)
}

pub fn with_dispatcher_mut<F, R>(f: F) -> R
where
    F: FnOnce(&mut Dispatcher) -> R,
{
    let mut guard = DISPATCHER.lock();
    let dispatcher = guard.as_mut().expect("dispatcher not initialized");
    f(dispatcher)
}

/// Namespace for boot-time init and the operations every thread calls to
/// interact with the scheduler: yield, sleep, block, wake.
pub struct SchedulerManager;

impl SchedulerManager {
    pub fn init(
        config: SchedulerConfig,
        interrupt: Box<dyn InterruptControl>,
        context_switch: Box<dyn ContextSwitch>,
    ) {
        let mut guard = DISPATCHER.lock();
        *guard = Some(Dispatcher::new(config, interrupt, context_switch));
        log::info!("dispatcher initialized with policy {:?}", config.policy);
    }

    pub fn is_initialized() -> bool {
        DISPATCHER.lock().is_some()
    }

    /// Voluntarily gives up the CPU, re-entering the ready heap at the
    /// current effective priority.
    pub fn yield_now() {
        with_dispatcher_mut(|d| {
            log::debug!("thread {:?} yielding", d.current_thread());
            d.reschedule();
        });
    }

    pub fn block_current(reason: BlockReason) {
        with_dispatcher_mut(|d| d.block_current(reason));
        Self::yield_now();
    }

    pub fn wake(id: ThreadId) {
        with_dispatcher_mut(|d| {
            log::debug!("waking thread {}", id);
            d.wake(id);
        });
    }

    /// Called once per timer tick. Returns whether a reschedule happened.
    pub fn tick() -> bool {
        let need_resched = with_dispatcher_mut(|d| d.on_tick());
        if need_resched {
            with_dispatcher_mut(|d| {
                d.reschedule();
            });
        }
        need_resched
    }

    pub fn current() -> Option<ThreadId> {
        with_dispatcher(|d| d.current_thread())
    }

    pub fn load_avg_x100() -> i32 {
        with_dispatcher(|d| d.load_avg_x100())
    }

    pub fn policy() -> PolicyKind {
        with_dispatcher(|d| d.policy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{RecordingContextSwitch, SingleCpuInterruptControl};

    fn new_dispatcher(policy: PolicyKind) -> Dispatcher {
        Dispatcher::new(
            SchedulerConfig { policy },
            Box::new(SingleCpuInterruptControl::new()),
            Box::new(RecordingContextSwitch::new()),
        )
    }

    fn make_thread(id: u64, priority: i32) -> Thread {
        Thread {
            id: ThreadId::from_raw(id),
            name: alloc::string::String::from("t"),
            state: ThreadState::Ready,
            base_priority: priority,
            priority,
            nice: 0,
            recent_cpu: Fixed::ZERO,
            stack: alloc::vec![0u8; 16].into_boxed_slice(),
            cpu_time_ticks: 0,
            holding_locks: Vec::new(),
            waiting_on_lock: None,
            last_fifo: 0,
            exit_code: None,
        }
    }

    #[test]
    fn blocked_thread_leaves_ready_heap_until_woken() {
        let mut d = new_dispatcher(PolicyKind::Priority);
        d.admit(make_thread(1, PRI_DEFAULT)); // becomes current
        let blocked = ThreadId::from_raw(1);
        d.admit(make_thread(2, 20));

        d.block_current(BlockReason::Semaphore);
        assert_eq!(
            d.thread(blocked).unwrap().state,
            ThreadState::Blocked(BlockReason::Semaphore)
        );
        // Blocking alone does not switch away; that is reschedule()'s job.
        let next = d.reschedule();
        assert_eq!(next, Some(ThreadId::from_raw(2)));
        assert!(d.ready.iter().all(|e| e.tid != blocked));

        d.wake(blocked);
        assert_eq!(d.thread(blocked).unwrap().state, ThreadState::Ready);
        assert!(d.ready.iter().any(|e| e.tid == blocked));
    }

    #[test]
    fn retire_removes_thread_from_ready_heap() {
        let mut d = new_dispatcher(PolicyKind::Priority);
        d.admit(make_thread(1, PRI_DEFAULT));
        d.admit(make_thread(2, 20));
        let victim = ThreadId::from_raw(2);
        d.retire(victim, 0);
        assert!(d.ready.iter().all(|e| e.tid != victim));
        assert_eq!(d.thread(victim).unwrap().state, ThreadState::Terminated);
    }

    #[test]
    fn mlfqs_recomputes_running_thread_priority_every_tick() {
        let mut d = new_dispatcher(PolicyKind::Mlfqs);
        d.admit(make_thread(1, PRI_DEFAULT));
        let base = d.thread(ThreadId::from_raw(1)).unwrap().priority;

        let mut prev = base;
        let mut moved_before_tick_four = false;
        for _ in 0..4 {
            d.on_tick();
            let priority = d.thread(ThreadId::from_raw(1)).unwrap().priority;
            assert!(priority <= prev, "priority must never rise while recent_cpu only grows");
            if priority < base {
                moved_before_tick_four = true;
            }
            prev = priority;
        }
        assert!(
            moved_before_tick_four,
            "priority must be recomputed every tick, not deferred to a multiple of four"
        );
    }

    #[test]
    fn set_base_priority_is_noop_under_mlfqs() {
        let mut d = new_dispatcher(PolicyKind::Mlfqs);
        d.admit(make_thread(1, PRI_DEFAULT));
        let before = d.thread(ThreadId::from_raw(1)).unwrap().priority;
        d.set_base_priority(ThreadId::from_raw(1), 5);
        assert_eq!(d.thread(ThreadId::from_raw(1)).unwrap().priority, before);
    }
}
