//! Synchronization primitives built on top of the dispatcher's block/wake
//! machinery: counting semaphores, an owned lock with priority donation,
//! and condition variables.
//!
//! The waiter-list shape is a small vector of waiting thread ids that
//! gets drained on wake, the same structure as a per-channel I/O wait
//! queue, generalized here from "waiting for a named I/O channel" to
//! "waiting for a semaphore/lock/condvar".

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::dispatcher::{with_dispatcher_mut, SchedulerManager};
use crate::donation;
use crate::thread::{BlockReason, ThreadId, ThreadManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockId(u64);

impl LockId {
    pub fn from_raw(raw: u64) -> LockId {
        LockId(raw)
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }
}

/// Donation bookkeeping for one lock: who holds it, who is waiting.
/// Lives in the dispatcher's lock table, not inside [`Lock`] itself, so
/// [`crate::donation`] can walk it without going through a second type.
pub struct LockState {
    pub owner: Option<ThreadId>,
    pub waiters: Vec<ThreadId>,
}

/// A counting semaphore. Waiters are woken in priority order, not FIFO
/// order, so synchronization primitives respect priority the same way the
/// ready heap does.
pub struct Semaphore {
    inner: spin::Mutex<SemaphoreInner>,
}

struct SemaphoreInner {
    count: u32,
    waiters: Vec<ThreadId>,
}

impl Semaphore {
    pub const fn new(value: u32) -> Self {
        Semaphore {
            inner: spin::Mutex::new(SemaphoreInner {
                count: value,
                waiters: Vec::new(),
            }),
        }
    }

    /// Blocks until the semaphore's count is positive, then decrements it.
    pub fn down(&self) {
        let current = ThreadManager::current_id().expect("sema_down with no current thread");
        loop {
            let acquired = {
                let mut inner = self.inner.lock();
                if inner.count > 0 {
                    inner.count -= 1;
                    true
                } else {
                    if !inner.waiters.contains(&current) {
                        inner.waiters.push(current);
                    }
                    false
                }
            };
            if acquired {
                return;
            }
            SchedulerManager::block_current(BlockReason::Semaphore);
        }
    }

    /// Non-blocking variant: decrements and returns `true` only if the
    /// count was already positive.
    pub fn try_down(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.count > 0 {
            inner.count -= 1;
            true
        } else {
            false
        }
    }

    /// Increments the count and wakes the highest-priority waiter, if any.
    pub fn up(&self) {
        let woken = {
            let mut inner = self.inner.lock();
            inner.count += 1;
            if inner.waiters.is_empty() {
                None
            } else {
                let idx = inner
                    .waiters
                    .iter()
                    .enumerate()
                    .max_by_key(|(_, tid)| ThreadManager::priority(**tid).unwrap_or(i32::MIN))
                    .map(|(idx, _)| idx)
                    .unwrap();
                Some(inner.waiters.remove(idx))
            }
        };
        if let Some(tid) = woken {
            SchedulerManager::wake(tid);
        }
    }

    pub fn count(&self) -> u32 {
        self.inner.lock().count
    }
}

/// A binary lock with priority donation: the current holder's effective
/// priority is raised to match the highest-priority thread waiting on it.
pub struct Lock {
    id: LockId,
}

impl Lock {
    pub fn new() -> Lock {
        let id = with_dispatcher_mut(|d| {
            let id = d.next_lock_id();
            d.locks.insert(
                id,
                LockState {
                    owner: None,
                    waiters: Vec::new(),
                },
            );
            id
        });
        Lock { id }
    }

    pub fn id(&self) -> LockId {
        self.id
    }

    pub fn is_held_by_current(&self) -> bool {
        let current = ThreadManager::current_id();
        with_dispatcher_mut(|d| d.locks.get(&self.id).map(|l| l.owner) == Some(current))
    }

    pub fn acquire(&self) {
        let current = ThreadManager::current_id().expect("lock_acquire with no current thread");
        loop {
            let acquired = with_dispatcher_mut(|d| {
                let lock = d.locks.get_mut(&self.id).expect("lock missing");
                if lock.owner.is_none() {
                    lock.owner = Some(current);
                    true
                } else {
                    false
                }
            });
            if acquired {
                with_dispatcher_mut(|d| {
                    if let Some(t) = d.thread_mut(current) {
                        t.holding_locks.push(self.id);
                    }
                });
                log::debug!("thread {} acquired lock {}", current, self.id.0);
                return;
            }
            with_dispatcher_mut(|d| donation::donate_for_wait(d, current, self.id));
            SchedulerManager::block_current(BlockReason::Lock(self.id));
        }
    }

    pub fn release(&self) {
        let current = ThreadManager::current_id().expect("lock_release with no current thread");
        let next_owner = with_dispatcher_mut(|d| {
            {
                let lock = d.locks.get(&self.id).expect("lock missing");
                assert_eq!(lock.owner, Some(current), "lock_release by non-owner");
            }
            if let Some(t) = d.thread_mut(current) {
                t.holding_locks.retain(|l| *l != self.id);
            }
            let next = d.highest_priority_waiter(self.id);
            let lock = d.locks.get_mut(&self.id).unwrap();
            lock.owner = next;
            if let Some(n) = next {
                lock.waiters.retain(|w| *w != n);
            }
            next
        });
        with_dispatcher_mut(|d| donation::revoke_for_release(d, current));
        if let Some(n) = next_owner {
            with_dispatcher_mut(|d| {
                if let Some(t) = d.thread_mut(n) {
                    t.waiting_on_lock = None;
                    t.holding_locks.push(self.id);
                }
                donation::update_priority(d, n);
            });
            SchedulerManager::wake(n);
        }
        log::debug!("thread {} released lock {}", current, self.id.0);
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

/// A condition variable paired with an external [`Lock`], in the classic
/// Mesa-style: `wait` must be called with the lock held, releases it
/// while blocked, and reacquires it before returning.
///
/// Each waiter gets its own private, zero-valued semaphore, pushed onto
/// the condvar's waiter list and blocked on directly; `signal` pops
/// the highest-priority entry and ups its semaphore. This is the same
/// "semaphore per waiter" shape as the reference condvar implementation,
/// just heap-allocated (`Arc`) instead of living on the waiter's stack.
pub struct CondVar {
    waiters: spin::Mutex<Vec<(ThreadId, Arc<Semaphore>)>>,
}

impl CondVar {
    pub const fn new() -> Self {
        CondVar {
            waiters: spin::Mutex::new(Vec::new()),
        }
    }

    pub fn wait(&self, lock: &Lock) {
        assert!(lock.is_held_by_current(), "cond_wait without holding lock");
        let current = ThreadManager::current_id().expect("cond_wait with no current thread");
        let sema = Arc::new(Semaphore::new(0));
        // Register before releasing the lock so a racing signal cannot be
        // missed between the release and the block.
        self.waiters.lock().push((current, sema.clone()));
        lock.release();
        sema.down();
        lock.acquire();
    }

    /// Wakes the highest-priority waiter, if any.
    pub fn signal(&self) {
        let woken = {
            let mut waiters = self.waiters.lock();
            if waiters.is_empty() {
                None
            } else {
                let idx = waiters
                    .iter()
                    .enumerate()
                    .max_by_key(|(_, (tid, _))| ThreadManager::priority(*tid).unwrap_or(i32::MIN))
                    .map(|(idx, _)| idx)
                    .unwrap();
                Some(waiters.remove(idx))
            }
        };
        if let Some((_, sema)) = woken {
            sema.up();
        }
    }

    pub fn broadcast(&self) {
        let drained: Vec<_> = self.waiters.lock().drain(..).collect();
        for (_, sema) in drained {
            sema.up();
        }
    }
}

impl Default for CondVar {
    fn default() -> Self {
        Self::new()
    }
}
