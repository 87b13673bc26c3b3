//! Priority donation: an effective priority is always
//! `max(base_priority, donor priorities)`, propagated transitively up a
//! chain of lock holders. Entirely bypassed under MLFQS, which computes
//! priority from `recent_cpu`/`nice` instead.

use crate::dispatcher::{Dispatcher, PolicyKind};
use crate::sync::LockId;
use crate::thread::ThreadId;

/// Computes the priority a thread owes its waiters: the highest priority
/// among threads blocked on any lock this thread holds.
fn donor_priority(dispatcher: &Dispatcher, holder: ThreadId) -> Option<i32> {
    let thread = dispatcher.thread(holder)?;
    thread
        .holding_locks
        .iter()
        .filter_map(|lock_id| dispatcher.locks.get(lock_id))
        .flat_map(|lock| lock.waiters.iter())
        .filter_map(|waiter| dispatcher.thread(*waiter).map(|t| t.priority))
        .max()
}

/// Recomputes `thread_id`'s effective priority from its base priority and
/// current donors, repositions it in the ready heap if it is ready, and —
/// as long as its priority actually changed — walks up the lock-wait
/// chain (the lock `thread_id` is itself blocked on, that lock's owner,
/// the lock *that* owner is blocked on, and so on) to re-donate all the
/// way to the end. The chain is acyclic (a thread can't wait on a lock it
/// holds), so this always terminates; there is no depth limit, since
/// nothing about priority donation promises to stop partway through a
/// long chain.
pub fn update_priority(dispatcher: &mut Dispatcher, thread_id: ThreadId) {
    let mut current = thread_id;
    loop {
        let Some(thread) = dispatcher.thread(current) else {
            return;
        };
        let base = thread.base_priority;
        let waiting_on_lock = thread.waiting_on_lock;
        let new_priority = donor_priority(dispatcher, current)
            .map(|donor| donor.max(base))
            .unwrap_or(base);

        let changed = dispatcher.thread(current).map(|t| t.priority) != Some(new_priority);
        if let Some(t) = dispatcher.thread_mut(current) {
            t.priority = new_priority;
        }
        dispatcher.reposition_if_ready(current);

        if !changed {
            return;
        }
        match waiting_on_lock.and_then(|lock_id| dispatcher.locks.get(&lock_id)?.owner) {
            Some(owner) => current = owner,
            None => return,
        }
    }
}

/// Registers `waiter` as blocked on `lock_id` and donates its priority up
/// the chain to whoever currently holds the lock.
pub fn donate_for_wait(dispatcher: &mut Dispatcher, waiter: ThreadId, lock_id: LockId) {
    if let Some(lock) = dispatcher.locks.get_mut(&lock_id) {
        if !lock.waiters.contains(&waiter) {
            lock.waiters.push(waiter);
        }
    }
    if let Some(t) = dispatcher.thread_mut(waiter) {
        t.waiting_on_lock = Some(lock_id);
    }
    if let Some(owner) = dispatcher.locks.get(&lock_id).and_then(|l| l.owner) {
        update_priority(dispatcher, owner);
    }
}

/// Called after a lock is released: drops the donation this lock was
/// contributing and recomputes the former holder's effective priority
/// from its remaining held locks.
pub fn revoke_for_release(dispatcher: &mut Dispatcher, former_holder: ThreadId) {
    update_priority(dispatcher, former_holder);
}

pub fn set_base_priority_and_update(
    dispatcher: &mut Dispatcher,
    thread_id: ThreadId,
    new_base_priority: i32,
) {
    if dispatcher.policy() == PolicyKind::Mlfqs {
        return;
    }
    if let Some(t) = dispatcher.thread_mut(thread_id) {
        t.base_priority = new_base_priority;
    }
    update_priority(dispatcher, thread_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{RecordingContextSwitch, SingleCpuInterruptControl};
    use crate::dispatcher::SchedulerConfig;
    use crate::fixed_point::Fixed;
    use crate::sync::LockState;
    use crate::thread::{Thread, ThreadState};
    use alloc::boxed::Box;
    use alloc::vec::Vec;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(
            SchedulerConfig {
                policy: PolicyKind::Priority,
            },
            Box::new(SingleCpuInterruptControl::new()),
            Box::new(RecordingContextSwitch::new()),
        )
    }

    fn thread(id: u64, priority: i32) -> Thread {
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

    /// low holds a lock that mid waits on, mid holds a lock that high
    /// waits on: high's priority must propagate all the way down to low.
    #[test]
    fn donation_propagates_transitively() {
        let mut d = dispatcher();
        d.admit(thread(1, 10)); // low, becomes current
        d.admit(thread(2, 20)); // mid
        d.admit(thread(3, 30)); // high

        let low = ThreadId::from_raw(1);
        let mid = ThreadId::from_raw(2);
        let high = ThreadId::from_raw(3);

        let lock_a = d.next_lock_id();
        d.locks.insert(lock_a, LockState { owner: Some(low), waiters: Vec::new() });
        d.thread_mut(low).unwrap().holding_locks.push(lock_a);

        let lock_b = d.next_lock_id();
        d.locks.insert(lock_b, LockState { owner: Some(mid), waiters: Vec::new() });
        d.thread_mut(mid).unwrap().holding_locks.push(lock_b);

        // mid blocks on lock_a (held by low).
        donate_for_wait(&mut d, mid, lock_a);
        assert_eq!(d.thread(low).unwrap().priority, 20);

        // high blocks on lock_b (held by mid); low should now inherit 30.
        donate_for_wait(&mut d, high, lock_b);
        assert_eq!(d.thread(mid).unwrap().priority, 30);
        assert_eq!(d.thread(low).unwrap().priority, 30);
    }

    #[test]
    fn releasing_last_donated_lock_restores_base_priority() {
        let mut d = dispatcher();
        d.admit(thread(1, 10));
        d.admit(thread(2, 20));
        let low = ThreadId::from_raw(1);
        let high = ThreadId::from_raw(2);

        let lock_a = d.next_lock_id();
        d.locks.insert(lock_a, LockState { owner: Some(low), waiters: Vec::new() });
        d.thread_mut(low).unwrap().holding_locks.push(lock_a);
        donate_for_wait(&mut d, high, lock_a);
        assert_eq!(d.thread(low).unwrap().priority, 20);

        d.thread_mut(low).unwrap().holding_locks.clear();
        revoke_for_release(&mut d, low);
        assert_eq!(d.thread(low).unwrap().priority, 10);
    }
}
