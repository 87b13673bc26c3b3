//! MLFQS (multi-level feedback queue scheduler) policy formulas.
//!
//! Ported directly from the reference scheduler's `thread_calc_priority`,
//! `thread_calc_recent_cpu`, and `thread_calc_load_avg`, expressed over
//! [`crate::fixed_point::Fixed`]. Called only when the dispatcher was
//! configured with [`crate::dispatcher::PolicyKind::Mlfqs`]; the strict
//! priority-with-donation policy never touches this module.

use crate::dispatcher::Dispatcher;
use crate::fixed_point::Fixed;
use crate::{PRI_MAX, PRI_MIN};

/// Load average, recent_cpu, and every thread's priority are recomputed
/// once per second of ticks, at the reference timer rate.
pub const TICKS_PER_SECOND: u32 = 60;

/// `priority = PRI_MAX - (recent_cpu / 4) - nice * 2`, clamped to the
/// valid priority range.
pub fn compute_priority(recent_cpu: Fixed, nice: i32) -> i32 {
    let computed = PRI_MAX - recent_cpu.div_int(4).round() - nice * 2;
    computed.clamp(PRI_MIN, PRI_MAX)
}

/// `recent_cpu' = (2*load_avg) / (2*load_avg + 1) * recent_cpu + nice`
fn decay_recent_cpu(recent_cpu: Fixed, load_avg: Fixed, nice: i32) -> Fixed {
    let coefficient = load_avg.mul_int(2).div(load_avg.mul_int(2).add_int(1));
    coefficient.mul(recent_cpu).add_int(nice)
}

/// `load_avg' = (59/60) * load_avg + (1/60) * ready_threads`, where
/// `ready_threads` counts the running thread plus everything in the ready
/// heap (but not the idle thread bookkeeping, since this crate has no
/// dedicated idle thread concept — every admitted thread counts).
pub fn recompute_load_avg(dispatcher: &mut Dispatcher) {
    let ready_threads = dispatcher.ready.len() as i32 + if dispatcher.current_thread().is_some() { 1 } else { 0 };
    let fifty_nine_sixtieths = Fixed::from_int(59).div_int(60);
    let one_sixtieth = Fixed::from_int(1).div_int(60);
    dispatcher.load_avg = fifty_nine_sixtieths
        .mul(dispatcher.load_avg)
        .add(one_sixtieth.mul_int(ready_threads));
    log::debug!("mlfqs: load_avg recomputed to {}", dispatcher.load_avg_x100());
}

pub fn recompute_all_recent_cpu(dispatcher: &mut Dispatcher) {
    let load_avg = dispatcher.load_avg;
    for thread in dispatcher.threads.values_mut() {
        thread.recent_cpu = decay_recent_cpu(thread.recent_cpu, load_avg, thread.nice);
    }
}

pub fn recompute_all_priorities(dispatcher: &mut Dispatcher) {
    let ids: alloc::vec::Vec<_> = dispatcher.threads.keys().copied().collect();
    for id in ids {
        let new_priority = dispatcher
            .thread(id)
            .map(|t| compute_priority(t.recent_cpu, t.nice));
        if let Some(priority) = new_priority {
            if let Some(t) = dispatcher.thread_mut(id) {
                t.priority = priority;
            }
            dispatcher.reposition_if_ready(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_decreases_with_recent_cpu() {
        let low = compute_priority(Fixed::ZERO, 0);
        let high_cpu = compute_priority(Fixed::from_int(40), 0);
        assert!(high_cpu < low);
    }

    #[test]
    fn priority_decreases_with_nice() {
        let nice_zero = compute_priority(Fixed::ZERO, 0);
        let nice_high = compute_priority(Fixed::ZERO, 10);
        assert!(nice_high < nice_zero);
    }

    #[test]
    fn priority_clamped_to_range() {
        let extreme = compute_priority(Fixed::from_int(1000), 20);
        assert_eq!(extreme, PRI_MIN);
    }

    #[test]
    fn recent_cpu_decays_toward_zero_with_idle_load() {
        let decayed = decay_recent_cpu(Fixed::from_int(100), Fixed::ZERO, 0);
        assert_eq!(decayed.trunc(), 0);
    }
}
