//! Phase-flipping arrival barrier with a transaction-byte counter
//!
//! A phase completes once every expected arrival has been made and every
//! expected transaction byte has landed. Waiters name the parity of the
//! phase they wait on; a phase of parity `p` has completed when the current
//! phase parity differs from `p`.
//!
//! Both barriers here can be poisoned when a thread that would have arrived
//! on them has crashed. A poisoned barrier wakes every waiter, and a wait on
//! it panics instead of blocking forever.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
struct BarrierState {
    pending_arrivals: u32,
    /// May go negative when bytes land before they are announced
    pending_tx: i64,
    phase: u32,
    poisoned: bool,
}

#[derive(Debug)]
pub struct Mbarrier {
    arrival_count: u32,
    state: Mutex<BarrierState>,
    completed: Condvar,
}

impl Mbarrier {
    pub fn new(arrival_count: u32) -> Self {
        Self {
            arrival_count,
            state: Mutex::new(BarrierState {
                pending_arrivals: arrival_count,
                pending_tx: 0,
                phase: 0,
                poisoned: false,
            }),
            completed: Condvar::new(),
        }
    }

    pub fn arrival_count(&self) -> u32 {
        self.arrival_count
    }

    fn lock(&self) -> MutexGuard<'_, BarrierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_complete(&self, state: &mut BarrierState) {
        if state.pending_arrivals == 0 && state.pending_tx == 0 {
            state.phase = state.phase.wrapping_add(1);
            state.pending_arrivals = self.arrival_count;
            self.completed.notify_all();
        }
    }

    pub fn arrive(&self) {
        self.arrive_and_expect_tx(0);
    }

    /// Arrive once and announce `bytes` more transaction bytes for this phase
    pub fn arrive_and_expect_tx(&self, bytes: usize) {
        let mut state = self.lock();
        state.pending_tx += bytes as i64;
        state.pending_arrivals = state.pending_arrivals.saturating_sub(1);
        self.try_complete(&mut state);
    }

    /// Account for `bytes` transaction bytes that have landed
    pub fn complete_tx(&self, bytes: usize) {
        let mut state = self.lock();
        state.pending_tx -= bytes as i64;
        self.try_complete(&mut state);
    }

    /// Non-blocking peek: has the phase of parity `parity` completed?
    pub fn try_wait(&self, parity: u32) -> bool {
        self.lock().phase & 1 != parity & 1
    }

    /// Block until the phase of parity `parity` has completed
    pub fn wait(&self, parity: u32) {
        let state = self.lock();
        let state = self
            .completed
            .wait_while(state, |s| !s.poisoned && s.phase & 1 == parity & 1)
            .unwrap_or_else(PoisonError::into_inner);
        let abandoned = state.phase & 1 == parity & 1;
        drop(state);
        if abandoned {
            panic!("barrier abandoned by a crashed thread");
        }
    }

    /// Number of phases completed so far
    pub fn phase(&self) -> u32 {
        self.lock().phase
    }

    pub fn poison(&self) {
        self.lock().poisoned = true;
        self.completed.notify_all();
    }
}

#[derive(Debug)]
struct SyncState {
    arrived: usize,
    generation: u64,
    poisoned: bool,
}

/// Reusable rendezvous of a fixed number of threads
#[derive(Debug)]
pub struct LaneBarrier {
    parties: usize,
    state: Mutex<SyncState>,
    released: Condvar,
}

impl LaneBarrier {
    pub fn new(parties: usize) -> Self {
        Self {
            parties,
            state: Mutex::new(SyncState {
                arrived: 0,
                generation: 0,
                poisoned: false,
            }),
            released: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until all parties have called `wait` for this generation
    pub fn wait(&self) {
        let mut state = self.lock();
        let generation = state.generation;
        if !state.poisoned {
            state.arrived += 1;
            if state.arrived == self.parties {
                state.arrived = 0;
                state.generation += 1;
                self.released.notify_all();
                return;
            }
            state = self
                .released
                .wait_while(state, |s| !s.poisoned && s.generation == generation)
                .unwrap_or_else(PoisonError::into_inner);
        }
        let abandoned = state.generation == generation;
        drop(state);
        if abandoned {
            panic!("lane barrier abandoned by a crashed thread");
        }
    }

    pub fn poison(&self) {
        self.lock().poisoned = true;
        self.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_phase_completes_after_all_arrivals() {
        let bar = Mbarrier::new(3);
        assert!(!bar.try_wait(0));
        bar.arrive();
        bar.arrive();
        assert!(!bar.try_wait(0));
        bar.arrive();
        assert!(bar.try_wait(0));
        // next phase has parity 1 and is pending again
        assert!(!bar.try_wait(1));
        assert_eq!(bar.phase(), 1);
    }

    #[test]
    fn test_producer_parity_passes_on_fresh_barrier() {
        let bar = Mbarrier::new(1);
        assert!(bar.try_wait(1));
        bar.wait(1);
    }

    #[test]
    fn test_transaction_bytes_before_announcement() {
        let bar = Mbarrier::new(1);
        bar.complete_tx(64);
        bar.complete_tx(64);
        assert!(!bar.try_wait(0));
        bar.arrive_and_expect_tx(128);
        assert!(bar.try_wait(0));
    }

    #[test]
    fn test_transaction_bytes_after_announcement() {
        let bar = Mbarrier::new(1);
        bar.arrive_and_expect_tx(96);
        bar.complete_tx(32);
        assert!(!bar.try_wait(0));
        bar.complete_tx(64);
        assert!(bar.try_wait(0));
    }

    #[test]
    fn test_wait_blocks_until_other_thread_arrives() {
        let bar = Arc::new(Mbarrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let bar = Arc::clone(&bar);
                thread::spawn(move || bar.arrive())
            })
            .collect();
        bar.wait(0);
        assert!(bar.try_wait(0));
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_poison_wakes_a_blocked_waiter() {
        let bar = Arc::new(Mbarrier::new(1));
        let waiter = {
            let bar = Arc::clone(&bar);
            thread::spawn(move || bar.wait(0))
        };
        bar.poison();
        assert!(waiter.join().is_err());
        // a completed phase still reads as complete
        let done = Mbarrier::new(1);
        done.arrive();
        done.poison();
        done.wait(0);
    }

    #[test]
    fn test_lane_barrier_is_reusable() {
        let bar = Arc::new(LaneBarrier::new(3));
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let bar = Arc::clone(&bar);
                thread::spawn(move || {
                    for _ in 0..20 {
                        bar.wait();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_lane_barrier_poison_releases_the_rest() {
        let bar = Arc::new(LaneBarrier::new(3));
        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let bar = Arc::clone(&bar);
                thread::spawn(move || bar.wait())
            })
            .collect();
        bar.poison();
        for w in waiters {
            assert!(w.join().is_err());
        }
    }
}
