//! Output pipeline: epilogue lanes -> store engine
//!
//! Bulk stores are grouped; the store engine retires groups in the order
//! they were committed. The producer keeps at most `stages` groups in
//! flight so that a staging buffer is never overwritten while its store is
//! still reading it.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct GroupState {
    retired: usize,
    poisoned: bool,
}

/// Count of retired bulk groups, shared with the store engine
#[derive(Debug, Default)]
pub struct BulkGroups {
    state: Mutex<GroupState>,
    changed: Condvar,
}

impl BulkGroups {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GroupState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn retire(&self) {
        self.lock().retired += 1;
        self.changed.notify_all();
    }

    pub fn retired(&self) -> usize {
        self.lock().retired
    }

    /// Wake every waiter; the store engine will not retire anything more
    pub fn poison(&self) {
        self.lock().poisoned = true;
        self.changed.notify_all();
    }

    fn wait_for(&self, at_least: usize) {
        let state = self.lock();
        let state = self
            .changed
            .wait_while(state, |s| !s.poisoned && s.retired < at_least)
            .unwrap_or_else(PoisonError::into_inner);
        let abandoned = state.retired < at_least;
        drop(state);
        if abandoned {
            panic!("bulk groups abandoned by a crashed store engine");
        }
    }
}

/// Anything that accepts a commit of the stores issued so far
pub trait GroupCommit {
    fn commit_group(&self, groups: Arc<BulkGroups>);
}

pub struct StorePipeline {
    stages: usize,
    committed: usize,
    max_in_flight: usize,
    groups: Arc<BulkGroups>,
}

impl StorePipeline {
    pub fn new(stages: usize) -> Self {
        Self {
            stages,
            committed: 0,
            max_in_flight: 0,
            groups: Arc::new(BulkGroups::new()),
        }
    }

    /// Close the current group of stores
    pub fn producer_commit(&mut self, engine: &dyn GroupCommit) {
        engine.commit_group(Arc::clone(&self.groups));
        self.committed += 1;
        let in_flight = self.committed - self.groups.retired();
        self.max_in_flight = self.max_in_flight.max(in_flight);
    }

    /// Block until a staging buffer is free for the next group
    pub fn producer_acquire(&mut self) {
        let needed = self.committed.saturating_sub(self.stages.saturating_sub(1));
        self.groups.wait_for(needed);
    }

    /// Block until every committed group has retired
    pub fn producer_tail(&mut self) {
        self.groups.wait_for(self.committed);
    }

    pub fn committed(&self) -> usize {
        self.committed
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    pub fn groups(&self) -> &Arc<BulkGroups> {
        &self.groups
    }
}
