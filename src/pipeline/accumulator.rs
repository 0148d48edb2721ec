//! Accumulator pipeline: MMA engine -> epilogue lanes
//!
//! A single stage with no release side: the accumulation columns are freed
//! after the epilogue instead of being reused within one tile.

use std::sync::Arc;

use super::{AsyncArrive, Mbarrier, PipelineState};

pub struct AccumulatorPipeline {
    full: Arc<Mbarrier>,
    /// Full barriers signalled by a commit: the unit's own and, for
    /// cooperative pairs, the partner's
    commit_targets: Vec<Arc<Mbarrier>>,
}

impl AccumulatorPipeline {
    pub fn new(full: Arc<Mbarrier>, commit_targets: Vec<Arc<Mbarrier>>) -> Self {
        Self { full, commit_targets }
    }

    /// Signal "accumulator full" once every issued MMA has retired
    pub fn producer_commit(&self, _state: &PipelineState, agent: &dyn AsyncArrive) {
        agent.arrive_after_issued(self.commit_targets.clone());
    }

    pub fn consumer_wait(&self, state: &PipelineState) {
        self.full.wait(state.phase());
    }

    pub fn consumer_try_wait(&self, state: &PipelineState) -> bool {
        self.full.try_wait(state.phase())
    }
}
