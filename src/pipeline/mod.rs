//! Barrier-based producer/consumer pipelines
//!
//! Three pipelines connect the engines of one unit:
//! - operands: copy engine -> MMA engine, multi-stage, multicast aware
//! - accumulator: MMA engine -> epilogue lanes, one stage
//! - output: epilogue lanes -> store engine, bounded bulk groups
//!
//! Every slot is guarded by barriers rather than locks. Cursors are
//! [`PipelineState`] values owned by the thread playing each role.

mod accumulator;
mod barrier;
mod guard;
mod operand;
mod state;
mod store;

use std::sync::Arc;

pub use accumulator::AccumulatorPipeline;
pub use barrier::{LaneBarrier, Mbarrier};
pub use guard::{Breakable, CrashGuard};
pub use operand::{OperandBarriers, OperandPipeline};
pub use state::PipelineState;
pub use store::{BulkGroups, GroupCommit, StorePipeline};

/// An agent that can arrive on barriers once all work it has already
/// accepted has retired. The MMA engine releases operand stages and
/// signals the accumulator this way.
pub trait AsyncArrive: Send + Sync {
    fn arrive_after_issued(&self, barriers: Vec<Arc<Mbarrier>>);
}

/// Arrives at once; for agents with no queued work
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateArrive;

impl AsyncArrive for ImmediateArrive {
    fn arrive_after_issued(&self, barriers: Vec<Arc<Mbarrier>>) {
        for barrier in barriers {
            barrier.arrive();
        }
    }
}
