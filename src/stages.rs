//! Stage budget allocation
//!
//! Splits the on-chip staging capacity of one unit between the operand
//! pipeline and the output pipeline. Operand stages are sized first; any
//! capacity they leave over is handed to output staging.

use serde::{Deserialize, Serialize};

/// Inputs of the stage budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageBudget {
    pub smem_capacity: usize,
    pub occupancy: usize,
    /// Bytes of one A stage plus one B stage
    pub ab_bytes_per_stage: usize,
    /// Bytes of one output staging buffer (ignored when not staged)
    pub c_bytes_per_stage: usize,
    pub barrier_reserve_bytes: usize,
    pub staged_output: bool,
}

/// Stage counts of the three pipelines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounts {
    pub acc: usize,
    pub ab: usize,
    pub c: usize,
}

impl StageCounts {
    /// Name of the first pipeline left without a usable stage
    pub fn starved_pipeline(&self, staged_output: bool) -> Option<&'static str> {
        if self.acc < 1 {
            Some("accumulator")
        } else if self.ab < 1 {
            Some("operand")
        } else if staged_output && self.c < 1 {
            Some("output")
        } else {
            None
        }
    }
}

/// Compute stage counts for a budget.
///
/// Never fails. A capacity too small for a single stage yields zero stages,
/// which the caller rejects as an unusable configuration.
pub fn compute_stages(budget: &StageBudget) -> StageCounts {
    let acc = 1;
    let mut c = if budget.staged_output { 2 } else { 0 };

    let c_bytes_per_stage = if budget.staged_output {
        budget.c_bytes_per_stage as i64
    } else {
        0
    };
    let capacity = budget.smem_capacity as i64;
    let groups = budget.occupancy as i64 + 1;
    let reserved = groups * (budget.barrier_reserve_bytes as i64 + c_bytes_per_stage * c as i64);

    let ab = if budget.ab_bytes_per_stage == 0 {
        0
    } else {
        ((capacity - reserved) / budget.ab_bytes_per_stage as i64).max(0)
    };

    if budget.staged_output && c_bytes_per_stage > 0 {
        let leftover = capacity - budget.ab_bytes_per_stage as i64 * ab - reserved;
        c += (leftover / (groups * c_bytes_per_stage)).max(0) as usize;
    }

    StageCounts {
        acc,
        ab: ab as usize,
        c,
    }
}
