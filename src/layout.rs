//! On-chip buffer layout
//!
//! Barrier storage comes first, followed by the output staging buffer and
//! the two operand staging buffers. Each staging buffer starts on an aligned
//! boundary.

use serde::{Deserialize, Serialize};

use crate::error::{GemmError, GemmResult};
use crate::stages::StageCounts;

/// Bytes of one barrier object
pub const BARRIER_BYTES: usize = 8;
/// Bytes of the word holding the accumulation memory base column
pub const TMEM_HOLDING_BYTES: usize = 4;

/// A multi-stage region of shared memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub offset: usize,
    pub elems_per_stage: usize,
    pub bytes_per_stage: usize,
    pub stages: usize,
}

impl Region {
    fn new(offset: usize, elems_per_stage: usize, elem_bytes: usize, stages: usize) -> Self {
        Self {
            offset,
            elems_per_stage,
            bytes_per_stage: elems_per_stage * elem_bytes,
            stages,
        }
    }

    pub fn bytes(&self) -> usize {
        self.bytes_per_stage * self.stages
    }

    pub fn end(&self) -> usize {
        self.offset + self.bytes()
    }

    pub fn stage_offset(&self, stage: usize) -> usize {
        self.offset + stage * self.bytes_per_stage
    }
}

/// Element counts and widths of one stage of each staging buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageShapes {
    pub a_elems: usize,
    pub b_elems: usize,
    pub c_elems: usize,
    pub ab_bytes: usize,
    pub c_bytes: usize,
}

/// Placement of every object a unit keeps in shared memory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmemLayout {
    pub ab_full_barriers: Region,
    pub ab_empty_barriers: Region,
    pub acc_full_barriers: Region,
    pub dealloc_barrier: Region,
    pub tmem_holding: Region,
    pub c_stages: Region,
    pub a_stages: Region,
    pub b_stages: Region,
    pub align: usize,
}

fn align_up(offset: usize, align: usize) -> usize {
    if align <= 1 {
        offset
    } else {
        (offset + align - 1) / align * align
    }
}

impl SmemLayout {
    pub fn new(shapes: StageShapes, stages: StageCounts, align: usize) -> Self {
        let ab_full_barriers = Region::new(0, 1, BARRIER_BYTES, stages.ab);
        let ab_empty_barriers = Region::new(ab_full_barriers.end(), 1, BARRIER_BYTES, stages.ab);
        let acc_full_barriers = Region::new(ab_empty_barriers.end(), 1, BARRIER_BYTES, stages.acc);
        let dealloc_barrier = Region::new(acc_full_barriers.end(), 1, BARRIER_BYTES, 1);
        let tmem_holding = Region::new(dealloc_barrier.end(), 1, TMEM_HOLDING_BYTES, 1);

        let c_stages = Region::new(
            align_up(tmem_holding.end(), align),
            shapes.c_elems,
            shapes.c_bytes,
            stages.c,
        );
        let a_stages = Region::new(
            align_up(c_stages.end(), align),
            shapes.a_elems,
            shapes.ab_bytes,
            stages.ab,
        );
        let b_stages = Region::new(
            align_up(a_stages.end(), align),
            shapes.b_elems,
            shapes.ab_bytes,
            stages.ab,
        );

        Self {
            ab_full_barriers,
            ab_empty_barriers,
            acc_full_barriers,
            dealloc_barrier,
            tmem_holding,
            c_stages,
            a_stages,
            b_stages,
            align,
        }
    }

    /// Total bytes used, including alignment padding
    pub fn footprint(&self) -> usize {
        self.b_stages.end()
    }

    /// Reject layouts that do not fit in `capacity` bytes
    pub fn check_fits(&self, capacity: usize) -> GemmResult<()> {
        if self.footprint() > capacity {
            return Err(GemmError::exhausted(format!(
                "shared memory layout needs {} bytes, capacity is {}",
                self.footprint(),
                capacity
            )));
        }
        Ok(())
    }
}
