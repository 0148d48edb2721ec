//! Simulated shared memory of one unit
//!
//! Staging buffers hold one 32-bit word per element whatever the element
//! width; the byte layout is tracked separately by [`SmemLayout`]. Words are
//! relaxed atomics: ordering between writers and readers always comes from
//! a barrier.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::layout::{Region, SmemLayout};

#[derive(Debug)]
pub struct StageBuffer {
    elems_per_stage: usize,
    stages: usize,
    cells: Vec<AtomicU32>,
}

impl StageBuffer {
    pub fn new(elems_per_stage: usize, stages: usize) -> Self {
        Self {
            elems_per_stage,
            stages,
            cells: (0..elems_per_stage * stages).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    fn from_region(region: &Region) -> Self {
        Self::new(region.elems_per_stage, region.stages)
    }

    pub fn stages(&self) -> usize {
        self.stages
    }

    pub fn elems_per_stage(&self) -> usize {
        self.elems_per_stage
    }

    pub fn stage_base(&self, stage: usize) -> usize {
        stage * self.elems_per_stage
    }

    pub fn load(&self, index: usize) -> u32 {
        self.cells[index].load(Ordering::Relaxed)
    }

    pub fn store(&self, index: usize, word: u32) {
        self.cells[index].store(word, Ordering::Relaxed);
    }
}

/// Staging buffers and the accumulation base word of one unit
#[derive(Debug)]
pub struct SharedMemory {
    pub a: StageBuffer,
    pub b: StageBuffer,
    pub c: StageBuffer,
    tmem_holding: AtomicU32,
}

impl SharedMemory {
    pub fn new(layout: &SmemLayout) -> Self {
        Self {
            a: StageBuffer::from_region(&layout.a_stages),
            b: StageBuffer::from_region(&layout.b_stages),
            c: StageBuffer::from_region(&layout.c_stages),
            tmem_holding: AtomicU32::new(0),
        }
    }

    /// Publish the base column of this unit's accumulation columns
    pub fn set_tmem_base(&self, column: u32) {
        self.tmem_holding.store(column, Ordering::Release);
    }

    pub fn tmem_base(&self) -> u32 {
        self.tmem_holding.load(Ordering::Acquire)
    }
}
