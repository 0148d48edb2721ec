//! Pipeline cursors

use serde::Serialize;

/// Cursor over a ring of `stages` slots.
///
/// `count` is the total number of slots visited; `index` is the slot and
/// `phase` the barrier parity to wait on for that slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PipelineState {
    stages: usize,
    index: usize,
    count: usize,
    phase: u32,
}

impl PipelineState {
    pub fn new(stages: usize, count: usize, phase: u32) -> Self {
        Self {
            stages,
            index: count % stages.max(1),
            count,
            phase,
        }
    }

    /// Producers start one phase ahead so that empty slots pass at once
    pub fn producer(stages: usize) -> Self {
        Self::new(stages, 0, 1)
    }

    pub fn consumer(stages: usize) -> Self {
        Self::new(stages, 0, 0)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn phase(&self) -> u32 {
        self.phase
    }

    pub fn stages(&self) -> usize {
        self.stages
    }

    pub fn advance(&mut self) {
        self.index += 1;
        self.count += 1;
        if self.index == self.stages {
            self.index = 0;
            self.phase ^= 1;
        }
    }

    pub fn reverse(&mut self) {
        if self.index == 0 {
            self.index = self.stages - 1;
            self.phase ^= 1;
        } else {
            self.index -= 1;
        }
        self.count = self.count.saturating_sub(1);
    }
}
