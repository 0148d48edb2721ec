//! Bulk copy engine: global operand tiles -> shared memory stages
//!
//! A load reads one slice of an operand tile once and writes it to every
//! destination unit, then completes the slice's bytes on each destination's
//! barrier. Elements outside the tensor read as zero.

use std::sync::Arc;
use std::thread::Scope;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::pipeline::{CrashGuard, Mbarrier};
use crate::smem::{SharedMemory, StageBuffer};
use crate::stats::KernelStats;
use crate::tensor::Tensor;

/// Which staging buffer a slice lands in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagedOperand {
    A,
    B,
}

/// Rows `row0..row0 + rows` and columns `k0..k0 + k_extent` of one batch
#[derive(Debug, Clone)]
pub struct OperandSlice {
    pub tensor: Tensor,
    pub batch: usize,
    pub row0: usize,
    pub rows: usize,
    pub k0: usize,
    pub k_extent: usize,
}

impl OperandSlice {
    pub fn elems(&self) -> usize {
        self.rows * self.k_extent
    }

    pub fn bytes(&self) -> usize {
        self.elems() * self.tensor.dtype().bytes()
    }

    fn read(&self) -> Vec<u32> {
        let mut words = Vec::with_capacity(self.elems());
        for r in 0..self.rows {
            for kk in 0..self.k_extent {
                let (i, k) = (self.row0 + r, self.k0 + kk);
                if self.tensor.contains(i, k) {
                    words.push(self.tensor.load_word(i, k, self.batch));
                } else {
                    words.push(0);
                }
            }
        }
        words
    }
}

pub struct SliceDestination {
    pub smem: Arc<SharedMemory>,
    pub operand: StagedOperand,
    /// Element offset of the slice's first row inside the staging buffer
    pub base: usize,
    pub barrier: Arc<Mbarrier>,
}

impl SliceDestination {
    fn buffer(&self) -> &StageBuffer {
        match self.operand {
            StagedOperand::A => &self.smem.a,
            StagedOperand::B => &self.smem.b,
        }
    }
}

pub enum CopyCommand {
    Load {
        slice: OperandSlice,
        destinations: Vec<SliceDestination>,
    },
}

/// Handle used to issue loads
#[derive(Clone)]
pub struct CopyQueue {
    tx: Sender<CopyCommand>,
}

impl CopyQueue {
    pub fn load(&self, slice: OperandSlice, destinations: Vec<SliceDestination>) {
        super::submit(&self.tx, "copy", CopyCommand::Load { slice, destinations });
    }
}

pub struct CopyEngine {
    unit: usize,
    rx: Receiver<CopyCommand>,
    stats: Arc<KernelStats>,
}

impl CopyEngine {
    pub fn spawn<'scope>(
        scope: &'scope Scope<'scope, '_>,
        unit: usize,
        stats: Arc<KernelStats>,
        guard: &'scope CrashGuard,
    ) -> CopyQueue {
        let (tx, rx) = unbounded();
        let engine = CopyEngine { unit, rx, stats };
        scope.spawn(move || {
            let name = format!("Copy engine of unit {}", engine.unit);
            guard.run(&name, || engine.work());
        });
        CopyQueue { tx }
    }

    fn work(self) {
        log::trace!("Copy engine of unit {} started", self.unit);
        for command in self.rx.iter() {
            match command {
                CopyCommand::Load { slice, destinations } => {
                    let words = slice.read();
                    for dest in &destinations {
                        let buffer = dest.buffer();
                        for (offset, word) in words.iter().enumerate() {
                            buffer.store(dest.base + offset, *word);
                        }
                        self.stats.add_landed(words.len());
                        dest.barrier.complete_tx(slice.bytes());
                    }
                }
            }
        }
        log::trace!("Copy engine of unit {} stopped", self.unit);
    }
}
