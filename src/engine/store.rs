//! Bulk store engine: output staging buffer -> global output
//!
//! Stores are clipped to the output bounds, so partial tiles at the edges
//! of the output never write past it.

use std::sync::Arc;
use std::thread::Scope;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::pipeline::{BulkGroups, CrashGuard, GroupCommit};
use crate::smem::SharedMemory;
use crate::stats::KernelStats;
use crate::tensor::Tensor;

/// Destination rectangle of one staged subtile
#[derive(Debug, Clone)]
pub struct StoreTile {
    pub tensor: Tensor,
    pub batch: usize,
    pub row0: usize,
    pub col0: usize,
    pub rows: usize,
    pub cols: usize,
}

pub enum StoreCommand {
    Store {
        smem: Arc<SharedMemory>,
        stage: usize,
        tile: StoreTile,
    },
    Commit(Arc<BulkGroups>),
}

#[derive(Clone)]
pub struct StoreQueue {
    tx: Sender<StoreCommand>,
}

impl StoreQueue {
    pub fn store(&self, smem: Arc<SharedMemory>, stage: usize, tile: StoreTile) {
        super::submit(&self.tx, "store", StoreCommand::Store { smem, stage, tile });
    }
}

impl GroupCommit for StoreQueue {
    fn commit_group(&self, groups: Arc<BulkGroups>) {
        super::submit(&self.tx, "store", StoreCommand::Commit(groups));
    }
}

pub struct StoreEngine {
    unit: usize,
    rx: Receiver<StoreCommand>,
    stats: Arc<KernelStats>,
}

impl StoreEngine {
    pub fn spawn<'scope>(
        scope: &'scope Scope<'scope, '_>,
        unit: usize,
        stats: Arc<KernelStats>,
        guard: &'scope CrashGuard,
    ) -> StoreQueue {
        let (tx, rx) = unbounded();
        let engine = StoreEngine { unit, rx, stats };
        scope.spawn(move || {
            let name = format!("Store engine of unit {}", engine.unit);
            guard.run(&name, || engine.work());
        });
        StoreQueue { tx }
    }

    fn work(self) {
        log::trace!("Store engine of unit {} started", self.unit);
        for command in self.rx.iter() {
            match command {
                StoreCommand::Store { smem, stage, tile } => {
                    let base = smem.c.stage_base(stage);
                    for r in 0..tile.rows {
                        for c in 0..tile.cols {
                            let (i, j) = (tile.row0 + r, tile.col0 + c);
                            if tile.tensor.contains(i, j) {
                                tile.tensor.store_word(i, j, tile.batch, smem.c.load(base + r * tile.cols + c));
                            }
                        }
                    }
                    self.stats.add_stored();
                }
                StoreCommand::Commit(groups) => groups.retire(),
            }
        }
        log::trace!("Store engine of unit {} stopped", self.unit);
    }
}
