//! Epilogue: accumulator -> output
//!
//! Every lane of a unit walks the same subtiles in the same order and
//! converts its share of rows. In staged mode the converted subtile goes
//! through a round-robin staging buffer drained by the store engine; in
//! direct mode each lane writes the output itself.

use std::sync::Arc;

use crate::config::TileConfiguration;
use crate::engine::{StoreQueue, StoreTile};
use crate::pipeline::{LaneBarrier, StorePipeline};
use crate::smem::SharedMemory;
use crate::stats::KernelStats;
use crate::tensor::Tensor;
use crate::tiling::TileCoord;
use crate::tmem::TensorMemory;

/// Elementwise transform applied to every output value after it has been
/// converted to the output type
pub type EpilogueOp = Arc<dyn Fn(f64) -> f64 + Send + Sync>;

pub fn identity() -> EpilogueOp {
    Arc::new(|x: f64| x)
}

/// `alpha * x`
pub fn scale(alpha: f64) -> EpilogueOp {
    Arc::new(move |x: f64| alpha * x)
}

pub fn relu() -> EpilogueOp {
    Arc::new(|x: f64| x.max(0.0))
}

/// The producer side of the output pipeline, held by lane 0
pub struct StoreProducer<'a> {
    pub queue: &'a StoreQueue,
    pub pipeline: &'a mut StorePipeline,
}

/// What one lane needs to drain its unit's accumulator
pub struct EpilogueLane<'a> {
    pub lane: usize,
    pub plan: &'a TileConfiguration,
    pub tile: TileCoord,
    pub output: &'a Tensor,
    pub op: &'a EpilogueOp,
    pub smem: &'a Arc<SharedMemory>,
    pub tmem: &'a TensorMemory,
    pub acc_base: usize,
    pub unit_sync: &'a LaneBarrier,
    pub stats: &'a KernelStats,
}

impl EpilogueLane<'_> {
    /// Rows of an epilogue subtile owned by this lane
    fn rows(&self) -> std::ops::Range<usize> {
        let lanes = self.plan.epilogue_lanes;
        let epi_m = self.plan.epi_tile.0;
        (self.lane * epi_m / lanes)..((self.lane + 1) * epi_m / lanes)
    }

    fn convert(&self, row: usize, col: usize) -> u32 {
        let c_dtype = self.plan.problem.c_dtype;
        let acc = self.tmem.read_acc(self.plan.config.acc_dtype, row, self.acc_base + col);
        c_dtype.encode((self.op)(c_dtype.quantize(acc)))
    }

    /// Drain every subtile. Lane 0 passes the store producer in staged mode.
    pub fn run(&self, mut producer: Option<StoreProducer<'_>>) {
        let (epi_m, epi_n) = self.plan.epi_tile;
        let staged = self.plan.config.is_staged();
        let (m, n, _) = self.output.shape();
        let outside = self.tile.is_outside(m, n);

        for index in 0..self.plan.subtiles.len() {
            let (sub_r, sub_c) = self.plan.subtiles.offset(index);

            if staged {
                let buffer = index % self.plan.stages.c;
                let base = self.smem.c.stage_base(buffer);
                for r in self.rows() {
                    for c in 0..epi_n {
                        self.smem.c.store(base + r * epi_n + c, self.convert(sub_r + r, sub_c + c));
                    }
                }
                self.unit_sync.wait();

                if let Some(producer) = producer.as_mut() {
                    self.stats.add_staged();
                    let tile = StoreTile {
                        tensor: self.output.clone(),
                        batch: self.tile.batch,
                        row0: self.tile.start_row + sub_r,
                        col0: self.tile.start_col + sub_c,
                        rows: epi_m,
                        cols: epi_n,
                    };
                    producer.queue.store(Arc::clone(self.smem), buffer, tile);
                    producer.pipeline.producer_commit(producer.queue);
                    producer.pipeline.producer_acquire();
                }
                self.unit_sync.wait();
            } else if !outside {
                for r in self.rows() {
                    for c in 0..epi_n {
                        self.output.store_word(
                            self.tile.start_row + sub_r + r,
                            self.tile.start_col + sub_c + c,
                            self.tile.batch,
                            self.convert(sub_r + r, sub_c + c),
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ops() {
        assert_eq!(identity()(3.5), 3.5);
        assert_eq!(scale(2.0)(-1.5), -3.0);
        assert_eq!(relu()(-1.0), 0.0);
    }
}
