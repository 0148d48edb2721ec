//! MMA engine
//!
//! Owned by the leader of an MMA pair. One command multiplies one k-phase of
//! a staged operand slot into the pair's accumulator: rows of the pair tile
//! come from the A stage of the member owning them, columns from the B stage
//! of the member holding that part of B. Results land in the accumulation
//! memory of the member owning the row.

use std::sync::Arc;
use std::thread::Scope;

use crossbeam_channel::{unbounded, Receiver, Sender};
use half::f16;

use crate::dtype::ElementType;
use crate::pipeline::{AsyncArrive, CrashGuard, Mbarrier};
use crate::smem::SharedMemory;
use crate::stats::KernelStats;
use crate::tmem::TensorMemory;

/// Static shape of the MMA issued by one pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmaShape {
    /// Rows of A per member
    pub cta_m: usize,
    /// Rows of B per member
    pub b_rows: usize,
    pub mma_k: usize,
    pub inst_k: usize,
    pub ab_dtype: ElementType,
    pub acc_dtype: ElementType,
}

/// Memories of one member of the pair
#[derive(Clone)]
pub struct PairMember {
    pub smem: Arc<SharedMemory>,
    pub tmem: Arc<TensorMemory>,
}

pub enum MmaCommand {
    Mma {
        stage: usize,
        kphase: usize,
        /// False on the first k-phase of a tile: overwrite instead of add
        accumulate: bool,
        /// Accumulator base column in each member
        acc_bases: Arc<[usize]>,
    },
    Commit {
        barriers: Vec<Arc<Mbarrier>>,
    },
}

#[derive(Clone)]
pub struct MmaQueue {
    tx: Sender<MmaCommand>,
}

impl MmaQueue {
    pub fn mma(&self, stage: usize, kphase: usize, accumulate: bool, acc_bases: Arc<[usize]>) {
        super::submit(
            &self.tx,
            "mma",
            MmaCommand::Mma {
                stage,
                kphase,
                accumulate,
                acc_bases,
            },
        );
    }
}

impl AsyncArrive for MmaQueue {
    fn arrive_after_issued(&self, barriers: Vec<Arc<Mbarrier>>) {
        super::submit(&self.tx, "mma", MmaCommand::Commit { barriers });
    }
}

pub struct MmaEngine {
    unit: usize,
    shape: MmaShape,
    members: Vec<PairMember>,
    rx: Receiver<MmaCommand>,
    stats: Arc<KernelStats>,
}

impl MmaEngine {
    pub fn spawn<'scope>(
        scope: &'scope Scope<'scope, '_>,
        unit: usize,
        shape: MmaShape,
        members: Vec<PairMember>,
        stats: Arc<KernelStats>,
        guard: &'scope CrashGuard,
    ) -> MmaQueue {
        let (tx, rx) = unbounded();
        let engine = MmaEngine {
            unit,
            shape,
            members,
            rx,
            stats,
        };
        scope.spawn(move || {
            let name = format!("MMA engine of unit {}", engine.unit);
            guard.run(&name, || engine.work());
        });
        MmaQueue { tx }
    }

    fn work(self) {
        log::trace!("MMA engine of unit {} started", self.unit);
        for command in self.rx.iter() {
            match command {
                MmaCommand::Mma {
                    stage,
                    kphase,
                    accumulate,
                    acc_bases,
                } => self.mma(stage, kphase, accumulate, &acc_bases),
                MmaCommand::Commit { barriers } => {
                    for barrier in barriers {
                        barrier.arrive();
                    }
                }
            }
        }
        log::trace!("MMA engine of unit {} stopped", self.unit);
    }

    /// Gather one k-phase of the operand slot as MMA input values
    fn gather(&self, stage: usize, kphase: usize) -> (Vec<f32>, Vec<f32>) {
        let s = &self.shape;
        let k_off = kphase * s.inst_k;

        let mut a = Vec::with_capacity(self.members.len() * s.cta_m * s.inst_k);
        for member in &self.members {
            let base = member.smem.a.stage_base(stage);
            for r in 0..s.cta_m {
                for kk in 0..s.inst_k {
                    let word = member.smem.a.load(base + r * s.mma_k + k_off + kk);
                    a.push(s.ab_dtype.mma_operand(word));
                }
            }
        }

        let mut b = Vec::with_capacity(self.members.len() * s.b_rows * s.inst_k);
        for member in &self.members {
            let base = member.smem.b.stage_base(stage);
            for r in 0..s.b_rows {
                for kk in 0..s.inst_k {
                    let word = member.smem.b.load(base + r * s.mma_k + k_off + kk);
                    b.push(s.ab_dtype.mma_operand(word));
                }
            }
        }
        (a, b)
    }

    fn mma(&self, stage: usize, kphase: usize, accumulate: bool, acc_bases: &[usize]) {
        let s = &self.shape;
        let (a, b) = self.gather(stage, kphase);
        let rows = self.members.len() * s.cta_m;
        let cols = self.members.len() * s.b_rows;

        for row in 0..rows {
            let member = &self.members[row / s.cta_m];
            let lane = row % s.cta_m;
            let base = acc_bases[row / s.cta_m];
            let a_row = &a[row * s.inst_k..(row + 1) * s.inst_k];
            for col in 0..cols {
                let b_row = &b[col * s.inst_k..(col + 1) * s.inst_k];
                let prior = if accumulate {
                    member.tmem.load(lane, base + col)
                } else {
                    s.acc_dtype.encode(0.0)
                };
                let word = mac_row(s.acc_dtype, prior, a_row, b_row);
                member.tmem.store(lane, base + col, word);
            }
        }
        self.stats.add_consumed((rows + cols) * s.inst_k);
    }
}

/// Accumulate a dot product into an accumulator word in k order
fn mac_row(acc_dtype: ElementType, prior: u32, a: &[f32], b: &[f32]) -> u32 {
    match acc_dtype {
        ElementType::Int32 => {
            let acc = a
                .iter()
                .zip(b)
                .fold(prior as i32, |acc, (x, y)| acc.wrapping_add((*x as i32).wrapping_mul(*y as i32)));
            acc as u32
        }
        ElementType::Float16 => {
            let acc = a.iter().zip(b).fold(f32::from_bits(prior), |acc, (x, y)| {
                f16::from_f32(acc + x * y).to_f32()
            });
            acc.to_bits()
        }
        _ => {
            let acc = a
                .iter()
                .zip(b)
                .fold(f32::from_bits(prior), |acc, (x, y)| acc + x * y);
            acc.to_bits()
        }
    }
}
