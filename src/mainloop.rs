//! Operand mainloop run by lane 0 of every unit
//!
//! Lane 0 is the producer of the unit's operand slices. On the leader of an
//! MMA pair it is also the consumer that issues MMAs. The producer runs
//! `prefetch` k-blocks ahead, peeking at the next slot after every advance
//! so that a slot already seen empty is not waited on again.

use std::sync::Arc;

use crate::cluster::UnitResources;
use crate::config::{TileConfiguration, KPHASES};
use crate::engine::{CopyQueue, MmaQueue, OperandSlice, SliceDestination, StagedOperand};
use crate::pipeline::{AccumulatorPipeline, OperandPipeline, PipelineState};
use crate::stats::KernelStats;
use crate::tensor::Tensor;
use crate::tiling::CtaCoord;

/// The consumer half of the mainloop, present on leaders only
pub struct MmaIssuer<'a> {
    pub queue: &'a MmaQueue,
    pub acc_bases: Arc<[usize]>,
    pub accumulator: &'a AccumulatorPipeline,
}

/// Loads one unit issues for one k-block
pub struct SliceLoader<'a> {
    pub plan: &'a TileConfiguration,
    pub rank: usize,
    pub coord: CtaCoord,
    pub block: (usize, usize, usize),
    pub a: &'a Tensor,
    pub b: &'a Tensor,
    pub units: &'a [Arc<UnitResources>],
    pub copy: &'a CopyQueue,
}

impl SliceLoader<'_> {
    fn destinations(&self, peers: Vec<usize>, operand: StagedOperand, base: usize, stage: usize) -> Vec<SliceDestination> {
        peers
            .into_iter()
            .map(|peer| {
                let leader = &self.units[self.plan.cluster.leader_of(peer)];
                SliceDestination {
                    smem: Arc::clone(&self.units[peer].smem),
                    operand,
                    base,
                    barrier: Arc::clone(leader.operand.full(stage)),
                }
            })
            .collect()
    }

    /// Copy this unit's A and B slices of k-block `state.count()` into
    /// slot `state.index()` of every unit sharing them
    pub fn load(&self, state: &PipelineState) {
        let plan = self.plan;
        let mma_k = plan.mma_k();
        let stage = state.index();
        let k0 = state.count() * mma_k;
        let (cta_m, cta_n, _) = plan.cta_tile_mnk;

        let a_rows = plan.a_slice_rows();
        let a_slice = OperandSlice {
            tensor: self.a.clone(),
            batch: self.block.2,
            row0: self.block.0 * cta_m + self.coord.n * a_rows,
            rows: a_rows,
            k0,
            k_extent: mma_k,
        };
        let a_base = self.units[self.rank].smem.a.stage_base(stage) + self.coord.n * a_rows * mma_k;
        let a_dests = self.destinations(plan.cluster.a_mcast_peers(self.rank), StagedOperand::A, a_base, stage);
        self.copy.load(a_slice, a_dests);

        let b_rows = plan.b_slice_rows();
        let b_slice = OperandSlice {
            tensor: self.b.clone(),
            batch: self.block.2,
            row0: self.block.1 * cta_n + self.coord.v * plan.b_rows() + self.coord.m * b_rows,
            rows: b_rows,
            k0,
            k_extent: mma_k,
        };
        let b_base = self.units[self.rank].smem.b.stage_base(stage) + self.coord.m * b_rows * mma_k;
        let b_dests = self.destinations(plan.cluster.b_mcast_peers(self.rank), StagedOperand::B, b_base, stage);
        self.copy.load(b_slice, b_dests);
    }
}

/// Run the mainloop. Returns the producer cursor rewound to the first slot
/// not matched by a consumption, ready for the producer tail.
pub fn run_mainloop(
    loader: &SliceLoader<'_>,
    operands: &OperandPipeline,
    issuer: Option<MmaIssuer<'_>>,
    stats: &KernelStats,
) -> PipelineState {
    let plan = loader.plan;
    let stages = plan.stages.ab;
    let k_blocks = plan.k_blocks;
    let prefetch = plan.prefetch_k_blocks();
    let is_leader = issuer.is_some();

    let mut producer = PipelineState::producer(stages);
    let mut consumer = PipelineState::consumer(stages);

    let mut empty_token = true;
    if producer.count() < k_blocks {
        empty_token = operands.producer_try_acquire(&producer);
    }

    for _ in 0..prefetch {
        operands.producer_acquire(&producer, empty_token);
        stats.observe_operand_occupancy(operands.occupancy(&producer));
        loader.load(&producer);

        producer.advance();
        empty_token = true;
        if producer.count() < k_blocks {
            empty_token = operands.producer_try_acquire(&producer);
        }
    }

    let mut full_token = true;
    if consumer.count() < k_blocks && is_leader {
        full_token = operands.consumer_try_wait(&consumer);
    }

    for k_block in 0..k_blocks {
        operands.producer_acquire(&producer, empty_token);
        if producer.count() < k_blocks {
            stats.observe_operand_occupancy(operands.occupancy(&producer));
            loader.load(&producer);
        }

        if let Some(issuer) = issuer.as_ref() {
            operands.consumer_wait(&consumer, full_token);
            for kphase in 0..KPHASES {
                let accumulate = k_block > 0 || kphase > 0;
                issuer
                    .queue
                    .mma(consumer.index(), kphase, accumulate, Arc::clone(&issuer.acc_bases));
            }
            stats.add_k_block();
            operands.consumer_release(&consumer, issuer.queue);
        }

        producer.advance();
        empty_token = true;
        if producer.count() < k_blocks {
            empty_token = operands.producer_try_acquire(&producer);
        }

        consumer.advance();
        full_token = true;
        if consumer.count() < k_blocks && is_leader {
            full_token = operands.consumer_try_wait(&consumer);
        }
    }

    if let Some(issuer) = issuer {
        issuer
            .accumulator
            .producer_commit(&PipelineState::producer(plan.stages.acc), issuer.queue);
    }

    for _ in 0..prefetch {
        producer.reverse();
    }
    producer
}
