//! One cluster of units running one group of output tiles
//!
//! All units of a cluster run at once: each has a copy engine, a store
//! engine when staging, an MMA engine when it leads a pair, and a fixed set
//! of epilogue lanes. Lane 0 also runs the operand mainloop. Units reach
//! each other only through shared memory writes and barrier arrivals.
//!
//! Every thread of a cluster runs under one [`CrashGuard`]. A panic in any
//! of them poisons the cluster's barriers, and the panic is raised again
//! from [`run_cluster`] once every thread has stopped.

use std::panic;
use std::sync::Arc;
use std::thread;

use crate::config::TileConfiguration;
use crate::engine::{CopyEngine, CopyQueue, MmaEngine, MmaQueue, MmaShape, PairMember, StoreEngine, StoreQueue};
use crate::epilogue::{EpilogueLane, EpilogueOp, StoreProducer};
use crate::hardware::HardwareConfig;
use crate::mainloop::{run_mainloop, MmaIssuer, SliceLoader};
use crate::pipeline::{
    AccumulatorPipeline, Breakable, CrashGuard, LaneBarrier, Mbarrier, OperandBarriers, OperandPipeline,
    PipelineState, StorePipeline,
};
use crate::smem::SharedMemory;
use crate::stats::KernelStats;
use crate::tensor::Tensor;
use crate::tiling::{CtaCoord, TileCoord};
use crate::tmem::TensorMemory;

/// Operands, output and transform of one launch
pub struct LaunchArgs {
    pub a: Tensor,
    pub b: Tensor,
    pub c: Tensor,
    pub epilogue: EpilogueOp,
}

/// On-chip state of one unit, visible to the rest of its cluster
pub struct UnitResources {
    pub smem: Arc<SharedMemory>,
    pub operand: Arc<OperandBarriers>,
    pub acc_full: Arc<Mbarrier>,
    pub dealloc: Arc<Mbarrier>,
    pub tmem: Arc<TensorMemory>,
}

impl UnitResources {
    pub fn new(plan: &TileConfiguration, hw: &HardwareConfig) -> Self {
        Self {
            smem: Arc::new(SharedMemory::new(&plan.smem)),
            operand: Arc::new(OperandBarriers::new(
                plan.stages.ab,
                plan.cluster.num_operand_consumers(),
            )),
            acc_full: Arc::new(Mbarrier::new(1)),
            dealloc: Arc::new(Mbarrier::new(1)),
            tmem: Arc::new(TensorMemory::new(hw.tmem_lanes, hw.tmem_columns)),
        }
    }

    /// Register every barrier of this unit with `guard`
    fn watch(&self, guard: &CrashGuard) {
        for bar in self.operand.barriers().chain([&self.acc_full, &self.dealloc]) {
            guard.watch(Arc::clone(bar) as Arc<dyn Breakable>);
        }
    }
}

/// Per-unit view shared by its lanes
struct Unit<'a> {
    rank: usize,
    coord: CtaCoord,
    block: (usize, usize, usize),
    plan: &'a TileConfiguration,
    args: &'a LaunchArgs,
    units: &'a [Arc<UnitResources>],
    operands: OperandPipeline,
    accumulator: AccumulatorPipeline,
    unit_sync: Arc<LaneBarrier>,
    cluster_sync: &'a LaneBarrier,
    guard: &'a CrashGuard,
    stats: &'a KernelStats,
}

impl<'a> Unit<'a> {
    fn new(
        rank: usize,
        cluster_id: usize,
        plan: &'a TileConfiguration,
        args: &'a LaunchArgs,
        units: &'a [Arc<UnitResources>],
        cluster_sync: &'a LaneBarrier,
        guard: &'a CrashGuard,
        stats: &'a KernelStats,
    ) -> Self {
        let layout = &plan.cluster;
        let is_leader = layout.is_leader(rank);
        let own = &units[rank];

        let release_targets = if is_leader {
            layout
                .release_targets(rank)
                .into_iter()
                .map(|target| Arc::clone(&units[target].operand))
                .collect()
        } else {
            Vec::new()
        };
        let operands = OperandPipeline::new(is_leader, plan.tma_load_bytes, Arc::clone(&own.operand), release_targets);

        let commit_targets = if is_leader {
            (0..plan.atom_thr)
                .map(|v| {
                    let member = layout.rank(CtaCoord { v, ..layout.coord(rank) });
                    Arc::clone(&units[member].acc_full)
                })
                .collect()
        } else {
            Vec::new()
        };
        let accumulator = AccumulatorPipeline::new(Arc::clone(&own.acc_full), commit_targets);

        Self {
            rank,
            coord: layout.coord(rank),
            block: layout.block_of(plan.grid, cluster_id, rank),
            plan,
            args,
            units,
            operands,
            accumulator,
            unit_sync: Arc::new(LaneBarrier::new(plan.epilogue_lanes)),
            cluster_sync,
            guard,
            stats,
        }
    }

    fn resources(&self) -> &UnitResources {
        &self.units[self.rank]
    }

    fn pair_members(&self) -> Vec<usize> {
        (0..self.plan.atom_thr)
            .map(|v| self.plan.cluster.rank(CtaCoord { v, ..self.coord }))
            .collect()
    }

    fn epilogue_lane(&self, lane: usize) -> EpilogueLane<'_> {
        let res = self.resources();
        EpilogueLane {
            lane,
            plan: self.plan,
            tile: TileCoord::for_block(self.block, (self.plan.cta_tile_mnk.0, self.plan.cta_tile_mnk.1)),
            output: &self.args.c,
            op: &self.args.epilogue,
            smem: &res.smem,
            tmem: &res.tmem,
            acc_base: res.smem.tmem_base() as usize,
            unit_sync: &self.unit_sync,
            stats: self.stats,
        }
    }

    /// Lane 0: allocation, mainloop, epilogue share, teardown
    fn run_lane0(&self, copy: CopyQueue, mma: Option<MmaQueue>, store: Option<StoreQueue>) {
        let res = self.resources();
        let cols = self.plan.tmem_alloc_cols;

        self.cluster_sync.wait();
        let base = match res.tmem.alloc(cols) {
            Some(base) => base,
            None => {
                log::error!("Unit {} could not allocate {} accumulation columns", self.rank, cols);
                panic!("accumulation memory exhausted");
            }
        };
        res.smem.set_tmem_base(base as u32);
        // partners' base columns are read by the pair leader
        self.cluster_sync.wait();
        self.unit_sync.wait();

        let loader = SliceLoader {
            plan: self.plan,
            rank: self.rank,
            coord: self.coord,
            block: self.block,
            a: &self.args.a,
            b: &self.args.b,
            units: self.units,
            copy: &copy,
        };
        let issuer = mma.as_ref().map(|queue| MmaIssuer {
            queue,
            acc_bases: self
                .pair_members()
                .into_iter()
                .map(|member| self.units[member].smem.tmem_base() as usize)
                .collect(),
            accumulator: &self.accumulator,
        });
        let producer = run_mainloop(&loader, &self.operands, issuer, self.stats);

        let mut store_pipeline = StorePipeline::new(self.plan.stages.c);
        if store.is_some() {
            self.guard.watch(Arc::clone(store_pipeline.groups()) as Arc<dyn Breakable>);
        }
        self.accumulator
            .consumer_wait(&PipelineState::consumer(self.plan.stages.acc));
        let store_producer = store.as_ref().map(|queue| StoreProducer {
            queue,
            pipeline: &mut store_pipeline,
        });
        self.epilogue_lane(0).run(store_producer);

        self.unit_sync.wait();
        if let Some(partner) = self.plan.cluster.partner_of(self.rank) {
            self.units[partner].dealloc.arrive();
            res.dealloc.wait(0);
        }
        res.tmem.dealloc(base, cols);

        if store.is_some() {
            store_pipeline.producer_tail();
            self.stats.observe_store_in_flight(store_pipeline.max_in_flight());
        }
        self.operands.producer_tail(producer);
        self.stats.add_tile();
    }

    fn run_lane(&self, lane: usize) {
        self.unit_sync.wait();
        self.accumulator
            .consumer_wait(&PipelineState::consumer(self.plan.stages.acc));
        self.epilogue_lane(lane).run(None);
        self.unit_sync.wait();
    }
}

/// Run every unit of cluster `cluster_id` to completion
pub fn run_cluster(
    plan: &TileConfiguration,
    hw: &HardwareConfig,
    args: &LaunchArgs,
    cluster_id: usize,
    stats: &Arc<KernelStats>,
) {
    let layout = &plan.cluster;
    let units: Vec<Arc<UnitResources>> = (0..layout.size())
        .map(|_| Arc::new(UnitResources::new(plan, hw)))
        .collect();
    let guard = CrashGuard::new();
    let cluster_sync = Arc::new(LaneBarrier::new(layout.size()));
    guard.watch(Arc::clone(&cluster_sync) as Arc<dyn Breakable>);
    for res in &units {
        res.watch(&guard);
    }
    let views: Vec<Unit<'_>> = (0..layout.size())
        .map(|rank| Unit::new(rank, cluster_id, plan, args, &units, &cluster_sync, &guard, stats))
        .collect();
    for unit in &views {
        guard.watch(Arc::clone(&unit.unit_sync) as Arc<dyn Breakable>);
    }
    log::debug!("Cluster {} starting {} units", cluster_id, layout.size());

    thread::scope(|s| {
        let guard = &guard;
        for unit in &views {
            let copy = CopyEngine::spawn(s, unit.rank, Arc::clone(stats), guard);
            let store = plan
                .config
                .is_staged()
                .then(|| StoreEngine::spawn(s, unit.rank, Arc::clone(stats), guard));
            let mma = layout.is_leader(unit.rank).then(|| {
                let members = unit
                    .pair_members()
                    .into_iter()
                    .map(|member| PairMember {
                        smem: Arc::clone(&units[member].smem),
                        tmem: Arc::clone(&units[member].tmem),
                    })
                    .collect();
                let shape = MmaShape {
                    cta_m: plan.cta_tile_mnk.0,
                    b_rows: plan.b_rows(),
                    mma_k: plan.mma_k(),
                    inst_k: plan.inst_k,
                    ab_dtype: plan.problem.ab_dtype,
                    acc_dtype: plan.config.acc_dtype,
                };
                MmaEngine::spawn(s, unit.rank, shape, members, Arc::clone(stats), guard)
            });

            s.spawn(move || {
                let name = format!("Lane 0 of unit {}", unit.rank);
                guard.run(&name, || unit.run_lane0(copy, mma, store));
            });
            for lane in 1..plan.epilogue_lanes {
                s.spawn(move || {
                    let name = format!("Lane {} of unit {}", lane, unit.rank);
                    guard.run(&name, || unit.run_lane(lane));
                });
            }
        }
    });

    if let Some(payload) = guard.take_payload() {
        log::error!("Cluster {} aborted", cluster_id);
        panic::resume_unwind(payload);
    }
    log::debug!("Cluster {} done", cluster_id);
}
