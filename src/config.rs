//! Tile configuration derived once per problem
//!
//! Everything the pipelines need that depends only on the problem, the
//! static kernel configuration and the hardware: tile shapes, cluster
//! layout, stage counts and the shared memory layout.

use serde::Serialize;

use crate::error::{GemmError, GemmResult};
use crate::hardware::HardwareConfig;
use crate::layout::{SmemLayout, StageShapes};
use crate::problem::{GemmConfig, ProblemDescriptor};
use crate::stages::{compute_stages, StageBudget, StageCounts};
use crate::tiling::{ceil_div, compute_grid, epilogue_tile, ClusterLayout, SubtileWalk};
use crate::tmem::alloc_columns;

/// MMA instructions issued per k-block
pub const KPHASES: usize = 4;

#[derive(Debug, Clone, Serialize)]
pub struct TileConfiguration {
    pub problem: ProblemDescriptor,
    pub config: GemmConfig,
    pub atom_thr: usize,
    pub inst_k: usize,
    pub mma_tiler_mnk: (usize, usize, usize),
    pub cta_tile_mnk: (usize, usize, usize),
    pub cluster: ClusterLayout,
    pub epi_tile: (usize, usize),
    pub subtiles: SubtileWalk,
    pub stages: StageCounts,
    pub smem: SmemLayout,
    pub tmem_alloc_cols: usize,
    /// Bytes a leader's full barrier expects per operand stage
    pub tma_load_bytes: usize,
    pub grid: (usize, usize, usize),
    pub k_blocks: usize,
    pub epilogue_lanes: usize,
}

impl TileConfiguration {
    /// Derive the configuration; the problem must already have passed the
    /// feasibility gate.
    pub fn plan(problem: &ProblemDescriptor, config: &GemmConfig, hw: &HardwareConfig) -> GemmResult<Self> {
        let atom_thr = config.atom_thr();
        let inst_k = 256 / problem.ab_dtype.width();
        let (tile_m, tile_n) = config.mma_tiler_mn;
        let mma_k = KPHASES * inst_k;
        let (cta_m, cta_n) = config.cta_tile_mn();
        let cluster = ClusterLayout::new(atom_thr, config.cluster_shape_mn);

        let epi_tile = epilogue_tile((cta_m, cta_n), problem.c_dtype, config.store_mode);
        let subtiles = SubtileWalk::new((cta_m, cta_n), epi_tile);

        let a_elems = cta_m * mma_k;
        let b_elems = (tile_n / atom_thr) * mma_k;
        let c_elems = if config.is_staged() { epi_tile.0 * epi_tile.1 } else { 0 };
        let ab_bytes_per_stage = (a_elems + b_elems) * problem.ab_dtype.bytes();

        let stages = compute_stages(&StageBudget {
            smem_capacity: hw.smem_capacity,
            occupancy: hw.occupancy,
            ab_bytes_per_stage,
            c_bytes_per_stage: c_elems * problem.c_dtype.bytes(),
            barrier_reserve_bytes: hw.barrier_reserve_bytes,
            staged_output: config.is_staged(),
        });
        if let Some(pipeline) = stages.starved_pipeline(config.is_staged()) {
            return Err(GemmError::exhausted(format!(
                "no {} stage fits in {} bytes of shared memory",
                pipeline, hw.smem_capacity
            )));
        }

        let smem = SmemLayout::new(
            StageShapes {
                a_elems,
                b_elems,
                c_elems,
                ab_bytes: problem.ab_dtype.bytes(),
                c_bytes: problem.c_dtype.bytes(),
            },
            stages,
            hw.buffer_align_bytes,
        );
        smem.check_fits(hw.smem_capacity)?;

        let tmem_alloc_cols = alloc_columns(tile_n);
        if tmem_alloc_cols > hw.tmem_columns || cta_m > hw.tmem_lanes {
            return Err(GemmError::exhausted(format!(
                "{}x{} accumulator does not fit in {}x{} accumulation memory",
                cta_m, tmem_alloc_cols, hw.tmem_lanes, hw.tmem_columns
            )));
        }
        if hw.epilogue_lanes == 0 {
            return Err(GemmError::config("at least one epilogue lane is required"));
        }

        let plan = Self {
            problem: problem.clone(),
            config: config.clone(),
            atom_thr,
            inst_k,
            mma_tiler_mnk: (tile_m, tile_n, mma_k),
            cta_tile_mnk: (cta_m, cta_n, mma_k),
            cluster,
            epi_tile,
            subtiles,
            stages,
            smem,
            tmem_alloc_cols,
            tma_load_bytes: ab_bytes_per_stage * atom_thr,
            grid: compute_grid(problem.c_shape(), (cta_m, cta_n), config.cluster_shape_mn),
            k_blocks: ceil_div(problem.k, mma_k),
            epilogue_lanes: hw.epilogue_lanes,
        };
        log::info!(
            "Planned {}: cta tile {:?}, stages {:?}, grid {:?}",
            problem,
            plan.cta_tile_mnk,
            plan.stages,
            plan.grid
        );
        Ok(plan)
    }

    pub fn mma_k(&self) -> usize {
        self.mma_tiler_mnk.2
    }

    /// Rows of B held by each member of an MMA pair
    pub fn b_rows(&self) -> usize {
        self.mma_tiler_mnk.1 / self.atom_thr
    }

    /// Rows of the A tile each sharing unit loads
    pub fn a_slice_rows(&self) -> usize {
        self.cta_tile_mnk.0 / self.cluster.num_mcast_ctas_a()
    }

    /// Rows of a member's B tile each sharing unit loads
    pub fn b_slice_rows(&self) -> usize {
        self.b_rows() / self.cluster.num_mcast_ctas_b()
    }

    /// K-blocks the producer runs ahead before the first MMA
    pub fn prefetch_k_blocks(&self) -> usize {
        self.stages.ab.saturating_sub(2).min(self.k_blocks)
    }

    pub fn num_clusters(&self) -> usize {
        self.cluster.num_clusters(self.grid)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::ElementType;
    use crate::problem::StoreMode;
    use pretty_assertions::assert_eq;

    fn problem() -> ProblemDescriptor {
        ProblemDescriptor::new((256, 256, 512, 1), ElementType::TFloat32, ElementType::Float32)
    }

    #[test]
    fn test_default_plan() {
        let plan = TileConfiguration::plan(&problem(), &GemmConfig::default(), &HardwareConfig::sm100()).unwrap();
        assert_eq!(plan.inst_k, 8);
        assert_eq!(plan.cta_tile_mnk, (128, 128, 32));
        assert_eq!(plan.epi_tile, (128, 32));
        assert_eq!(plan.subtiles.len(), 4);
        assert_eq!(plan.stages, StageCounts { acc: 1, ab: 5, c: 2 });
        assert_eq!(plan.tmem_alloc_cols, 128);
        assert_eq!(plan.tma_load_bytes, 32_768);
        assert_eq!(plan.grid, (2, 2, 1));
        assert_eq!(plan.k_blocks, 16);
        assert_eq!(plan.prefetch_k_blocks(), 3);
    }

    #[test]
    fn test_cooperative_plan_splits_b() {
        let config = GemmConfig::new(ElementType::Float32, true, (256, 128), (2, 2), StoreMode::Direct);
        let plan = TileConfiguration::plan(&problem(), &config, &HardwareConfig::sm100()).unwrap();
        assert_eq!(plan.cta_tile_mnk, (128, 128, 32));
        assert_eq!(plan.b_rows(), 64);
        assert_eq!(plan.a_slice_rows(), 64);
        assert_eq!(plan.b_slice_rows(), 64);
        assert_eq!(plan.tma_load_bytes, 2 * (128 + 64) * 32 * 4);
        assert_eq!(plan.grid, (2, 2, 1));
        assert_eq!(plan.num_clusters(), 1);
    }

    #[test]
    fn test_small_device_is_exhausted() {
        let hw = HardwareConfig::sm100().with_smem_capacity(16_384);
        let err = TileConfiguration::plan(&problem(), &GemmConfig::default(), &hw).unwrap_err();
        assert!(matches!(err, GemmError::ResourceExhausted { .. }));
    }

    #[test]
    fn test_plan_serializes() {
        let plan = TileConfiguration::plan(&problem(), &GemmConfig::default(), &HardwareConfig::sm100()).unwrap();
        let json = plan.to_json().unwrap();
        assert!(json.contains("\"k_blocks\": 16"));
    }
}
