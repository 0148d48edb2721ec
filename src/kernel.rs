//! Kernel objects
//!
//! Construction is two-phase: [`DenseGemmKernel::new`] only records the
//! static configuration; [`DenseGemmKernel::compile`] checks a concrete
//! problem against the feasibility gate and freezes a
//! [`TileConfiguration`] for it.

use std::sync::Arc;

use rayon::prelude::*;

use crate::cluster::{run_cluster, LaunchArgs};
use crate::config::TileConfiguration;
use crate::dtype::ElementType;
use crate::epilogue::{identity, EpilogueOp};
use crate::error::{GemmError, GemmResult};
use crate::feasibility::{can_implement, check_implementable};
use crate::hardware::HardwareConfig;
use crate::problem::{GemmConfig, MajorMode, ProblemDescriptor};
use crate::stats::{KernelStats, StatsSnapshot};
use crate::stream::Stream;
use crate::tensor::Tensor;

pub struct DenseGemmKernel {
    config: GemmConfig,
    hardware: HardwareConfig,
}

impl DenseGemmKernel {
    pub fn new(config: GemmConfig, hardware: HardwareConfig) -> Self {
        Self { config, hardware }
    }

    pub fn config(&self) -> &GemmConfig {
        &self.config
    }

    pub fn hardware(&self) -> &HardwareConfig {
        &self.hardware
    }

    pub fn can_implement(&self, problem: &ProblemDescriptor) -> bool {
        can_implement(problem, &self.config)
    }

    pub fn compile(&self, problem: &ProblemDescriptor) -> GemmResult<CompiledGemm> {
        check_implementable(problem, &self.config)?;
        let plan = TileConfiguration::plan(problem, &self.config, &self.hardware)?;
        Ok(CompiledGemm {
            plan: Arc::new(plan),
            hardware: self.hardware.clone(),
            stats: Arc::new(KernelStats::new()),
        })
    }
}

/// A kernel frozen for one problem
pub struct CompiledGemm {
    plan: Arc<TileConfiguration>,
    hardware: HardwareConfig,
    stats: Arc<KernelStats>,
}

fn check_tensor(
    name: &str,
    tensor: &Tensor,
    shape: (usize, usize, usize),
    dtype: ElementType,
    major: MajorMode,
) -> GemmResult<()> {
    if tensor.shape() != shape || tensor.dtype() != dtype || tensor.major() != major {
        return Err(GemmError::TensorMismatch {
            expected: format!(
                "{} as {} {}x{}x{} {:?}",
                name, dtype, shape.0, shape.1, shape.2, major
            ),
            got: tensor.describe(),
        });
    }
    Ok(())
}

impl CompiledGemm {
    pub fn plan(&self) -> &TileConfiguration {
        &self.plan
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Enqueue C = epilogue(A @ B) on `stream` and return without waiting.
    ///
    /// The tensors must match the compiled problem. `c` is written in place
    /// once the stream reaches the launch.
    pub fn launch(
        &self,
        a: &Tensor,
        b: &Tensor,
        c: &Tensor,
        stream: &Stream,
        epilogue: Option<EpilogueOp>,
    ) -> GemmResult<()> {
        let problem = &self.plan.problem;
        check_tensor("A", a, problem.a_shape(), problem.ab_dtype, problem.a_major)?;
        check_tensor("B", b, problem.b_shape(), problem.ab_dtype, problem.b_major)?;
        check_tensor("C", c, problem.c_shape(), problem.c_dtype, problem.c_major)?;

        let args = LaunchArgs {
            a: a.clone(),
            b: b.clone(),
            c: c.clone(),
            epilogue: epilogue.unwrap_or_else(identity),
        };
        let plan = Arc::clone(&self.plan);
        let hardware = self.hardware.clone();
        let stats = Arc::clone(&self.stats);

        log::debug!(
            "Enqueueing {} over {} clusters of {}",
            problem,
            plan.num_clusters(),
            plan.cluster.size()
        );
        stream.enqueue(format!("dense gemm {}", problem), move || {
            (0..plan.num_clusters())
                .into_par_iter()
                .for_each(|cluster| run_cluster(&plan, &hardware, &args, cluster, &stats));
        })
    }
}
