//! Pipelined dense GEMM on a simulated tiled accelerator
//!
//! Computes C = epilogue(A @ B) for batched A (MxKxL) and B (NxKxL) by
//! overlapping three asynchronous engines per compute unit: a bulk copy
//! engine staging operand tiles into shared memory, an MMA engine
//! accumulating into a dedicated accumulation memory, and a store engine
//! draining converted results to the output.
//!
//! # Example
//!
//! ```rust
//! use dense_gemm_pipeline::{gemm, ElementType, GemmConfig, HardwareConfig, MajorMode, Tensor};
//!
//! let a = Tensor::random((128, 32, 1), ElementType::TFloat32, MajorMode::RowMajor, 1);
//! let b = Tensor::random((128, 32, 1), ElementType::TFloat32, MajorMode::RowMajor, 2);
//! let c = Tensor::zeros((128, 128, 1), ElementType::Float32, MajorMode::RowMajor);
//! gemm(&a, &b, &c, &GemmConfig::default(), &HardwareConfig::sm100(), None).unwrap();
//! ```

pub mod cluster;
pub mod config;
pub mod dtype;
pub mod engine;
pub mod epilogue;
pub mod error;
pub mod feasibility;
pub mod hardware;
pub mod kernel;
pub mod layout;
pub mod mainloop;
pub mod pipeline;
pub mod problem;
pub mod smem;
pub mod stages;
pub mod stats;
pub mod stream;
pub mod tensor;
pub mod tiling;
pub mod tmem;

pub use config::TileConfiguration;
pub use dtype::ElementType;
pub use epilogue::EpilogueOp;
pub use error::{GemmError, GemmResult};
pub use feasibility::{can_implement, check_implementable};
pub use hardware::HardwareConfig;
pub use kernel::{CompiledGemm, DenseGemmKernel};
pub use problem::{GemmConfig, MajorMode, ProblemDescriptor, StoreMode};
pub use stats::StatsSnapshot;
pub use stream::Stream;
pub use tensor::{reference_gemm, Tensor};

/// Problem described by a set of operand and output tensors
pub fn problem_of(a: &Tensor, b: &Tensor, c: &Tensor) -> ProblemDescriptor {
    let (m, k, l) = a.shape();
    let n = b.shape().0;
    ProblemDescriptor::new((m, n, k, l), a.dtype(), c.dtype()).with_majors(a.major(), b.major(), c.major())
}

/// Compile, launch and wait for one GEMM on a fresh stream
pub fn gemm(
    a: &Tensor,
    b: &Tensor,
    c: &Tensor,
    config: &GemmConfig,
    hardware: &HardwareConfig,
    epilogue: Option<EpilogueOp>,
) -> GemmResult<StatsSnapshot> {
    let kernel = DenseGemmKernel::new(config.clone(), hardware.clone());
    let compiled = kernel.compile(&problem_of(a, b, c))?;
    let stream = Stream::new();
    compiled.launch(a, b, c, &stream, epilogue)?;
    stream.synchronize()?;
    Ok(compiled.stats())
}
