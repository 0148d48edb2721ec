//! Example: Single-unit GEMM
//!
//! Runs a 256x256x512 TFloat32 GEMM one output tile per unit, first with
//! direct stores and then with staged stores, and checks both against the
//! host reference.
//!
//! Run with: cargo run --example basic_gemm

use dense_gemm_pipeline::epilogue::identity;
use dense_gemm_pipeline::{
    gemm, reference_gemm, DenseGemmKernel, ElementType, GemmConfig, HardwareConfig, MajorMode,
    ProblemDescriptor, StoreMode, Tensor,
};

fn main() {
    println!("=== Single-unit Dense GEMM ===\n");

    let hw = HardwareConfig::sm100();
    let (m, n, k, l) = (256, 256, 512, 1);
    let problem = ProblemDescriptor::new((m, n, k, l), ElementType::TFloat32, ElementType::Float32);

    let a = Tensor::random(problem.a_shape(), ElementType::TFloat32, MajorMode::RowMajor, 1111);
    let b = Tensor::random(problem.b_shape(), ElementType::TFloat32, MajorMode::RowMajor, 1112);
    let reference = reference_gemm(&a, &b, ElementType::Float32, MajorMode::RowMajor, &identity());

    for store_mode in [StoreMode::Direct, StoreMode::Staged] {
        let config = GemmConfig::new(ElementType::Float32, false, (128, 128), (1, 1), store_mode);
        let compiled = DenseGemmKernel::new(config.clone(), hw.clone())
            .compile(&problem)
            .unwrap();
        let plan = compiled.plan();

        println!("{:?} stores", store_mode);
        println!("  Grid: {:?}", plan.grid);
        println!("  K-blocks per tile: {}", plan.k_blocks);
        println!("  Stages: {:?}", plan.stages);
        println!("  Shared memory footprint: {} bytes", plan.smem.footprint());

        let c = Tensor::zeros(problem.c_shape(), ElementType::Float32, MajorMode::RowMajor);
        let stats = gemm(&a, &b, &c, &config, &hw, None).unwrap();
        println!("  Tiles completed: {}", stats.tiles_completed);
        println!("  Subtiles stored: {}", stats.subtiles_stored);
        println!("  Max abs difference: {}", c.max_abs_diff(&reference));
        println!();
    }

    println!("Tile configuration (JSON):");
    let config = GemmConfig::new(ElementType::Float32, false, (128, 128), (1, 1), StoreMode::Staged);
    let compiled = DenseGemmKernel::new(config, hw).compile(&problem).unwrap();
    println!("{}", compiled.plan().to_json().unwrap());
}
