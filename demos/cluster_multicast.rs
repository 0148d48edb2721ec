//! Example: Cooperative pairs and multicast clusters
//!
//! Shows how the cluster shape splits operand loads between units and that
//! every arrangement produces the same output.
//!
//! Run with: cargo run --example cluster_multicast

use dense_gemm_pipeline::{
    gemm, DenseGemmKernel, ElementType, GemmConfig, HardwareConfig, MajorMode, ProblemDescriptor,
    StoreMode, Tensor,
};

fn main() {
    println!("=== Cluster Multicast ===\n");

    let hw = HardwareConfig::sm100();
    let problem = ProblemDescriptor::new((512, 256, 256, 1), ElementType::Float16, ElementType::Float32);
    let a = Tensor::random(problem.a_shape(), ElementType::Float16, MajorMode::RowMajor, 7);
    let b = Tensor::random(problem.b_shape(), ElementType::Float16, MajorMode::RowMajor, 8);

    let arrangements = [
        ("single units", false, (128, 128), (1, 1)),
        ("A multicast along N", false, (128, 128), (1, 2)),
        ("B multicast along M", false, (128, 128), (2, 1)),
        ("cooperative pairs", true, (256, 128), (2, 1)),
        ("cooperative pairs, 2x2 cluster", true, (256, 128), (2, 2)),
    ];

    let mut baseline: Option<Vec<f64>> = None;
    for (name, use_2cta, tiler, cluster) in arrangements {
        let config = GemmConfig::new(ElementType::Float32, use_2cta, tiler, cluster, StoreMode::Staged);
        let compiled = DenseGemmKernel::new(config.clone(), hw.clone())
            .compile(&problem)
            .unwrap();
        let plan = compiled.plan();

        println!("Arrangement: {}", name);
        println!("  MMA tile: {:?}, cluster: {:?}", tiler, cluster);
        println!(
            "  Units per cluster: {}, clusters: {}",
            plan.cluster.size(),
            plan.num_clusters()
        );
        println!(
            "  A shared by {} units ({} rows each), B shared by {} units ({} rows each)",
            plan.cluster.num_mcast_ctas_a(),
            plan.a_slice_rows(),
            plan.cluster.num_mcast_ctas_b(),
            plan.b_slice_rows()
        );
        println!("  Bytes expected per operand stage: {}", plan.tma_load_bytes);

        let c = Tensor::zeros(problem.c_shape(), ElementType::Float32, MajorMode::RowMajor);
        let stats = gemm(&a, &b, &c, &config, &hw, None).unwrap();
        println!(
            "  K-blocks issued: {}, operand elements landed: {}",
            stats.k_blocks_consumed, stats.operand_elems_landed
        );

        let values = c.to_vec();
        match &baseline {
            None => baseline = Some(values),
            Some(expected) => println!("  Matches single units: {}", *expected == values),
        }
        println!();
    }
}
