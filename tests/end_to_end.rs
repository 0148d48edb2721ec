//! Whole-pipeline runs checked against the host reference

use std::sync::Arc;

use pretty_assertions::assert_eq;

use dense_gemm_pipeline::epilogue::{identity, relu, scale};
use dense_gemm_pipeline::{
    gemm, reference_gemm, DenseGemmKernel, ElementType, EpilogueOp, GemmConfig, GemmError,
    HardwareConfig, MajorMode, ProblemDescriptor, StatsSnapshot, StoreMode, Stream, Tensor,
};

use ElementType::*;

struct Case {
    mnkl: (usize, usize, usize, usize),
    ab: ElementType,
    c: ElementType,
    majors: (MajorMode, MajorMode, MajorMode),
    config: GemmConfig,
}

impl Case {
    fn new(mnkl: (usize, usize, usize, usize), config: GemmConfig) -> Self {
        Self {
            mnkl,
            ab: TFloat32,
            c: Float32,
            majors: (MajorMode::RowMajor, MajorMode::RowMajor, MajorMode::RowMajor),
            config,
        }
    }

    fn dtypes(mut self, ab: ElementType, acc: ElementType, c: ElementType) -> Self {
        self.ab = ab;
        self.c = c;
        self.config.acc_dtype = acc;
        self
    }

    fn majors(mut self, a: MajorMode, b: MajorMode, c: MajorMode) -> Self {
        self.majors = (a, b, c);
        self
    }

    fn operands(&self) -> (Tensor, Tensor, Tensor) {
        let (m, n, k, l) = self.mnkl;
        let a = Tensor::random((m, k, l), self.ab, self.majors.0, 1111);
        let b = Tensor::random((n, k, l), self.ab, self.majors.1, 1112);
        let c = Tensor::zeros((m, n, l), self.c, self.majors.2);
        (a, b, c)
    }

    /// Run once and return the output, the reference and the stats
    fn run(&self, epilogue: Option<EpilogueOp>) -> (Tensor, Tensor, StatsSnapshot) {
        let (a, b, c) = self.operands();
        let op = epilogue.clone().unwrap_or_else(identity);
        let stats = gemm(&a, &b, &c, &self.config, &HardwareConfig::sm100(), epilogue).unwrap();
        let reference = reference_gemm(&a, &b, self.c, self.majors.2, &op);
        (c, reference, stats)
    }

    fn ab_stages(&self) -> usize {
        let problem = ProblemDescriptor::new(self.mnkl, self.ab, self.c);
        let kernel = DenseGemmKernel::new(self.config.clone(), HardwareConfig::sm100());
        kernel.compile(&problem).unwrap().plan().stages.ab
    }
}

fn config(tiler: (usize, usize), cluster: (usize, usize), use_2cta: bool, store_mode: StoreMode) -> GemmConfig {
    GemmConfig::new(Float32, use_2cta, tiler, cluster, store_mode)
}

fn assert_conserved(stats: &StatsSnapshot, tiles: usize) {
    assert_eq!(stats.operand_elems_landed, stats.operand_elems_consumed);
    assert_eq!(stats.subtiles_staged, stats.subtiles_stored);
    assert_eq!(stats.tiles_completed, tiles);
}

#[test_log::test]
fn test_single_unit_direct_store() {
    let case = Case::new((256, 256, 256, 1), config((128, 128), (1, 1), false, StoreMode::Direct));
    let (c, reference, stats) = case.run(None);

    assert!(c.max_abs_diff(&reference) <= 1e-1);
    assert_conserved(&stats, 4);
    // 256 / 32 k-blocks for each of the four tiles
    assert_eq!(stats.k_blocks_consumed, 4 * 8);
    assert_eq!(stats.subtiles_staged, 0);
}

#[test_log::test]
fn test_float32_operands() {
    let case = Case::new((256, 256, 256, 1), config((128, 128), (1, 1), false, StoreMode::Direct))
        .dtypes(Float32, Float32, Float32);
    let (c, reference, stats) = case.run(None);

    assert!(c.max_abs_diff(&reference) <= 1e-1);
    assert_conserved(&stats, 4);
    assert_eq!(stats.k_blocks_consumed, 4 * 8);
}

#[test_log::test]
fn test_cooperative_pair_matches_single_unit() {
    let single = Case::new((256, 256, 256, 1), config((128, 128), (1, 1), false, StoreMode::Direct));
    let paired = Case::new((256, 256, 256, 1), config((256, 128), (2, 1), true, StoreMode::Direct));

    let (c1, reference, _) = single.run(None);
    let (c2, _, stats) = paired.run(None);

    assert!(c2.max_abs_diff(&reference) <= 1e-1);
    assert_eq!(c1.to_vec(), c2.to_vec());
    assert_conserved(&stats, 4);
    // one leader per pair issues the MMAs
    assert_eq!(stats.k_blocks_consumed, 2 * 8);
}

#[test_log::test]
fn test_staged_and_direct_stores_agree() {
    let direct = Case::new((256, 128, 128, 1), config((128, 128), (1, 1), false, StoreMode::Direct));
    let staged = Case::new((256, 128, 128, 1), config((128, 128), (1, 1), false, StoreMode::Staged));

    let (c1, reference, _) = direct.run(None);
    let (c2, _, stats) = staged.run(None);

    assert!(c1.max_abs_diff(&reference) <= 1e-1);
    assert_eq!(c1.to_vec(), c2.to_vec());
    assert_conserved(&stats, 2);
    assert!(stats.subtiles_stored > 0);
}

#[test_log::test]
fn test_partial_tiles_need_staged_stores() {
    let staged = Case::new((200, 136, 64, 1), config((128, 128), (1, 1), false, StoreMode::Staged));
    let (c, reference, stats) = staged.run(None);
    assert!(c.max_abs_diff(&reference) <= 1e-1);
    assert_conserved(&stats, 4);

    let direct = Case::new((200, 136, 64, 1), config((128, 128), (1, 1), false, StoreMode::Direct));
    let (a, b, c) = direct.operands();
    let err = gemm(&a, &b, &c, &direct.config, &HardwareConfig::sm100(), None).unwrap_err();
    assert!(matches!(err, GemmError::OutOfBoundsTiles { .. }));
    assert!(err.is_configuration());
}

// K is large enough that every operand slot is refilled several times, so
// shared slots go through more than one release by both readers.
#[test_log::test]
fn test_multicast_cluster() {
    let case = Case::new((256, 256, 512, 1), config((128, 128), (2, 2), false, StoreMode::Staged));
    let stages = case.ab_stages();
    assert!(512 / 32 > stages);

    let (c, reference, stats) = case.run(None);
    assert!(c.max_abs_diff(&reference) <= 1e-1);
    assert_conserved(&stats, 4);
    assert!(stats.max_operand_occupancy >= 1);
    assert!(stats.max_operand_occupancy <= stages);
}

#[test_log::test]
fn test_cooperative_multicast_cluster() {
    let case = Case::new((512, 256, 512, 1), config((256, 128), (2, 2), true, StoreMode::Staged));
    let stages = case.ab_stages();
    assert!(512 / 32 > stages);

    let (c, reference, stats) = case.run(None);
    assert!(c.max_abs_diff(&reference) <= 1e-1);
    assert_conserved(&stats, 8);
    assert!(stats.max_operand_occupancy <= stages);
}

#[test_log::test]
fn test_batched_problem() {
    let case = Case::new((128, 128, 64, 3), config((128, 128), (1, 1), false, StoreMode::Direct));
    let (c, reference, stats) = case.run(None);
    assert!(c.max_abs_diff(&reference) <= 1e-1);
    assert_conserved(&stats, 3);
}

#[test_log::test]
fn test_integer_gemm_is_exact() {
    let case = Case::new((128, 128, 256, 1), config((128, 128), (1, 1), false, StoreMode::Staged))
        .dtypes(Int8, Int32, Int32);
    let (c, reference, _) = case.run(None);
    assert_eq!(c.to_vec(), reference.to_vec());
}

#[test_log::test]
fn test_half_precision_with_column_major_operands() {
    let case = Case::new((128, 256, 128, 1), config((64, 256), (1, 1), false, StoreMode::Staged))
        .dtypes(Float16, Float32, Float16)
        .majors(MajorMode::ColumnMajor, MajorMode::ColumnMajor, MajorMode::ColumnMajor);
    let (c, reference, _) = case.run(None);
    assert!(c.max_abs_diff(&reference) <= 1e-1);
}

#[test_log::test]
fn test_epilogue_op_applies_to_every_element() {
    let case = Case::new((128, 128, 64, 1), config((128, 128), (1, 1), false, StoreMode::Staged));
    let (c, reference, _) = case.run(Some(relu()));
    assert!(c.max_abs_diff(&reference) <= 1e-1);
    assert!(c.to_vec().iter().all(|v| *v >= 0.0));

    let (c, reference, _) = case.run(Some(scale(0.5)));
    assert!(c.max_abs_diff(&reference) <= 1e-1);
}

#[test_log::test]
fn test_empty_k_writes_transformed_zero() {
    let case = Case::new((128, 128, 0, 1), config((128, 128), (1, 1), false, StoreMode::Direct));
    let (c, _, stats) = case.run(Some(Arc::new(|x: f64| x + 1.0)));
    assert!(c.to_vec().iter().all(|v| *v == 1.0));
    assert_eq!(stats.k_blocks_consumed, 0);
    assert_eq!(stats.tiles_completed, 1);
}

#[test_log::test]
fn test_pipelines_stay_within_their_stages() {
    let problem = ProblemDescriptor::new((256, 256, 512, 1), TFloat32, Float32);
    let kernel = DenseGemmKernel::new(
        config((128, 128), (1, 1), false, StoreMode::Staged),
        HardwareConfig::sm100(),
    );
    let compiled = kernel.compile(&problem).unwrap();
    let stages = compiled.plan().stages;

    let (m, n, k, l) = (256, 256, 512, 1);
    let a = Tensor::random((m, k, l), TFloat32, MajorMode::RowMajor, 1);
    let b = Tensor::random((n, k, l), TFloat32, MajorMode::RowMajor, 2);
    let c = Tensor::zeros((m, n, l), Float32, MajorMode::RowMajor);
    let stream = Stream::new();
    compiled.launch(&a, &b, &c, &stream, None).unwrap();
    stream.synchronize().unwrap();

    let stats = compiled.stats();
    assert!(stats.max_operand_occupancy >= 1);
    assert!(stats.max_operand_occupancy <= stages.ab);
    assert!(stats.max_store_groups_in_flight <= stages.c);
    assert_conserved(&stats, 4);
}

#[test_log::test]
fn test_crash_in_one_lane_fails_the_stream() {
    let (m, n, k) = (128, 128, 32);
    // only rows 96.. accumulate to 32, and those belong to the last lane
    let a = Tensor::from_fn((m, k, 1), Float32, MajorMode::RowMajor, |i, _, _| if i >= 96 { 1.0 } else { 0.0 });
    let b = Tensor::from_fn((n, k, 1), Float32, MajorMode::RowMajor, |_, _, _| 1.0);
    let op: EpilogueOp = Arc::new(|x: f64| {
        if x > 20.0 {
            panic!("value {} out of range", x)
        }
        x
    });

    for store_mode in [StoreMode::Direct, StoreMode::Staged] {
        let problem = ProblemDescriptor::new((m, n, k, 1), Float32, Float32);
        let kernel = DenseGemmKernel::new(config((128, 128), (1, 1), false, store_mode), HardwareConfig::sm100());
        let compiled = kernel.compile(&problem).unwrap();
        let c = Tensor::zeros((m, n, 1), Float32, MajorMode::RowMajor);

        let stream = Stream::new();
        compiled.launch(&a, &b, &c, &stream, Some(Arc::clone(&op))).unwrap();
        let err = stream.synchronize().unwrap_err();
        assert!(matches!(err, GemmError::StreamFailure { .. }), "{:?}", store_mode);
        assert!(err.to_string().contains("out of range"), "{}", err);
        assert_eq!(compiled.stats().tiles_completed, 0);
        drop(stream);
    }
}

#[test_log::test]
fn test_repeated_launches_on_one_stream() {
    let problem = ProblemDescriptor::new((128, 128, 64, 1), TFloat32, Float32);
    let kernel = DenseGemmKernel::new(GemmConfig::default(), HardwareConfig::sm100());
    let compiled = kernel.compile(&problem).unwrap();

    let a = Tensor::random((128, 64, 1), TFloat32, MajorMode::RowMajor, 3);
    let b = Tensor::random((128, 64, 1), TFloat32, MajorMode::RowMajor, 4);
    let c = Tensor::zeros((128, 128, 1), Float32, MajorMode::RowMajor);
    let stream = Stream::new();
    for _ in 0..3 {
        compiled.launch(&a, &b, &c, &stream, None).unwrap();
    }
    stream.synchronize().unwrap();

    let reference = reference_gemm(&a, &b, Float32, MajorMode::RowMajor, &identity());
    assert_eq!(c.max_abs_diff(&reference), 0.0);
    assert_eq!(compiled.stats().tiles_completed, 3);
}

#[test_log::test]
fn test_starved_device_is_rejected() {
    let problem = ProblemDescriptor::new((128, 128, 64, 1), TFloat32, Float32);
    let hw = HardwareConfig::sm100().with_smem_capacity(40_000);
    let kernel = DenseGemmKernel::new(GemmConfig::default(), hw);
    let err = kernel.compile(&problem).err().unwrap();
    assert!(matches!(err, GemmError::ResourceExhausted { .. }));
}
