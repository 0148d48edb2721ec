//! Feasibility gate
//!
//! Structural rules a problem and configuration must satisfy before a kernel
//! is compiled. The pipeline performs no runtime validation, so everything
//! that could corrupt results or deadlock is rejected here.

use crate::dtype::ElementType;
use crate::error::{GemmError, GemmResult};
use crate::problem::{GemmConfig, ProblemDescriptor, StoreMode};

use ElementType::*;

const AB_TYPES: [ElementType; 8] = [
    Float16,
    BFloat16,
    TFloat32,
    Float32,
    Uint8,
    Int8,
    Float8E4M3FN,
    Float8E5M2,
];

/// Check the operand / accumulator / output type combination
pub fn is_valid_dtypes(ab: ElementType, acc: ElementType, c: ElementType) -> bool {
    check_dtypes(ab, acc, c).is_ok()
}

fn check_dtypes(ab: ElementType, acc: ElementType, c: ElementType) -> GemmResult<()> {
    if !AB_TYPES.contains(&ab) {
        return Err(GemmError::dtypes(format!("{} is not a supported operand type", ab)));
    }

    let acc_ok = match acc {
        Float32 => true,
        Float16 => matches!(ab, Float16 | Float8E4M3FN | Float8E5M2),
        Int32 => matches!(ab, Uint8 | Int8),
        _ => false,
    };
    if !acc_ok {
        return Err(GemmError::dtypes(format!(
            "cannot accumulate {} operands in {}",
            ab, acc
        )));
    }

    let c_ok = match acc {
        Float32 => matches!(
            c,
            Float32 | Float16 | BFloat16 | Float8E4M3FN | Float8E5M2 | Int32 | Int8 | Uint8
        ),
        Float16 => matches!(c, BFloat16 | Float16),
        _ => matches!(c, BFloat16 | Float16 | Float32 | Int32 | Int8 | Uint8),
    };
    if !c_ok {
        return Err(GemmError::dtypes(format!(
            "{} accumulator cannot produce {} output",
            acc, c
        )));
    }
    Ok(())
}

fn is_power_of_2(x: usize) -> bool {
    x > 0 && x & (x - 1) == 0
}

/// Check the MMA tile shape against the instruction variant and the cluster
pub fn is_valid_mma_tiler_and_cluster_shape(
    use_2cta_instrs: bool,
    mma_tiler_mn: (usize, usize),
    cluster_shape_mn: (usize, usize),
) -> bool {
    check_tiler_and_cluster(use_2cta_instrs, mma_tiler_mn, cluster_shape_mn).is_ok()
}

fn check_tiler_and_cluster(
    use_2cta_instrs: bool,
    mma_tiler_mn: (usize, usize),
    cluster_shape_mn: (usize, usize),
) -> GemmResult<()> {
    let legal_m: &[usize] = if use_2cta_instrs { &[128, 256] } else { &[64, 128] };
    if !legal_m.contains(&mma_tiler_mn.0) {
        return Err(GemmError::tile_shape(format!(
            "M = {} must be one of {:?}",
            mma_tiler_mn.0, legal_m
        )));
    }
    if !(32..=256).contains(&mma_tiler_mn.1) || mma_tiler_mn.1 % 32 != 0 {
        return Err(GemmError::tile_shape(format!(
            "N = {} must be a multiple of 32 in [32, 256]",
            mma_tiler_mn.1
        )));
    }

    let (cm, cn) = cluster_shape_mn;
    if !is_power_of_2(cm) || !is_power_of_2(cn) {
        return Err(GemmError::cluster_shape(format!(
            "{}x{} dimensions must be positive powers of two",
            cm, cn
        )));
    }
    if cm * cn > 16 {
        return Err(GemmError::cluster_shape(format!(
            "{}x{} spans more than 16 units",
            cm, cn
        )));
    }
    if use_2cta_instrs && cm % 2 != 0 {
        return Err(GemmError::cluster_shape(format!(
            "M dimension {} must be even for cooperative instructions",
            cm
        )));
    }
    Ok(())
}

fn contiguous_16b_aligned(dtype: ElementType, is_mode0_major: bool, shape: (usize, usize, usize)) -> bool {
    let major_elems = if is_mode0_major { shape.0 } else { shape.1 };
    major_elems % dtype.elems_per_128b() == 0
}

/// Check that every contiguous dimension spans whole 16-byte accesses
pub fn is_valid_tensor_alignment(problem: &ProblemDescriptor) -> bool {
    check_alignment(problem).is_ok()
}

fn check_alignment(problem: &ProblemDescriptor) -> GemmResult<()> {
    let operands = [
        ("A", problem.ab_dtype, problem.a_major, problem.a_shape()),
        ("B", problem.ab_dtype, problem.b_major, problem.b_shape()),
        ("C", problem.c_dtype, problem.c_major, problem.c_shape()),
    ];
    for (name, dtype, major, shape) in operands {
        if !contiguous_16b_aligned(dtype, major.is_mode0_major(), shape) {
            let extent = if major.is_mode0_major() { shape.0 } else { shape.1 };
            return Err(GemmError::misaligned(
                name,
                format!(
                    "contiguous extent {} is not a multiple of {} {} elements",
                    extent,
                    dtype.elems_per_128b(),
                    dtype
                ),
            ));
        }
    }
    Ok(())
}

/// Direct stores are unpredicated, so they need whole tiles
pub fn is_valid_epilog_store_option(problem: &ProblemDescriptor, config: &GemmConfig) -> bool {
    check_store_option(problem, config).is_ok()
}

fn check_store_option(problem: &ProblemDescriptor, config: &GemmConfig) -> GemmResult<()> {
    if config.store_mode == StoreMode::Direct {
        let (cta_m, cta_n) = config.cta_tile_mn();
        if problem.m % cta_m != 0 || problem.n % cta_n != 0 {
            return Err(GemmError::out_of_bounds(format!(
                "{}x{} output is not covered by whole {}x{} tiles",
                problem.m, problem.n, cta_m, cta_n
            )));
        }
    }
    Ok(())
}

/// Report the first rule the combination violates
pub fn check_implementable(problem: &ProblemDescriptor, config: &GemmConfig) -> GemmResult<()> {
    check_dtypes(problem.ab_dtype, config.acc_dtype, problem.c_dtype)?;
    check_tiler_and_cluster(config.use_2cta_instrs, config.mma_tiler_mn, config.cluster_shape_mn)?;
    check_alignment(problem)?;
    check_store_option(problem, config)?;
    Ok(())
}

pub fn can_implement(problem: &ProblemDescriptor, config: &GemmConfig) -> bool {
    check_implementable(problem, config).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::problem::MajorMode;

    fn problem(m: usize, n: usize, k: usize) -> ProblemDescriptor {
        ProblemDescriptor::new((m, n, k, 1), TFloat32, Float32)
    }

    #[test]
    fn test_dtype_table() {
        assert!(is_valid_dtypes(TFloat32, Float32, Float32));
        assert!(is_valid_dtypes(Float32, Float32, Float16));
        assert!(is_valid_dtypes(Float8E4M3FN, Float16, BFloat16));
        assert!(is_valid_dtypes(Int8, Int32, Int8));
        assert!(!is_valid_dtypes(Int32, Int32, Int32));
        assert!(!is_valid_dtypes(BFloat16, Float16, Float16));
        assert!(!is_valid_dtypes(Float16, Int32, Int32));
        assert!(!is_valid_dtypes(Float16, Float16, Float32));
        assert!(!is_valid_dtypes(Int8, Int32, Float8E5M2));
        assert!(!is_valid_dtypes(Float16, BFloat16, Float16));
    }

    #[test]
    fn test_tile_shapes() {
        assert!(is_valid_mma_tiler_and_cluster_shape(false, (128, 128), (1, 1)));
        assert!(is_valid_mma_tiler_and_cluster_shape(false, (64, 32), (4, 4)));
        assert!(is_valid_mma_tiler_and_cluster_shape(true, (256, 256), (2, 1)));
        assert!(!is_valid_mma_tiler_and_cluster_shape(true, (64, 128), (2, 1)));
        assert!(!is_valid_mma_tiler_and_cluster_shape(false, (256, 128), (1, 1)));
        assert!(!is_valid_mma_tiler_and_cluster_shape(false, (128, 48), (1, 1)));
        assert!(!is_valid_mma_tiler_and_cluster_shape(false, (128, 288), (1, 1)));
    }

    #[test]
    fn test_cluster_shapes() {
        assert!(!is_valid_mma_tiler_and_cluster_shape(true, (256, 128), (1, 2)));
        assert!(!is_valid_mma_tiler_and_cluster_shape(false, (128, 128), (3, 1)));
        assert!(!is_valid_mma_tiler_and_cluster_shape(false, (128, 128), (0, 1)));
        assert!(!is_valid_mma_tiler_and_cluster_shape(false, (128, 128), (8, 4)));
        assert!(is_valid_mma_tiler_and_cluster_shape(false, (128, 128), (16, 1)));
    }

    #[test]
    fn test_alignment_follows_major_mode() {
        // 4 tf32 elements per 16 bytes
        assert!(is_valid_tensor_alignment(&problem(256, 256, 512)));
        assert!(!is_valid_tensor_alignment(&problem(256, 256, 510)));
        // M-major A only needs M aligned
        let p = problem(256, 256, 510).with_majors(MajorMode::ColumnMajor, MajorMode::ColumnMajor, MajorMode::RowMajor);
        assert!(is_valid_tensor_alignment(&p));
        let err = check_implementable(&problem(256, 250, 512), &GemmConfig::default()).unwrap_err();
        assert!(matches!(err, GemmError::Misaligned { ref tensor, .. } if tensor == "C"));
    }

    #[test]
    fn test_direct_store_needs_whole_tiles() {
        let direct = GemmConfig {
            store_mode: StoreMode::Direct,
            ..GemmConfig::default()
        };
        assert!(is_valid_epilog_store_option(&problem(256, 256, 64), &direct));
        assert!(!is_valid_epilog_store_option(&problem(200, 256, 64), &direct));
        assert!(is_valid_epilog_store_option(&problem(200, 256, 64), &GemmConfig::default()));

        let err = check_implementable(&problem(200, 256, 64), &direct).unwrap_err();
        assert!(matches!(err, GemmError::OutOfBoundsTiles { .. }));
    }

    #[test]
    fn test_first_violation_is_reported() {
        let config = GemmConfig {
            acc_dtype: Int32,
            mma_tiler_mn: (96, 128),
            ..GemmConfig::default()
        };
        let err = check_implementable(&problem(256, 256, 64), &config).unwrap_err();
        assert!(matches!(err, GemmError::InvalidDtypes { .. }));
        assert!(err.is_configuration());
        assert!(!can_implement(&problem(256, 256, 64), &config));
    }
}
