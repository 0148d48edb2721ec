//! Problem and static kernel configuration types

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::dtype::ElementType;

/// Which mode of a (mode0, mode1, batch) tensor is contiguous
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MajorMode {
    /// mode1 contiguous: K for A and B, N for C
    RowMajor,
    /// mode0 contiguous: M for A and C, N for B
    ColumnMajor,
}

impl MajorMode {
    /// Parse the single-letter axis names used by the driver
    /// ("k"/"m" for A, "k"/"n" for B, "n"/"m" for C).
    pub fn from_axis(operand: char, axis: &str) -> Option<Self> {
        match (operand, axis) {
            ('a', "k") | ('b', "k") | ('c', "n") => Some(MajorMode::RowMajor),
            ('a', "m") | ('b', "n") | ('c', "m") => Some(MajorMode::ColumnMajor),
            _ => None,
        }
    }

    pub fn is_mode0_major(&self) -> bool {
        matches!(self, MajorMode::ColumnMajor)
    }
}

/// Logical description of one batched GEMM: C (MxNxL) = A (MxKxL) * B (NxKxL)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemDescriptor {
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub l: usize,
    pub ab_dtype: ElementType,
    pub c_dtype: ElementType,
    pub a_major: MajorMode,
    pub b_major: MajorMode,
    pub c_major: MajorMode,
}

impl ProblemDescriptor {
    /// Row-major problem with the given shape and element types
    pub fn new(mnkl: (usize, usize, usize, usize), ab_dtype: ElementType, c_dtype: ElementType) -> Self {
        let (m, n, k, l) = mnkl;
        Self {
            m,
            n,
            k,
            l,
            ab_dtype,
            c_dtype,
            a_major: MajorMode::RowMajor,
            b_major: MajorMode::RowMajor,
            c_major: MajorMode::RowMajor,
        }
    }

    pub fn with_majors(mut self, a: MajorMode, b: MajorMode, c: MajorMode) -> Self {
        self.a_major = a;
        self.b_major = b;
        self.c_major = c;
        self
    }

    pub fn a_shape(&self) -> (usize, usize, usize) {
        (self.m, self.k, self.l)
    }

    pub fn b_shape(&self) -> (usize, usize, usize) {
        (self.n, self.k, self.l)
    }

    pub fn c_shape(&self) -> (usize, usize, usize) {
        (self.m, self.n, self.l)
    }
}

impl fmt::Display for ProblemDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}x{}x{} (A/B {}, C {})",
            self.m, self.n, self.k, self.l, self.ab_dtype, self.c_dtype
        )
    }
}

/// How the epilogue writes the output tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreMode {
    /// Through on-chip staging buffers drained by the store engine
    Staged,
    /// Each lane writes its own values straight to the output
    Direct,
}

/// Static configuration fixed for the lifetime of a kernel object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GemmConfig {
    pub acc_dtype: ElementType,
    /// Two units jointly issue each MMA and share one accumulator
    pub use_2cta_instrs: bool,
    pub mma_tiler_mn: (usize, usize),
    pub cluster_shape_mn: (usize, usize),
    pub store_mode: StoreMode,
}

impl GemmConfig {
    pub fn new(
        acc_dtype: ElementType,
        use_2cta_instrs: bool,
        mma_tiler_mn: (usize, usize),
        cluster_shape_mn: (usize, usize),
        store_mode: StoreMode,
    ) -> Self {
        Self {
            acc_dtype,
            use_2cta_instrs,
            mma_tiler_mn,
            cluster_shape_mn,
            store_mode,
        }
    }

    /// Units that cooperate on one MMA instruction
    pub fn atom_thr(&self) -> usize {
        if self.use_2cta_instrs {
            2
        } else {
            1
        }
    }

    /// Per-unit output tile (M, N)
    pub fn cta_tile_mn(&self) -> (usize, usize) {
        (self.mma_tiler_mn.0 / self.atom_thr(), self.mma_tiler_mn.1)
    }

    pub fn is_staged(&self) -> bool {
        self.store_mode == StoreMode::Staged
    }
}

impl Default for GemmConfig {
    fn default() -> Self {
        Self::new(ElementType::Float32, false, (128, 128), (1, 1), StoreMode::Staged)
    }
}
