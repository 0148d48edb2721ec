//! Host tensors
//!
//! A tensor is a (mode0, mode1, batch) array of element words with one
//! contiguous mode. Cloning a tensor clones the handle, not the data, so a
//! launch can write the output while the caller keeps its own handle.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::dtype::ElementType;
use crate::epilogue::EpilogueOp;
use crate::problem::MajorMode;

#[derive(Clone)]
pub struct Tensor {
    shape: (usize, usize, usize),
    dtype: ElementType,
    major: MajorMode,
    data: Arc<[AtomicU32]>,
}

impl Tensor {
    pub fn zeros(shape: (usize, usize, usize), dtype: ElementType, major: MajorMode) -> Self {
        let len = shape.0 * shape.1 * shape.2;
        let data: Vec<AtomicU32> = (0..len).map(|_| AtomicU32::new(dtype.encode(0.0))).collect();
        Self {
            shape,
            dtype,
            major,
            data: data.into(),
        }
    }

    pub fn from_fn(
        shape: (usize, usize, usize),
        dtype: ElementType,
        major: MajorMode,
        f: impl Fn(usize, usize, usize) -> f64,
    ) -> Self {
        let tensor = Self::zeros(shape, dtype, major);
        for l in 0..shape.2 {
            for i in 0..shape.0 {
                for j in 0..shape.1 {
                    tensor.set(i, j, l, f(i, j, l));
                }
            }
        }
        tensor
    }

    /// Small random integers: [-2, 2], or [0, 4] for unsigned types
    pub fn random(shape: (usize, usize, usize), dtype: ElementType, major: MajorMode, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let (lo, hi) = if dtype == ElementType::Uint8 { (0, 4) } else { (-2, 2) };
        let tensor = Self::zeros(shape, dtype, major);
        for l in 0..shape.2 {
            for i in 0..shape.0 {
                for j in 0..shape.1 {
                    tensor.set(i, j, l, rng.gen_range(lo..=hi) as f64);
                }
            }
        }
        tensor
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        self.shape
    }

    pub fn dtype(&self) -> ElementType {
        self.dtype
    }

    pub fn major(&self) -> MajorMode {
        self.major
    }

    fn offset(&self, i: usize, j: usize, l: usize) -> usize {
        let (m0, m1, _) = self.shape;
        let batch = l * m0 * m1;
        match self.major {
            MajorMode::RowMajor => batch + i * m1 + j,
            MajorMode::ColumnMajor => batch + j * m0 + i,
        }
    }

    pub fn contains(&self, i: usize, j: usize) -> bool {
        i < self.shape.0 && j < self.shape.1
    }

    pub fn load_word(&self, i: usize, j: usize, l: usize) -> u32 {
        self.data[self.offset(i, j, l)].load(Ordering::Relaxed)
    }

    pub fn store_word(&self, i: usize, j: usize, l: usize, word: u32) {
        self.data[self.offset(i, j, l)].store(word, Ordering::Relaxed);
    }

    pub fn get(&self, i: usize, j: usize, l: usize) -> f64 {
        self.dtype.decode(self.load_word(i, j, l))
    }

    pub fn set(&self, i: usize, j: usize, l: usize, value: f64) {
        self.store_word(i, j, l, self.dtype.encode(value));
    }

    /// Values in (batch, mode0, mode1) order regardless of the major mode
    pub fn to_vec(&self) -> Vec<f64> {
        let (m0, m1, batches) = self.shape;
        let mut out = Vec::with_capacity(m0 * m1 * batches);
        for l in 0..batches {
            for i in 0..m0 {
                for j in 0..m1 {
                    out.push(self.get(i, j, l));
                }
            }
        }
        out
    }

    /// Largest absolute elementwise difference; infinite when shapes differ
    pub fn max_abs_diff(&self, other: &Tensor) -> f64 {
        if self.shape != other.shape {
            return f64::INFINITY;
        }
        self.to_vec()
            .iter()
            .zip(other.to_vec())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max)
    }

    /// "<dtype> <m0>x<m1>x<l> <major>" used in mismatch reports
    pub fn describe(&self) -> String {
        format!(
            "{} {}x{}x{} {:?}",
            self.dtype, self.shape.0, self.shape.1, self.shape.2, self.major
        )
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor({})", self.describe())
    }
}

/// Host reference for C = epilogue(A @ B^T) per batch, with A as MxKxL and
/// B as NxKxL.
///
/// Products accumulate in f64 from the values the MMA would see, so the
/// result differs from the device only by accumulator rounding.
pub fn reference_gemm(
    a: &Tensor,
    b: &Tensor,
    c_dtype: ElementType,
    c_major: MajorMode,
    epilogue: &EpilogueOp,
) -> Tensor {
    let (m, k, l) = a.shape();
    let n = b.shape().0;
    let out = Tensor::zeros((m, n, l), c_dtype, c_major);
    for batch in 0..l {
        for i in 0..m {
            for j in 0..n {
                let acc: f64 = (0..k)
                    .map(|kk| {
                        let x = a.dtype().mma_operand(a.load_word(i, kk, batch)) as f64;
                        let y = b.dtype().mma_operand(b.load_word(j, kk, batch)) as f64;
                        x * y
                    })
                    .sum();
                out.set(i, j, batch, epilogue(c_dtype.quantize(acc)));
            }
        }
    }
    out
}
