//! Element types understood by the pipeline
//!
//! Values travel through simulated memories as 32-bit words. Floating types
//! are kept as `f32` bit patterns holding an already-rounded value; integer
//! types are kept as `i32` bit patterns. Host code and the epilogue see
//! every element as an `f64`, which holds all of these exactly.

use std::fmt;
use std::str::FromStr;

use half::{bf16, f16};
use serde::{Deserialize, Serialize};

use crate::error::GemmError;

/// Numeric element type of a tensor, the accumulator or the output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    Float32,
    TFloat32,
    Float16,
    BFloat16,
    Int32,
    Int8,
    Uint8,
    Float8E4M3FN,
    Float8E5M2,
}

impl ElementType {
    pub const ALL: [ElementType; 9] = [
        ElementType::Float32,
        ElementType::TFloat32,
        ElementType::Float16,
        ElementType::BFloat16,
        ElementType::Int32,
        ElementType::Int8,
        ElementType::Uint8,
        ElementType::Float8E4M3FN,
        ElementType::Float8E5M2,
    ];

    /// Width in bits as seen by the memory system
    pub fn width(&self) -> usize {
        match self {
            ElementType::Float32 | ElementType::TFloat32 | ElementType::Int32 => 32,
            ElementType::Float16 | ElementType::BFloat16 => 16,
            ElementType::Int8
            | ElementType::Uint8
            | ElementType::Float8E4M3FN
            | ElementType::Float8E5M2 => 8,
        }
    }

    pub fn bytes(&self) -> usize {
        self.width() / 8
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            ElementType::Int32 | ElementType::Int8 | ElementType::Uint8
        )
    }

    /// Round a value to the nearest one representable in this type.
    ///
    /// Floats round to nearest-even, 8-bit floats saturate to their largest
    /// finite magnitude and integers round then saturate.
    pub fn quantize(&self, value: f64) -> f64 {
        match self {
            ElementType::Float32 => value as f32 as f64,
            ElementType::TFloat32 => to_tf32(value as f32) as f64,
            ElementType::Float16 => f16::from_f64(value).to_f64(),
            ElementType::BFloat16 => bf16::from_f64(value).to_f64(),
            ElementType::Float8E4M3FN => round_minifloat(value as f32, 3, -6, 448.0) as f64,
            ElementType::Float8E5M2 => round_minifloat(value as f32, 2, -14, 57344.0) as f64,
            ElementType::Int32 => saturate_int(value, i32::MIN as f64, i32::MAX as f64),
            ElementType::Int8 => saturate_int(value, i8::MIN as f64, i8::MAX as f64),
            ElementType::Uint8 => saturate_int(value, u8::MIN as f64, u8::MAX as f64),
        }
    }

    /// Quantize and pack a value into a memory word.
    pub fn encode(&self, value: f64) -> u32 {
        let q = self.quantize(value);
        if self.is_integer() {
            (q as i32) as u32
        } else {
            (q as f32).to_bits()
        }
    }

    /// Unpack a memory word written by [`ElementType::encode`].
    pub fn decode(&self, word: u32) -> f64 {
        if self.is_integer() {
            word as i32 as f64
        } else {
            f32::from_bits(word) as f64
        }
    }

    /// Value of an operand word as the MMA consumes it.
    ///
    /// Float32 operands are read with TFloat32 precision.
    pub fn mma_operand(&self, word: u32) -> f32 {
        match self {
            ElementType::Float32 | ElementType::TFloat32 => to_tf32(f32::from_bits(word)),
            _ => self.decode(word) as f32,
        }
    }

    /// Number of elements making up one 128-bit contiguous access.
    pub fn elems_per_128b(&self) -> usize {
        128 / self.width()
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElementType::Float32 => "Float32",
            ElementType::TFloat32 => "TFloat32",
            ElementType::Float16 => "Float16",
            ElementType::BFloat16 => "BFloat16",
            ElementType::Int32 => "Int32",
            ElementType::Int8 => "Int8",
            ElementType::Uint8 => "Uint8",
            ElementType::Float8E4M3FN => "Float8E4M3FN",
            ElementType::Float8E5M2 => "Float8E5M2",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for ElementType {
    type Err = GemmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        ElementType::ALL
            .iter()
            .copied()
            .find(|t| t.to_string().to_ascii_lowercase() == lowered)
            .ok_or_else(|| GemmError::dtypes(format!("unknown element type '{}'", s)))
    }
}

/// Round an f32 to TFloat32 (10 mantissa bits), ties to even.
pub fn to_tf32(value: f32) -> f32 {
    if !value.is_finite() {
        return value;
    }
    let bits = value.to_bits();
    let lsb = (bits >> 13) & 1;
    let rounded = bits.wrapping_add(0x0fff + lsb) & !0x1fff;
    f32::from_bits(rounded)
}

/// Round to a minifloat with `mantissa_bits` explicit mantissa bits and
/// smallest normal exponent `min_exp`, saturating at `max_finite`.
fn round_minifloat(value: f32, mantissa_bits: i32, min_exp: i32, max_finite: f32) -> f32 {
    if value.is_nan() {
        return value;
    }
    let magnitude = value.abs();
    if magnitude == 0.0 {
        return value;
    }
    if magnitude >= max_finite {
        return max_finite.copysign(value);
    }
    let biased = ((magnitude.to_bits() >> 23) & 0xff) as i32;
    let exp = (biased - 127).max(min_exp);
    let quantum = 2f32.powi(exp - mantissa_bits);
    let rounded = ((magnitude / quantum).round_ties_even() * quantum).min(max_finite);
    rounded.copysign(value)
}

fn saturate_int(value: f64, min: f64, max: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.round_ties_even().clamp(min, max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_widths() {
        assert_eq!(ElementType::Float32.width(), 32);
        assert_eq!(ElementType::BFloat16.bytes(), 2);
        assert_eq!(ElementType::Float8E5M2.elems_per_128b(), 16);
        assert_eq!(ElementType::TFloat32.elems_per_128b(), 4);
    }

    #[test]
    fn test_small_integers_are_exact_everywhere() {
        for ty in ElementType::ALL {
            for v in [-2.0, -1.0, 0.0, 1.0, 2.0] {
                if ty == ElementType::Uint8 && v < 0.0 {
                    continue;
                }
                assert_eq!(ty.quantize(v), v, "{} should hold {}", ty, v);
                assert_eq!(ty.decode(ty.encode(v)), v);
            }
        }
    }

    #[test]
    fn test_integer_saturation() {
        assert_eq!(ElementType::Int8.quantize(300.0), 127.0);
        assert_eq!(ElementType::Int8.quantize(-300.0), -128.0);
        assert_eq!(ElementType::Uint8.quantize(-3.0), 0.0);
        assert_eq!(ElementType::Int32.quantize(2.5), 2.0);
        assert_eq!(ElementType::Int32.quantize(3.5), 4.0);
    }

    #[test]
    fn test_fp8_rounding() {
        // e4m3: 3 mantissa bits, so 1.0625 rounds back to 1.0 and 17 to 16
        assert_eq!(ElementType::Float8E4M3FN.quantize(1.0625), 1.0);
        assert_eq!(ElementType::Float8E4M3FN.quantize(17.0), 16.0);
        assert_eq!(ElementType::Float8E4M3FN.quantize(1000.0), 448.0);
        assert_eq!(ElementType::Float8E5M2.quantize(5.0), 5.0);
        assert_eq!(ElementType::Float8E5M2.quantize(-1e6), -57344.0);
    }

    #[test]
    fn test_tf32_rounding() {
        let v = 1.0 + f32::EPSILON;
        assert_eq!(to_tf32(v), 1.0);
        assert_eq!(ElementType::Float32.mma_operand(v.to_bits()), 1.0);
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("float16".parse::<ElementType>().unwrap(), ElementType::Float16);
        assert_eq!("Float8E4M3FN".parse::<ElementType>().unwrap(), ElementType::Float8E4M3FN);
        assert!("float64".parse::<ElementType>().is_err());
    }
}
