//! Hardware description of the simulated accelerator
//!
//! Capacities default to a 100-class streaming multiprocessor: 227 KiB of
//! shared memory per unit, a 128-lane by 512-column accumulation memory and
//! 128 threads per unit arranged as four epilogue lanes.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::GemmResult;

/// Capacities and fixed costs of one compute unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareConfig {
    /// On-chip shared memory per unit, in bytes
    pub smem_capacity: usize,
    /// Columns of accumulation memory per unit (32-bit cells)
    pub tmem_columns: usize,
    /// Rows (lanes) of accumulation memory per unit
    pub tmem_lanes: usize,
    /// Lane groups that cooperate in the epilogue
    pub epilogue_lanes: usize,
    /// Concurrent tile groups resident per unit
    pub occupancy: usize,
    /// Bytes reserved for barrier storage
    pub barrier_reserve_bytes: usize,
    /// Alignment of staging buffers in shared memory
    pub buffer_align_bytes: usize,
}

impl HardwareConfig {
    pub fn sm100() -> Self {
        Self {
            smem_capacity: 232_448,
            tmem_columns: 512,
            tmem_lanes: 128,
            epilogue_lanes: 4,
            occupancy: 1,
            barrier_reserve_bytes: 1024,
            buffer_align_bytes: 1024,
        }
    }

    /// Same device with a different shared memory capacity
    pub fn with_smem_capacity(mut self, bytes: usize) -> Self {
        self.smem_capacity = bytes;
        self
    }

    pub fn from_json(text: &str) -> GemmResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> GemmResult<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self::sm100()
    }
}

impl std::fmt::Display for HardwareConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} B smem, {}x{} accumulation cells, {} epilogue lanes, occupancy {}",
            self.smem_capacity,
            self.tmem_lanes,
            self.tmem_columns,
            self.epilogue_lanes,
            self.occupancy
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_round_trip_of_custom_device() {
        let hw = HardwareConfig::sm100().with_smem_capacity(100_000);
        let json = hw.to_json().unwrap();
        let back = HardwareConfig::from_json(&json).unwrap();
        assert_eq!(back, hw);
    }

    #[test]
    fn test_bad_json_is_config_error() {
        let err = HardwareConfig::from_json("{ \"smem_capacity\": 1 }").unwrap_err();
        assert!(err.to_string().starts_with("Configuration error"));
    }
}
