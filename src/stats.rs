//! Counters collected while kernels run

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

/// Live counters shared by every unit of every launch of one compiled kernel
#[derive(Debug, Default)]
pub struct KernelStats {
    operand_elems_landed: AtomicUsize,
    operand_elems_consumed: AtomicUsize,
    k_blocks_consumed: AtomicUsize,
    subtiles_staged: AtomicUsize,
    subtiles_stored: AtomicUsize,
    tiles_completed: AtomicUsize,
    max_operand_occupancy: AtomicUsize,
    max_store_groups_in_flight: AtomicUsize,
}

impl KernelStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_landed(&self, elems: usize) {
        self.operand_elems_landed.fetch_add(elems, Ordering::Relaxed);
    }

    pub fn add_consumed(&self, elems: usize) {
        self.operand_elems_consumed.fetch_add(elems, Ordering::Relaxed);
    }

    pub fn add_k_block(&self) {
        self.k_blocks_consumed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_staged(&self) {
        self.subtiles_staged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_stored(&self) {
        self.subtiles_stored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_tile(&self) {
        self.tiles_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_operand_occupancy(&self, occupancy: usize) {
        self.max_operand_occupancy.fetch_max(occupancy, Ordering::Relaxed);
    }

    pub fn observe_store_in_flight(&self, groups: usize) {
        self.max_store_groups_in_flight.fetch_max(groups, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            operand_elems_landed: self.operand_elems_landed.load(Ordering::Relaxed),
            operand_elems_consumed: self.operand_elems_consumed.load(Ordering::Relaxed),
            k_blocks_consumed: self.k_blocks_consumed.load(Ordering::Relaxed),
            subtiles_staged: self.subtiles_staged.load(Ordering::Relaxed),
            subtiles_stored: self.subtiles_stored.load(Ordering::Relaxed),
            tiles_completed: self.tiles_completed.load(Ordering::Relaxed),
            max_operand_occupancy: self.max_operand_occupancy.load(Ordering::Relaxed),
            max_store_groups_in_flight: self.max_store_groups_in_flight.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub operand_elems_landed: usize,
    pub operand_elems_consumed: usize,
    pub k_blocks_consumed: usize,
    pub subtiles_staged: usize,
    pub subtiles_stored: usize,
    pub tiles_completed: usize,
    pub max_operand_occupancy: usize,
    pub max_store_groups_in_flight: usize,
}
