//! Accumulation memory
//!
//! Each unit has a lanes x columns array of 32-bit cells. Columns are handed
//! out in 32-column granules by a lock-free allocator. In cooperative mode
//! the two partners release their columns through a rendezvous on each
//! other's dealloc barrier.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::dtype::ElementType;

/// Allocation granule in columns
pub const TMEM_GRANULE: usize = 32;

/// Columns to allocate for an accumulator `tile_n` wide
pub fn alloc_columns(tile_n: usize) -> usize {
    tile_n.next_power_of_two().max(TMEM_GRANULE)
}

#[derive(Debug)]
pub struct TensorMemory {
    lanes: usize,
    columns: usize,
    cells: Vec<AtomicU32>,
    allocator: TmemAllocator,
}

impl TensorMemory {
    pub fn new(lanes: usize, columns: usize) -> Self {
        Self {
            lanes,
            columns,
            cells: (0..lanes * columns).map(|_| AtomicU32::new(0)).collect(),
            allocator: TmemAllocator::new(columns),
        }
    }

    pub fn lanes(&self) -> usize {
        self.lanes
    }

    pub fn columns(&self) -> usize {
        self.columns
    }

    /// Allocate `columns` columns and clear them
    pub fn alloc(&self, columns: usize) -> Option<usize> {
        let base = self.allocator.alloc(columns)?;
        for lane in 0..self.lanes {
            for col in base..base + columns {
                self.cells[lane * self.columns + col].store(0, Ordering::Relaxed);
            }
        }
        Some(base)
    }

    pub fn dealloc(&self, base: usize, columns: usize) {
        self.allocator.free(base, columns);
    }

    pub fn load(&self, lane: usize, column: usize) -> u32 {
        self.cells[lane * self.columns + column].load(Ordering::Relaxed)
    }

    pub fn store(&self, lane: usize, column: usize, word: u32) {
        self.cells[lane * self.columns + column].store(word, Ordering::Relaxed);
    }

    /// Accumulator cell as a value of `acc` type
    pub fn read_acc(&self, acc: ElementType, lane: usize, column: usize) -> f64 {
        acc.decode(self.load(lane, column))
    }

    pub fn allocated_columns(&self) -> usize {
        self.allocator.allocated() * TMEM_GRANULE
    }
}

/// Bitmask allocator over 32-column granules
#[derive(Debug)]
pub struct TmemAllocator {
    granules: usize,
    used: AtomicU32,
}

impl TmemAllocator {
    pub fn new(columns: usize) -> Self {
        Self {
            granules: (columns / TMEM_GRANULE).min(32),
            used: AtomicU32::new(0),
        }
    }

    /// First-fit allocation of a contiguous granule run
    pub fn alloc(&self, columns: usize) -> Option<usize> {
        let want = (columns + TMEM_GRANULE - 1) / TMEM_GRANULE;
        if want == 0 || want > self.granules {
            return None;
        }
        let run = if want == 32 { u32::MAX } else { (1u32 << want) - 1 };
        let mut current = self.used.load(Ordering::Acquire);
        loop {
            let start = (0..=self.granules - want).find(|s| current & (run << s) == 0)?;
            let next = current | (run << start);
            match self
                .used
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(start * TMEM_GRANULE),
                Err(observed) => current = observed,
            }
        }
    }

    pub fn free(&self, base: usize, columns: usize) {
        let want = (columns + TMEM_GRANULE - 1) / TMEM_GRANULE;
        let run = if want >= 32 { u32::MAX } else { (1u32 << want) - 1 };
        self.used
            .fetch_and(!(run << (base / TMEM_GRANULE)), Ordering::AcqRel);
    }

    pub fn allocated(&self) -> usize {
        self.used.load(Ordering::Acquire).count_ones() as usize
    }
}
