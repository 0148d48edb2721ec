//! Tile geometry for the launch grid and the cluster of cooperating units
//!
//! For C = A @ B with C of shape MxNxL and a per-unit tile of cta_m x cta_n:
//! - the grid covers ceil(M / cta_m) x ceil(N / cta_n) x L units
//! - each grid dimension is rounded up to a whole number of clusters, so
//!   some launched units may sit entirely outside the output
//! - inside a cluster, units are addressed as (v, m, n) where v is the
//!   position inside a cooperative MMA pair

use serde::{Deserialize, Serialize};

use crate::dtype::ElementType;
use crate::problem::StoreMode;

pub fn ceil_div(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

pub fn round_up(a: usize, multiple: usize) -> usize {
    ceil_div(a, multiple) * multiple
}

/// Launch grid covering `c_shape` (M, N, L) with per-unit tiles of
/// `cta_tile_mn`, rounded up to whole clusters.
pub fn compute_grid(
    c_shape: (usize, usize, usize),
    cta_tile_mn: (usize, usize),
    cluster_shape_mn: (usize, usize),
) -> (usize, usize, usize) {
    let (m, n, l) = c_shape;
    (
        round_up(ceil_div(m, cta_tile_mn.0), cluster_shape_mn.0),
        round_up(ceil_div(n, cta_tile_mn.1), cluster_shape_mn.1),
        l,
    )
}

/// Position of a unit inside its cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CtaCoord {
    /// Index inside the cooperative MMA pair (always 0 without pairs)
    pub v: usize,
    /// Pair index along M
    pub m: usize,
    /// Index along N
    pub n: usize,
}

/// Cluster of units, divided into MMA pairs along M
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterLayout {
    pub atom_thr: usize,
    pub cluster_m: usize,
    pub cluster_n: usize,
}

impl ClusterLayout {
    pub fn new(atom_thr: usize, cluster_shape_mn: (usize, usize)) -> Self {
        Self {
            atom_thr,
            cluster_m: cluster_shape_mn.0,
            cluster_n: cluster_shape_mn.1,
        }
    }

    pub fn size(&self) -> usize {
        self.cluster_m * self.cluster_n
    }

    /// Units sharing one A tile (same M coordinate)
    pub fn num_mcast_ctas_a(&self) -> usize {
        self.cluster_n
    }

    /// Units sharing one B tile (same N coordinate and pair position)
    pub fn num_mcast_ctas_b(&self) -> usize {
        self.cluster_m / self.atom_thr
    }

    pub fn is_a_mcast(&self) -> bool {
        self.num_mcast_ctas_a() > 1
    }

    pub fn is_b_mcast(&self) -> bool {
        self.num_mcast_ctas_b() > 1
    }

    /// Consumer arrivals an operand "empty" barrier collects per phase
    pub fn num_operand_consumers(&self) -> usize {
        self.num_mcast_ctas_a() + self.num_mcast_ctas_b() - 1
    }

    pub fn coord(&self, rank: usize) -> CtaCoord {
        let cx = rank % self.cluster_m;
        let cy = rank / self.cluster_m;
        CtaCoord {
            v: cx % self.atom_thr,
            m: cx / self.atom_thr,
            n: cy,
        }
    }

    pub fn rank(&self, coord: CtaCoord) -> usize {
        let cx = coord.m * self.atom_thr + coord.v;
        cx + coord.n * self.cluster_m
    }

    pub fn is_leader(&self, rank: usize) -> bool {
        self.coord(rank).v == 0
    }

    /// Rank of the unit issuing MMAs for `rank`'s pair
    pub fn leader_of(&self, rank: usize) -> usize {
        let coord = self.coord(rank);
        self.rank(CtaCoord { v: 0, ..coord })
    }

    /// The other half of a cooperative pair
    pub fn partner_of(&self, rank: usize) -> Option<usize> {
        if self.atom_thr < 2 {
            return None;
        }
        let coord = self.coord(rank);
        Some(self.rank(CtaCoord {
            v: coord.v ^ 1,
            ..coord
        }))
    }

    /// Units receiving the A slices `rank` loads, ordered by N; the
    /// position of `rank` in this list is the slice it is responsible for.
    pub fn a_mcast_peers(&self, rank: usize) -> Vec<usize> {
        let coord = self.coord(rank);
        (0..self.cluster_n)
            .map(|n| self.rank(CtaCoord { n, ..coord }))
            .collect()
    }

    /// Units receiving the B slices `rank` loads, ordered by pair index.
    pub fn b_mcast_peers(&self, rank: usize) -> Vec<usize> {
        let coord = self.coord(rank);
        (0..self.num_mcast_ctas_b())
            .map(|m| self.rank(CtaCoord { m, ..coord }))
            .collect()
    }

    /// Units whose operand stages a leader reads, and therefore must
    /// release, for every stage it consumes.
    pub fn release_targets(&self, leader: usize) -> Vec<usize> {
        let coord = self.coord(leader);
        let mut targets = Vec::new();
        for v in 0..self.atom_thr {
            for n in 0..self.cluster_n {
                targets.push(self.rank(CtaCoord { v, m: coord.m, n }));
            }
            for m in 0..self.num_mcast_ctas_b() {
                if m != coord.m {
                    targets.push(self.rank(CtaCoord { v, m, n: coord.n }));
                }
            }
        }
        targets
    }

    /// Global block index of a unit of cluster `cluster_id`
    pub fn block_of(&self, grid: (usize, usize, usize), cluster_id: usize, rank: usize) -> (usize, usize, usize) {
        let clusters_x = grid.0 / self.cluster_m;
        let clusters_y = grid.1 / self.cluster_n;
        let cx_id = cluster_id % clusters_x;
        let cy_id = (cluster_id / clusters_x) % clusters_y;
        let z = cluster_id / (clusters_x * clusters_y);
        (
            cx_id * self.cluster_m + rank % self.cluster_m,
            cy_id * self.cluster_n + rank / self.cluster_m,
            z,
        )
    }

    pub fn num_clusters(&self, grid: (usize, usize, usize)) -> usize {
        (grid.0 / self.cluster_m) * (grid.1 / self.cluster_n) * grid.2
    }
}

/// Coordinate of a unit's tile in the output tensor
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TileCoord {
    /// Batch index
    pub batch: usize,
    /// Starting row in the full matrix
    pub start_row: usize,
    /// Starting column in the full matrix
    pub start_col: usize,
}

impl TileCoord {
    pub fn for_block(block: (usize, usize, usize), cta_tile_mn: (usize, usize)) -> Self {
        Self {
            batch: block.2,
            start_row: block.0 * cta_tile_mn.0,
            start_col: block.1 * cta_tile_mn.1,
        }
    }

    /// True when no element of the tile lies inside an MxN output
    pub fn is_outside(&self, m: usize, n: usize) -> bool {
        self.start_row >= m || self.start_col >= n
    }
}

/// Epilogue subtile shape for a per-unit tile.
///
/// Direct stores drain the whole tile at once. Staged stores go through
/// subtiles of at most 128 rows whose width keeps one staged row within
/// 128 bytes, falling back to 32 columns when that width does not divide
/// the tile.
pub fn epilogue_tile(cta_tile_mn: (usize, usize), c_dtype: ElementType, store_mode: StoreMode) -> (usize, usize) {
    let (cta_m, cta_n) = cta_tile_mn;
    match store_mode {
        StoreMode::Direct => (cta_m, cta_n),
        StoreMode::Staged => {
            let cap = (1024 / c_dtype.width()).min(cta_n);
            let epi_n = if cap > 0 && cta_n % cap == 0 { cap } else { 32.min(cta_n) };
            (cta_m.min(128), epi_n)
        }
    }
}

/// Ordered walk over the epilogue subtiles of one unit tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtileWalk {
    pub epi_tile: (usize, usize),
    pub count_m: usize,
    pub count_n: usize,
}

impl SubtileWalk {
    pub fn new(cta_tile_mn: (usize, usize), epi_tile: (usize, usize)) -> Self {
        Self {
            epi_tile,
            count_m: ceil_div(cta_tile_mn.0, epi_tile.0),
            count_n: ceil_div(cta_tile_mn.1, epi_tile.1),
        }
    }

    pub fn len(&self) -> usize {
        self.count_m * self.count_n
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (row, col) offset of a subtile inside the unit tile; M varies fastest
    pub fn offset(&self, index: usize) -> (usize, usize) {
        let sm = index % self.count_m;
        let sn = index / self.count_m;
        (sm * self.epi_tile.0, sn * self.epi_tile.1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_grid_exact_fit() {
        assert_eq!(compute_grid((256, 256, 1), (128, 128), (1, 1)), (2, 2, 1));
    }

    #[test]
    fn test_grid_rounds_to_cluster() {
        let grid = compute_grid((300, 200, 3), (128, 64), (4, 2));
        // ceil(300/128)=3 -> 4, ceil(200/64)=4 -> 4
        assert_eq!(grid, (4, 4, 3));
        assert_eq!(grid.0 % 4, 0);
        assert_eq!(grid.1 % 2, 0);
    }

    #[test]
    fn test_grid_is_pure() {
        let a = compute_grid((777, 333, 2), (64, 96), (2, 4));
        let b = compute_grid((777, 333, 2), (64, 96), (2, 4));
        assert_eq!(a, b);
        assert_eq!(a.0 % 2, 0);
        assert_eq!(a.1 % 4, 0);
    }

    #[test]
    fn test_grid_degenerates_to_empty() {
        assert_eq!(compute_grid((0, 256, 1), (128, 128), (2, 1)).0, 0);
        assert_eq!(compute_grid((256, 256, 0), (128, 128), (1, 1)).2, 0);
    }

    #[test]
    fn test_coord_rank_inverse() {
        let layout = ClusterLayout::new(2, (4, 2));
        for rank in 0..layout.size() {
            assert_eq!(layout.rank(layout.coord(rank)), rank);
        }
        assert_eq!(layout.coord(1), CtaCoord { v: 1, m: 0, n: 0 });
        assert_eq!(layout.coord(6), CtaCoord { v: 0, m: 1, n: 1 });
    }

    #[test]
    fn test_mcast_counts() {
        let layout = ClusterLayout::new(2, (4, 2));
        assert_eq!(layout.num_mcast_ctas_a(), 2);
        assert_eq!(layout.num_mcast_ctas_b(), 2);
        assert_eq!(layout.num_operand_consumers(), 3);

        let single = ClusterLayout::new(1, (1, 1));
        assert!(!single.is_a_mcast());
        assert!(!single.is_b_mcast());
        assert_eq!(single.num_operand_consumers(), 1);
    }

    #[test]
    fn test_pairs() {
        let layout = ClusterLayout::new(2, (2, 1));
        assert!(layout.is_leader(0));
        assert!(!layout.is_leader(1));
        assert_eq!(layout.leader_of(1), 0);
        assert_eq!(layout.partner_of(0), Some(1));
        assert_eq!(ClusterLayout::new(1, (2, 1)).partner_of(0), None);
    }

    #[test]
    fn test_every_unit_is_released_by_each_consumer_once() {
        let layout = ClusterLayout::new(2, (4, 4));
        let mut arrivals = vec![0; layout.size()];
        for rank in (0..layout.size()).filter(|r| layout.is_leader(*r)) {
            let targets = layout.release_targets(rank);
            let mut dedup = targets.clone();
            dedup.sort_unstable();
            dedup.dedup();
            assert_eq!(dedup.len(), targets.len());
            for t in targets {
                arrivals[t] += 1;
            }
        }
        assert!(arrivals.iter().all(|&a| a == layout.num_operand_consumers()));
    }

    #[test]
    fn test_block_of_covers_grid() {
        let layout = ClusterLayout::new(1, (2, 2));
        let grid = (4, 2, 2);
        let mut seen = std::collections::HashSet::new();
        for c in 0..layout.num_clusters(grid) {
            for r in 0..layout.size() {
                seen.insert(layout.block_of(grid, c, r));
            }
        }
        assert_eq!(seen.len(), 4 * 2 * 2);
    }

    #[test]
    fn test_epilogue_tiles() {
        assert_eq!(epilogue_tile((128, 128), ElementType::Float32, StoreMode::Staged), (128, 32));
        assert_eq!(epilogue_tile((128, 128), ElementType::Float16, StoreMode::Staged), (128, 64));
        assert_eq!(epilogue_tile((128, 96), ElementType::Float16, StoreMode::Staged), (128, 32));
        assert_eq!(epilogue_tile((64, 256), ElementType::Int8, StoreMode::Staged), (64, 128));
        assert_eq!(epilogue_tile((64, 96), ElementType::Float32, StoreMode::Direct), (64, 96));
    }

    #[test]
    fn test_subtile_walk() {
        let walk = SubtileWalk::new((128, 128), (128, 32));
        assert_eq!(walk.len(), 4);
        assert_eq!(walk.offset(0), (0, 0));
        assert_eq!(walk.offset(3), (0, 96));
    }
}
