//! Dense solid/empty voxel storage.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::grid::GridParameters;

const WORD_BITS: usize = u64::BITS as usize;

/// A dense bitfield marking which voxels of a [`GridParameters`] grid are solid.
///
/// Indexed with [`GridParameters::voxel_index`]. Written during rasterization, read-only afterwards.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct VoxelGrid {
    grid: GridParameters,
    words: Vec<u64>,
}

impl VoxelGrid {
    /// Creates a grid with every voxel empty.
    pub fn new(grid: GridParameters) -> Self {
        Self {
            grid,
            words: vec![0; word_count(grid.voxel_count())],
        }
    }

    /// The grid the voxels are laid out on.
    #[inline]
    pub fn grid(&self) -> &GridParameters {
        &self.grid
    }

    /// Whether the voxel at the given flat index is solid.
    #[inline]
    pub fn get_index(&self, index: usize) -> bool {
        debug_assert!(index < self.grid.voxel_count());
        self.words[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    /// Whether the voxel at the given coordinates is solid.
    #[inline]
    pub fn get(&self, x: u16, y: u16, z: u16) -> bool {
        self.get_index(self.grid.voxel_index(x, y, z))
    }

    /// Marks the voxel at the given flat index as solid.
    #[inline]
    pub fn set_index(&mut self, index: usize) {
        debug_assert!(index < self.grid.voxel_count());
        self.words[index / WORD_BITS] |= 1 << (index % WORD_BITS);
    }

    /// Marks the voxel at the given coordinates as solid.
    #[inline]
    pub fn set(&mut self, x: u16, y: u16, z: u16) {
        let index = self.grid.voxel_index(x, y, z);
        self.set_index(index);
    }

    /// Merges the solid voxels of `other` into `self`.
    ///
    /// Bitwise OR, so merging is idempotent, commutative and associative and
    /// partial grids can be combined in any order.
    pub fn union_with(&mut self, other: &VoxelGrid) {
        debug_assert_eq!(self.grid, other.grid, "cannot merge voxel grids of different shapes");
        for (word, other) in self.words.iter_mut().zip(&other.words) {
            *word |= *other;
        }
    }

    /// Consuming version of [`VoxelGrid::union_with`], handy as a reduction step.
    pub fn union(mut self, other: VoxelGrid) -> VoxelGrid {
        self.union_with(&other);
        self
    }

    /// The number of solid voxels.
    pub fn filled_count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Whether no voxel is solid.
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }
}

/// A [`VoxelGrid`] that can be written from many threads at once.
///
/// Writes are word-granular interlocked ORs, so concurrent writers never lose each other's bits.
#[derive(Debug)]
pub struct AtomicVoxelGrid {
    grid: GridParameters,
    words: Vec<AtomicU64>,
}

impl AtomicVoxelGrid {
    /// Creates a grid with every voxel empty.
    pub fn new(grid: GridParameters) -> Self {
        Self {
            grid,
            words: (0..word_count(grid.voxel_count()))
                .map(|_| AtomicU64::new(0))
                .collect(),
        }
    }

    /// Marks the voxel at the given flat index as solid.
    #[inline]
    pub fn set_index(&self, index: usize) {
        debug_assert!(index < self.grid.voxel_count());
        self.words[index / WORD_BITS].fetch_or(1 << (index % WORD_BITS), Ordering::Relaxed);
    }

    /// Merges a whole [`VoxelGrid`] in, one interlocked OR per non-empty word.
    pub fn union_with(&self, other: &VoxelGrid) {
        debug_assert_eq!(self.grid, other.grid, "cannot merge voxel grids of different shapes");
        for (word, other) in self.words.iter().zip(&other.words) {
            if *other != 0 {
                word.fetch_or(*other, Ordering::Relaxed);
            }
        }
    }

    /// Finishes concurrent writing.
    pub fn into_grid(self) -> VoxelGrid {
        VoxelGrid {
            grid: self.grid,
            words: self.words.into_iter().map(AtomicU64::into_inner).collect(),
        }
    }
}

#[inline]
fn word_count(voxel_count: usize) -> usize {
    voxel_count.div_ceil(WORD_BITS)
}

#[cfg(test)]
mod tests {
    use glam::Vec3;
    use rayon::prelude::*;

    use super::*;
    use crate::math::Aabb3d;

    fn grid() -> GridParameters {
        GridParameters::new(
            Aabb3d {
                min: Vec3::ZERO,
                max: Vec3::new(5.0, 7.0, 3.0),
            },
            1.0,
        )
        .unwrap()
    }

    #[test]
    fn set_and_get() {
        let mut voxels = VoxelGrid::new(grid());
        assert!(voxels.is_empty());
        voxels.set(4, 6, 2);
        voxels.set(0, 0, 0);
        assert!(voxels.get(4, 6, 2));
        assert!(voxels.get(0, 0, 0));
        assert!(!voxels.get(1, 0, 0));
        assert_eq!(voxels.filled_count(), 2);
    }

    #[test]
    fn union_is_idempotent() {
        let mut a = VoxelGrid::new(grid());
        a.set(1, 2, 0);
        let mut b = VoxelGrid::new(grid());
        b.set(3, 3, 1);
        b.set(1, 2, 0);

        let once = a.clone().union(b.clone());
        let twice = once.clone().union(b.clone()).union(a.clone());
        assert_eq!(once, twice);
        assert_eq!(once.filled_count(), 2);
        assert_eq!(once, b.union(a));
    }

    #[test]
    fn atomic_grid_collects_concurrent_writes() {
        let grid = grid();
        let atomic = AtomicVoxelGrid::new(grid);
        (0..grid.voxel_count())
            .into_par_iter()
            .filter(|i| i % 3 == 0)
            .for_each(|i| atomic.set_index(i));
        let voxels = atomic.into_grid();
        assert_eq!(voxels.filled_count(), grid.voxel_count().div_ceil(3));
        assert!(voxels.get_index(0));
        assert!(!voxels.get_index(1));
    }

    #[test]
    fn atomic_grid_merges_whole_grids() {
        let grid = grid();
        let parts: Vec<VoxelGrid> = (0..4_u16)
            .map(|x| {
                let mut part = VoxelGrid::new(grid);
                part.set(x, 0, 0);
                part.set(x + 1, 6, 2);
                part
            })
            .collect();
        let atomic = AtomicVoxelGrid::new(grid);
        parts.par_iter().for_each(|part| atomic.union_with(part));
        let merged = atomic.into_grid();

        let expected = parts.into_iter().reduce(VoxelGrid::union).unwrap();
        assert_eq!(merged, expected);
        assert_eq!(merged.filled_count(), 8);
    }
}
