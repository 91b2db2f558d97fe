//! Mapping between a world-space bounding volume and an integer voxel grid.

use glam::{IVec3, Vec3};
use thiserror::Error;

use crate::math::Aabb3d;

/// How far below a voxel boundary `max` must reach to still claim the voxel above it.
const RANGE_EPSILON: f32 = 1.0e-4;

/// Maps a world-space AABB to a dense voxel grid.
///
/// Voxels are addressed x-major, y-mid, z-minor:
/// `index = (x * height + y) * depth + z`.
/// Columns are the vertical stacks of voxels at a given `(x, z)` and are addressed
/// `column = x * depth + z`.
///
/// Build with [`GridParameters::new`]. Immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct GridParameters {
    width: u16,
    height: u16,
    depth: u16,
    voxel_size: f32,
    min: Vec3,
    max: Vec3,
}

impl GridParameters {
    /// Creates the grid that covers `aabb` with cubic voxels of `voxel_size` world units.
    ///
    /// The grid's maximum corner is snapped upwards to a whole number of voxels, so the
    /// resulting [`GridParameters::aabb`] always contains the requested one.
    pub fn new(aabb: Aabb3d, voxel_size: f32) -> Result<Self, GridParametersError> {
        if voxel_size <= 0.0 || !voxel_size.is_finite() {
            return Err(GridParametersError::InvalidVoxelSize(voxel_size));
        }
        if !aabb.is_valid() {
            return Err(GridParametersError::InvalidBounds(aabb));
        }
        let cells = (aabb.extent() / voxel_size).ceil().max(Vec3::ONE);
        if cells.max_element() > u16::MAX as f32 {
            return Err(GridParametersError::DimensionTooLarge {
                width: cells.x,
                height: cells.y,
                depth: cells.z,
            });
        }
        let width = cells.x as u16;
        let height = cells.y as u16;
        let depth = cells.z as u16;
        let voxel_count = width as u128 * height as u128 * depth as u128;
        if voxel_count > usize::MAX as u128 {
            return Err(GridParametersError::VoxelCountTooLarge { voxel_count });
        }
        Ok(Self {
            width,
            height,
            depth,
            voxel_size,
            min: aabb.min,
            max: aabb.min + cells * voxel_size,
        })
    }

    /// The number of voxels along the x-axis.
    #[inline]
    pub fn width(&self) -> u16 {
        self.width
    }

    /// The number of voxels along the y-axis.
    #[inline]
    pub fn height(&self) -> u16 {
        self.height
    }

    /// The number of voxels along the z-axis.
    #[inline]
    pub fn depth(&self) -> u16 {
        self.depth
    }

    /// The edge length of a voxel in world units.
    #[inline]
    pub fn voxel_size(&self) -> f32 {
        self.voxel_size
    }

    /// The world-space volume covered by the grid.
    #[inline]
    pub fn aabb(&self) -> Aabb3d {
        Aabb3d {
            min: self.min,
            max: self.max,
        }
    }

    /// `width * height * depth`
    #[inline]
    pub fn voxel_count(&self) -> usize {
        self.width as usize * self.height as usize * self.depth as usize
    }

    /// `width * depth`
    #[inline]
    pub fn column_count(&self) -> usize {
        self.width as usize * self.depth as usize
    }

    /// The flat index of the voxel at the given grid coordinates.
    #[inline]
    pub fn voxel_index(&self, x: u16, y: u16, z: u16) -> usize {
        debug_assert!(x < self.width && y < self.height && z < self.depth);
        (x as usize * self.height as usize + y as usize) * self.depth as usize + z as usize
    }

    /// The flat index of the column at the given grid coordinates.
    #[inline]
    pub fn column_index(&self, x: u16, z: u16) -> usize {
        debug_assert!(x < self.width && z < self.depth);
        x as usize * self.depth as usize + z as usize
    }

    /// Inverse of [`GridParameters::column_index`].
    #[inline]
    pub fn column_coords(&self, column_index: usize) -> (u16, u16) {
        let depth = self.depth as usize;
        ((column_index / depth) as u16, (column_index % depth) as u16)
    }

    /// Whether the given column coordinates lie inside the grid.
    #[inline]
    pub fn contains_column(&self, x: i32, z: i32) -> bool {
        x >= 0 && x < self.width as i32 && z >= 0 && z < self.depth as i32
    }

    /// Converts a world-space position into continuous grid space,
    /// where voxel `(x, y, z)` covers `[x, x + 1) × [y, y + 1) × [z, z + 1)`.
    #[inline]
    pub fn world_to_grid(&self, point: Vec3) -> Vec3 {
        (point - self.min) / self.voxel_size
    }

    /// Converts a grid-space position back into world space.
    #[inline]
    pub fn grid_to_world(&self, point: Vec3) -> Vec3 {
        self.min + point * self.voxel_size
    }

    /// The voxel range overlapped by a grid-space AABB, clamped to the grid.
    /// Returns `None` if the AABB lies entirely outside the grid.
    ///
    /// Voxels are half-open: one that only touches `max` is not part of the range, unless the
    /// AABB is flat on that axis.
    pub(crate) fn clamp_voxel_range(&self, min: Vec3, max: Vec3) -> Option<(IVec3, IVec3)> {
        let size = IVec3::new(self.width as i32, self.height as i32, self.depth as i32);
        let lo = min.floor().as_ivec3();
        let hi = (max - RANGE_EPSILON).floor().as_ivec3().max(lo);
        if hi.cmplt(IVec3::ZERO).any() || lo.cmpge(size).any() {
            return None;
        }
        Some((lo.max(IVec3::ZERO), hi.min(size - IVec3::ONE)))
    }
}

/// Errors that can occur when building [`GridParameters`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GridParametersError {
    /// The voxel size was zero, negative or not finite.
    #[error("Voxel size must be positive and finite, but got {0}")]
    InvalidVoxelSize(f32),
    /// The bounds were not finite or inverted.
    #[error("Grid bounds must be finite with min <= max, but got {0:?}")]
    InvalidBounds(Aabb3d),
    /// A single dimension does not fit into 16 bits.
    #[error("Grid dimensions {width}x{height}x{depth} exceed the maximum of {max} voxels per axis", max = u16::MAX)]
    DimensionTooLarge {
        /// Voxels along the x-axis
        width: f32,
        /// Voxels along the y-axis
        height: f32,
        /// Voxels along the z-axis
        depth: f32,
    },
    /// The total voxel count does not fit into memory.
    #[error("Voxel count {voxel_count} is too large, max is {max}", max = usize::MAX)]
    VoxelCountTooLarge {
        /// width * height * depth
        voxel_count: u128,
    },
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    fn grid() -> GridParameters {
        GridParameters::new(
            Aabb3d {
                min: Vec3::new(-1.0, 0.0, 2.0),
                max: Vec3::new(1.0, 3.0, 2.5),
            },
            0.5,
        )
        .unwrap()
    }

    #[test]
    fn dimensions_round_up() {
        let grid = grid();
        assert_eq!(grid.width(), 4);
        assert_eq!(grid.height(), 6);
        assert_eq!(grid.depth(), 1);
        assert_eq!(grid.voxel_count(), 24);
        assert_eq!(grid.column_count(), 4);
    }

    #[test]
    fn snapped_bounds_contain_input() {
        let grid = GridParameters::new(
            Aabb3d {
                min: Vec3::ZERO,
                max: Vec3::new(1.1, 1.0, 0.2),
            },
            0.5,
        )
        .unwrap();
        assert_eq!(grid.width(), 3);
        assert_relative_eq!(grid.aabb().max.x, 1.5);
        assert_relative_eq!(grid.aabb().max.z, 0.5);
    }

    #[test]
    fn voxel_indices_are_dense_and_unique() {
        let grid = grid();
        let mut seen = vec![false; grid.voxel_count()];
        for x in 0..grid.width() {
            for y in 0..grid.height() {
                for z in 0..grid.depth() {
                    let index = grid.voxel_index(x, y, z);
                    assert!(!seen[index]);
                    seen[index] = true;
                }
            }
        }
        assert!(seen.into_iter().all(|s| s));
    }

    #[test]
    fn column_coords_round_trip() {
        let grid = grid();
        for x in 0..grid.width() {
            for z in 0..grid.depth() {
                assert_eq!(grid.column_coords(grid.column_index(x, z)), (x, z));
            }
        }
    }

    #[test]
    fn world_grid_conversion() {
        let grid = grid();
        let world = Vec3::new(0.25, 1.0, 2.25);
        let local = grid.world_to_grid(world);
        assert_relative_eq!(local.x, 2.5);
        assert_relative_eq!(local.y, 2.0);
        assert_relative_eq!(local.z, 0.5);
        let back = grid.grid_to_world(local);
        assert_relative_eq!(back.x, world.x);
        assert_relative_eq!(back.y, world.y);
        assert_relative_eq!(back.z, world.z);
    }

    #[test]
    fn clamps_voxel_ranges() {
        let grid = grid();
        let (lo, hi) = grid
            .clamp_voxel_range(Vec3::new(-3.0, 1.5, -1.0), Vec3::new(1.2, 10.0, 0.3))
            .unwrap();
        assert_eq!(lo, IVec3::new(0, 1, 0));
        assert_eq!(hi, IVec3::new(1, 5, 0));
        assert!(
            grid.clamp_voxel_range(Vec3::splat(-5.0), Vec3::splat(-4.0))
                .is_none()
        );
    }

    #[test]
    fn voxels_only_touching_the_max_side_are_excluded() {
        let grid = grid();
        let (lo, hi) = grid
            .clamp_voxel_range(Vec3::new(0.0, 1.0, 0.0), Vec3::new(1.0, 3.0, 1.0))
            .unwrap();
        assert_eq!(lo, IVec3::new(0, 1, 0));
        assert_eq!(hi, IVec3::new(0, 2, 0));
        // Flat on y: the voxel above the plane is kept.
        let (lo, hi) = grid
            .clamp_voxel_range(Vec3::new(0.5, 2.0, 0.0), Vec3::new(1.5, 2.0, 0.5))
            .unwrap();
        assert_eq!(lo, IVec3::new(0, 2, 0));
        assert_eq!(hi, IVec3::new(1, 2, 0));
    }

    #[test]
    fn rejects_invalid_input() {
        let aabb = Aabb3d::new(Vec3::ZERO, Vec3::ONE);
        assert_eq!(
            GridParameters::new(aabb, 0.0),
            Err(GridParametersError::InvalidVoxelSize(0.0))
        );
        let inverted = Aabb3d {
            min: Vec3::ONE,
            max: Vec3::ZERO,
        };
        assert!(matches!(
            GridParameters::new(inverted, 1.0),
            Err(GridParametersError::InvalidBounds(_))
        ));
        assert!(matches!(
            GridParameters::new(Aabb3d::new(Vec3::ZERO, Vec3::splat(1.0e6)), 0.01),
            Err(GridParametersError::DimensionTooLarge { .. })
        ));
    }
}
