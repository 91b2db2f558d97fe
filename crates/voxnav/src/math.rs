use glam::{Vec3, Vec3A};

/// An axis-aligned bounding box in world space.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct Aabb3d {
    /// The minimum corner of the box
    pub min: Vec3,
    /// The maximum corner of the box
    pub max: Vec3,
}

impl Aabb3d {
    /// Creates a new AABB from its center and half extents.
    #[inline]
    pub fn new(center: impl Into<Vec3>, half_size: impl Into<Vec3>) -> Self {
        let center = center.into();
        let half_size = half_size.into();
        Self {
            min: center - half_size,
            max: center + half_size,
        }
    }

    /// Computes the AABB of the given points.
    /// Returns `None` if the iterator is empty.
    pub fn from_verts<'a>(vertices: impl IntoIterator<Item = &'a Vec3A>) -> Option<Self> {
        let mut iter = vertices.into_iter();
        let first = Vec3::from(*iter.next()?);
        let (min, max) = iter.fold((first, first), |(prev_min, prev_max), point| {
            let point = Vec3::from(*point);
            (point.min(prev_min), point.max(prev_max))
        });
        Some(Self { min, max })
    }

    /// Returns the smallest AABB containing both `self` and `other`.
    #[inline]
    pub fn union(&self, other: &Self) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// The size of the AABB along each axis.
    #[inline]
    pub fn extent(&self) -> Vec3 {
        self.max - self.min
    }

    /// Whether all coordinates are finite and `min <= max` on every axis.
    pub fn is_valid(&self) -> bool {
        self.min.is_finite() && self.max.is_finite() && self.min.cmple(self.max).all()
    }
}

/// The four axis directions on the xz-plane, in the order
/// left (-x), forward (+z), right (+x), backward (-z).
/// Rotating clockwise is `(dir + 1) & 3`.
pub(crate) const DIRECTIONS: [u8; 4] = [0, 1, 2, 3];

/// Gets the standard width (x-axis) offset for the specified direction.
/// # Arguments
/// - `direction`: The direction. [Limits: 0 <= value < 4]
/// # Returns
///
/// The width offset to apply to the current cell position to move in the direction.
#[inline]
pub(crate) fn dir_offset_x(direction: u8) -> i8 {
    const OFFSET: [i8; 4] = [-1, 0, 1, 0];
    OFFSET[direction as usize & 0x03]
}

/// Gets the standard depth (z-axis) offset for the specified direction.
/// # Arguments
/// - `direction`: The direction. [Limits: 0 <= value < 4]
/// # Returns
///
/// The depth offset to apply to the current cell position to move in the direction.
#[inline]
pub(crate) fn dir_offset_z(direction: u8) -> i8 {
    const OFFSET: [i8; 4] = [0, 1, 0, -1];
    OFFSET[direction as usize & 0x03]
}

/// The next direction clockwise.
#[inline]
pub(crate) fn rotate_cw(direction: u8) -> u8 {
    (direction + 1) & 0x03
}

/// The next direction counter-clockwise.
#[inline]
pub(crate) fn rotate_ccw(direction: u8) -> u8 {
    (direction + 3) & 0x03
}

/// The direction pointing the opposite way.
#[inline]
pub(crate) fn opposite(direction: u8) -> u8 {
    (direction + 2) & 0x03
}
