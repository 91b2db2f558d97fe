//! Separating axis tests between voxels and rasterized primitives.
//!
//! All tests work in grid space, where a voxel is an axis-aligned unit cube.

use glam::{Mat3A, Vec3A};

use crate::geometry::OrientedBox;

/// Tolerance used when deciding whether two boxes merely touch.
const TOUCH_EPSILON: f32 = 1.0e-4;

/// Axes shorter than this are produced by parallel edges and carry no information.
const DEGENERATE_AXIS: f32 = 1.0e-8;

/// Whether a triangle overlaps an axis-aligned box.
///
/// Conservative: a triangle that only touches the box counts as overlapping. Callers that need
/// half-open voxels shrink the box.
pub fn triangle_intersects_aabb(triangle: &[Vec3A; 3], center: Vec3A, half_extents: Vec3A) -> bool {
    let v0 = triangle[0] - center;
    let v1 = triangle[1] - center;
    let v2 = triangle[2] - center;

    // Box face normals: compare the triangle's AABB against the box.
    let min = v0.min(v1).min(v2);
    let max = v0.max(v1).max(v2);
    if min.cmpgt(half_extents).any() || max.cmplt(-half_extents).any() {
        return false;
    }

    // Triangle face normal
    let e0 = v1 - v0;
    let e1 = v2 - v1;
    let e2 = v0 - v2;
    let normal = e0.cross(e1);
    let radius = half_extents.dot(normal.abs());
    if normal.dot(v0).abs() > radius {
        return false;
    }

    // Cross products of the box axes with the triangle edges
    for edge in [e0, e1, e2] {
        for axis in [Vec3A::X, Vec3A::Y, Vec3A::Z] {
            let axis = axis.cross(edge);
            if axis.length_squared() < DEGENERATE_AXIS {
                continue;
            }
            let p0 = v0.dot(axis);
            let p1 = v1.dot(axis);
            let p2 = v2.dot(axis);
            let radius = half_extents.dot(axis.abs());
            if p0.min(p1).min(p2) > radius || p0.max(p1).max(p2) < -radius {
                return false;
            }
        }
    }
    true
}

/// Whether an oriented box overlaps an axis-aligned box.
///
/// Strict: boxes that only share a face, edge or corner do not overlap, so a box that exactly
/// fills a voxel marks that voxel and none of its neighbors.
pub fn obb_intersects_aabb(obb: &OrientedBox, center: Vec3A, half_extents: Vec3A) -> bool {
    let offset = obb.center - center;
    let axes = obb.axes;
    let abs_axes = Mat3A::from_cols(axes.x_axis.abs(), axes.y_axis.abs(), axes.z_axis.abs());

    let separated = |axis: Vec3A| {
        let aabb_radius = half_extents.dot(axis.abs());
        let obb_radius = obb.half_extents.x * axes.x_axis.dot(axis).abs()
            + obb.half_extents.y * axes.y_axis.dot(axis).abs()
            + obb.half_extents.z * axes.z_axis.dot(axis).abs();
        offset.dot(axis).abs() >= aabb_radius + obb_radius - TOUCH_EPSILON
    };

    // The AABB's face normals
    let reach = abs_axes * obb.half_extents;
    if (offset.abs() - reach - half_extents)
        .cmpge(Vec3A::splat(-TOUCH_EPSILON))
        .any()
    {
        return false;
    }
    // The OBB's face normals
    if [axes.x_axis, axes.y_axis, axes.z_axis]
        .into_iter()
        .any(&separated)
    {
        return false;
    }
    // Edge-edge axes
    for obb_axis in [axes.x_axis, axes.y_axis, axes.z_axis] {
        for aabb_axis in [Vec3A::X, Vec3A::Y, Vec3A::Z] {
            let axis = aabb_axis.cross(obb_axis);
            let length_squared = axis.length_squared();
            if length_squared < DEGENERATE_AXIS {
                continue;
            }
            if separated(axis / length_squared.sqrt()) {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use std::f32::consts::FRAC_PI_4;

    use glam::Quat;

    use super::*;

    const HALF: Vec3A = Vec3A::splat(0.5);

    fn unit_obb(center: Vec3A, rotation: Quat) -> OrientedBox {
        OrientedBox {
            center,
            half_extents: HALF,
            axes: Mat3A::from_quat(rotation),
        }
    }

    #[test]
    fn triangle_through_voxel_intersects() {
        let triangle = [
            Vec3A::new(-1.0, 0.5, -1.0),
            Vec3A::new(2.0, 0.5, -1.0),
            Vec3A::new(-1.0, 0.5, 2.0),
        ];
        assert!(triangle_intersects_aabb(&triangle, HALF, HALF));
        assert!(!triangle_intersects_aabb(
            &triangle,
            Vec3A::new(0.5, 1.5, 0.5),
            HALF
        ));
    }

    #[test]
    fn triangle_on_voxel_face_touches_both_sides() {
        let triangle = [
            Vec3A::new(0.0, 1.0, 0.0),
            Vec3A::new(1.0, 1.0, 0.0),
            Vec3A::new(0.0, 1.0, 1.0),
        ];
        assert!(triangle_intersects_aabb(&triangle, HALF, HALF));
        assert!(triangle_intersects_aabb(
            &triangle,
            Vec3A::new(0.5, 1.5, 0.5),
            HALF
        ));
    }

    #[test]
    fn triangle_missing_corner_is_separated_by_edge_axis() {
        // The triangle's AABB overlaps the voxel, but the hypotenuse x + z = 2.2 passes beside it.
        let triangle = [
            Vec3A::new(2.2, 0.5, 0.0),
            Vec3A::new(0.0, 0.5, 2.2),
            Vec3A::new(2.2, 0.5, 2.2),
        ];
        assert!(!triangle_intersects_aabb(&triangle, HALF, HALF));
        assert!(triangle_intersects_aabb(
            &triangle,
            Vec3A::new(1.5, 0.5, 1.5),
            HALF
        ));
    }

    #[test]
    fn tilted_triangle_separated_by_its_plane() {
        // Plane x + y + z = 3.2 passes just beyond the far corner of the unit voxel.
        let triangle = [
            Vec3A::new(3.2, 0.0, 0.0),
            Vec3A::new(0.0, 3.2, 0.0),
            Vec3A::new(0.0, 0.0, 3.2),
        ];
        assert!(!triangle_intersects_aabb(&triangle, HALF, HALF));
        assert!(triangle_intersects_aabb(
            &triangle,
            Vec3A::new(1.5, 0.5, 0.5),
            HALF
        ));
    }

    #[test]
    fn coincident_box_overlaps_only_itself() {
        let obb = unit_obb(Vec3A::splat(1.5), Quat::IDENTITY);
        assert!(obb_intersects_aabb(&obb, Vec3A::splat(1.5), HALF));
        for neighbor in [
            Vec3A::new(2.5, 1.5, 1.5),
            Vec3A::new(0.5, 1.5, 1.5),
            Vec3A::new(1.5, 2.5, 1.5),
            Vec3A::new(2.5, 2.5, 2.5),
        ] {
            assert!(!obb_intersects_aabb(&obb, neighbor, HALF), "{neighbor}");
        }
    }

    #[test]
    fn rotated_box_reaches_face_neighbors_but_not_diagonal_ones() {
        // Rotated 45° around y, the box reaches ~0.707 along x and z.
        let obb = unit_obb(Vec3A::splat(1.5), Quat::from_rotation_y(FRAC_PI_4));
        assert!(obb_intersects_aabb(&obb, Vec3A::new(2.5, 1.5, 1.5), HALF));
        assert!(obb_intersects_aabb(&obb, Vec3A::new(1.5, 1.5, 0.5), HALF));
        // Separated by one of the box's own face normals
        assert!(!obb_intersects_aabb(&obb, Vec3A::new(2.5, 1.5, 2.5), HALF));
        // Separated along y
        assert!(!obb_intersects_aabb(&obb, Vec3A::new(1.5, 2.5, 1.5), HALF));
    }

    #[test]
    fn thin_diagonal_slab() {
        // Thin along (1, 0, 1) / sqrt(2), so it covers the plane x + z = 2.6.
        let obb = OrientedBox {
            center: Vec3A::new(1.3, 0.5, 1.3),
            half_extents: Vec3A::new(2.0, 2.0, 0.05),
            axes: Mat3A::from_quat(Quat::from_rotation_y(FRAC_PI_4)),
        };
        assert!(!obb_intersects_aabb(&obb, HALF, HALF));
        assert!(obb_intersects_aabb(&obb, Vec3A::new(1.5, 0.5, 1.5), HALF));
    }
}
