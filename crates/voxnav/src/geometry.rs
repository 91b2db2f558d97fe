//! The solid geometry consumed by rasterization: triangle meshes and oriented boxes,
//! each carrying its own local-to-world transform.

use glam::{Affine3A, Mat3A, Quat, Vec3, Vec3A};
use rayon::prelude::*;

use crate::math::Aabb3d;

/// A triangle mesh placed in the world.
///
/// World-space vertices are `position + rotation * (scale * vertex)`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct MeshInstance {
    /// Local-space vertex positions.
    pub vertices: Vec<Vec3>,
    /// Triangle list indices into [`MeshInstance::vertices`]. Length must be a multiple of 3.
    pub indices: Vec<u32>,
    /// Local rotation
    pub rotation: Quat,
    /// Local scale. Negative components mirror the mesh.
    pub scale: Vec3,
    /// World position
    pub position: Vec3,
}

impl Default for MeshInstance {
    fn default() -> Self {
        Self {
            vertices: Vec::new(),
            indices: Vec::new(),
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
            position: Vec3::ZERO,
        }
    }
}

impl MeshInstance {
    /// Creates an untransformed mesh.
    pub fn new(vertices: Vec<Vec3>, indices: Vec<u32>) -> Self {
        Self {
            vertices,
            indices,
            ..Default::default()
        }
    }

    /// Sets the transform of the mesh.
    pub fn with_transform(mut self, position: Vec3, rotation: Quat, scale: Vec3) -> Self {
        self.position = position;
        self.rotation = rotation;
        self.scale = scale;
        self
    }

    /// The local-to-world transform of the mesh.
    #[inline]
    pub fn transform(&self) -> Affine3A {
        Affine3A::from_scale_rotation_translation(self.scale, self.rotation, self.position)
    }

    /// Whether the transform mirrors the mesh, which flips the triangle winding.
    #[inline]
    pub fn is_mirrored(&self) -> bool {
        self.scale.x * self.scale.y * self.scale.z < 0.0
    }

    /// The number of triangles in the mesh.
    #[inline]
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// The vertices transformed into world space.
    pub fn world_vertices(&self) -> Vec<Vec3A> {
        let transform = self.transform();
        self.vertices
            .iter()
            .map(|v| transform.transform_point3a(Vec3A::from(*v)))
            .collect()
    }

    /// Computes the world-space AABB of the mesh.
    /// Returns `None` if the mesh has no vertices.
    pub fn compute_aabb(&self) -> Option<Aabb3d> {
        Aabb3d::from_verts(&self.world_vertices())
    }

    /// Creates an axis-aligned cuboid mesh centered at the origin with the given full size.
    /// Triangles are wound counter-clockwise when seen from outside.
    pub fn cuboid(size: Vec3) -> Self {
        let h = size * 0.5;
        let vertices = vec![
            Vec3::new(-h.x, -h.y, -h.z),
            Vec3::new(h.x, -h.y, -h.z),
            Vec3::new(h.x, -h.y, h.z),
            Vec3::new(-h.x, -h.y, h.z),
            Vec3::new(-h.x, h.y, -h.z),
            Vec3::new(h.x, h.y, -h.z),
            Vec3::new(h.x, h.y, h.z),
            Vec3::new(-h.x, h.y, h.z),
        ];
        #[rustfmt::skip]
        let indices = vec![
            // bottom (-y)
            0, 1, 2, 0, 2, 3,
            // top (+y)
            4, 6, 5, 4, 7, 6,
            // back (-z)
            0, 5, 1, 0, 4, 5,
            // front (+z)
            3, 2, 6, 3, 6, 7,
            // left (-x)
            0, 3, 7, 0, 7, 4,
            // right (+x)
            1, 5, 6, 1, 6, 2,
        ];
        Self::new(vertices, indices)
    }
}

/// A solid box placed in the world.
///
/// The box is centered at `position + rotation * (scale * center)`, has the
/// half extents `|scale * size| / 2` and is oriented by `rotation`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct BoxInstance {
    /// Local center of the box
    pub center: Vec3,
    /// Local full size of the box
    pub size: Vec3,
    /// Local rotation
    pub rotation: Quat,
    /// Local scale
    pub scale: Vec3,
    /// World position
    pub position: Vec3,
}

impl Default for BoxInstance {
    fn default() -> Self {
        Self {
            center: Vec3::ZERO,
            size: Vec3::ONE,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
            position: Vec3::ZERO,
        }
    }
}

impl BoxInstance {
    /// An axis-aligned box with the given world-space center and full size.
    pub fn axis_aligned(center: Vec3, size: Vec3) -> Self {
        Self {
            position: center,
            size,
            ..Default::default()
        }
    }

    /// The box in world space.
    pub fn world_obb(&self) -> OrientedBox {
        let scaled_center = self.scale * self.center;
        OrientedBox {
            center: Vec3A::from(self.position + self.rotation * scaled_center),
            half_extents: Vec3A::from((self.scale * self.size).abs() * 0.5),
            axes: Mat3A::from_quat(self.rotation),
        }
    }

    /// Computes the world-space AABB of the box.
    pub fn compute_aabb(&self) -> Aabb3d {
        self.world_obb().aabb()
    }
}

/// A box with arbitrary orientation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrientedBox {
    /// Center of the box
    pub center: Vec3A,
    /// Half the size of the box along each of its local axes
    pub half_extents: Vec3A,
    /// The local axes of the box as the columns of a rotation matrix
    pub axes: Mat3A,
}

impl OrientedBox {
    /// The axis-aligned bounds of the box.
    pub fn aabb(&self) -> Aabb3d {
        let abs = Mat3A::from_cols(
            self.axes.x_axis.abs(),
            self.axes.y_axis.abs(),
            self.axes.z_axis.abs(),
        );
        let reach = Vec3::from(abs * self.half_extents);
        let center = Vec3::from(self.center);
        Aabb3d {
            min: center - reach,
            max: center + reach,
        }
    }

    /// Maps the box into another space by an affine `scale * point + offset`,
    /// with a uniform positive `scale`.
    pub(crate) fn scaled(&self, scale: f32, offset: Vec3A) -> Self {
        Self {
            center: self.center * scale + offset,
            half_extents: self.half_extents * scale,
            axes: self.axes,
        }
    }
}

/// All geometry that makes up a scene.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct GeometryInput {
    /// Triangle meshes
    pub meshes: Vec<MeshInstance>,
    /// Solid boxes
    pub boxes: Vec<BoxInstance>,
}

impl GeometryInput {
    /// Computes the world-space AABB of all geometry.
    /// Returns `None` if there is no geometry.
    pub fn compute_aabb(&self) -> Option<Aabb3d> {
        let meshes = self.meshes.iter().filter_map(MeshInstance::compute_aabb);
        let boxes = self.boxes.iter().map(BoxInstance::compute_aabb);
        meshes.chain(boxes).reduce(|a, b| a.union(&b))
    }

    /// Same as [`GeometryInput::compute_aabb`], but fans the per-item bounds out over
    /// the rayon thread pool and unions them in a reduction.
    pub fn par_compute_aabb(&self) -> Option<Aabb3d> {
        let meshes = self
            .meshes
            .par_iter()
            .filter_map(MeshInstance::compute_aabb)
            .reduce_with(|a, b| a.union(&b));
        let boxes = self
            .boxes
            .par_iter()
            .map(BoxInstance::compute_aabb)
            .reduce_with(|a, b| a.union(&b));
        match (meshes, boxes) {
            (Some(a), Some(b)) => Some(a.union(&b)),
            (a, b) => a.or(b),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::f32::consts::FRAC_PI_2;

    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn mesh_transform_applies_scale_then_rotation_then_translation() {
        let mesh = MeshInstance::new(vec![Vec3::X], vec![]).with_transform(
            Vec3::new(0.0, 1.0, 0.0),
            Quat::from_rotation_y(FRAC_PI_2),
            Vec3::splat(2.0),
        );
        let v = mesh.world_vertices()[0];
        assert_relative_eq!(v.x, 0.0, epsilon = 1e-5);
        assert_relative_eq!(v.y, 1.0, epsilon = 1e-5);
        assert_relative_eq!(v.z, -2.0, epsilon = 1e-5);
    }

    #[test]
    fn mirrored_mesh_is_detected() {
        let mesh = MeshInstance::cuboid(Vec3::ONE).with_transform(
            Vec3::ZERO,
            Quat::IDENTITY,
            Vec3::new(-1.0, 1.0, 1.0),
        );
        assert!(mesh.is_mirrored());
        assert!(!MeshInstance::cuboid(Vec3::ONE).is_mirrored());
    }

    #[test]
    fn rotated_box_aabb_grows() {
        let b = BoxInstance {
            rotation: Quat::from_rotation_y(std::f32::consts::FRAC_PI_4),
            size: Vec3::new(2.0, 2.0, 2.0),
            ..Default::default()
        };
        let aabb = b.compute_aabb();
        assert_relative_eq!(aabb.max.x, 2.0_f32.sqrt(), epsilon = 1e-5);
        assert_relative_eq!(aabb.max.y, 1.0, epsilon = 1e-5);
    }

    #[test]
    fn box_center_is_scaled_and_rotated() {
        let b = BoxInstance {
            center: Vec3::new(1.0, 0.0, 0.0),
            scale: Vec3::splat(3.0),
            rotation: Quat::from_rotation_z(FRAC_PI_2),
            position: Vec3::new(0.0, 0.0, 5.0),
            ..Default::default()
        };
        let obb = b.world_obb();
        assert_relative_eq!(obb.center.x, 0.0, epsilon = 1e-5);
        assert_relative_eq!(obb.center.y, 3.0, epsilon = 1e-5);
        assert_relative_eq!(obb.center.z, 5.0, epsilon = 1e-5);
        assert_relative_eq!(obb.half_extents.x, 1.5, epsilon = 1e-5);
    }

    #[test]
    fn parallel_aabb_matches_sequential() {
        let input = GeometryInput {
            meshes: (0..16)
                .map(|i| {
                    MeshInstance::cuboid(Vec3::ONE).with_transform(
                        Vec3::new(i as f32, 0.0, -(i as f32)),
                        Quat::IDENTITY,
                        Vec3::ONE,
                    )
                })
                .collect(),
            boxes: vec![BoxInstance::axis_aligned(
                Vec3::new(0.0, 10.0, 0.0),
                Vec3::ONE,
            )],
        };
        assert_eq!(input.compute_aabb(), input.par_compute_aabb());
        let aabb = input.compute_aabb().unwrap();
        assert_relative_eq!(aabb.max.y, 10.5);
        assert_relative_eq!(aabb.min.z, -15.5);
        assert!(GeometryInput::default().compute_aabb().is_none());
    }
}
