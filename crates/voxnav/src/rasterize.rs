//! Turns triangle meshes and oriented boxes into solid voxels.
//!
//! Boxes are marked voxel by voxel with a separating axis test.
//! Meshes are first drawn into a private scratch volume covering just their bounds, in which each
//! touched voxel remembers whether it was hit by front- or back-facing triangles. A face lying on
//! a voxel boundary only marks the voxel on its solid side, so a grid-aligned mesh covers the same
//! voxels as a box of the same shape. The interior
//! between a front-facing run and the next back-facing run of every column is then filled, and
//! the result is OR-ed into the shared grid.

use glam::{IVec3, Vec3A};
use rayon::prelude::*;
use thiserror::Error;

use crate::{
    context::BuildContext,
    geometry::{BoxInstance, GeometryInput, MeshInstance},
    grid::GridParameters,
    voxels::{AtomicVoxelGrid, VoxelGrid},
};

pub mod sat;

use sat::{obb_intersects_aabb, triangle_intersects_aabb};

const HALF_VOXEL: Vec3A = Vec3A::splat(0.5);

/// Triangles are moved this far into the solid before testing, so a face lying on a voxel boundary
/// belongs to the voxel on its solid side.
const INWARD_SHIFT: f32 = 1.0e-3;

/// Voxels shrunk by this much per side, so a triangle merely touching one does not mark it.
const OWNED_HALF_VOXEL: Vec3A = Vec3A::splat(0.5 - INWARD_SHIFT / 2.0);

/// Scratch states of a mesh-local voxel.
const EMPTY: u8 = 0;
const BACK: u8 = 1;
const FRONT: u8 = 2;
const INTERIOR: u8 = 3;

/// A target solid voxels are written to.
trait VoxelSink {
    fn mark(&mut self, index: usize);
}

impl VoxelSink for VoxelGrid {
    #[inline]
    fn mark(&mut self, index: usize) {
        self.set_index(index);
    }
}

impl VoxelSink for &AtomicVoxelGrid {
    #[inline]
    fn mark(&mut self, index: usize) {
        self.set_index(index);
    }
}

impl VoxelGrid {
    /// Rasterizes a triangle mesh into the grid, filling its interior.
    ///
    /// Returns the number of voxels the mesh covers, including ones that were already solid.
    pub fn rasterize_mesh(&mut self, mesh: &MeshInstance) -> Result<usize, RasterizationError> {
        let grid = *self.grid();
        let mut scratch = Vec::new();
        let Some(mut rasterizer) = MeshRasterizer::new(&grid, mesh, &mut scratch)? else {
            return Ok(0);
        };
        for triangle in 0..rasterizer.triangle_count() {
            rasterizer.rasterize_triangle(triangle);
        }
        rasterizer.fill_interior();
        Ok(rasterizer.write_into(self))
    }

    /// Rasterizes a solid box into the grid.
    ///
    /// Returns the number of voxels the box covers, including ones that were already solid.
    pub fn rasterize_box(&mut self, instance: &BoxInstance) -> usize {
        let grid = *self.grid();
        rasterize_box_into(&grid, instance, self)
    }
}

/// Rasterizes all geometry onto `grid`.
///
/// The sequential path yields to the host between triangles. The multi-threaded path rasterizes
/// every item on the rayon thread pool into its own scratch volume and merges them into one shared
/// grid with interlocked ORs. Both produce the same voxels.
pub async fn rasterize_geometry(
    ctx: &BuildContext,
    input: &GeometryInput,
    grid: GridParameters,
) -> Result<VoxelGrid, RasterizationError> {
    let item_count = input.meshes.len() + input.boxes.len();
    let task = ctx.push_task(item_count as u32, "rasterize");

    if ctx.prefer_multithreading() {
        let voxels = AtomicVoxelGrid::new(grid);
        input
            .meshes
            .par_iter()
            .enumerate()
            .try_for_each(|(mesh_index, mesh)| {
                let mut scratch = ctx.rent_bytes();
                let rasterizer = MeshRasterizer::new(&grid, mesh, &mut scratch)
                    .map_err(|err| err.in_mesh(mesh_index))?;
                if let Some(mut rasterizer) = rasterizer {
                    for triangle in 0..rasterizer.triangle_count() {
                        rasterizer.rasterize_triangle(triangle);
                    }
                    rasterizer.fill_interior();
                    rasterizer.write_into(&mut &voxels);
                }
                ctx.step_task();
                Ok::<_, RasterizationError>(())
            })?;
        input.boxes.par_iter().for_each(|instance| {
            rasterize_box_into(&grid, instance, &mut &voxels);
            ctx.step_task();
        });
        drop(task);
        return Ok(voxels.into_grid());
    }

    let mut voxels = VoxelGrid::new(grid);
    let mut scratch = ctx.rent_bytes();
    for (mesh_index, mesh) in input.meshes.iter().enumerate() {
        let rasterizer = MeshRasterizer::new(&grid, mesh, &mut scratch)
            .map_err(|err| err.in_mesh(mesh_index))?;
        if let Some(mut rasterizer) = rasterizer {
            for triangle in 0..rasterizer.triangle_count() {
                rasterizer.rasterize_triangle(triangle);
                ctx.yield_now().await;
            }
            rasterizer.fill_interior();
            let covered = rasterizer.write_into(&mut voxels);
            tracing::trace!(mesh_index, covered, "rasterized mesh");
        }
        task.step();
        ctx.yield_now().await;
    }
    for instance in &input.boxes {
        rasterize_box_into(&grid, instance, &mut voxels);
        task.step();
        ctx.yield_now().await;
    }
    Ok(voxels)
}

fn rasterize_box_into(grid: &GridParameters, instance: &BoxInstance, sink: &mut impl VoxelSink) -> usize {
    let world_min = Vec3A::from(grid.aabb().min);
    let inverse_voxel = grid.voxel_size().recip();
    let obb = instance
        .world_obb()
        .scaled(inverse_voxel, -world_min * inverse_voxel);
    let bounds = obb.aabb();
    let Some((lo, hi)) = grid.clamp_voxel_range(bounds.min, bounds.max) else {
        return 0;
    };

    let mut covered = 0;
    for x in lo.x..=hi.x {
        for y in lo.y..=hi.y {
            for z in lo.z..=hi.z {
                let center = Vec3A::new(x as f32, y as f32, z as f32) + HALF_VOXEL;
                if obb_intersects_aabb(&obb, center, HALF_VOXEL) {
                    sink.mark(grid.voxel_index(x as u16, y as u16, z as u16));
                    covered += 1;
                }
            }
        }
    }
    covered
}

/// Rasterization state of a single mesh.
struct MeshRasterizer<'a> {
    grid: &'a GridParameters,
    indices: &'a [u32],
    /// Vertices in grid space
    vertices: Vec<Vec3A>,
    mirrored: bool,
    /// Grid coordinates of the scratch volume's first voxel
    origin: IVec3,
    /// Size of the scratch volume
    size: IVec3,
    states: &'a mut Vec<u8>,
}

impl<'a> MeshRasterizer<'a> {
    /// Validates the mesh and prepares its scratch volume.
    /// Returns `None` if the mesh lies entirely outside the grid.
    fn new(
        grid: &'a GridParameters,
        mesh: &'a MeshInstance,
        states: &'a mut Vec<u8>,
    ) -> Result<Option<Self>, RasterizationError> {
        if mesh.indices.len() % 3 != 0 {
            return Err(RasterizationError::IncompleteTriangle {
                mesh_index: None,
                index_count: mesh.indices.len(),
            });
        }
        let vertex_count = mesh.vertices.len();
        if let Some(&index) = mesh.indices.iter().find(|&&i| i as usize >= vertex_count) {
            return Err(RasterizationError::IndexOutOfBounds {
                mesh_index: None,
                index,
                vertex_count,
            });
        }
        if mesh.indices.is_empty() {
            return Ok(None);
        }

        let world_min = Vec3A::from(grid.aabb().min);
        let inverse_voxel = grid.voxel_size().recip();
        let vertices: Vec<Vec3A> = mesh
            .world_vertices()
            .into_iter()
            .map(|v| (v - world_min) * inverse_voxel)
            .collect();

        // Only referenced vertices contribute to the bounds.
        let (min, max) = mesh.indices.iter().fold(
            (Vec3A::INFINITY, Vec3A::NEG_INFINITY),
            |(min, max), &i| {
                let v = vertices[i as usize];
                (min.min(v), max.max(v))
            },
        );
        let Some((lo, hi)) = grid.clamp_voxel_range(min.into(), max.into()) else {
            return Ok(None);
        };
        let size = hi - lo + IVec3::ONE;

        states.clear();
        states.resize(size.x as usize * size.y as usize * size.z as usize, EMPTY);
        Ok(Some(Self {
            grid,
            indices: &mesh.indices,
            vertices,
            mirrored: mesh.is_mirrored(),
            origin: lo,
            size,
            states,
        }))
    }

    #[inline]
    fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    #[inline]
    fn local_index(&self, x: i32, y: i32, z: i32) -> usize {
        ((x * self.size.y + y) * self.size.z + z) as usize
    }

    fn rasterize_triangle(&mut self, triangle: usize) {
        let corners = &self.indices[triangle * 3..triangle * 3 + 3];
        let mut triangle = [
            self.vertices[corners[0] as usize],
            self.vertices[corners[1] as usize],
            self.vertices[corners[2] as usize],
        ];
        let mut normal = (triangle[1] - triangle[0]).cross(triangle[2] - triangle[0]);
        if self.mirrored {
            normal = -normal;
        }
        // Front faces are the ones a downward ray enters the solid through, i.e. the undersides.
        let front = normal.y < 0.0;
        let inward = -normal.normalize_or_zero() * INWARD_SHIFT;
        for vertex in &mut triangle {
            *vertex += inward;
        }

        let min = triangle[0].min(triangle[1]).min(triangle[2]);
        let max = triangle[0].max(triangle[1]).max(triangle[2]);
        let Some((lo, hi)) = self.grid.clamp_voxel_range(min.into(), max.into()) else {
            return;
        };
        let lo = (lo - self.origin).max(IVec3::ZERO);
        let hi = (hi - self.origin).min(self.size - IVec3::ONE);

        for x in lo.x..=hi.x {
            for y in lo.y..=hi.y {
                for z in lo.z..=hi.z {
                    let center = (self.origin + IVec3::new(x, y, z)).as_vec3a() + HALF_VOXEL;
                    if !triangle_intersects_aabb(&triangle, center, OWNED_HALF_VOXEL) {
                        continue;
                    }
                    let index = self.local_index(x, y, z);
                    let state = &mut self.states[index];
                    *state = match (*state, front) {
                        (EMPTY, true) | (FRONT, true) => FRONT,
                        _ => BACK,
                    };
                }
            }
        }
    }

    /// Fills each column between a front-facing run and the next back-facing run above it.
    /// A front-facing run followed by another front-facing run is left unfilled.
    fn fill_interior(&mut self) {
        for x in 0..self.size.x {
            for z in 0..self.size.z {
                let mut y = 0;
                while y < self.size.y {
                    while y < self.size.y && self.state(x, y, z) != FRONT {
                        y += 1;
                    }
                    while y < self.size.y && self.state(x, y, z) == FRONT {
                        y += 1;
                    }
                    let gap_start = y;
                    while y < self.size.y && self.state(x, y, z) == EMPTY {
                        y += 1;
                    }
                    if y >= self.size.y || self.state(x, y, z) != BACK {
                        continue;
                    }
                    for gap in gap_start..y {
                        let index = self.local_index(x, gap, z);
                        self.states[index] = INTERIOR;
                    }
                    while y < self.size.y && self.state(x, y, z) == BACK {
                        y += 1;
                    }
                }
            }
        }
    }

    #[inline]
    fn state(&self, x: i32, y: i32, z: i32) -> u8 {
        self.states[self.local_index(x, y, z)]
    }

    /// Writes every non-empty scratch voxel into `sink` and returns their count.
    fn write_into(&self, sink: &mut impl VoxelSink) -> usize {
        let mut covered = 0;
        for x in 0..self.size.x {
            for y in 0..self.size.y {
                for z in 0..self.size.z {
                    if self.state(x, y, z) == EMPTY {
                        continue;
                    }
                    let voxel = self.origin + IVec3::new(x, y, z);
                    sink.mark(
                        self.grid
                            .voxel_index(voxel.x as u16, voxel.y as u16, voxel.z as u16),
                    );
                    covered += 1;
                }
            }
        }
        covered
    }
}

/// Errors that can occur during rasterization.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RasterizationError {
    /// The index buffer of a mesh does not describe whole triangles.
    #[error("Mesh {mesh_index:?} has {index_count} indices, which is not a multiple of 3")]
    IncompleteTriangle {
        /// Position of the mesh in the input, if known
        mesh_index: Option<usize>,
        /// Length of the index buffer
        index_count: usize,
    },
    /// A mesh references a vertex it does not have.
    #[error("Mesh {mesh_index:?} references vertex {index}, but only has {vertex_count} vertices")]
    IndexOutOfBounds {
        /// Position of the mesh in the input, if known
        mesh_index: Option<usize>,
        /// The offending index
        index: u32,
        /// Number of vertices in the mesh
        vertex_count: usize,
    },
}

impl RasterizationError {
    fn in_mesh(self, index: usize) -> Self {
        match self {
            Self::IncompleteTriangle { index_count, .. } => Self::IncompleteTriangle {
                mesh_index: Some(index),
                index_count,
            },
            Self::IndexOutOfBounds {
                index: vertex,
                vertex_count,
                ..
            } => Self::IndexOutOfBounds {
                mesh_index: Some(index),
                index: vertex,
                vertex_count,
            },
        }
    }
}
