//! Boundary tracing of regions.

use glam::{U16Vec3, Vec3};
use rayon::prelude::*;

use crate::{
    context::BuildContext,
    grid::GridParameters,
    math::{DIRECTIONS, dir_offset_x, dir_offset_z, rotate_ccw, rotate_cw},
    open_heightfield::OpenHeightfield,
    watershed::{RegionId, Regions},
};

/// A traced boundary loop of a region.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct Contour {
    /// The region the contour encloses.
    pub region: RegionId,
    /// Lattice vertices `(x, floor, z)`, two per boundary edge, in walking order.
    pub vertices: Vec<U16Vec3>,
    /// Whether the walk made it back to its start before hitting the iteration cap.
    pub closed: bool,
}

impl Contour {
    /// The number of boundary edges the contour consists of.
    #[inline]
    pub fn edge_count(&self) -> usize {
        self.vertices.len() / 2
    }
}

/// All contours of a region partitioning.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct ContourSet {
    /// The contours in the order they were traced.
    pub contours: Vec<Contour>,
    /// The grid the contours' lattice vertices live on.
    pub grid: Option<GridParameters>,
}

impl ContourSet {
    /// The contours enclosing `region`. Regions with holes have more than one.
    pub fn contours_of(&self, region: RegionId) -> impl Iterator<Item = &Contour> {
        self.contours
            .iter()
            .filter(move |contour| contour.region == region)
    }

    /// The vertices of `contour` in world space.
    pub fn world_vertices(&self, contour: &Contour) -> Vec<Vec3> {
        let Some(grid) = self.grid else {
            return Vec::new();
        };
        contour
            .vertices
            .iter()
            .map(|v| grid.grid_to_world(v.as_vec3()))
            .collect()
    }

    /// Whether no contour was traced.
    pub fn is_empty(&self) -> bool {
        self.contours.is_empty()
    }
}

impl OpenHeightfield {
    /// Traces the boundary of every region.
    ///
    /// An edge of a span is on the boundary if there is no neighbor in that direction or the
    /// neighbor belongs to a different region. Unassigned spans and border regions are not traced.
    /// A walk that takes more than `iteration_cap` steps is abandoned and kept with `closed` unset.
    pub async fn build_contours(
        &self,
        ctx: &BuildContext,
        regions: &Regions,
        iteration_cap: u32,
    ) -> ContourSet {
        debug_assert_eq!(regions.ids.len(), self.spans.len());
        let parallel = ctx.prefer_multithreading();
        let task = ctx.push_task(self.grid().width() as u32 + 1, "contours");

        let mut flags = ctx.rent_bytes();
        if parallel {
            flags.par_extend(
                (0..self.spans.len())
                    .into_par_iter()
                    .map(|i| self.boundary_mask(regions, i)),
            );
        } else {
            flags.extend((0..self.spans.len()).map(|i| self.boundary_mask(regions, i)));
        }
        task.step();

        let mut contours = ContourSet {
            contours: Vec::new(),
            grid: Some(*self.grid()),
        };
        for x in 0..self.grid().width() {
            for z in 0..self.grid().depth() {
                let cell = self.cells[self.grid().column_index(x, z)];
                for i in cell.span_indices() {
                    // A span can start several walks, e.g. when a hole touches it.
                    while flags[i] != 0 {
                        let start_dir = flags[i].trailing_zeros() as u8;
                        let contour = self.walk_contour(
                            x,
                            z,
                            i,
                            start_dir,
                            regions,
                            &mut flags,
                            iteration_cap,
                        );
                        contours.contours.push(contour);
                    }
                }
            }
            task.step();
            if !parallel {
                ctx.yield_now().await;
            }
        }

        tracing::debug!(contours = contours.contours.len(), "built contours");
        contours
    }

    /// The directions in which span `i` borders another region, as a bit mask.
    fn boundary_mask(&self, regions: &Regions, i: usize) -> u8 {
        let region = regions.get(i);
        if region.is_none() || region.is_border() {
            return 0;
        }
        let span = &self.spans[i];
        DIRECTIONS
            .into_iter()
            .filter(|&dir| span.con(dir).is_none_or(|n| regions.get(n) != region))
            .fold(0, |mask, dir| mask | (1 << dir))
    }

    /// Follows the boundary clockwise with the region on the right hand side.
    fn walk_contour(
        &self,
        mut x: u16,
        mut z: u16,
        mut i: usize,
        mut dir: u8,
        regions: &Regions,
        flags: &mut [u8],
        iteration_cap: u32,
    ) -> Contour {
        let start = (i, dir);
        let mut contour = Contour {
            region: regions.get(i),
            vertices: Vec::new(),
            closed: false,
        };
        let mut iterations = 0;
        loop {
            if flags[i] & (1 << dir) != 0 {
                let y = self.spans[i].floor().unwrap_or_default();
                let (sx, sz) = edge_corner(x, z, rotate_ccw(dir));
                let (ex, ez) = edge_corner(x, z, dir);
                contour.vertices.push(U16Vec3::new(sx, y, sz));
                contour.vertices.push(U16Vec3::new(ex, y, ez));
                flags[i] &= !(1 << dir);
                dir = rotate_cw(dir);
            } else {
                let Some(n) = self.spans[i].con(dir) else {
                    // The mask says there is a same-region neighbor, so this is unreachable
                    // unless the regions were edited after masking.
                    tracing::warn!(x, z, dir, "contour walk stepped off the span graph");
                    break;
                };
                x = (x as i32 + dir_offset_x(dir) as i32) as u16;
                z = (z as i32 + dir_offset_z(dir) as i32) as u16;
                i = n;
                dir = rotate_ccw(dir);
            }
            if (i, dir) == start {
                contour.closed = true;
                break;
            }
            iterations += 1;
            if iterations >= iteration_cap {
                tracing::warn!(
                    region = contour.region.id(),
                    iterations,
                    "contour walk hit the iteration cap"
                );
                break;
            }
        }
        contour
    }
}

/// The lattice corner at which the edge in direction `dir` of column `(x, z)` ends,
/// walking the column clockwise.
#[inline]
fn edge_corner(x: u16, z: u16, dir: u8) -> (u16, u16) {
    match dir & 0x03 {
        0 => (x, z + 1),
        1 => (x + 1, z + 1),
        2 => (x + 1, z),
        _ => (x, z),
    }
}
