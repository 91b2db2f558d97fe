//! The traversable open space of a [`Heightfield`] and the neighbor links between its spans.

use rayon::prelude::*;
use thiserror::Error;

use crate::{
    context::BuildContext,
    grid::GridParameters,
    heightfield::Heightfield,
    math::{DIRECTIONS, dir_offset_x, dir_offset_z, opposite},
};

/// The open spans of a [`Heightfield`], linked to their walkable neighbors.
///
/// All spans live in [`OpenHeightfield::spans`]. Links between spans are indices into that
/// array, so the graph is a flat arena and can be shared across threads freely.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct OpenHeightfield {
    grid: GridParameters,
    /// Maximum floor difference between linked spans. `[Units: vx]`
    pub max_traversable_step: u16,
    /// Minimum clearance between linked spans. `[Units: vx]`
    pub min_traversable_height: u16,
    /// One entry per column, addressed by [`GridParameters::column_index`].
    pub cells: Vec<OpenCell>,
    /// The open spans of all columns, stored column after column with ascending floors.
    pub spans: Vec<OpenSpan>,
}

/// The open spans of a single column.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct OpenCell {
    /// Index of the column's lowest open span in [`OpenHeightfield::spans`].
    pub index: u32,
    /// Number of open spans in the column.
    pub count: u16,
}

impl OpenCell {
    /// The span indices of this column.
    #[inline]
    pub fn span_indices(&self) -> std::ops::Range<usize> {
        self.index as usize..self.index as usize + self.count as usize
    }
}

/// A vertical run of open voxels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct OpenSpan {
    floor: u16,
    ceiling: u16,
    neighbors: [u32; 4],
}

impl OpenSpan {
    /// Sentinel for "no solid voxel below".
    pub const NO_FLOOR: u16 = u16::MAX;
    /// Sentinel for "open to the top of the grid".
    pub const UNBOUNDED: u16 = u16::MAX;
    /// Sentinel for "no walkable neighbor in this direction".
    pub const NOT_CONNECTED: u32 = u32::MAX;

    pub(crate) fn new(floor: Option<u16>, ceiling: Option<u16>) -> Self {
        Self {
            floor: floor.unwrap_or(Self::NO_FLOOR),
            ceiling: ceiling.unwrap_or(Self::UNBOUNDED),
            neighbors: [Self::NOT_CONNECTED; 4],
        }
    }

    /// The height of the lowest open voxel, or `None` if the column starts open. `[Units: vx]`
    #[inline]
    pub fn floor(&self) -> Option<u16> {
        (self.floor != Self::NO_FLOOR).then_some(self.floor)
    }

    /// The height of the solid voxel capping the span, or `None` if it is open to the top
    /// of the grid. `[Units: vx]`
    #[inline]
    pub fn ceiling(&self) -> Option<u16> {
        (self.ceiling != Self::UNBOUNDED).then_some(self.ceiling)
    }

    /// The index of the linked span in the given direction.
    ///
    /// Directions are 0 = -x, 1 = +z, 2 = +x, 3 = -z.
    #[inline]
    pub fn con(&self, direction: u8) -> Option<usize> {
        let neighbor = self.neighbors[direction as usize];
        (neighbor != Self::NOT_CONNECTED).then_some(neighbor as usize)
    }

    /// The raw neighbor indices, [`OpenSpan::NOT_CONNECTED`] where there is no link.
    #[inline]
    pub fn neighbors(&self) -> [u32; 4] {
        self.neighbors
    }

    /// Whether an agent can stand in this span, i.e. there is a floor beneath it.
    #[inline]
    pub fn is_walkable(&self) -> bool {
        self.floor != Self::NO_FLOOR
    }

    /// Whether at least one direction has no link.
    #[inline]
    pub fn is_border(&self) -> bool {
        self.neighbors.contains(&Self::NOT_CONNECTED)
    }
}

impl OpenHeightfield {
    /// Extracts the open spans of `heightfield` and links neighboring ones.
    ///
    /// A span links to the first span of an adjacent column whose floor is at most
    /// `max_traversable_step` away and whose overlap with it is at least
    /// `min_traversable_height` tall, unless either of them is open to the top.
    /// With `symmetric` set, a link is only kept if the neighbor links back.
    pub async fn from_heightfield(
        ctx: &BuildContext,
        heightfield: &Heightfield,
        max_traversable_step: u16,
        min_traversable_height: u16,
        symmetric: bool,
    ) -> Result<Self, OpenHeightfieldError> {
        let grid = *heightfield.grid();
        let parallel = ctx.prefer_multithreading();
        let task = ctx.push_task(3, "open heightfield");

        let open_span_count = heightfield.open_span_count();
        if open_span_count >= OpenSpan::NOT_CONNECTED as usize {
            return Err(OpenHeightfieldError::TooManySpans {
                span_count: open_span_count,
                max: OpenSpan::NOT_CONNECTED as usize - 1,
            });
        }

        let mut cells = Vec::with_capacity(grid.column_count());
        let mut spans = Vec::with_capacity(open_span_count);
        for column in &heightfield.columns {
            let index = spans.len() as u32;
            let column_spans = &heightfield.spans[column.index..column.index + column.count as usize];
            let mut bottom = 0_u16;
            for (i, span) in column_spans.iter().enumerate() {
                let top = bottom + span.height;
                if !span.solid {
                    let floor = (i > 0).then_some(bottom);
                    let ceiling = (i + 1 < column_spans.len()).then_some(top);
                    spans.push(OpenSpan::new(floor, ceiling));
                }
                bottom = top;
            }
            cells.push(OpenCell {
                index,
                count: (spans.len() as u32 - index) as u16,
            });
        }
        task.step();
        if !parallel {
            ctx.yield_now().await;
        }

        let mut open = Self {
            grid,
            max_traversable_step,
            min_traversable_height,
            cells,
            spans,
        };

        if parallel {
            let shared = &open;
            let links: Vec<[u32; 4]> = (0..grid.column_count())
                .into_par_iter()
                .flat_map_iter(|column| {
                    shared.cells[column]
                        .span_indices()
                        .map(move |i| shared.find_links(column, i))
                })
                .collect();
            for (span, links) in open.spans.iter_mut().zip(links) {
                span.neighbors = links;
            }
        } else {
            for x in 0..grid.width() {
                for z in 0..grid.depth() {
                    let column = grid.column_index(x, z);
                    for i in open.cells[column].span_indices() {
                        open.spans[i].neighbors = open.find_links(column, i);
                    }
                }
                ctx.yield_now().await;
            }
        }
        task.step();

        if symmetric {
            let removed = open.drop_one_way_links();
            if removed > 0 {
                tracing::debug!(removed, "dropped one-way neighbor links");
            }
        }
        task.step();

        tracing::debug!(
            spans = open.spans.len(),
            walkable = open.spans.iter().filter(|s| s.is_walkable()).count(),
            "built open heightfield"
        );
        Ok(open)
    }

    /// The grid the field was built on.
    #[inline]
    pub fn grid(&self) -> &GridParameters {
        &self.grid
    }

    /// The number of open spans.
    #[inline]
    pub fn span_count(&self) -> usize {
        self.spans.len()
    }

    /// The open spans of the column at `(x, z)`, bottom to top.
    #[inline]
    pub fn spans_of(&self, x: u16, z: u16) -> &[OpenSpan] {
        let cell = self.cells[self.grid.column_index(x, z)];
        &self.spans[cell.span_indices()]
    }

    /// Whether the span at `index` misses at least one neighbor.
    #[inline]
    pub fn is_border(&self, index: usize) -> bool {
        self.spans[index].is_border()
    }

    /// The number of links `a -> b` for which `b` does not link back to `a`.
    pub fn neighbor_link_asymmetries(&self) -> usize {
        self.spans
            .iter()
            .enumerate()
            .flat_map(|(i, span)| DIRECTIONS.map(|dir| (i, dir, span.con(dir))))
            .filter(|&(i, dir, neighbor)| {
                neighbor.is_some_and(|n| self.spans[n].con(opposite(dir)) != Some(i))
            })
            .count()
    }

    fn find_links(&self, column: usize, index: usize) -> [u32; 4] {
        let mut links = [OpenSpan::NOT_CONNECTED; 4];
        let span = &self.spans[index];
        let Some(floor) = span.floor() else {
            return links;
        };
        let (x, z) = self.grid.column_coords(column);
        for dir in DIRECTIONS {
            let nx = x as i32 + dir_offset_x(dir) as i32;
            let nz = z as i32 + dir_offset_z(dir) as i32;
            if !self.grid.contains_column(nx, nz) {
                continue;
            }
            let neighbor_cell = self.cells[self.grid.column_index(nx as u16, nz as u16)];
            for neighbor_index in neighbor_cell.span_indices() {
                let neighbor = &self.spans[neighbor_index];
                let Some(neighbor_floor) = neighbor.floor() else {
                    continue;
                };
                if floor.abs_diff(neighbor_floor) > self.max_traversable_step {
                    continue;
                }
                let clearance_ok = match (span.ceiling(), neighbor.ceiling()) {
                    (Some(ceiling), Some(neighbor_ceiling)) => {
                        let top = ceiling.min(neighbor_ceiling) as i32;
                        let bottom = floor.max(neighbor_floor) as i32;
                        top - bottom >= self.min_traversable_height as i32
                    }
                    _ => true,
                };
                if clearance_ok {
                    // Floors ascend within a column, so this is the lowest valid connection.
                    links[dir as usize] = neighbor_index as u32;
                    break;
                }
            }
        }
        links
    }

    /// Drops every link whose target does not link back. Returns the number of dropped links.
    fn drop_one_way_links(&mut self) -> usize {
        let one_way: Vec<(usize, u8)> = self
            .spans
            .iter()
            .enumerate()
            .flat_map(|(i, span)| DIRECTIONS.map(|dir| (i, dir, span.con(dir))))
            .filter_map(|(i, dir, neighbor)| {
                let n = neighbor?;
                (self.spans[n].con(opposite(dir)) != Some(i)).then_some((i, dir))
            })
            .collect();
        for &(i, dir) in &one_way {
            self.spans[i].neighbors[dir as usize] = OpenSpan::NOT_CONNECTED;
        }
        one_way.len()
    }
}

/// Errors that can occur when building an [`OpenHeightfield`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OpenHeightfieldError {
    /// Span indices would no longer fit into a link.
    #[error("Open heightfield would have {span_count} spans, but at most {max} are supported")]
    TooManySpans {
        /// The number of open spans in the height field
        span_count: usize,
        /// The largest supported span count
        max: usize,
    },
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use glam::Vec3;

    use super::*;
    use crate::{math::Aabb3d, voxels::VoxelGrid};

    fn voxels(width: f32, height: f32, depth: f32) -> VoxelGrid {
        let grid = GridParameters::new(
            Aabb3d {
                min: Vec3::ZERO,
                max: Vec3::new(width, height, depth),
            },
            1.0,
        )
        .unwrap();
        VoxelGrid::new(grid)
    }

    fn build(voxels: &VoxelGrid, step: u16, height: u16, symmetric: bool) -> OpenHeightfield {
        let ctx = BuildContext::default();
        let heightfield = Heightfield::from_voxels(voxels);
        ctx.block_on(OpenHeightfield::from_heightfield(
            &ctx,
            &heightfield,
            step,
            height,
            symmetric,
        ))
        .unwrap()
    }

    #[test]
    fn floor_and_ceiling_sentinels() {
        let mut voxels = voxels(1.0, 6.0, 1.0);
        voxels.set(0, 1, 0);
        voxels.set(0, 4, 0);
        let open = build(&voxels, 1, 1, true);
        let spans = open.spans_of(0, 0);
        assert_eq!(spans.len(), 3);
        assert_eq!((spans[0].floor(), spans[0].ceiling()), (None, Some(1)));
        assert_eq!((spans[1].floor(), spans[1].ceiling()), (Some(2), Some(4)));
        assert_eq!((spans[2].floor(), spans[2].ceiling()), (Some(5), None));
        assert!(!spans[0].is_walkable());
        assert!(spans[1].is_walkable());
    }

    #[test]
    fn flat_floor_links_all_interior_neighbors() {
        let mut voxels = voxels(3.0, 3.0, 3.0);
        for x in 0..3 {
            for z in 0..3 {
                voxels.set(x, 0, z);
            }
        }
        let open = build(&voxels, 1, 2, true);
        let center = open.cells[open.grid().column_index(1, 1)].index as usize;
        let span = open.spans[center];
        assert_eq!(span.floor(), Some(1));
        assert!(!span.is_border());
        for dir in DIRECTIONS {
            let neighbor = span.con(dir).unwrap();
            assert_eq!(open.spans[neighbor].con(opposite(dir)), Some(center));
        }
        let corner = open.cells[open.grid().column_index(0, 0)].index as usize;
        assert!(open.is_border(corner));
        assert_eq!(open.spans[corner].con(0), None);
        assert_eq!(open.spans[corner].con(3), None);
        assert_eq!(open.neighbor_link_asymmetries(), 0);
    }

    #[test]
    fn step_and_clearance_limit_links() {
        let mut voxels = voxels(3.0, 8.0, 1.0);
        // Column 0: floor at 1, ceiling at 4
        voxels.set(0, 0, 0);
        voxels.set(0, 4, 0);
        // Column 1: floor at 2, ceiling at 4 -> overlap of 2
        voxels.set(1, 0, 0);
        voxels.set(1, 1, 0);
        voxels.set(1, 4, 0);
        // Column 2: floor at 4 -> step of 2 from column 1
        for y in 0..4 {
            voxels.set(2, y, 0);
        }

        let open = build(&voxels, 1, 2, false);
        let first = |x: u16| open.cells[open.grid().column_index(x, 0)].index as usize;
        // Column 0 starts with a solid voxel, so its first open span is walkable.
        assert_eq!(open.spans[first(0)].con(2), Some(first(1)));
        // Step too high
        assert_eq!(open.spans[first(1)].con(2), None);

        let strict = build(&voxels, 1, 3, false);
        assert_eq!(strict.spans[first(0)].con(2), None);
    }

    #[test]
    fn unbounded_ceiling_skips_clearance_check() {
        let mut voxels = voxels(2.0, 4.0, 1.0);
        voxels.set(0, 0, 0);
        voxels.set(1, 0, 0);
        voxels.set(1, 2, 0);
        voxels.set(1, 3, 0);
        // Column 1's span [1, 2) is only one voxel tall, but column 0 is open to the top.
        let open = build(&voxels, 1, 3, false);
        let left = open.cells[0].index as usize;
        let right = open.cells[1].index as usize;
        assert_eq!(open.spans[left].con(2), Some(right));
        assert_eq!(open.spans[right].con(0), Some(left));
    }

    #[test]
    fn symmetry_is_configurable() {
        let mut voxels = voxels(2.0, 8.0, 1.0);
        // Column 0: A1 between the solid voxels at y = 0 and y = 4, A2 above
        voxels.set(0, 0, 0);
        voxels.set(0, 4, 0);
        // Column 1: B with floor 3, open to the top
        for y in 0..3 {
            voxels.set(1, y, 0);
        }
        // A1 = [1, 4), A2 = [5, inf), B = [3, inf); step 2, height 1.
        // A1 -> B (|1 - 3| = 2), A2 -> B (|5 - 3| = 2), but B only links back to A1.
        let raw = build(&voxels, 2, 1, false);
        let a1 = raw.cells[0].index as usize;
        let a2 = a1 + 1;
        let b = raw.cells[1].index as usize;
        assert_eq!(raw.spans[a1].con(2), Some(b));
        assert_eq!(raw.spans[a2].con(2), Some(b));
        assert_eq!(raw.spans[b].con(0), Some(a1));
        assert_eq!(raw.neighbor_link_asymmetries(), 1);

        let symmetric = build(&voxels, 2, 1, true);
        assert_eq!(symmetric.spans[a1].con(2), Some(b));
        assert_eq!(symmetric.spans[a2].con(2), None);
        assert_eq!(symmetric.neighbor_link_asymmetries(), 0);
    }

    #[test]
    fn floorless_spans_are_never_linked() {
        let voxels = voxels(2.0, 2.0, 2.0);
        let open = build(&voxels, 5, 1, false);
        assert!(open.spans.iter().all(|span| !span.is_walkable()));
        assert!(open.spans.iter().all(OpenSpan::is_border));
    }

    #[test]
    fn build_modes_agree() {
        let mut voxels = voxels(6.0, 6.0, 5.0);
        for x in 0..6 {
            for z in 0..5 {
                for y in 0..=((x + z) % 4) {
                    voxels.set(x, y, z);
                }
            }
        }
        voxels.set(2, 5, 2);
        let heightfield = Heightfield::from_voxels(&voxels);
        for symmetric in [false, true] {
            let results: Vec<_> = [false, true]
                .into_iter()
                .map(|multithreaded| {
                    let ctx = BuildContext::new(Duration::ZERO, multithreaded);
                    ctx.block_on(OpenHeightfield::from_heightfield(
                        &ctx,
                        &heightfield,
                        1,
                        2,
                        symmetric,
                    ))
                    .unwrap()
                })
                .collect();
            assert_eq!(results[0], results[1]);
        }
    }
}
