//! Run-length compression of voxel columns.

use rayon::prelude::*;

use crate::{context::BuildContext, grid::GridParameters, voxels::VoxelGrid};

/// A voxel grid compressed into vertical runs.
///
/// Every column is covered bottom to top by alternating solid and open spans without gaps,
/// so the span heights of a column always sum up to the grid height.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct Heightfield {
    grid: GridParameters,
    /// One entry per column, addressed by [`GridParameters::column_index`].
    pub columns: Vec<HeightColumn>,
    /// The spans of all columns, stored column after column.
    pub spans: Vec<HeightSpan>,
}

/// The spans of a single column.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct HeightColumn {
    /// Index of the column's lowest span in [`Heightfield::spans`].
    pub index: usize,
    /// Number of spans in the column.
    pub count: u16,
}

/// A maximal vertical run of voxels with the same solidity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct HeightSpan {
    /// Number of voxels in the run. `[Units: vx]`
    pub height: u16,
    /// Whether the run is solid.
    pub solid: bool,
}

impl Heightfield {
    /// Compresses every column of `voxels`.
    pub fn from_voxels(voxels: &VoxelGrid) -> Self {
        let grid = *voxels.grid();
        let mut heightfield = Self::with_capacity(grid);
        for column in 0..grid.column_count() {
            heightfield.push_column(|spans| compress_column(voxels, column, spans));
        }
        heightfield
    }

    /// Same as [`Heightfield::from_voxels`], but reports progress and yields between rows of
    /// columns, or compresses all columns in parallel if the context prefers multithreading.
    pub async fn build(ctx: &BuildContext, voxels: &VoxelGrid) -> Self {
        let grid = *voxels.grid();
        let task = ctx.push_task(grid.width() as u32, "heightfield");

        if ctx.prefer_multithreading() {
            let columns: Vec<Vec<HeightSpan>> = (0..grid.column_count())
                .into_par_iter()
                .map(|column| {
                    let mut spans = Vec::new();
                    compress_column(voxels, column, &mut spans);
                    spans
                })
                .collect();
            task.step_by(grid.width() as u32);
            let mut heightfield = Self::with_capacity(grid);
            for column in columns {
                heightfield.push_column(|spans| spans.extend(column));
            }
            return heightfield;
        }

        let mut heightfield = Self::with_capacity(grid);
        for x in 0..grid.width() {
            for z in 0..grid.depth() {
                let column = grid.column_index(x, z);
                heightfield.push_column(|spans| compress_column(voxels, column, spans));
            }
            task.step();
            ctx.yield_now().await;
        }
        heightfield
    }

    fn with_capacity(grid: GridParameters) -> Self {
        Self {
            grid,
            columns: Vec::with_capacity(grid.column_count()),
            spans: Vec::with_capacity(grid.column_count()),
        }
    }

    fn push_column(&mut self, fill: impl FnOnce(&mut Vec<HeightSpan>)) {
        let index = self.spans.len();
        fill(&mut self.spans);
        self.columns.push(HeightColumn {
            index,
            count: (self.spans.len() - index) as u16,
        });
    }

    /// The grid the field was built on.
    #[inline]
    pub fn grid(&self) -> &GridParameters {
        &self.grid
    }

    /// The spans of the column at `(x, z)`, bottom to top.
    #[inline]
    pub fn spans_of(&self, x: u16, z: u16) -> &[HeightSpan] {
        let column = self.columns[self.grid.column_index(x, z)];
        &self.spans[column.index..column.index + column.count as usize]
    }

    /// The spans of the column at `(x, z)` as `(bottom, top, solid)`, bottom to top.
    /// `top` is exclusive.
    pub fn column_spans(&self, x: u16, z: u16) -> impl Iterator<Item = (u16, u16, bool)> + '_ {
        self.spans_of(x, z).iter().scan(0_u16, |bottom, span| {
            let start = *bottom;
            *bottom += span.height;
            Some((start, *bottom, span.solid))
        })
    }

    /// The number of open spans over all columns.
    pub fn open_span_count(&self) -> usize {
        self.spans.iter().filter(|span| !span.solid).count()
    }
}

fn compress_column(voxels: &VoxelGrid, column: usize, spans: &mut Vec<HeightSpan>) {
    let grid = voxels.grid();
    let (x, z) = grid.column_coords(column);
    let mut current: Option<HeightSpan> = None;
    for y in 0..grid.height() {
        let solid = voxels.get(x, y, z);
        match current.as_mut() {
            Some(span) if span.solid == solid => span.height += 1,
            _ => {
                spans.extend(current.take());
                current = Some(HeightSpan { height: 1, solid });
            }
        }
    }
    spans.extend(current);
}
