//! Watershed partitioning of the open spans into regions.
//!
//! The water level starts at the largest distance from any border and is lowered step by step.
//! At each level, existing regions first flood into the spans that just surfaced, and whatever
//! they cannot reach seeds new regions. Regions end up as connected patches grown from the
//! local maxima of the distance field, which keeps them roughly convex.

use std::collections::HashMap;

use rayon::prelude::*;
use thiserror::Error;

use crate::{
    context::BuildContext, distance_field::DistanceField, math::DIRECTIONS,
    open_heightfield::OpenHeightfield,
};

bitflags::bitflags! {
    /// The region a span belongs to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    #[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
    #[repr(transparent)]
    pub struct RegionId: u16 {
        /// Not part of any region.
        const NONE = 0;
        /// Set on the regions painted along the grid's edges.
        /// Such regions never grow and are never traced.
        const BORDER_REGION = 0x8000;
        /// Mask for the numeric part of an ID, and the largest ID that can be handed out.
        const MAX = 0x7fff;
    }
}

impl Default for RegionId {
    fn default() -> Self {
        Self::NONE
    }
}

impl RegionId {
    /// The numeric part of the ID, without the border flag.
    #[inline]
    pub fn id(self) -> u16 {
        (self & Self::MAX).bits()
    }

    /// Whether this is one of the regions painted along the grid's edges.
    #[inline]
    pub fn is_border(self) -> bool {
        self.contains(Self::BORDER_REGION)
    }

    /// Whether the span belongs to a region at all.
    #[inline]
    pub fn is_none(self) -> bool {
        self.is_empty()
    }
}

/// Parameters of [`OpenHeightfield::build_regions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct RegionSettings {
    /// The lowest water level. Spans closer than this to a border stay unassigned. `[Units: vx]`
    pub min_level: u16,
    /// Regions with fewer spans than this are discarded after partitioning. `[Units: spans]`
    pub min_region_surface: u32,
    /// Width of the border strips painted along the grid's edges. 0 disables them. `[Units: vx]`
    pub border_thickness: u16,
}

/// The result of [`OpenHeightfield::build_regions`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct Regions {
    /// The region of every span.
    pub ids: Vec<RegionId>,
    /// The number of surviving regions, not counting border regions.
    pub region_count: usize,
    /// The number of spans per region, indexed by [`RegionId::id`].
    /// Discarded regions have an area of 0.
    pub region_areas: Vec<u32>,
}

impl Regions {
    /// The region of the span at `index`.
    #[inline]
    pub fn get(&self, index: usize) -> RegionId {
        self.ids[index]
    }

    /// The number of spans in `region`.
    pub fn area(&self, region: RegionId) -> u32 {
        self.region_areas
            .get(region.id() as usize)
            .copied()
            .unwrap_or(0)
    }

    /// The IDs of all surviving non-border regions, ascending.
    pub fn region_ids(&self) -> Vec<RegionId> {
        let mut ids: Vec<RegionId> = self
            .ids
            .iter()
            .copied()
            .filter(|id| !id.is_none() && !id.is_border())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Whether both assignments split the spans into the same sets, regardless of the IDs used.
    pub fn is_same_partition(&self, other: &Regions) -> bool {
        if self.ids.len() != other.ids.len() {
            return false;
        }
        let mut forward = HashMap::new();
        let mut backward = HashMap::new();
        self.ids.iter().zip(&other.ids).all(|(&a, &b)| {
            a.is_none() == b.is_none()
                && *forward.entry(a).or_insert(b) == b
                && *backward.entry(b).or_insert(a) == a
        })
    }
}

impl OpenHeightfield {
    /// Partitions the walkable spans into regions. See the [module docs](self).
    ///
    /// Flooding is decided for all candidate spans of a pass before any of them is claimed,
    /// so the outcome does not depend on iteration order and the multithreaded mode, which
    /// evaluates the candidates in parallel, produces the same IDs as the sequential one.
    pub async fn build_regions(
        &self,
        ctx: &BuildContext,
        distances: &DistanceField,
        settings: RegionSettings,
    ) -> Result<Regions, SegmentationError> {
        debug_assert_eq!(distances.distances.len(), self.spans.len());
        let parallel = ctx.prefer_multithreading();
        let dist = &distances.distances;
        let max_level = distances.max_distance;
        let level_count = if settings.min_level <= max_level {
            (max_level - settings.min_level) as u32 + 1
        } else {
            0
        };
        let task = ctx.push_task(level_count + 2, "regions");

        let mut regions = vec![RegionId::NONE; self.spans.len()];
        // Steps each span is away from where its region started flooding.
        let mut costs = vec![0_u16; self.spans.len()];
        let mut next_id = 1;

        if settings.border_thickness > 0 {
            self.paint_borders(settings.border_thickness, &mut next_id, &mut regions)?;
        }
        let first_region = next_id;
        task.step();

        // Walkable spans from the highest to the lowest distance, ascending index within a level.
        let mut order = ctx.rent_indices();
        order.extend(
            (0..self.spans.len())
                .filter(|&i| self.spans[i].is_walkable() && dist[i] >= settings.min_level),
        );
        order.sort_by_key(|&i| std::cmp::Reverse(dist[i]));

        let mut pending = ctx.rent_indices();
        let mut stack = ctx.rent_indices();
        let mut level_start = 0;
        for level in (settings.min_level..=max_level).rev() {
            let level_end = level_start
                + order[level_start..]
                    .iter()
                    .take_while(|&&i| dist[i] == level)
                    .count();
            let surfaced = &order[level_start..level_end];
            level_start = level_end;

            // Expand existing regions until they stop growing.
            pending.clear();
            pending.extend(surfaced.iter().copied().filter(|&i| regions[i].is_none()));
            loop {
                let claims: Vec<(usize, RegionId, u16)> = if parallel {
                    pending
                        .par_iter()
                        .filter_map(|&i| self.cheapest_claim(i, &regions, &costs))
                        .collect()
                } else {
                    pending
                        .iter()
                        .filter_map(|&i| self.cheapest_claim(i, &regions, &costs))
                        .collect()
                };
                if claims.is_empty() {
                    break;
                }
                for (i, region, cost) in claims {
                    regions[i] = region;
                    costs[i] = cost;
                }
                pending.retain(|&i| regions[i].is_none());
                if !parallel {
                    ctx.yield_now().await;
                }
            }

            // Seed new regions in the basins nothing reached.
            for &seed in surfaced {
                if !regions[seed].is_none() {
                    continue;
                }
                let region = allocate_region(&mut next_id)?;
                regions[seed] = region;
                costs[seed] = 0;
                stack.push(seed);
                while let Some(i) = stack.pop() {
                    for dir in DIRECTIONS {
                        let Some(n) = self.spans[i].con(dir) else {
                            continue;
                        };
                        if regions[n].is_none() && dist[n] >= level {
                            regions[n] = region;
                            costs[n] = 0;
                            stack.push(n);
                        }
                    }
                }
            }
            task.step();
            if !parallel {
                ctx.yield_now().await;
            }
        }

        // Discard regions that are too small.
        let mut region_areas = vec![0_u32; next_id as usize];
        for region in regions.iter().filter(|r| !r.is_none()) {
            region_areas[region.id() as usize] += 1;
        }
        let mut pruned = 0;
        for id in first_region..next_id {
            let area = &mut region_areas[id as usize];
            if *area < settings.min_region_surface {
                *area = 0;
                pruned += 1;
            }
        }
        if pruned > 0 {
            for region in regions
                .iter_mut()
                .filter(|r| !r.is_none() && !r.is_border())
            {
                if region_areas[region.id() as usize] == 0 {
                    *region = RegionId::NONE;
                }
            }
        }
        let region_count = region_areas[first_region as usize..]
            .iter()
            .filter(|&&area| area > 0)
            .count();
        task.step();

        tracing::debug!(
            region_count,
            pruned,
            border_regions = first_region - 1,
            "built regions"
        );
        Ok(Regions {
            ids: regions,
            region_count,
            region_areas,
        })
    }

    /// The neighboring region that reaches span `i` in the fewest steps, ties going to the
    /// first direction. Border regions never claim spans.
    fn cheapest_claim(
        &self,
        i: usize,
        regions: &[RegionId],
        costs: &[u16],
    ) -> Option<(usize, RegionId, u16)> {
        let mut best: Option<(RegionId, u16)> = None;
        for dir in DIRECTIONS {
            let Some(n) = self.spans[i].con(dir) else {
                continue;
            };
            let region = regions[n];
            if region.is_none() || region.is_border() {
                continue;
            }
            let cost = costs[n].saturating_add(1);
            if best.is_none_or(|(_, best_cost)| cost < best_cost) {
                best = Some((region, cost));
            }
        }
        best.map(|(region, cost)| (i, region, cost))
    }

    /// Paints the four edge strips of the grid as border regions.
    fn paint_borders(
        &self,
        thickness: u16,
        next_id: &mut u16,
        regions: &mut [RegionId],
    ) -> Result<(), SegmentationError> {
        let width = self.grid().width();
        let depth = self.grid().depth();
        let bw = thickness.min(width);
        let bd = thickness.min(depth);
        for (x_range, z_range) in [
            (0..bw, 0..depth),
            (width - bw..width, 0..depth),
            (0..width, 0..bd),
            (0..width, depth - bd..depth),
        ] {
            let region = allocate_region(next_id)? | RegionId::BORDER_REGION;
            for x in x_range {
                for z in z_range.clone() {
                    let cell = self.cells[self.grid().column_index(x, z)];
                    for i in cell.span_indices() {
                        if self.spans[i].is_walkable() {
                            regions[i] = region;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

fn allocate_region(next_id: &mut u16) -> Result<RegionId, SegmentationError> {
    if *next_id > RegionId::MAX.bits() {
        return Err(SegmentationError::TooManyRegions {
            max: RegionId::MAX.bits(),
        });
    }
    let region = RegionId::from_bits_retain(*next_id);
    *next_id += 1;
    Ok(region)
}

/// Errors that can occur during region partitioning.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SegmentationError {
    /// The 15-bit region ID space is used up.
    #[error("Region partitioning needs more than the maximum of {max} regions")]
    TooManyRegions {
        /// The largest region ID
        max: u16,
    },
}
