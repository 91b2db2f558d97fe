//! Distance of every open span to the nearest border span.

use rayon::prelude::*;

use crate::{
    context::BuildContext,
    math::{DIRECTIONS, rotate_cw},
    open_heightfield::OpenHeightfield,
};

/// Per-span distance to the nearest border, in steps along neighbor links.
///
/// Border spans, i.e. spans missing at least one link, sit at distance 0.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct DistanceField {
    /// One distance per span of the [`OpenHeightfield`] the field was built from.
    pub distances: Vec<u16>,
    /// The largest value in [`DistanceField::distances`].
    pub max_distance: u16,
}

impl OpenHeightfield {
    /// Runs a breadth-first search from all border spans at once.
    ///
    /// In multithreaded mode, each BFS frontier is expanded in parallel and the candidates
    /// are merged on the calling thread. Both modes compute the same distances.
    pub async fn build_distance_field(&self, ctx: &BuildContext) -> DistanceField {
        let span_count = self.spans.len();
        let task = ctx.push_task(2, "distance field");
        let mut distances = vec![u16::MAX; span_count];
        let mut queue = ctx.rent_indices();
        for (i, span) in self.spans.iter().enumerate() {
            if span.is_border() {
                distances[i] = 0;
                queue.push(i);
            }
        }
        task.step();

        if ctx.prefer_multithreading() {
            let spans = &self.spans;
            let mut frontier = std::mem::take(&mut *queue);
            let mut level = 0_u16;
            while !frontier.is_empty() {
                let next = level.saturating_add(1);
                let current = &distances;
                let candidates: Vec<usize> = frontier
                    .par_iter()
                    .flat_map_iter(|&i| {
                        DIRECTIONS
                            .into_iter()
                            .filter_map(move |dir| spans[i].con(dir))
                            .filter(move |&n| current[n] > next)
                    })
                    .collect();
                frontier.clear();
                for n in candidates {
                    if distances[n] > next {
                        distances[n] = next;
                        frontier.push(n);
                    }
                }
                level = next;
            }
            // Hand the buffer back to the pool.
            *queue = frontier;
        } else {
            // FIFO with a read cursor, so the rented buffer is never shifted.
            let mut head = 0;
            while head < queue.len() {
                let i = queue[head];
                head += 1;
                let next = distances[i].saturating_add(1);
                for dir in DIRECTIONS {
                    let Some(n) = self.spans[i].con(dir) else {
                        continue;
                    };
                    if distances[n] > next {
                        distances[n] = next;
                        queue.push(n);
                    }
                }
                if head % 4096 == 0 {
                    ctx.yield_now().await;
                }
            }
        }
        task.step();

        let unreached = distances.iter().filter(|&&d| d == u16::MAX).count();
        if unreached > 0 {
            // Only possible with one-way links: such spans never see a border.
            tracing::debug!(unreached, "spans unreachable from any border");
            for distance in distances.iter_mut().filter(|d| **d == u16::MAX) {
                *distance = 0;
            }
        }

        let field = DistanceField::new(distances);
        tracing::debug!(max_distance = field.max_distance, "built distance field");
        field
    }
}

impl DistanceField {
    /// Wraps precomputed distances.
    pub fn new(distances: Vec<u16>) -> Self {
        let max_distance = distances.iter().copied().max().unwrap_or(0);
        Self {
            distances,
            max_distance,
        }
    }

    /// The distance of the span at `index`.
    #[inline]
    pub fn get(&self, index: usize) -> u16 {
        self.distances[index]
    }

    /// Smooths the field with a 3x3 box filter, returning a new field.
    ///
    /// Spans at most `2 * threshold` away from a border keep their distance. Every other span
    /// averages itself with its 4 neighbors and the diagonal reached by turning clockwise from
    /// each of them. A missing neighbor counts twice the span's own distance, standing in for
    /// itself and its diagonal. A missing diagonal counts once.
    pub fn blur(&self, open: &OpenHeightfield, threshold: u16) -> DistanceField {
        let distances = (0..self.distances.len())
            .map(|i| self.blurred(open, threshold, i))
            .collect();
        DistanceField::new(distances)
    }

    /// Same as [`DistanceField::blur`], but spread over the rayon thread pool.
    pub fn par_blur(&self, open: &OpenHeightfield, threshold: u16) -> DistanceField {
        let distances = (0..self.distances.len())
            .into_par_iter()
            .map(|i| self.blurred(open, threshold, i))
            .collect();
        DistanceField::new(distances)
    }

    fn blurred(&self, open: &OpenHeightfield, threshold: u16, i: usize) -> u16 {
        let threshold = threshold as u32 * 2;
        let cd = self.distances[i] as u32;
        if cd <= threshold {
            return cd as u16;
        }
        let span = &open.spans[i];
        let mut d = cd;
        for dir in DIRECTIONS {
            let Some(a) = span.con(dir) else {
                d += cd * 2;
                continue;
            };
            d += self.distances[a] as u32;
            let diagonal = open.spans[a].con(rotate_cw(dir));
            d += diagonal.map_or(cd, |b| self.distances[b] as u32);
        }
        ((d + 5) / 9) as u16
    }
}
