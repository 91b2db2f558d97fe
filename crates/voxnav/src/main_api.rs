use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker},
    time::Duration,
};

use thiserror::Error;
use tracing::Instrument as _;

use crate::{
    config::{ConfigError, NavGraphConfig},
    context::BuildContext,
    contours::ContourSet,
    distance_field::DistanceField,
    geometry::GeometryInput,
    grid::{GridParameters, GridParametersError},
    heightfield::Heightfield,
    open_heightfield::{OpenHeightfield, OpenHeightfieldError},
    rasterize::{RasterizationError, rasterize_geometry},
    voxels::VoxelGrid,
    watershed::{Regions, SegmentationError},
};

/// Number of stages run by [`NavGraph::build_with`], each reporting as one nested task.
const STAGE_COUNT: u32 = 7;

/// Everything a generation run produces, from the voxels up to the region contours.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct NavGraph {
    /// The grid every stage worked on.
    pub grid: GridParameters,
    /// The rasterized geometry.
    pub voxels: VoxelGrid,
    /// The voxels compressed into solid and open column spans.
    pub heightfield: Heightfield,
    /// The open spans and their neighbor links.
    pub open_heightfield: OpenHeightfield,
    /// Distance of every open span to the nearest border, smoothed if configured.
    pub distances: DistanceField,
    /// The region of every open span.
    pub regions: Regions,
    /// The boundaries of all regions.
    pub contours: ContourSet,
}

impl NavGraph {
    /// Runs the whole pipeline on the calling thread and returns once it is done.
    ///
    /// [`NavGraphConfig::time_slice`] is ignored. Use [`NavGraph::generate`] to spread the work over
    /// several polls.
    pub fn build(input: &GeometryInput, config: &NavGraphConfig) -> Result<Self, BuildError> {
        let ctx = BuildContext::new(Duration::ZERO, config.prefer_multithreading);
        ctx.block_on(
            Self::build_with(&ctx, input, config).instrument(tracing::info_span!("build_nav_graph")),
        )
    }

    /// Starts a generation that makes progress each time [`Generation::advance`] is called.
    ///
    /// Every call runs until the configured [`NavGraphConfig::time_slice`] is used up.
    pub fn generate(input: GeometryInput, config: NavGraphConfig) -> Generation {
        let context = Arc::new(BuildContext::new(
            config.time_slice,
            config.prefer_multithreading,
        ));
        let ctx = Arc::clone(&context);
        let future = async move { Self::build_with(&ctx, &input, &config).await }
            .instrument(tracing::info_span!("generate_nav_graph"));
        Generation {
            context,
            future: Some(Box::pin(future)),
        }
    }

    /// Runs every stage against `ctx`, suspending whenever its time slice is used up.
    pub async fn build_with(
        ctx: &BuildContext,
        input: &GeometryInput,
        config: &NavGraphConfig,
    ) -> Result<Self, BuildError> {
        config.validate()?;
        let parallel = ctx.prefer_multithreading();
        let aabb = match config.aabb {
            Some(aabb) => aabb,
            None if parallel => {
                input.par_compute_aabb().ok_or(BuildError::EmptyInput)?
            }
            None => input.compute_aabb().ok_or(BuildError::EmptyInput)?,
        };
        let grid = GridParameters::new(aabb, config.voxel_size)?;
        tracing::debug!(
            width = grid.width(),
            height = grid.height(),
            depth = grid.depth(),
            time_slice = ?ctx.time_slice(),
            multithreaded = parallel,
            "generating navigation graph"
        );

        let _root = ctx.push_task(STAGE_COUNT, "navigation graph");
        let voxels = rasterize_geometry(ctx, input, grid)
            .instrument(tracing::debug_span!("rasterize"))
            .await?;
        tracing::debug!(filled = voxels.filled_count(), "rasterized geometry");

        let heightfield = Heightfield::build(ctx, &voxels)
            .instrument(tracing::debug_span!("heightfield"))
            .await;
        let open_heightfield = OpenHeightfield::from_heightfield(
            ctx,
            &heightfield,
            config.max_traversable_step,
            config.min_traversable_height,
            config.symmetric_links,
        )
        .instrument(tracing::debug_span!("open_heightfield"))
        .await?;

        let mut distances = open_heightfield
            .build_distance_field(ctx)
            .instrument(tracing::debug_span!("distance_field"))
            .await;
        {
            let _task = ctx.push_task(1, "blur");
            if config.blur_distance_field {
                distances = if parallel {
                    distances.par_blur(&open_heightfield, config.distance_blur_threshold)
                } else {
                    distances.blur(&open_heightfield, config.distance_blur_threshold)
                };
            }
        }
        if !parallel {
            ctx.yield_now().await;
        }

        let regions = open_heightfield
            .build_regions(ctx, &distances, config.region_settings())
            .instrument(tracing::debug_span!("regions"))
            .await?;
        let contours = open_heightfield
            .build_contours(ctx, &regions, config.contour_iteration_cap)
            .instrument(tracing::debug_span!("contours"))
            .await;

        tracing::info!(
            spans = open_heightfield.span_count(),
            max_distance = distances.max_distance,
            regions = regions.region_count,
            contours = contours.contours.len(),
            yields = ctx.yield_count(),
            "built navigation graph"
        );
        Ok(Self {
            grid,
            voxels,
            heightfield,
            open_heightfield,
            distances,
            regions,
            contours,
        })
    }
}

/// A navigation graph being generated. Drive it by calling [`Generation::advance`] repeatedly,
/// e.g. once per frame.
pub struct Generation {
    context: Arc<BuildContext>,
    future: Option<Pin<Box<dyn Future<Output = Result<NavGraph, BuildError>> + Send>>>,
}

impl std::fmt::Debug for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generation")
            .field("context", &self.context)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl Generation {
    /// Runs the generation for one time slice.
    ///
    /// Returns the graph once all stages are done. Calling this again afterwards returns
    /// [`BuildError::AlreadyFinished`].
    pub fn advance(&mut self) -> Poll<Result<NavGraph, BuildError>> {
        let Some(future) = self.future.as_mut() else {
            return Poll::Ready(Err(BuildError::AlreadyFinished));
        };
        self.context.begin_slice();
        let mut cx = Context::from_waker(Waker::noop());
        let poll = future.as_mut().poll(&mut cx);
        if poll.is_ready() {
            self.future = None;
        }
        poll
    }

    /// The overall progress in `[0, 1]`. Safe to call from other threads through [`Generation::context`].
    pub fn progress(&self) -> f32 {
        if self.is_finished() {
            1.0
        } else {
            self.context.progress()
        }
    }

    /// Whether the generation has returned its result.
    pub fn is_finished(&self) -> bool {
        self.future.is_none()
    }

    /// The context the generation runs against.
    pub fn context(&self) -> &Arc<BuildContext> {
        &self.context
    }
}

/// Errors that can occur when generating a [`NavGraph`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BuildError {
    /// The configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// No bounds were configured and there is no geometry to derive them from.
    #[error("No bounds were configured and the input contains no geometry")]
    EmptyInput,
    /// The bounds cannot be mapped to a voxel grid.
    #[error(transparent)]
    Grid(#[from] GridParametersError),
    /// The input geometry is malformed.
    #[error(transparent)]
    Rasterization(#[from] RasterizationError),
    /// The open heightfield could not be built.
    #[error(transparent)]
    OpenHeightfield(#[from] OpenHeightfieldError),
    /// The region partitioning failed.
    #[error(transparent)]
    Segmentation(#[from] SegmentationError),
    /// [`Generation::advance`] was called after the generation had already returned its result.
    #[error("The generation has already finished")]
    AlreadyFinished,
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::*;
    use crate::{geometry::BoxInstance, math::Aabb3d};

    fn platform() -> GeometryInput {
        GeometryInput {
            boxes: vec![BoxInstance::axis_aligned(
                Vec3::new(6.0, 0.5, 6.0),
                Vec3::new(12.0, 1.0, 12.0),
            )],
            ..Default::default()
        }
    }

    fn config() -> NavGraphConfig {
        NavGraphConfig {
            voxel_size: 1.0,
            aabb: Some(Aabb3d {
                min: Vec3::ZERO,
                max: Vec3::new(12.0, 4.0, 12.0),
            }),
            max_traversable_step: 1,
            min_traversable_height: 2,
            agent_size: 1,
            min_region_surface: 0,
            ..Default::default()
        }
    }

    #[test]
    fn builds_all_stages() {
        let graph = NavGraph::build(&platform(), &config()).unwrap();
        assert_eq!(graph.grid.width(), 12);
        assert_eq!(graph.voxels.filled_count(), 144);
        assert_eq!(graph.open_heightfield.span_count(), 144);
        assert!(graph.regions.region_count >= 1);
        assert!(!graph.contours.is_empty());
        assert!(graph.contours.contours.iter().all(|c| c.closed));
    }

    #[test]
    fn invalid_config_fails_before_any_stage() {
        let config = NavGraphConfig {
            agent_size: 0,
            ..config()
        };
        assert_eq!(
            NavGraph::build(&platform(), &config),
            Err(BuildError::Config(ConfigError::NotPositive("agent_size")))
        );
    }

    #[test]
    fn empty_input_without_bounds_is_an_error() {
        let config = NavGraphConfig {
            aabb: None,
            ..config()
        };
        assert_eq!(
            NavGraph::build(&GeometryInput::default(), &config),
            Err(BuildError::EmptyInput)
        );
    }

    #[test]
    fn generation_reports_completion_once() {
        let mut generation = NavGraph::generate(platform(), config());
        let graph = loop {
            if let Poll::Ready(result) = generation.advance() {
                break result.unwrap();
            }
        };
        assert!(generation.is_finished());
        assert_eq!(generation.progress(), 1.0);
        assert_eq!(generation.advance(), Poll::Ready(Err(BuildError::AlreadyFinished)));
        assert_eq!(graph, NavGraph::build(&platform(), &config()).unwrap());
    }

    #[test]
    fn multithreaded_build_never_suspends() {
        let ctx = BuildContext::new(Duration::from_nanos(1), true);
        let graph = ctx
            .block_on(NavGraph::build_with(&ctx, &platform(), &config()))
            .unwrap();
        assert_eq!(ctx.yield_count(), 0);
        let sequential = NavGraph::build(&platform(), &config()).unwrap();
        assert_eq!(graph.voxels, sequential.voxels);
        assert_eq!(graph.distances, sequential.distances);
        assert_eq!(graph.regions.region_count, sequential.regions.region_count);
    }

    #[test]
    fn generation_is_send() {
        fn assert_send<T: Send>(_: &T) {}
        assert_send(&NavGraph::generate(platform(), config()));
    }
}
