#![doc = include_str!("../../../readme.md")]

mod config;
mod context;
mod contours;
mod distance_field;
mod geometry;
mod grid;
mod heightfield;
mod main_api;
pub(crate) mod math;
mod open_heightfield;
mod rasterize;
mod voxels;
mod watershed;

pub use config::{ConfigError, NavGraphConfig, NavGraphConfigBuilder};
pub use context::{BuildContext, Pooled, ScratchPool, TaskScope, YieldNow};
pub use contours::{Contour, ContourSet};
pub use distance_field::DistanceField;
pub use geometry::{BoxInstance, GeometryInput, MeshInstance, OrientedBox};
pub use grid::{GridParameters, GridParametersError};
pub use heightfield::{HeightColumn, HeightSpan, Heightfield};
pub use main_api::{BuildError, Generation, NavGraph};
pub use math::Aabb3d;
pub use open_heightfield::{OpenCell, OpenHeightfield, OpenHeightfieldError, OpenSpan};
pub use rasterize::{RasterizationError, rasterize_geometry, sat};
pub use voxels::{AtomicVoxelGrid, VoxelGrid};
pub use watershed::{RegionId, RegionSettings, Regions, SegmentationError};
