use std::time::Duration;

use thiserror::Error;

use crate::{math::Aabb3d, watershed::RegionSettings};

/// Specifies a configuration to use when generating a navigation graph. Usually built using [`NavGraphConfigBuilder`].
///
/// Units are either voxels (vx) or world units (wu). Voxels are cubes with an edge length of
/// [`NavGraphConfig::voxel_size`], so every value in voxels scales with it.
///
/// > Note:
/// >
/// > First you should decide the size of your agent.
/// > If your game world uses meters as units, a reasonable starting point for a human-sized agent
/// > might be a radius of 0.4 and a height of 2.0.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct NavGraphConfig {
    /// The edge length of a voxel. `[Limit: > 0] [Units: wu]`
    ///
    /// Smaller voxels capture more detail at the cost of a cubically growing grid.
    /// A recommended starting value is a third to a half of the agent radius.
    pub voxel_size: f32,

    /// The world-space volume to build the graph for. `[Units: wu]`
    ///
    /// If `None`, the bounds of all input geometry are used.
    pub aabb: Option<Aabb3d>,

    /// Maximum floor height difference between two neighboring spans that can still be
    /// walked across. `[Limit: >= 1] [Units: vx]`
    ///
    /// Allows the graph to flow over low lying obstructions such as curbs and up/down stairways.
    pub max_traversable_step: u16,

    /// Minimum floor to ceiling height that an agent needs to pass from one span into its
    /// neighbor. `[Limit: >= 1] [Units: vx]`
    ///
    /// Spans that are open to the top always have enough clearance.
    pub min_traversable_height: u16,

    /// Whether to smooth the distance field before partitioning it into regions.
    ///
    /// Smoothing yields rounder region boundaries.
    pub blur_distance_field: bool,

    /// Spans closer than twice this value to a border are left alone by the smoothing pass.
    /// `[Limit: >= 1] [Units: vx]`
    pub distance_blur_threshold: u16,

    /// The minimum clearance between an agent's center and any border. `[Limit: >= 1] [Units: vx]`
    ///
    /// This is the lowest water level of the watershed partitioning: spans closer than this to a
    /// border are not assigned to any region. Usually the agent radius in voxels.
    pub agent_size: u16,

    /// Regions with fewer spans than this are discarded. `[Limit: >= 0] [Units: spans]`
    ///
    /// This is useful in removing useless regions that can sometimes form on geometry such as table tops, box tops, etc.
    pub min_region_surface: u32,

    /// Width of the border regions painted along the edges of the grid. `[Limit: >= 0] [Units: vx]`
    ///
    /// A value of 0 disables the border regions.
    pub region_border_thickness: u16,

    /// How long a generation may run before it hands control back to its host.
    ///
    /// [`Duration::ZERO`] runs every stage to completion without yielding.
    /// Only relevant for [`NavGraph::generate`](crate::NavGraph::generate).
    pub time_slice: Duration,

    /// Whether to fan the stages out over the rayon thread pool.
    ///
    /// Both modes produce the same graph.
    pub prefer_multithreading: bool,

    /// Whether to keep only neighbor links that exist in both directions.
    ///
    /// The clearance rule that creates links is not symmetric when ceilings are involved,
    /// so without this a span may link to a neighbor that does not link back.
    pub symmetric_links: bool,

    /// The maximum number of steps a single contour walk may take before it is abandoned. `[Limit: > 0]`
    pub contour_iteration_cap: u32,
}

impl Default for NavGraphConfig {
    fn default() -> Self {
        NavGraphConfigBuilder::default().build()
    }
}

impl NavGraphConfig {
    /// Checks that every value is within its limits.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.voxel_size.is_finite() && self.voxel_size > 0.0) {
            return Err(ConfigError::InvalidVoxelSize(self.voxel_size));
        }
        if let Some(aabb) = self.aabb {
            if !(aabb.min.is_finite() && aabb.max.is_finite()) {
                return Err(ConfigError::NonFiniteBounds(aabb));
            }
        }
        let positive = [
            ("max_traversable_step", self.max_traversable_step),
            ("min_traversable_height", self.min_traversable_height),
            ("distance_blur_threshold", self.distance_blur_threshold),
            ("agent_size", self.agent_size),
        ];
        if let Some((name, _)) = positive.into_iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::NotPositive(name));
        }
        if self.contour_iteration_cap == 0 {
            return Err(ConfigError::NotPositive("contour_iteration_cap"));
        }
        Ok(())
    }

    /// The parameters of the watershed partitioning.
    pub fn region_settings(&self) -> RegionSettings {
        RegionSettings {
            min_level: self.agent_size,
            min_region_surface: self.min_region_surface,
            border_thickness: self.region_border_thickness,
        }
    }
}

/// A builder for [`NavGraphConfig`]. Takes the agent's dimensions in world units and
/// converts them to voxels.
/// The default values are chosen to be reasonable for an agent resembling an adult human.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct NavGraphConfigBuilder {
    /// The edge length of a voxel. `[Limit: > 0] [Units: wu]`
    pub voxel_size: f32,
    /// The height of the agent. `[Limit: > 0] [Units: wu]`
    ///
    /// It's often a good idea to add a little bit of padding to the height. For example,
    /// an agent that is 1.8 world units tall might want to set this value to 2.0 units.
    pub agent_height: f32,
    /// The radius of the agent. `[Limit: > 0] [Units: wu]`
    pub agent_radius: f32,
    /// The highest step the agent can climb. `[Limit: > 0] [Units: wu]`
    pub agent_max_climb: f32,
    /// The edge length of the smallest square region that is kept. `[Limit: >= 0] [Units: vx]`
    pub region_min_size: f32,
    /// See [`NavGraphConfig::region_border_thickness`]. `[Units: vx]`
    pub region_border_thickness: u16,
    /// See [`NavGraphConfig::blur_distance_field`].
    pub blur_distance_field: bool,
    /// See [`NavGraphConfig::distance_blur_threshold`]. `[Units: vx]`
    pub distance_blur_threshold: u16,
    /// See [`NavGraphConfig::aabb`].
    pub aabb: Option<Aabb3d>,
    /// See [`NavGraphConfig::time_slice`].
    pub time_slice: Duration,
    /// See [`NavGraphConfig::prefer_multithreading`].
    pub prefer_multithreading: bool,
    /// See [`NavGraphConfig::symmetric_links`].
    pub symmetric_links: bool,
    /// See [`NavGraphConfig::contour_iteration_cap`].
    pub contour_iteration_cap: u32,
}

impl Default for NavGraphConfigBuilder {
    fn default() -> Self {
        Self {
            voxel_size: 0.25,
            agent_height: 2.0,
            agent_radius: 0.6,
            agent_max_climb: 0.9,
            region_min_size: 8.0,
            region_border_thickness: 0,
            blur_distance_field: true,
            distance_blur_threshold: 1,
            aabb: None,
            time_slice: Duration::ZERO,
            prefer_multithreading: false,
            symmetric_links: true,
            contour_iteration_cap: 40_000,
        }
    }
}

impl NavGraphConfigBuilder {
    /// Builds a [`NavGraphConfig`] from the current configuration.
    ///
    /// Voxel values are clamped to at least 1 so that a tiny agent still produces a valid config.
    pub fn build(self) -> NavGraphConfig {
        NavGraphConfig {
            voxel_size: self.voxel_size,
            aabb: self.aabb,
            max_traversable_step: ((self.agent_max_climb / self.voxel_size).floor() as u16).max(1),
            min_traversable_height: ((self.agent_height / self.voxel_size).ceil() as u16).max(1),
            blur_distance_field: self.blur_distance_field,
            distance_blur_threshold: self.distance_blur_threshold,
            agent_size: ((self.agent_radius / self.voxel_size).ceil() as u16).max(1),
            min_region_surface: (self.region_min_size * self.region_min_size) as u32,
            region_border_thickness: self.region_border_thickness,
            time_slice: self.time_slice,
            prefer_multithreading: self.prefer_multithreading,
            symmetric_links: self.symmetric_links,
            contour_iteration_cap: self.contour_iteration_cap,
        }
    }
}

/// Errors that can occur when validating a [`NavGraphConfig`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// The voxel size was zero, negative or not finite.
    #[error("Voxel size must be positive and finite, but got {0}")]
    InvalidVoxelSize(f32),
    /// The explicit bounds contain non-finite values.
    #[error("Bounds must be finite, but got {0:?}")]
    NonFiniteBounds(Aabb3d),
    /// A value that must be at least 1 was 0.
    #[error("`{0}` must be at least 1")]
    NotPositive(&'static str),
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::*;

    #[test]
    fn default_is_a_valid_human_agent() {
        let config = NavGraphConfig::default();
        assert_eq!(config.validate(), Ok(()));
        // 0.9 / 0.25, 2.0 / 0.25, 0.6 / 0.25
        assert_eq!(config.max_traversable_step, 3);
        assert_eq!(config.min_traversable_height, 8);
        assert_eq!(config.agent_size, 3);
        assert_eq!(config.min_region_surface, 64);
        assert!(config.symmetric_links);
    }

    #[test]
    fn tiny_agents_are_clamped_to_one_voxel() {
        let config = NavGraphConfigBuilder {
            voxel_size: 1.0,
            agent_height: 0.1,
            agent_radius: 0.1,
            agent_max_climb: 0.1,
            ..Default::default()
        }
        .build();
        assert_eq!(config.max_traversable_step, 1);
        assert_eq!(config.min_traversable_height, 1);
        assert_eq!(config.agent_size, 1);
    }

    #[test]
    fn validate_rejects_out_of_range_values() {
        let valid = NavGraphConfig::default();
        for voxel_size in [0.0, -1.0, f32::NAN, f32::INFINITY] {
            let config = NavGraphConfig {
                voxel_size,
                ..valid.clone()
            };
            assert!(matches!(
                config.validate(),
                Err(ConfigError::InvalidVoxelSize(_))
            ));
        }
        let config = NavGraphConfig {
            agent_size: 0,
            ..valid.clone()
        };
        assert_eq!(config.validate(), Err(ConfigError::NotPositive("agent_size")));
        let config = NavGraphConfig {
            max_traversable_step: 0,
            ..valid.clone()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::NotPositive("max_traversable_step"))
        );
        let config = NavGraphConfig {
            aabb: Some(Aabb3d {
                min: Vec3::ZERO,
                max: Vec3::new(f32::INFINITY, 1.0, 1.0),
            }),
            ..valid
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NonFiniteBounds(_))
        ));
    }

    #[test]
    fn region_settings_use_agent_size_as_min_level() {
        let config = NavGraphConfig {
            agent_size: 4,
            min_region_surface: 9,
            region_border_thickness: 2,
            ..Default::default()
        };
        assert_eq!(
            config.region_settings(),
            RegionSettings {
                min_level: 4,
                min_region_surface: 9,
                border_thickness: 2,
            }
        );
    }

    #[cfg(feature = "serialize")]
    #[test]
    fn serde_round_trip() {
        let config = NavGraphConfig {
            aabb: Some(Aabb3d::new(Vec3::ZERO, Vec3::splat(4.0))),
            time_slice: Duration::from_millis(4),
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: NavGraphConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, deserialized);
    }
}
