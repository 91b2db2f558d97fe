//! A staircase leading up to a balcony, generated a little bit every frame.
//!
//! Run with `RUST_LOG=debug` to see what every stage does.

use std::{task::Poll, time::Duration};

use anyhow::Result;
use glam::{Quat, Vec3};
use voxnav::{BoxInstance, GeometryInput, MeshInstance, NavGraph, NavGraphConfigBuilder};

const FRAME_BUDGET: Duration = Duration::from_millis(2);

fn main() -> Result<()> {
    env_logger::init();

    let config = NavGraphConfigBuilder {
        voxel_size: 0.25,
        agent_radius: 0.4,
        agent_max_climb: 0.5,
        region_min_size: 4.0,
        region_border_thickness: 1,
        time_slice: FRAME_BUDGET,
        ..Default::default()
    }
    .build();
    log::info!(
        "Agent: step {} vx, height {} vx, size {} vx",
        config.max_traversable_step,
        config.min_traversable_height,
        config.agent_size
    );

    let mut generation = NavGraph::generate(scene(), config);
    let mut frame = 0;
    let graph = loop {
        frame += 1;
        match generation.advance() {
            Poll::Ready(graph) => break graph?,
            Poll::Pending => {
                log::info!(
                    "Frame {frame}: {:5.1}% {:?}",
                    generation.progress() * 100.0,
                    generation.context().task_labels()
                );
            }
        }
    };
    log::info!("Generated in {frame} frames");

    print_stats(&graph);
    Ok(())
}

fn scene() -> GeometryInput {
    let mut boxes = vec![
        // Ground
        BoxInstance::axis_aligned(Vec3::new(0.0, -0.25, 0.0), Vec3::new(20.0, 0.5, 20.0)),
        // Balcony
        BoxInstance::axis_aligned(Vec3::new(6.0, 2.25, 0.0), Vec3::new(6.0, 0.5, 8.0)),
    ];
    // Ten steps of 0.25 up to the balcony
    for step in 0..10 {
        let height = 0.25 * (step + 1) as f32;
        boxes.push(BoxInstance::axis_aligned(
            Vec3::new(-2.0 + 0.5 * step as f32, height / 2.0, 0.0),
            Vec3::new(0.5, height, 2.0),
        ));
    }
    // A crate standing askew on the ground
    boxes.push(BoxInstance {
        size: Vec3::new(1.5, 1.0, 1.5),
        rotation: Quat::from_rotation_y(35.0_f32.to_radians()),
        position: Vec3::new(-6.0, 0.5, -5.0),
        ..Default::default()
    });

    let pillars = [Vec3::new(-5.0, 1.5, 5.0), Vec3::new(4.0, 1.5, 6.0)]
        .into_iter()
        .map(|position| {
            MeshInstance::cuboid(Vec3::new(0.8, 3.0, 0.8)).with_transform(
                position,
                Quat::IDENTITY,
                Vec3::ONE,
            )
        })
        .collect();

    GeometryInput {
        meshes: pillars,
        boxes,
    }
}

fn print_stats(graph: &NavGraph) {
    let grid = &graph.grid;
    println!(
        "Grid: {}x{}x{} voxels of {} wu",
        grid.width(),
        grid.height(),
        grid.depth(),
        grid.voxel_size()
    );
    println!("Solid voxels: {}", graph.voxels.filled_count());
    println!(
        "Open spans: {} ({} walkable)",
        graph.open_heightfield.span_count(),
        graph
            .open_heightfield
            .spans
            .iter()
            .filter(|span| span.is_walkable())
            .count()
    );
    println!("Max distance: {}", graph.distances.max_distance);
    println!("Regions: {}", graph.regions.region_count);
    for region in graph.regions.region_ids() {
        let contours: Vec<_> = graph.contours.contours_of(region).collect();
        let edges: usize = contours.iter().map(|contour| contour.edge_count()).sum();
        let start = contours
            .first()
            .and_then(|contour| graph.contours.world_vertices(contour).first().copied());
        println!(
            "  #{:<4} {:5} spans, {} contour(s), {} edges, starting at {:?}",
            region.id(),
            graph.regions.area(region),
            contours.len(),
            edges,
            start
        );
    }
    let open = graph.contours.contours.iter().filter(|c| !c.closed).count();
    if open > 0 {
        println!("Contours cut off by the iteration cap: {open}");
    }
}
