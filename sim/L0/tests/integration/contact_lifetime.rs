//! Contact joints between clusters and rigid bodies across world steps.

use std::sync::Arc;

use nalgebra::{Isometry3, Point3, Vector3};
use sim_softbody::{
    Body, CollisionFlags, JointKind, PlaneSdf, RigidBody, SoftBody, SoftBodyId, SoftWorld, WorldInfo,
};

const MAX_LIFE: u32 = 3;

fn ground() -> RigidBody {
    RigidBody::fixed(Isometry3::identity()).with_collider(Arc::new(PlaneSdf {
        normal: Vector3::y(),
        offset: 0.0,
    }))
}

fn world_with_clustered_cube() -> (SoftWorld, SoftBodyId) {
    let mut world = SoftWorld::new(WorldInfo::default());
    world.add_rigid_body(ground());

    let mut cube = SoftBody::cube("cube", Point3::new(0.0, 0.45, 0.0), 1.0, 1.0).unwrap();
    cube.set_collision_margin(0.05);
    let mut config = cube.config().clone();
    config.collisions = CollisionFlags::CL_RS;
    config.contact_max_life = MAX_LIFE;
    cube.set_config(config).unwrap();
    cube.generate_clusters(0);
    let id = world.add_body(cube);
    (world, id)
}

fn contact_lives(world: &SoftWorld, id: SoftBodyId) -> Vec<([Body; 2], u32)> {
    world
        .body(id)
        .unwrap()
        .joints()
        .iter()
        .filter(|j| matches!(j.kind, JointKind::Contact { .. }))
        .map(|j| (j.bodies, j.life().unwrap()))
        .collect()
}

/// Every surviving contact ages by exactly one per step and none outlives
/// the configured maximum.
#[test]
fn contact_life_advances_one_per_step() {
    let (mut world, id) = world_with_clustered_cube();
    let mut previous: Vec<([Body; 2], u32)> = Vec::new();
    let mut seen = 0;

    for _ in 0..30 {
        world.step(1.0 / 60.0);
        let current = contact_lives(&world, id);
        seen += current.len();
        for (bodies, life) in &current {
            assert!(*life >= 1 && *life <= MAX_LIFE, "life {life} out of range");
            if let Some((_, old)) = previous.iter().find(|(b, _)| b == bodies) {
                // Either the same joint aged by one, or it expired and a
                // fresh one replaced it.
                assert!(*life == old + 1 || *life == 1, "life went {old} -> {life}");
            }
        }
        previous = current;
    }
    assert!(seen > 0, "cube never touched the ground");
}

/// Once the body leaves the ground its contacts are purged.
#[test]
fn contacts_purged_when_separated() {
    let (mut world, id) = world_with_clustered_cube();
    for _ in 0..5 {
        world.step(1.0 / 60.0);
    }
    assert!(!contact_lives(&world, id).is_empty());

    world.body_mut(id).unwrap().translate(&Vector3::new(0.0, 10.0, 0.0));
    world.info.gravity = Vector3::zeros();
    world.body_mut(id).unwrap().set_velocity(&Vector3::zeros());
    world.step(1.0 / 60.0);
    assert!(contact_lives(&world, id).is_empty());
}

/// Removing the ground removes every contact joint that refers to it.
#[test]
fn removing_the_ground_drops_its_joints() {
    let (mut world, id) = world_with_clustered_cube();
    let ground_id = world.rigid_bodies().iter().next().map(|(rid, _)| rid).unwrap();
    for _ in 0..5 {
        world.step(1.0 / 60.0);
    }
    assert!(world.body(id).unwrap().joints().iter().any(|j| j.references_rigid(ground_id)));
    world.remove_rigid_body(ground_id).unwrap();
    assert!(world.body(id).unwrap().joints().is_empty());
}

fn lowest_node(world: &SoftWorld, id: SoftBodyId) -> f64 {
    world
        .body(id)
        .unwrap()
        .nodes()
        .iter()
        .map(|n| n.position.y)
        .fold(f64::INFINITY, f64::min)
}

/// Cluster contacts carry the body under the default config, where every
/// contact lives for a single step.
#[test]
fn clustered_cube_rests_with_default_contact_life() {
    let mut world = SoftWorld::new(WorldInfo::default());
    world.add_rigid_body(ground());

    let mut cube = SoftBody::cube("cube", Point3::new(0.0, 0.6, 0.0), 1.0, 1.0).unwrap();
    cube.set_collision_margin(0.05);
    let mut config = cube.config().clone();
    config.collisions = CollisionFlags::CL_RS;
    assert_eq!(config.contact_max_life, 0);
    cube.set_config(config).unwrap();
    cube.generate_clusters(0);
    let id = world.add_body(cube);

    for _ in 0..120 {
        world.step(1.0 / 60.0);
    }
    let lowest = lowest_node(&world, id);
    assert!(lowest > -0.15, "cube sank through the ground: {lowest}");
    assert!(lowest < 0.5, "cube never fell: {lowest}");
}

/// An anchored node follows its fixed rigid body while the rest of the rope
/// swings down.
#[test]
fn anchor_holds_its_node() {
    let mut world = SoftWorld::new(WorldInfo::default());
    let hook = RigidBody::fixed(Isometry3::translation(0.0, 2.0, 0.0));
    let mut rope = SoftBody::rope("rope", &Point3::new(0.0, 2.0, 0.0), &Point3::new(1.0, 2.0, 0.0), 4, 0, 1.0).unwrap();
    let hook_id = world.add_rigid_body(hook.clone());
    rope.append_anchor_at_node(0, hook_id, &hook, 1.0, true).unwrap();
    let id = world.add_body(rope);

    for _ in 0..120 {
        world.step(1.0 / 60.0);
    }
    let body = world.body(id).unwrap();
    let held = body.nodes()[0].position;
    assert!((held - Point3::new(0.0, 2.0, 0.0)).norm() < 0.05, "anchor drifted to {held}");
    assert!(body.nodes()[4].position.y < 1.5, "free end did not fall");
}
