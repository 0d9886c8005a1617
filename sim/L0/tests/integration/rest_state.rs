//! Rest lengths, rest states and spring convergence.

use approx::assert_relative_eq;
use nalgebra::{Point3, Vector3};
use sim_softbody::{MaterialId, RigidBodySet, SoftBody, SoftWorld, WorldInfo, step_bodies};

fn no_gravity() -> WorldInfo {
    WorldInfo {
        gravity: Vector3::zeros(),
        ..WorldInfo::default()
    }
}

fn two_nodes(separation: f64) -> SoftBody {
    let mut body = SoftBody::new("spring");
    body.append_node(Point3::origin(), 1.0);
    body.append_node(Point3::new(separation, 0.0, 0.0), 1.0);
    body.append_link(0, 1, MaterialId(0), false).unwrap();
    body
}

/// A link's rest length is the node separation when it is appended, and a
/// reset re-captures the current separation.
#[test]
fn rest_length_tracks_append_and_reset() {
    let mut body = SoftBody::new("links");
    let points = [
        Point3::new(0.0, 0.0, 0.0),
        Point3::new(1.0, 2.0, 2.0),
        Point3::new(-3.0, 0.5, 4.0),
    ];
    for p in &points {
        body.append_node(*p, 1.0);
    }
    body.append_link(0, 1, MaterialId(0), false).unwrap();
    body.append_link(1, 2, MaterialId(0), false).unwrap();
    assert_relative_eq!(body.links()[0].rest_length, 3.0, epsilon = 1e-12);
    assert_relative_eq!(
        body.links()[1].rest_length,
        (points[1] - points[2]).norm(),
        epsilon = 1e-12
    );

    body.node_mut(2).unwrap().position = Point3::new(7.0, -1.0, 0.0);
    body.reset_link_rest_lengths();
    assert_relative_eq!(
        body.links()[1].rest_length,
        (Point3::new(7.0, -1.0, 0.0) - points[1]).norm(),
        epsilon = 1e-12
    );
    assert_relative_eq!(body.links()[0].rest_length, 3.0, epsilon = 1e-12);
}

/// Zero force and zero velocity: a full step leaves every node in place,
/// for any step size.
#[test]
fn unforced_body_stays_put() {
    for dt in [1e-5, 1.0 / 240.0, 1.0 / 60.0, 0.1, 1.0] {
        let mut world = SoftWorld::new(no_gravity());
        let mut cube = SoftBody::cube("cube", Point3::new(0.5, -2.0, 3.0), 2.0, 5.0).unwrap();
        cube.generate_clusters(2);
        let id = world.add_body(cube);
        let before: Vec<Point3<f64>> = world.body(id).unwrap().nodes().iter().map(|n| n.position).collect();

        world.step(dt);

        for (node, p) in world.body(id).unwrap().nodes().iter().zip(&before) {
            assert_relative_eq!(node.position, *p, epsilon = 1e-10);
        }
    }
}

/// A stretched spring between equal masses relaxes to its rest length.
#[test]
fn stretched_spring_converges() {
    let mut body = two_nodes(1.0);
    body.node_mut(1).unwrap().position.x = 1.5;

    body.static_solve(10);
    let length = (body.nodes()[1].position - body.nodes()[0].position).norm();
    assert_relative_eq!(length, 1.0, epsilon = 1e-6);
    // Equal masses move symmetrically.
    assert_relative_eq!(body.nodes()[0].position.x, 0.25, epsilon = 1e-6);
}

/// The same relaxation happens inside world steps.
#[test]
fn stretched_spring_converges_under_stepping() {
    let mut world = SoftWorld::new(no_gravity());
    let mut body = two_nodes(1.0);
    body.node_mut(1).unwrap().position.x = 1.2;
    let id = world.add_body(body);

    for _ in 0..200 {
        world.step(1.0 / 60.0);
    }
    let body = world.body(id).unwrap();
    let length = (body.nodes()[1].position - body.nodes()[0].position).norm();
    assert_relative_eq!(length, 1.0, epsilon = 1e-3);
}

/// Independent bodies give the same result in a batch as one by one.
#[test]
fn batch_matches_individual_steps() {
    let build = || {
        let cloth = SoftBody::patch(
            "cloth",
            [
                Point3::new(0.0, 1.0, 0.0),
                Point3::new(1.0, 1.0, 0.0),
                Point3::new(0.0, 1.0, 1.0),
                Point3::new(1.0, 1.0, 1.0),
            ],
            5,
            5,
            1,
            0.5,
        )
        .unwrap();
        let rope = SoftBody::rope("rope", &Point3::origin(), &Point3::new(0.0, 0.0, 2.0), 8, 1, 0.3).unwrap();
        vec![cloth, rope]
    };
    let info = WorldInfo::default();

    let mut batch = build();
    let mut single = build();
    let mut rigids = RigidBodySet::new();
    for _ in 0..20 {
        step_bodies(&mut batch, &info, 1.0 / 60.0);
        for body in &mut single {
            body.step(1.0 / 60.0, &info, &mut rigids);
        }
    }
    for (a, b) in batch.iter().zip(&single) {
        for (na, nb) in a.nodes().iter().zip(b.nodes()) {
            assert_eq!(na.position, nb.position);
        }
    }
}
