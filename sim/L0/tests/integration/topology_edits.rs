//! Cutting, refinement and bending constraints on live bodies.

use approx::assert_relative_eq;
use nalgebra::{Point3, Vector3};
use sim_softbody::{ImplicitPlane, MaterialId, SoftBody, SoftBodyConfig, SoftWorld, WorldInfo};

fn rope(segments: usize) -> SoftBody {
    SoftBody::rope("rope", &Point3::origin(), &Point3::new(1.0, 0.0, 0.0), segments, 0, 1.0).unwrap()
}

fn half_space_x(at: f64) -> ImplicitPlane {
    ImplicitPlane {
        normal: Vector3::x(),
        offset: -at,
    }
}

/// Subdividing conserves mass and places the new node on the surface.
#[test]
fn refine_subdivides_crossed_link() {
    let mut body = rope(3);
    let mass = body.total_mass();

    let refined = body.refine(&half_space_x(0.5), 1e-6, false);
    assert_eq!(refined, 1);
    assert_eq!(body.nodes().len(), 5);
    assert_eq!(body.links().len(), 4);
    assert_relative_eq!(body.total_mass(), mass, epsilon = 1e-9);
    assert_relative_eq!(body.nodes()[4].position.x, 0.5, epsilon = 1e-5);

    let rest: f64 = body.links().iter().map(|l| l.rest_length).sum();
    assert_relative_eq!(rest, 1.0, epsilon = 1e-9);
}

/// Cutting separates the rope into two pieces.
#[test]
fn refine_with_cut_disconnects() {
    let mut body = rope(3);
    assert_eq!(body.refine(&half_space_x(0.5), 1e-6, true), 1);
    assert_eq!(body.nodes().len(), 6);
    assert_eq!(body.links().len(), 4);
    assert!(!body.check_link(4, 5));
    assert!(!body.check_link(1, 2));

    // The two halves fall apart under opposite pulls.
    let mut world = SoftWorld::new(WorldInfo {
        gravity: Vector3::zeros(),
        ..WorldInfo::default()
    });
    body.add_force_to(0, &Vector3::new(-5.0, 0.0, 0.0));
    body.add_force_to(3, &Vector3::new(5.0, 0.0, 0.0));
    let id = world.add_body(body);
    for _ in 0..30 {
        world.step(1.0 / 60.0);
    }
    let body = world.body(id).unwrap();
    let gap = body.nodes()[5].position.x - body.nodes()[4].position.x;
    assert!(gap > 0.01, "halves did not separate: {gap}");
    assert!(body.nodes().iter().all(|n| n.position.coords.iter().all(|c| c.is_finite())));
}

/// Cutting an edge that no primitive uses changes nothing.
#[test]
fn cut_of_missing_edge_is_a_no_op() {
    let mut body = rope(3);
    assert!(!body.cut_link(0, 3, 0.5));
    assert!(!body.cut_link(0, 99, 0.5));
    assert_eq!(body.nodes().len(), 4);
    assert_eq!(body.links().len(), 3);
}

/// Bending links join nodes two hops apart.
#[test]
fn bending_links_on_a_rope() {
    let mut body = rope(4);
    let added = body.generate_bending_constraints(2, MaterialId(0)).unwrap();
    assert_eq!(added, 3);
    assert_eq!(body.links().iter().filter(|l| l.bending).count(), 3);
    assert!(body.check_link(0, 2));
    assert!(body.check_link(2, 4));
    assert!(body.generate_bending_constraints(2, MaterialId(9)).is_err());
}

/// Cutting a cloth edge splits both faces sharing it.
#[test]
fn cut_cloth_edge() {
    let mut cloth = SoftBody::patch(
        "cloth",
        [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(2.0, 0.0, 0.0),
            Point3::new(0.0, 0.0, 2.0),
            Point3::new(2.0, 0.0, 2.0),
        ],
        3,
        3,
        0,
        1.0,
    )
    .unwrap();
    let (nodes, faces) = (cloth.nodes().len(), cloth.faces().len());
    let interior = cloth
        .links()
        .iter()
        .map(|l| l.nodes)
        .find(|&[a, b]| cloth.faces().iter().filter(|f| f.nodes.contains(&a) && f.nodes.contains(&b)).count() == 2)
        .unwrap();

    assert!(cloth.cut_link(interior[0], interior[1], 0.5));
    assert_eq!(cloth.nodes().len(), nodes + 2);
    assert_eq!(cloth.faces().len(), faces + 2);
    let hit = cloth.ray_test(&Point3::new(0.3, 1.0, 0.3), &Point3::new(0.3, -1.0, 0.3));
    assert!(hit.is_some());
}

/// A shape-matched body keeps stepping after cuts and refinement add nodes.
#[test]
fn shape_matched_body_survives_cuts() {
    let mut cube = SoftBody::cube("cube", Point3::new(0.0, 2.0, 0.0), 1.0, 1.0)
        .unwrap()
        .with_config(SoftBodyConfig::volumetric())
        .unwrap();
    cube.set_pose(true, true);
    let [a, b] = cube.links()[0].nodes;
    assert!(cube.cut_link(a, b, 0.5));
    assert!(cube.refine(&half_space_x(0.1), 1e-6, false) > 0);
    assert!(cube.pose().tracks(cube.nodes().len()));

    let mut world = SoftWorld::new(WorldInfo::default());
    let id = world.add_body(cube);
    for _ in 0..30 {
        world.step(1.0 / 60.0);
    }
    let body = world.body(id).unwrap();
    assert!(body.nodes().iter().all(|n| n.position.coords.iter().all(|c| c.is_finite())));
    assert!(body.center_of_mass().y < 2.0);
}
