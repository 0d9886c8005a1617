//! Cluster generation and cluster mass bookkeeping.

use approx::assert_relative_eq;
use nalgebra::Point3;
use sim_softbody::SoftBody;

fn two_tet_body() -> SoftBody {
    let positions = [
        Point3::new(0.0, 0.0, 0.0),
        Point3::new(1.0, 0.0, 0.0),
        Point3::new(0.0, 1.0, 0.0),
        Point3::new(0.0, 0.0, 1.0),
        Point3::new(1.0, 1.0, 1.0),
    ];
    SoftBody::from_tetrahedra("pair", &positions, &[[0, 1, 2, 3], [1, 2, 3, 4]], 2.0).unwrap()
}

/// One cluster per tetrahedron, holding exactly its four nodes.
#[test]
fn zero_clusters_means_one_per_tetra() {
    let mut cube = SoftBody::cube("cube", Point3::origin(), 1.0, 1.0).unwrap();
    let tetras = cube.tetras().len();
    assert_eq!(cube.generate_clusters(0), tetras);
    for (cluster, tetra) in cube.clusters().iter().zip(cube.tetras()) {
        let mut members: Vec<usize> = cluster.nodes.to_vec();
        let mut expected = tetra.nodes.to_vec();
        members.sort_unstable();
        expected.sort_unstable();
        assert_eq!(members, expected);
    }
}

/// A surface-only body gets one cluster per triangle.
#[test]
fn zero_clusters_on_a_surface_means_one_per_face() {
    let mut cloth = SoftBody::patch(
        "cloth",
        [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 0.0, 1.0),
            Point3::new(1.0, 0.0, 1.0),
        ],
        3,
        3,
        0,
        1.0,
    )
    .unwrap();
    let faces = cloth.faces().len();
    assert_eq!(cloth.generate_clusters(0), faces);
    assert!(cloth.clusters().iter().all(|c| c.nodes.len() == 3));
}

/// Cluster mass is the sum of its free members' masses.
#[test]
fn cluster_mass_sums_free_members() {
    let mut body = two_tet_body();
    body.set_mass(0, 3.0);
    body.set_mass(4, 0.0);
    body.generate_clusters(0);

    for cluster in body.clusters() {
        let expected: f64 = cluster
            .nodes
            .iter()
            .map(|&i| &body.nodes()[i])
            .filter(|n| !n.is_pinned())
            .map(|n| 1.0 / n.inv_mass)
            .sum();
        assert_relative_eq!(cluster.mass, expected, epsilon = 1e-12);
    }
    // The cluster holding the pinned node cannot be moved by impulses.
    assert_relative_eq!(body.clusters()[1].inv_mass, 0.0);
    assert!(body.clusters()[0].inv_mass > 0.0);
}

/// A cluster of only pinned nodes stays finite.
#[test]
fn fully_pinned_cluster_is_finite() {
    let mut body = two_tet_body();
    for i in 0..4 {
        body.set_mass(i, 0.0);
    }
    body.generate_clusters(0);
    let cluster = &body.clusters()[0];
    assert_relative_eq!(cluster.mass, 0.0);
    assert_relative_eq!(cluster.inv_mass, 0.0);
    assert!(cluster.com.coords.iter().all(|c| c.is_finite()));
    assert!(cluster.local_inv_inertia.iter().all(|c| c.is_finite()));
}

/// K-means clustering covers every node and is deterministic.
#[test]
fn kmeans_partition_is_deterministic() {
    let build = || {
        let mut body = SoftBody::patch(
            "cloth",
            [
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(4.0, 0.0, 0.0),
                Point3::new(0.0, 0.0, 4.0),
                Point3::new(4.0, 0.0, 4.0),
            ],
            9,
            9,
            0,
            1.0,
        )
        .unwrap();
        body.generate_clusters(4);
        body
    };
    let a = build();
    let b = build();
    assert!(!a.clusters().is_empty());
    let mut covered = vec![false; a.nodes().len()];
    for (ca, cb) in a.clusters().iter().zip(b.clusters()) {
        assert_eq!(ca.nodes, cb.nodes);
        for &i in &ca.nodes {
            covered[i] = true;
        }
    }
    assert!(covered.iter().all(|&c| c));
}
