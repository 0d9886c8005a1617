//! Shared-memory protocol scenarios against a soft world backend.

use std::path::Path;
use std::sync::Arc;

use nalgebra::{Point3, UnitQuaternion, Vector3};
use sim_shm::{
    ClientCommand, InProcessSharedMemory, LinkState, LoadOptions, ModelLoader, MultiBodyState, PhysicsBackend,
    PhysicsClient, PhysicsServer, ReplyType, Result, ServerConfig, ShmError, SoftWorldBackend,
};
use sim_softbody::{SoftBody, SoftWorld, WorldInfo};

/// Loads `*.cube` paths as a clustered soft cube.
struct CubeLoader;

impl ModelLoader for CubeLoader {
    fn accepts(&self, path: &Path) -> bool {
        path.extension().is_some_and(|e| e == "cube")
    }

    fn load(&self, path: &Path, _options: &LoadOptions, world: &mut SoftWorld) -> Result<()> {
        let mut cube = SoftBody::cube("cube", Point3::new(0.0, 2.0, 0.0), 1.0, 1.0)
            .map_err(|e| ShmError::model_load(format!("{}: {e}", path.display())))?;
        cube.generate_clusters(0);
        world.add_body(cube);
        Ok(())
    }
}

/// Articulated body with a fixed link layout.
#[derive(Debug)]
struct ArmBackend {
    links: Vec<LinkState>,
    steps: usize,
}

impl PhysicsBackend for ArmBackend {
    fn load_model(&mut self, _path: &str, _options: &LoadOptions) -> Result<()> {
        Ok(())
    }

    fn step(&mut self, _dt: f64) {
        self.steps += 1;
    }

    fn actual_state(&self) -> Option<MultiBodyState> {
        Some(MultiBodyState {
            base_position: Point3::new(0.0, 0.0, 1.0),
            base_orientation: UnitQuaternion::identity(),
            base_linear_velocity: Vector3::zeros(),
            base_angular_velocity: Vector3::zeros(),
            links: self.links.clone(),
        })
    }

    fn set_gravity(&mut self, _gravity: &Vector3<f64>) {}
}

fn soft_server(memory: &Arc<InProcessSharedMemory>) -> PhysicsServer<SoftWorldBackend> {
    let backend = SoftWorldBackend::new(SoftWorld::new(WorldInfo::default())).with_loader(Box::new(CubeLoader));
    PhysicsServer::new(backend, ServerConfig::default(), memory.clone())
}

/// One step request: the server-issued counter moves by exactly one and the
/// reply reports completion.
#[test]
fn step_request_gets_one_reply() {
    let memory = Arc::new(InProcessSharedMemory::new());
    let mut server = soft_server(&memory);
    let client = PhysicsClient::connect_default(memory.as_ref()).unwrap();

    let (_, _, issued_before, _) = client.counters();
    client
        .submit(ClientCommand::StepForwardSimulation { delta_time: 1.0 / 60.0 })
        .unwrap();
    assert_eq!(server.step_simulation(), 1);

    let (client_issued, client_processed, issued_after, _) = client.counters();
    assert_eq!(issued_after, issued_before + 1);
    assert_eq!((client_issued, client_processed), (1, 1));
    let reply = client.poll_reply().unwrap();
    assert_eq!(reply.kind, ReplyType::StepForwardSimulationCompleted);
    assert_eq!(reply.sequence, 1);
    assert_eq!(client.counters().3, 1);
    assert_eq!(server.backend().world().step_count(), 1);
}

/// Q and U sizes follow the link layout: `7 + ΣP` and `6 + ΣD`.
#[test]
fn actual_state_dof_counts() {
    let memory = Arc::new(InProcessSharedMemory::new());
    let backend = ArmBackend {
        links: vec![
            // revolute
            LinkState {
                positions: vec![0.3],
                velocities: vec![-0.2],
            },
            // spherical
            LinkState {
                positions: vec![0.0, 0.0, 0.0, 1.0],
                velocities: vec![0.1, 0.2, 0.3],
            },
            // fixed
            LinkState::default(),
            // prismatic
            LinkState {
                positions: vec![0.05],
                velocities: vec![0.0],
            },
        ],
        steps: 0,
    };
    let mut server = PhysicsServer::new(backend, ServerConfig::default(), memory.clone());
    let client = PhysicsClient::connect_default(memory.as_ref()).unwrap();

    client.submit(ClientCommand::RequestActualState).unwrap();
    server.step_simulation();
    let reply = client.poll_reply().unwrap();
    assert_eq!(reply.kind, ReplyType::ActualStateUpdateCompleted);
    assert_eq!(reply.num_dof_q, 7 + 6);
    assert_eq!(reply.num_dof_u, 6 + 5);

    let (q, u) = client.actual_state(&reply);
    assert_eq!(q.len(), 13);
    assert_eq!(&q[..7], &[0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]);
    assert_eq!(q[7], 0.3);
    assert_eq!(q[12], 0.05);
    assert_eq!(&u[6..], &[-0.2, 0.1, 0.2, 0.3, 0.0]);
    assert_eq!(server.backend().steps, 0);
}

/// A full session: load, step, read state, reject a bad request, shut down.
#[test]
fn soft_world_session() {
    let memory = Arc::new(InProcessSharedMemory::new());
    let mut server = soft_server(&memory);
    let client = PhysicsClient::connect_default(memory.as_ref()).unwrap();

    client
        .submit(ClientCommand::LoadModel {
            path: "robot.urdf".into(),
            use_multi_body: true,
            use_fixed_base: false,
        })
        .unwrap();
    client
        .submit(ClientCommand::LoadModel {
            path: "jelly.cube".into(),
            use_multi_body: true,
            use_fixed_base: false,
        })
        .unwrap();
    for _ in 0..12 {
        client
            .submit(ClientCommand::StepForwardSimulation { delta_time: 1.0 / 60.0 })
            .unwrap();
    }
    client.submit(ClientCommand::RequestActualState).unwrap();
    client
        .submit(ClientCommand::StepForwardSimulation { delta_time: -1.0 })
        .unwrap();
    assert!(matches!(
        client.submit(ClientCommand::Shutdown),
        Err(ShmError::QueueFull { .. })
    ));

    assert_eq!(server.step_simulation(), 16);
    let replies: Vec<_> = std::iter::from_fn(|| client.poll_reply()).collect();
    assert_eq!(replies.len(), 16);
    assert_eq!(replies[0].kind, ReplyType::ModelLoadingFailed);
    assert!(replies[0].message.as_deref().unwrap_or_default().contains("robot.urdf"));
    assert_eq!(replies[1].kind, ReplyType::ModelLoadingCompleted);
    assert!(replies[2..14].iter().all(|r| r.kind == ReplyType::StepForwardSimulationCompleted));
    assert_eq!(replies[14].kind, ReplyType::ActualStateUpdateCompleted);
    assert_eq!(replies[14].num_dof_q, 7 + 5 * 3);
    assert_eq!(replies[15].kind, ReplyType::InvalidArgument);

    let (q, _) = client.actual_state(&replies[14]);
    assert!(q[1] < 2.0, "cube should have fallen, base y = {}", q[1]);

    client.submit(ClientCommand::Shutdown).unwrap();
    assert_eq!(server.step_simulation(), 1);
    assert!(server.wants_termination());
    assert!(client.poll_reply().is_none());
    assert!(matches!(
        client.submit(ClientCommand::RequestActualState),
        Err(ShmError::NotInitialized(_))
    ));
}
