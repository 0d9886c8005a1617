//! The soft body: particle mesh, topology, materials and per-body state.
//!
//! A body owns arenas of nodes, links, faces and tetrahedra. Primitives refer
//! to nodes by index, so editing topology never leaves a dangling reference.
//!
//! ```text
//!   nodes ──┬── links   (distance constraints)
//!           ├── faces   (surface, aerodynamics, soft contacts, ray tests)
//!           └── tetras  (volume constraints, volumetric mass)
//! ```
//!
//! Three bounding volume trees index the nodes, faces and clusters. Node and
//! face leaves are created on append and refitted by motion prediction.

use hashbrown::{HashMap, HashSet};
use nalgebra::{Isometry3, Point3, UnitQuaternion, Vector3};
use tracing::debug;

use crate::cluster::Cluster;
use crate::config::SoftBodyConfig;
use crate::contact::{Anchor, RigidContact, SoftContact};
use crate::dbvt::{Aabb, Dbvt};
use crate::error::{Result, SoftBodyError};
use crate::joint::{AngularControl, Body, ClusterRef, Joint, JointSpecs};
use crate::material::{Material, MaterialId};
use crate::mesh::{Face, Link, Node, Tetra, ray_triangle, tetra_signed_volume, triangle_area};
use crate::pose::Pose;
use crate::rigid::{RigidBody, RigidBodyId, RigidBodySet};
use crate::solver::SolverState;
use crate::types::{Feature, Frame, NodeFlags, RayHit, SoftBodyId, next_soft_body_id};

/// Default collision margin of a new body.
pub const DEFAULT_COLLISION_MARGIN: f64 = 0.25;

/// A deformable body.
///
/// Cloning a body keeps its [`SoftBodyId`]; joints and soft contacts refer to
/// bodies by id, so a clone should not share a world with its original.
#[derive(Debug, Clone)]
pub struct SoftBody {
    pub(crate) id: SoftBodyId,
    pub(crate) name: String,
    pub(crate) config: SoftBodyConfig,
    pub(crate) state: SolverState,
    pub(crate) pose: Pose,
    pub(crate) materials: Vec<Material>,
    pub(crate) nodes: Vec<Node>,
    pub(crate) links: Vec<Link>,
    pub(crate) faces: Vec<Face>,
    pub(crate) tetras: Vec<Tetra>,
    pub(crate) anchors: Vec<Anchor>,
    pub(crate) rigid_contacts: Vec<RigidContact>,
    pub(crate) soft_contacts: Vec<SoftContact>,
    pub(crate) joints: Vec<Joint>,
    pub(crate) clusters: Vec<Cluster>,
    pub(crate) cluster_connectivity: Vec<bool>,
    pub(crate) node_tree: Dbvt,
    pub(crate) face_tree: Dbvt,
    pub(crate) cluster_tree: Dbvt,
    pub(crate) bounds: Aabb,
    pub(crate) collision_margin: f64,
    pub(crate) disabled_collisions: Vec<RigidBodyId>,
    pub(crate) wind_velocity: Vector3<f64>,
    pub(crate) rest_length_scale: f64,
}

impl SoftBody {
    /// Create an empty body with the default configuration and one default
    /// material.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            id: next_soft_body_id(),
            name: name.to_string(),
            config: SoftBodyConfig::default(),
            state: SolverState::default(),
            pose: Pose::default(),
            materials: vec![Material::default()],
            nodes: Vec::new(),
            links: Vec::new(),
            faces: Vec::new(),
            tetras: Vec::new(),
            anchors: Vec::new(),
            rigid_contacts: Vec::new(),
            soft_contacts: Vec::new(),
            joints: Vec::new(),
            clusters: Vec::new(),
            cluster_connectivity: Vec::new(),
            node_tree: Dbvt::new(),
            face_tree: Dbvt::new(),
            cluster_tree: Dbvt::new(),
            bounds: Aabb::default(),
            collision_margin: DEFAULT_COLLISION_MARGIN,
            disabled_collisions: Vec::new(),
            wind_velocity: Vector3::zeros(),
            rest_length_scale: 1.0,
        }
    }

    /// Replace the configuration, builder style.
    ///
    /// # Errors
    ///
    /// Returns [`SoftBodyError::InvalidConfig`] if the configuration does not
    /// validate.
    pub fn with_config(mut self, config: SoftBodyConfig) -> Result<Self> {
        self.set_config(config)?;
        Ok(self)
    }

    /// Replace the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SoftBodyError::InvalidConfig`] if the configuration does not
    /// validate; the current configuration is kept.
    pub fn set_config(&mut self, config: SoftBodyConfig) -> Result<()> {
        config.validate()?;
        self.config = config;
        Ok(())
    }

    /// Build a volumetric body from a tetrahedral mesh.
    ///
    /// Links are created for every unique tetrahedron edge and faces for every
    /// tetrahedron face that is not shared (the boundary surface), oriented
    /// outward. Mass is distributed by tetrahedron volume.
    ///
    /// # Errors
    ///
    /// Returns an error if an index is out of range or a tetrahedron repeats a
    /// node.
    pub fn from_tetrahedra(
        name: &str,
        positions: &[Point3<f64>],
        tetrahedra: &[[usize; 4]],
        total_mass: f64,
    ) -> Result<Self> {
        let mut body = Self::new(name);
        for p in positions {
            body.append_node(*p, 1.0);
        }

        let mut oriented = Vec::with_capacity(tetrahedra.len());
        for &tet in tetrahedra {
            body.check_indices(&tet)?;
            let p = tet.map(|i| positions[i]);
            // Right-handed corner order keeps the extracted faces outward.
            oriented.push(if tetra_signed_volume(&p) < 0.0 {
                [tet[0], tet[2], tet[1], tet[3]]
            } else {
                tet
            });
        }

        // Unique edges
        let mut edges: HashSet<(usize, usize)> = HashSet::new();
        for tet in &oriented {
            for (a, b) in [(0, 1), (0, 2), (0, 3), (1, 2), (1, 3), (2, 3)] {
                let key = (tet[a].min(tet[b]), tet[a].max(tet[b]));
                if edges.insert(key) {
                    body.append_link(key.0, key.1, MaterialId(0), false)?;
                }
            }
        }

        // Boundary faces appear exactly once
        let tet_faces = |t: &[usize; 4]| {
            [
                [t[0], t[2], t[1]],
                [t[0], t[1], t[3]],
                [t[1], t[2], t[3]],
                [t[0], t[3], t[2]],
            ]
        };
        let mut face_count: HashMap<[usize; 3], usize> = HashMap::new();
        for tet in &oriented {
            for face in tet_faces(tet) {
                let mut key = face;
                key.sort_unstable();
                *face_count.entry(key).or_insert(0) += 1;
            }
        }
        for tet in &oriented {
            for face in tet_faces(tet) {
                let mut key = face;
                key.sort_unstable();
                if face_count.get(&key) == Some(&1) {
                    body.append_face(face[0], face[1], face[2], MaterialId(0))?;
                }
            }
        }

        for tet in oriented {
            body.append_tetra(tet, MaterialId(0))?;
        }
        body.set_volume_mass(total_mass);
        body.update_normals();
        body.update_bounds();
        Ok(body)
    }

    /// Build a surface body from a triangle mesh.
    ///
    /// # Errors
    ///
    /// Returns an error if an index is out of range or a triangle repeats a
    /// node.
    pub fn from_triangles(
        name: &str,
        positions: &[Point3<f64>],
        triangles: &[[usize; 3]],
        total_mass: f64,
    ) -> Result<Self> {
        let mut body = Self::new(name);
        for p in positions {
            body.append_node(*p, 1.0);
        }
        let mut edges: HashSet<(usize, usize)> = HashSet::new();
        for tri in triangles {
            body.check_indices(tri)?;
            for (a, b) in [(0, 1), (1, 2), (2, 0)] {
                let key = (tri[a].min(tri[b]), tri[a].max(tri[b]));
                if edges.insert(key) {
                    body.append_link(key.0, key.1, MaterialId(0), false)?;
                }
            }
        }
        for tri in triangles {
            body.append_face(tri[0], tri[1], tri[2], MaterialId(0))?;
        }
        body.set_total_mass(total_mass, true);
        body.update_normals();
        body.update_bounds();
        Ok(body)
    }

    /// Axis-aligned cube of edge length `size` made of five tetrahedra.
    ///
    /// # Errors
    ///
    /// Returns an error if `size` is not positive.
    pub fn cube(name: &str, center: Point3<f64>, size: f64, total_mass: f64) -> Result<Self> {
        if size.is_nan() || size <= 0.0 {
            return Err(SoftBodyError::invalid_topology(format!(
                "cube size must be positive, got {size}"
            )));
        }
        let h = size / 2.0;
        let mut positions = Vec::with_capacity(8);
        for k in 0..2 {
            for j in 0..2 {
                for i in 0..2 {
                    let offset = Vector3::new(
                        if i == 0 { -h } else { h },
                        if j == 0 { -h } else { h },
                        if k == 0 { -h } else { h },
                    );
                    positions.push(center + offset);
                }
            }
        }
        let idx = |i: usize, j: usize, k: usize| k * 4 + j * 2 + i;
        let (v000, v100, v010, v110) = (idx(0, 0, 0), idx(1, 0, 0), idx(0, 1, 0), idx(1, 1, 0));
        let (v001, v101, v011, v111) = (idx(0, 0, 1), idx(1, 0, 1), idx(0, 1, 1), idx(1, 1, 1));
        let tetrahedra = [
            [v000, v100, v010, v001],
            [v100, v110, v010, v111],
            [v100, v001, v101, v111],
            [v010, v001, v011, v111],
            [v100, v010, v001, v111],
        ];
        Self::from_tetrahedra(name, &positions, &tetrahedra, total_mass)
    }

    /// Rectangular cloth patch.
    ///
    /// `corners` are `[c00, c10, c01, c11]`; `res_x` and `res_y` count nodes
    /// per side (at least 2). `fixed` pins corners: `1 = c00`, `2 = c10`,
    /// `4 = c01`, `8 = c11`. Cells are split along alternating diagonals.
    ///
    /// # Errors
    ///
    /// Returns an error if a resolution is below 2.
    pub fn patch(
        name: &str,
        corners: [Point3<f64>; 4],
        res_x: usize,
        res_y: usize,
        fixed: u32,
        total_mass: f64,
    ) -> Result<Self> {
        if res_x < 2 || res_y < 2 {
            return Err(SoftBodyError::invalid_topology(format!(
                "patch resolution must be at least 2x2, got {res_x}x{res_y}"
            )));
        }
        let [c00, c10, c01, c11] = corners;
        let lerp = |a: &Point3<f64>, b: &Point3<f64>, t: f64| a + (b - a) * t;
        let idx = |ix: usize, iy: usize| iy * res_x + ix;

        let mut body = Self::new(name);
        for iy in 0..res_y {
            let ty = iy as f64 / (res_y - 1) as f64;
            let row0 = lerp(&c00, &c01, ty);
            let row1 = lerp(&c10, &c11, ty);
            for ix in 0..res_x {
                let tx = ix as f64 / (res_x - 1) as f64;
                body.append_node(lerp(&row0, &row1, tx), 1.0);
            }
        }
        for (bit, (ix, iy)) in [(0, 0), (res_x - 1, 0), (0, res_y - 1), (res_x - 1, res_y - 1)]
            .into_iter()
            .enumerate()
        {
            if fixed & (1 << bit) != 0 {
                body.nodes[idx(ix, iy)].inv_mass = 0.0;
            }
        }

        let m = MaterialId(0);
        for iy in 0..res_y {
            for ix in 0..res_x {
                if ix + 1 < res_x {
                    body.append_link(idx(ix, iy), idx(ix + 1, iy), m, false)?;
                }
                if iy + 1 < res_y {
                    body.append_link(idx(ix, iy), idx(ix, iy + 1), m, false)?;
                }
                if ix + 1 < res_x && iy + 1 < res_y {
                    let (n00, n10, n01, n11) =
                        (idx(ix, iy), idx(ix + 1, iy), idx(ix, iy + 1), idx(ix + 1, iy + 1));
                    if (ix + iy) & 1 == 1 {
                        body.append_face(n00, n10, n11, m)?;
                        body.append_face(n00, n11, n01, m)?;
                        body.append_link(n00, n11, m, false)?;
                    } else {
                        body.append_face(n01, n00, n10, m)?;
                        body.append_face(n01, n10, n11, m)?;
                        body.append_link(n10, n01, m, false)?;
                    }
                }
            }
        }
        body.set_total_mass(total_mass, true);
        body.update_normals();
        body.update_bounds();
        Ok(body)
    }

    /// Rope from `from` to `to` with `segments` links.
    ///
    /// `fixed` pins ends: `1 = from`, `2 = to`.
    ///
    /// # Errors
    ///
    /// Returns an error if `segments` is zero.
    pub fn rope(
        name: &str,
        from: &Point3<f64>,
        to: &Point3<f64>,
        segments: usize,
        fixed: u32,
        total_mass: f64,
    ) -> Result<Self> {
        if segments == 0 {
            return Err(SoftBodyError::invalid_topology("rope needs at least one segment"));
        }
        let mut body = Self::new(name);
        for i in 0..=segments {
            let t = i as f64 / segments as f64;
            body.append_node(from + (to - from) * t, 1.0);
        }
        if fixed & 1 != 0 {
            body.nodes[0].inv_mass = 0.0;
        }
        if fixed & 2 != 0 {
            body.nodes[segments].inv_mass = 0.0;
        }
        for i in 0..segments {
            body.append_link(i, i + 1, MaterialId(0), false)?;
        }
        body.set_total_mass(total_mass, false);
        body.update_bounds();
        Ok(body)
    }

    // Accessors

    /// Unique identifier.
    #[must_use]
    pub const fn id(&self) -> SoftBodyId {
        self.id
    }

    /// Name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration.
    #[must_use]
    pub const fn config(&self) -> &SoftBodyConfig {
        &self.config
    }

    /// Per-step solver state of the last step.
    #[must_use]
    pub const fn solver_state(&self) -> &SolverState {
        &self.state
    }

    /// Nodes.
    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Node by index.
    #[must_use]
    pub fn node(&self, index: usize) -> Option<&Node> {
        self.nodes.get(index)
    }

    /// Mutable node by index.
    ///
    /// Changing the inverse mass requires [`SoftBody::update_constants`].
    pub fn node_mut(&mut self, index: usize) -> Option<&mut Node> {
        self.nodes.get_mut(index)
    }

    /// Links.
    #[must_use]
    pub fn links(&self) -> &[Link] {
        &self.links
    }

    /// Faces.
    #[must_use]
    pub fn faces(&self) -> &[Face] {
        &self.faces
    }

    /// Tetrahedra.
    #[must_use]
    pub fn tetras(&self) -> &[Tetra] {
        &self.tetras
    }

    /// Anchors.
    #[must_use]
    pub fn anchors(&self) -> &[Anchor] {
        &self.anchors
    }

    /// Joints owned by this body.
    #[must_use]
    pub fn joints(&self) -> &[Joint] {
        &self.joints
    }

    /// Node vs rigid contacts of the current step.
    #[must_use]
    pub fn rigid_contacts(&self) -> &[RigidContact] {
        &self.rigid_contacts
    }

    /// Node vs face contacts of the current step.
    #[must_use]
    pub fn soft_contacts(&self) -> &[SoftContact] {
        &self.soft_contacts
    }

    /// Reference pose.
    #[must_use]
    pub const fn pose(&self) -> &Pose {
        &self.pose
    }

    /// World bounds of the nodes, inflated by the collision margin.
    #[must_use]
    pub const fn bounds(&self) -> &Aabb {
        &self.bounds
    }

    /// Collision margin.
    #[must_use]
    pub const fn collision_margin(&self) -> f64 {
        self.collision_margin
    }

    /// Set the collision margin.
    pub fn set_collision_margin(&mut self, margin: f64) {
        self.collision_margin = margin.max(0.0);
    }

    /// Wind velocity seen by aerodynamics.
    #[must_use]
    pub const fn wind_velocity(&self) -> &Vector3<f64> {
        &self.wind_velocity
    }

    /// Set the wind velocity.
    pub fn set_wind_velocity(&mut self, velocity: Vector3<f64>) {
        self.wind_velocity = velocity;
    }

    /// Materials.
    #[must_use]
    pub fn materials(&self) -> &[Material] {
        &self.materials
    }

    /// Material by id.
    #[must_use]
    pub fn material(&self, id: MaterialId) -> Option<&Material> {
        self.materials.get(id.0)
    }

    /// Mutable material by id.
    ///
    /// Stiffness changes take effect after [`SoftBody::update_constants`].
    pub fn material_mut(&mut self, id: MaterialId) -> Option<&mut Material> {
        self.materials.get_mut(id.0)
    }

    // Appending

    /// Append a copy of the default material.
    pub fn append_material(&mut self) -> MaterialId {
        let base = self.materials.first().copied().unwrap_or_default();
        self.materials.push(base);
        MaterialId(self.materials.len() - 1)
    }

    /// Append a node; `mass` of zero pins it. Returns its index.
    ///
    /// A captured pose is extended to cover the new node.
    pub fn append_node(&mut self, position: Point3<f64>, mass: f64) -> usize {
        let index = self.nodes.len();
        let mut node = Node::new(position, mass, MaterialId(0));
        node.leaf = Some(
            self.node_tree
                .insert(Aabb::from_center_radius(position, self.collision_margin), index),
        );
        self.nodes.push(node);
        self.pose.extend(&self.nodes);
        index
    }

    fn check_indices(&self, indices: &[usize]) -> Result<()> {
        for (k, &i) in indices.iter().enumerate() {
            if i >= self.nodes.len() {
                return Err(SoftBodyError::index_out_of_bounds(format!(
                    "node {i} of {}",
                    self.nodes.len()
                )));
            }
            if indices[..k].contains(&i) {
                return Err(SoftBodyError::invalid_topology(format!(
                    "node {i} repeated in primitive {indices:?}"
                )));
            }
        }
        Ok(())
    }

    fn check_material(&self, material: MaterialId) -> Result<&Material> {
        self.materials.get(material.0).ok_or_else(|| {
            SoftBodyError::index_out_of_bounds(format!(
                "material {} of {}",
                material.0,
                self.materials.len()
            ))
        })
    }

    /// Append a link between `n0` and `n1` with rest length equal to their
    /// current distance. Returns its index.
    ///
    /// With `dedup`, an existing link between the same nodes is returned
    /// instead.
    ///
    /// # Errors
    ///
    /// Returns an error for out-of-range indices, `n0 == n1`, an unknown
    /// material, or coincident nodes.
    pub fn append_link(&mut self, n0: usize, n1: usize, material: MaterialId, dedup: bool) -> Result<usize> {
        self.check_indices(&[n0, n1])?;
        let mat = *self.check_material(material)?;
        if dedup {
            if let Some(existing) = self.links.iter().position(|l| l.connects(n0, n1)) {
                return Ok(existing);
            }
        }
        let rest_length = (self.nodes[n1].position - self.nodes[n0].position).norm();
        if rest_length <= f64::EPSILON {
            return Err(SoftBodyError::invalid_topology(format!(
                "link {n0}-{n1} joins coincident nodes"
            )));
        }
        let mut link = Link::new(n0, n1, material, rest_length);
        link.update_constants(&self.nodes, &mat);
        self.links.push(link);
        Ok(self.links.len() - 1)
    }

    /// Append a link copying material and flags of link `model`.
    ///
    /// # Errors
    ///
    /// Returns an error if `model` does not exist or the link is invalid.
    pub fn append_link_from(&mut self, model: usize, n0: usize, n1: usize) -> Result<usize> {
        let template = *self
            .links
            .get(model)
            .ok_or_else(|| SoftBodyError::index_out_of_bounds(format!("link {model}")))?;
        let index = self.append_link(n0, n1, template.material, false)?;
        self.links[index].bending = template.bending;
        Ok(index)
    }

    /// Append a face. Returns its index.
    ///
    /// # Errors
    ///
    /// Returns an error for out-of-range or repeated indices or an unknown
    /// material.
    pub fn append_face(&mut self, n0: usize, n1: usize, n2: usize, material: MaterialId) -> Result<usize> {
        self.check_indices(&[n0, n1, n2])?;
        self.check_material(material)?;
        let index = self.faces.len();
        let mut face = Face::new(n0, n1, n2, material);
        face.update_constants(&self.nodes);
        face.leaf = self
            .face_volume(&face)
            .map(|volume| self.face_tree.insert(volume, index));
        self.faces.push(face);
        Ok(index)
    }

    /// Append a face using the material of face `model`.
    ///
    /// # Errors
    ///
    /// Returns an error if `model` does not exist or the face is invalid.
    pub fn append_face_from(&mut self, model: usize, n0: usize, n1: usize, n2: usize) -> Result<usize> {
        let material = self
            .faces
            .get(model)
            .map(|f| f.material)
            .ok_or_else(|| SoftBodyError::index_out_of_bounds(format!("face {model}")))?;
        self.append_face(n0, n1, n2, material)
    }

    /// Append a tetrahedron. Returns its index.
    ///
    /// # Errors
    ///
    /// Returns an error for out-of-range or repeated indices or an unknown
    /// material.
    pub fn append_tetra(&mut self, nodes: [usize; 4], material: MaterialId) -> Result<usize> {
        self.check_indices(&nodes)?;
        let mat = *self.check_material(material)?;
        let mut tetra = Tetra::new(nodes, material);
        tetra.update_constants(&self.nodes, &mat);
        self.tetras.push(tetra);
        Ok(self.tetras.len() - 1)
    }

    /// Append a tetrahedron using the material of tetrahedron `model`.
    ///
    /// # Errors
    ///
    /// Returns an error if `model` does not exist or the tetrahedron is
    /// invalid.
    pub fn append_tetra_from(&mut self, model: usize, nodes: [usize; 4]) -> Result<usize> {
        let material = self
            .tetras
            .get(model)
            .map(|t| t.material)
            .ok_or_else(|| SoftBodyError::index_out_of_bounds(format!("tetra {model}")))?;
        self.append_tetra(nodes, material)
    }

    /// Whether a link joins `a` and `b`.
    #[must_use]
    pub fn check_link(&self, a: usize, b: usize) -> bool {
        self.links.iter().any(|l| l.connects(a, b))
    }

    /// Whether a face uses exactly nodes `a`, `b`, `c` in any order.
    #[must_use]
    pub fn check_face(&self, a: usize, b: usize, c: usize) -> bool {
        self.faces
            .iter()
            .any(|f| f.contains(a) && f.contains(b) && f.contains(c))
    }

    /// Bind node `node` to `local` in the frame of rigid body `rigid`.
    ///
    /// # Errors
    ///
    /// Returns an error if the node does not exist or `influence` is outside
    /// `[0, 1]`.
    pub fn append_anchor(
        &mut self,
        node: usize,
        rigid: RigidBodyId,
        local: Vector3<f64>,
        influence: f64,
    ) -> Result<()> {
        if node >= self.nodes.len() {
            return Err(SoftBodyError::index_out_of_bounds(format!("node {node}")));
        }
        if !(0.0..=1.0).contains(&influence) {
            return Err(SoftBodyError::invalid_config(format!(
                "anchor influence must be in [0, 1], got {influence}"
            )));
        }
        self.nodes[node].flags.insert(NodeFlags::ATTACHED);
        self.anchors.push(Anchor::new(node, rigid, local, influence));
        Ok(())
    }

    /// Bind node `node` to rigid body `rigid` where it currently sits.
    ///
    /// With `disable_collision`, contacts against that body are skipped.
    ///
    /// # Errors
    ///
    /// See [`SoftBody::append_anchor`].
    pub fn append_anchor_at_node(
        &mut self,
        node: usize,
        id: RigidBodyId,
        rigid: &RigidBody,
        influence: f64,
        disable_collision: bool,
    ) -> Result<()> {
        let position = self
            .nodes
            .get(node)
            .map(|n| n.position)
            .ok_or_else(|| SoftBodyError::index_out_of_bounds(format!("node {node}")))?;
        let local = rigid.pose.inverse_transform_point(&position).coords;
        self.append_anchor(node, id, local, influence)?;
        if disable_collision {
            self.disable_collision_with(id);
        }
        Ok(())
    }

    /// Drop every anchor bound to `rigid`.
    pub fn remove_anchors_of(&mut self, rigid: RigidBodyId) {
        self.anchors.retain(|a| a.rigid != rigid);
        for n in &mut self.nodes {
            n.flags.remove(NodeFlags::ATTACHED);
        }
        for a in &self.anchors {
            self.nodes[a.node].flags.insert(NodeFlags::ATTACHED);
        }
    }

    // Joints

    fn joint_endpoints(&self, cluster: usize, other: Body, rigids: &RigidBodySet) -> Result<([Body; 2], [Frame; 2])> {
        let own = self
            .clusters
            .get(cluster)
            .ok_or_else(|| SoftBodyError::invalid_joint(format!("no cluster {cluster}")))?;
        let other_frame = match other {
            Body::World => Frame::identity(),
            Body::Rigid(id) => rigids
                .get(id)
                .map(|r| Frame::from(&r.pose))
                .ok_or_else(|| SoftBodyError::invalid_joint(format!("no rigid body {}", id.0)))?,
            Body::Cluster(r) if r.body == self.id => self
                .clusters
                .get(r.index)
                .map(|c| c.frame)
                .ok_or_else(|| SoftBodyError::invalid_joint(format!("no cluster {}", r.index)))?,
            Body::Cluster(r) => {
                return Err(SoftBodyError::invalid_joint(format!(
                    "cluster of {} belongs to another body; join through the world",
                    r.body
                )));
            }
        };
        let this = Body::Cluster(ClusterRef {
            body: self.id,
            index: cluster,
        });
        Ok(([this, other], [own.frame, other_frame]))
    }

    /// Pin a point of cluster `cluster` to the same world point of `other`.
    ///
    /// # Errors
    ///
    /// Returns [`SoftBodyError::InvalidJoint`] if an endpoint does not exist or
    /// belongs to another soft body.
    pub fn append_linear_joint(
        &mut self,
        specs: &JointSpecs,
        cluster: usize,
        other: Body,
        position: &Point3<f64>,
        rigids: &RigidBodySet,
    ) -> Result<()> {
        let (bodies, frames) = self.joint_endpoints(cluster, other, rigids)?;
        self.joints.push(Joint::linear(specs, bodies, frames, position));
        Ok(())
    }

    /// Align an axis of cluster `cluster` with the same world axis of `other`.
    ///
    /// # Errors
    ///
    /// See [`SoftBody::append_linear_joint`].
    pub fn append_angular_joint(
        &mut self,
        specs: &JointSpecs,
        cluster: usize,
        other: Body,
        axis: &Vector3<f64>,
        control: Option<std::sync::Arc<dyn AngularControl>>,
        rigids: &RigidBodySet,
    ) -> Result<()> {
        let (bodies, frames) = self.joint_endpoints(cluster, other, rigids)?;
        self.joints
            .push(Joint::angular(specs, bodies, frames, axis, control));
        Ok(())
    }

    // Mass

    /// Set the mass of node `index`; zero pins it. Returns `false` if the node
    /// does not exist.
    pub fn set_mass(&mut self, index: usize, mass: f64) -> bool {
        let Some(node) = self.nodes.get_mut(index) else {
            return false;
        };
        node.inv_mass = if mass > 0.0 { 1.0 / mass } else { 0.0 };
        self.update_constants();
        true
    }

    /// Mass of node `index`, `Some(0.0)` for pinned nodes.
    #[must_use]
    pub fn mass(&self, index: usize) -> Option<f64> {
        self.nodes.get(index).map(Node::mass)
    }

    /// Sum of node masses, pinned nodes excluded.
    #[must_use]
    pub fn total_mass(&self) -> f64 {
        self.nodes.iter().map(Node::mass).sum()
    }

    /// Rescale node masses to sum to `mass`, keeping pinned nodes pinned.
    ///
    /// With `from_faces`, masses are first redistributed by adjacent face
    /// area.
    pub fn set_total_mass(&mut self, mass: f64, from_faces: bool) {
        if from_faces && !self.faces.is_empty() {
            let mut share = vec![0.0; self.nodes.len()];
            for f in &self.faces {
                let [a, b, c] = f.corners(&self.nodes);
                let twice_area = 2.0 * triangle_area(&a, &b, &c);
                for &i in &f.nodes {
                    share[i] += twice_area;
                }
            }
            for (node, s) in self.nodes.iter_mut().zip(share) {
                if !node.is_pinned() && s > 0.0 {
                    node.inv_mass = 1.0 / s;
                }
            }
        }
        let current = self.total_mass();
        if current > 0.0 && mass > 0.0 {
            let k = current / mass;
            for node in &mut self.nodes {
                node.inv_mass *= k;
            }
        }
        self.update_constants();
    }

    /// Set the total mass from a surface density (mass per unit volume of the
    /// enclosed surface).
    pub fn set_total_density(&mut self, density: f64) {
        let mass = self.volume().abs() * density;
        self.set_total_mass(mass, true);
    }

    /// Distribute `mass` by tetrahedron volume.
    ///
    /// Falls back to face areas for bodies without tetrahedra.
    pub fn set_volume_mass(&mut self, mass: f64) {
        if self.tetras.is_empty() {
            self.set_total_mass(mass, true);
            return;
        }
        let mut share = vec![0.0; self.nodes.len()];
        for t in &self.tetras {
            for &i in &t.nodes {
                share[i] += t.rest_volume.abs() / 4.0;
            }
        }
        for (node, s) in self.nodes.iter_mut().zip(share) {
            if !node.is_pinned() && s > 0.0 {
                node.inv_mass = 1.0 / s;
            }
        }
        self.set_total_mass(mass, false);
    }

    /// Distribute mass from a density over the tetrahedron volume.
    pub fn set_volume_density(&mut self, density: f64) {
        let volume: f64 = self.tetras.iter().map(|t| t.rest_volume.abs()).sum();
        self.set_volume_mass(volume * density);
    }

    // Forces and velocities

    /// Add a force to every free node.
    pub fn add_force(&mut self, force: &Vector3<f64>) {
        for node in self.nodes.iter_mut().filter(|n| !n.is_pinned()) {
            node.force += force;
        }
    }

    /// Add a force to node `index`. Returns `false` if it does not exist.
    pub fn add_force_to(&mut self, index: usize, force: &Vector3<f64>) -> bool {
        match self.nodes.get_mut(index) {
            Some(node) => {
                if !node.is_pinned() {
                    node.force += force;
                }
                true
            }
            None => false,
        }
    }

    /// Add a velocity to every free node.
    pub fn add_velocity(&mut self, velocity: &Vector3<f64>) {
        for node in self.nodes.iter_mut().filter(|n| !n.is_pinned()) {
            node.velocity += velocity;
        }
    }

    /// Add a velocity to node `index`. Returns `false` if it does not exist.
    pub fn add_velocity_to(&mut self, index: usize, velocity: &Vector3<f64>) -> bool {
        match self.nodes.get_mut(index) {
            Some(node) => {
                if !node.is_pinned() {
                    node.velocity += velocity;
                }
                true
            }
            None => false,
        }
    }

    /// Set the velocity of every free node.
    pub fn set_velocity(&mut self, velocity: &Vector3<f64>) {
        for node in self.nodes.iter_mut().filter(|n| !n.is_pinned()) {
            node.velocity = *velocity;
        }
    }

    // Transforms

    /// Apply a rigid transform to every node.
    pub fn transform(&mut self, iso: &Isometry3<f64>) {
        for node in &mut self.nodes {
            node.position = iso * node.position;
            node.prev_position = iso * node.prev_position;
            node.normal = iso.rotation * node.normal;
        }
        self.refit_trees();
        self.update_normals();
        self.update_bounds();
        self.update_constants();
    }

    /// Translate every node.
    pub fn translate(&mut self, offset: &Vector3<f64>) {
        self.transform(&Isometry3::translation(offset.x, offset.y, offset.z));
    }

    /// Rotate every node about the world origin.
    pub fn rotate(&mut self, rotation: &UnitQuaternion<f64>) {
        self.transform(&Isometry3::from_parts(nalgebra::Translation3::identity(), *rotation));
    }

    /// Scale node positions per axis; rest lengths, areas and volumes follow.
    pub fn scale(&mut self, factors: &Vector3<f64>) {
        for node in &mut self.nodes {
            node.position.coords.component_mul_assign(factors);
            node.prev_position.coords.component_mul_assign(factors);
        }
        self.refit_trees();
        self.reset_link_rest_lengths();
        for f in &mut self.faces {
            f.update_constants(&self.nodes);
        }
        for t in &mut self.tetras {
            let material = self.materials.get(t.material.0).copied().unwrap_or_default();
            t.update_constants(&self.nodes, &material);
        }
        self.update_normals();
        self.update_bounds();
        self.update_constants();
    }

    // Constants and geometry

    /// Refresh every mass- and material-dependent constant and the node area
    /// shares. Rest lengths, areas and volumes are kept.
    pub fn update_constants(&mut self) {
        for link in &mut self.links {
            let material = self.materials.get(link.material.0).copied().unwrap_or_default();
            link.update_constants(&self.nodes, &material);
        }
        for t in &mut self.tetras {
            let material = self.materials.get(t.material.0).copied().unwrap_or_default();
            let im: f64 = t.nodes.iter().map(|&i| self.nodes[i].inv_mass).sum();
            t.stiffness = if im > 0.0 {
                material.volume_stiffness
            } else {
                0.0
            };
        }
        self.update_area();
    }

    /// Set every link's rest length to its current length.
    pub fn reset_link_rest_lengths(&mut self) {
        for link in &mut self.links {
            link.rest_length = link.length(&self.nodes);
            link.rest_length_sq = link.rest_length * link.rest_length;
        }
    }

    /// Current rest length scale.
    #[must_use]
    pub const fn rest_length_scale(&self) -> f64 {
        self.rest_length_scale
    }

    /// Rescale every rest length relative to the current scale.
    pub fn set_rest_length_scale(&mut self, scale: f64) {
        if scale <= 0.0 || self.rest_length_scale <= 0.0 {
            return;
        }
        let k = scale / self.rest_length_scale;
        for link in &mut self.links {
            link.rest_length *= k;
            link.rest_length_sq = link.rest_length * link.rest_length;
        }
        self.rest_length_scale = scale;
    }

    /// Enclosed volume.
    ///
    /// Closed surfaces use their faces (oriented outward gives a positive
    /// result); bodies without faces sum their tetrahedra.
    #[must_use]
    pub fn volume(&self) -> f64 {
        let Some(origin) = self.nodes.first().map(|n| n.position) else {
            return 0.0;
        };
        if self.faces.is_empty() {
            return self
                .tetras
                .iter()
                .map(|t| tetra_signed_volume(&t.corners(&self.nodes)))
                .sum();
        }
        let sum: f64 = self
            .faces
            .iter()
            .map(|f| {
                let [a, b, c] = f.corners(&self.nodes);
                (a - origin).dot(&(b - origin).cross(&(c - origin)))
            })
            .sum();
        sum / 6.0
    }

    /// Refresh each node's share of the surrounding surface area.
    pub fn update_area(&mut self) {
        for node in &mut self.nodes {
            node.area = 0.0;
        }
        for f in &self.faces {
            let [a, b, c] = f.corners(&self.nodes);
            let share = triangle_area(&a, &b, &c) / 3.0;
            for &i in &f.nodes {
                self.nodes[i].area += share;
            }
        }
    }

    /// Refresh face normals and area-weighted node normals.
    pub fn update_normals(&mut self) {
        for node in &mut self.nodes {
            node.normal = Vector3::zeros();
        }
        for f in &mut self.faces {
            let [a, b, c] = f.corners(&self.nodes);
            let n = (b - a).cross(&(c - a));
            for &i in &f.nodes {
                self.nodes[i].normal += n;
            }
            f.update_normal(&self.nodes);
        }
        for node in &mut self.nodes {
            node.normal = node.normal.try_normalize(f64::EPSILON).unwrap_or_else(Vector3::zeros);
        }
    }

    /// Refresh the world bounds.
    pub fn update_bounds(&mut self) {
        self.bounds = Aabb::from_points(self.nodes.iter().map(|n| &n.position))
            .map_or_else(Aabb::default, |b| b.expanded(self.collision_margin));
    }

    /// Mass-weighted center of the nodes (plain average when massless).
    #[must_use]
    pub fn center_of_mass(&self) -> Point3<f64> {
        let total = self.total_mass();
        if self.nodes.is_empty() {
            return Point3::origin();
        }
        if total > 0.0 {
            let sum = self
                .nodes
                .iter()
                .fold(Vector3::zeros(), |acc, n| acc + n.position.coords * n.mass());
            Point3::from(sum / total)
        } else {
            let sum = self
                .nodes
                .iter()
                .fold(Vector3::zeros(), |acc, n| acc + n.position.coords);
            Point3::from(sum / self.nodes.len() as f64)
        }
    }

    /// Capture the current configuration as the reference pose.
    ///
    /// `volume` enables volume forces against the current volume, `frame`
    /// enables shape matching.
    pub fn set_pose(&mut self, volume: bool, frame: bool) {
        self.pose = Pose::capture(&self.nodes, self.volume(), volume, frame);
        self.update_constants();
    }

    pub(crate) fn node_volume(&self, index: usize, margin: f64) -> Aabb {
        Aabb::from_center_radius(self.nodes[index].position, margin)
    }

    pub(crate) fn face_volume(&self, face: &Face) -> Option<Aabb> {
        let corners = face.corners(&self.nodes);
        Aabb::from_points(&corners).map(|b| b.expanded(self.collision_margin))
    }

    /// Reinsert every node and face leaf at its current position.
    pub(crate) fn refit_trees(&mut self) {
        for i in 0..self.nodes.len() {
            let volume = self.node_volume(i, self.collision_margin);
            if let Some(leaf) = self.nodes[i].leaf {
                self.node_tree.update(leaf, volume);
            }
        }
        for i in 0..self.faces.len() {
            if let (Some(leaf), Some(volume)) = (self.faces[i].leaf, self.face_volume(&self.faces[i])) {
                self.face_tree.update(leaf, volume);
            }
        }
    }

    /// Rebuild the node and face trees from scratch after a topology edit.
    pub(crate) fn rebuild_trees(&mut self) {
        self.node_tree.clear();
        self.face_tree.clear();
        for i in 0..self.nodes.len() {
            let volume = self.node_volume(i, self.collision_margin);
            self.nodes[i].leaf = Some(self.node_tree.insert(volume, i));
        }
        for i in 0..self.faces.len() {
            let leaf = self
                .face_volume(&self.faces[i])
                .map(|volume| self.face_tree.insert(volume, i));
            self.faces[i].leaf = leaf;
        }
    }

    // Ray tests

    /// Nearest face hit along the segment `from -> to`.
    #[must_use]
    pub fn ray_test(&self, from: &Point3<f64>, to: &Point3<f64>) -> Option<RayHit> {
        self.face_tree
            .ray_cast(from, to, |f, best| {
                let [a, b, c] = self.faces.get(f)?.corners(&self.nodes);
                ray_triangle(from, to, &a, &b, &c, best)
            })
            .map(|(index, fraction)| RayHit {
                feature: Feature::Face,
                index,
                fraction,
            })
    }

    /// Nearest node, treated as a sphere of `radius`, hit along `from -> to`.
    ///
    /// Ties go to the lower node index.
    #[must_use]
    pub fn ray_test_nodes(&self, from: &Point3<f64>, to: &Point3<f64>, radius: f64) -> Option<RayHit> {
        let segment = Aabb::from_points([from, to])?.expanded(radius);
        let mut best: Option<(usize, f64)> = None;
        self.node_tree.collide_volume(&segment, |i| {
            let Some(node) = self.nodes.get(i) else {
                return;
            };
            let Some(t) = ray_sphere(from, to, &node.position, radius) else {
                return;
            };
            let better = match best {
                None => true,
                Some((bi, bt)) => t < bt || (t <= bt && i < bi),
            };
            if better {
                best = Some((i, t));
            }
        });
        best.map(|(index, fraction)| RayHit {
            feature: Feature::Node,
            index,
            fraction,
        })
    }

    /// Nearest cluster bounding box hit along `from -> to`.
    #[must_use]
    pub fn ray_test_clusters(&self, from: &Point3<f64>, to: &Point3<f64>) -> Option<RayHit> {
        let dir_inv = (to - from).map(|d| 1.0 / d);
        self.cluster_tree
            .ray_cast(from, to, |c, best| {
                self.clusters
                    .get(c)?
                    .bounds(&self.nodes)?
                    .ray_entry(from, &dir_inv, best)
            })
            .map(|(index, fraction)| RayHit {
                feature: Feature::Cluster,
                index,
                fraction,
            })
    }

    pub(crate) fn log_topology(&self, what: &str) {
        debug!(
            body = %self.id,
            what,
            nodes = self.nodes.len(),
            links = self.links.len(),
            faces = self.faces.len(),
            "topology changed"
        );
    }
}

/// Entry fraction of segment `from -> to` into a sphere; `0` if `from` is
/// inside.
fn ray_sphere(from: &Point3<f64>, to: &Point3<f64>, center: &Point3<f64>, radius: f64) -> Option<f64> {
    let d = to - from;
    let f = from - center;
    let c = f.norm_squared() - radius * radius;
    if c <= 0.0 {
        return Some(0.0);
    }
    let a = d.norm_squared();
    if a <= f64::EPSILON {
        return None;
    }
    let b = f.dot(&d);
    let disc = b * b - a * c;
    if disc < 0.0 {
        return None;
    }
    let t = (-b - disc.sqrt()) / a;
    (0.0..=1.0).contains(&t).then_some(t)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn square_cloth() -> SoftBody {
        SoftBody::patch(
            "cloth",
            [
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(1.0, 0.0, 0.0),
                Point3::new(0.0, 1.0, 0.0),
                Point3::new(1.0, 1.0, 0.0),
            ],
            3,
            3,
            1 | 2,
            1.0,
        )
        .unwrap()
    }

    #[test]
    fn test_cube_topology() {
        let body = SoftBody::cube("cube", Point3::origin(), 1.0, 2.0).unwrap();
        assert_eq!(body.nodes().len(), 8);
        assert_eq!(body.tetras().len(), 5);
        assert_eq!(body.links().len(), 18);
        assert_eq!(body.faces().len(), 12);
        assert_relative_eq!(body.total_mass(), 2.0, epsilon = 1e-12);
        assert_relative_eq!(body.volume(), 1.0, epsilon = 1e-12);
        for t in body.tetras() {
            assert!(t.rest_volume > 0.0);
        }
    }

    #[test]
    fn test_cube_normals_point_outward() {
        let body = SoftBody::cube("cube", Point3::origin(), 1.0, 1.0).unwrap();
        for node in body.nodes() {
            assert!(node.normal.dot(&node.position.coords) > 0.0);
        }
    }

    #[test]
    fn test_link_rest_length_and_reset() {
        let mut body = SoftBody::new("pair");
        let a = body.append_node(Point3::origin(), 1.0);
        let b = body.append_node(Point3::new(3.0, 4.0, 0.0), 1.0);
        let l = body.append_link(a, b, MaterialId(0), false).unwrap();
        assert_relative_eq!(body.links()[l].rest_length, 5.0);

        body.node_mut(b).unwrap().position = Point3::new(6.0, 8.0, 0.0);
        body.reset_link_rest_lengths();
        assert_relative_eq!(body.links()[l].rest_length, 10.0);
    }

    #[test]
    fn test_link_dedup_and_errors() {
        let mut body = SoftBody::new("pair");
        let a = body.append_node(Point3::origin(), 1.0);
        let b = body.append_node(Point3::new(1.0, 0.0, 0.0), 1.0);
        let c = body.append_node(Point3::origin(), 1.0);
        let l = body.append_link(a, b, MaterialId(0), false).unwrap();
        assert_eq!(body.append_link(b, a, MaterialId(0), true).unwrap(), l);
        assert!(body.check_link(b, a));
        assert!(matches!(
            body.append_link(a, a, MaterialId(0), false),
            Err(SoftBodyError::InvalidTopology(_))
        ));
        assert!(matches!(
            body.append_link(a, 9, MaterialId(0), false),
            Err(SoftBodyError::IndexOutOfBounds(_))
        ));
        assert!(body.append_link(a, c, MaterialId(0), false).is_err());
        assert!(body.append_link(a, b, MaterialId(3), false).is_err());
    }

    #[test]
    fn test_patch_pins_and_mass() {
        let body = square_cloth();
        assert_eq!(body.nodes().len(), 9);
        assert_eq!(body.faces().len(), 8);
        assert!(body.nodes()[0].is_pinned());
        assert!(body.nodes()[2].is_pinned());
        assert!(!body.nodes()[8].is_pinned());
        assert_relative_eq!(body.total_mass(), 1.0, epsilon = 1e-12);
        assert!(body.check_face(3, 0, 1));
        assert!(body.check_face(1, 4, 3));
    }

    #[test]
    fn test_rope_layout() {
        let body = SoftBody::rope("rope", &Point3::origin(), &Point3::new(0.0, 0.0, -4.0), 4, 1, 2.0).unwrap();
        assert_eq!(body.nodes().len(), 5);
        assert_eq!(body.links().len(), 4);
        assert!(body.nodes()[0].is_pinned());
        assert_relative_eq!(body.mass(1).unwrap(), 0.5, epsilon = 1e-12);
        assert!(SoftBody::rope("r", &Point3::origin(), &Point3::origin(), 0, 0, 1.0).is_err());
    }

    #[test]
    fn test_set_mass_and_total_mass() {
        let mut body = SoftBody::cube("cube", Point3::origin(), 1.0, 8.0).unwrap();
        assert!(body.set_mass(0, 0.0));
        assert!(body.nodes()[0].is_pinned());
        assert!(!body.set_mass(99, 1.0));

        body.set_total_mass(14.0, false);
        assert_relative_eq!(body.total_mass(), 14.0, epsilon = 1e-9);
        assert!(body.nodes()[0].is_pinned());
    }

    #[test]
    fn test_forces_skip_pinned() {
        let mut body = square_cloth();
        body.add_force(&Vector3::y());
        assert_eq!(body.nodes()[0].force, Vector3::zeros());
        assert_eq!(body.nodes()[4].force, Vector3::y());
        assert!(body.add_velocity_to(4, &Vector3::x()));
        assert!(!body.add_velocity_to(40, &Vector3::x()));
        body.set_velocity(&Vector3::z());
        assert_eq!(body.nodes()[4].velocity, Vector3::z());
        assert_eq!(body.nodes()[0].velocity, Vector3::zeros());
    }

    #[test]
    fn test_transform_and_scale() {
        let mut body = SoftBody::cube("cube", Point3::origin(), 1.0, 1.0).unwrap();
        body.translate(&Vector3::new(0.0, 5.0, 0.0));
        assert_relative_eq!(body.center_of_mass(), Point3::new(0.0, 5.0, 0.0), epsilon = 1e-12);
        assert!(body.bounds().min.y > 4.0);

        let rest = body.links()[0].rest_length;
        body.scale(&Vector3::repeat(2.0));
        assert_relative_eq!(body.links()[0].rest_length, rest * 2.0, epsilon = 1e-12);
        assert_relative_eq!(body.volume(), 8.0, epsilon = 1e-9);
    }

    #[test]
    fn test_rest_length_scale() {
        let mut body = square_cloth();
        let rest = body.links()[0].rest_length;
        body.set_rest_length_scale(0.5);
        assert_relative_eq!(body.links()[0].rest_length, rest * 0.5);
        body.set_rest_length_scale(1.0);
        assert_relative_eq!(body.links()[0].rest_length, rest);
    }

    #[test]
    fn test_ray_tests() {
        let body = square_cloth();
        let from = Point3::new(0.3, 0.3, 1.0);
        let to = Point3::new(0.3, 0.3, -1.0);
        let hit = body.ray_test(&from, &to).unwrap();
        assert_eq!(hit.feature, Feature::Face);
        assert_relative_eq!(hit.fraction, 0.5, epsilon = 1e-12);

        let miss = body.ray_test(&Point3::new(5.0, 5.0, 1.0), &Point3::new(5.0, 5.0, -1.0));
        assert!(miss.is_none());

        let node_hit = body
            .ray_test_nodes(&Point3::new(0.5, 0.5, 1.0), &Point3::new(0.5, 0.5, -1.0), 0.1)
            .unwrap();
        assert_eq!(node_hit.index, 4);
        assert_relative_eq!(node_hit.fraction, 0.45, epsilon = 1e-12);

        assert!(SoftBody::new("empty").ray_test(&from, &to).is_none());
    }

    #[test]
    fn test_anchor_flags() {
        let mut body = square_cloth();
        let rigid = RigidBody::fixed(Isometry3::translation(0.0, 0.0, 1.0));
        body.append_anchor_at_node(4, RigidBodyId(0), &rigid, 1.0, true).unwrap();
        assert!(body.nodes()[4].flags.contains(NodeFlags::ATTACHED));
        assert_relative_eq!(body.anchors()[0].local, Vector3::new(0.5, 0.5, -1.0));
        assert!(body.collision_disabled_with(RigidBodyId(0)));
        assert!(body.append_anchor(4, RigidBodyId(0), Vector3::zeros(), 2.0).is_err());

        body.remove_anchors_of(RigidBodyId(0));
        assert!(body.anchors().is_empty());
        assert!(!body.nodes()[4].flags.contains(NodeFlags::ATTACHED));
    }

    #[test]
    fn test_materials() {
        let mut body = square_cloth();
        let m = body.append_material();
        body.material_mut(m).unwrap().linear_stiffness = 0.5;
        assert_eq!(body.materials().len(), 2);
        assert_relative_eq!(body.material(m).unwrap().linear_stiffness, 0.5);
        assert_relative_eq!(body.material(MaterialId(0)).unwrap().linear_stiffness, 1.0);
    }
}
