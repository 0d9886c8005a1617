//! Dynamic bounding volume tree.
//!
//! Each soft body keeps three of these: one over nodes, one over faces and one
//! over clusters. Unlike a static median-split hierarchy, the tree is built by
//! incremental insertion and refitted leaf by leaf as the body moves:
//!
//! 1. A leaf is inserted next to the existing leaf whose box center is
//!    closest (Manhattan distance), and ancestors are refitted.
//! 2. On update, a leaf whose stored ("fat") box still contains the new box is
//!    left alone. Otherwise the new box is inflated by a margin plus the
//!    signed displacement expected over the next step and the leaf is
//!    reinserted.
//!
//! Leaf handles ([`LeafId`]) stay valid across updates until the leaf is
//! removed.

use nalgebra::{Point3, Vector3};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Aabb {
    /// Minimum corner of the bounding box.
    pub min: Point3<f64>,
    /// Maximum corner of the bounding box.
    pub max: Point3<f64>,
}

impl Default for Aabb {
    fn default() -> Self {
        Self {
            min: Point3::origin(),
            max: Point3::origin(),
        }
    }
}

impl Aabb {
    /// Create a new AABB from minimum and maximum corners.
    #[must_use]
    pub const fn new(min: Point3<f64>, max: Point3<f64>) -> Self {
        Self { min, max }
    }

    /// Create an AABB centered at a point with the given half-extents.
    #[must_use]
    pub fn from_center(center: Point3<f64>, half_extents: Vector3<f64>) -> Self {
        Self {
            min: center - half_extents,
            max: center + half_extents,
        }
    }

    /// Cube of half-size `radius` around `center`.
    #[must_use]
    pub fn from_center_radius(center: Point3<f64>, radius: f64) -> Self {
        Self::from_center(center, Vector3::repeat(radius))
    }

    /// Smallest box containing all `points`, `None` for an empty iterator.
    #[must_use]
    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a Point3<f64>>) -> Option<Self> {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        let mut aabb = Self::new(*first, *first);
        for p in iter {
            aabb.min = aabb.min.inf(p);
            aabb.max = aabb.max.sup(p);
        }
        Some(aabb)
    }

    /// Check if this AABB overlaps with another AABB.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }

    /// Check whether `other` lies entirely inside this box.
    #[must_use]
    pub fn contains(&self, other: &Self) -> bool {
        self.min.x <= other.min.x
            && self.min.y <= other.min.y
            && self.min.z <= other.min.z
            && self.max.x >= other.max.x
            && self.max.y >= other.max.y
            && self.max.z >= other.max.z
    }

    /// Expand this AABB by a margin on all sides.
    #[must_use]
    pub fn expanded(&self, margin: f64) -> Self {
        let m = Vector3::repeat(margin);
        Self {
            min: self.min - m,
            max: self.max + m,
        }
    }

    /// Grow the box only in the direction of `delta`.
    #[must_use]
    pub fn signed_expanded(&self, delta: &Vector3<f64>) -> Self {
        let mut out = *self;
        for i in 0..3 {
            if delta[i] > 0.0 {
                out.max[i] += delta[i];
            } else {
                out.min[i] += delta[i];
            }
        }
        out
    }

    /// Smallest box containing both boxes.
    #[must_use]
    pub fn merged(&self, other: &Self) -> Self {
        Self {
            min: self.min.inf(&other.min),
            max: self.max.sup(&other.max),
        }
    }

    /// Center of the box.
    #[must_use]
    pub fn center(&self) -> Point3<f64> {
        nalgebra::center(&self.min, &self.max)
    }

    /// Manhattan distance between box centers (scaled by 2).
    #[must_use]
    pub fn proximity(&self, other: &Self) -> f64 {
        let d = (self.min.coords + self.max.coords) - (other.min.coords + other.max.coords);
        d.x.abs() + d.y.abs() + d.z.abs()
    }

    /// Entry fraction of segment `origin + t * dir` into the box, if it enters
    /// before `max_fraction`.
    #[must_use]
    pub fn ray_entry(
        &self,
        origin: &Point3<f64>,
        dir_inv: &Vector3<f64>,
        max_fraction: f64,
    ) -> Option<f64> {
        let t1 = (self.min - origin).component_mul(dir_inv);
        let t2 = (self.max - origin).component_mul(dir_inv);
        let tmin = t1.x.min(t2.x).max(t1.y.min(t2.y)).max(t1.z.min(t2.z));
        let tmax = t1.x.max(t2.x).min(t1.y.max(t2.y)).min(t1.z.max(t2.z));

        // 0 * inf when the origin sits on a slab with zero direction
        if tmin.is_nan() || tmax.is_nan() {
            return None;
        }
        (tmax >= tmin && tmin < max_fraction && tmax >= 0.0).then(|| tmin.max(0.0))
    }
}

/// Handle to a leaf of a [`Dbvt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LeafId(usize);

#[derive(Debug, Clone, Copy)]
enum DbvtNodeKind {
    Leaf(usize),
    Internal([usize; 2]),
    Free,
}

#[derive(Debug, Clone, Copy)]
struct DbvtNode {
    volume: Aabb,
    parent: Option<usize>,
    kind: DbvtNodeKind,
}

/// Dynamic AABB tree storing a `usize` payload per leaf.
#[derive(Debug, Clone, Default)]
pub struct Dbvt {
    nodes: Vec<DbvtNode>,
    free: Vec<usize>,
    root: Option<usize>,
    leaves: usize,
}

impl Dbvt {
    /// Create an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of leaves.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.leaves
    }

    /// Whether the tree has no leaves.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.leaves == 0
    }

    /// Remove every leaf. Outstanding [`LeafId`]s become invalid.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.root = None;
        self.leaves = 0;
    }

    /// Bounding box of the whole tree.
    #[must_use]
    pub fn root_volume(&self) -> Option<Aabb> {
        self.root.map(|r| self.nodes[r].volume)
    }

    /// Stored (possibly inflated) box of a leaf.
    #[must_use]
    pub fn volume(&self, leaf: LeafId) -> Option<Aabb> {
        self.nodes
            .get(leaf.0)
            .filter(|n| matches!(n.kind, DbvtNodeKind::Leaf(_)))
            .map(|n| n.volume)
    }

    /// Payload stored in a leaf.
    #[must_use]
    pub fn data(&self, leaf: LeafId) -> Option<usize> {
        match self.nodes.get(leaf.0)?.kind {
            DbvtNodeKind::Leaf(data) => Some(data),
            _ => None,
        }
    }

    /// Overwrite the payload of a leaf.
    pub fn set_data(&mut self, leaf: LeafId, data: usize) {
        if let Some(node) = self.nodes.get_mut(leaf.0) {
            if matches!(node.kind, DbvtNodeKind::Leaf(_)) {
                node.kind = DbvtNodeKind::Leaf(data);
            }
        }
    }

    /// Insert a leaf.
    pub fn insert(&mut self, volume: Aabb, data: usize) -> LeafId {
        let id = self.alloc(DbvtNode {
            volume,
            parent: None,
            kind: DbvtNodeKind::Leaf(data),
        });
        self.attach(id);
        self.leaves += 1;
        LeafId(id)
    }

    /// Remove a leaf. Unknown handles are ignored.
    pub fn remove(&mut self, leaf: LeafId) {
        if self.data(leaf).is_none() {
            return;
        }
        self.detach(leaf.0);
        self.nodes[leaf.0].kind = DbvtNodeKind::Free;
        self.free.push(leaf.0);
        self.leaves -= 1;
    }

    /// Replace a leaf's box and reinsert it.
    pub fn update(&mut self, leaf: LeafId, volume: Aabb) {
        if self.data(leaf).is_none() {
            return;
        }
        self.detach(leaf.0);
        self.nodes[leaf.0].volume = volume;
        self.attach(leaf.0);
    }

    /// Refit a leaf only if `volume` escaped its stored box.
    ///
    /// The stored box is inflated by `margin` on all sides and by `velocity`
    /// in its direction of travel. Returns whether the leaf was reinserted.
    pub fn update_with_margin(
        &mut self,
        leaf: LeafId,
        volume: Aabb,
        velocity: &Vector3<f64>,
        margin: f64,
    ) -> bool {
        match self.volume(leaf) {
            Some(current) if current.contains(&volume) => false,
            Some(_) => {
                self.update(leaf, volume.expanded(margin).signed_expanded(velocity));
                true
            }
            None => false,
        }
    }

    /// Visit every leaf whose box overlaps `volume`.
    pub fn collide_volume<F: FnMut(usize)>(&self, volume: &Aabb, mut callback: F) {
        let Some(root) = self.root else {
            return;
        };
        let mut stack = Vec::with_capacity(64);
        stack.push(root);
        while let Some(i) = stack.pop() {
            let node = &self.nodes[i];
            if !node.volume.overlaps(volume) {
                continue;
            }
            match node.kind {
                DbvtNodeKind::Leaf(data) => callback(data),
                DbvtNodeKind::Internal([a, b]) => {
                    stack.push(a);
                    stack.push(b);
                }
                DbvtNodeKind::Free => {}
            }
        }
    }

    /// Visit every pair of overlapping leaves between `self` and `other`.
    ///
    /// When both arguments are the same tree every unordered pair is reported
    /// twice and every leaf is paired with itself; callers filter.
    pub fn collide_tree<F: FnMut(usize, usize)>(&self, other: &Self, mut callback: F) {
        let (Some(ra), Some(rb)) = (self.root, other.root) else {
            return;
        };
        let mut stack = Vec::with_capacity(128);
        stack.push((ra, rb));
        while let Some((a, b)) = stack.pop() {
            let na = &self.nodes[a];
            let nb = &other.nodes[b];
            if !na.volume.overlaps(&nb.volume) {
                continue;
            }
            match (na.kind, nb.kind) {
                (DbvtNodeKind::Leaf(da), DbvtNodeKind::Leaf(db)) => callback(da, db),
                (DbvtNodeKind::Internal([a0, a1]), DbvtNodeKind::Leaf(_)) => {
                    stack.push((a0, b));
                    stack.push((a1, b));
                }
                (DbvtNodeKind::Leaf(_), DbvtNodeKind::Internal([b0, b1])) => {
                    stack.push((a, b0));
                    stack.push((a, b1));
                }
                (DbvtNodeKind::Internal([a0, a1]), DbvtNodeKind::Internal([b0, b1])) => {
                    stack.push((a0, b0));
                    stack.push((a0, b1));
                    stack.push((a1, b0));
                    stack.push((a1, b1));
                }
                _ => {}
            }
        }
    }

    /// Nearest hit of segment `from -> to` against the leaves.
    ///
    /// `test` receives a leaf payload and the current best fraction and
    /// returns the exact hit fraction for that primitive, if any. Subtrees
    /// whose boxes are entered beyond the best fraction are pruned. An empty
    /// tree reports no hit.
    pub fn ray_cast<F>(&self, from: &Point3<f64>, to: &Point3<f64>, mut test: F) -> Option<(usize, f64)>
    where
        F: FnMut(usize, f64) -> Option<f64>,
    {
        let root = self.root?;
        let dir = to - from;
        let dir_inv = dir.map(|d| 1.0 / d);
        let mut best: Option<(usize, f64)> = None;
        let mut cutoff = 1.0;

        let mut stack = Vec::with_capacity(64);
        stack.push(root);
        while let Some(i) = stack.pop() {
            let node = &self.nodes[i];
            if node.volume.ray_entry(from, &dir_inv, cutoff).is_none() {
                continue;
            }
            match node.kind {
                DbvtNodeKind::Leaf(data) => {
                    if let Some(t) = test(data, cutoff) {
                        if t < cutoff {
                            cutoff = t;
                            best = Some((data, t));
                        }
                    }
                }
                DbvtNodeKind::Internal([a, b]) => {
                    stack.push(a);
                    stack.push(b);
                }
                DbvtNodeKind::Free => {}
            }
        }
        best
    }

    fn alloc(&mut self, node: DbvtNode) -> usize {
        if let Some(i) = self.free.pop() {
            self.nodes[i] = node;
            i
        } else {
            self.nodes.push(node);
            self.nodes.len() - 1
        }
    }

    fn release(&mut self, i: usize) {
        self.nodes[i].kind = DbvtNodeKind::Free;
        self.nodes[i].parent = None;
        self.free.push(i);
    }

    /// Link an allocated leaf node into the hierarchy.
    fn attach(&mut self, leaf: usize) {
        let Some(root) = self.root else {
            self.nodes[leaf].parent = None;
            self.root = Some(leaf);
            return;
        };

        let volume = self.nodes[leaf].volume;
        let mut sibling = root;
        while let DbvtNodeKind::Internal([a, b]) = self.nodes[sibling].kind {
            let da = volume.proximity(&self.nodes[a].volume);
            let db = volume.proximity(&self.nodes[b].volume);
            sibling = if da <= db { a } else { b };
        }

        let old_parent = self.nodes[sibling].parent;
        let branch = self.alloc(DbvtNode {
            volume: volume.merged(&self.nodes[sibling].volume),
            parent: old_parent,
            kind: DbvtNodeKind::Internal([sibling, leaf]),
        });
        self.nodes[sibling].parent = Some(branch);
        self.nodes[leaf].parent = Some(branch);

        match old_parent {
            Some(p) => {
                self.replace_child(p, sibling, branch);
                self.refit(p);
            }
            None => self.root = Some(branch),
        }
    }

    /// Unlink a leaf node from the hierarchy without freeing it.
    fn detach(&mut self, leaf: usize) {
        if self.root == Some(leaf) {
            self.root = None;
            self.nodes[leaf].parent = None;
            return;
        }
        let Some(parent) = self.nodes[leaf].parent else {
            return;
        };
        let sibling = match self.nodes[parent].kind {
            DbvtNodeKind::Internal([a, b]) => {
                if a == leaf {
                    b
                } else {
                    a
                }
            }
            _ => return,
        };
        let grand = self.nodes[parent].parent;
        self.nodes[sibling].parent = grand;
        match grand {
            Some(g) => {
                self.replace_child(g, parent, sibling);
                self.refit(g);
            }
            None => self.root = Some(sibling),
        }
        self.release(parent);
        self.nodes[leaf].parent = None;
    }

    fn replace_child(&mut self, parent: usize, old: usize, new: usize) {
        if let DbvtNodeKind::Internal(children) = &mut self.nodes[parent].kind {
            for c in children.iter_mut() {
                if *c == old {
                    *c = new;
                }
            }
        }
    }

    fn refit(&mut self, from: usize) {
        let mut cursor = Some(from);
        while let Some(i) = cursor {
            if let DbvtNodeKind::Internal([a, b]) = self.nodes[i].kind {
                self.nodes[i].volume = self.nodes[a].volume.merged(&self.nodes[b].volume);
            }
            cursor = self.nodes[i].parent;
        }
    }
}
