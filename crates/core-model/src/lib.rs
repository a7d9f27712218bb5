//! The dependency graph's data model: nodes, handles, and the arena that owns them.
//!
//! The original engine represents nodes as a graph of raw, manually freed
//! pointers (`GNode *`). Here the graph is a single arena (`Graph`) of
//! `Node` values addressed by a stable `Handle`; every cross-reference is a
//! handle, never a borrow, so the graph can be mutated breadth-first without
//! fighting the borrow checker.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::SystemTime;

use bitflags::bitflags;

pub mod search;
pub use search::{SearchPath, SearchPaths};

/// A stable reference to a node inside a [`Graph`]. Cheap to copy, never
/// invalidated: nodes are never removed from the arena during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(u32);

impl Handle {
    fn index(self) -> usize {
        self.0 as usize
    }

    /// Raw numeric form, used to key `core-vars`' per-node local scope
    /// (`NodeId`) without that crate depending back on `core-model`.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

bitflags! {
    /// Kind bits: the operator class (mutually exclusive, see [`Kind::OPERATOR_MASK`])
    /// plus the orthogonal attribute bits from a dependency line or special target.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Kind: u64 {
        // Operator class - set at most once per node.
        const DEPENDS      = 1 << 0; // `:`
        const FORCE        = 1 << 1; // `!`
        const DOUBLEDEP    = 1 << 2; // `::`

        // Attributes.
        const OPTIONAL     = 1 << 3;
        const USE          = 1 << 4;
        const USEBEFORE    = 1 << 5;
        const EXEC         = 1 << 6;
        const IGNORE       = 1 << 7;
        const PRECIOUS     = 1 << 8;
        const SILENT       = 1 << 9;
        const MAKE         = 1 << 10;
        const JOIN         = 1 << 11;
        const MADE_ATTR    = 1 << 12;
        const SPECIAL      = 1 << 13;
        const INVISIBLE    = 1 << 14;
        const NOTMAIN      = 1 << 15;
        const PHONY        = 1 << 16;
        const NOPATH       = 1 << 17;
        const WAIT         = 1 << 18;
        const NOMETA       = 1 << 19;
        const META         = 1 << 20;
        const NOMETA_CMP   = 1 << 21;
        const SUBMAKE      = 1 << 22;
        const TRANSFORM    = 1 << 23;
        const MEMBER       = 1 << 24;
        const LIB          = 1 << 25;
        const ARCHV        = 1 << 26;
        const HAS_COMMANDS = 1 << 27;
        const SAVE_CMDS    = 1 << 28;
        const DEPS_FOUND   = 1 << 29;
        const MARK         = 1 << 30;
    }
}

impl Kind {
    /// The three mutually-exclusive operator bits.
    pub const OPERATOR_MASK: Kind = Kind::DEPENDS.union(Kind::FORCE).union(Kind::DOUBLEDEP);

    /// The operator class currently set, if any.
    pub fn operator(self) -> Kind {
        self & Kind::OPERATOR_MASK
    }

    /// Bits that are copied onto a cohort / `.USE` expansion target: everything
    /// except the operator class (the target's own operator always wins).
    pub fn propagated(self) -> Kind {
        self - Kind::OPERATOR_MASK
    }
}

bitflags! {
    /// Transient, run-scoped state bits (as opposed to the declarative [`Kind`] bits).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StateBits: u32 {
        const REMAKE       = 1 << 0;
        const CHILDMADE    = 1 << 1;
        const FORCE_FLAG   = 1 << 2;
        const DONE_WAIT    = 1 << 3;
        const DONE_ORDER   = 1 << 4;
        const FROM_DEPEND  = 1 << 5;
        const DONE_ALLSRC  = 1 << 6;
        const CYCLE        = 1 << 7;
        const DONECYCLE    = 1 << 8;
        const INTERNAL     = 1 << 9;
        /// Ambient addition (§4.11 of the expanded spec): guards against
        /// reporting the same node's error more than once.
        const REPORTED     = 1 << 10;
    }
}

/// Total order over a node's build progress, per the expanded spec's §3 data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MadeStatus {
    Unmade,
    Deferred,
    Requested,
    BeingMade,
    Made,
    UpToDate,
    Error,
    Aborted,
}

impl Default for MadeStatus {
    fn default() -> Self {
        MadeStatus::Unmade
    }
}

impl MadeStatus {
    /// True once a node has reached a build-complete state (as opposed to
    /// merely being in flight).
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            MadeStatus::Made | MadeStatus::UpToDate | MadeStatus::Error | MadeStatus::Aborted
        )
    }
}

/// Where a cohort's parent links live: on a `Regular` node directly, or on a
/// `Cohort`'s centurion. Kept as an explicit sum type rather than inheritance,
/// per the expanded spec's design notes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Regular,
    Cohort { centurion: Handle },
}

/// Source-file provenance: where a node was first defined.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Provenance {
    pub file: String,
    pub line: u32,
}

/// A vertex in the dependency graph.
#[derive(Debug, Clone)]
pub struct Node {
    /// Name used to address this node in the graph's index. Cohorts get a
    /// synthetic `name#NNN` here for diagnostics; they are never inserted
    /// into the index itself.
    pub name: String,
    /// The literal, pre-expansion name this node was first declared under.
    /// Immutable once set (see the expanded spec's resolved Open Question).
    pub uname: String,
    pub role: NodeRole,
    pub kind: Kind,
    pub state: StateBits,
    pub made: MadeStatus,

    pub children: Vec<Handle>,
    pub parents: Vec<Handle>,
    pub implicit_parents: Vec<Handle>,
    pub order_pred: Vec<Handle>,
    pub order_succ: Vec<Handle>,

    /// Only meaningful when `role == Regular` and `kind.contains(Kind::DOUBLEDEP)`.
    pub cohorts: Vec<Handle>,
    pub unmade_cohorts: usize,
    next_cohort_seq: u32,

    pub mtime: Option<SystemTime>,
    /// The child with the greatest `mtime` seen so far.
    pub cmgn: Option<Handle>,
    pub path: Option<PathBuf>,
    pub commands: Vec<String>,

    /// Count of `children` whose `made < MADE`.
    pub unmade: usize,

    pub provenance: Provenance,

    /// Scheduler re-entry epoch (§4.8): the epoch this node was last visited in.
    pub checked: u64,
}

impl Node {
    fn new(name: String, role: NodeRole) -> Self {
        let uname = name.clone();
        Node {
            name,
            uname,
            role,
            kind: Kind::empty(),
            state: StateBits::empty(),
            made: MadeStatus::default(),
            children: Vec::new(),
            parents: Vec::new(),
            implicit_parents: Vec::new(),
            order_pred: Vec::new(),
            order_succ: Vec::new(),
            cohorts: Vec::new(),
            unmade_cohorts: 0,
            next_cohort_seq: 0,
            mtime: None,
            cmgn: None,
            path: None,
            commands: Vec::new(),
            unmade: 0,
            provenance: Provenance::default(),
            checked: 0,
        }
    }

    pub fn is_cohort(&self) -> bool {
        matches!(self.role, NodeRole::Cohort { .. })
    }

    pub fn centurion(&self) -> Option<Handle> {
        match self.role {
            NodeRole::Cohort { centurion } => Some(centurion),
            NodeRole::Regular => None,
        }
    }
}

/// Owns every [`Node`] allocated during a run and the name→handle index.
#[derive(Debug, Default)]
pub struct Graph {
    arena: Vec<Node>,
    index: HashMap<String, Handle>,
    main: Option<Handle>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find-or-create a node addressable by `name`.
    pub fn get(&mut self, name: &str) -> Handle {
        if let Some(h) = self.index.get(name) {
            return *h;
        }
        let handle = self.push(Node::new(name.to_string(), NodeRole::Regular));
        self.index.insert(name.to_string(), handle);
        handle
    }

    /// Find only; does not create.
    pub fn find(&self, name: &str) -> Option<Handle> {
        self.index.get(name).copied()
    }

    /// Allocate a node that is not addressable by name (cohorts, synthetic
    /// `.WAIT` barriers, the synthetic `.MAIN` parent).
    pub fn new_internal(&mut self, name_hint: &str) -> Handle {
        let mut node = Node::new(name_hint.to_string(), NodeRole::Regular);
        node.state |= StateBits::INTERNAL;
        self.push(node)
    }

    fn push(&mut self, node: Node) -> Handle {
        let handle = Handle(self.arena.len() as u32);
        self.arena.push(node);
        handle
    }

    pub fn node(&self, handle: Handle) -> &Node {
        &self.arena[handle.index()]
    }

    pub fn node_mut(&mut self, handle: Handle) -> &mut Node {
        &mut self.arena[handle.index()]
    }

    pub fn set_main(&mut self, handle: Handle) {
        self.main = Some(handle);
    }

    pub fn main(&self) -> Option<Handle> {
        self.main
    }

    /// All nodes addressable by name, in index-insertion (declaration) order.
    pub fn targets(&self) -> Vec<Handle> {
        let mut pairs: Vec<(&String, &Handle)> = self.index.iter().collect();
        pairs.sort_by_key(|(_, h)| h.0);
        pairs.into_iter().map(|(_, h)| *h).collect()
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    /// Add the edge `parent -> child`, maintaining the reciprocal `parents`
    /// link unless `parent` is a special target that should not be notified
    /// (§3 invariants).
    pub fn add_edge(&mut self, parent: Handle, child: Handle) {
        self.node_mut(parent).children.push(child);
        if !self.node(parent).kind.contains(Kind::SPECIAL) {
            self.node_mut(child).parents.push(parent);
        }
    }

    /// Remove the edge `parent -> child` (and its reciprocal `parents` link),
    /// used when a `.USE`/`.USEBEFORE` template has just been consumed (§4.6
    /// item 5) and should no longer appear as a prerequisite of `parent`.
    pub fn remove_child(&mut self, parent: Handle, child: Handle) {
        self.node_mut(parent).children.retain(|c| *c != child);
        self.node_mut(child).parents.retain(|p| *p != parent);
    }

    pub fn add_order_edge(&mut self, pred: Handle, succ: Handle) {
        self.node_mut(pred).order_succ.push(succ);
        self.node_mut(succ).order_pred.push(pred);
    }

    /// Recompute `unmade` for `handle` from its current `children` list.
    pub fn recompute_unmade(&mut self, handle: Handle) {
        let count = self
            .node(handle)
            .children
            .iter()
            .filter(|c| self.node(**c).made < MadeStatus::Made)
            .count();
        self.node_mut(handle).unmade = count;
    }

    /// Create a cohort for a `::` reaffirmation of `centurion` (§4.4).
    ///
    /// Copies `centurion`'s propagated (non-operator) kind bits, then sets
    /// the cohort's own operator to `::` and marks it invisible, links the
    /// `centurion` back-reference, and appends it to `centurion.cohorts`.
    pub fn make_cohort(&mut self, centurion: Handle) -> Handle {
        let seq = {
            let n = self.node_mut(centurion);
            n.next_cohort_seq += 1;
            n.next_cohort_seq
        };
        let name = format!("{}#{:03}", self.node(centurion).name, seq);
        let propagated = self.node(centurion).kind.propagated();

        let mut cohort = Node::new(name, NodeRole::Cohort { centurion });
        cohort.kind = propagated | Kind::DOUBLEDEP | Kind::INVISIBLE;
        cohort.provenance = self.node(centurion).provenance.clone();
        let handle = self.push(cohort);

        let c = self.node_mut(centurion);
        c.kind |= Kind::DOUBLEDEP;
        c.cohorts.push(handle);
        c.unmade_cohorts += 1;
        handle
    }

    /// The node actually holding parent links for `handle`: itself if
    /// `Regular`, or its centurion if `Cohort`.
    pub fn centurion_of(&self, handle: Handle) -> Handle {
        match self.node(handle).role {
            NodeRole::Regular => handle,
            NodeRole::Cohort { centurion } => centurion,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_is_find_or_create() {
        let mut g = Graph::new();
        let a = g.get("a");
        let a2 = g.get("a");
        assert_eq!(a, a2);
        assert_eq!(g.node(a).name, "a");
    }

    #[test]
    fn new_internal_is_not_addressable() {
        let mut g = Graph::new();
        let h = g.new_internal(".WAIT");
        assert!(g.find(".WAIT").is_none());
        assert!(g.node(h).state.contains(StateBits::INTERNAL));
    }

    #[test]
    fn add_edge_maintains_reciprocal_parent_link() {
        let mut g = Graph::new();
        let parent = g.get("all");
        let child = g.get("foo");
        g.add_edge(parent, child);
        assert_eq!(g.node(parent).children, vec![child]);
        assert_eq!(g.node(child).parents, vec![parent]);
    }

    #[test]
    fn special_parent_skips_reciprocal_parent_link() {
        let mut g = Graph::new();
        let parent = g.get(".BEGIN");
        g.node_mut(parent).kind |= Kind::SPECIAL;
        let child = g.get("x");
        g.add_edge(parent, child);
        assert_eq!(g.node(parent).children, vec![child]);
        assert!(g.node(child).parents.is_empty());
    }

    #[test]
    fn cohort_inherits_propagated_bits_but_not_operator() {
        let mut g = Graph::new();
        let x = g.get("x");
        g.node_mut(x).kind |= Kind::DEPENDS | Kind::SILENT | Kind::PRECIOUS;
        let c1 = g.make_cohort(x);
        assert_eq!(g.node(c1).name, "x#001");
        assert!(g.node(c1).kind.contains(Kind::DOUBLEDEP));
        assert!(g.node(c1).kind.contains(Kind::INVISIBLE));
        assert!(g.node(c1).kind.contains(Kind::SILENT));
        assert!(g.node(c1).kind.contains(Kind::PRECIOUS));
        assert!(!g.node(c1).kind.contains(Kind::DEPENDS));
        assert_eq!(g.node(x).unmade_cohorts, 1);
        assert_eq!(g.node(x).cohorts, vec![c1]);

        let c2 = g.make_cohort(x);
        assert_eq!(g.node(c2).name, "x#002");
        assert_eq!(g.node(x).unmade_cohorts, 2);
    }

    #[test]
    fn recompute_unmade_counts_unfinished_children() {
        let mut g = Graph::new();
        let parent = g.get("all");
        let a = g.get("a");
        let b = g.get("b");
        g.add_edge(parent, a);
        g.add_edge(parent, b);
        g.node_mut(a).made = MadeStatus::Made;
        g.recompute_unmade(parent);
        assert_eq!(g.node(parent).unmade, 1);
    }

    #[test]
    fn made_status_is_totally_ordered() {
        assert!(MadeStatus::Unmade < MadeStatus::Deferred);
        assert!(MadeStatus::Deferred < MadeStatus::Requested);
        assert!(MadeStatus::Requested < MadeStatus::BeingMade);
        assert!(MadeStatus::BeingMade < MadeStatus::Made);
        assert!(MadeStatus::Made < MadeStatus::UpToDate);
        assert!(MadeStatus::UpToDate < MadeStatus::Error);
        assert!(MadeStatus::Error < MadeStatus::Aborted);
    }
}
