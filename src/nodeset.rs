//! Grouped, identity-tracked collections of nodes.
//!
//! A [`NodeSet`] is an ordered list of [`NodeId`]s into a shared
//! [`NodeArena`] plus a group id. Copying a set copies ids, never node state:
//! status written through one set is visible through every other set that
//! references the same node.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::node::{NodeArena, NodeId, NodeRef};

static NEXT_GROUP_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a process-wide unique group id.
pub fn next_group_id() -> u64 {
    NEXT_GROUP_ID.fetch_add(1, Ordering::Relaxed)
}

/// An ordered set of nodes with a group identifier.
///
/// All sets combined with each other must share the same arena.
#[derive(Clone)]
pub struct NodeSet {
    id: u64,
    members: Vec<NodeId>,
    arena: Arc<NodeArena>,
}

impl NodeSet {
    /// Creates an empty set with a fresh group id.
    pub fn new(arena: Arc<NodeArena>) -> Self {
        Self {
            id: next_group_id(),
            members: Vec::new(),
            arena,
        }
    }

    /// Creates a set holding every node of the arena.
    pub fn all(arena: Arc<NodeArena>) -> Self {
        let members = arena.ids().collect();
        Self {
            id: next_group_id(),
            members,
            arena,
        }
    }

    /// Creates a set from ids, dropping duplicates and ids foreign to the arena.
    pub fn from_ids(arena: Arc<NodeArena>, ids: impl IntoIterator<Item = NodeId>) -> Self {
        let mut set = Self::new(arena);
        for id in ids {
            set.push(id);
        }
        set
    }

    /// Creates a set from hostnames, ignoring names unknown to the arena.
    pub fn from_hostnames<'h>(
        arena: Arc<NodeArena>,
        hostnames: impl IntoIterator<Item = &'h str>,
    ) -> Self {
        let ids: Vec<NodeId> = hostnames
            .into_iter()
            .filter_map(|h| arena.lookup(h))
            .collect();
        Self::from_ids(arena, ids)
    }

    /// Creates an empty set over the same arena with a fresh group id.
    pub fn empty_like(&self) -> Self {
        Self::new(Arc::clone(&self.arena))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Replaces the group id.
    pub(crate) fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    pub fn arena(&self) -> &Arc<NodeArena> {
        &self.arena
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Appends a node; returns false when it was already present.
    pub fn push(&mut self, id: NodeId) -> bool {
        if self.arena.get(id).is_none() || self.members.contains(&id) {
            return false;
        }
        self.members.push(id);
        true
    }

    /// Removes a node; returns false when it was absent.
    pub fn remove(&mut self, id: NodeId) -> bool {
        match self.members.iter().position(|m| *m == id) {
            Some(pos) => {
                self.members.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.members.contains(&id)
    }

    /// Membership test by hostname.
    pub fn contains_hostname(&self, hostname: &str) -> bool {
        self.arena
            .lookup(hostname)
            .is_some_and(|id| self.contains(id))
    }

    /// Returns the member with the given hostname.
    pub fn get(&self, hostname: &str) -> Option<NodeRef<'_>> {
        let id = self.arena.lookup(hostname)?;
        if self.contains(id) {
            self.arena.get(id)
        } else {
            None
        }
    }

    /// Nodes of `self` absent from `other`, as a new set.
    pub fn diff(&self, other: &NodeSet) -> NodeSet {
        debug_assert!(Arc::ptr_eq(&self.arena, &other.arena));
        let exclude: HashSet<NodeId> = other.members.iter().copied().collect();
        self.filtered(|id| !exclude.contains(&id))
    }

    /// Nodes present in both sets, in `self`'s order, as a new set.
    pub fn intersect(&self, other: &NodeSet) -> NodeSet {
        debug_assert!(Arc::ptr_eq(&self.arena, &other.arena));
        let keep: HashSet<NodeId> = other.members.iter().copied().collect();
        self.filtered(|id| keep.contains(&id))
    }

    /// Appends `self`'s nodes into `dest` without removing them from `self`.
    pub fn linked_copy(&self, dest: &mut NodeSet) {
        dest.add(self);
    }

    /// Appends `self`'s nodes into `dest`, then empties `self`.
    pub fn move_to(&mut self, dest: &mut NodeSet) {
        dest.add(self);
        self.clean();
    }

    /// Absorbs the nodes of `other`.
    pub fn add(&mut self, other: &NodeSet) {
        debug_assert!(Arc::ptr_eq(&self.arena, &other.arena));
        let present: HashSet<NodeId> = self.members.iter().copied().collect();
        self.members.extend(
            other
                .members
                .iter()
                .copied()
                .filter(|id| !present.contains(id)),
        );
    }

    /// Drops every node of `other` from `self`.
    pub fn remove_all(&mut self, other: &NodeSet) {
        let exclude: HashSet<NodeId> = other.members.iter().copied().collect();
        self.members.retain(|id| !exclude.contains(id));
    }

    /// Same membership regardless of order.
    pub fn same_members(&self, other: &NodeSet) -> bool {
        if self.len() != other.len() {
            return false;
        }
        let mine: HashSet<NodeId> = self.members.iter().copied().collect();
        other.members.iter().all(|id| mine.contains(id))
    }

    /// Returns true if no node belongs to both sets.
    pub fn is_disjoint(&self, other: &NodeSet) -> bool {
        let mine: HashSet<NodeId> = self.members.iter().copied().collect();
        !other.members.iter().any(|id| mine.contains(id))
    }

    /// Partitions the set into one set per cluster tag.
    pub fn group_by_cluster(&self) -> BTreeMap<String, NodeSet> {
        let mut groups: BTreeMap<String, NodeSet> = BTreeMap::new();
        for node in self.iter() {
            groups
                .entry(node.cluster().to_string())
                .or_insert_with(|| self.empty_like())
                .members
                .push(node.id());
        }
        groups
    }

    /// Empties the set without touching the referenced nodes.
    pub fn clean(&mut self) {
        self.members.clear();
    }

    pub fn ids(&self) -> &[NodeId] {
        &self.members
    }

    pub fn iter(&self) -> impl Iterator<Item = NodeRef<'_>> {
        self.members.iter().filter_map(|id| self.arena.get(*id))
    }

    pub fn hostnames(&self) -> Vec<String> {
        self.iter().map(|n| n.hostname().to_string()).collect()
    }

    /// Sets the lifecycle tag of every member.
    pub fn set_state(&self, tag: &str) {
        for node in self.iter() {
            node.set_state(tag);
        }
    }

    /// Records the same failure message on every member.
    pub fn record_error(&self, message: &str) {
        for node in self.iter() {
            node.record_error(message);
        }
    }

    fn filtered(&self, keep: impl Fn(NodeId) -> bool) -> NodeSet {
        NodeSet {
            id: next_group_id(),
            members: self.members.iter().copied().filter(|id| keep(*id)).collect(),
            arena: Arc::clone(&self.arena),
        }
    }
}

impl fmt::Display for NodeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.hostnames().join(", "))
    }
}

impl fmt::Debug for NodeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSet")
            .field("id", &self.id)
            .field("nodes", &self.hostnames())
            .finish()
    }
}
