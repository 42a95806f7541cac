//! Arena storage for the machines being deployed.
//!
//! Every node of a deployment lives exactly once in a [`NodeArena`] and is
//! addressed by a stable [`NodeId`]. Node sets are plain index lists into the
//! arena, so "linked" views never alias mutable state: all of them observe the
//! same status record, which is guarded by its own mutex.

use std::collections::HashMap;
use std::fmt;

use crate::error::DeployError;
use crate::lock_unpoisoned;

/// Cluster tag used when a node does not declare one.
pub const DEFAULT_CLUSTER: &str = "default";

/// Stable index of a node inside its arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(usize);

impl NodeId {
    /// Returns the raw arena index.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Mutable per-node fields updated by steps and by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeStatus {
    /// Lifecycle tag, e.g. `deploying`, `deployed`, `deploy_failed`.
    pub state: String,
    /// Exit status of the last command run against the node.
    pub last_exit: Option<i32>,
    /// Captured stdout of the last command.
    pub stdout: String,
    /// Captured stderr of the last command.
    pub stderr: String,
    /// Last failure message recorded for the node.
    pub last_error: Option<String>,
}

#[derive(Debug)]
struct NodeEntry {
    hostname: String,
    cluster: String,
    status: std::sync::Mutex<NodeStatus>,
}

/// Owner of every node of a deployment.
#[derive(Debug, Default)]
pub struct NodeArena {
    entries: Vec<NodeEntry>,
    by_hostname: HashMap<String, NodeId>,
}

impl NodeArena {
    /// Creates an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds an arena from `(hostname, cluster)` pairs.
    ///
    /// Hostnames are the identity key, so empty or repeated ones are rejected.
    pub fn from_nodes<I, H, C>(nodes: I) -> Result<Self, DeployError>
    where
        I: IntoIterator<Item = (H, C)>,
        H: Into<String>,
        C: Into<String>,
    {
        let mut arena = Self::new();
        for (hostname, cluster) in nodes {
            arena.insert(hostname, cluster)?;
        }
        Ok(arena)
    }

    /// Adds a node and returns its id.
    pub fn insert(
        &mut self,
        hostname: impl Into<String>,
        cluster: impl Into<String>,
    ) -> Result<NodeId, DeployError> {
        let hostname = hostname.into();
        if hostname.trim().is_empty() {
            return Err(DeployError::Config("node hostname must not be empty".to_string()));
        }
        if self.by_hostname.contains_key(&hostname) {
            return Err(DeployError::Config(format!("duplicate node hostname: {}", hostname)));
        }
        let mut cluster = cluster.into();
        if cluster.is_empty() {
            cluster = DEFAULT_CLUSTER.to_string();
        }

        let id = NodeId(self.entries.len());
        self.by_hostname.insert(hostname.clone(), id);
        self.entries.push(NodeEntry {
            hostname,
            cluster,
            status: std::sync::Mutex::new(NodeStatus::default()),
        });
        Ok(id)
    }

    /// Number of nodes in the arena.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when the arena holds no node.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolves a hostname to its id.
    pub fn lookup(&self, hostname: &str) -> Option<NodeId> {
        self.by_hostname.get(hostname).copied()
    }

    /// Returns a handle on the node with the given id.
    pub fn get(&self, id: NodeId) -> Option<NodeRef<'_>> {
        self.entries.get(id.0).map(|entry| NodeRef { id, entry })
    }

    /// Iterates every node in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = NodeRef<'_>> {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, entry)| NodeRef { id: NodeId(i), entry })
    }

    /// Ids of every node in insertion order.
    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.entries.len()).map(NodeId)
    }
}

/// Borrowed handle on one node of an arena.
#[derive(Clone, Copy)]
pub struct NodeRef<'a> {
    id: NodeId,
    entry: &'a NodeEntry,
}

impl<'a> NodeRef<'a> {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn hostname(&self) -> &'a str {
        &self.entry.hostname
    }

    pub fn cluster(&self) -> &'a str {
        &self.entry.cluster
    }

    /// Returns a snapshot of the node's mutable fields.
    pub fn status(&self) -> NodeStatus {
        lock_unpoisoned(&self.entry.status).clone()
    }

    /// Applies `f` to the node's status under its lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut NodeStatus) -> R) -> R {
        f(&mut lock_unpoisoned(&self.entry.status))
    }

    /// Sets the lifecycle tag.
    pub fn set_state(&self, tag: impl Into<String>) {
        let tag = tag.into();
        self.update(|status| status.state = tag);
    }

    /// Records the most recent failure message.
    pub fn record_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.update(|status| status.last_error = Some(message));
    }
}

impl fmt::Debug for NodeRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRef")
            .field("id", &self.id)
            .field("hostname", &self.entry.hostname)
            .field("cluster", &self.entry.cluster)
            .finish()
    }
}
