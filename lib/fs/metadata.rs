//! Point-in-time snapshots of the remote tree.
//!
//! A [`Snapshot`] is immutable once published. Refreshes and optimistic patches build a new one
//! and swap the pointer, so readers always see a consistent tree for as long as they hold it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use rm_cloud::{CloudClient, CloudError, NodeId, RemoteNode};
use tracing::{debug, instrument, warn};

/// An immutable view of every node in the store.
#[derive(Debug, Default)]
pub struct Snapshot {
    generation: u64,
    nodes: HashMap<NodeId, RemoteNode>,
    /// Presented parent to children, each list sorted by id.
    children: HashMap<NodeId, Vec<NodeId>>,
}

impl Snapshot {
    fn build(generation: u64, nodes: HashMap<NodeId, RemoteNode>) -> Self {
        let mut children: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for node in nodes.values() {
            let parent = presented_parent(&nodes, node);
            children.entry(parent).or_default().push(node.id.clone());
        }
        for list in children.values_mut() {
            list.sort();
        }
        Self {
            generation,
            nodes,
            children,
        }
    }

    /// Monotonic counter bumped by every swap.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Look up a node by id.
    #[must_use]
    pub fn get(&self, id: &NodeId) -> Option<&RemoteNode> {
        self.nodes.get(id)
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the snapshot holds no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Children presented under `parent`. The trash id lists every trashed node.
    pub fn children(&self, parent: &NodeId) -> impl Iterator<Item = &RemoteNode> {
        self.children
            .get(parent)
            .into_iter()
            .flatten()
            .filter_map(|id| self.nodes.get(id))
    }

    /// Whether anything is presented under `parent`.
    #[must_use]
    pub fn has_children(&self, parent: &NodeId) -> bool {
        self.children.get(parent).is_some_and(|c| !c.is_empty())
    }

    /// The directory `node` is presented in.
    #[must_use]
    pub fn presented_parent(&self, node: &RemoteNode) -> NodeId {
        presented_parent(&self.nodes, node)
    }

    /// Whether `id` is `ancestor` or sits somewhere below it.
    #[must_use]
    pub fn is_within(&self, id: &NodeId, ancestor: &NodeId) -> bool {
        let mut cursor = id.clone();
        // Bounded by the node count so a malformed parent cycle cannot spin forever.
        for _ in 0..=self.nodes.len() {
            if &cursor == ancestor {
                return true;
            }
            match self.nodes.get(&cursor) {
                Some(node) => cursor = self.presented_parent(node),
                None => return false,
            }
        }
        false
    }
}

fn presented_parent(nodes: &HashMap<NodeId, RemoteNode>, node: &RemoteNode) -> NodeId {
    if node.trashed {
        return NodeId::trash();
    }
    match &node.parent_id {
        Some(parent) if parent.is_root() || parent.is_trash() => parent.clone(),
        Some(parent) if nodes.get(parent).is_some_and(RemoteNode::is_folder) => parent.clone(),
        Some(_) | None => NodeId::root(),
    }
}

/// What changed between two snapshots, by node id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDiff {
    /// Present only in the new snapshot.
    pub added: Vec<NodeId>,
    /// Present only in the old snapshot.
    pub removed: Vec<NodeId>,
    /// Parent changed without a trash transition.
    pub moved: Vec<NodeId>,
    /// Name changed.
    pub renamed: Vec<NodeId>,
    /// Became trashed.
    pub trashed: Vec<NodeId>,
    /// Left the trash.
    pub untrashed: Vec<NodeId>,
    /// Modification time changed.
    pub modified: Vec<NodeId>,
}

impl SnapshotDiff {
    /// Compare two snapshots.
    #[must_use]
    pub fn between(old: &Snapshot, new: &Snapshot) -> Self {
        let mut diff = Self::default();
        for (id, node) in &new.nodes {
            let Some(prev) = old.nodes.get(id) else {
                diff.added.push(id.clone());
                continue;
            };
            match (prev.trashed, node.trashed) {
                (false, true) => diff.trashed.push(id.clone()),
                (true, false) => diff.untrashed.push(id.clone()),
                _ if prev.parent_id != node.parent_id => diff.moved.push(id.clone()),
                _ => {}
            }
            if prev.name != node.name {
                diff.renamed.push(id.clone());
            }
            if prev.modified_at != node.modified_at {
                diff.modified.push(id.clone());
            }
        }
        diff.removed = old
            .nodes
            .keys()
            .filter(|id| !new.nodes.contains_key(*id))
            .cloned()
            .collect();
        for list in [
            &mut diff.added,
            &mut diff.removed,
            &mut diff.moved,
            &mut diff.renamed,
            &mut diff.trashed,
            &mut diff.untrashed,
            &mut diff.modified,
        ] {
            list.sort();
        }
        diff
    }

    /// Whether nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.moved.is_empty()
            && self.renamed.is_empty()
            && self.trashed.is_empty()
            && self.untrashed.is_empty()
            && self.modified.is_empty()
    }
}

/// An optimistic local edit, applied before the next refresh confirms or reverts it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Patch {
    /// Insert or replace a node.
    Upsert(RemoteNode),
    /// Drop a node.
    Remove(NodeId),
    /// Change a node's name.
    Rename {
        /// Target node.
        id: NodeId,
        /// New name, without extension.
        name: String,
    },
    /// Reparent a node, restoring it if trashed.
    Move {
        /// Target node.
        id: NodeId,
        /// New parent.
        parent: NodeId,
    },
    /// Move a node to the trash.
    Trash(NodeId),
}

impl Patch {
    fn apply(self, nodes: &mut HashMap<NodeId, RemoteNode>) {
        let now = SystemTime::now();
        match self {
            Self::Upsert(node) => {
                nodes.insert(node.id.clone(), node);
            }
            Self::Remove(id) => {
                nodes.remove(&id);
            }
            Self::Rename { id, name } => {
                if let Some(node) = nodes.get_mut(&id) {
                    node.name = name;
                    node.modified_at = now;
                }
            }
            Self::Move { id, parent } => {
                if let Some(node) = nodes.get_mut(&id) {
                    node.parent_id = Some(parent);
                    node.trashed = false;
                    node.modified_at = now;
                }
            }
            Self::Trash(id) => {
                if let Some(node) = nodes.get_mut(&id) {
                    node.parent_id = Some(NodeId::trash());
                    node.trashed = true;
                    node.modified_at = now;
                }
            }
        }
    }
}

/// Holds the current snapshot and swaps in new ones.
#[derive(Debug, Default)]
pub struct MetadataCache {
    current: RwLock<Arc<Snapshot>>,
    generation: AtomicU64,
    /// Patches tagged with the generation they published, kept until a listing taken after them
    /// is swapped in. Locking it serializes every writer.
    patches: Mutex<Vec<(u64, Patch)>>,
    /// One refresh at a time, from listing to swap.
    refresh_mu: tokio::sync::Mutex<()>,
}

impl MetadataCache {
    /// Start with an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The current snapshot. Stays valid and unchanged for as long as the caller holds it.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(
            &self
                .current
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        )
    }

    fn publish(&self, nodes: HashMap<NodeId, RemoteNode>) -> (Arc<Snapshot>, Arc<Snapshot>) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let next = Arc::new(Snapshot::build(generation, nodes));
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let prev = std::mem::replace(&mut *guard, Arc::clone(&next));
        (prev, next)
    }

    /// Replace the whole tree and report what changed. Pending optimistic patches are dropped.
    pub fn replace(&self, nodes: Vec<RemoteNode>) -> SnapshotDiff {
        self.replace_listed_at(nodes, u64::MAX)
    }

    /// Swap in a listing requested when the generation was `listed_at`. Patches published after
    /// that point may be missing from it, so they are applied again on top.
    fn replace_listed_at(&self, nodes: Vec<RemoteNode>, listed_at: u64) -> SnapshotDiff {
        let mut by_id = HashMap::with_capacity(nodes.len());
        for node in nodes {
            if node.id.is_root() || node.id.is_trash() {
                warn!(id = %node.id, "ignoring node with a reserved id");
                continue;
            }
            by_id.insert(node.id.clone(), node);
        }
        for node in by_id.values() {
            if let Some(parent) = &node.parent_id
                && !node.trashed
                && !parent.is_root()
                && !parent.is_trash()
                && !by_id.contains_key(parent)
            {
                warn!(id = %node.id, %parent, "orphaned node, presenting it under the root");
            }
        }

        let mut patches = self
            .patches
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        patches.retain(|(generation, _)| *generation > listed_at);
        for (generation, patch) in patches.iter() {
            debug!(generation, ?patch, "reapplying patch newer than the listing");
            patch.clone().apply(&mut by_id);
        }
        let (prev, next) = self.publish(by_id);
        SnapshotDiff::between(&prev, &next)
    }

    /// Fetch the full tree from `client` and swap it in.
    ///
    /// # Errors
    ///
    /// Returns the client's error; the previous snapshot stays in place.
    #[instrument(name = "MetadataCache::refresh", skip(self, client))]
    pub async fn refresh<C: CloudClient>(&self, client: &C) -> Result<SnapshotDiff, CloudError> {
        let _serial = self.refresh_mu.lock().await;
        let listed_at = self.generation.load(Ordering::Acquire);
        let nodes = client.list_nodes().await?;
        let diff = self.replace_listed_at(nodes, listed_at);
        debug!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            moved = diff.moved.len(),
            renamed = diff.renamed.len(),
            trashed = diff.trashed.len(),
            untrashed = diff.untrashed.len(),
            modified = diff.modified.len(),
            "refreshed snapshot"
        );
        Ok(diff)
    }

    /// Apply an optimistic edit on top of the current snapshot.
    pub fn apply(&self, patch: Patch) {
        let mut patches = self
            .patches
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut nodes = self.snapshot().nodes.clone();
        debug!(?patch, "applying optimistic patch");
        patch.clone().apply(&mut nodes);
        let (_, next) = self.publish(nodes);
        patches.push((next.generation(), patch));
    }
}
