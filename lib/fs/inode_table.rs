//! Stable inode numbering for remote nodes.
//!
//! [`InodeTable`] keeps a bijection between inode numbers and node ids using two
//! [`scc::HashMap`]s guarded by a coordination lock for cross-map atomicity. Numbers come from a
//! monotonic counter, so a retired inode is never handed out again during the session.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use rm_cloud::NodeId;

use super::{InodeAddr, ROOT_INODE, TRASH_INODE};

/// First number handed out to a regular node. Everything below is reserved.
pub const FIRST_DYNAMIC_INODE: InodeAddr = 4;

/// Bidirectional mapping between inode numbers and node ids.
///
/// Reads are lock-free. Mutations that touch both maps are serialized by a `Mutex<()>` so a
/// concurrent `retire` between the two inserts of `allocate` cannot leave half a mapping behind.
pub struct InodeTable {
    /// inode -> node id
    fwd: scc::HashMap<InodeAddr, NodeId>,
    /// node id -> inode
    bwd: scc::HashMap<NodeId, InodeAddr>,
    next: AtomicU64,
    /// Serializes mutations that touch both maps.
    mu: Mutex<()>,
}

impl InodeTable {
    /// Creates a table holding only the root and trash entries.
    #[must_use]
    pub fn new() -> Self {
        let table = Self {
            fwd: scc::HashMap::new(),
            bwd: scc::HashMap::new(),
            next: AtomicU64::new(FIRST_DYNAMIC_INODE),
            mu: Mutex::new(()),
        };
        for (addr, id) in [(ROOT_INODE, NodeId::root()), (TRASH_INODE, NodeId::trash())] {
            let _ = table.fwd.insert_sync(addr, id.clone());
            let _ = table.bwd.insert_sync(id, addr);
        }
        table
    }

    /// The inode of `id`, allocating the next unused number if it has none.
    #[must_use]
    pub fn allocate(&self, id: &NodeId) -> InodeAddr {
        if let Some(addr) = self.resolve_id(id) {
            return addr;
        }
        let _guard = self
            .mu
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match self.bwd.entry_sync(id.clone()) {
            scc::hash_map::Entry::Occupied(occ) => *occ.get(),
            scc::hash_map::Entry::Vacant(vac) => {
                let addr = self.next.fetch_add(1, Ordering::Relaxed);
                vac.insert_entry(addr);
                let _ = self.fwd.insert_sync(addr, id.clone());
                addr
            }
        }
    }

    /// The node id behind `addr`.
    #[must_use]
    pub fn resolve(&self, addr: InodeAddr) -> Option<NodeId> {
        self.fwd.read_sync(&addr, |_, id| id.clone())
    }

    /// The inode of `id`, if it has one.
    #[must_use]
    pub fn resolve_id(&self, id: &NodeId) -> Option<InodeAddr> {
        self.bwd.read_sync(id, |_, &addr| addr)
    }

    /// Drop the mapping of `id`. The freed number is never reused.
    ///
    /// Returns the retired inode. The root and trash entries cannot be retired.
    pub fn retire(&self, id: &NodeId) -> Option<InodeAddr> {
        if id.is_root() || id.is_trash() {
            return None;
        }
        let _guard = self
            .mu
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let (_, addr) = self.bwd.remove_sync(id)?;
        self.fwd.remove_sync(&addr);
        Some(addr)
    }

    /// Number of live mappings, reserved ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fwd.len()
    }

    /// Whether the table is empty. Never true in practice, the reserved entries always exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fwd.is_empty()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
