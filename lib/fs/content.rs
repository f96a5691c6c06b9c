//! Materialized content, kept for the most recently opened documents.
//!
//! Slots are keyed by `(node id, mode)` and evicted least-recently-used first once the capacity is
//! exceeded. Exact sizes learned from materialization outlive their slot, so `ls` keeps reporting
//! the true size after the bytes themselves have been evicted.

use std::sync::Mutex;
use std::time::SystemTime;

use bytes::Bytes;
use hashlink::LinkedHashMap;
use rm_cloud::{CloudClient, NodeId, RemoteNode};
use tracing::{debug, instrument, trace};

use super::error::FsError;
use super::materialize::materialize;
use super::mode::Mode;
use super::size::{SizeInfo, estimate};
use crate::render::Renderer;

type SlotKey = (NodeId, Mode);

#[derive(Debug, Clone)]
struct CacheSlot {
    bytes: Bytes,
    /// `modified_at` of the node the bytes were produced from.
    source_version: SystemTime,
}

#[derive(Debug, Clone, Copy)]
struct KnownSize {
    bytes: u64,
    source_version: SystemTime,
}

/// Capacity-bounded cache of materialized documents.
pub struct ContentCache {
    capacity: usize,
    /// Front is least recently used.
    slots: Mutex<LinkedHashMap<SlotKey, CacheSlot>>,
    known_sizes: scc::HashMap<SlotKey, KnownSize>,
}

impl ContentCache {
    /// Keep at most `capacity` documents, and at least one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            slots: Mutex::new(LinkedHashMap::new()),
            known_sizes: scc::HashMap::new(),
        }
    }

    fn cached(&self, key: &SlotKey, version: SystemTime) -> Option<Bytes> {
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let slot = slots.remove(key)?;
        if slot.source_version != version {
            trace!(id = %key.0, mode = %key.1, "dropping stale slot");
            return None;
        }
        let bytes = slot.bytes.clone();
        slots.insert(key.clone(), slot);
        Some(bytes)
    }

    fn store(&self, key: SlotKey, slot: CacheSlot) {
        let known = KnownSize {
            bytes: slot.bytes.len() as u64,
            source_version: slot.source_version,
        };
        self.known_sizes.upsert_sync(key.clone(), known);

        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        slots.remove(&key);
        slots.insert(key, slot);
        while slots.len() > self.capacity {
            if let Some(((id, mode), _)) = slots.pop_front() {
                debug!(%id, %mode, "evicted content slot");
            }
        }
    }

    /// The bytes of `node` in `mode`, materializing them on a miss.
    ///
    /// No lock is held while materializing, so concurrent misses on different documents proceed
    /// in parallel and may evict each other.
    ///
    /// # Errors
    ///
    /// Propagates materialization failures. A failure leaves every cached slot untouched.
    #[instrument(
        name = "ContentCache::get_content",
        skip(self, client, renderer, node),
        fields(id = %node.id)
    )]
    pub async fn get_content<C: CloudClient>(
        &self,
        client: &C,
        renderer: &dyn Renderer,
        node: &RemoteNode,
        mode: Mode,
    ) -> Result<Bytes, FsError> {
        let key = (node.id.clone(), mode);
        if let Some(bytes) = self.cached(&key, node.modified_at) {
            debug!(len = bytes.len(), "content cache hit");
            return Ok(bytes);
        }

        debug!("content cache miss");
        let bytes = materialize(client, renderer, node, mode).await?;
        self.store(
            key,
            CacheSlot {
                bytes: bytes.clone(),
                source_version: node.modified_at,
            },
        );
        Ok(bytes)
    }

    /// Size of `node` in `mode`: exact once materialized for its current version, else estimated.
    #[must_use]
    pub fn size_info(&self, node: &RemoteNode, mode: Mode) -> SizeInfo {
        let key = (node.id.clone(), mode);
        self.known_sizes
            .read_sync(&key, |_, known| {
                (known.source_version == node.modified_at).then_some(known.bytes)
            })
            .flatten()
            .map_or_else(|| SizeInfo::Estimated(estimate(node, mode)), SizeInfo::Known)
    }

    /// Forget the bytes and sizes of `id` in every mode.
    pub fn invalidate(&self, id: &NodeId) {
        for mode in Mode::ALL {
            self.invalidate_mode(id, mode);
        }
    }

    /// Forget the bytes and size of `id` in `mode` only.
    pub fn invalidate_mode(&self, id: &NodeId, mode: Mode) {
        let key = (id.clone(), mode);
        self.slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&key);
        self.known_sizes.remove_sync(&key);
    }

    /// Whether `(id, mode)` currently occupies a slot.
    #[must_use]
    pub fn contains(&self, id: &NodeId, mode: Mode) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains_key(&(id.clone(), mode))
    }

    /// Number of occupied slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether no slot is occupied.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
