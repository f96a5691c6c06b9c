#![allow(dead_code, missing_docs, clippy::unwrap_used)]

use std::collections::{BTreeMap, HashMap};
use std::ffi::OsStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use rm_cloud::{
    Bundle, CloudClient, CloudError, DocType, NewDocument, NewFolder, NodeId, NodeKind,
    RemoteNode,
};
use rm_fs::fs::{CloudFs, FileHandle, FsError, FsOptions, INode, InodeAddr, Mode, OpenFlags};
use rm_fs::render::{RenderError, Renderer};
use tokio::sync::Notify;

pub const PDF_BYTES: &[u8] = b"%PDF-1.7\n% sample document\n%%EOF\n";

/// Smallest byte string the upload sniffer accepts as an EPUB.
pub fn epub_bytes() -> Vec<u8> {
    let mut data = b"PK\x03\x04".to_vec();
    data.extend_from_slice(&[0; 26]);
    data.extend_from_slice(b"mimetypeapplication/epub+zip");
    data.extend_from_slice(b"...rest of the archive...");
    data
}

#[derive(Default)]
struct MockState {
    nodes: Mutex<BTreeMap<NodeId, RemoteNode>>,
    bundles: Mutex<HashMap<NodeId, Bundle>>,
    offline: AtomicBool,
    clock: AtomicU64,
    list_calls: AtomicU64,
    fetch_calls: AtomicU64,
    mutation_calls: AtomicU64,
    listing_gate: Mutex<Option<ListingGate>>,
}

/// Holds one listing between reading the nodes and returning them.
#[derive(Clone, Default)]
pub struct ListingGate {
    /// Notified once the held listing has taken its snapshot of the nodes.
    pub reached: Arc<Notify>,
    /// Notify to let the held listing return.
    pub release: Arc<Notify>,
}

/// In-memory document store. Clones share state, so a test can keep a handle after moving one
/// into the filesystem.
#[derive(Clone, Default)]
pub struct MockCloud {
    state: Arc<MockState>,
}

impl MockCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh, strictly increasing timestamp.
    fn tick(&self) -> SystemTime {
        let n = self.state.clock.fetch_add(1, Ordering::Relaxed);
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000 + n)
    }

    fn check_online(&self) -> Result<(), CloudError> {
        if self.state.offline.load(Ordering::Relaxed) {
            Err(CloudError::Unavailable("mock store offline".to_owned()))
        } else {
            Ok(())
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.state.offline.store(offline, Ordering::Relaxed);
    }

    pub fn list_calls(&self) -> u64 {
        self.state.list_calls.load(Ordering::Relaxed)
    }

    pub fn fetch_calls(&self) -> u64 {
        self.state.fetch_calls.load(Ordering::Relaxed)
    }

    pub fn mutation_calls(&self) -> u64 {
        self.state.mutation_calls.load(Ordering::Relaxed)
    }

    pub fn node(&self, id: &str) -> Option<RemoteNode> {
        self.state.nodes.lock().unwrap().get(&NodeId::from(id)).cloned()
    }

    pub fn nodes(&self) -> Vec<RemoteNode> {
        self.state.nodes.lock().unwrap().values().cloned().collect()
    }

    pub fn add_folder(&self, id: &str, parent: &str, name: &str) -> RemoteNode {
        let node = RemoteNode {
            id: NodeId::from(id),
            parent_id: Some(NodeId::from(parent)),
            name: name.to_owned(),
            kind: NodeKind::Folder,
            doc_type: None,
            modified_at: self.tick(),
            trashed: NodeId::from(parent).is_trash(),
            file_size: 0,
            bundle_size: 0,
        };
        self.state
            .nodes
            .lock()
            .unwrap()
            .insert(node.id.clone(), node.clone());
        node
    }

    /// Add a document whose bundle holds a content record, page data and, for PDFs and EPUBs,
    /// `original` as the original file.
    pub fn add_document(
        &self,
        id: &str,
        parent: &str,
        name: &str,
        doc_type: DocType,
        original: &[u8],
    ) -> RemoteNode {
        let node_id = NodeId::from(id);
        let mut parts = BTreeMap::new();
        parts.insert(
            format!("{id}.content"),
            Bytes::from_static(b"{\"fileType\":\"\"}"),
        );
        parts.insert(format!("{id}/0.rm"), Bytes::from_static(b"page strokes"));
        let file_size = match doc_type.original_extension() {
            Some(ext) => {
                parts.insert(format!("{id}.{ext}"), Bytes::copy_from_slice(original));
                original.len() as u64
            }
            None => 0,
        };
        let bundle = Bundle {
            id: node_id.clone(),
            parts,
        };
        let node = RemoteNode {
            id: node_id.clone(),
            parent_id: Some(NodeId::from(parent)),
            name: name.to_owned(),
            kind: NodeKind::Document,
            doc_type: Some(doc_type),
            modified_at: self.tick(),
            trashed: NodeId::from(parent).is_trash(),
            file_size,
            bundle_size: bundle.total_len(),
        };
        self.state
            .nodes
            .lock()
            .unwrap()
            .insert(node_id.clone(), node.clone());
        self.state.bundles.lock().unwrap().insert(node_id, bundle);
        node
    }

    /// Change a node behind the filesystem's back, bumping its modification time.
    pub fn edit(&self, id: &str, f: impl FnOnce(&mut RemoteNode)) {
        let now = self.tick();
        let mut nodes = self.state.nodes.lock().unwrap();
        let node = nodes.get_mut(&NodeId::from(id)).unwrap();
        f(node);
        node.modified_at = now;
    }

    /// Change a node behind the filesystem's back without touching its modification time, the
    /// way the store reports a rename.
    pub fn edit_keeping_version(&self, id: &str, f: impl FnOnce(&mut RemoteNode)) {
        let mut nodes = self.state.nodes.lock().unwrap();
        f(nodes.get_mut(&NodeId::from(id)).unwrap());
    }

    /// Make the next `list_nodes` call pause after reading the nodes.
    pub fn hold_next_listing(&self) -> ListingGate {
        let gate = ListingGate::default();
        *self.state.listing_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// Remove a node behind the filesystem's back.
    pub fn remove(&self, id: &str) {
        self.state.nodes.lock().unwrap().remove(&NodeId::from(id));
    }

    fn mutate(
        &self,
        id: &NodeId,
        f: impl FnOnce(&mut RemoteNode),
    ) -> Result<(), CloudError> {
        self.check_online()?;
        self.state.mutation_calls.fetch_add(1, Ordering::Relaxed);
        let now = self.tick();
        let mut nodes = self.state.nodes.lock().unwrap();
        let node = nodes
            .get_mut(id)
            .ok_or_else(|| CloudError::NodeNotFound(id.clone()))?;
        f(node);
        node.modified_at = now;
        Ok(())
    }
}

impl CloudClient for MockCloud {
    async fn list_nodes(&self) -> Result<Vec<RemoteNode>, CloudError> {
        self.state.list_calls.fetch_add(1, Ordering::Relaxed);
        self.check_online()?;
        let nodes = self.nodes();
        let gate = self.state.listing_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.reached.notify_one();
            gate.release.notified().await;
        }
        Ok(nodes)
    }

    async fn fetch_bundle(&self, id: &NodeId) -> Result<Bundle, CloudError> {
        self.state.fetch_calls.fetch_add(1, Ordering::Relaxed);
        self.check_online()?;
        self.state
            .bundles
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| CloudError::NodeNotFound(id.clone()))
    }

    async fn rename(&self, id: &NodeId, name: &str) -> Result<(), CloudError> {
        self.mutate(id, |node| name.clone_into(&mut node.name))
    }

    async fn move_node(&self, id: &NodeId, new_parent: &NodeId) -> Result<(), CloudError> {
        self.mutate(id, |node| {
            node.parent_id = Some(new_parent.clone());
            node.trashed = false;
        })
    }

    async fn trash(&self, id: &NodeId) -> Result<(), CloudError> {
        self.mutate(id, |node| {
            node.parent_id = Some(NodeId::trash());
            node.trashed = true;
        })
    }

    async fn delete(&self, id: &NodeId) -> Result<(), CloudError> {
        self.check_online()?;
        self.state.mutation_calls.fetch_add(1, Ordering::Relaxed);
        self.state.bundles.lock().unwrap().remove(id);
        self.state
            .nodes
            .lock()
            .unwrap()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| CloudError::NodeNotFound(id.clone()))
    }

    async fn create_folder(&self, folder: NewFolder) -> Result<RemoteNode, CloudError> {
        self.check_online()?;
        self.state.mutation_calls.fetch_add(1, Ordering::Relaxed);
        Ok(self.add_folder(folder.id.as_str(), folder.parent.as_str(), &folder.name))
    }

    async fn upload_document(&self, document: NewDocument) -> Result<RemoteNode, CloudError> {
        self.check_online()?;
        self.state.mutation_calls.fetch_add(1, Ordering::Relaxed);
        Ok(self.add_document(
            document.id.as_str(),
            document.parent.as_str(),
            &document.name,
            document.doc_type,
            &document.data,
        ))
    }
}

/// Renders every document to a small PDF naming it, and counts calls.
#[derive(Default)]
pub struct MockRenderer {
    calls: AtomicU64,
    failing: AtomicBool,
}

impl MockRenderer {
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub fn expected_output(id: &str) -> Vec<u8> {
        format!("%PDF-1.4 rendered {id}").into_bytes()
    }
}

#[async_trait]
impl Renderer for MockRenderer {
    async fn render(&self, bundle: &Bundle, _doc_type: DocType) -> Result<Bytes, RenderError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if self.failing.load(Ordering::Relaxed) {
            return Err(RenderError::Failed {
                status: Some(1),
                stderr: "mock renderer failure".to_owned(),
            });
        }
        Ok(Bytes::from(Self::expected_output(bundle.id.as_str())))
    }
}

pub struct Harness {
    pub cloud: MockCloud,
    pub renderer: Arc<MockRenderer>,
    pub fs: Arc<CloudFs<MockCloud>>,
}

/// Mount `cloud` with a content cache of `capacity` slots and run the initial refresh.
pub async fn mount(cloud: &MockCloud, capacity: usize) -> Harness {
    let renderer = Arc::new(MockRenderer::default());
    let options = FsOptions {
        mode: Mode::Annot,
        cache_capacity: capacity,
        uid: 1000,
        gid: 1000,
    };
    let fs = Arc::new(CloudFs::new(
        cloud.clone(),
        Arc::clone(&renderer) as Arc<dyn Renderer>,
        options,
    ));
    fs.refresh().await.unwrap();
    Harness {
        cloud: cloud.clone(),
        renderer,
        fs,
    }
}

/// Resolve a `/`-separated path relative to the root.
pub fn lookup_path(fs: &CloudFs<MockCloud>, path: &str) -> Result<INode, FsError> {
    let mut inode = fs.getattr(rm_fs::fs::ROOT_INODE)?;
    for part in path.split('/').filter(|p| !p.is_empty()) {
        inode = fs.lookup(inode.addr, OsStr::new(part))?;
    }
    Ok(inode)
}

/// Names listed in a directory, in listing order.
pub fn names(fs: &CloudFs<MockCloud>, dir: InodeAddr) -> Vec<String> {
    fs.readdir(dir)
        .unwrap()
        .into_iter()
        .map(|e| e.name.to_string_lossy().into_owned())
        .collect()
}

/// Open, read to the end in small chunks, and release.
pub async fn read_all(fs: &CloudFs<MockCloud>, addr: InodeAddr) -> Result<Vec<u8>, FsError> {
    let fh = fs.open(addr, OpenFlags::RDONLY).await?;
    let out = read_handle(fs, fh);
    fs.release(fh).await?;
    out
}

pub fn read_handle(fs: &CloudFs<MockCloud>, fh: FileHandle) -> Result<Vec<u8>, FsError> {
    let mut out = Vec::new();
    loop {
        let chunk = fs.read(fh, out.len() as u64, 7)?;
        if chunk.is_empty() {
            return Ok(out);
        }
        out.extend_from_slice(&chunk);
    }
}

/// Write `data` into `.mode`, the way `echo` would.
pub async fn write_mode_file(fs: &CloudFs<MockCloud>, data: &[u8]) -> Result<(), FsError> {
    let fh = fs
        .open(rm_fs::fs::MODE_INODE, OpenFlags::WRONLY | OpenFlags::TRUNC)
        .await?;
    let res = fs.write(fh, 0, data).await.map(|_| ());
    fs.release(fh).await?;
    res
}

/// Create `name` under `parent`, write `data` and close it, the way `cp` would.
pub async fn copy_in(
    fs: &CloudFs<MockCloud>,
    parent: InodeAddr,
    name: &str,
    data: &[u8],
) -> Result<(), FsError> {
    let (_, fh) = fs.create(parent, OsStr::new(name))?;
    for (i, chunk) in data.chunks(5).enumerate() {
        fs.write(fh, (i * 5) as u64, chunk).await?;
    }
    let flushed = fs.flush(fh).await;
    let released = fs.release(fh).await;
    flushed.and(released)
}
