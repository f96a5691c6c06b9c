//! The driver-facing filesystem.
//!
//! [`CloudFs`] composes the inode table, metadata snapshot, mode state, content cache and mutation
//! mapper into the operations a kernel driver issues. Every method takes `&self`; callers may run
//! them concurrently.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use rm_cloud::{CloudClient, NodeId, RemoteNode};
use tracing::{debug, info, instrument, trace, warn};

use super::content::ContentCache;
use super::error::FsError;
use super::inode_table::InodeTable;
use super::metadata::{MetadataCache, Snapshot, SnapshotDiff};
use super::mode::{ControlCommand, Mode, ModeState, present_children};
use super::mutation::{MutationMapper, Removal, check_upload_name};
use super::size::SizeInfo;
use super::{
    DirEntry, FileHandle, FsStats, INode, INodeType, InodeAddr, InodePerms, MODE_INODE,
    OpenFlags, ROOT_INODE, TRASH_INODE,
};
use crate::render::Renderer;

/// Name of the control file in the root directory.
pub const MODE_FILE_NAME: &str = ".mode";
/// Name of the trash folder in the root directory.
pub const TRASH_DIR_NAME: &str = ".trash";
const RESERVED_ROOT_NAMES: [&str; 2] = [MODE_FILE_NAME, TRASH_DIR_NAME];

const BLOCK_SIZE: u32 = 4096;
const MAX_FILENAME_LENGTH: u32 = 255;
const REPORTED_BLOCKS: u64 = (1 << 32) / BLOCK_SIZE as u64;
const REPORTED_INODES: u64 = 10_000;
/// Largest file accepted for upload. Writes and truncations beyond it fail with `EFBIG`.
pub const MAX_UPLOAD_SIZE: u64 = 1 << 30;

/// Settings fixed for the lifetime of a mount.
#[derive(Debug, Clone)]
pub struct FsOptions {
    /// Mode to start in.
    pub mode: Mode,
    /// How many materialized documents to keep.
    pub cache_capacity: usize,
    /// Owner of every inode.
    pub uid: u32,
    /// Group of every inode.
    pub gid: u32,
}

impl Default for FsOptions {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            cache_capacity: 1,
            uid: nix::unistd::Uid::current().as_raw(),
            gid: nix::unistd::Gid::current().as_raw(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UploadState {
    Buffering,
    Uploading,
    Uploaded,
    Failed,
    Discarded,
}

#[derive(Debug)]
struct PendingInner {
    data: Vec<u8>,
    state: UploadState,
}

/// A file created through the filesystem whose bytes have not been uploaded yet.
#[derive(Debug)]
struct PendingUpload {
    addr: InodeAddr,
    id: NodeId,
    parent: NodeId,
    parent_addr: InodeAddr,
    name: String,
    created_at: SystemTime,
    inner: Mutex<PendingInner>,
    /// Serializes flushes so the same buffer is never uploaded twice.
    upload_lock: tokio::sync::Mutex<()>,
}

impl PendingUpload {
    fn lock(&self) -> std::sync::MutexGuard<'_, PendingInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn len(&self) -> u64 {
        self.lock().data.len() as u64
    }

    fn contents(&self) -> Bytes {
        Bytes::copy_from_slice(&self.lock().data)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<(), FsError> {
        let mut inner = self.lock();
        if inner.state != UploadState::Buffering {
            return Err(FsError::PermissionDenied);
        }
        let end = offset
            .checked_add(buf.len() as u64)
            .filter(|end| *end <= MAX_UPLOAD_SIZE)
            .ok_or(FsError::FileTooLarge)?;
        #[expect(
            clippy::cast_possible_truncation,
            reason = "end <= MAX_UPLOAD_SIZE, which fits in a usize"
        )]
        let (start, end) = (offset as usize, end as usize);
        if inner.data.len() < end {
            inner.data.resize(end, 0);
        }
        inner.data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn truncate(&self, size: u64) -> Result<(), FsError> {
        let mut inner = self.lock();
        if inner.state != UploadState::Buffering {
            return Err(FsError::PermissionDenied);
        }
        if size > MAX_UPLOAD_SIZE {
            return Err(FsError::FileTooLarge);
        }
        #[expect(
            clippy::cast_possible_truncation,
            reason = "size <= MAX_UPLOAD_SIZE, which fits in a usize"
        )]
        inner.data.resize(size as usize, 0);
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum OpenHandle {
    /// Materialized bytes, pinned for the lifetime of the handle.
    Content(Bytes),
    Control,
    Upload(Arc<PendingUpload>),
}

#[derive(Debug)]
struct Listing {
    generation: u64,
    mode: Mode,
    /// Sorted by name.
    entries: Vec<(String, InodeAddr)>,
    by_name: HashMap<String, InodeAddr>,
}

impl Listing {
    fn find(&self, name: &str) -> Option<InodeAddr> {
        self.by_name.get(name).copied()
    }
}

enum Target {
    Root,
    Trash,
    Control,
    Pending(Arc<PendingUpload>),
    Node(RemoteNode),
}

/// A reMarkable document store presented as a filesystem.
pub struct CloudFs<C> {
    client: C,
    renderer: Arc<dyn Renderer>,
    inodes: InodeTable,
    metadata: MetadataCache,
    mode: ModeState,
    content: ContentCache,
    listings: RwLock<HashMap<InodeAddr, Arc<Listing>>>,
    open_files: scc::HashMap<FileHandle, OpenHandle>,
    pending: scc::HashMap<InodeAddr, Arc<PendingUpload>>,
    pending_names: scc::HashMap<(InodeAddr, String), InodeAddr>,
    next_fh: AtomicU64,
    uid: u32,
    gid: u32,
    mounted_at: SystemTime,
}

impl<C: CloudClient> CloudFs<C> {
    /// Create a filesystem with an empty tree. Call [`Self::refresh`] before serving requests.
    pub fn new(client: C, renderer: Arc<dyn Renderer>, options: FsOptions) -> Self {
        Self {
            client,
            renderer,
            inodes: InodeTable::new(),
            metadata: MetadataCache::new(),
            mode: ModeState::new(options.mode),
            content: ContentCache::new(options.cache_capacity),
            listings: RwLock::new(HashMap::new()),
            open_files: scc::HashMap::new(),
            pending: scc::HashMap::new(),
            pending_names: scc::HashMap::new(),
            next_fh: AtomicU64::new(1),
            uid: options.uid,
            gid: options.gid,
            mounted_at: SystemTime::now(),
        }
    }

    /// The store client.
    pub fn client(&self) -> &C {
        &self.client
    }

    /// The current presentation mode.
    pub fn mode(&self) -> Mode {
        self.mode.get()
    }

    /// The current snapshot of the remote tree.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.metadata.snapshot()
    }

    /// The inode numbering.
    pub fn inode_table(&self) -> &InodeTable {
        &self.inodes
    }

    /// The materialized content cache.
    pub fn content_cache(&self) -> &ContentCache {
        &self.content
    }

    fn mutations(&self) -> MutationMapper<'_, C> {
        MutationMapper::new(&self.client, &self.metadata, &self.content)
    }

    fn invalidate_listings(&self) {
        self.listings
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
    }

    /// Fetch the remote tree and reconcile inodes and caches with it.
    ///
    /// # Errors
    ///
    /// [`FsError::RemoteUnavailable`] when the listing fails. The previous tree stays in place.
    #[instrument(name = "CloudFs::refresh", skip(self))]
    pub async fn refresh(&self) -> Result<SnapshotDiff, FsError> {
        let diff = self.metadata.refresh(&self.client).await?;
        for id in &diff.removed {
            if let Some(addr) = self.inodes.retire(id) {
                trace!(%id, addr, "retired inode");
            }
            self.content.invalidate(id);
        }
        for id in &diff.modified {
            self.content.invalidate(id);
        }
        // Meta output embeds name, parent and trash state, which change without a new version.
        for id in diff
            .renamed
            .iter()
            .chain(&diff.moved)
            .chain(&diff.trashed)
            .chain(&diff.untrashed)
        {
            self.content.invalidate_mode(id, Mode::Meta);
        }
        for id in &diff.added {
            let _ = self.inodes.allocate(id);
        }
        self.invalidate_listings();
        Ok(diff)
    }

    /// Refresh, logging instead of returning failures.
    pub async fn refresh_quietly(&self) {
        if let Err(e) = self.refresh().await {
            warn!(error = %e, "refresh failed, keeping the previous tree");
        }
    }

    /// Refresh every `every` on a background task until the filesystem is dropped.
    ///
    /// The first refresh happens one full period after the call.
    pub fn spawn_refresh_task(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(fs) = weak.upgrade() else {
                    debug!("filesystem dropped, stopping refresh task");
                    break;
                };
                fs.refresh_quietly().await;
            }
        })
    }

    fn target(&self, addr: InodeAddr, snapshot: &Snapshot) -> Result<Target, FsError> {
        match addr {
            ROOT_INODE => Ok(Target::Root),
            TRASH_INODE => Ok(Target::Trash),
            MODE_INODE => Ok(Target::Control),
            _ => {
                if let Some(pending) = self.pending.read_sync(&addr, |_, p| Arc::clone(p)) {
                    return Ok(Target::Pending(pending));
                }
                let id = self.inodes.resolve(addr).ok_or(FsError::NotFound)?;
                snapshot
                    .get(&id)
                    .cloned()
                    .map(Target::Node)
                    .ok_or(FsError::NotFound)
            }
        }
    }

    /// The node id of a directory inode.
    fn directory_id(&self, addr: InodeAddr, snapshot: &Snapshot) -> Result<NodeId, FsError> {
        match self.target(addr, snapshot)? {
            Target::Root => Ok(NodeId::root()),
            Target::Trash => Ok(NodeId::trash()),
            Target::Node(node) if node.is_folder() => Ok(node.id),
            Target::Node(_) | Target::Control | Target::Pending(_) => Err(FsError::NotADirectory),
        }
    }

    fn make_inode(
        &self,
        addr: InodeAddr,
        itype: INodeType,
        permissions: InodePerms,
        parent: Option<InodeAddr>,
        size: SizeInfo,
        modified: SystemTime,
    ) -> INode {
        INode {
            addr,
            permissions,
            uid: self.uid,
            gid: self.gid,
            last_modified_at: modified,
            parent,
            size,
            itype,
        }
    }

    fn attr_of(&self, addr: InodeAddr, target: &Target, snapshot: &Snapshot) -> INode {
        match target {
            Target::Root => self.make_inode(
                addr,
                INodeType::Directory,
                InodePerms::DIRECTORY,
                None,
                SizeInfo::Known(0),
                self.mounted_at,
            ),
            Target::Trash => self.make_inode(
                addr,
                INodeType::Directory,
                InodePerms::DIRECTORY,
                Some(ROOT_INODE),
                SizeInfo::Known(0),
                self.mounted_at,
            ),
            Target::Control => self.make_inode(
                addr,
                INodeType::File,
                InodePerms::READ_WRITE,
                Some(ROOT_INODE),
                SizeInfo::Known(self.mode.get().as_str().len() as u64 + 1),
                self.mounted_at,
            ),
            Target::Pending(pending) => self.make_inode(
                addr,
                INodeType::File,
                InodePerms::READ_WRITE,
                Some(pending.parent_addr),
                SizeInfo::Known(pending.len()),
                pending.created_at,
            ),
            Target::Node(node) => {
                let parent = self.inodes.allocate(&snapshot.presented_parent(node));
                if node.is_folder() {
                    self.make_inode(
                        addr,
                        INodeType::Directory,
                        InodePerms::DIRECTORY,
                        Some(parent),
                        SizeInfo::Known(0),
                        node.modified_at,
                    )
                } else {
                    self.make_inode(
                        addr,
                        INodeType::File,
                        InodePerms::READ_ONLY,
                        Some(parent),
                        self.content.size_info(node, self.mode.get()),
                        node.modified_at,
                    )
                }
            }
        }
    }

    fn getattr_in(&self, addr: InodeAddr, snapshot: &Snapshot) -> Result<INode, FsError> {
        let target = self.target(addr, snapshot)?;
        Ok(self.attr_of(addr, &target, snapshot))
    }

    fn listing(&self, dir: InodeAddr, snapshot: &Snapshot) -> Result<Arc<Listing>, FsError> {
        let dir_id = self.directory_id(dir, snapshot)?;
        let mode = self.mode.get();

        if let Some(cached) = self
            .listings
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&dir)
            && cached.generation == snapshot.generation()
            && cached.mode == mode
        {
            return Ok(Arc::clone(cached));
        }

        let reserved: &[&str] = if dir == ROOT_INODE {
            &RESERVED_ROOT_NAMES
        } else {
            &[]
        };
        let mut entries: Vec<(String, InodeAddr)> =
            present_children(snapshot.children(&dir_id), mode, reserved)
                .into_iter()
                .map(|(name, node)| (name, self.inodes.allocate(&node.id)))
                .collect();
        if dir == ROOT_INODE {
            entries.push((MODE_FILE_NAME.to_owned(), MODE_INODE));
            entries.push((TRASH_DIR_NAME.to_owned(), TRASH_INODE));
            entries.sort();
        }
        let by_name = entries.iter().cloned().collect();
        let listing = Arc::new(Listing {
            generation: snapshot.generation(),
            mode,
            entries,
            by_name,
        });
        trace!(dir, entries = listing.entries.len(), "built listing");

        self.listings
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(dir, Arc::clone(&listing));
        Ok(listing)
    }

    /// Find the inode `name` refers to inside `parent`, pending uploads included.
    fn find_child(
        &self,
        parent: InodeAddr,
        name: &str,
        snapshot: &Snapshot,
    ) -> Result<Option<InodeAddr>, FsError> {
        let listing = self.listing(parent, snapshot)?;
        Ok(listing.find(name).or_else(|| {
            self.pending_names
                .read_sync(&(parent, name.to_owned()), |_, &addr| addr)
        }))
    }

    /// Resolve `name` inside `parent`.
    ///
    /// # Errors
    ///
    /// [`FsError::NotFound`] for unknown names, [`FsError::NotADirectory`] when `parent` is a file.
    #[instrument(name = "CloudFs::lookup", skip(self))]
    pub fn lookup(&self, parent: InodeAddr, name: &OsStr) -> Result<INode, FsError> {
        let snapshot = self.metadata.snapshot();
        let name = name.to_str().ok_or(FsError::NotFound)?;
        match name {
            "." => self.getattr_in(parent, &snapshot),
            ".." => {
                let attr = self.getattr_in(parent, &snapshot)?;
                self.getattr_in(attr.parent.unwrap_or(ROOT_INODE), &snapshot)
            }
            _ => {
                let addr = self
                    .find_child(parent, name, &snapshot)?
                    .ok_or(FsError::NotFound)?;
                self.getattr_in(addr, &snapshot)
            }
        }
    }

    /// The kernel dropped `nlookup` references to `addr`. Inode numbers stay valid for the whole
    /// session, so nothing is released.
    pub fn forget(&self, addr: InodeAddr, nlookup: u64) {
        trace!(addr, nlookup, "forget");
    }

    /// Attributes of `addr`.
    ///
    /// # Errors
    ///
    /// [`FsError::NotFound`] for unknown or retired inodes.
    pub fn getattr(&self, addr: InodeAddr) -> Result<INode, FsError> {
        self.getattr_in(addr, &self.metadata.snapshot())
    }

    /// Change attributes. Only truncation means anything: it clears a pending upload and is
    /// accepted as a no-op on the control file.
    ///
    /// # Errors
    ///
    /// [`FsError::PermissionDenied`] when resizing a stored document.
    #[instrument(name = "CloudFs::setattr", skip(self))]
    pub fn setattr(&self, addr: InodeAddr, size: Option<u64>) -> Result<INode, FsError> {
        let snapshot = self.metadata.snapshot();
        let target = self.target(addr, &snapshot)?;
        if let Some(size) = size {
            match &target {
                Target::Pending(pending) => pending.truncate(size)?,
                Target::Node(node) if !node.is_folder() => return Err(FsError::PermissionDenied),
                Target::Node(_) | Target::Root | Target::Trash | Target::Control => {}
            }
        }
        Ok(self.attr_of(addr, &target, &snapshot))
    }

    /// List a directory, sorted by name. `.` and `..` are left to the caller.
    ///
    /// # Errors
    ///
    /// [`FsError::NotADirectory`] when `addr` is a file.
    #[instrument(name = "CloudFs::readdir", skip(self))]
    pub fn readdir(&self, addr: InodeAddr) -> Result<Vec<DirEntry>, FsError> {
        let snapshot = self.metadata.snapshot();
        let listing = self.listing(addr, &snapshot)?;
        Ok(listing
            .entries
            .iter()
            .filter_map(|(name, child)| {
                self.getattr_in(*child, &snapshot)
                    .ok()
                    .map(|inode| DirEntry {
                        name: OsString::from(name),
                        inode,
                    })
            })
            .collect())
    }

    fn register(&self, handle: OpenHandle) -> FileHandle {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        let _ = self.open_files.insert_sync(fh, handle);
        fh
    }

    fn handle(&self, fh: FileHandle) -> Result<OpenHandle, FsError> {
        self.open_files
            .read_sync(&fh, |_, h| h.clone())
            .ok_or(FsError::BadFileHandle)
    }

    /// Open a file. Documents are materialized in the current mode before this returns, and the
    /// handle keeps those bytes even if the cache later evicts them.
    ///
    /// # Errors
    ///
    /// [`FsError::PermissionDenied`] when opening a document for writing, [`FsError::IsADirectory`]
    /// for folders, plus any materialization failure.
    #[instrument(name = "CloudFs::open", skip(self))]
    pub async fn open(&self, addr: InodeAddr, flags: OpenFlags) -> Result<FileHandle, FsError> {
        let snapshot = self.metadata.snapshot();
        let handle = match self.target(addr, &snapshot)? {
            Target::Root | Target::Trash => return Err(FsError::IsADirectory),
            Target::Node(node) if node.is_folder() => return Err(FsError::IsADirectory),
            Target::Control => OpenHandle::Control,
            Target::Pending(pending) => OpenHandle::Upload(pending),
            Target::Node(node) => {
                if flags.wants_write() {
                    return Err(FsError::PermissionDenied);
                }
                let mode = self.mode.get();
                let bytes = self
                    .content
                    .get_content(&self.client, self.renderer.as_ref(), &node, mode)
                    .await?;
                OpenHandle::Content(bytes)
            }
        };
        let fh = self.register(handle);
        debug!(fh, "opened");
        Ok(fh)
    }

    /// Read from an open handle.
    ///
    /// Reading exactly at the end returns no bytes. Reading beyond it fails with
    /// [`FsError::NoDataAvailable`]: only a caller trusting a stale size estimate gets there.
    ///
    /// # Errors
    ///
    /// [`FsError::BadFileHandle`] for unknown handles.
    pub fn read(&self, fh: FileHandle, offset: u64, size: u32) -> Result<Bytes, FsError> {
        let data = match self.handle(fh)? {
            OpenHandle::Content(bytes) => bytes,
            OpenHandle::Control => Bytes::from(format!("{}\n", self.mode.get())),
            OpenHandle::Upload(pending) => pending.contents(),
        };
        let len = data.len() as u64;
        if offset > len {
            debug!(fh, offset, len, "read past the end");
            return Err(FsError::NoDataAvailable);
        }
        #[expect(
            clippy::cast_possible_truncation,
            reason = "offset <= len, which came from a usize"
        )]
        let start = offset as usize;
        let end = start.saturating_add(size as usize).min(data.len());
        Ok(data.slice(start..end))
    }

    /// Write to an open handle: a command to the control file, or bytes of a pending upload.
    ///
    /// # Errors
    ///
    /// [`FsError::InvalidArgument`] for unknown control commands, [`FsError::PermissionDenied`]
    /// for stored documents.
    #[instrument(name = "CloudFs::write", skip(self, data), fields(len = data.len()))]
    pub async fn write(&self, fh: FileHandle, offset: u64, data: &[u8]) -> Result<u32, FsError> {
        let written = u32::try_from(data.len())
            .map_err(|_| FsError::InvalidArgument("write too large".to_owned()))?;
        match self.handle(fh)? {
            OpenHandle::Content(_) => Err(FsError::PermissionDenied),
            OpenHandle::Upload(pending) => {
                pending.write_at(offset, data)?;
                Ok(written)
            }
            OpenHandle::Control => {
                match ControlCommand::parse(data)? {
                    ControlCommand::Set(mode) => {
                        if self.mode.set(mode) {
                            info!(%mode, "switched mode");
                            self.invalidate_listings();
                        }
                    }
                    ControlCommand::Refresh => self.refresh_quietly().await,
                }
                Ok(written)
            }
        }
    }

    fn forget_pending(&self, pending: &PendingUpload) {
        self.pending.remove_sync(&pending.addr);
        self.pending_names
            .remove_sync(&(pending.parent_addr, pending.name.clone()));
    }

    async fn finish_upload(&self, pending: &PendingUpload) -> Result<(), FsError> {
        let _serial = pending.upload_lock.lock().await;
        let data = {
            let mut inner = pending.lock();
            match inner.state {
                UploadState::Buffering if !inner.data.is_empty() => {
                    inner.state = UploadState::Uploading;
                    Bytes::from(inner.data.clone())
                }
                UploadState::Buffering
                | UploadState::Uploading
                | UploadState::Uploaded
                | UploadState::Failed
                | UploadState::Discarded => return Ok(()),
            }
        };

        let result = self
            .mutations()
            .upload(
                pending.id.clone(),
                &pending.parent,
                &pending.name,
                data,
            )
            .await;
        pending.lock().state = if result.is_ok() {
            UploadState::Uploaded
        } else {
            UploadState::Failed
        };
        self.forget_pending(pending);
        if result.is_err() {
            self.inodes.retire(&pending.id);
        }
        result.map(|node| debug!(id = %node.id, "upload complete"))
    }

    /// Flush a handle. Pending uploads are sent here so `close(2)` sees upload errors.
    ///
    /// # Errors
    ///
    /// [`FsError::UnsupportedContentType`] when the buffered bytes are neither PDF nor EPUB, plus
    /// any store failure.
    #[instrument(name = "CloudFs::flush", skip(self))]
    pub async fn flush(&self, fh: FileHandle) -> Result<(), FsError> {
        match self.handle(fh)? {
            OpenHandle::Upload(pending) => self.finish_upload(&pending).await,
            OpenHandle::Content(_) | OpenHandle::Control => Ok(()),
        }
    }

    /// Close a handle, uploading anything still buffered.
    ///
    /// # Errors
    ///
    /// [`FsError::BadFileHandle`] for unknown handles, plus upload failures.
    #[instrument(name = "CloudFs::release", skip(self))]
    pub async fn release(&self, fh: FileHandle) -> Result<(), FsError> {
        let (_, handle) = self
            .open_files
            .remove_sync(&fh)
            .ok_or(FsError::BadFileHandle)?;
        let OpenHandle::Upload(pending) = handle else {
            return Ok(());
        };
        let result = self.finish_upload(&pending).await;
        let never_written = {
            let mut inner = pending.lock();
            let empty = inner.state == UploadState::Buffering;
            if empty {
                inner.state = UploadState::Discarded;
            }
            empty
        };
        if never_written {
            debug!(name = %pending.name, "nothing written, dropping pending upload");
            self.forget_pending(&pending);
            self.inodes.retire(&pending.id);
        }
        result
    }

    /// Create a file that is uploaded once its bytes are flushed.
    ///
    /// # Errors
    ///
    /// [`FsError::UnsupportedContentType`] when the name announces anything but PDF or EPUB,
    /// [`FsError::AlreadyExists`] for taken names, [`FsError::PermissionDenied`] inside the trash
    /// or over the control file.
    #[instrument(name = "CloudFs::create", skip(self))]
    pub fn create(
        &self,
        parent: InodeAddr,
        name: &OsStr,
    ) -> Result<(INode, FileHandle), FsError> {
        let snapshot = self.metadata.snapshot();
        let name = name
            .to_str()
            .ok_or_else(|| FsError::InvalidArgument("name is not UTF-8".to_owned()))?;
        let parent_id = self.directory_id(parent, &snapshot)?;
        if parent_id.is_trash() || (parent == ROOT_INODE && name == MODE_FILE_NAME) {
            return Err(FsError::PermissionDenied);
        }
        if self.find_child(parent, name, &snapshot)?.is_some() {
            return Err(FsError::AlreadyExists);
        }
        check_upload_name(name)?;

        let id = NodeId::from(uuid::Uuid::new_v4().to_string());
        let addr = self.inodes.allocate(&id);
        let pending = Arc::new(PendingUpload {
            addr,
            id,
            parent: parent_id,
            parent_addr: parent,
            name: name.to_owned(),
            created_at: SystemTime::now(),
            inner: Mutex::new(PendingInner {
                data: Vec::new(),
                state: UploadState::Buffering,
            }),
            upload_lock: tokio::sync::Mutex::new(()),
        });
        if self
            .pending_names
            .insert_sync((parent, name.to_owned()), addr)
            .is_err()
        {
            self.inodes.retire(&pending.id);
            return Err(FsError::AlreadyExists);
        }
        let _ = self.pending.insert_sync(addr, Arc::clone(&pending));

        let fh = self.register(OpenHandle::Upload(Arc::clone(&pending)));
        debug!(addr, fh, "created pending upload");
        Ok((self.attr_of(addr, &Target::Pending(pending), &snapshot), fh))
    }

    /// Create a folder.
    ///
    /// # Errors
    ///
    /// [`FsError::AlreadyExists`] for taken names, [`FsError::PermissionDenied`] inside the trash.
    #[instrument(name = "CloudFs::mkdir", skip(self))]
    pub async fn mkdir(&self, parent: InodeAddr, name: &OsStr) -> Result<INode, FsError> {
        let snapshot = self.metadata.snapshot();
        let name = name
            .to_str()
            .ok_or_else(|| FsError::InvalidArgument("name is not UTF-8".to_owned()))?;
        let parent_id = self.directory_id(parent, &snapshot)?;
        if self.find_child(parent, name, &snapshot)?.is_some() {
            return Err(FsError::AlreadyExists);
        }
        let node = self.mutations().mkdir(&parent_id, name).await?;
        let addr = self.inodes.allocate(&node.id);
        self.getattr(addr)
    }

    /// Resolve `name` in `parent` to a stored node, refusing the reserved entries.
    fn stored_child(
        &self,
        parent: InodeAddr,
        name: &OsStr,
        snapshot: &Snapshot,
    ) -> Result<(InodeAddr, Target), FsError> {
        let name = name.to_str().ok_or(FsError::NotFound)?;
        let addr = self
            .find_child(parent, name, snapshot)?
            .ok_or(FsError::NotFound)?;
        match self.target(addr, snapshot)? {
            Target::Root | Target::Trash | Target::Control => Err(FsError::PermissionDenied),
            target => Ok((addr, target)),
        }
    }

    /// Rename or move an entry.
    ///
    /// # Errors
    ///
    /// [`FsError::PermissionDenied`] for the control file and the trash folder,
    /// [`FsError::AlreadyExists`] when the destination name is taken.
    #[instrument(name = "CloudFs::rename", skip(self))]
    pub async fn rename(
        &self,
        parent: InodeAddr,
        name: &OsStr,
        new_parent: InodeAddr,
        new_name: &OsStr,
    ) -> Result<(), FsError> {
        let snapshot = self.metadata.snapshot();
        let (addr, target) = self.stored_child(parent, name, &snapshot)?;
        let Target::Node(node) = target else {
            return Err(FsError::PermissionDenied);
        };
        let new_name = new_name
            .to_str()
            .ok_or_else(|| FsError::InvalidArgument("name is not UTF-8".to_owned()))?;
        if new_parent == ROOT_INODE && RESERVED_ROOT_NAMES.contains(&new_name) {
            return Err(FsError::PermissionDenied);
        }
        let dest = self.directory_id(new_parent, &snapshot)?;
        if let Some(existing) = self.find_child(new_parent, new_name, &snapshot)?
            && existing != addr
        {
            return Err(FsError::AlreadyExists);
        }

        let mutations = self.mutations();
        if snapshot.presented_parent(&node) != dest {
            mutations.move_node(&node.id, &dest).await?;
        }
        if Some(new_name) != name.to_str() {
            mutations.rename(&node.id, new_name).await?;
        }
        Ok(())
    }

    fn discard_pending(&self, pending: &PendingUpload) {
        pending.lock().state = UploadState::Discarded;
        self.forget_pending(pending);
        self.inodes.retire(&pending.id);
    }

    /// Remove a document. Outside the trash it is trashed; inside it is deleted for good.
    ///
    /// # Errors
    ///
    /// [`FsError::IsADirectory`] for folders, [`FsError::PermissionDenied`] for reserved entries.
    #[instrument(name = "CloudFs::unlink", skip(self))]
    pub async fn unlink(&self, parent: InodeAddr, name: &OsStr) -> Result<(), FsError> {
        let snapshot = self.metadata.snapshot();
        match self.stored_child(parent, name, &snapshot)?.1 {
            Target::Pending(pending) => {
                self.discard_pending(&pending);
                Ok(())
            }
            Target::Node(node) => {
                if self.mutations().unlink(&node.id).await? == Removal::Deleted {
                    self.inodes.retire(&node.id);
                }
                Ok(())
            }
            Target::Root | Target::Trash | Target::Control => Err(FsError::PermissionDenied),
        }
    }

    /// Remove an empty folder, with the same trash rules as [`Self::unlink`].
    ///
    /// # Errors
    ///
    /// [`FsError::NotEmpty`] for folders with children, [`FsError::NotADirectory`] for files.
    #[instrument(name = "CloudFs::rmdir", skip(self))]
    pub async fn rmdir(&self, parent: InodeAddr, name: &OsStr) -> Result<(), FsError> {
        let snapshot = self.metadata.snapshot();
        match self.stored_child(parent, name, &snapshot)?.1 {
            Target::Node(node) => {
                if self.mutations().rmdir(&node.id).await? == Removal::Deleted {
                    self.inodes.retire(&node.id);
                }
                Ok(())
            }
            Target::Pending(_) => Err(FsError::NotADirectory),
            Target::Root | Target::Trash | Target::Control => Err(FsError::PermissionDenied),
        }
    }

    /// Filesystem statistics. The store has no meaningful capacity, so generous constants are
    /// reported.
    pub fn statfs(&self) -> FsStats {
        let used = self.inodes.len() as u64;
        let total_inodes = REPORTED_INODES.max(used);
        FsStats {
            block_size: BLOCK_SIZE,
            total_blocks: REPORTED_BLOCKS,
            free_blocks: REPORTED_BLOCKS,
            available_blocks: REPORTED_BLOCKS,
            total_inodes,
            free_inodes: total_inodes - used,
            max_filename_length: MAX_FILENAME_LENGTH,
        }
    }
}
