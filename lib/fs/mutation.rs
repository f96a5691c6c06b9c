//! Write-class filesystem operations, mapped onto store calls plus optimistic snapshot patches.
//!
//! Every operation makes exactly one store call, outside any lock, and patches the snapshot only
//! once the call succeeded. The next refresh confirms or reverts the patch.

use bytes::Bytes;
use rm_cloud::{CloudClient, DocType, NewDocument, NewFolder, NodeId, RemoteNode};
use tracing::{debug, instrument};

use super::content::ContentCache;
use super::error::FsError;
use super::metadata::{MetadataCache, Patch, Snapshot};

/// How far into an upload the EPUB `mimetype` entry must appear.
const EPUB_SNIFF_WINDOW: usize = 100;
const EPUB_MARKER: &[u8] = b"mimetypeapplication/epub+zip";
const PDF_MAGIC: &[u8] = b"%PDF";

/// Recognize an upload by its leading bytes.
#[must_use]
pub fn sniff_doc_type(data: &[u8]) -> Option<DocType> {
    if data.starts_with(PDF_MAGIC) {
        return Some(DocType::Pdf);
    }
    let window = &data[..data.len().min(EPUB_SNIFF_WINDOW)];
    window
        .windows(EPUB_MARKER.len())
        .any(|w| w == EPUB_MARKER)
        .then_some(DocType::Epub)
}

/// Split `name` into stem and extension. Leading dots do not start an extension.
#[must_use]
pub fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], Some(&name[idx + 1..])),
        _ => (name, None),
    }
}

/// Reject names whose declared extension announces content that cannot be uploaded.
///
/// # Errors
///
/// [`FsError::UnsupportedContentType`] for any extension but `pdf` and `epub`.
pub fn check_upload_name(name: &str) -> Result<(), FsError> {
    match split_extension(name).1 {
        Some(ext) if DocType::from_upload_extension(ext).is_none() => {
            Err(FsError::UnsupportedContentType)
        }
        _ => Ok(()),
    }
}

/// Outcome of removing a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// The node now sits in the trash.
    Trashed,
    /// The node is gone for good.
    Deleted,
}

fn ensure_mutable(id: &NodeId) -> Result<(), FsError> {
    if id.is_root() || id.is_trash() {
        Err(FsError::PermissionDenied)
    } else {
        Ok(())
    }
}

fn ensure_container(snapshot: &Snapshot, parent: &NodeId) -> Result<(), FsError> {
    if parent.is_root() {
        return Ok(());
    }
    if parent.is_trash() {
        return Err(FsError::PermissionDenied);
    }
    match snapshot.get(parent) {
        Some(node) if node.is_folder() => Ok(()),
        Some(_) => Err(FsError::NotADirectory),
        None => Err(FsError::NotFound),
    }
}

/// Translates filesystem mutations into store calls.
pub struct MutationMapper<'a, C> {
    client: &'a C,
    metadata: &'a MetadataCache,
    content: &'a ContentCache,
}

impl<'a, C: CloudClient> MutationMapper<'a, C> {
    /// Borrow the pieces a mutation touches.
    #[must_use]
    pub fn new(client: &'a C, metadata: &'a MetadataCache, content: &'a ContentCache) -> Self {
        Self {
            client,
            metadata,
            content,
        }
    }

    fn node(&self, id: &NodeId) -> Result<RemoteNode, FsError> {
        ensure_mutable(id)?;
        self.metadata
            .snapshot()
            .get(id)
            .cloned()
            .ok_or(FsError::NotFound)
    }

    /// Rename a node. Documents lose whatever extension `new_name` carries.
    ///
    /// # Errors
    ///
    /// [`FsError::PermissionDenied`] for reserved nodes, [`FsError::InvalidArgument`] for a name
    /// that is empty once its extension is stripped.
    #[instrument(name = "MutationMapper::rename", skip(self))]
    pub async fn rename(&self, id: &NodeId, new_name: &str) -> Result<(), FsError> {
        let node = self.node(id)?;
        let name = if node.is_folder() {
            new_name
        } else {
            split_extension(new_name).0
        };
        if name.is_empty() {
            return Err(FsError::InvalidArgument("empty name".to_owned()));
        }
        if name == node.name {
            debug!("name unchanged");
            return Ok(());
        }

        self.client.rename(id, name).await?;
        self.metadata.apply(Patch::Rename {
            id: id.clone(),
            name: name.to_owned(),
        });
        self.content.invalidate(id);
        Ok(())
    }

    /// Reparent a node. Moving under the trash trashes it; moving out of the trash restores it.
    ///
    /// # Errors
    ///
    /// [`FsError::NotADirectory`] when the target is a document, [`FsError::InvalidArgument`]
    /// when a folder would end up inside itself.
    #[instrument(name = "MutationMapper::move_node", skip(self))]
    pub async fn move_node(&self, id: &NodeId, new_parent: &NodeId) -> Result<(), FsError> {
        let node = self.node(id)?;
        let snapshot = self.metadata.snapshot();

        if new_parent.is_trash() {
            if node.trashed {
                return Ok(());
            }
            self.client.trash(id).await?;
            self.metadata.apply(Patch::Trash(id.clone()));
            self.content.invalidate(id);
            return Ok(());
        }

        ensure_container(&snapshot, new_parent)?;
        if node.is_folder() && snapshot.is_within(new_parent, id) {
            return Err(FsError::InvalidArgument(
                "cannot move a folder into itself".to_owned(),
            ));
        }
        if !node.trashed && snapshot.presented_parent(&node) == *new_parent {
            debug!("parent unchanged");
            return Ok(());
        }

        self.client.move_node(id, new_parent).await?;
        self.metadata.apply(Patch::Move {
            id: id.clone(),
            parent: new_parent.clone(),
        });
        self.content.invalidate(id);
        Ok(())
    }

    async fn remove(&self, node: &RemoteNode) -> Result<Removal, FsError> {
        let snapshot = self.metadata.snapshot();
        let removal = if snapshot.presented_parent(node).is_trash() {
            self.client.delete(&node.id).await?;
            self.metadata.apply(Patch::Remove(node.id.clone()));
            Removal::Deleted
        } else {
            self.client.trash(&node.id).await?;
            self.metadata.apply(Patch::Trash(node.id.clone()));
            Removal::Trashed
        };
        self.content.invalidate(&node.id);
        Ok(removal)
    }

    /// Remove a document: trash it, or delete it for good if it already sits in the trash.
    ///
    /// # Errors
    ///
    /// [`FsError::IsADirectory`] for folders.
    #[instrument(name = "MutationMapper::unlink", skip(self))]
    pub async fn unlink(&self, id: &NodeId) -> Result<Removal, FsError> {
        let node = self.node(id)?;
        if node.is_folder() {
            return Err(FsError::IsADirectory);
        }
        self.remove(&node).await
    }

    /// Remove an empty folder, following the same trash rules as [`Self::unlink`].
    ///
    /// # Errors
    ///
    /// [`FsError::NotADirectory`] for documents, [`FsError::NotEmpty`] for folders with children.
    #[instrument(name = "MutationMapper::rmdir", skip(self))]
    pub async fn rmdir(&self, id: &NodeId) -> Result<Removal, FsError> {
        let node = self.node(id)?;
        if !node.is_folder() {
            return Err(FsError::NotADirectory);
        }
        if self.metadata.snapshot().has_children(id) {
            return Err(FsError::NotEmpty);
        }
        self.remove(&node).await
    }

    /// Create a folder under `parent`.
    ///
    /// # Errors
    ///
    /// [`FsError::PermissionDenied`] inside the trash, [`FsError::NotADirectory`] under a document.
    #[instrument(name = "MutationMapper::mkdir", skip(self))]
    pub async fn mkdir(&self, parent: &NodeId, name: &str) -> Result<RemoteNode, FsError> {
        ensure_container(&self.metadata.snapshot(), parent)?;
        let folder = NewFolder {
            id: NodeId::from(uuid::Uuid::new_v4().to_string()),
            parent: parent.clone(),
            name: name.to_owned(),
        };
        let node = self.client.create_folder(folder).await?;
        self.metadata.apply(Patch::Upsert(node.clone()));
        Ok(node)
    }

    /// Upload `data` as a new document named after `file_name` under `parent`, with id `id`.
    ///
    /// The content is checked before anything is sent: it must be a PDF or an EPUB.
    ///
    /// # Errors
    ///
    /// [`FsError::UnsupportedContentType`] for any other content, before any store call.
    #[instrument(name = "MutationMapper::upload", skip(self, data), fields(len = data.len()))]
    pub async fn upload(
        &self,
        id: NodeId,
        parent: &NodeId,
        file_name: &str,
        data: Bytes,
    ) -> Result<RemoteNode, FsError> {
        check_upload_name(file_name)?;
        let doc_type = sniff_doc_type(&data).ok_or(FsError::UnsupportedContentType)?;
        ensure_container(&self.metadata.snapshot(), parent)?;

        let stem = split_extension(file_name).0;
        let document = NewDocument {
            id,
            parent: parent.clone(),
            name: stem.to_owned(),
            doc_type,
            data,
        };
        let node = self.client.upload_document(document).await?;
        debug!(id = %node.id, ?doc_type, "uploaded document");
        self.metadata.apply(Patch::Upsert(node.clone()));
        Ok(node)
    }
}
