//! A document store kept in a local directory using the tablet's on-disk layout.
//!
//! Every node `<id>` owns a `<id>.metadata` record. Documents add a `<id>.content` record, the
//! original file as `<id>.pdf` or `<id>.epub`, and page data under `<id>/`. Trashed nodes have
//! `"trash"` as their parent.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::client::CloudClient;
use crate::error::CloudError;
use crate::models::{Bundle, DocType, NewDocument, NewFolder, NodeId, NodeKind, RemoteNode};

const METADATA_EXT: &str = "metadata";
const CONTENT_EXT: &str = "content";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum RecordType {
    DocumentType,
    CollectionType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetadataRecord {
    #[serde(default)]
    deleted: bool,
    #[serde(default)]
    last_modified: String,
    #[serde(default)]
    parent: String,
    #[serde(rename = "type")]
    record_type: RecordType,
    visible_name: String,
    #[serde(default)]
    version: u64,
}

impl MetadataRecord {
    fn touch(&mut self) {
        self.version += 1;
        self.last_modified = now_millis().to_string();
    }

    fn modified_at(&self) -> SystemTime {
        let millis = self.last_modified.parse::<u64>().unwrap_or_default();
        SystemTime::UNIX_EPOCH + Duration::from_millis(millis)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContentRecord {
    #[serde(default)]
    file_type: String,
}

impl ContentRecord {
    fn doc_type(&self) -> DocType {
        match self.file_type.as_str() {
            "pdf" => DocType::Pdf,
            "epub" => DocType::Epub,
            _ => DocType::Notebook,
        }
    }
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

/// Top-level files of the store keyed by file name, read in a single directory scan.
#[derive(Debug, Default)]
struct RootFiles(BTreeMap<String, PathBuf>);

impl RootFiles {
    /// Files named `<id>.<anything>`.
    fn of<'a>(&'a self, id: &NodeId) -> impl Iterator<Item = (&'a String, &'a PathBuf)> + 'a {
        let prefix = format!("{id}.");
        self.0
            .range(prefix.clone()..)
            .take_while(move |(name, _)| name.starts_with(&prefix))
    }

    /// Ids of every node with a metadata record.
    fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.0.keys().filter_map(|name| {
            name.strip_suffix(METADATA_EXT)
                .and_then(|stem| stem.strip_suffix('.'))
                .map(|id| NodeId::from(id.to_owned()))
        })
    }
}

/// A [`CloudClient`] backed by a directory in the tablet's storage layout.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Open a store rooted at `root`. The directory is created on first write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The directory backing this store.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, id: &NodeId, ext: &str) -> PathBuf {
        self.root.join(format!("{id}.{ext}"))
    }

    async fn read_metadata(&self, id: &NodeId) -> Result<MetadataRecord, CloudError> {
        let raw = match tokio::fs::read(self.record_path(id, METADATA_EXT)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CloudError::NodeNotFound(id.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        let record: MetadataRecord =
            serde_json::from_slice(&raw).map_err(|source| CloudError::Malformed {
                id: id.clone(),
                source,
            })?;
        if record.deleted {
            return Err(CloudError::NodeNotFound(id.clone()));
        }
        Ok(record)
    }

    async fn write_json<T: Serialize>(
        &self,
        id: &NodeId,
        ext: &str,
        value: &T,
    ) -> Result<(), CloudError> {
        let encoded = serde_json::to_vec_pretty(value).map_err(|source| CloudError::Malformed {
            id: id.clone(),
            source,
        })?;
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.record_path(id, ext);
        let tmp = self.record_path(id, &format!("{ext}.tmp"));
        tokio::fs::write(&tmp, encoded).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn read_content(&self, id: &NodeId) -> Result<ContentRecord, CloudError> {
        match tokio::fs::read(self.record_path(id, CONTENT_EXT)).await {
            Ok(raw) => serde_json::from_slice(&raw).map_err(|source| CloudError::Malformed {
                id: id.clone(),
                source,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ContentRecord::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_metadata(
        &self,
        id: &NodeId,
        f: impl FnOnce(&mut MetadataRecord),
    ) -> Result<(), CloudError> {
        let mut record = self.read_metadata(id).await?;
        f(&mut record);
        record.touch();
        self.write_json(id, METADATA_EXT, &record).await
    }

    /// Scan the store directory once. A missing directory is an empty store.
    async fn root_files(&self) -> Result<RootFiles, CloudError> {
        let mut files = RootFiles::default();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(".tmp") && entry.file_type().await?.is_file() {
                files.0.insert(name, entry.path());
            }
        }
        Ok(files)
    }

    /// Collect every file belonging to `id` as `(relative path, absolute path)` pairs.
    async fn bundle_files(
        &self,
        id: &NodeId,
        root_files: &RootFiles,
    ) -> Result<Vec<(String, PathBuf)>, CloudError> {
        let mut files: Vec<(String, PathBuf)> = root_files
            .of(id)
            .map(|(name, path)| (name.clone(), path.clone()))
            .collect();

        let mut pending = vec![(id.to_string(), self.root.join(id.as_str()))];
        while let Some((rel, dir)) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let child_rel = format!("{rel}/{}", entry.file_name().to_string_lossy());
                if entry.file_type().await?.is_dir() {
                    pending.push((child_rel, entry.path()));
                } else {
                    files.push((child_rel, entry.path()));
                }
            }
        }

        files.sort();
        Ok(files)
    }

    async fn load_node(
        &self,
        id: NodeId,
        root_files: &RootFiles,
    ) -> Result<RemoteNode, CloudError> {
        let record = self.read_metadata(&id).await?;
        let parent = NodeId::from(record.parent.clone());
        let trashed = parent.is_trash();

        let mut bundle_size = 0;
        for (_, path) in self.bundle_files(&id, root_files).await? {
            bundle_size += tokio::fs::metadata(&path).await?.len();
        }

        let (kind, doc_type, file_size) = match record.record_type {
            RecordType::CollectionType => (NodeKind::Folder, None, 0),
            RecordType::DocumentType => {
                let doc_type = self.read_content(&id).await?.doc_type();
                let file_size = match doc_type.original_extension() {
                    Some(ext) => match tokio::fs::metadata(self.record_path(&id, ext)).await {
                        Ok(meta) => meta.len(),
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
                        Err(e) => return Err(e.into()),
                    },
                    None => 0,
                };
                (NodeKind::Document, Some(doc_type), file_size)
            }
        };

        Ok(RemoteNode {
            id,
            parent_id: Some(parent),
            name: record.visible_name.clone(),
            kind,
            doc_type,
            modified_at: record.modified_at(),
            trashed,
            file_size,
            bundle_size,
        })
    }

    async fn ensure_folder(&self, id: &NodeId) -> Result<(), CloudError> {
        if id.is_root() {
            return Ok(());
        }
        let record = self.read_metadata(id).await?;
        if record.record_type == RecordType::CollectionType {
            Ok(())
        } else {
            Err(CloudError::Rejected(format!("{id} is not a folder")))
        }
    }
}

impl CloudClient for LocalStore {
    #[instrument(name = "LocalStore::list_nodes", skip(self), fields(root = %self.root.display()))]
    async fn list_nodes(&self) -> Result<Vec<RemoteNode>, CloudError> {
        let root_files = self
            .root_files()
            .await
            .map_err(|e| CloudError::Unavailable(e.to_string()))?;
        let ids: Vec<NodeId> = root_files.ids().collect();

        let mut nodes = Vec::with_capacity(ids.len());
        for id in ids {
            match self.load_node(id, &root_files).await {
                Ok(node) => nodes.push(node),
                Err(CloudError::NodeNotFound(id)) => debug!(%id, "skipping deleted record"),
                Err(CloudError::Malformed { id, source }) => {
                    warn!(%id, error = %source, "skipping malformed record");
                }
                Err(e) => return Err(e),
            }
        }
        debug!(count = nodes.len(), "listed nodes");
        Ok(nodes)
    }

    #[instrument(name = "LocalStore::fetch_bundle", skip(self))]
    async fn fetch_bundle(&self, id: &NodeId) -> Result<Bundle, CloudError> {
        self.read_metadata(id).await?;
        let root_files = self.root_files().await?;
        let mut parts = BTreeMap::new();
        for (rel, path) in self.bundle_files(id, &root_files).await? {
            parts.insert(rel, Bytes::from(tokio::fs::read(&path).await?));
        }
        Ok(Bundle {
            id: id.clone(),
            parts,
        })
    }

    #[instrument(name = "LocalStore::rename", skip(self))]
    async fn rename(&self, id: &NodeId, name: &str) -> Result<(), CloudError> {
        self.update_metadata(id, |record| name.clone_into(&mut record.visible_name))
            .await
    }

    #[instrument(name = "LocalStore::move_node", skip(self))]
    async fn move_node(&self, id: &NodeId, new_parent: &NodeId) -> Result<(), CloudError> {
        if !new_parent.is_trash() {
            self.ensure_folder(new_parent).await?;
        }
        self.update_metadata(id, |record| new_parent.as_str().clone_into(&mut record.parent))
            .await
    }

    #[instrument(name = "LocalStore::trash", skip(self))]
    async fn trash(&self, id: &NodeId) -> Result<(), CloudError> {
        self.move_node(id, &NodeId::trash()).await
    }

    #[instrument(name = "LocalStore::delete", skip(self))]
    async fn delete(&self, id: &NodeId) -> Result<(), CloudError> {
        self.read_metadata(id).await?;
        let root_files = self.root_files().await?;
        for (rel, path) in self.bundle_files(id, &root_files).await? {
            if !rel.starts_with(&format!("{id}/")) {
                tokio::fs::remove_file(&path).await?;
            }
        }
        match tokio::fs::remove_dir_all(self.root.join(id.as_str())).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(name = "LocalStore::create_folder", skip(self))]
    async fn create_folder(&self, folder: NewFolder) -> Result<RemoteNode, CloudError> {
        self.ensure_folder(&folder.parent).await?;
        let mut record = MetadataRecord {
            deleted: false,
            last_modified: String::new(),
            parent: folder.parent.to_string(),
            record_type: RecordType::CollectionType,
            visible_name: folder.name,
            version: 0,
        };
        record.touch();
        self.write_json(&folder.id, CONTENT_EXT, &ContentRecord::default())
            .await?;
        self.write_json(&folder.id, METADATA_EXT, &record).await?;
        let root_files = self.root_files().await?;
        self.load_node(folder.id, &root_files).await
    }

    #[instrument(
        name = "LocalStore::upload_document",
        skip(self, document),
        fields(id = %document.id)
    )]
    async fn upload_document(&self, document: NewDocument) -> Result<RemoteNode, CloudError> {
        self.ensure_folder(&document.parent).await?;
        let Some(ext) = document.doc_type.original_extension() else {
            return Err(CloudError::Rejected("notebooks cannot be uploaded".to_owned()));
        };

        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(self.record_path(&document.id, ext), &document.data).await?;
        let content = ContentRecord {
            file_type: ext.to_owned(),
        };
        self.write_json(&document.id, CONTENT_EXT, &content).await?;

        let mut record = MetadataRecord {
            deleted: false,
            last_modified: String::new(),
            parent: document.parent.to_string(),
            record_type: RecordType::DocumentType,
            visible_name: document.name,
            version: 0,
        };
        record.touch();
        // The metadata record goes last so a partial upload never shows up in a listing.
        self.write_json(&document.id, METADATA_EXT, &record).await?;
        let root_files = self.root_files().await?;
        self.load_node(document.id, &root_files).await
    }
}
