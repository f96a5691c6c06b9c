//! Node and bundle models.

use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Opaque, stable identifier of a node in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    const ROOT: &'static str = "";
    const TRASH: &'static str = "trash";

    /// The id of the root collection.
    #[must_use]
    pub fn root() -> Self {
        Self(Self::ROOT.to_owned())
    }

    /// The id the store uses as the parent of trashed nodes.
    #[must_use]
    pub fn trash() -> Self {
        Self(Self::TRASH.to_owned())
    }

    /// Whether this is the root id.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0 == Self::ROOT
    }

    /// Whether this is the trash id.
    #[must_use]
    pub fn is_trash(&self) -> bool {
        self.0 == Self::TRASH
    }

    /// The raw id string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether a node is a folder or a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// A collection of other nodes.
    Folder,
    /// A notebook, PDF or EPUB.
    Document,
}

/// The kind of content a document holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocType {
    /// Handwritten pages with no original file.
    Notebook,
    /// An uploaded PDF.
    Pdf,
    /// An uploaded EPUB.
    Epub,
}

impl DocType {
    /// Extension of the original file, if the document has one.
    #[must_use]
    pub fn original_extension(self) -> Option<&'static str> {
        match self {
            Self::Notebook => None,
            Self::Pdf => Some("pdf"),
            Self::Epub => Some("epub"),
        }
    }

    /// Parse the extension of an uploadable file. Only PDF and EPUB can be uploaded.
    #[must_use]
    pub fn from_upload_extension(ext: &str) -> Option<Self> {
        if ext.eq_ignore_ascii_case("pdf") {
            Some(Self::Pdf)
        } else if ext.eq_ignore_ascii_case("epub") {
            Some(Self::Epub)
        } else {
            None
        }
    }
}

/// A document or folder as reported by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteNode {
    /// Stable id.
    pub id: NodeId,
    /// Parent id; `None` only for the root. Trashed nodes report the trash id.
    pub parent_id: Option<NodeId>,
    /// Visible name, without extension.
    pub name: String,
    /// Folder or document.
    pub kind: NodeKind,
    /// Content type. Always `Some` for documents and `None` for folders.
    pub doc_type: Option<DocType>,
    /// Last modification time.
    pub modified_at: SystemTime,
    /// Whether the node sits in the trash.
    pub trashed: bool,
    /// Size of the original PDF or EPUB. Zero for notebooks and folders.
    pub file_size: u64,
    /// Total size of every part of the stored bundle.
    pub bundle_size: u64,
}

impl RemoteNode {
    /// Whether this node is a folder.
    #[must_use]
    pub fn is_folder(&self) -> bool {
        self.kind == NodeKind::Folder
    }
}

/// The raw multi-part representation of a document.
///
/// Parts are keyed by their path relative to the store root, e.g. `<id>.content`, `<id>.pdf` or
/// `<id>/<page>.rm`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    /// Document the bundle belongs to.
    pub id: NodeId,
    /// Part path to part bytes.
    pub parts: BTreeMap<String, Bytes>,
}

impl Bundle {
    /// The original uploaded file, if the bundle holds one for the given type.
    #[must_use]
    pub fn original_file(&self, doc_type: DocType) -> Option<&Bytes> {
        let ext = doc_type.original_extension()?;
        self.parts.get(&format!("{}.{ext}", self.id))
    }

    /// Total size of every part.
    #[must_use]
    pub fn total_len(&self) -> u64 {
        self.parts.values().map(|p| p.len() as u64).sum()
    }
}

/// Request to create a folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFolder {
    /// Client-generated id.
    pub id: NodeId,
    /// Parent folder.
    pub parent: NodeId,
    /// Visible name.
    pub name: String,
}

/// Request to upload a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDocument {
    /// Client-generated id.
    pub id: NodeId,
    /// Parent folder.
    pub parent: NodeId,
    /// Visible name, without extension.
    pub name: String,
    /// PDF or EPUB.
    pub doc_type: DocType,
    /// File contents.
    pub data: Bytes,
}
