//! The cloud client abstraction.

use std::future::Future;

use crate::error::CloudError;
use crate::models::{Bundle, NewDocument, NewFolder, NodeId, RemoteNode};

/// Trait for pluggable document store backends.
///
/// Uses Rust edition 2024's native `impl Future` in traits (RPITIT), so implementors write plain
/// `async fn`s. Every call is a single independent request; implementations do not retry.
pub trait CloudClient: Send + Sync + 'static {
    /// List every node in the store, trashed ones included.
    fn list_nodes(&self) -> impl Future<Output = Result<Vec<RemoteNode>, CloudError>> + Send;

    /// Fetch the raw multi-part bundle of a document.
    fn fetch_bundle(&self, id: &NodeId)
    -> impl Future<Output = Result<Bundle, CloudError>> + Send;

    /// Change the visible name of a node.
    fn rename(&self, id: &NodeId, name: &str)
    -> impl Future<Output = Result<(), CloudError>> + Send;

    /// Reparent a node. Moving a trashed node restores it.
    fn move_node(
        &self,
        id: &NodeId,
        new_parent: &NodeId,
    ) -> impl Future<Output = Result<(), CloudError>> + Send;

    /// Move a node to the trash.
    fn trash(&self, id: &NodeId) -> impl Future<Output = Result<(), CloudError>> + Send;

    /// Permanently delete a node.
    fn delete(&self, id: &NodeId) -> impl Future<Output = Result<(), CloudError>> + Send;

    /// Create a folder.
    fn create_folder(
        &self,
        folder: NewFolder,
    ) -> impl Future<Output = Result<RemoteNode, CloudError>> + Send;

    /// Upload a new PDF or EPUB document.
    fn upload_document(
        &self,
        document: NewDocument,
    ) -> impl Future<Output = Result<RemoteNode, CloudError>> + Send;
}
