//! Client-side model of a reMarkable document store.
//!
//! The store is a flat collection of nodes linked by parent ids. This crate defines the node and
//! bundle models, the [`CloudClient`] trait that filesystem front-ends program against, and the
//! backends that implement it.

mod backends;
mod client;
pub mod error;
pub mod models;

#[cfg(feature = "local-store")]
pub use backends::LocalStore;
pub use client::CloudClient;
pub use error::CloudError;
pub use models::{Bundle, DocType, NewDocument, NewFolder, NodeId, NodeKind, RemoteNode};
