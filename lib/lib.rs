//! rm-fs shared library: presents a reMarkable document store as a filesystem.

/// Filesystem core: identity, caches, presentation and the FUSE adapter.
pub mod fs;
/// Annotated PDF rendering.
pub mod render;
