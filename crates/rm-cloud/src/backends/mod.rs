//! Document store backend implementations.

#[cfg(feature = "local-store")]
mod local_store;
#[cfg(feature = "local-store")]
pub use local_store::LocalStore;
