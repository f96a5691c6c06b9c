//! Presented file sizes before and after materialization.

use rm_cloud::{DocType, RemoteNode};

use super::mode::Mode;

/// Fixed guess for the size of a node's `meta` rendering.
pub const META_SIZE_ESTIMATE: u64 = 1024;

/// Size of a node in one mode, either measured or guessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SizeInfo {
    /// Measured from materialized bytes.
    Known(u64),
    /// Guessed from sizes reported by the store.
    Estimated(u64),
}

impl SizeInfo {
    /// The byte count to report, exact or not.
    #[must_use]
    pub fn bytes(self) -> u64 {
        match self {
            Self::Known(n) | Self::Estimated(n) => n,
        }
    }

    /// Whether the size has been measured.
    #[must_use]
    pub fn is_known(self) -> bool {
        matches!(self, Self::Known(_))
    }
}

/// Guess the size of `node` presented in `mode` without fetching anything.
#[must_use]
pub fn estimate(node: &RemoteNode, mode: Mode) -> u64 {
    if node.is_folder() {
        return 0;
    }
    match (mode, node.doc_type) {
        (Mode::Meta, _) => META_SIZE_ESTIMATE,
        (Mode::Raw, _) => node.bundle_size,
        (Mode::Orig, Some(DocType::Pdf | DocType::Epub)) => node.file_size,
        (Mode::Orig | Mode::Annot, _) => annotated_estimate(node),
    }
}

/// Annotations add vector layers on top of the original, so scale the larger of the two
/// reported sizes up a little.
fn annotated_estimate(node: &RemoteNode) -> u64 {
    let base = node.bundle_size.max(node.file_size);
    base.saturating_mul(6) / 5
}
