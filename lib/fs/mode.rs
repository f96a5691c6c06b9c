//! The process-wide presentation mode and the display names it derives.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;

use rm_cloud::{DocType, NodeId, RemoteNode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::error::FsError;

/// How every document's bytes are presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// PDF with annotations rendered in.
    #[default]
    Annot,
    /// The originally uploaded file; notebooks fall back to `Annot`.
    Orig,
    /// The stored bundle, zipped.
    Raw,
    /// JSON describing the node.
    Meta,
}

impl Mode {
    /// Every mode, in a fixed order.
    pub const ALL: [Self; 4] = [Self::Annot, Self::Orig, Self::Raw, Self::Meta];

    /// The name written to and read from `.mode`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Annot => "annot",
            Self::Orig => "orig",
            Self::Raw => "raw",
            Self::Meta => "meta",
        }
    }

    /// Extension, dot included, of a document of `doc_type` presented in this mode.
    #[must_use]
    pub fn extension(self, doc_type: DocType) -> &'static str {
        match (self, doc_type) {
            (Self::Raw, _) => ".zip",
            (Self::Meta, _) => ".json",
            (Self::Orig, DocType::Epub) => ".epub",
            (Self::Orig | Self::Annot, _) => ".pdf",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string names no mode.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown mode {0:?}, expected one of annot, orig, raw, meta")]
pub struct ParseModeError(String);

impl FromStr for Mode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == wanted)
            .ok_or_else(|| ParseModeError(s.to_owned()))
    }
}

/// A command written to the `.mode` control file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Switch to a mode.
    Set(Mode),
    /// Refresh the tree now.
    Refresh,
}

impl ControlCommand {
    /// Parse the bytes of a single write to `.mode`.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::InvalidArgument`] for anything but a mode name or `refresh`.
    pub fn parse(data: &[u8]) -> Result<Self, FsError> {
        let text = std::str::from_utf8(data)
            .map_err(|_| FsError::InvalidArgument("control input is not UTF-8".to_owned()))?;
        if text.trim().eq_ignore_ascii_case("refresh") {
            return Ok(Self::Refresh);
        }
        text.parse()
            .map(Self::Set)
            .map_err(|e: ParseModeError| FsError::InvalidArgument(e.to_string()))
    }
}

/// Single-writer cell holding the current mode.
#[derive(Debug, Default)]
pub struct ModeState {
    current: RwLock<Mode>,
}

impl ModeState {
    /// Start in `mode`.
    #[must_use]
    pub fn new(mode: Mode) -> Self {
        Self {
            current: RwLock::new(mode),
        }
    }

    /// The current mode.
    #[must_use]
    pub fn get(&self) -> Mode {
        *self
            .current
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Switch modes. Returns whether the mode changed.
    pub fn set(&self, mode: Mode) -> bool {
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let changed = *guard != mode;
        *guard = mode;
        changed
    }
}

/// Replace characters a filename cannot carry. Nameless nodes are named after their id.
fn sanitize(name: &str, id: &NodeId) -> String {
    let cleaned: String = name
        .chars()
        .filter(|&c| c != '\0')
        .map(|c| if c == '/' { '_' } else { c })
        .collect();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        id.to_string()
    } else {
        cleaned
    }
}

fn extension_for(node: &RemoteNode, mode: Mode) -> &'static str {
    match node.doc_type {
        Some(doc_type) if !node.is_folder() => mode.extension(doc_type),
        _ => "",
    }
}

/// The name `node` would carry in `mode` if nothing collided with it.
#[must_use]
pub fn display_name(node: &RemoteNode, mode: Mode) -> String {
    format!("{}{}", sanitize(&node.name, &node.id), extension_for(node, mode))
}

const ID_FRAGMENT_LEN: usize = 8;

/// Derive unique display names for the children of one directory.
///
/// `reserved` names always keep their spelling; any node that would present under one of them, or
/// under the same name as a sibling, gets an id fragment inserted before its extension. Output is
/// sorted by display name.
#[must_use]
pub fn present_children<'a>(
    children: impl IntoIterator<Item = &'a RemoteNode>,
    mode: Mode,
    reserved: &[&str],
) -> Vec<(String, &'a RemoteNode)> {
    let candidates: Vec<(String, &'static str, &RemoteNode)> = children
        .into_iter()
        .map(|node| (sanitize(&node.name, &node.id), extension_for(node, mode), node))
        .collect();

    let mut counts: HashMap<String, usize> = HashMap::new();
    for name in reserved {
        *counts.entry((*name).to_owned()).or_default() += 1;
    }
    for (stem, ext, _) in &candidates {
        *counts.entry(format!("{stem}{ext}")).or_default() += 1;
    }

    let mut named: Vec<(String, &RemoteNode)> = candidates
        .into_iter()
        .map(|(stem, ext, node)| {
            let plain = format!("{stem}{ext}");
            if counts.get(&plain).copied().unwrap_or_default() <= 1 {
                return (plain, node);
            }
            let fragment: String = node.id.as_str().chars().take(ID_FRAGMENT_LEN).collect();
            let candidate = format!("{stem} ({fragment}){ext}");
            if counts.contains_key(&candidate) {
                (format!("{stem} ({}){ext}", node.id), node)
            } else {
                (candidate, node)
            }
        })
        .collect();

    // Ids sharing a fragment still collide; the full id is unique.
    named.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));
    for i in 1..named.len() {
        if named[i].0 == named[i - 1].0 {
            for j in [i - 1, i] {
                let node = named[j].1;
                let (stem, ext) = (sanitize(&node.name, &node.id), extension_for(node, mode));
                named[j].0 = format!("{stem} ({}){ext}", node.id);
            }
        }
    }
    named.sort_by(|a, b| a.0.cmp(&b.0));
    named
}
