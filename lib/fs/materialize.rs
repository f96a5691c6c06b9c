//! Turning nodes into the bytes presented for each mode.

use std::io::{Cursor, Write as _};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use rm_cloud::{Bundle, CloudClient, DocType, NodeKind, RemoteNode};
use serde::Serialize;
use tracing::{debug, instrument};

use super::error::FsError;
use super::mode::Mode;
use crate::render::{RenderError, Renderer};

/// Pack every part of a bundle into an uncompressed zip archive, one entry per part.
///
/// # Errors
///
/// Returns the zip writer's error.
pub fn pack_bundle(bundle: &Bundle) -> Result<Bytes, zip::result::ZipError> {
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored);
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (path, data) in &bundle.parts {
        writer.start_file(path.as_str(), options)?;
        writer.write_all(data)?;
    }
    Ok(Bytes::from(writer.finish()?.into_inner()))
}

#[derive(Serialize)]
struct MetaView<'a> {
    id: &'a str,
    name: &'a str,
    kind: NodeKind,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    doc_type: Option<DocType>,
    parent: Option<&'a str>,
    modified_at: String,
    trashed: bool,
    file_size: u64,
    bundle_size: u64,
}

/// The `meta` presentation of a node. Built locally; nothing is fetched.
///
/// # Errors
///
/// Fails only if JSON encoding fails.
pub fn meta_json(node: &RemoteNode) -> Result<Bytes, FsError> {
    let view = MetaView {
        id: node.id.as_str(),
        name: &node.name,
        kind: node.kind,
        doc_type: node.doc_type,
        parent: node.parent_id.as_ref().map(rm_cloud::NodeId::as_str),
        modified_at: DateTime::<Utc>::from(node.modified_at).to_rfc3339(),
        trashed: node.trashed,
        file_size: node.file_size,
        bundle_size: node.bundle_size,
    };
    let mut out = serde_json::to_vec_pretty(&view)
        .map_err(|e| FsError::InvalidArgument(format!("cannot encode metadata: {e}")))?;
    out.push(b'\n');
    Ok(Bytes::from(out))
}

/// Produce the bytes of `node` in `mode`.
///
/// # Errors
///
/// [`FsError::IsADirectory`] for folders, [`FsError::RemoteUnavailable`] when the bundle cannot be
/// fetched and [`FsError::RenderFailure`] when it cannot be turned into the requested format.
#[instrument(name = "materialize", skip(client, renderer, node), fields(id = %node.id))]
pub async fn materialize<C: CloudClient>(
    client: &C,
    renderer: &dyn Renderer,
    node: &RemoteNode,
    mode: Mode,
) -> Result<Bytes, FsError> {
    let Some(doc_type) = node.doc_type.filter(|_| !node.is_folder()) else {
        return Err(FsError::IsADirectory);
    };

    if mode == Mode::Meta {
        return meta_json(node);
    }

    let bundle = client.fetch_bundle(&node.id).await?;
    debug!(parts = bundle.parts.len(), bytes = bundle.total_len(), "fetched bundle");

    let bytes = match (mode, doc_type) {
        (Mode::Raw, _) => pack_bundle(&bundle).map_err(RenderError::from)?,
        (Mode::Orig, DocType::Pdf | DocType::Epub) => bundle
            .original_file(doc_type)
            .cloned()
            .ok_or(RenderError::MissingOriginal)?,
        (Mode::Orig | Mode::Annot | Mode::Meta, _) => renderer.render(&bundle, doc_type).await?,
    };
    Ok(bytes)
}
