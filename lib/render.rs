//! Producing annotated PDFs from document bundles.

use std::collections::BTreeMap;
use std::process::Stdio;

use async_trait::async_trait;
use bytes::Bytes;
use rm_cloud::{Bundle, DocType};
use thiserror::Error;
use tokio::io::AsyncWriteExt as _;
use tracing::{debug, instrument};

use crate::fs::materialize::pack_bundle;

/// Errors produced while rendering.
#[derive(Debug, Error)]
pub enum RenderError {
    /// The renderer cannot handle this kind of document.
    #[error("cannot render {0} documents")]
    Unsupported(&'static str),

    /// The bundle lacks the original PDF or EPUB.
    #[error("bundle has no original file")]
    MissingOriginal,

    /// The bundle could not be zipped for the renderer.
    #[error("failed to pack bundle: {0}")]
    Pack(#[from] zip::result::ZipError),

    /// The renderer process could not be started or fed.
    #[error("failed to run renderer: {0}")]
    Spawn(#[source] std::io::Error),

    /// The renderer process exited unsuccessfully.
    #[error("renderer exited with {status:?}: {stderr}")]
    Failed {
        /// Exit code, `None` when killed by a signal.
        status: Option<i32>,
        /// What the renderer wrote to stderr.
        stderr: String,
    },

    /// The renderer produced something other than a PDF.
    #[error("renderer output is not a PDF")]
    NotPdf,
}

/// Turns a raw bundle into annotated PDF bytes.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Render `bundle`, a document of type `doc_type`.
    async fn render(&self, bundle: &Bundle, doc_type: DocType) -> Result<Bytes, RenderError>;
}

/// Serves the original PDF untouched. Used when no external renderer is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughRenderer;

#[async_trait]
impl Renderer for PassthroughRenderer {
    async fn render(&self, bundle: &Bundle, doc_type: DocType) -> Result<Bytes, RenderError> {
        match doc_type {
            DocType::Pdf => bundle
                .original_file(DocType::Pdf)
                .cloned()
                .ok_or(RenderError::MissingOriginal),
            DocType::Epub => Err(RenderError::Unsupported("epub")),
            DocType::Notebook => Err(RenderError::Unsupported("notebook")),
        }
    }
}

/// Runs an external program that reads a zipped bundle on stdin and writes a PDF to stdout.
///
/// Options are passed as trailing `--key=value` arguments.
#[derive(Debug, Clone)]
pub struct CommandRenderer {
    program: String,
    args: Vec<String>,
    options: BTreeMap<String, String>,
}

impl CommandRenderer {
    /// Build from a command line (program first) and renderer options.
    ///
    /// Returns `None` for an empty command line.
    #[must_use]
    pub fn new(command: &[String], options: BTreeMap<String, String>) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            options,
        })
    }
}

#[async_trait]
impl Renderer for CommandRenderer {
    #[instrument(
        name = "CommandRenderer::render",
        skip(self, bundle),
        fields(id = %bundle.id, program = %self.program)
    )]
    async fn render(&self, bundle: &Bundle, doc_type: DocType) -> Result<Bytes, RenderError> {
        let archive = pack_bundle(bundle)?;

        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .args(self.options.iter().map(|(k, v)| format!("--{k}={v}")))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(RenderError::Spawn)?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| {
                RenderError::Spawn(std::io::Error::other("renderer stdin unavailable"))
            })?;
        let feed = async move {
            let res = stdin.write_all(&archive).await;
            drop(stdin);
            res
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output.map_err(RenderError::Spawn)?;

        if !output.status.success() {
            return Err(RenderError::Failed {
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
        // A renderer may legitimately stop reading early; only its exit status matters.
        if let Err(e) = fed {
            debug!(error = %e, "renderer closed stdin early");
        }
        if !output.stdout.starts_with(b"%PDF") {
            return Err(RenderError::NotPdf);
        }
        Ok(Bytes::from(output.stdout))
    }
}
