//! Driver for the container-build backend.
//!
//! The backend is an opaque service with exactly two operations: build an
//! image from a tar-encoded context, and save an image as a tar archive.
//! The default implementation talks to the local Docker daemon via its API
//! socket; tests substitute a canned backend.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;

use anyhow::{Context, Result};
use async_trait::async_trait;
use camino::Utf8Path;
use fn_error_context::context;
use futures_util::StreamExt;
use serde::Deserialize;

/// Failures reported by (or about) the container-build backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The backend reported a build failure.
    #[error("backend build failed: {0}")]
    Build(String),
    /// The build stream ended without an image identifier.
    #[error("backend build stream ended without an image id")]
    MissingImageId,
    /// The image save archive could not be interpreted.
    #[error("malformed image save archive: {0}")]
    MalformedSave(String),
}

/// How to compile one artifact with the container-build backend.
///
/// In the Bootfile this appears either as a bare string (the context
/// directory) or as the full mapping.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildDescriptor {
    #[serde(default = "default_dockerfile")]
    pub dockerfile: String,
    /// Inline Dockerfile source; when non-empty it is written into the
    /// context at the `dockerfile` path.
    #[serde(default)]
    pub dockerfile_inline: String,
    #[serde(default = "default_target")]
    pub target: String,
    #[serde(default = "default_context")]
    pub context: String,
    #[serde(default)]
    pub args: HashMap<String, String>,
}

fn default_dockerfile() -> String {
    "Dockerfile".to_string()
}

fn default_target() -> String {
    "dist".to_string()
}

fn default_context() -> String {
    ".".to_string()
}

impl BuildDescriptor {
    /// The shortcut form: only the context directory, everything else
    /// defaulted.
    pub fn from_context(context: impl Into<String>) -> Self {
        Self {
            dockerfile: default_dockerfile(),
            dockerfile_inline: String::new(),
            target: default_target(),
            context: context.into(),
            args: HashMap::new(),
        }
    }
}

/// The container-build backend contract.
#[async_trait]
pub trait ContainerBackend {
    /// Build an image from the tar-encoded `context_tar`, returning the
    /// image identifier.
    async fn build(&self, descriptor: &BuildDescriptor, context_tar: Vec<u8>) -> Result<String>;

    /// Stream the saved image tar into `dest`.
    async fn save(&self, image_id: &str, dest: &mut File) -> Result<()>;
}

/// Backend implementation over the local Docker daemon.
pub struct DockerBackend {
    client: bollard::Docker,
}

impl DockerBackend {
    /// Connect using the standard local environment (socket, or
    /// `DOCKER_HOST` overrides).
    #[context("Connecting to docker")]
    pub fn connect() -> Result<Self> {
        Ok(Self {
            client: bollard::Docker::connect_with_local_defaults()?,
        })
    }
}

#[async_trait]
impl ContainerBackend for DockerBackend {
    async fn build(&self, descriptor: &BuildDescriptor, context_tar: Vec<u8>) -> Result<String> {
        let options = bollard::image::BuildImageOptions {
            dockerfile: descriptor.dockerfile.clone(),
            target: descriptor.target.clone(),
            buildargs: descriptor.args.clone(),
            rm: true,
            ..Default::default()
        };
        let mut stream = self.client.build_image(
            options,
            None,
            Some(bytes::Bytes::from(context_tar)),
        );
        let mut image_id = None;
        while let Some(message) = stream.next().await {
            let info = message.map_err(|e| BackendError::Build(e.to_string()))?;
            if let Some(id) = progress(&info)? {
                image_id = Some(id);
            }
        }
        image_id.ok_or_else(|| BackendError::MissingImageId.into())
    }

    async fn save(&self, image_id: &str, dest: &mut File) -> Result<()> {
        let mut stream = self.client.export_image(image_id);
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("Reading image save stream")?;
            dest.write_all(&chunk).context("Spooling image save stream")?;
        }
        Ok(())
    }
}

/// Interpret one build progress message: surface `errorDetail`/`error` as
/// terminal failures, log build output, and pick the image id out of the
/// `aux` record.
fn progress(info: &bollard::models::BuildInfo) -> Result<Option<String>> {
    if let Some(detail) = &info.error_detail {
        return Err(BackendError::Build(detail.message.clone().unwrap_or_default()).into());
    }
    if let Some(error) = &info.error {
        return Err(BackendError::Build(error.clone()).into());
    }
    if let Some(output) = &info.stream {
        let output = output.trim_end();
        if !output.is_empty() {
            tracing::debug!("backend: {output}");
        }
    }
    Ok(info.aux.as_ref().and_then(|aux| aux.id.clone()))
}

/// Compile one artifact end to end.
///
/// Tars up the context directory (adding the inline Dockerfile when one is
/// given), lets `middleware` extend the archive, submits it to the backend,
/// and returns a reader over the first layer of the saved image. The layer
/// is never held in memory; the save archive is spooled to an anonymous
/// temp file.
#[context("Building artifact from context {:?}", descriptor.context)]
pub async fn build_layer(
    backend: &dyn ContainerBackend,
    descriptor: &BuildDescriptor,
    working_dir: &Utf8Path,
    middleware: impl FnOnce(&mut tar::Builder<Vec<u8>>) -> Result<()>,
) -> Result<std::io::Take<File>> {
    let context_dir = working_dir.join(&descriptor.context);
    let mut builder = tar::Builder::new(Vec::new());
    crate::tar::append_dir_all(&mut builder, &context_dir)?;
    if !descriptor.dockerfile_inline.is_empty() {
        crate::tar::append_bytes(
            &mut builder,
            &descriptor.dockerfile,
            descriptor.dockerfile_inline.as_bytes(),
        )?;
    }
    middleware(&mut builder)?;
    builder.finish()?;
    let context_tar = builder.into_inner()?;

    let image_id = backend
        .build(descriptor, context_tar)
        .await
        .context("Running backend build")?;
    tracing::debug!("built image {image_id}");

    let mut spool = tempfile::tempfile().context("Creating save spool file")?;
    backend
        .save(&image_id, &mut spool)
        .await
        .context("Saving image")?;
    crate::tar::first_layer(spool)
        .map_err(|e| anyhow::Error::from(BackendError::MalformedSave(format!("{e:#}"))))
}
