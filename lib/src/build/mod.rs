//! The Bootfile step interpreter.
//!
//! A [`Builder`] walks parsed steps in declaration order, mutating the
//! build context and accumulating the image's layers and configuration in
//! memory. Nothing is persisted until every step has succeeded; the final
//! config blob and manifest are then written through the cache.

pub mod bootfile;
pub mod context;
pub mod steps;

use std::io::Cursor;

use anyhow::{Context as _, Result};
use camino::Utf8Path;
use fn_error_context::context;

use crate::backend::ContainerBackend;
use crate::cache::Cache;
use crate::oci::{Descriptor, ImageConfiguration, ImageManifest, MediaType, SCHEMA_VERSION};
use crate::reference::Reference;
use bootfile::Step;
use context::BuildContext;

/// The author recorded in produced image configurations.
const AUTHOR: &str = "bootpack";

/// Interprets parsed Bootfile steps and assembles one image.
pub struct Builder<'a> {
    ctx: BuildContext,
    cache: &'a Cache,
    backend: &'a dyn ContainerBackend,
    layers: Vec<Descriptor>,
    config: ImageConfiguration,
}

impl<'a> Builder<'a> {
    /// A builder for the Bootfile in `dir`, producing the image `tag`.
    /// `bootfile_source` is recorded verbatim in the image configuration.
    #[context("Creating builder for {}", dir)]
    pub fn new(
        cache: &'a Cache,
        backend: &'a dyn ContainerBackend,
        dir: &Utf8Path,
        tag: Reference,
        bootfile_source: &str,
    ) -> Result<Self> {
        let dir = dir
            .canonicalize_utf8()
            .with_context(|| format!("Resolving {dir}"))?;
        Ok(Self {
            ctx: BuildContext::new(dir, tag),
            cache,
            backend,
            layers: Vec::new(),
            config: ImageConfiguration::new(AUTHOR, bootfile_source),
        })
    }

    /// Execute the steps in order, then persist the image. A failing step
    /// aborts the build without touching the stored manifest or config.
    pub async fn build(mut self, steps: Vec<Step>) -> Result<()> {
        for step in steps {
            self.run_step(&step)
                .await
                .with_context(|| format!("Executing {} step", step.command))?;
        }
        self.finish()
    }

    async fn run_step(&mut self, step: &Step) -> Result<()> {
        match step.command.as_str() {
            "ARG" => steps::handle_arg(&mut self.ctx, &step.args),
            "FROM" => steps::handle_from(&self.ctx, &step.args),
            "VERSION" => steps::handle_version(&mut self.ctx, &step.args),
            "BOOTLOADER" => {
                steps::handle_bootloader(
                    &self.ctx,
                    self.cache,
                    self.backend,
                    &mut self.layers,
                    &mut self.config,
                    &step.args,
                )
                .await
            }
            other => Err(steps::ValidationError::UnknownCommand(other.to_string()).into()),
        }
    }

    /// Serialize the config, store it as a blob, and persist the manifest
    /// under the normalized tag.
    fn finish(self) -> Result<()> {
        let config_json = serde_json::to_vec(&self.config).context("Serializing image config")?;
        let (digest, size) = self
            .cache
            .write_blob(Cursor::new(config_json))
            .context("Caching image config")?;
        let manifest = ImageManifest {
            schema_version: SCHEMA_VERSION,
            media_type: MediaType::ImageManifest,
            config: Descriptor {
                media_type: MediaType::ImageConfig,
                digest,
                size,
            },
            layers: self.layers,
        };
        self.cache
            .write_manifest(&self.ctx.tag, &manifest)
            .context("Persisting manifest")?;
        tracing::debug!("wrote manifest for {}", self.ctx.tag);
        Ok(())
    }
}
