//! Test fixtures: a canned container backend and save-archive builders.

use std::collections::VecDeque;
use std::fs::File;
use std::io::Write;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::backend::{BackendError, BuildDescriptor, ContainerBackend};

/// A tar archive holding a single file entry; useful as a fake layer.
pub fn tar_with_file(name: &str, data: &[u8]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    crate::tar::append_bytes(&mut builder, name, data)?;
    builder.finish()?;
    Ok(builder.into_inner()?)
}

/// Build an image-save archive whose single layer holds `layer`, with
/// `manifest.json` placed after the layer data (the harder ordering).
pub fn save_archive_with_layer(layer: &[u8]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    crate::tar::append_bytes(&mut builder, "0f1x/layer.tar", layer)?;
    crate::tar::append_bytes(
        &mut builder,
        "manifest.json",
        br#"[{"Config":"cfg.json","RepoTags":null,"Layers":["0f1x/layer.tar"]}]"#,
    )?;
    builder.finish()?;
    Ok(builder.into_inner()?)
}

/// A backend that ignores the submitted contexts and serves canned save
/// archives in order, or fails every build with a fixed message.
pub struct MockBackend {
    saves: Mutex<VecDeque<Vec<u8>>>,
    build_error: Option<String>,
    /// Context tars submitted to [`ContainerBackend::build`], for
    /// assertions.
    pub contexts: Mutex<Vec<Vec<u8>>>,
}

impl MockBackend {
    /// A backend whose successive image saves yield the given first
    /// layers, one archive per build.
    pub fn returning_layers(layers: &[&[u8]]) -> Result<Self> {
        let saves = layers
            .iter()
            .map(|layer| save_archive_with_layer(layer))
            .collect::<Result<_>>()?;
        Ok(Self {
            saves: Mutex::new(saves),
            build_error: None,
            contexts: Mutex::new(Vec::new()),
        })
    }

    /// A backend that fails every build with `message`.
    pub fn failing(message: &str) -> Self {
        Self {
            saves: Mutex::new(VecDeque::new()),
            build_error: Some(message.to_string()),
            contexts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ContainerBackend for MockBackend {
    async fn build(&self, _descriptor: &BuildDescriptor, context_tar: Vec<u8>) -> Result<String> {
        if let Some(message) = &self.build_error {
            return Err(BackendError::Build(message.clone()).into());
        }
        let mut contexts = self.contexts.lock().unwrap();
        contexts.push(context_tar);
        Ok(format!("sha256:f1x70re{}", contexts.len()))
    }

    async fn save(&self, _image_id: &str, dest: &mut File) -> Result<()> {
        let save = self
            .saves
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow!("mock backend has no more save archives"))?;
        dest.write_all(&save)?;
        Ok(())
    }
}
