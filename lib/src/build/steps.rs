//! Handlers for the individual Bootfile commands.

use anyhow::{Context as _, Result};
use fn_error_context::context;
use serde::Deserialize;

use crate::backend::{build_layer, BuildDescriptor, ContainerBackend};
use crate::build::context::BuildContext;
use crate::cache::Cache;
use crate::oci::{Descriptor, ImageConfiguration, LayerMeta, MediaType};

/// Step-level validation failures.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    /// The step command is not one we know.
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    /// The step argument must be a plain string.
    #[error("{0} requires a string argument")]
    ExpectedString(&'static str),
    /// `ARG` arguments must look like `NAME=VALUE`.
    #[error("invalid ARG format (expected NAME=VALUE): {0:?}")]
    BadArg(String),
    /// Only `u-boot` bootloaders are supported.
    #[error("bootloader type {0:?} is not supported")]
    UnsupportedBootloaderType(String),
    /// A reserved feature was requested.
    #[error("{0} is not implemented")]
    NotImplemented(&'static str),
    /// The BOOTLOADER arguments did not decode.
    #[error("invalid bootloader arguments: {0}")]
    BadBootloaderArgs(String),
}

/// `ARG NAME=VALUE`: record a substitution variable.
pub(crate) fn handle_arg(ctx: &mut BuildContext, args: &serde_json::Value) -> Result<()> {
    let arg = args
        .as_str()
        .ok_or(ValidationError::ExpectedString("ARG"))?;
    let (name, value) = arg
        .split_once('=')
        .ok_or_else(|| ValidationError::BadArg(arg.to_string()))?;
    if name.is_empty() {
        return Err(ValidationError::BadArg(arg.to_string()).into());
    }
    ctx.vars.insert(name.to_string(), value.to_string());
    Ok(())
}

/// `FROM`: only `scratch` is supported; external image import is reserved.
pub(crate) fn handle_from(ctx: &BuildContext, args: &serde_json::Value) -> Result<()> {
    let from = args
        .as_str()
        .ok_or(ValidationError::ExpectedString("FROM"))?;
    if ctx.substitute(from) == "scratch" {
        return Ok(());
    }
    Err(ValidationError::NotImplemented("FROM with an external image").into())
}

/// `VERSION`: set the build version, after substitution.
pub(crate) fn handle_version(ctx: &mut BuildContext, args: &serde_json::Value) -> Result<()> {
    let version = args
        .as_str()
        .ok_or(ValidationError::ExpectedString("VERSION"))?;
    ctx.version = Some(ctx.substitute(version));
    Ok(())
}

/// A build request: either the bare context string or the full mapping.
/// Other shapes are rejected by the decoder.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum BuildSpec {
    Shortcut(String),
    Full(BuildDescriptor),
}

impl BuildSpec {
    fn descriptor(&self) -> BuildDescriptor {
        match self {
            BuildSpec::Shortcut(context) => BuildDescriptor::from_context(context.clone()),
            BuildSpec::Full(descriptor) => descriptor.clone(),
        }
    }
}

/// The decoded `BOOTLOADER` arguments.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct BootloaderArgs {
    #[serde(rename = "type")]
    pub(crate) typ: String,
    #[serde(default)]
    pub(crate) selector: Option<String>,
    #[serde(default)]
    pub(crate) version: Option<String>,
    #[serde(default)]
    pub(crate) from: Option<String>,
    #[serde(default)]
    pub(crate) from_local: Option<String>,
    #[serde(default)]
    pub(crate) location: Option<String>,
    #[serde(default)]
    pub(crate) build: Option<BuildSpec>,
    #[serde(default)]
    pub(crate) from_wasm: Option<String>,
    #[serde(default)]
    pub(crate) from_local_wasm: Option<String>,
    #[serde(default)]
    pub(crate) location_wasm: Option<String>,
    #[serde(default)]
    pub(crate) build_wasm: Option<BuildSpec>,
}

/// How one artifact is sourced. Exactly one kind applies, selected by which
/// field is populated, in this priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceKind {
    From,
    FromLocal,
    Location,
    Build,
}

fn given(field: &Option<String>) -> bool {
    field.as_deref().is_some_and(|s| !s.is_empty())
}

fn source_kind(
    from: &Option<String>,
    from_local: &Option<String>,
    location: &Option<String>,
) -> SourceKind {
    if given(from) {
        SourceKind::From
    } else if given(from_local) {
        SourceKind::FromLocal
    } else if given(location) {
        SourceKind::Location
    } else {
        SourceKind::Build
    }
}

fn required_build(spec: &Option<BuildSpec>, field: &'static str) -> Result<BuildDescriptor> {
    spec.as_ref()
        .map(BuildSpec::descriptor)
        .ok_or_else(|| ValidationError::BadBootloaderArgs(format!("missing {field}")).into())
}

/// `BOOTLOADER`: produce the WASM payload and the bootloader image, write
/// the bootloader layer into the cache, and record it in the in-memory
/// manifest layers and config.
///
/// The layers, diff IDs, and layer-meta records are appended together and
/// only after the cache write succeeds, so the three sequences stay
/// index-aligned on every failure path.
#[context("Running BOOTLOADER step")]
pub(crate) async fn handle_bootloader(
    ctx: &BuildContext,
    cache: &Cache,
    backend: &dyn ContainerBackend,
    layers: &mut Vec<Descriptor>,
    config: &mut ImageConfiguration,
    args: &serde_json::Value,
) -> Result<()> {
    let args: BootloaderArgs = serde_json::from_value(args.clone())
        .map_err(|e| ValidationError::BadBootloaderArgs(e.to_string()))?;
    if args.typ != "u-boot" {
        return Err(ValidationError::UnsupportedBootloaderType(args.typ).into());
    }

    let wasm = match source_kind(&args.from_wasm, &args.from_local_wasm, &args.location_wasm) {
        SourceKind::From => {
            return Err(ValidationError::NotImplemented("wasm from a remote image").into())
        }
        SourceKind::FromLocal => {
            return Err(ValidationError::NotImplemented("wasm from a local image").into())
        }
        SourceKind::Location => {
            return Err(ValidationError::NotImplemented("wasm from a location URL").into())
        }
        SourceKind::Build => {
            let descriptor = required_build(&args.build_wasm, "build_wasm")?;
            build_layer(backend, &descriptor, &ctx.dir, |_| Ok(()))
                .await
                .context("Building wasm payload")?
        }
    };

    let layer = match source_kind(&args.from, &args.from_local, &args.location) {
        SourceKind::From => {
            return Err(ValidationError::NotImplemented("bootloader from a remote image").into())
        }
        SourceKind::FromLocal => {
            return Err(ValidationError::NotImplemented("bootloader from a local image").into())
        }
        SourceKind::Location => {
            return Err(ValidationError::NotImplemented("bootloader from a location URL").into())
        }
        SourceKind::Build => {
            let descriptor = required_build(&args.build, "build")?;
            // The wasm payload ships inside the bootloader's build context.
            build_layer(backend, &descriptor, &ctx.dir, |builder| {
                crate::tar::append_tar(builder, wasm, "/wasm")
            })
            .await
            .context("Building bootloader")?
        }
    };

    let (digest, size) = cache.write_blob(layer).context("Caching bootloader layer")?;
    tracing::debug!("added layer {} to cache", digest.cache_id());

    layers.push(Descriptor {
        media_type: MediaType::BootloaderLayer,
        digest: digest.clone(),
        size,
    });
    config.rootfs.diff_ids.push(digest);
    config.layer_meta.push(LayerMeta {
        media_type: MediaType::BootloaderLayer,
        selector: args.selector,
        version: args.version,
        location: None,
    });
    Ok(())
}
