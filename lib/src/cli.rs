//! # Bootloader image build CLI
//!
//! Command line tool to build bootloader images from declarative
//! Bootfiles, list the content-addressed cache, and export OCI image
//! archives.

use std::ffi::OsString;

use anyhow::{bail, Context, Result};
use camino::Utf8PathBuf;
use clap::Parser;
use fn_error_context::context;

use crate::backend::DockerBackend;
use crate::build::{bootfile, Builder};
use crate::cache::Cache;
use crate::config::Config;
use crate::reference::Reference;

/// The well-known Bootfile name inside a build context directory.
const BOOTFILE_NAME: &str = "Bootfile.yml";

/// Perform a build operation
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct BuildOpts {
    /// Tagged name to apply to the built image
    #[clap(long, short = 't', required = true)]
    pub(crate) tag: String,

    /// Build context directory containing a Bootfile.yml
    pub(crate) path: Utf8PathBuf,
}

/// Perform an export operation
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct PushOpts {
    /// The image to export
    pub(crate) image: String,

    /// Destination archive path; defaults to `<name>-<tag>.oci.tar` in the
    /// current directory
    pub(crate) destination: Option<Utf8PathBuf>,
}

/// Build bootloader images packaged as OCI artifacts.
///
/// Images are compiled via a container-build backend, stored in a local
/// content-addressed cache, and exported as OCI image-layout archives.
#[derive(Debug, Parser, PartialEq, Eq)]
#[clap(name = "bootpack")]
#[clap(rename_all = "kebab-case")]
#[clap(version)]
pub(crate) enum Opt {
    /// Build an image from a directory containing a Bootfile.yml.
    Build(BuildOpts),
    /// List images stored in the cache.
    Images,
    /// Export an image to an OCI image-layout archive, ready for pushing.
    Push(PushOpts),
}

/// Parse the provided arguments and execute the requested command.
pub async fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    let opt = Opt::parse_from(args);
    let config = Config::load(None)?;
    match opt {
        Opt::Build(opts) => build(opts, &config).await,
        Opt::Images => images(&config),
        Opt::Push(opts) => push(opts, &config),
    }
}

#[context("Building image")]
async fn build(opts: BuildOpts, config: &Config) -> Result<()> {
    let tag = Reference::parse(&opts.tag)
        .with_context(|| format!("Parsing tag {:?}", opts.tag))?;
    if !opts.path.is_dir() {
        bail!("path {} is not a directory", opts.path);
    }
    let bootfile_path = opts.path.join(BOOTFILE_NAME);
    if !bootfile_path.is_file() {
        bail!("bootfile not found at {bootfile_path}");
    }
    tracing::info!("building {tag} from {}", opts.path);

    let source = std::fs::read_to_string(&bootfile_path)
        .with_context(|| format!("Reading {bootfile_path}"))?;
    let steps =
        bootfile::parse_str(&source).with_context(|| format!("Parsing {bootfile_path}"))?;

    let cache = Cache::new(&config.cache_dir()?)?;
    let backend = DockerBackend::connect()?;
    Builder::new(&cache, &backend, &opts.path, tag.clone(), &source)?
        .build(steps)
        .await?;
    println!("Wrote: {tag}");
    Ok(())
}

#[context("Listing images")]
fn images(config: &Config) -> Result<()> {
    let cache = Cache::new(&config.cache_dir()?)?;
    let mut table = comfy_table::Table::new();
    table
        .load_preset(comfy_table::presets::NOTHING)
        .set_content_arrangement(comfy_table::ContentArrangement::Dynamic)
        .set_header(["REPOSITORY", "TAG", "SHORT_DIGEST", "CREATED", "SIZE"]);
    for image in cache.list_images()? {
        let info = cache.image_info(&image)?;
        table.add_row([
            info.name,
            info.tag,
            info.short_digest,
            info.created.format("%Y-%m-%d %H:%M:%S").to_string(),
            indicatif::HumanBytes(info.size).to_string(),
        ]);
    }
    println!("{table}");
    Ok(())
}

#[context("Exporting image")]
fn push(opts: PushOpts, config: &Config) -> Result<()> {
    let cache = Cache::new(&config.cache_dir()?)?;
    let reference = Reference::parse(&opts.image)
        .with_context(|| format!("Parsing image {:?}", opts.image))?;
    let destination = opts.destination.unwrap_or_else(|| {
        let base = reference.path().rsplit('/').next().unwrap_or("image");
        Utf8PathBuf::from(format!("{base}-{}.oci.tar", reference.tag()))
    });
    let dest = std::fs::File::create(&destination)
        .with_context(|| format!("Creating {destination}"))?;
    crate::export::export_image(&cache, &opts.image, std::io::BufWriter::new(dest))?;
    println!("Wrote: {destination}");
    Ok(())
}
