//! Tar pipeline primitives: reproducible context archives, tar-into-tar
//! splicing, and first-layer extraction from a backend image-save archive.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use serde::Deserialize;

/// One entry of the `manifest.json` at the root of an image-save archive.
#[derive(Debug, Deserialize)]
struct SaveManifestEntry {
    #[serde(rename = "Layers")]
    layers: Vec<String>,
}

/// Append a directory tree to `dest` with reproducible entries.
///
/// Entry names are relative to `src` with forward slashes; children are
/// visited in lexical order. Uid/gid are zeroed and the user/group names
/// cleared so that identical trees produce identical archives.
#[context("Creating tar from {src}")]
pub fn append_dir_all<W: Write>(dest: &mut tar::Builder<W>, src: &Utf8Path) -> Result<()> {
    if !src.is_dir() {
        bail!("not a directory: {src}");
    }
    append_dir_inner(dest, src, src)
}

fn append_dir_inner<W: Write>(
    dest: &mut tar::Builder<W>,
    root: &Utf8Path,
    dir: &Utf8Path,
) -> Result<()> {
    let mut children = dir
        .read_dir_utf8()
        .with_context(|| format!("Reading {dir}"))?
        .collect::<Result<Vec<_>, _>>()?;
    children.sort_by(|a, b| a.file_name().cmp(b.file_name()));
    for child in children {
        let path = child.path();
        let rel = path.strip_prefix(root).expect("walk stays under root");
        let meta = path
            .symlink_metadata()
            .with_context(|| format!("Reading metadata of {path}"))?;
        let mut header = tar::Header::new_gnu();
        header.set_metadata(&meta);
        header.set_uid(0);
        header.set_gid(0);
        header.set_username("")?;
        header.set_groupname("")?;
        if meta.file_type().is_symlink() {
            let target = path
                .read_link_utf8()
                .with_context(|| format!("Reading link {path}"))?;
            dest.append_link(&mut header, rel, &target)?;
        } else if meta.is_dir() {
            header.set_size(0);
            dest.append_data(&mut header, rel, std::io::empty())?;
            append_dir_inner(dest, root, path)?;
        } else if meta.is_file() {
            let f = File::open(path).with_context(|| format!("Opening {path}"))?;
            dest.append_data(&mut header, rel, f)?;
        } else {
            // Sockets, fifos, devices: header only.
            header.set_size(0);
            dest.append_data(&mut header, rel, std::io::empty())?;
        }
    }
    Ok(())
}

/// Write a single regular-file entry with the given contents, mode 0644.
#[context("Writing tar entry {name}")]
pub fn append_bytes<W: Write>(dest: &mut tar::Builder<W>, name: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_mode(0o644);
    header.set_size(data.len() as u64);
    dest.append_data(&mut header, name, data)?;
    Ok(())
}

/// Copy every entry of the tar stream `src` into `dest`, re-rooted under
/// `target_dir`.
///
/// Headers are carried over as-is apart from the rewritten name, so type
/// bits and sizes survive. Tar entry names must be relative, so a leading
/// `/` on `target_dir` (or on a source entry) is dropped; inside a build
/// context the two spellings address the same file.
#[context("Splicing tar under {target_dir}")]
pub fn append_tar<R: Read, W: Write>(
    dest: &mut tar::Builder<W>,
    src: R,
    target_dir: &str,
) -> Result<()> {
    let target_dir = Utf8Path::new(target_dir.trim_start_matches('/'));
    let mut archive = tar::Archive::new(src);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = (*entry.path()?).to_owned();
        let path: &Utf8Path = path.as_path().try_into()?;
        let rebased = target_dir.join(path.strip_prefix("/").unwrap_or(path));
        let mut header = entry.header().clone();
        match header.entry_type() {
            tar::EntryType::Symlink | tar::EntryType::Link => {
                let target = entry
                    .link_name()?
                    .ok_or_else(|| anyhow!("entry {path} has no link target"))?;
                dest.append_link(&mut header, rebased, &*target)?;
            }
            _ => dest.append_data(&mut header, rebased, &mut entry)?,
        }
    }
    Ok(())
}

/// Locate the first layer of an image-save archive and return a reader over
/// exactly that entry's bytes.
///
/// `save` must hold the complete archive. `manifest.json` may precede or
/// follow the layer data in the stream, so this scans twice: once to learn
/// the layer's name, once to find where its bytes live.
#[context("Extracting first layer from image save archive")]
pub fn first_layer(mut save: File) -> Result<std::io::Take<File>> {
    save.rewind()?;
    let layer_name = {
        let mut archive = tar::Archive::new(BufReader::new(&save));
        let mut manifest: Option<Vec<SaveManifestEntry>> = None;
        for entry in archive.entries()? {
            let mut entry = entry?;
            if &*entry.path()? == Path::new("manifest.json") {
                let mut buf = String::new();
                entry.read_to_string(&mut buf)?;
                manifest = Some(serde_json::from_str(&buf).context("Parsing manifest.json")?);
                break;
            }
        }
        let manifest = manifest.ok_or_else(|| anyhow!("archive has no manifest.json"))?;
        let first = manifest
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("manifest.json has no entries"))?;
        first
            .layers
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("image has no layers"))?
    };

    save.rewind()?;
    let (position, size) = {
        let mut archive = tar::Archive::new(BufReader::new(&save));
        let mut found = None;
        for entry in archive.entries()? {
            let entry = entry?;
            if &*entry.path()? == Path::new(&layer_name) {
                found = Some((entry.raw_file_position(), entry.size()));
                break;
            }
        }
        found.ok_or_else(|| anyhow!("layer {layer_name} not found in archive"))?
    };

    save.seek(SeekFrom::Start(position))?;
    Ok(save.take(size))
}
