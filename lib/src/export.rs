//! Assemble a portable OCI image-layout archive from the cache.
//!
//! The archive is the standard on-disk layout, tarred:
//!
//! ```text
//! oci-layout
//! index.json
//! blobs/sha256/<hex>   # manifest, config, and each layer
//! ```
//!
//! The manifest blob is hashed here; config and layer blobs are trusted
//! from the manifest's digests, since the cache is content-addressed.

use std::collections::HashSet;
use std::io::Write;

use anyhow::{Context, Result};
use fn_error_context::context;
use openssl::hash::{Hasher, MessageDigest};

use crate::cache::Cache;
use crate::oci::{Descriptor, Digest, ImageManifest, MediaType};
use crate::reference::Reference;

/// Path inside the archive to the blobs.
const BLOBDIR: &str = "blobs/sha256";
const OCI_LAYOUT: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;
const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// Write the OCI image-layout tar for the image `name` into `dest`.
#[context("Exporting image {}", name)]
pub fn export_image<W: Write>(cache: &Cache, name: &str, dest: W) -> Result<W> {
    let reference = Reference::parse(name)?;
    let manifest_bytes = cache.read_manifest(&reference)?;
    let manifest: ImageManifest =
        serde_json::from_slice(&manifest_bytes).context("Parsing manifest")?;

    let mut builder = tar::Builder::new(dest);
    crate::tar::append_bytes(&mut builder, "oci-layout", OCI_LAYOUT.as_bytes())?;

    let manifest_digest = sha256(&manifest_bytes)?;
    crate::tar::append_bytes(
        &mut builder,
        &format!("{BLOBDIR}/{}", manifest_digest.hex()),
        &manifest_bytes,
    )?;

    // Stream the config and every layer straight from the cache. Layers
    // may share a digest; each blob is written once.
    let mut seen: HashSet<String> = HashSet::new();
    for descriptor in std::iter::once(&manifest.config).chain(manifest.layers.iter()) {
        if seen.insert(descriptor.digest.hex().to_string()) {
            append_blob(&mut builder, cache, descriptor)?;
        }
    }

    let index = serde_json::json!({
        "schemaVersion": 2,
        "manifests": [{
            "mediaType": MediaType::ImageManifest,
            "digest": manifest_digest.oci(),
            "size": manifest_bytes.len(),
            "annotations": { REF_NAME_ANNOTATION: name }
        }]
    });
    crate::tar::append_bytes(&mut builder, "index.json", &serde_json::to_vec(&index)?)?;

    let mut dest = builder.into_inner().context("Finishing archive")?;
    dest.flush().context("Flushing archive")?;
    Ok(dest)
}

fn append_blob<W: Write>(
    builder: &mut tar::Builder<W>,
    cache: &Cache,
    descriptor: &Descriptor,
) -> Result<()> {
    let blob = cache.read_blob(&descriptor.digest.oci())?;
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_mode(0o644);
    header.set_size(descriptor.size);
    builder.append_data(
        &mut header,
        format!("{BLOBDIR}/{}", descriptor.digest.hex()),
        blob,
    )?;
    Ok(())
}

fn sha256(data: &[u8]) -> Result<Digest> {
    let mut hasher = Hasher::new(MessageDigest::sha256())?;
    hasher.update(data)?;
    Ok(Digest::from_sha256_hex(hex::encode(hasher.finish()?))?)
}
