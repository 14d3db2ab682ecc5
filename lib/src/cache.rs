//! Content-addressed cache for bootloader image blobs and manifests.
//!
//! Layout under the cache root:
//!
//! ```text
//! layers/layers.json        metadata journal
//! layers/layers.lock        advisory file lock
//! layers/sha256-<hex>       blob files
//! manifests/<domain>/<path>/<tag>   manifest JSON
//! ```
//!
//! The journal is guarded by a cross-process `flock` on `layers.lock` plus
//! an in-process reader-writer lock over the loaded snapshot; the file lock
//! is always taken outside the process lock. Blobs are published with a
//! temp-file rename, so concurrent writers of the same content are safe.

use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::sync::RwLock;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, SecondsFormat, Utc};
use fn_error_context::context;
use openssl::hash::{Hasher, MessageDigest};
use serde::{Deserialize, Serialize};

use crate::oci::{Digest, ImageConfiguration, ImageManifest};
use crate::reference::Reference;

/// Metadata for one cached blob, as recorded in the journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerEntry {
    pub id: String,
    pub cache_id: String,
    pub size: u64,
    pub created: String,
    pub last_read: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LayersMetadata {
    #[serde(default, deserialize_with = "null_as_empty")]
    layers: Vec<LayerEntry>,
}

// Accept `{"layers": null}` as an empty journal.
fn null_as_empty<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Vec<LayerEntry>, D::Error> {
    Ok(Option::deserialize(d)?.unwrap_or_default())
}

/// Advisory cross-process lock guarding the metadata journal.
///
/// Dropping the guard closes the descriptor, which releases the lock on
/// every exit path.
struct FileLock {
    _file: File,
}

impl FileLock {
    #[context("Acquiring lock {}", path)]
    fn acquire(path: &Utf8Path) -> Result<Self> {
        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)?;
        rustix::fs::flock(&file, rustix::fs::FlockOperation::LockExclusive)?;
        Ok(Self { _file: file })
    }
}

/// Derived information about one cached image.
#[derive(Debug)]
pub struct ImageInfo {
    /// The repository name, `domain/path`.
    pub name: String,
    pub tag: String,
    /// Abbreviated config digest.
    pub short_digest: String,
    /// Config size plus the sum of all layer sizes.
    pub size: u64,
    pub created: DateTime<Utc>,
    pub config: ImageConfiguration,
    pub manifest: ImageManifest,
}

/// The content-addressed image cache.
pub struct Cache {
    layers_dir: Utf8PathBuf,
    manifests_dir: Utf8PathBuf,
    layers_file: Utf8PathBuf,
    lock_file: Utf8PathBuf,
    metadata: RwLock<Vec<LayerEntry>>,
}

impl Cache {
    /// Open the cache rooted at `dir`, creating the directory layout if
    /// necessary and loading the metadata journal.
    #[context("Opening cache at {}", dir)]
    pub fn new(dir: &Utf8Path) -> Result<Self> {
        let layers_dir = dir.join("layers");
        let manifests_dir = dir.join("manifests");
        fs::create_dir_all(&layers_dir).with_context(|| format!("Creating {layers_dir}"))?;
        fs::create_dir_all(&manifests_dir).with_context(|| format!("Creating {manifests_dir}"))?;
        let cache = Self {
            layers_file: layers_dir.join("layers.json"),
            lock_file: layers_dir.join("layers.lock"),
            layers_dir,
            manifests_dir,
            metadata: RwLock::new(Vec::new()),
        };
        cache.load_metadata()?;
        tracing::debug!("using cache at {dir}");
        Ok(cache)
    }

    /// Read the journal from disk into memory. Missing, empty, or
    /// unparseable journals reset to empty with a warning; only I/O errors
    /// other than absence are fatal.
    #[context("Loading cache metadata")]
    fn load_metadata(&self) -> Result<()> {
        let _lock = FileLock::acquire(&self.lock_file)?;
        let mut metadata = self.metadata.write().unwrap();
        *metadata = match fs::read(&self.layers_file) {
            Ok(data) if data.is_empty() => {
                tracing::debug!("{} is empty, initializing", self.layers_file);
                Vec::new()
            }
            Ok(data) => match serde_json::from_slice::<LayersMetadata>(&data) {
                Ok(parsed) => parsed.layers,
                Err(e) => {
                    tracing::warn!(
                        "failed to parse {}: {e}; initializing empty metadata",
                        self.layers_file
                    );
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("{} not found, initializing", self.layers_file);
                Vec::new()
            }
            Err(e) => return Err(e).with_context(|| format!("Reading {}", self.layers_file)),
        };
        tracing::debug!("loaded {} layer metadata entries", metadata.len());
        Ok(())
    }

    /// Atomically persist the in-memory journal: serialize under the read
    /// lock, write to `layers.json.tmp`, rename over `layers.json`.
    #[context("Saving cache metadata")]
    fn save_metadata(&self) -> Result<()> {
        let _lock = FileLock::acquire(&self.lock_file)?;
        let json = {
            let metadata = self.metadata.read().unwrap();
            serde_json::to_vec_pretty(&LayersMetadata {
                layers: metadata.clone(),
            })?
        };
        let tmp = Utf8PathBuf::from(format!("{}.tmp", self.layers_file));
        fs::write(&tmp, &json).with_context(|| format!("Writing {tmp}"))?;
        if let Err(e) = fs::rename(&tmp, &self.layers_file) {
            if let Err(e2) = fs::remove_file(&tmp) {
                tracing::warn!("failed to remove {tmp} after rename error: {e2}");
            }
            return Err(e).with_context(|| format!("Renaming {tmp}"));
        }
        Ok(())
    }

    /// Stream a blob into the cache, returning its digest and byte count.
    ///
    /// The source is hashed and counted in a single pass into an exclusive
    /// temp file, which is then renamed to `sha256-<hex>` unless that blob
    /// already exists. The journal entry is created or touched afterwards;
    /// a blob left on disk without an entry (crash window) is re-registered
    /// by the next write of the same bytes.
    #[context("Writing blob to cache")]
    pub fn write_blob(&self, mut src: impl Read) -> Result<(Digest, u64)> {
        let mut tmp = tempfile::Builder::new()
            .prefix("tmp-blob-")
            .tempfile_in(&self.layers_dir)
            .context("Creating temporary blob file")?;

        // Tee into the hasher and the temp file in a single pass.
        let mut hasher = Hasher::new(MessageDigest::sha256())?;
        let mut size = 0u64;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = src.read(&mut buf).context("Reading blob source")?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n])?;
            tmp.write_all(&buf[..n]).context("Writing blob")?;
            size += n as u64;
        }
        let digest = Digest::from_sha256_hex(hex::encode(hasher.finish()?))?;

        let blob_path = self.layers_dir.join(digest.cache_id());
        match blob_path.symlink_metadata() {
            // Already content-addressed and present; the temp file is
            // redundant and removed on drop.
            Ok(_) => tracing::debug!("blob {} already cached", digest.cache_id()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tmp.persist(&blob_path)
                    .with_context(|| format!("Publishing blob {blob_path}"))?;
                tracing::trace!("stored blob {blob_path}");
            }
            Err(e) => return Err(e).with_context(|| format!("Checking {blob_path}")),
        }

        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
        {
            let mut metadata = self.metadata.write().unwrap();
            if let Some(entry) = metadata.iter_mut().find(|l| l.id == digest.cache_id()) {
                if entry.size != size && size != 0 {
                    tracing::warn!(
                        "size mismatch for cached blob {}: metadata {}, new {}; keeping original",
                        entry.id,
                        entry.size,
                        size
                    );
                }
                entry.last_read = now;
            } else {
                metadata.push(LayerEntry {
                    id: digest.cache_id(),
                    cache_id: digest.cache_id(),
                    size,
                    created: now.clone(),
                    last_read: now,
                });
            }
        }
        self.save_metadata()?;

        Ok((digest, size))
    }

    /// Open a streaming reader over a cached blob. The identifier may be
    /// given in any of the forms `sha256:<hex>`, `sha256-<hex>`, or bare
    /// hex.
    #[context("Opening cached blob {}", id)]
    pub fn read_blob(&self, id: &str) -> Result<File> {
        let digest = Digest::parse(id)?;
        let path = self.layers_dir.join(digest.cache_id());
        File::open(&path).with_context(|| format!("Opening {path}"))
    }

    /// Persist a manifest under the normalized reference.
    #[context("Writing manifest for {}", reference)]
    pub fn write_manifest(&self, reference: &Reference, manifest: &ImageManifest) -> Result<()> {
        let dir = self
            .manifests_dir
            .join(reference.domain())
            .join(reference.path());
        fs::create_dir_all(&dir).with_context(|| format!("Creating {dir}"))?;
        let path = dir.join(reference.tag());
        let json = serde_json::to_vec(manifest)?;
        // Stage and rename, same as the journal.
        let tmp = dir.join(format!("{}.tmp", reference.tag()));
        fs::write(&tmp, &json).with_context(|| format!("Writing {tmp}"))?;
        fs::rename(&tmp, &path).with_context(|| format!("Renaming {tmp}"))?;
        Ok(())
    }

    /// Enumerate stored images as `domain/path:tag` strings.
    #[context("Listing images")]
    pub fn list_images(&self) -> Result<Vec<String>> {
        let mut images = Vec::new();
        self.walk_manifests(&self.manifests_dir, &mut images)?;
        images.sort();
        Ok(images)
    }

    fn walk_manifests(&self, dir: &Utf8Path, images: &mut Vec<String>) -> Result<()> {
        for entry in dir
            .read_dir_utf8()
            .with_context(|| format!("Reading {dir}"))?
        {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                self.walk_manifests(path, images)?;
                continue;
            }
            let rel = path
                .strip_prefix(&self.manifests_dir)
                .expect("walk stays under the manifests dir");
            let mut components: Vec<&str> = rel.components().map(|c| c.as_str()).collect();
            // A manifest always lives below at least a domain directory.
            if components.len() < 2 {
                tracing::debug!("ignoring stray file {rel} in manifest store");
                continue;
            }
            let tag = components.pop().expect("at least two components");
            images.push(format!("{}:{tag}", components.join("/")));
        }
        Ok(())
    }

    /// Read the raw manifest JSON stored for `reference`.
    #[context("Reading manifest for {}", reference)]
    pub fn read_manifest(&self, reference: &Reference) -> Result<Vec<u8>> {
        let path = self
            .manifests_dir
            .join(reference.domain())
            .join(reference.path())
            .join(reference.tag());
        fs::read(&path).with_context(|| format!("Reading manifest {path}"))
    }

    /// Look up a stored image: read its manifest, load the referenced
    /// config blob, and derive the listing fields.
    #[context("Reading image {}", name)]
    pub fn image_info(&self, name: &str) -> Result<ImageInfo> {
        let reference = Reference::parse(name)?;
        let data = self.read_manifest(&reference)?;
        let manifest: ImageManifest =
            serde_json::from_slice(&data).context("Parsing manifest")?;

        let config_blob = self.read_blob(&manifest.config.digest.oci())?;
        let config: ImageConfiguration =
            serde_json::from_reader(BufReader::new(config_blob)).context("Parsing image config")?;

        let size = manifest.config.size + manifest.layers.iter().map(|l| l.size).sum::<u64>();
        Ok(ImageInfo {
            name: reference.name(),
            tag: reference.tag().to_string(),
            short_digest: manifest.config.digest.short().to_string(),
            size,
            created: config.created,
            config,
            manifest,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::{Descriptor, MediaType, SCHEMA_VERSION};
    use std::io::Cursor;

    const HELLO_HEX: &str = "185f8db32271fe25f561a6fc938b2e264306ec304eda518007d1764826381969";
    const EMPTY_HEX: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    fn tempcache() -> (tempfile::TempDir, Cache) {
        let td = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(td.path()).unwrap().join("cache");
        let cache = Cache::new(&dir).unwrap();
        (td, cache)
    }

    fn journal_entries(cache: &Cache) -> Vec<LayerEntry> {
        let data = fs::read(&cache.layers_file).unwrap();
        let parsed: LayersMetadata = serde_json::from_slice(&data).unwrap();
        parsed.layers
    }

    #[test]
    fn blob_roundtrip() -> Result<()> {
        let (_td, cache) = tempcache();
        let (digest, size) = cache.write_blob(Cursor::new(b"HELLO"))?;
        assert_eq!(digest.hex(), HELLO_HEX);
        assert_eq!(size, 5);
        assert!(cache.layers_dir.join(format!("sha256-{HELLO_HEX}")).is_file());

        for form in [
            format!("sha256:{HELLO_HEX}"),
            format!("sha256-{HELLO_HEX}"),
            HELLO_HEX.to_string(),
        ] {
            let mut data = Vec::new();
            cache.read_blob(&form)?.read_to_end(&mut data)?;
            assert_eq!(data, b"HELLO");
        }
        Ok(())
    }

    #[test]
    fn empty_blob() -> Result<()> {
        let (_td, cache) = tempcache();
        let (digest, size) = cache.write_blob(Cursor::new(b""))?;
        assert_eq!(digest.hex(), EMPTY_HEX);
        assert_eq!(size, 0);
        Ok(())
    }

    #[test]
    fn dedup_updates_journal() -> Result<()> {
        let (_td, cache) = tempcache();
        let (first, size1) = cache.write_blob(Cursor::new(b"HELLO"))?;
        let before = journal_entries(&cache);
        let (second, size2) = cache.write_blob(Cursor::new(b"HELLO"))?;
        assert_eq!(first, second);
        assert_eq!(size1, size2);

        let blobs: Vec<_> = cache
            .layers_dir
            .read_dir_utf8()?
            .filter_map(|e| {
                let name = e.unwrap().file_name().to_string();
                name.starts_with("sha256-").then_some(name)
            })
            .collect();
        assert_eq!(blobs.len(), 1);

        let after = journal_entries(&cache);
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].id, first.cache_id());
        assert_eq!(after[0].created, before[0].created);
        assert!(after[0].last_read >= before[0].last_read);
        Ok(())
    }

    #[test]
    fn journal_resets_on_corruption() -> Result<()> {
        let (_td, cache) = tempcache();
        cache.write_blob(Cursor::new(b"HELLO"))?;
        fs::write(&cache.layers_file, b"{ not json")?;
        cache.load_metadata()?;
        assert!(cache.metadata.read().unwrap().is_empty());

        fs::write(&cache.layers_file, br#"{"layers": null}"#)?;
        cache.load_metadata()?;
        assert!(cache.metadata.read().unwrap().is_empty());
        Ok(())
    }

    #[test]
    fn unregistered_blob_heals_on_rewrite() -> Result<()> {
        // Simulates a crash between the blob rename and the journal save.
        let (_td, cache) = tempcache();
        let blob_path = cache.layers_dir.join(format!("sha256-{HELLO_HEX}"));
        fs::write(&blob_path, b"HELLO")?;
        assert!(journal_entries(&cache).is_empty());

        let before = fs::metadata(&blob_path)?.modified()?;
        let (digest, size) = cache.write_blob(Cursor::new(b"HELLO"))?;
        assert_eq!(digest.hex(), HELLO_HEX);
        assert_eq!(size, 5);
        assert_eq!(fs::metadata(&blob_path)?.modified()?, before);
        let entries = journal_entries(&cache);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, digest.cache_id());
        Ok(())
    }

    #[test]
    fn concurrent_writers_single_entry() -> Result<()> {
        let td = tempfile::tempdir()?;
        let dir = Utf8Path::from_path(td.path()).unwrap().join("cache");
        // Two independent cache handles over the same directory, as two
        // processes would have.
        std::thread::scope(|s| {
            for _ in 0..2 {
                s.spawn(|| {
                    let cache = Cache::new(&dir).unwrap();
                    for _ in 0..10 {
                        cache.write_blob(Cursor::new(b"HELLO")).unwrap();
                    }
                });
            }
        });
        let cache = Cache::new(&dir)?;
        let entries = journal_entries(&cache);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, format!("sha256-{HELLO_HEX}"));
        Ok(())
    }

    #[test]
    fn manifest_and_listing() -> Result<()> {
        let (_td, cache) = tempcache();
        let config = ImageConfiguration::new("bootpack", "");
        let config_json = serde_json::to_vec(&config)?;
        let (config_digest, config_size) = cache.write_blob(Cursor::new(&config_json))?;
        let (layer_digest, layer_size) = cache.write_blob(Cursor::new(b"HELLO"))?;
        let manifest = ImageManifest {
            schema_version: SCHEMA_VERSION,
            media_type: MediaType::ImageManifest,
            config: Descriptor {
                media_type: MediaType::ImageConfig,
                digest: config_digest.clone(),
                size: config_size,
            },
            layers: vec![Descriptor {
                media_type: MediaType::BootloaderLayer,
                digest: layer_digest,
                size: layer_size,
            }],
        };
        let reference = Reference::parse("demo:1")?;
        cache.write_manifest(&reference, &manifest)?;
        assert!(cache
            .manifests_dir
            .join("docker.io/library/demo/1")
            .is_file());

        assert_eq!(cache.list_images()?, vec!["docker.io/library/demo:1"]);

        let info = cache.image_info("demo:1")?;
        assert_eq!(info.name, "docker.io/library/demo");
        assert_eq!(info.tag, "1");
        assert_eq!(info.short_digest, config_digest.short());
        assert_eq!(info.size, config_size + layer_size);
        assert_eq!(info.manifest.layers.len(), 1);
        assert_eq!(info.config.rootfs.diff_ids.len(), 0);
        Ok(())
    }
}
