//! End-to-end tests driving the full build pipeline against a mock
//! container backend.

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use indoc::indoc;
use std::io::Read;

use bootpack_lib::backend::{BackendError, ContainerBackend};
use bootpack_lib::build::{bootfile, Builder};
use bootpack_lib::cache::Cache;
use bootpack_lib::export::export_image;
use bootpack_lib::fixture::{tar_with_file, MockBackend};
use bootpack_lib::reference::Reference;

/// SHA-256 of the bytes `HELLO`.
const HELLO_HEX: &str = "185f8db32271fe25f561a6fc938b2e264306ec304eda518007d1764826381969";

fn assert_err_contains<T>(r: Result<T>, s: impl AsRef<str>) {
    let s = s.as_ref();
    let msg = format!("{:#}", r.err().unwrap());
    if !msg.contains(s) {
        panic!(r#"Error message "{}" did not contain "{}""#, msg, s);
    }
}

struct Fixture {
    _td: tempfile::TempDir,
    context_dir: Utf8PathBuf,
    cache: Cache,
}

impl Fixture {
    fn new() -> Result<Self> {
        let td = tempfile::tempdir()?;
        let root = Utf8Path::from_path(td.path()).unwrap();
        let context_dir = root.join("ctx");
        std::fs::create_dir_all(context_dir.join("bootloader"))?;
        std::fs::create_dir_all(context_dir.join("wasm"))?;
        std::fs::write(
            context_dir.join("bootloader/Dockerfile"),
            "FROM scratch AS dist\n",
        )?;
        std::fs::write(context_dir.join("wasm/Dockerfile"), "FROM scratch AS dist\n")?;
        let cache = Cache::new(&root.join("cache"))?;
        Ok(Self {
            _td: td,
            context_dir,
            cache,
        })
    }

    async fn build(&self, backend: &dyn ContainerBackend, tag: &str, source: &str) -> Result<()> {
        let steps = bootfile::parse_str(source)?;
        Builder::new(
            &self.cache,
            backend,
            &self.context_dir,
            Reference::parse(tag)?,
            source,
        )?
        .build(steps)
        .await
    }

    fn blob_files(&self) -> Vec<String> {
        let layers_dir = self._td.path().join("cache/layers");
        let mut names: Vec<String> = std::fs::read_dir(layers_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("sha256-"))
            .collect();
        names.sort();
        names
    }
}

/// A Bootfile of only metadata steps produces an image with a config blob
/// and no layers.
#[tokio::test]
async fn scratch_build_without_bootloader() -> Result<()> {
    let f = Fixture::new()?;
    let backend = MockBackend::returning_layers(&[])?;
    let source = indoc! {"
        - ARG: V=1
        - VERSION: ${V}.0
        - FROM: scratch
    "};
    f.build(&backend, "demo:1", source).await?;

    // The manifest landed under the normalized reference
    let manifest_path = fixture_path(&f, "cache/manifests/docker.io/library/demo/1");
    assert!(manifest_path.is_file());

    let info = f.cache.image_info("demo:1")?;
    assert_eq!(info.manifest.layers.len(), 0);
    assert_eq!(info.config.rootfs.diff_ids.len(), 0);
    assert_eq!(info.config.layer_meta.len(), 0);
    assert_eq!(info.config.config.bootfile_state, source);

    // Exactly one blob: the config
    let blobs = f.blob_files();
    assert_eq!(blobs.len(), 1);
    assert_eq!(blobs[0], format!("sha256-{}", info.manifest.config.digest.hex()));
    Ok(())
}

fn fixture_path(f: &Fixture, rel: &str) -> Utf8PathBuf {
    Utf8Path::from_path(f._td.path()).unwrap().join(rel)
}

const BOOTLOADER_SOURCE: &str = indoc! {"
    - FROM: scratch
    - BOOTLOADER:
        type: u-boot
        selector: mmc
        version: 2024.01
        build: bootloader
        build_wasm: wasm
"};

/// A single BOOTLOADER step: the layer lands in the cache under its
/// content digest and is recorded in manifest, diff IDs, and layer meta.
#[tokio::test]
async fn single_bootloader_layer() -> Result<()> {
    let f = Fixture::new()?;
    let wasm_layer = tar_with_file("payload.wasm", b"\0asm")?;
    let backend = MockBackend::returning_layers(&[&wasm_layer[..], b"HELLO"])?;
    f.build(&backend, "demo:1", BOOTLOADER_SOURCE).await?;

    assert!(fixture_path(&f, &format!("cache/layers/sha256-{HELLO_HEX}")).is_file());

    let info = f.cache.image_info("demo:1")?;
    assert_eq!(info.manifest.layers.len(), 1);
    let layer = &info.manifest.layers[0];
    assert_eq!(layer.digest.oci(), format!("sha256:{HELLO_HEX}"));
    assert_eq!(layer.size, 5);

    assert_eq!(info.config.rootfs.diff_ids.len(), 1);
    assert_eq!(info.config.rootfs.diff_ids[0], layer.digest);
    assert_eq!(info.config.layer_meta.len(), 1);
    let meta = &info.config.layer_meta[0];
    assert_eq!(meta.selector.as_deref(), Some("mmc"));
    assert_eq!(meta.version.as_deref(), Some("2024.01"));
    assert_eq!(meta.location, None);

    // The bootloader build context received the context files plus the
    // spliced wasm layer under wasm/
    let contexts = backend.contexts.lock().unwrap();
    assert_eq!(contexts.len(), 2);
    let names = tar_entry_names(&contexts[1]);
    assert!(names.contains(&"Dockerfile".to_string()), "{names:?}");
    assert!(names.contains(&"wasm/payload.wasm".to_string()), "{names:?}");
    Ok(())
}

fn tar_entry_names(buf: &[u8]) -> Vec<String> {
    let mut archive = tar::Archive::new(std::io::Cursor::new(buf));
    let entries = archive.entries().unwrap();
    entries
        .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
        .collect()
}

/// Two BOOTLOADER steps producing identical bytes share one blob.
#[tokio::test]
async fn identical_layers_deduplicate() -> Result<()> {
    let f = Fixture::new()?;
    let source = indoc! {"
        - FROM: scratch
        - BOOTLOADER:
            type: u-boot
            build: bootloader
            build_wasm: wasm
        - BOOTLOADER:
            type: u-boot
            build: bootloader
            build_wasm: wasm
    "};
    let wasm_layer = tar_with_file("payload.wasm", b"\0asm")?;
    let backend = MockBackend::returning_layers(&[
        &wasm_layer[..],
        b"HELLO",
        &wasm_layer[..],
        b"HELLO",
    ])?;
    f.build(&backend, "demo:dedup", source).await?;

    let info = f.cache.image_info("demo:dedup")?;
    assert_eq!(info.manifest.layers.len(), 2);
    assert_eq!(info.manifest.layers[0].digest, info.manifest.layers[1].digest);
    assert_eq!(info.manifest.layers[0].size, info.manifest.layers[1].size);
    assert_eq!(info.config.rootfs.diff_ids.len(), 2);
    assert_eq!(info.config.layer_meta.len(), 2);

    // One layer blob plus the config blob
    assert_eq!(f.blob_files().len(), 2);
    Ok(())
}

/// A backend failure aborts the build: the error surfaces the backend's
/// message and nothing is persisted.
#[tokio::test]
async fn backend_failure_is_isolated() -> Result<()> {
    let f = Fixture::new()?;
    let backend = MockBackend::failing("boom");
    let result = f.build(&backend, "demo:1", BOOTLOADER_SOURCE).await;

    let err = result.unwrap_err();
    assert!(
        matches!(
            err.downcast_ref::<BackendError>(),
            Some(BackendError::Build(msg)) if msg == "boom"
        ),
        "{err:#}"
    );
    assert!(format!("{err:#}").contains("boom"));

    assert_eq!(f.cache.list_images()?, Vec::<String>::new());
    assert_eq!(f.blob_files().len(), 0);
    Ok(())
}

/// Unsupported bootloader types and source kinds fail before any backend
/// call.
#[tokio::test]
async fn unsupported_bootloader_variants() -> Result<()> {
    let f = Fixture::new()?;
    // Failing before the type/source checks would produce "unreachable"
    let backend = MockBackend::failing("unreachable");

    let r = f
        .build(
            &backend,
            "demo:1",
            "- BOOTLOADER:\n    type: ipxe\n    build: bootloader\n",
        )
        .await;
    assert_err_contains(r, r#"bootloader type "ipxe" is not supported"#);

    let r = f
        .build(
            &backend,
            "demo:1",
            "- BOOTLOADER:\n    type: u-boot\n    from_wasm: registry/x\n    build: bootloader\n",
        )
        .await;
    assert_err_contains(r, "not implemented");
    assert_eq!(f.cache.list_images()?, Vec::<String>::new());
    Ok(())
}

/// The exported archive references exactly the cached blobs and carries
/// the input name as the ref-name annotation.
#[tokio::test]
async fn export_round_trip() -> Result<()> {
    let f = Fixture::new()?;
    let wasm_layer = tar_with_file("payload.wasm", b"\0asm")?;
    let backend = MockBackend::returning_layers(&[&wasm_layer[..], b"HELLO"])?;
    f.build(&backend, "demo:1", BOOTLOADER_SOURCE).await?;

    let archive = export_image(&f.cache, "demo:1", Vec::new())?;

    let mut entries = std::collections::HashMap::new();
    let mut tar = tar::Archive::new(std::io::Cursor::new(&archive));
    for entry in tar.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        entries.insert(name, data);
    }

    assert_eq!(
        entries["oci-layout"],
        br#"{"imageLayoutVersion":"1.0.0"}"#.to_vec()
    );
    assert_eq!(entries[&format!("blobs/sha256/{HELLO_HEX}")], b"HELLO");

    let info = f.cache.image_info("demo:1")?;
    let config_hex = info.manifest.config.digest.hex();
    let mut cached_config = Vec::new();
    f.cache
        .read_blob(config_hex)?
        .read_to_end(&mut cached_config)?;
    similar_asserts::assert_eq!(
        entries[&format!("blobs/sha256/{config_hex}")].as_slice(),
        cached_config.as_slice()
    );

    let index: serde_json::Value = serde_json::from_slice(&entries["index.json"])?;
    assert_eq!(
        index["manifests"][0]["annotations"]["org.opencontainers.image.ref.name"],
        "demo:1"
    );
    let manifest_digest = index["manifests"][0]["digest"].as_str().unwrap();
    let manifest_hex = manifest_digest.strip_prefix("sha256:").unwrap();
    let embedded = &entries[&format!("blobs/sha256/{manifest_hex}")];
    assert_eq!(embedded, &f.cache.read_manifest(&Reference::parse("demo:1")?)?);
    Ok(())
}
