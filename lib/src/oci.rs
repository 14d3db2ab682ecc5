//! Typed model for the OCI image objects we produce: manifests, image
//! configurations, and the vendor extension carrying bootloader layer
//! metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// OCI image manifest schema version.
pub const SCHEMA_VERSION: u32 = 2;

/// Media types used by the bootpack image objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaType {
    /// The OCI image manifest.
    #[serde(rename = "application/vnd.oci.image.manifest.v1+json")]
    ImageManifest,
    /// The OCI image configuration.
    #[serde(rename = "application/vnd.oci.image.config.v1+json")]
    ImageConfig,
    /// Vendor media type for a bootloader payload layer.
    #[serde(rename = "application/vnd.oci.image.layer.bootloader.v1+json")]
    BootloaderLayer,
}

/// Errors from parsing a digest string.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum DigestError {
    /// The algorithm prefix was not sha256.
    #[error("unsupported digest algorithm in {0:?}")]
    UnsupportedAlgorithm(String),
    /// The hex portion was not 64 lowercase hex characters.
    #[error("invalid sha256 hex in digest {0:?}")]
    InvalidHex(String),
}

/// A SHA-256 content digest.
///
/// This is one logical identifier with two wire projections: the OCI form
/// `sha256:<hex>` used inside manifests and configs, and the filesystem-safe
/// form `sha256-<hex>` used for blob filenames in the cache. Only the hex is
/// stored; the projections are derived on demand.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    hex: String,
}

impl Digest {
    /// Wrap a known-good lowercase hex sha256.
    pub fn from_sha256_hex(hex: impl Into<String>) -> Result<Self, DigestError> {
        let hex = hex.into();
        if hex.len() != 64 || !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(DigestError::InvalidHex(hex));
        }
        Ok(Self { hex })
    }

    /// Parse any of the accepted forms: `sha256:<hex>`, `sha256-<hex>`, or
    /// bare `<hex>`.
    pub fn parse(s: &str) -> Result<Self, DigestError> {
        let hex = match s.split_once(['-', ':']) {
            Some(("sha256", hex)) => hex,
            Some((algo, _)) => return Err(DigestError::UnsupportedAlgorithm(algo.to_string())),
            None => s,
        };
        Self::from_sha256_hex(hex)
    }

    /// The raw lowercase hex.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// The OCI wire form, `sha256:<hex>`.
    pub fn oci(&self) -> String {
        format!("sha256:{}", self.hex)
    }

    /// The blob filename form, `sha256-<hex>`.
    pub fn cache_id(&self) -> String {
        format!("sha256-{}", self.hex)
    }

    /// The abbreviated hex used in image listings.
    pub fn short(&self) -> &str {
        &self.hex[..12]
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sha256:{}", self.hex)
    }
}

impl std::str::FromStr for Digest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Digest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.oci())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// A content descriptor referencing a blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: MediaType,
    pub digest: Digest,
    pub size: u64,
}

/// An OCI image manifest: one config descriptor plus ordered layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageManifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType")]
    pub media_type: MediaType,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

/// The nested `config` object of the image configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// The Bootfile source that produced the image.
    pub bootfile_state: String,
}

/// The rootfs section: layer diff IDs in manifest order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub typ: String,
    pub diff_ids: Vec<Digest>,
}

impl Default for RootFs {
    fn default() -> Self {
        Self {
            typ: "layers".to_string(),
            diff_ids: Vec::new(),
        }
    }
}

/// Vendor extension record paired 1:1 with the manifest's layers.
///
/// The optional fields are serialized as `null` when absent so the records
/// always have the same shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerMeta {
    pub media_type: MediaType,
    pub selector: Option<String>,
    pub version: Option<String>,
    pub location: Option<String>,
}

/// The OCI image configuration, extended with per-layer bootloader metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfiguration {
    pub created: DateTime<Utc>,
    pub author: String,
    pub os: String,
    pub config: Config,
    pub rootfs: RootFs,
    pub layer_meta: Vec<LayerMeta>,
}

impl ImageConfiguration {
    /// A new configuration for a linux image with no layers yet.
    pub fn new(author: impl Into<String>, bootfile_state: impl Into<String>) -> Self {
        Self {
            created: Utc::now(),
            author: author.into(),
            os: "linux".to_string(),
            config: Config {
                bootfile_state: bootfile_state.into(),
            },
            rootfs: RootFs::default(),
            layer_meta: Vec::new(),
        }
    }
}
