//! Configuration file loading.
//!
//! The configuration is TOML. Lookup order: an explicit path, the
//! `BOOTPACK_CONFIG` environment variable, `~/.config/bootpack.conf`,
//! `/etc/bootpack.conf`, and finally built-in defaults.

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::{Deserialize, Serialize};

const CONFIG_ENV: &str = "BOOTPACK_CONFIG";
const USER_CONFIG: &str = ".config/bootpack.conf";
const SYSTEM_CONFIG: &str = "/etc/bootpack.conf";

/// Path settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Paths {
    /// Root of the content-addressed image cache. A leading `~` refers to
    /// the user's home directory.
    pub cache_dir: String,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            cache_dir: "~/.local/share/bootpack/cache".to_string(),
        }
    }
}

/// The root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: Paths,
}

impl Config {
    /// Load the configuration, falling back to defaults when no file is
    /// found.
    #[context("Loading configuration")]
    pub fn load(path: Option<&Utf8Path>) -> Result<Self> {
        let path = match path {
            Some(path) => Some(path.to_owned()),
            None => find_config_file()?,
        };
        let Some(path) = path else {
            tracing::debug!("no configuration file found, using defaults");
            return Ok(Self::default());
        };
        let data =
            std::fs::read_to_string(&path).with_context(|| format!("Reading {path}"))?;
        toml::from_str(&data).with_context(|| format!("Parsing {path}"))
    }

    /// The cache directory, with `~` expanded.
    pub fn cache_dir(&self) -> Result<Utf8PathBuf> {
        expand_home(&self.paths.cache_dir)
    }
}

fn find_config_file() -> Result<Option<Utf8PathBuf>> {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        if !path.is_empty() {
            return Ok(Some(Utf8PathBuf::from(path)));
        }
    }
    let user = home_dir()?.join(USER_CONFIG);
    if user.is_file() {
        return Ok(Some(user));
    }
    let system = Utf8PathBuf::from(SYSTEM_CONFIG);
    if system.is_file() {
        return Ok(Some(system));
    }
    Ok(None)
}

fn home_dir() -> Result<Utf8PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| anyhow!("cannot determine home directory"))?;
    Utf8PathBuf::from_path_buf(home).map_err(|p| anyhow!("non-UTF-8 home directory {:?}", p))
}

/// Expand a leading `~` to the user's home directory.
fn expand_home(path: &str) -> Result<Utf8PathBuf> {
    if path == "~" {
        return home_dir();
    }
    if let Some(rest) = path.strip_prefix("~/") {
        return Ok(home_dir()?.join(rest));
    }
    Ok(Utf8PathBuf::from(path))
}
