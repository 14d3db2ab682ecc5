//! Docker-style image reference parsing and normalization.
//!
//! Shorthand references are expanded the same way `docker` expands them:
//! a bare `name` becomes `docker.io/library/name:latest`. Only normalized
//! references are ever stored in the cache.

use once_cell::sync::Lazy;
use regex::Regex;

const DEFAULT_DOMAIN: &str = "docker.io";
const LEGACY_DEFAULT_DOMAIN: &str = "index.docker.io";
const OFFICIAL_REPO_PREFIX: &str = "library";
const DEFAULT_TAG: &str = "latest";

static PATH_COMPONENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*$").unwrap());
static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9._-]{0,127}$").unwrap());

/// Reasons a string fails to parse as an image reference.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ReferenceError {
    /// The input was empty.
    #[error("image reference is empty")]
    Empty,
    /// The repository part is not a valid lowercase name.
    #[error("invalid image reference format: {0:?}")]
    InvalidFormat(String),
    /// The tag part contains characters outside the tag grammar.
    #[error("invalid tag in image reference: {0:?}")]
    InvalidTag(String),
}

/// A fully normalized image reference, `domain/path:tag`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    domain: String,
    path: String,
    tag: String,
}

impl Reference {
    /// Parse and normalize a reference, supplying the default registry
    /// domain, the `library/` prefix for official-style names, and the
    /// default tag where the input omits them.
    pub fn parse(s: &str) -> Result<Self, ReferenceError> {
        if s.is_empty() {
            return Err(ReferenceError::Empty);
        }
        // Digest references have no home in the cache layout.
        if s.contains('@') {
            return Err(ReferenceError::InvalidFormat(s.to_string()));
        }

        // A colon after the last slash separates the tag.
        let (name, tag) = match s.rsplit_once(':') {
            Some((name, tag)) if !tag.contains('/') => (name, tag.to_string()),
            _ => (s, DEFAULT_TAG.to_string()),
        };

        let (domain, path) = split_domain(name);
        if path.is_empty()
            || !path
                .split('/')
                .all(|component| PATH_COMPONENT.is_match(component))
        {
            return Err(ReferenceError::InvalidFormat(s.to_string()));
        }
        if !TAG.is_match(&tag) {
            return Err(ReferenceError::InvalidTag(tag));
        }

        Ok(Self { domain, path, tag })
    }

    /// The registry domain.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The repository path below the domain, `/`-separated.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The tag.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// The repository name without the tag, `domain/path`.
    pub fn name(&self) -> String {
        format!("{}/{}", self.domain, self.path)
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.domain, self.path, self.tag)
    }
}

impl std::str::FromStr for Reference {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Split a repository name into domain and remainder, defaulting the domain.
///
/// Mirrors the normalization rules used by the docker distribution
/// reference grammar: the first component is only a domain if it looks like
/// a hostname (contains `.` or `:`) or is `localhost`.
fn split_domain(name: &str) -> (String, String) {
    let (mut domain, mut remainder) = match name.split_once('/') {
        None => (DEFAULT_DOMAIN.to_string(), name.to_string()),
        Some((left, right)) => {
            if !(left.contains('.') || left.contains(':')) && left != "localhost" {
                (DEFAULT_DOMAIN.to_string(), name.to_string())
            } else {
                (left.to_string(), right.to_string())
            }
        }
    };
    if domain == LEGACY_DEFAULT_DOMAIN {
        domain = DEFAULT_DOMAIN.to_string();
    }
    if domain == DEFAULT_DOMAIN && !remainder.contains('/') {
        remainder = format!("{OFFICIAL_REPO_PREFIX}/{remainder}");
    }
    (domain, remainder)
}
