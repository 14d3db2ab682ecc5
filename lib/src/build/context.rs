//! Per-build scratchpad state.

use std::collections::HashMap;

use camino::Utf8PathBuf;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::reference::Reference;

static VAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\{?(\w+)\}?").unwrap());

/// Mutable state for one build: the Bootfile's directory, the normalized
/// image reference, declared variables, and the optional version. Created
/// at build start, discarded when the build ends.
#[derive(Debug)]
pub struct BuildContext {
    pub dir: Utf8PathBuf,
    pub tag: Reference,
    pub vars: HashMap<String, String>,
    pub version: Option<String>,
}

impl BuildContext {
    pub fn new(dir: Utf8PathBuf, tag: Reference) -> Self {
        Self {
            dir,
            tag,
            vars: HashMap::new(),
            version: None,
        }
    }

    /// Replace every `$NAME` or `${NAME}` with the variable's value;
    /// unknown names substitute to the empty string. There is no escape
    /// syntax and no recursive expansion.
    pub fn substitute(&self, s: &str) -> String {
        VAR.replace_all(s, |caps: &Captures| {
            self.vars.get(&caps[1]).cloned().unwrap_or_default()
        })
        .into_owned()
    }
}
