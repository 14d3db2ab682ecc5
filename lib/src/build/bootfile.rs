//! Bootfile parsing.
//!
//! A Bootfile is a YAML sequence of single-entry mappings, one per step.
//! Decoding normalizes mapping keys to strings, validates the document
//! against a built-in JSON schema, and yields the steps in source order.

use anyhow::Result;
use camino::Utf8Path;
use fn_error_context::context;
use once_cell::sync::Lazy;

/// One Bootfile instruction, in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub command: String,
    pub args: serde_json::Value,
}

/// Errors from reading a Bootfile.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// Reading the file failed.
    #[error("failed to read bootfile: {0}")]
    Read(#[from] std::io::Error),
    /// The document is not well-formed YAML.
    #[error("malformed YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    /// The document decodes to nothing, or to an empty sequence.
    #[error("bootfile is empty")]
    Empty,
    /// A mapping key is not a YAML scalar.
    #[error("non-string mapping key at {path}")]
    NonStringKey { path: String },
    /// The document does not match the step schema.
    #[error("bootfile does not match schema: {0}")]
    Schema(String),
}

static VALIDATOR: Lazy<jsonschema::Validator> = Lazy::new(|| {
    jsonschema::validator_for(&bootfile_schema()).expect("builtin bootfile schema compiles")
});

/// The built-in schema describing the allowed step shapes.
fn bootfile_schema() -> serde_json::Value {
    let build = serde_json::json!({
        "oneOf": [
            { "type": "string" },
            {
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "dockerfile": { "type": "string" },
                    "dockerfile_inline": { "type": "string" },
                    "target": { "type": "string" },
                    "context": { "type": "string" },
                    "args": {
                        "type": "object",
                        "additionalProperties": { "type": "string" }
                    }
                }
            }
        ]
    });
    serde_json::json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "array",
        "items": {
            "type": "object",
            "minProperties": 1,
            "maxProperties": 1,
            "additionalProperties": false,
            "properties": {
                "ARG": { "type": "string" },
                "FROM": { "type": "string" },
                "VERSION": { "type": "string" },
                "BOOTLOADER": {
                    "type": "object",
                    "required": ["type"],
                    "additionalProperties": false,
                    "properties": {
                        "type": { "type": "string" },
                        "selector": { "type": "string" },
                        "version": { "type": "string" },
                        "from": { "type": "string" },
                        "from_local": { "type": "string" },
                        "location": { "type": "string" },
                        "build": build,
                        "from_wasm": { "type": "string" },
                        "from_local_wasm": { "type": "string" },
                        "location_wasm": { "type": "string" },
                        "build_wasm": build
                    }
                }
            }
        }
    })
}

/// Parse the Bootfile at `path` into the ordered step list.
#[context("Parsing bootfile {}", path)]
pub fn parse(path: &Utf8Path) -> Result<Vec<Step>> {
    let source = std::fs::read_to_string(path).map_err(ParseError::Read)?;
    parse_str(&source)
}

/// Parse Bootfile source text into the ordered step list.
pub fn parse_str(source: &str) -> Result<Vec<Step>> {
    if source.trim().is_empty() {
        return Err(ParseError::Empty.into());
    }
    let doc: serde_yaml::Value = serde_yaml::from_str(source).map_err(ParseError::Yaml)?;
    if matches!(doc, serde_yaml::Value::Null) {
        return Err(ParseError::Empty.into());
    }
    let doc = normalize(doc, &mut Vec::new())?;

    let errors: Vec<String> = VALIDATOR.iter_errors(&doc).map(|e| e.to_string()).collect();
    if !errors.is_empty() {
        return Err(ParseError::Schema(errors.join("; ")).into());
    }

    // The schema guarantees a sequence of single-entry mappings.
    let serde_json::Value::Array(items) = doc else {
        return Err(ParseError::Schema("top level must be a sequence".to_string()).into());
    };
    let mut steps = Vec::new();
    for item in items {
        let serde_json::Value::Object(map) = item else {
            continue;
        };
        for (command, args) in map {
            steps.push(Step { command, args });
        }
    }
    if steps.is_empty() {
        return Err(ParseError::Empty.into());
    }
    Ok(steps)
}

/// Convert decoded YAML to JSON, coercing scalar mapping keys to strings.
/// `path` carries the dotted location (with sequence indices) for error
/// reporting.
fn normalize(
    value: serde_yaml::Value,
    path: &mut Vec<String>,
) -> Result<serde_json::Value, ParseError> {
    use serde_json::Value as Json;
    use serde_yaml::Value as Yaml;
    Ok(match value {
        Yaml::Null => Json::Null,
        Yaml::Bool(b) => Json::Bool(b),
        Yaml::Number(n) => {
            if let Some(i) = n.as_i64() {
                Json::from(i)
            } else if let Some(u) = n.as_u64() {
                Json::from(u)
            } else if let Some(f) = n.as_f64() {
                serde_json::Number::from_f64(f)
                    .map(Json::Number)
                    .ok_or_else(|| ParseError::Schema(format!("unrepresentable number at {}", dotted(path))))?
            } else {
                return Err(ParseError::Schema(format!(
                    "unrepresentable number at {}",
                    dotted(path)
                )));
            }
        }
        Yaml::String(s) => Json::String(s),
        Yaml::Sequence(seq) => {
            let mut items = Vec::with_capacity(seq.len());
            for (i, item) in seq.into_iter().enumerate() {
                path.push(i.to_string());
                items.push(normalize(item, path)?);
                path.pop();
            }
            Json::Array(items)
        }
        Yaml::Mapping(map) => {
            let mut object = serde_json::Map::new();
            for (key, val) in map {
                let key = match key {
                    Yaml::String(s) => s,
                    Yaml::Bool(b) => b.to_string(),
                    Yaml::Number(n) => n.to_string(),
                    _ => {
                        return Err(ParseError::NonStringKey {
                            path: dotted(path),
                        })
                    }
                };
                path.push(key.clone());
                let val = normalize(val, path)?;
                path.pop();
                object.insert(key, val);
            }
            Json::Object(object)
        }
        Yaml::Tagged(tagged) => normalize(tagged.value, path)?,
    })
}

fn dotted(path: &[String]) -> String {
    if path.is_empty() {
        "<root>".to_string()
    } else {
        path.join(".")
    }
}
