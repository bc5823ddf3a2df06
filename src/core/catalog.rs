//! KL-003: Catalog decoding.
//!
//! A catalog is a JSON (or YAML) array of resources. Each element's `kind`
//! (case-insensitive) selects the schema it is decoded with. Decoding stops
//! at the first bad element.

use super::error::{Error, Result};
use crate::resources::exec::Exec;
use crate::resources::file::File;
use crate::resources::SharedResource;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Resources in decode order. Order carries no scheduling meaning.
#[derive(Debug, Default)]
pub struct Catalog {
    pub resources: Vec<SharedResource>,
}

impl Catalog {
    pub fn from_resources(resources: Vec<SharedResource>) -> Self {
        Self { resources }
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

/// Read a catalog from disk. `.yaml`/`.yml` files are YAML, anything else JSON.
pub fn parse_catalog_file(path: &Path) -> Result<Catalog> {
    debug!(path = %path.display(), "loading catalog");
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::io(format!("unable to read {}", path.display()), e))?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => parse_catalog_yaml(&text),
        _ => parse_catalog(&text),
    }
}

/// Decode a JSON catalog.
pub fn parse_catalog(json: &str) -> Result<Catalog> {
    let value: Value = serde_json::from_str(json)
        .map_err(|e| Error::InvalidSpec(format!("JSON parse error: {}", e)))?;
    from_value(value)
}

/// Decode a YAML catalog (same shape as JSON).
pub fn parse_catalog_yaml(yaml: &str) -> Result<Catalog> {
    let value: Value = serde_yaml_ng::from_str(yaml)
        .map_err(|e| Error::InvalidSpec(format!("YAML parse error: {}", e)))?;
    from_value(value)
}

fn from_value(value: Value) -> Result<Catalog> {
    let elements = match value {
        Value::Array(elements) => elements,
        other => {
            return Err(Error::InvalidSpec(format!(
                "catalog must be an array of resources, got {}",
                json_type(&other)
            )))
        }
    };

    let mut catalog = Catalog::default();
    for (index, element) in elements.into_iter().enumerate() {
        let resource = decode_resource(index, element)?;
        debug!(resource = %resource.identity_key(), "added to catalog");
        catalog.resources.push(resource);
    }
    Ok(catalog)
}

/// Decode one catalog element according to its `kind`.
pub fn decode_resource(index: usize, element: Value) -> Result<SharedResource> {
    let kind = match element.get("kind") {
        Some(Value::String(kind)) => kind.to_ascii_lowercase(),
        Some(other) => {
            return Err(Error::InvalidSpec(format!(
                "resource #{}: kind must be a string, got {}",
                index,
                json_type(other)
            )))
        }
        None => {
            return Err(Error::InvalidSpec(format!(
                "resource #{}: missing key `kind`",
                index
            )))
        }
    };

    let invalid =
        |e: serde_json::Error| Error::InvalidSpec(format!("resource #{} ({}): {}", index, kind, e));
    match kind.as_str() {
        "file" => {
            let file: File = serde_json::from_value(element).map_err(invalid)?;
            Ok(Arc::new(file))
        }
        "exec" => {
            let exec: Exec = serde_json::from_value(element).map_err(invalid)?;
            Ok(Arc::new(exec))
        }
        other => Err(Error::InvalidSpec(format!(
            "resource #{}: kind '{}' not supported",
            index, other
        ))),
    }
}

fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
