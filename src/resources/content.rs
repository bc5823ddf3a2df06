//! KL-011: Content resolution — turn a `ContentSpec` into raw bytes.

use crate::core::error::{Error, Result};
use crate::core::types::ContentSpec;

/// Resolve the bytes a content spec describes. Dispatch on `type` is case-insensitive.
pub fn resolve(spec: &ContentSpec) -> Result<Vec<u8>> {
    match spec.source_type.to_ascii_lowercase().as_str() {
        "string" => Ok(spec.string.as_bytes().to_vec()),
        "localsource" => std::fs::read(&spec.local_source).map_err(|e| {
            Error::io(
                format!("unable to read localSource file {}", spec.local_source),
                e,
            )
        }),
        "httpsource" => Err(Error::NotImplemented("httpSource content".to_string())),
        "secret" => Err(Error::NotImplemented("secret content".to_string())),
        other => Err(Error::InvalidSpec(format!("unknown content type '{}'", other))),
    }
}

/// BLAKE3 digest of content, `"blake3:{hex}"`. Used in logs in place of raw bytes.
pub fn digest(bytes: &[u8]) -> String {
    format!("blake3:{}", blake3::hash(bytes).to_hex())
}
