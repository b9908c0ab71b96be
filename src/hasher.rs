use crate::{
    canonical::{digest_text, to_hex},
    error::Result,
};
use serde_json::Value;
use sha2::{Digest, Sha256, Sha512};

/// Reserved key carrying a document's own digest.
pub const HASH_KEY: &str = "sbg:hash";

/// Digest of an app document.
///
/// A string already stored under [`HASH_KEY`] wins over recomputation so
/// documents stamped by other tools keep their identity. Otherwise the
/// SHA-512 of the sorted-key text of the whole document is returned.
pub fn app_digest(document: &Value) -> Result<String> {
    if let Some(Value::String(embedded)) = document.get(HASH_KEY) {
        return Ok(embedded.clone());
    }
    let text = digest_text(document)?;
    Ok(to_hex(&Sha512::digest(text.as_bytes())))
}

/// Store the document's digest under [`HASH_KEY`] and return it.
pub fn stamp_digest(document: &mut Value) -> Result<String> {
    let digest = app_digest(document)?;
    if let Value::Object(map) = document {
        map.insert(HASH_KEY.to_string(), Value::String(digest.clone()));
    }
    Ok(digest)
}

/// Short fingerprint of a job document, used to label tasks.
pub fn job_fingerprint(job: &Value) -> Result<String> {
    let text = digest_text(job)?;
    let mut hex = to_hex(&Sha256::digest(text.as_bytes()));
    hex.truncate(10);
    Ok(hex)
}
