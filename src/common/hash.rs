//! Content fingerprints
//!
//! BLAKE3 is used to fingerprint rendered config and pod templates so that a
//! change can be detected without diffing whole objects.

use serde::Serialize;

/// Compute BLAKE3 hash of data, return hex string
pub fn blake3_hash(data: &[u8]) -> String {
    let hash = blake3::hash(data);
    format!("{}", hash)
}

/// Short fingerprint used as a name suffix (first 8 hex chars)
pub fn short_hash(data: &[u8]) -> String {
    blake3_hash(data)[..8].to_string()
}

/// Fingerprint of any serializable value (its canonical JSON encoding)
pub fn fingerprint<T: Serialize>(value: &T) -> crate::Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(blake3_hash(&bytes))
}
