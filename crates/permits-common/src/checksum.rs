//! Checksum utilities for raw snapshots and derived records

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::Result;

/// SHA-256 of an in-memory buffer, lowercase hex
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Content fingerprint of a serializable value.
///
/// Relies on struct field order being fixed by the type definition, so two
/// equal values always serialize to the same bytes.
pub fn fingerprint<T: Serialize>(value: &T) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(sha256_hex(&bytes))
}
