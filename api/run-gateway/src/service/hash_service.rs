use serde_json::Value;
use sha2::{Digest, Sha256};

pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Digest over the canonical JSON of an input/output pair. `serde_json`
/// keeps object keys sorted, so equal content always hashes the same.
pub fn content_hash(input: Option<&Value>, output: Option<&Value>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"in:");
    if let Some(v) = input {
        hasher.update(v.to_string().as_bytes());
    }
    hasher.update(b"|out:");
    if let Some(v) = output {
        hasher.update(v.to_string().as_bytes());
    }
    format!("sha256:{}", hex::encode(hasher.finalize()))
}
