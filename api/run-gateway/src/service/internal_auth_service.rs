use sha2::{Digest, Sha256};

pub const SIGNATURE_HEADER: &str = "x-internal-signature";

/// Hex `sha256(secret ":" body)` over the raw request body.
pub fn sign_internal_payload(body: &[u8], secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(b":");
    hasher.update(body);
    hex::encode(hasher.finalize())
}

pub fn verify_internal_signature(body: &[u8], signature_hex: &str, secret: &str) -> Result<(), String> {
    let expected = sign_internal_payload(body, secret);
    let provided = signature_hex.trim().to_ascii_lowercase();
    let matches = expected.len() == provided.len()
        && expected
            .bytes()
            .zip(provided.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0;
    if matches {
        Ok(())
    } else {
        Err("signature verification failed".to_string())
    }
}
