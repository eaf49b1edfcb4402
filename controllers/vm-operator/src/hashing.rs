//! Content hashes for generated objects

use std::fmt::Write;

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Hex encoded SHA-256 of `bytes`
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

/// Hash of the JSON serialization of `value`
///
/// k8s-openapi types serialize fields in declaration order and maps as
/// `BTreeMap`, so equal values always produce equal bytes.
pub fn json_hash<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    Ok(sha256_hex(&serde_json::to_vec(value)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
