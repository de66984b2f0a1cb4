//! SHA-256 helpers for deploy digests.

use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of `bytes`, with CRLF normalized to LF so the
/// digest of a manifest does not depend on the checkout's line endings.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    let mut start = 0;
    for (i, window) in bytes.windows(2).enumerate() {
        if window == b"\r\n" {
            hasher.update(&bytes[start..i]);
            start = i + 1;
        }
    }
    hasher.update(&bytes[start..]);
    hex::encode(hasher.finalize())
}
