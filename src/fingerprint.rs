//! Content fingerprints.
//!
//! A fingerprint is the MD5 digest of a byte buffer rendered as 32 lower-case
//! hex characters. Lookup tables written by earlier tooling use the same
//! encoding, so fingerprints computed here can be matched against them
//! directly.

use anyhow::{Context, Result};
use md5::{Digest, Md5};
use std::path::Path;

/// Length of a hex-encoded fingerprint.
pub const FINGERPRINT_LEN: usize = 32;

/// Fingerprint an in-memory buffer.
pub fn fingerprint_bytes(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Read a file fully and fingerprint its contents.
pub fn fingerprint_file(path: &Path) -> Result<String> {
    let data = std::fs::read(path)
        .with_context(|| format!("Failed to read file for fingerprinting: {}", path.display()))?;
    Ok(fingerprint_bytes(&data))
}

/// Returns true if `s` has the shape of a fingerprint (32 lower-case hex digits).
pub fn is_fingerprint(s: &str) -> bool {
    s.len() == FINGERPRINT_LEN && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
