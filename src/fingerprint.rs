//! Request fingerprints.
//!
//! A fingerprint names one derived image: the source path as the caller wrote
//! it, the transform spec, and an optional caller token. It is a SHA-256
//! digest, so two requests share a cache entry exactly when all three inputs
//! agree.
//!
//! The spec is hashed in its parsed, typed form (see
//! [`Operation::hash_into`](crate::transform::Operation)), never as raw JSON.
//! Whitespace, key spelling (`scale_and_crop` vs `scaleAndCrop`) and the
//! scalar-vs-object form of a parameter therefore do not affect the result,
//! while operation order and every parameter value do.
//!
//! Every variable-length field is length-prefixed, so no two different inputs
//! can concatenate to the same byte stream. The token carries a presence byte:
//! no token and an empty token are different requests.

use crate::transform::TransformSpec;
use sha2::{Digest, Sha256};
use std::fmt;

/// Domain tag, bumped if the encoding below ever changes.
const DOMAIN: &[u8] = b"thumbstore/v1\0";

/// A 256-bit request fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lower-case hex, 64 characters.
    pub fn hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Shard directory name: the first hex digit.
    pub fn shard(&self) -> char {
        char::from(b"0123456789abcdef"[(self.0[0] >> 4) as usize])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Fingerprint a request.
pub fn fingerprint(source: &str, spec: &TransformSpec, token: Option<&str>) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(DOMAIN);

    hasher.update((source.len() as u64).to_le_bytes());
    hasher.update(source.as_bytes());

    hasher.update((spec.len() as u64).to_le_bytes());
    for op in spec.operations() {
        op.hash_into(&mut hasher);
    }

    match token {
        Some(token) => {
            hasher.update(b"\x01");
            hasher.update((token.len() as u64).to_le_bytes());
            hasher.update(token.as_bytes());
        }
        None => hasher.update(b"\x00"),
    }

    let mut digest = [0u8; 32];
    digest.copy_from_slice(&hasher.finalize());
    Fingerprint(digest)
}
