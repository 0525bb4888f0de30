//! Canonical encoding and hashing of protocol types.
//!
//! Both participants and the adjudicator must hash states to identical
//! digests, otherwise signatures would not be transferable between them. We
//! get a deterministic byte representation from canonical CBOR and hash it
//! with Keccak-256.

use serde::Serialize;
use sha3::{Digest, Keccak256};

use crate::types::Hash;

/// Deterministic byte encoding of a protocol value.
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Vec<u8> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf)
        .expect("CBOR encoding of an in-memory value into a Vec cannot fail");
    buf
}

/// Keccak-256 over the canonical encoding of `value`.
pub fn to_hash<T: Serialize>(value: &T) -> Hash {
    hash_bytes(&to_canonical_bytes(value))
}

/// Keccak-256 over raw bytes, used for document digests.
pub fn hash_bytes(data: &[u8]) -> Hash {
    Hash(Keccak256::digest(data).into())
}
