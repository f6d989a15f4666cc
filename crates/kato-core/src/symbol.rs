//! Symbols and events (§3, §4.1).
//!
//! A symbol is an atomic string token, possibly of the form `VCTR|<hex>` when
//! derived from a dense vector. An event is an ordered tuple of symbols,
//! stored in alphanumeric (bytewise) order once canonicalized.

use sha1::{Digest, Sha1};

/// One event: an ordered tuple of symbols.
pub type Event = Vec<String>;

/// Sorts an event's symbols bytewise (alphanumeric, case-sensitive), in place.
pub fn sort_event(event: &mut Event) {
    event.sort_unstable();
}

/// Returns the lower-hex SHA-1 of `bytes`.
pub fn sha1_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Canonical byte form of a dense vector: the IEEE-754 big-endian bytes of
/// each component, concatenated in order. Deterministic across runs for a
/// given sequence of `f64` values (NaN/Inf are rejected by input validation
/// before this is ever called).
pub fn canonical_vector_bytes(vector: &[f64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vector.len() * 8);
    for component in vector {
        out.extend_from_slice(&component.to_be_bytes());
    }
    out
}

/// Derives the `VCTR|<hex>` symbol for a dense vector (§4.1).
pub fn vector_symbol(vector: &[f64]) -> String {
    format!("VCTR|{}", sha1_hex(&canonical_vector_bytes(vector)))
}
