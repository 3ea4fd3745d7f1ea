// src/utils/crypto.rs
//! Digest and text-encoding helpers.
//!
//! Uses SHA-256 (via `ring`) for every digest and the URL-safe base64 alphabet
//! for the qualified text forms that identifiers, salts and attachment counters
//! travel in. The leading characters of each qualified string are a type code;
//! this crate never interprets them beyond emitting the same codes consistently.

use rand::RngCore;
use ring::digest::{digest, SHA256};

const B64_ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// Computes a SHA-256 hash of the input data.
pub fn hash_data(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(digest(&SHA256, data).as_ref());
    out
}

/// Encodes `raw` behind a type `code`, padding the raw bytes on the left so the
/// code replaces exactly the pad characters.
fn qualify(code: &str, raw: &[u8]) -> String {
    let pad = code.len();
    let mut bytes = vec![0u8; pad];
    bytes.extend_from_slice(raw);
    let encoded = base64::encode_config(&bytes, base64::URL_SAFE_NO_PAD);
    format!("{}{}", code, &encoded[pad..])
}

/// Self-addressing digest of `data` (`E` code, 44 characters).
pub fn digest_qb64(data: &[u8]) -> String {
    qualify("E", &hash_data(data))
}

/// Sequence number as a 128-bit big-endian ordinal (`0A` code, 24 characters).
pub fn seqner_qb64(sn: u64) -> String {
    qualify("0A", &u128::from(sn).to_be_bytes())
}

/// Fresh 128-bit random salt, also used as a registry nonce and as the `u`
/// blinding field of credential data.
pub fn random_salt() -> String {
    let mut raw = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut raw);
    qualify("0A", &raw)
}

/// Big-endian base64 rendering of `value` in exactly `width` characters.
pub fn b64_int(mut value: u64, width: usize) -> String {
    let mut chars = vec![b'A'; width];
    for slot in chars.iter_mut().rev() {
        *slot = B64_ALPHABET[(value % 64) as usize];
        value /= 64;
    }
    String::from_utf8_lossy(&chars).into_owned()
}

/// Attachment group counter: two-character `code` followed by a two-character count.
pub fn counter(code: &str, count: usize) -> String {
    format!("{}{}", code, b64_int(count as u64, 2))
}
