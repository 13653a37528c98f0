// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use digest::Digest;
use static_assertions::const_assert_eq;

/// Width in bytes of a `SimpleDigest`'s hash portion (the SHA-256 width, the maximum permitted
/// hash length among `digest::HashFunction` variants). Fresh on-disk record, grounded in
/// `spec.md` §3; no teacher analogue (the teacher's `Digest` is never serialized to disk).
pub const HASH_WIDTH: usize = 32;

/// Total width of a `SimpleDigest` record: 32-byte (padded/truncated) hash ‖ 4-byte LE size.
pub const SIMPLE_DIGEST_WIDTH: usize = HASH_WIDTH + 4;

/// Total width of an `OffsetRecord`: `SimpleDigest` (36) ‖ `attempt:u32 LE` (4) ‖ `offset:u64 LE`
/// (8) ‖ `length:u64 LE` (8).
pub const OFFSET_RECORD_WIDTH: usize = SIMPLE_DIGEST_WIDTH + 4 + 8 + 8;

const_assert_eq!(SIMPLE_DIGEST_WIDTH, 36);
const_assert_eq!(OFFSET_RECORD_WIDTH, 52);

/// The fixed-width on-disk digest used exclusively inside the circular offset file
/// (`spec.md` §3). Two distinct source digests **may** collide at this level -- offset-file
/// records are advisory, validated against the data-file cursors, never treated as proof of
/// identity on their own.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SimpleDigest {
    hash: [u8; HASH_WIDTH],
    size: u32,
}

impl SimpleDigest {
    pub fn from_digest(digest: &Digest) -> Self {
        let mut hash = [0u8; HASH_WIDTH];
        let src = digest.hash_bytes.as_ref();
        let n = src.len().min(HASH_WIDTH);
        hash[..n].copy_from_slice(&src[..n]);
        Self {
            hash,
            size: digest.size_bytes as u32,
        }
    }

    pub fn to_bytes(self) -> [u8; SIMPLE_DIGEST_WIDTH] {
        let mut out = [0u8; SIMPLE_DIGEST_WIDTH];
        out[..HASH_WIDTH].copy_from_slice(&self.hash);
        out[HASH_WIDTH..].copy_from_slice(&self.size.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        assert_eq!(bytes.len(), SIMPLE_DIGEST_WIDTH);
        let mut hash = [0u8; HASH_WIDTH];
        hash.copy_from_slice(&bytes[..HASH_WIDTH]);
        let size = u32::from_le_bytes(bytes[HASH_WIDTH..].try_into().unwrap());
        Self { hash, size }
    }
}

/// One slot of the on-disk cuckoo hash table (`spec.md` §3/§4.2.2): a `SimpleDigest` plus the
/// bookkeeping needed to distinguish a live record from stale garbage at the same file position.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OffsetRecord {
    pub digest: SimpleDigest,
    /// Number of times this record has been displaced from a more-preferential slot.
    pub attempt: u32,
    pub offset: u64,
    pub length: u64,
}

impl OffsetRecord {
    pub fn to_bytes(self) -> [u8; OFFSET_RECORD_WIDTH] {
        let mut out = [0u8; OFFSET_RECORD_WIDTH];
        out[..SIMPLE_DIGEST_WIDTH].copy_from_slice(&self.digest.to_bytes());
        let mut pos = SIMPLE_DIGEST_WIDTH;
        out[pos..pos + 4].copy_from_slice(&self.attempt.to_le_bytes());
        pos += 4;
        out[pos..pos + 8].copy_from_slice(&self.offset.to_le_bytes());
        pos += 8;
        out[pos..pos + 8].copy_from_slice(&self.length.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        assert_eq!(bytes.len(), OFFSET_RECORD_WIDTH);
        let digest = SimpleDigest::from_bytes(&bytes[..SIMPLE_DIGEST_WIDTH]);
        let mut pos = SIMPLE_DIGEST_WIDTH;
        let attempt = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap());
        pos += 4;
        let offset = u64::from_le_bytes(bytes[pos..pos + 8].try_into().unwrap());
        pos += 8;
        let length = u64::from_le_bytes(bytes[pos..pos + 8].try_into().unwrap());
        Self {
            digest,
            attempt,
            offset,
            length,
        }
    }

    /// Bytes hashed to compute this record's slot: the 36-byte `SimpleDigest` followed by the
    /// 4-byte `attempt`, a 40-byte digest+attempt prefix.
    pub fn slot_hash_input(digest: SimpleDigest, attempt: u32) -> [u8; SIMPLE_DIGEST_WIDTH + 4] {
        let mut out = [0u8; SIMPLE_DIGEST_WIDTH + 4];
        out[..SIMPLE_DIGEST_WIDTH].copy_from_slice(&digest.to_bytes());
        out[SIMPLE_DIGEST_WIDTH..].copy_from_slice(&attempt.to_le_bytes());
        out
    }

    /// Whether `(offset, length)` is contained within the live region `[read, write)`, applying
    /// the positive-sized rule: a `length < 1` is treated as 1 for containment purposes
    /// (`spec.md` §3).
    pub fn is_contained(offset: u64, length: u64, read: u64, write: u64) -> bool {
        let effective_length = length.max(1);
        offset >= read && offset.saturating_add(effective_length) <= write
    }
}

/// FNV-1a hash of `bytes` read in **reverse** order, per `spec.md` §4.2.2/§9: the high-entropy
/// hash bytes (at the front of the digest+attempt prefix) dominate the low-order bits of the
/// slot index. Matching this exact byte ordering is required for compatibility with pre-existing
/// on-disk data, per `spec.md` §9's open question -- this implementation keeps the reverse
/// ordering.
pub fn fnv1a_reverse(bytes: &[u8]) -> u64 {
    const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET_BASIS;
    for &byte in bytes.iter().rev() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn test_digest() -> Digest {
        Digest::of_bytes("main", &Bytes::from_static(b"hello")).unwrap()
    }

    #[test]
    fn simple_digest_round_trips() {
        let digest = test_digest();
        let simple = SimpleDigest::from_digest(&digest);
        let bytes = simple.to_bytes();
        assert_eq!(bytes.len(), SIMPLE_DIGEST_WIDTH);
        assert_eq!(SimpleDigest::from_bytes(&bytes), simple);
    }

    #[test]
    fn offset_record_round_trips() {
        let digest = test_digest();
        let record = OffsetRecord {
            digest: SimpleDigest::from_digest(&digest),
            attempt: 3,
            offset: 128,
            length: 64,
        };
        let bytes = record.to_bytes();
        assert_eq!(bytes.len(), OFFSET_RECORD_WIDTH);
        assert_eq!(OffsetRecord::from_bytes(&bytes), record);
    }

    #[test]
    fn fnv1a_reverse_is_order_sensitive() {
        let forward = fnv1a_reverse(b"ab");
        let reversed_input = fnv1a_reverse(b"ba");
        assert_ne!(forward, reversed_input);
    }

    #[test]
    fn containment_applies_positive_sized_rule() {
        assert!(OffsetRecord::is_contained(5, 0, 0, 6));
        assert!(!OffsetRecord::is_contained(5, 0, 0, 5));
        assert!(OffsetRecord::is_contained(0, 10, 0, 10));
        assert!(!OffsetRecord::is_contained(0, 10, 1, 10));
    }
}
