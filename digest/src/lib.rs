// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use sha2::{Digest as Sha2Digest, Sha256};

// See the [`hashing` crate](https://github.com/pantsbuild/pants/blob/master/src/rust/engine/hashing/src/lib.rs)
// for the inspiration for this module.

/// Path segments that may not appear as (or within) an `instance_name`, because the REv2 wire
/// protocol uses them to distinguish CAS/AC/ByteStream resource names from instance-scoped ones.
const RESERVED_INSTANCE_SEGMENTS: &[&str] = &[
    "blobs",
    "uploads",
    "actions",
    "actionResults",
    "operations",
    "capabilities",
];

/// The hash functions a `Digest` may be expressed in terms of. Canonical byte widths per
/// function; `Sha256Tree` shares SHA-256's width since it is a tree hash built from SHA-256
/// nodes. Computing a `Sha256Tree` digest from bytes is out of scope for this crate -- it is
/// only ever constructed from an already-known hash (e.g. one read back off the wire or from
/// disk).
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum HashFunction {
    Md5,
    Sha1,
    Sha256,
    Sha256Tree,
    Sha384,
    Sha512,
    Blake3,
}

impl HashFunction {
    pub fn canonical_byte_length(self) -> usize {
        match self {
            HashFunction::Md5 => 16,
            HashFunction::Sha1 => 20,
            HashFunction::Sha256 => 32,
            HashFunction::Sha256Tree => 32,
            HashFunction::Sha384 => 48,
            HashFunction::Sha512 => 64,
            HashFunction::Blake3 => 32,
        }
    }
}

const EMPTY_SHA256_HASH_BYTES: [u8; 32] = [
    0xe3, 0xb0, 0xc4, 0x42, 0x98, 0xfc, 0x1c, 0x14, 0x9a, 0xfb, 0xf4, 0xc8, 0x99, 0x6f, 0xb9, 0x24,
    0x27, 0xae, 0x41, 0xe4, 0x64, 0x9b, 0x93, 0x4c, 0xa4, 0x95, 0x99, 0x1b, 0x78, 0x52, 0xb8, 0x55,
];

/// The identity of a blob: an instance-scoped, hash-function-tagged content hash plus size.
///
/// Equality, hashing, and ordering are component-wise over `(instance_name, hash_function,
/// hash_bytes, size_bytes)`.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Digest {
    pub instance_name: String,
    pub hash_function: HashFunction,
    pub hash_bytes: Bytes,
    pub size_bytes: u64,
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Digest<{:?}, {}, {}, {}>",
            self.hash_function,
            hex::encode(&self.hash_bytes),
            self.size_bytes,
            self.instance_name
        )
    }
}

impl Digest {
    /// The empty SHA-256 digest with no instance name. The only `HashFunction` for which this
    /// crate defines a canonical empty value -- `spec.md` has no single empty digest that is
    /// valid across all seven hash functions.
    pub const EMPTY: Digest = Digest {
        instance_name: String::new(),
        hash_function: HashFunction::Sha256,
        hash_bytes: Bytes::from_static(&EMPTY_SHA256_HASH_BYTES),
        size_bytes: 0,
    };

    pub fn new(
        instance_name: impl Into<String>,
        hash_function: HashFunction,
        hash_bytes: impl Into<Bytes>,
        size_bytes: u64,
    ) -> Result<Self, String> {
        let instance_name = instance_name.into();
        let hash_bytes = hash_bytes.into();

        validate_instance_name(&instance_name)?;

        let expected_len = hash_function.canonical_byte_length();
        if hash_bytes.len() != expected_len {
            return Err(format!(
                "Digest for {hash_function:?} had unexpected hash length {} (expected {expected_len})",
                hash_bytes.len()
            ));
        }

        Ok(Digest {
            instance_name,
            hash_function,
            hash_bytes,
            size_bytes,
        })
    }

    pub fn from_hex(
        instance_name: impl Into<String>,
        hash_function: HashFunction,
        hash_hex: &str,
        size_bytes: u64,
    ) -> Result<Self, String> {
        let hash_bytes =
            hex::decode(hash_hex).map_err(|err| format!("Failed to convert digest: {err}"))?;
        Self::new(instance_name, hash_function, hash_bytes, size_bytes)
    }

    /// Computes a SHA-256 digest of `content`, scoped to `instance_name`. Computing digests for
    /// any other `HashFunction` (including `Sha256Tree`) is out of scope for this crate.
    pub fn of_bytes(instance_name: impl Into<String>, content: &Bytes) -> Result<Self, String> {
        let mut hasher = Sha256::default();
        hasher.update(&content[..]);
        let hash = hasher.finalize();
        Digest::new(
            instance_name,
            HashFunction::Sha256,
            Bytes::copy_from_slice(hash.as_slice()),
            content.len() as u64,
        )
    }

    pub fn hex(&self) -> String {
        hex::encode(&self.hash_bytes)
    }

    /// Stable byte-key including the instance name. Used by the Action Cache and Indirect CAS,
    /// where entries must not be shared across tenants.
    pub fn key_with_instance(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            self.instance_name.len() + 1 + self.hash_bytes.len() + 9,
        );
        buf.put_slice(self.instance_name.as_bytes());
        buf.put_u8(0); // NUL separator: instance names cannot contain NUL, hash bytes can't either.
        buf.put_u8(self.hash_function as u8);
        buf.put_slice(&self.hash_bytes);
        buf.put_u64_le(self.size_bytes);
        buf.freeze()
    }

    /// Stable byte-key omitting the instance name, so that identical content uploaded under
    /// different tenants dedups to the same CAS entry.
    pub fn key_without_instance(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.hash_bytes.len() + 9);
        buf.put_u8(self.hash_function as u8);
        buf.put_slice(&self.hash_bytes);
        buf.put_u64_le(self.size_bytes);
        buf.freeze()
    }
}

// `HashFunction` has no explicit discriminants; `as u8` relies on declaration order, which is
// stable within this crate version (not a wire format -- see `key_with_instance`/
// `key_without_instance`, which are in-process hash-table keys only).

fn validate_instance_name(instance_name: &str) -> Result<(), String> {
    for segment in instance_name.split('/') {
        if RESERVED_INSTANCE_SEGMENTS.contains(&segment) {
            return Err(format!(
                "instance_name {instance_name:?} contains the reserved path segment {segment:?}"
            ));
        }
    }
    Ok(())
}

pub fn required_digest(field_name: &str, digest: Option<Digest>) -> Result<Digest, String> {
    digest.ok_or_else(|| format!("Missing {field_name}"))
}

#[cfg(test)]
mod tests {
    use bytes::{Bytes, BytesMut};
    use std::fmt::Write;

    use super::{Digest, HashFunction};

    #[test]
    fn empty_digest_is_well_formed() {
        assert_eq!(Digest::EMPTY.hash_function, HashFunction::Sha256);
        assert_eq!(Digest::EMPTY.size_bytes, 0);
        assert_eq!(Digest::EMPTY.instance_name, "");
        assert_eq!(Digest::EMPTY, Digest::of_bytes("", &Bytes::new()).unwrap());
    }

    #[test]
    fn hash_bytes_sha256() {
        let content = {
            let mut buf = BytesMut::new();
            buf.write_str("foobar").unwrap();
            buf.freeze()
        };
        let actual_digest = Digest::of_bytes("main", &content).unwrap();
        let expected_digest = Digest::from_hex(
            "main",
            HashFunction::Sha256,
            "c3ab8ff13720e8ad9047dd39466b3c8974e592c2fa383d4a3960714caef0c4f2",
            content.len() as u64,
        )
        .unwrap();
        assert_eq!(actual_digest, expected_digest);
    }

    #[test]
    fn rejects_reserved_instance_segment() {
        let err = Digest::new(
            "tenants/blobs/sub",
            HashFunction::Sha256,
            Bytes::from_static(&[0u8; 32]),
            0,
        )
        .unwrap_err();
        assert!(err.contains("reserved"));
    }

    #[test]
    fn rejects_wrong_hash_length() {
        let err = Digest::new("main", HashFunction::Sha256, Bytes::from_static(&[0u8; 16]), 0)
            .unwrap_err();
        assert!(err.contains("unexpected hash length"));
    }

    #[test]
    fn accepts_each_canonical_length() {
        for (func, len) in [
            (HashFunction::Md5, 16),
            (HashFunction::Sha1, 20),
            (HashFunction::Sha256, 32),
            (HashFunction::Sha256Tree, 32),
            (HashFunction::Sha384, 48),
            (HashFunction::Sha512, 64),
            (HashFunction::Blake3, 32),
        ] {
            Digest::new("main", func, Bytes::from(vec![0u8; len]), 0)
                .unwrap_or_else(|err| panic!("{func:?} with {len} bytes should validate: {err}"));
        }
    }

    #[test]
    fn with_instance_key_differs_across_instances() {
        let a = Digest::new("tenant-a", HashFunction::Sha256, Bytes::from(vec![1u8; 32]), 4)
            .unwrap();
        let b = Digest::new("tenant-b", HashFunction::Sha256, Bytes::from(vec![1u8; 32]), 4)
            .unwrap();
        assert_ne!(a.key_with_instance(), b.key_with_instance());
        assert_eq!(a.key_without_instance(), b.key_without_instance());
    }
}
