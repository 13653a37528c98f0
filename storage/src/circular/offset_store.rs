// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;

use digest::Digest;
use lasso::{Rodeo, Spur};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

use crate::circular::simple_digest::{fnv1a_reverse, OffsetRecord, SimpleDigest, OFFSET_RECORD_WIDTH};
use crate::circular::state_store::Cursors;
use crate::driver::StorageError;

/// Hard limit on cuckoo-displacement retries per `Get`/`Put`, per `spec.md` §4.2.2.
pub const MAX_ITERATIONS: u32 = 8;

/// The on-disk cuckoo hash table (`spec.md` §4.2.2): an array of fixed-width `OffsetRecord`
/// slots, addressed by FNV-1a-over-reversed-bytes of the record's digest+attempt prefix. No
/// teacher analogue exists for a cuckoo table; the on-disk, fixed-slot-count, file-seek-per-slot
/// style is grounded in the teacher's `driver/file_backed.rs` file-I/O conventions.
pub struct OffsetStore {
    file: File,
    slot_count: u64,
}

impl OffsetStore {
    pub fn new(file: File, offset_size: u64) -> Self {
        let slot_count = offset_size / OFFSET_RECORD_WIDTH as u64;
        Self { file, slot_count }
    }

    fn slot_for(&self, digest: SimpleDigest, attempt: u32) -> u64 {
        let input = OffsetRecord::slot_hash_input(digest, attempt);
        fnv1a_reverse(&input) % self.slot_count
    }

    async fn read_slot(&mut self, slot: u64) -> Result<Option<OffsetRecord>, StorageError> {
        let byte_offset = slot * OFFSET_RECORD_WIDTH as u64;
        self.file
            .seek(SeekFrom::Start(byte_offset))
            .await
            .map_err(|e| StorageError::Internal(format!("offset-store seek failed: {e}")))?;
        let mut buf = [0u8; OFFSET_RECORD_WIDTH];
        match self.file.read_exact(&mut buf).await {
            Ok(_) => Ok(Some(OffsetRecord::from_bytes(&buf))),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(StorageError::Internal(format!(
                "offset-store read failed: {e}"
            ))),
        }
    }

    async fn write_slot(&mut self, slot: u64, record: OffsetRecord) -> Result<(), StorageError> {
        let byte_offset = slot * OFFSET_RECORD_WIDTH as u64;
        self.file
            .seek(SeekFrom::Start(byte_offset))
            .await
            .map_err(|e| StorageError::Internal(format!("offset-store seek failed: {e}")))?;
        self.file
            .write_all(&record.to_bytes())
            .await
            .map_err(|e| StorageError::Internal(format!("offset-store write failed: {e}")))
    }

    /// Whether a record read back from `slot` is garbage: either stale per `cursors`, or its own
    /// recomputed slot doesn't match `slot` (meaning some other digest's record landed here and
    /// was never cleaned up).
    fn is_garbage(&self, record: OffsetRecord, slot: u64, cursors: Cursors) -> bool {
        let recomputed = self.slot_for(record.digest, record.attempt);
        recomputed != slot
            || !OffsetRecord::is_contained(record.offset, record.length, cursors.read, cursors.write)
    }

    /// `Get(digest, cursors) -> (offset, length, found)`, per `spec.md` §4.2.2.
    pub async fn get(
        &mut self,
        digest: &Digest,
        cursors: Cursors,
    ) -> Result<Option<(u64, u64)>, StorageError> {
        let simple = SimpleDigest::from_digest(digest);

        for attempt in 0..MAX_ITERATIONS {
            let slot = self.slot_for(simple, attempt);
            let Some(record) = self.read_slot(slot).await? else {
                return Ok(None);
            };

            if record.digest == simple && record.attempt == attempt {
                if OffsetRecord::is_contained(record.offset, record.length, cursors.read, cursors.write) {
                    return Ok(Some((record.offset, record.length)));
                }
                return Ok(None);
            }

            if self.is_garbage(record, slot, cursors) {
                return Ok(None);
            }
        }

        Ok(None)
    }

    /// `Put(digest, offset, length, cursors)`, per `spec.md` §4.2.2's insert-evict-or-retry
    /// policy. Silently drops the record on `MAX_ITERATIONS` exhaustion -- loss is acceptable in
    /// a self-cleaning cache.
    pub async fn put(
        &mut self,
        digest: &Digest,
        offset: u64,
        length: u64,
        cursors: Cursors,
    ) -> Result<(), StorageError> {
        let simple = SimpleDigest::from_digest(digest);
        let mut candidate = OffsetRecord {
            digest: simple,
            attempt: 0,
            offset,
            length,
        };

        loop {
            if candidate.attempt >= MAX_ITERATIONS {
                return Ok(());
            }

            let slot = self.slot_for(candidate.digest, candidate.attempt);
            let existing = self.read_slot(slot).await?;

            let should_overwrite_unconditionally = match existing {
                None => true,
                Some(record) => {
                    candidate.attempt >= MAX_ITERATIONS - 1 || self.is_garbage(record, slot, cursors)
                }
            };

            if should_overwrite_unconditionally {
                self.write_slot(slot, candidate).await?;
                return Ok(());
            }

            let occupant = existing.expect("checked above");
            if occupant.offset <= candidate.offset {
                // Occupant is older (or equal); evict it and reinsert at attempt+1.
                self.write_slot(slot, candidate).await?;
                candidate = OffsetRecord {
                    attempt: occupant.attempt + 1,
                    ..occupant
                };
            } else {
                // Occupant is newer; keep it, retry the candidate at attempt+1.
                candidate.attempt += 1;
            }
        }
    }
}

/// A fixed-size in-memory array of `(SimpleDigest, offset, length)` records keyed by
/// `hash mod capacity`, consulted before the file read (`spec.md` §4.2.2). Deliberately **not**
/// an LRU -- unlike the teacher's `existence_cache.rs` (`lru::LruCache`), this cache exists to
/// amortize disk reads for bulk `FindMissing` queries, not to bound memory against an unbounded
/// keyspace, so a plain fixed-size array with last-writer-wins eviction is sufficient and avoids
/// the bookkeeping cost of LRU ordering on the hot path.
pub struct CachingOffsetStore {
    inner: OffsetStore,
    slots: Vec<Option<(SimpleDigest, u64, u64)>>,
}

impl CachingOffsetStore {
    pub fn new(inner: OffsetStore, capacity: usize) -> Self {
        Self {
            inner,
            slots: vec![None; capacity],
        }
    }

    fn cache_index(&self, digest: SimpleDigest) -> usize {
        let input = digest.to_bytes();
        (fnv1a_reverse(&input) % self.slots.len() as u64) as usize
    }

    pub async fn get(
        &mut self,
        digest: &Digest,
        cursors: Cursors,
    ) -> Result<Option<(u64, u64)>, StorageError> {
        let simple = SimpleDigest::from_digest(digest);
        let idx = self.cache_index(simple);

        if let Some((cached_digest, offset, length)) = self.slots[idx] {
            if cached_digest == simple
                && OffsetRecord::is_contained(offset, length, cursors.read, cursors.write)
            {
                return Ok(Some((offset, length)));
            }
        }

        let result = self.inner.get(digest, cursors).await?;
        if let Some((offset, length)) = result {
            self.slots[idx] = Some((simple, offset, length));
        }
        Ok(result)
    }

    pub async fn put(
        &mut self,
        digest: &Digest,
        offset: u64,
        length: u64,
        cursors: Cursors,
    ) -> Result<(), StorageError> {
        self.inner.put(digest, offset, length, cursors).await?;
        let simple = SimpleDigest::from_digest(digest);
        let idx = self.cache_index(simple);
        self.slots[idx] = Some((simple, offset, length));
        Ok(())
    }
}

/// Routes each operation to a per-instance-name backend, selected by a caller-supplied
/// function -- used by the Action Cache, where each instance keeps a distinct index but all
/// instances share the data file (`spec.md` §4.2.2). Grounded in the teacher's
/// `existence_cache.rs`, which interns instance names into `lasso::Spur` keys rather than
/// hashing/cloning the `String` on every lookup; this adapter only ever sees one caller at a
/// time, so a plain `Rodeo` stands in for the teacher's `ThreadedRodeo`.
pub struct DemuxOffsetStore<F> {
    interner: Rodeo,
    backends: HashMap<Spur, OffsetStore>,
    open_backend: F,
}

impl<F> DemuxOffsetStore<F>
where
    F: Fn(&str) -> Result<OffsetStore, StorageError>,
{
    pub fn new(open_backend: F) -> Self {
        Self {
            interner: Rodeo::new(),
            backends: HashMap::new(),
            open_backend,
        }
    }

    fn backend_for(&mut self, instance_name: &str) -> Result<&mut OffsetStore, StorageError> {
        let key = self.interner.get_or_intern(instance_name);
        if !self.backends.contains_key(&key) {
            let store = (self.open_backend)(instance_name)?;
            self.backends.insert(key, store);
        }
        Ok(self.backends.get_mut(&key).unwrap())
    }

    pub async fn get(
        &mut self,
        digest: &Digest,
        cursors: Cursors,
    ) -> Result<Option<(u64, u64)>, StorageError> {
        self.backend_for(&digest.instance_name)?
            .get(digest, cursors)
            .await
    }

    pub async fn put(
        &mut self,
        digest: &Digest,
        offset: u64,
        length: u64,
        cursors: Cursors,
    ) -> Result<(), StorageError> {
        self.backend_for(&digest.instance_name)?
            .put(digest, offset, length, cursors)
            .await
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tempfile::NamedTempFile;

    use super::*;

    async fn open_offset_file(offset_size: u64) -> File {
        let tmp = NamedTempFile::new().unwrap();
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(tmp.path())
            .await
            .unwrap();
        file.set_len(offset_size).await.unwrap();
        std::mem::forget(tmp);
        file
    }

    fn digest(content: &'static [u8]) -> Digest {
        Digest::of_bytes("main", &Bytes::from_static(content)).unwrap()
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let file = open_offset_file(OFFSET_RECORD_WIDTH as u64 * 64).await;
        let mut store = OffsetStore::new(file, OFFSET_RECORD_WIDTH as u64 * 64);

        let d = digest(b"hello");
        let cursors = Cursors { read: 0, write: 100 };
        store.put(&d, 10, 5, cursors).await.unwrap();

        let found = store.get(&d, cursors).await.unwrap();
        assert_eq!(found, Some((10, 5)));
    }

    #[tokio::test]
    async fn get_returns_none_when_stale_per_cursors() {
        let file = open_offset_file(OFFSET_RECORD_WIDTH as u64 * 64).await;
        let mut store = OffsetStore::new(file, OFFSET_RECORD_WIDTH as u64 * 64);

        let d = digest(b"hello");
        store
            .put(&d, 10, 5, Cursors { read: 0, write: 100 })
            .await
            .unwrap();

        let found = store.get(&d, Cursors { read: 20, write: 100 }).await.unwrap();
        assert_eq!(found, None);
    }

    #[tokio::test]
    async fn newer_record_wins_over_older_on_collision() {
        // Force a collision by using a table with a single slot.
        let file = open_offset_file(OFFSET_RECORD_WIDTH as u64).await;
        let mut store = OffsetStore::new(file, OFFSET_RECORD_WIDTH as u64);

        let a = digest(b"aaa");
        let b = digest(b"bbb");
        let cursors = Cursors { read: 0, write: 100 };

        store.put(&a, 10, 5, cursors).await.unwrap();
        store.put(&b, 20, 5, cursors).await.unwrap();

        // `b` is newer (higher offset); with only one slot and MAX_ITERATIONS exhaustion,
        // the more recent write must remain retrievable.
        let found_b = store.get(&b, cursors).await.unwrap();
        assert_eq!(found_b, Some((20, 5)));
    }

    #[tokio::test]
    async fn caching_store_serves_repeat_lookups_without_garbage() {
        let file = open_offset_file(OFFSET_RECORD_WIDTH as u64 * 64).await;
        let store = OffsetStore::new(file, OFFSET_RECORD_WIDTH as u64 * 64);
        let mut cached = CachingOffsetStore::new(store, 16);

        let d = digest(b"cached");
        let cursors = Cursors { read: 0, write: 100 };
        cached.put(&d, 10, 5, cursors).await.unwrap();

        assert_eq!(cached.get(&d, cursors).await.unwrap(), Some((10, 5)));
        assert_eq!(cached.get(&d, cursors).await.unwrap(), Some((10, 5)));
    }
}
