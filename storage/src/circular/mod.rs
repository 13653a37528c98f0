// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

pub mod data_store;
pub mod offset_store;
pub mod simple_digest;
pub mod state_store;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use digest::Digest;
use parking_lot::Mutex;

use crate::buffer::Buffer;
use crate::driver::{
    BlobStorage, BoxReadStream, Context, DriverState, StorageError, StreamingWriteError,
    WriteAttemptOps,
};
use data_store::DataStore;
use offset_store::OffsetStore;
use state_store::{BulkAllocatingStateStore, PositiveSizedStateStore, StateStore};

/// The composition of the three circular-store files into a single durable FIFO blob cache
/// (`spec.md` §4.2.4). Holds `(offsetStore, stateStore)` behind one mutex; the data store is
/// only written to outside the lock, per `spec.md` §4.2.4/§5. Grounded in the teacher's
/// `Arc<Mutex<Inner>>` decorator idiom (`driver/memory.rs`'s `MemoryStorage`/`Inner` split),
/// which gives write attempts a cheap, owned, `'static` handle back into shared state instead of
/// a borrowed lifetime.
#[derive(Clone)]
pub struct CircularBlobAccess {
    data_store: DataStore,
    locked: Arc<Mutex<LockedState>>,
}

struct LockedState {
    offset_store: OffsetStore,
    state_store: BulkAllocatingStateStore,
}

impl CircularBlobAccess {
    pub fn new(
        data_store: DataStore,
        offset_store: OffsetStore,
        state_store: StateStore,
        bulk_chunk_size: u64,
    ) -> Self {
        let state_store =
            BulkAllocatingStateStore::new(PositiveSizedStateStore::new(state_store), bulk_chunk_size);
        Self {
            data_store,
            locked: Arc::new(Mutex::new(LockedState {
                offset_store,
                state_store,
            })),
        }
    }
}

#[async_trait]
impl BlobStorage for CircularBlobAccess {
    async fn find_missing_blobs(
        &self,
        ctx: Context,
        digests: Vec<Digest>,
        _state: DriverState,
    ) -> Result<Vec<Digest>, StorageError> {
        let mut missing = Vec::new();
        let mut locked = self.locked.lock();
        let cursors = locked.state_store.get_cursors();

        for digest in digests {
            ctx.check()?;
            if locked.offset_store.get(&digest, cursors).await?.is_none() {
                missing.push(digest);
            }
        }

        Ok(missing)
    }

    async fn read_blob(
        &self,
        ctx: Context,
        digest: Digest,
        max_batch_size: usize,
        read_offset: Option<usize>,
        read_limit: Option<usize>,
        _state: DriverState,
    ) -> Result<Option<BoxReadStream>, StorageError> {
        ctx.check()?;

        let found = {
            let mut locked = self.locked.lock();
            let cursors = locked.state_store.get_cursors();
            locked.offset_store.get(&digest, cursors).await?
        };

        let Some((offset, length)) = found else {
            return Ok(None);
        };

        let start = read_offset.unwrap_or(0) as u64;
        let remaining = length.saturating_sub(start);
        let want = read_limit.map(|l| l as u64).unwrap_or(remaining).min(remaining);
        let _ = max_batch_size; // chunking is governed by `DataStore`'s own internal chunk size.

        Ok(Some(self.data_store.get(offset + start, want)))
    }

    async fn begin_write_blob(
        &self,
        ctx: Context,
        digest: Digest,
        _state: DriverState,
    ) -> Result<Box<dyn WriteAttemptOps + Send + Sync + 'static>, StreamingWriteError> {
        ctx.check()?;

        let offset = {
            let mut locked = self.locked.lock();
            locked
                .state_store
                .allocate(digest.size_bytes)
                .await
                .map_err(StreamingWriteError::from)?
        };

        Ok(Box::new(CircularWriteAttempt {
            digest,
            offset,
            content: bytes::BytesMut::new(),
            data_store: self.data_store.clone(),
            locked: self.locked.clone(),
        }))
    }
}

struct CircularWriteAttempt {
    digest: Digest,
    offset: u64,
    content: bytes::BytesMut,
    data_store: DataStore,
    locked: Arc<Mutex<LockedState>>,
}

#[async_trait]
impl WriteAttemptOps for CircularWriteAttempt {
    async fn write(&mut self, batch: Bytes) -> Result<(), StreamingWriteError> {
        self.content.extend_from_slice(&batch[..]);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StreamingWriteError> {
        let content = self.content.freeze();

        // Write to the data store outside the lock (`spec.md` §4.2.4).
        self.data_store
            .put(self.offset, &content)
            .await
            .map_err(StreamingWriteError::from)?;

        let mut locked = self.locked.lock();
        let cursors = locked.state_store.get_cursors();

        if !simple_digest::OffsetRecord::is_contained(
            self.offset,
            content.len() as u64,
            cursors.read,
            cursors.write,
        ) {
            return Err(StreamingWriteError::StorageError(StorageError::Internal(
                "Data became stale before write completed".to_string(),
            )));
        }

        locked
            .offset_store
            .put(&self.digest, self.offset, content.len() as u64, cursors)
            .await
            .map_err(StreamingWriteError::from)?;

        Ok(())
    }
}

/// Wraps a `Buffer`-producing `Get` into a `CircularBlobAccess`-compatible invocation, bridging
/// `spec.md` §4.1's `Get(ctx, digest) -> Buffer` contract to this trait's `BoxReadStream`-based
/// `read_blob`. No teacher analogue: the teacher never introduced a `Buffer` abstraction.
pub async fn get_buffer(access: &CircularBlobAccess, ctx: Context, digest: Digest) -> Buffer {
    match access
        .read_blob(ctx, digest, 64 * 1024, None, None, DriverState::default())
        .await
    {
        Ok(Some(stream)) => Buffer::from_stream(stream),
        Ok(None) => Buffer::from_error(StorageError::NotFound(
            "digest not present in circular store".to_string(),
        )),
        Err(e) => Buffer::from_error(e),
    }
}
