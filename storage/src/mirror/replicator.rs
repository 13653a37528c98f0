// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use digest::Digest;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::buffer::Buffer;
use crate::driver::{BlobStorage, Context, DriverState, StorageError, StreamingWriteError};

/// Copies a blob (or set of blobs) from one `BlobStorage` to another, per `spec.md` §4.3.4.
/// `replicate_single` must, on success, ensure the blob is present in the sink backend; the
/// returned `Buffer` must also be independently consumable by the caller (typically via a tee).
#[async_trait]
pub trait BlobReplicator: Send + Sync {
    async fn replicate_single(&self, ctx: Context, digest: Digest) -> Buffer;

    async fn replicate_multiple(&self, ctx: Context, digests: Vec<Digest>) -> Result<(), StorageError>;
}

/// A local (in-process) replicator: pipes `source.get` into `sink.put`. Grounded on
/// `driver/fast_slow.rs`'s read-through write-back pattern, which already does exactly this for
/// its two-tier fast/slow case; generalized here to an arbitrary `(source, sink)` pair.
pub struct LocalReplicator<S> {
    source: Arc<S>,
    sink: Arc<S>,
}

impl<S> LocalReplicator<S> {
    pub fn new(source: Arc<S>, sink: Arc<S>) -> Self {
        Self { source, sink }
    }
}

#[async_trait]
impl<S> BlobReplicator for LocalReplicator<S>
where
    S: BlobStorage + Send + Sync + ?Sized + 'static,
{
    async fn replicate_single(&self, ctx: Context, digest: Digest) -> Buffer {
        let Some(stream) = (match self
            .source
            .read_blob(ctx.clone(), digest.clone(), 64 * 1024, None, None, DriverState::default())
            .await
        {
            Ok(found) => found,
            Err(e) => return Buffer::from_error(e),
        }) else {
            return Buffer::from_error(StorageError::NotFound(format!(
                "{digest} not present in replication source"
            )));
        };

        let (caller_buf, sink_buf) = Buffer::from_stream(stream).clone_split();

        let attempt = match self
            .sink
            .begin_write_blob(ctx, digest, DriverState::default())
            .await
        {
            Ok(attempt) => attempt,
            Err(StreamingWriteError::AlreadyExists) => {
                sink_buf.discard();
                return caller_buf;
            }
            Err(StreamingWriteError::StorageError(e)) => {
                sink_buf.discard();
                return Buffer::from_error(e);
            }
        };

        if let Err(e) = drain_into_attempt(sink_buf, attempt).await {
            return Buffer::from_error(e);
        }

        caller_buf
    }

    async fn replicate_multiple(&self, ctx: Context, digests: Vec<Digest>) -> Result<(), StorageError> {
        for digest in digests {
            ctx.check()?;
            let buf = self.replicate_single(ctx.clone(), digest).await;
            if let Buffer::Error(e) = buf {
                if !matches!(e, StorageError::NotFound(_)) {
                    return Err(e);
                }
            } else {
                buf.discard();
            }
        }
        Ok(())
    }
}

async fn drain_into_attempt(
    buf: Buffer,
    mut attempt: Box<dyn crate::driver::WriteAttemptOps + Send + Sync>,
) -> Result<(), StorageError> {
    let bytes = buf
        .consolidate()
        .await
        .map_err(|e| StorageError::Internal(format!("replication read failed: {e}")))?;
    attempt
        .write(bytes)
        .await
        .map_err(|e| StorageError::Internal(format!("replication write failed: {e:?}")))?;
    match attempt.commit().await {
        Ok(()) | Err(StreamingWriteError::AlreadyExists) => Ok(()),
        Err(StreamingWriteError::StorageError(e)) => Err(e),
    }
}

/// Collapses concurrent requests for the same digest into a single in-flight I/O, per
/// `spec.md` §4.3.4. Grounded in generalizing `pantsbuild-pants`'s `OnceCell`-memoized-setup
/// idiom (`fs/store/src/local.rs`) from a one-shot cell to a per-digest map of in-flight
/// broadcasts; a `tokio::sync::broadcast` channel lets every waiter observe the same outcome
/// without re-issuing the I/O.
pub struct QueuedReplicator<R> {
    inner: Arc<R>,
    in_flight: Mutex<HashMap<Digest, broadcast::Sender<Result<(), String>>>>,
}

impl<R> QueuedReplicator<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: Arc::new(inner),
            in_flight: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl<R> BlobReplicator for QueuedReplicator<R>
where
    R: BlobReplicator + 'static,
{
    async fn replicate_single(&self, ctx: Context, digest: Digest) -> Buffer {
        // `ReplicateSingle`'s contract requires handing the caller back a consumable `Buffer`,
        // which an in-flight dedup can't share across callers (each needs its own stream) --
        // only `replicate_multiple`'s presence-only guarantee benefits from dedup here.
        self.inner.replicate_single(ctx, digest).await
    }

    async fn replicate_multiple(&self, ctx: Context, digests: Vec<Digest>) -> Result<(), StorageError> {
        let mut waiters = Vec::with_capacity(digests.len());
        let mut owned = Vec::new();

        for digest in digests {
            let mut in_flight = self.in_flight.lock();
            if let Some(tx) = in_flight.get(&digest) {
                waiters.push(tx.subscribe());
            } else {
                let (tx, rx) = broadcast::channel(1);
                in_flight.insert(digest.clone(), tx);
                waiters.push(rx);
                owned.push(digest);
            }
        }

        if !owned.is_empty() {
            let result = self.inner.replicate_multiple(ctx, owned.clone()).await;
            let mut in_flight = self.in_flight.lock();
            for digest in &owned {
                if let Some(tx) = in_flight.remove(digest) {
                    let _ = tx.send(result.clone().map_err(|e| e.to_string()));
                }
            }
        }

        for mut rx in waiters {
            if let Ok(Err(msg)) = rx.recv().await {
                return Err(StorageError::Internal(msg));
            }
        }

        Ok(())
    }
}
