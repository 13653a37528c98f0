// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use digest::Digest;
use futures::Stream;

pub mod capabilities;
mod error;
pub mod memory;

pub use error::{StorageError, StreamingWriteError};
pub use memory::{MemoryStorage, MemoryWriteAttempt};

/// A mechanism to pass state to other drivers.
///
/// The type may be cloned many times, rather than sharing the same instance for the whole binary
/// via `Arc`. This implies that state is passed down one-way, from caller to callee
/// (like props in React). It always starts empty from the outermost caller, meaning that
/// state is only ever added by other drivers.
///
/// Driver authors can add new fields and methods when they would like to use some new state.
#[derive(Clone, Debug, Default)]
pub struct DriverState;

/// Carries cancellation and deadline information across a `BlobStorage` call, per `spec.md`
/// §5's "every public operation takes an explicit cancellation/deadline context" requirement.
/// No teacher analogue exists -- the teacher relies on the surrounding tonic request being
/// dropped to cancel in-flight work. This is authored fresh, kept deliberately minimal
/// (a shared cancellation flag plus an optional deadline), so that the circular store and
/// mirrored layer below can check it at their suspension points without pulling in a whole
/// executor-level cancellation framework.
#[derive(Clone, Debug)]
pub struct Context {
    cancelled: Arc<AtomicBool>,
    deadline: Option<tokio::time::Instant>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    pub fn new() -> Self {
        Context {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: None,
        }
    }

    pub fn with_deadline(deadline: tokio::time::Instant) -> Self {
        Context {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: Some(deadline),
        }
    }

    /// Marks this context (and every clone of it) as cancelled.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
            || self
                .deadline
                .is_some_and(|deadline| tokio::time::Instant::now() >= deadline)
    }

    /// Returns `Err(StorageError::Cancelled)` if this context has been cancelled or its deadline
    /// has passed. Call at suspension points, as `spec.md` §5 requires.
    pub fn check(&self) -> Result<(), StorageError> {
        if self.is_cancelled() {
            Err(StorageError::Cancelled(
                "operation cancelled or deadline exceeded".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

/// Represents temporary resources in the driver for writing blobs. The caller uses this
/// trait to commit an upload only when the caller's success criteria for an upload have
/// been met.
///
/// If the `WriteAttempt` is dropped without calling `commit`, then the driver should destroy
/// resources associated with the upload and not make the upload visible. For example, an upload
/// could have content that does not match the digest, or another caller could have uploaded the
/// same digest concurrently and finished first.
#[async_trait]
pub trait WriteAttemptOps {
    /// Write a `Bytes` into the blob.
    async fn write(&mut self, batch: Bytes) -> Result<(), StreamingWriteError>;

    /// Consumes the `WriteAttempt` and commits the blob to storage. After this call, the blob must
    /// be visible to a call to `BlobStorage::read_blob`.
    ///
    /// Note: There may be multiple writes for the same `Digest` occurring concurrently. The
    /// driver must handle its own coordination in accessing storage.
    async fn commit(self: Box<Self>) -> Result<(), StreamingWriteError>;
}

/// Alias for the type of a read stream.
pub type BoxReadStream = Pin<Box<dyn Stream<Item = Result<Bytes, StorageError>> + Send + 'static>>;

/// The uniform blob-access contract (`spec.md` §4.1): `find_missing_blobs` / `read_blob` /
/// `begin_write_blob`, plus an optional `get_capabilities`. Grounded on the teacher's
/// `driver::BlobStorage` trait, generalized so that the `Instance` each operation used to take
/// separately is folded into `Digest::instance_name` (per `spec.md` §3, where `Digest` is
/// already instance-scoped) rather than threaded as a second parameter.
#[async_trait]
pub trait BlobStorage {
    /// Given a list of digests, return the digests that are **not** stored by this driver.
    ///
    /// This is used to implement the FindMissingBlobs RPC from the CAS API.
    async fn find_missing_blobs(
        &self,
        ctx: Context,
        digests: Vec<Digest>,
        state: DriverState,
    ) -> Result<Vec<Digest>, StorageError>;

    /// Return a stream of the bytes comprising the content of the `digest`. Using a stream allows
    /// a driver to return the content in a piecemeal fashion. The driver must return the content
    /// starting at `read_offset` and only up to `read_limit` bytes from that offset.
    async fn read_blob(
        &self,
        ctx: Context,
        digest: Digest,
        max_batch_size: usize,
        read_offset: Option<usize>, // default is read from beginning
        read_limit: Option<usize>,  // default is to return the entire blob
        state: DriverState,
    ) -> Result<Option<BoxReadStream>, StorageError>;

    /// Begin storing an upload into temporary upload space. The content for the blob will be
    /// streamed on a (potentially) piecemeal basis via subsequent calls to `write`.
    async fn begin_write_blob(
        &self,
        ctx: Context,
        digest: Digest,
        state: DriverState,
    ) -> Result<Box<dyn WriteAttemptOps + Send + Sync + 'static>, StreamingWriteError>;

    /// Ensure the driver is set up to receive blobs for the instance named by `instance_name`.
    fn ensure_instance(&mut self, _instance_name: &str, _state: DriverState) {}

    /// Returns the subset of the REv2 server-capabilities descriptor (`spec.md` §6) that this
    /// backend can report for `instance_name`. Default: `Unimplemented`, mirroring the teacher's
    /// `ensure_instance` default-no-op pattern -- most decorators and leaf stores have nothing of
    /// their own to report and simply don't override this.
    async fn get_capabilities(
        &self,
        _ctx: Context,
        _instance_name: &str,
    ) -> Result<capabilities::ServerCapabilities, StorageError> {
        Err(StorageError::Unimplemented(
            "get_capabilities not implemented by this backend".to_string(),
        ))
    }
}

#[async_trait]
impl<BS> BlobStorage for Box<BS>
where
    BS: BlobStorage + Send + Sync + 'static + ?Sized,
{
    async fn find_missing_blobs(
        &self,
        ctx: Context,
        digests: Vec<Digest>,
        state: DriverState,
    ) -> Result<Vec<Digest>, StorageError> {
        (**self).find_missing_blobs(ctx, digests, state).await
    }

    async fn read_blob(
        &self,
        ctx: Context,
        digest: Digest,
        max_batch_size: usize,
        read_offset: Option<usize>,
        read_limit: Option<usize>,
        state: DriverState,
    ) -> Result<Option<BoxReadStream>, StorageError> {
        (**self)
            .read_blob(
                ctx,
                digest,
                max_batch_size,
                read_offset,
                read_limit,
                state,
            )
            .await
    }

    async fn begin_write_blob(
        &self,
        ctx: Context,
        digest: Digest,
        state: DriverState,
    ) -> Result<Box<dyn WriteAttemptOps + Send + Sync + 'static>, StreamingWriteError> {
        (**self).begin_write_blob(ctx, digest, state).await
    }

    fn ensure_instance(&mut self, instance_name: &str, state: DriverState) {
        (**self).ensure_instance(instance_name, state)
    }

    async fn get_capabilities(
        &self,
        ctx: Context,
        instance_name: &str,
    ) -> Result<capabilities::ServerCapabilities, StorageError> {
        (**self).get_capabilities(ctx, instance_name).await
    }
}

#[async_trait]
impl<WA> WriteAttemptOps for Box<WA>
where
    WA: WriteAttemptOps + Send + Sync + 'static,
{
    async fn write(&mut self, batch: Bytes) -> Result<(), StreamingWriteError> {
        (**self).write(batch).await
    }

    async fn commit(self: Box<Self>) -> Result<(), StreamingWriteError> {
        self.commit().await
    }
}
