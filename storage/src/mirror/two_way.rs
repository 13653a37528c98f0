// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use digest::Digest;

use crate::buffer::Buffer;
use crate::driver::capabilities::ServerCapabilities;
use crate::driver::{
    BlobStorage, BoxReadStream, Context, DriverState, StorageError, StreamingWriteError,
    WriteAttemptOps,
};
use crate::mirror::replicator::BlobReplicator;

/// Whether a single-backend failure during `Put`/`FindMissing`/`GetCapabilities` is tolerated
/// (one success suffices) or must be surfaced (`spec.md` §4.3.1/§7).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mode {
    Strict,
    Resilient,
}

/// Two-way mirrored `BlobStorage` (`spec.md` §4.3.1). Grounded in the *shape* of the teacher's
/// `driver/fast_slow.rs` two-tier decorator (a struct holding two inner backends, `async_trait`
/// impl, concurrent writes via `futures::try_join!`, error-wrap-with-backend-name on failure),
/// generalized from fast/slow's asymmetric roles to a symmetric round-robin pair, and the
/// fan-out/merge shape of `driver/sharding.rs` for `FindMissing`.
pub struct MirroredBlobAccess<A, B, RAB, RBA> {
    backend_a: Arc<A>,
    backend_b: Arc<B>,
    name_a: String,
    name_b: String,
    replicator_a_to_b: RAB,
    replicator_b_to_a: RBA,
    round_robin: AtomicUsize,
    mode: Mode,
}

impl<A, B, RAB, RBA> MirroredBlobAccess<A, B, RAB, RBA>
where
    A: BlobStorage + Send + Sync + 'static,
    B: BlobStorage + Send + Sync + 'static,
    RAB: BlobReplicator,
    RBA: BlobReplicator,
{
    pub fn new(
        backend_a: Arc<A>,
        name_a: impl Into<String>,
        backend_b: Arc<B>,
        name_b: impl Into<String>,
        replicator_a_to_b: RAB,
        replicator_b_to_a: RBA,
        mode: Mode,
    ) -> Self {
        Self {
            backend_a,
            backend_b,
            name_a: name_a.into(),
            name_b: name_b.into(),
            replicator_a_to_b,
            replicator_b_to_a,
            round_robin: AtomicUsize::new(0),
            mode,
        }
    }

    fn primary_is_a(&self) -> bool {
        self.round_robin.fetch_add(1, Ordering::Relaxed) % 2 == 0
    }

    fn wrap_error(name: &str, err: StorageError) -> StorageError {
        match err {
            StorageError::Internal(msg) => StorageError::Internal(format!("{name}: {msg}")),
            StorageError::Unavailable(msg) => StorageError::Unavailable(format!("{name}: {msg}")),
            other => other,
        }
    }
}

#[async_trait]
impl<A, B, RAB, RBA> BlobStorage for MirroredBlobAccess<A, B, RAB, RBA>
where
    A: BlobStorage + Send + Sync + 'static,
    B: BlobStorage + Send + Sync + 'static,
    RAB: BlobReplicator + Send + Sync + 'static,
    RBA: BlobReplicator + Send + Sync + 'static,
{
    async fn find_missing_blobs(
        &self,
        ctx: Context,
        digests: Vec<Digest>,
        state: DriverState,
    ) -> Result<Vec<Digest>, StorageError> {
        // `try_join!` races both futures but returns as soon as either one errors; the other
        // side's in-flight future, if it hasn't errored yet, is dropped unpolled rather than
        // awaited to completion.
        let (missing_a, missing_b) = futures::try_join!(
            self.backend_a
                .find_missing_blobs(ctx.clone(), digests.clone(), state.clone()),
            self.backend_b.find_missing_blobs(ctx.clone(), digests, state),
        )?;

        let set_a: HashSet<_> = missing_a.into_iter().collect();
        let set_b: HashSet<_> = missing_b.into_iter().collect();

        let only_on_a: Vec<Digest> = set_b.difference(&set_a).cloned().collect();
        let only_on_b: Vec<Digest> = set_a.difference(&set_b).cloned().collect();
        let missing_from_both: Vec<Digest> = set_a.intersection(&set_b).cloned().collect();

        let (repair_a_to_b, repair_b_to_a) = futures::join!(
            self.replicator_a_to_b.replicate_multiple(ctx.clone(), only_on_a),
            self.replicator_b_to_a.replicate_multiple(ctx, only_on_b),
        );

        for result in [repair_a_to_b, repair_b_to_a] {
            if let Err(StorageError::NotFound(_)) = result {
                log::error!(
                    "{}/{}: backend reported a digest missing mid-repair",
                    self.name_a,
                    self.name_b
                );
                return Err(StorageError::Internal(
                    "backend returned inconsistent results while synchronising".to_string(),
                ));
            }
            result?;
        }

        Ok(missing_from_both)
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
        let primary_is_a = self.primary_is_a();

        let primary_result = if primary_is_a {
            self.backend_a
                .read_blob(ctx.clone(), digest.clone(), max_batch_size, read_offset, read_limit, state.clone())
                .await
                .map_err(|e| Self::wrap_error(&self.name_a, e))
        } else {
            self.backend_b
                .read_blob(ctx.clone(), digest.clone(), max_batch_size, read_offset, read_limit, state.clone())
                .await
                .map_err(|e| Self::wrap_error(&self.name_b, e))
        };

        match primary_result {
            Ok(Some(stream)) => Ok(Some(stream)),
            Ok(None) => {
                // Transparently replace with replication from the other backend, which also
                // copies the blob back into the failing backend as a side effect.
                let buf = if primary_is_a {
                    self.replicator_b_to_a.replicate_single(ctx, digest).await
                } else {
                    self.replicator_a_to_b.replicate_single(ctx, digest).await
                };
                match buf {
                    Buffer::Stream(s) => Ok(Some(s)),
                    Buffer::Bytes(bytes) => {
                        Ok(Some(Box::pin(futures::stream::once(async move { Ok(bytes) }))))
                    }
                    Buffer::Error(StorageError::NotFound(_)) => Ok(None),
                    Buffer::Error(e) => {
                        let name = if primary_is_a { &self.name_b } else { &self.name_a };
                        Err(Self::wrap_error(name, e))
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn begin_write_blob(
        &self,
        ctx: Context,
        digest: Digest,
        state: DriverState,
    ) -> Result<Box<dyn WriteAttemptOps + Send + Sync + 'static>, StreamingWriteError> {
        let attempt_a = self
            .backend_a
            .begin_write_blob(ctx.clone(), digest.clone(), state.clone())
            .await;
        let attempt_b = self.backend_b.begin_write_blob(ctx, digest, state).await;

        Ok(Box::new(MirroredWriteAttempt {
            attempt_a,
            attempt_b,
            name_a: self.name_a.clone(),
            name_b: self.name_b.clone(),
            mode: self.mode,
        }))
    }

    async fn get_capabilities(
        &self,
        ctx: Context,
        instance_name: &str,
    ) -> Result<ServerCapabilities, StorageError> {
        let primary_is_a = self.primary_is_a();
        let primary = if primary_is_a {
            self.backend_a.get_capabilities(ctx.clone(), instance_name).await
        } else {
            self.backend_b.get_capabilities(ctx.clone(), instance_name).await
        };

        match (primary, self.mode) {
            (Ok(caps), _) => Ok(caps),
            (Err(_), Mode::Resilient) if primary_is_a => {
                self.backend_b.get_capabilities(ctx, instance_name).await
            }
            (Err(_), Mode::Resilient) => self.backend_a.get_capabilities(ctx, instance_name).await,
            (Err(e), Mode::Strict) => Err(e),
        }
    }
}

/// `begin_write_blob` is attempted against both backends up front; a backend that fails to
/// start the write at all is kept as `Err` here rather than discarded, so `commit` sees exactly
/// the same `(err_a, err_b, mode)` shape whether a backend failed at begin time or at commit
/// time -- a backend that never started writing must not be indistinguishable from one that
/// committed nothing because there was nothing to commit.
struct MirroredWriteAttempt {
    attempt_a: Result<Box<dyn WriteAttemptOps + Send + Sync>, StreamingWriteError>,
    attempt_b: Result<Box<dyn WriteAttemptOps + Send + Sync>, StreamingWriteError>,
    name_a: String,
    name_b: String,
    mode: Mode,
}

#[async_trait]
impl WriteAttemptOps for MirroredWriteAttempt {
    async fn write(&mut self, batch: Bytes) -> Result<(), StreamingWriteError> {
        if let Ok(a) = self.attempt_a.as_mut() {
            a.write(batch.clone()).await?;
        }
        if let Ok(b) = self.attempt_b.as_mut() {
            b.write(batch).await?;
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StreamingWriteError> {
        let MirroredWriteAttempt { attempt_a, attempt_b, name_a, name_b, mode } = *self;

        let result_a = match attempt_a {
            Ok(a) => a.commit().await,
            Err(e) => Err(e),
        };
        let result_b = match attempt_b {
            Ok(b) => b.commit().await,
            Err(e) => Err(e),
        };

        let err_a = result_a.err().map(|e| (name_a, e));
        let err_b = result_b.err().map(|e| (name_b, e));

        match (err_a, err_b, mode) {
            (None, None, _) => Ok(()),
            (Some(_), None, Mode::Resilient) | (None, Some(_), Mode::Resilient) => Ok(()),
            // Both failed (or one failed in Strict mode): return the first observed, per
            // `spec.md`'s "on both errors, return the first observed".
            (Some((name, err)), Some((other_name, _)), _) => {
                log::error!("{other_name}: write also failed alongside {name}");
                Err(wrap(name, err))
            }
            (Some((name, err)), None, _) => Err(wrap(name, err)),
            (None, Some((name, err)), _) => Err(wrap(name, err)),
        }
    }
}

fn wrap(name: String, err: StreamingWriteError) -> StreamingWriteError {
    match err {
        StreamingWriteError::StorageError(StorageError::Internal(msg)) => {
            StreamingWriteError::StorageError(StorageError::Internal(format!("{name}: {msg}")))
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::memory::MemoryStorage;
    use crate::mirror::replicator::LocalReplicator;
    use crate::testutil::{AlwaysExistsStorage, TestData};

    fn mirrored_pair() -> (Arc<MemoryStorage>, Arc<MemoryStorage>) {
        let mut a = MemoryStorage::new();
        let mut b = MemoryStorage::new();
        a.ensure_instance("main", DriverState::default());
        b.ensure_instance("main", DriverState::default());
        (Arc::new(a), Arc::new(b))
    }

    fn mirror(
        a: Arc<MemoryStorage>,
        b: Arc<MemoryStorage>,
        mode: Mode,
    ) -> MirroredBlobAccess<
        MemoryStorage,
        MemoryStorage,
        LocalReplicator<MemoryStorage>,
        LocalReplicator<MemoryStorage>,
    > {
        let replicator_a_to_b = LocalReplicator::new(a.clone(), b.clone());
        let replicator_b_to_a = LocalReplicator::new(b.clone(), a.clone());
        MirroredBlobAccess::new(a, "a", b, "b", replicator_a_to_b, replicator_b_to_a, mode)
    }

    #[tokio::test]
    async fn read_blob_repairs_from_the_other_backend_on_miss() {
        let (a, b) = mirrored_pair();
        let content = TestData::from_static("main", b"only on a");
        let mut attempt = a
            .begin_write_blob(Context::new(), content.digest.clone(), DriverState::default())
            .await
            .unwrap();
        attempt.write(content.bytes.clone()).await.unwrap();
        attempt.commit().await.unwrap();

        let mirrored = mirror(a, b.clone(), Mode::Strict);

        // Drive enough reads that the round robin selects b as primary at least once.
        let mut saw_content = false;
        for _ in 0..4 {
            let stream = mirrored
                .read_blob(Context::new(), content.digest.clone(), 1024, None, None, DriverState::default())
                .await
                .unwrap();
            if let Some(stream) = stream {
                let bytes = crate::bytes::consolidate_stream(stream).await.unwrap();
                assert_eq!(bytes, content.bytes);
                saw_content = true;
            }
        }
        assert!(saw_content);

        let missing = b
            .find_missing_blobs(Context::new(), vec![content.digest], DriverState::default())
            .await
            .unwrap();
        assert!(missing.is_empty(), "backend b should have been repaired");
    }

    #[tokio::test]
    async fn find_missing_blobs_synchronises_both_backends() {
        let (a, b) = mirrored_pair();
        let content = TestData::from_static("main", b"only on a, repaired via find_missing");
        let mut attempt = a
            .begin_write_blob(Context::new(), content.digest.clone(), DriverState::default())
            .await
            .unwrap();
        attempt.write(content.bytes.clone()).await.unwrap();
        attempt.commit().await.unwrap();

        let mirrored = mirror(a, b.clone(), Mode::Strict);
        let missing = mirrored
            .find_missing_blobs(Context::new(), vec![content.digest.clone()], DriverState::default())
            .await
            .unwrap();
        assert!(missing.is_empty());

        let missing_on_b = b
            .find_missing_blobs(Context::new(), vec![content.digest], DriverState::default())
            .await
            .unwrap();
        assert!(missing_on_b.is_empty());
    }

    #[tokio::test]
    async fn write_fans_out_to_both_backends() {
        let (a, b) = mirrored_pair();
        let mirrored = mirror(a.clone(), b.clone(), Mode::Strict);
        let content = TestData::from_static("main", b"written to both");

        let mut attempt = mirrored
            .begin_write_blob(Context::new(), content.digest.clone(), DriverState::default())
            .await
            .unwrap();
        attempt.write(content.bytes.clone()).await.unwrap();
        attempt.commit().await.unwrap();

        for backend in [&a, &b] {
            let missing = backend
                .find_missing_blobs(Context::new(), vec![content.digest.clone()], DriverState::default())
                .await
                .unwrap();
            assert!(missing.is_empty());
        }
    }

    fn mirror_with_always_exists_backend(
        mode: Mode,
    ) -> MirroredBlobAccess<
        MemoryStorage,
        AlwaysExistsStorage,
        LocalReplicator<MemoryStorage>,
        LocalReplicator<MemoryStorage>,
    > {
        let mut a = MemoryStorage::new();
        a.ensure_instance("main", DriverState::default());
        let a = Arc::new(a);
        let b = Arc::new(AlwaysExistsStorage);

        // Neither test exercises repair, so these replicators are never invoked.
        let unused_source = Arc::new(MemoryStorage::new());
        let unused_sink = Arc::new(MemoryStorage::new());
        let replicator_a_to_b = LocalReplicator::new(unused_source.clone(), unused_sink.clone());
        let replicator_b_to_a = LocalReplicator::new(unused_sink, unused_source);

        MirroredBlobAccess::new(a, "a", b, "b", replicator_a_to_b, replicator_b_to_a, mode)
    }

    #[tokio::test]
    async fn begin_write_blob_failure_is_surfaced_in_strict_mode() {
        let mirrored = mirror_with_always_exists_backend(Mode::Strict);
        let content = TestData::from_static("main", b"b fails to even start the write");

        let mut attempt = mirrored
            .begin_write_blob(Context::new(), content.digest.clone(), DriverState::default())
            .await
            .unwrap();
        attempt.write(content.bytes.clone()).await.unwrap();
        let result = attempt.commit().await;
        assert!(
            result.is_err(),
            "a backend failing at begin_write_blob time must not be indistinguishable from \
             a no-op commit in Strict mode"
        );
    }

    #[tokio::test]
    async fn begin_write_blob_failure_is_tolerated_in_resilient_mode() {
        let mirrored = mirror_with_always_exists_backend(Mode::Resilient);
        let content = TestData::from_static("main", b"b fails but a succeeds");

        let mut attempt = mirrored
            .begin_write_blob(Context::new(), content.digest.clone(), DriverState::default())
            .await
            .unwrap();
        attempt.write(content.bytes.clone()).await.unwrap();
        attempt.commit().await.unwrap();
    }
}
