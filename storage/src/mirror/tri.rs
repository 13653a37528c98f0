// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use digest::Digest;

use crate::buffer::Buffer;
use crate::driver::{
    BlobStorage, BoxReadStream, Context, DriverState, StorageError, StreamingWriteError,
    WriteAttemptOps,
};

/// Maximum tolerated backend failures on a three-way write, per `spec.md` §4.3.2.
const MAX_ERR: usize = 1;

/// The three backends a `TriMirroredBlobAccess`/`TriMirroredActionCache` replicates across,
/// named for error-wrapping (`spec.md` §7's "decorators wrap errors with a contextual prefix").
pub struct ThreeBackends<S> {
    pub backends: [Arc<S>; 3],
    pub names: [String; 3],
}

impl<S> ThreeBackends<S>
where
    S: BlobStorage + Send + Sync + 'static,
{
    pub fn new(backends: [Arc<S>; 3], names: [String; 3]) -> Self {
        Self { backends, names }
    }

    /// Fires three `Get`s in parallel and classifies the outcome, per `spec.md` §4.3.2's
    /// "concurrent read primitive". Grounded in `driver/sharding.rs`'s `future::join_all`
    /// fan-out shape (`spec.md` §6's mirrored-layer grounding), rewritten per `spec.md` §9's
    /// redesign flag as a message-passing join rather than a condvar/counter.
    async fn get_all(&self, ctx: Context, digest: Digest) -> [Result<Option<Bytes>, StorageError>; 3] {
        let futs = self.backends.iter().map(|backend| {
            let ctx = ctx.clone();
            let digest = digest.clone();
            async move {
                match backend
                    .read_blob(ctx, digest, 64 * 1024, None, None, DriverState::default())
                    .await?
                {
                    Some(stream) => {
                        let bytes = crate::bytes::consolidate_stream(stream).await?;
                        Ok(Some(bytes))
                    }
                    None => Ok(None),
                }
            }
        });

        let results = futures::future::join_all(futs).await;
        results
            .try_into()
            .unwrap_or_else(|_| unreachable!("join_all over exactly 3 backends yields 3 results"))
    }

    async fn put_one(&self, idx: usize, ctx: Context, digest: Digest, bytes: Bytes) -> Result<(), StorageError> {
        let attempt = self.backends[idx]
            .begin_write_blob(ctx, digest, DriverState::default())
            .await;
        let mut attempt = match attempt {
            Ok(a) => a,
            Err(StreamingWriteError::AlreadyExists) => return Ok(()),
            Err(StreamingWriteError::StorageError(e)) => return Err(e),
        };
        attempt
            .write(bytes)
            .await
            .map_err(|e| StorageError::Internal(format!("{}: {e:?}", self.names[idx])))?;
        match attempt.commit().await {
            Ok(()) | Err(StreamingWriteError::AlreadyExists) => Ok(()),
            Err(StreamingWriteError::StorageError(e)) => Err(StorageError::Internal(format!(
                "{}: {e}",
                self.names[idx]
            ))),
        }
    }
}

/// CAS (content-addressed) specialization of the three-way mirror (`spec.md` §4.3.2). Repairs
/// are best-effort: any backend missing a blob the others have gets it replicated; writes
/// tolerate at most `MAX_ERR` backend failures.
pub struct TriMirroredBlobAccess<S> {
    backends: ThreeBackends<S>,
}

impl<S> TriMirroredBlobAccess<S>
where
    S: BlobStorage + Send + Sync + 'static,
{
    pub fn new(backends: ThreeBackends<S>) -> Self {
        Self { backends }
    }
}

#[async_trait]
impl<S> BlobStorage for TriMirroredBlobAccess<S>
where
    S: BlobStorage + Send + Sync + 'static,
{
    async fn find_missing_blobs(
        &self,
        ctx: Context,
        digests: Vec<Digest>,
        state: DriverState,
    ) -> Result<Vec<Digest>, StorageError> {
        let futs = self.backends.backends.iter().map(|backend| {
            backend.find_missing_blobs(ctx.clone(), digests.clone(), state.clone())
        });
        let results = futures::future::join_all(futs).await;

        let responded: Vec<_> = results.into_iter().filter_map(Result::ok).collect();
        if responded.len() < 2 {
            log::error!(
                "find_missing_blobs: only {} of 3 backends responded",
                responded.len()
            );
            return Err(StorageError::Unavailable(
                "Too many failures: fewer than two backends responded".to_string(),
            ));
        }

        // Reference count per digest across responding backends: a digest present on a
        // responding backend is one that backend did NOT report missing.
        let mut missing_from_all: Vec<Digest> = digests.clone();
        let mut present_count: std::collections::HashMap<Digest, usize> =
            digests.iter().cloned().map(|d| (d, 0)).collect();

        for missing in &responded {
            let missing_set: std::collections::HashSet<_> = missing.iter().cloned().collect();
            for digest in &digests {
                if !missing_set.contains(digest) {
                    *present_count.get_mut(digest).unwrap() += 1;
                }
            }
        }
        missing_from_all.retain(|d| *present_count.get(d).unwrap() == 0);

        // Replicate any digest present on fewer than 2 responding backends, to restore quorum.
        for digest in &digests {
            let count = *present_count.get(digest).unwrap();
            if count == 0 || count >= 2 {
                continue;
            }
            let source_bytes = self.backends.get_all(ctx.clone(), digest.clone()).await;
            let Some(bytes) = source_bytes.into_iter().find_map(Result::ok).flatten() else {
                continue;
            };
            for idx in 0..3 {
                if let Ok(found) = self.backends.backends[idx]
                    .find_missing_blobs(ctx.clone(), vec![digest.clone()], state.clone())
                    .await
                {
                    if found.contains(digest) {
                        if let Err(e) = self
                            .backends
                            .put_one(idx, ctx.clone(), digest.clone(), bytes.clone())
                            .await
                        {
                            return Err(StorageError::Internal(format!(
                                "failed repairing quorum for {digest}: {e}"
                            )));
                        }
                    }
                }
            }
        }

        Ok(missing_from_all)
    }

    async fn read_blob(
        &self,
        ctx: Context,
        digest: Digest,
        _max_batch_size: usize,
        read_offset: Option<usize>,
        read_limit: Option<usize>,
        _state: DriverState,
    ) -> Result<Option<BoxReadStream>, StorageError> {
        let results = self.backends.get_all(ctx.clone(), digest.clone()).await;

        let source = results.iter().enumerate().find_map(|(idx, r)| match r {
            Ok(Some(bytes)) => Some((idx, bytes.clone())),
            _ => None,
        });

        let Some((source_idx, bytes)) = source else {
            for r in &results {
                if let Err(e) = r {
                    if !matches!(e, StorageError::NotFound(_)) {
                        return Err(e.clone());
                    }
                }
            }
            return Ok(None);
        };

        // Repair any backend that returned NotFound (shouldCopy), in the background.
        for idx in 0..3 {
            if idx != source_idx && matches!(results[idx], Ok(None)) {
                let _ = self
                    .backends
                    .put_one(idx, ctx.clone(), digest.clone(), bytes.clone())
                    .await;
            }
        }

        let start = read_offset.unwrap_or(0);
        let end = read_limit.map(|l| start + l).unwrap_or(bytes.len()).min(bytes.len());
        let slice = bytes.slice(start.min(bytes.len())..end);
        Ok(Some(Box::pin(futures::stream::once(async move { Ok(slice) }))))
    }

    async fn begin_write_blob(
        &self,
        ctx: Context,
        digest: Digest,
        _state: DriverState,
    ) -> Result<Box<dyn WriteAttemptOps + Send + Sync + 'static>, StreamingWriteError> {
        Ok(Box::new(TriCasWriteAttempt {
            ctx,
            digest,
            content: bytes::BytesMut::new(),
            backends: self.backends.backends.clone(),
            names: self.backends.names.clone(),
        }))
    }
}

struct TriCasWriteAttempt<S> {
    ctx: Context,
    digest: Digest,
    content: bytes::BytesMut,
    backends: [Arc<S>; 3],
    names: [String; 3],
}

#[async_trait]
impl<S> WriteAttemptOps for TriCasWriteAttempt<S>
where
    S: BlobStorage + Send + Sync + 'static,
{
    async fn write(&mut self, batch: Bytes) -> Result<(), StreamingWriteError> {
        self.content.extend_from_slice(&batch[..]);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StreamingWriteError> {
        let bytes = self.content.freeze();
        let backends = ThreeBackends {
            backends: self.backends,
            names: self.names.clone(),
        };

        let futs = (0..3).map(|idx| {
            backends.put_one(idx, self.ctx.clone(), self.digest.clone(), bytes.clone())
        });
        let results = futures::future::join_all(futs).await;

        let failed: Vec<&str> = results
            .iter()
            .zip(self.names.iter())
            .filter_map(|(r, name)| r.as_ref().err().map(|_| name.as_str()))
            .collect();

        if failed.len() > MAX_ERR {
            log::error!("commit: write failed on {}", failed.join(", "));
            return Err(StreamingWriteError::StorageError(StorageError::Internal(
                format!("Too many failures: {}", failed.join(", ")),
            )));
        }

        Ok(())
    }
}

/// AC (action-cache) specialization of the three-way mirror (`spec.md` §4.3.2). Uses
/// byte-equality quorum-match (body decoding beyond the `BlobAccess` boundary is a non-goal per
/// `spec.md` §1) and performs race-detection retry on writes.
pub struct TriMirroredActionCache<S> {
    backends: ThreeBackends<S>,
}

/// Result of comparing up to three AC bodies for equality (`spec.md` §4.3.2's quorum match).
enum QuorumResult {
    /// All three (or the two present) bodies agree; the matching body and the indices that
    /// hold it.
    Match { body: Bytes, holders: Vec<usize> },
    /// No pair of present bodies agrees.
    NoQuorum,
}

impl<S> TriMirroredActionCache<S>
where
    S: BlobStorage + Send + Sync + 'static,
{
    pub fn new(backends: ThreeBackends<S>) -> Self {
        Self { backends }
    }

    /// Groups up to three bodies by size (different sizes cannot match) then by equality within
    /// a size class, per `spec.md` §4.3.2.
    fn quorum_match(bodies: &[Result<Option<Bytes>, StorageError>; 3]) -> QuorumResult {
        let present: Vec<(usize, &Bytes)> = bodies
            .iter()
            .enumerate()
            .filter_map(|(idx, r)| match r {
                Ok(Some(b)) => Some((idx, b)),
                _ => None,
            })
            .collect();

        for i in 0..present.len() {
            let mut holders = vec![present[i].0];
            for j in 0..present.len() {
                if i != j && present[i].1.len() == present[j].1.len() && present[i].1 == present[j].1 {
                    holders.push(present[j].0);
                }
            }
            if holders.len() >= 2 {
                holders.sort_unstable();
                holders.dedup();
                return QuorumResult::Match {
                    body: present[i].1.clone(),
                    holders,
                };
            }
        }

        QuorumResult::NoQuorum
    }

    /// Writes an invalidated marker over `digest` at backend `idx`: a modified body (synthetic
    /// nonzero exit-code marker, per `spec.md` §4.3.2) so that a subsequent Get does not return
    /// stale/disagreeing content.
    async fn invalidate(&self, ctx: Context, idx: usize, digest: &Digest) -> Result<(), StorageError> {
        let marker = Bytes::from_static(b"\0INVALIDATED-BY-QUORUM-MISMATCH\0");
        self.backends
            .put_one(idx, ctx, digest.clone(), marker)
            .await
    }

    pub async fn get(&self, ctx: Context, digest: Digest) -> Buffer {
        let bodies = self.backends.get_all(ctx.clone(), digest.clone()).await;
        let present_count = bodies.iter().filter(|r| matches!(r, Ok(Some(_)))).count();

        match (present_count, Self::quorum_match(&bodies)) {
            (3, QuorumResult::Match { body, holders }) if holders.len() == 3 => Buffer::from_bytes(body),
            (_, QuorumResult::Match { body, holders }) if holders.len() == 2 => {
                // Invalidate the mismatched (or absent) third backend; replicate if missing.
                for idx in 0..3 {
                    if !holders.contains(&idx) {
                        if matches!(bodies[idx], Ok(None)) {
                            let _ = self.backends.put_one(idx, ctx.clone(), digest.clone(), body.clone()).await;
                        } else {
                            let _ = self.invalidate(ctx.clone(), idx, &digest).await;
                        }
                    }
                }
                Buffer::from_bytes(body)
            }
            _ => {
                // No quorum: invalidate every backend that has a body, return NotFound.
                for (idx, r) in bodies.iter().enumerate() {
                    if matches!(r, Ok(Some(_))) {
                        let _ = self.invalidate(ctx.clone(), idx, &digest).await;
                    }
                }
                Buffer::from_error(StorageError::NotFound(format!(
                    "{digest} failed AC quorum match across replicas"
                )))
            }
        }
    }

    pub async fn put(&self, ctx: Context, digest: Digest, body: Bytes) -> Result<(), StorageError> {
        let futs = (0..3).map(|idx| {
            self.backends.put_one(idx, ctx.clone(), digest.clone(), body.clone())
        });
        let results = futures::future::join_all(futs).await;
        let failed: Vec<usize> = results
            .iter()
            .enumerate()
            .filter_map(|(idx, r)| r.as_ref().err().map(|_| idx))
            .collect();

        if failed.len() > MAX_ERR {
            if failed.len() == 2 {
                let succeeded = (0..3).find(|idx| !failed.contains(idx));
                if let Some(idx) = succeeded {
                    let _ = self.invalidate(ctx, idx, &digest).await;
                }
            }
            return Err(StorageError::Internal(format!(
                "Too many failures writing AC entry for {digest}"
            )));
        }

        // Race detection: read back from the successful backends, quorum-match.
        let readback = self.backends.get_all(ctx.clone(), digest.clone()).await;
        if matches!(Self::quorum_match(&readback), QuorumResult::Match { .. }) {
            return Ok(());
        }

        // Retry once.
        let futs = (0..3).map(|idx| {
            self.backends.put_one(idx, ctx.clone(), digest.clone(), body.clone())
        });
        let _ = futures::future::join_all(futs).await;

        let readback = self.backends.get_all(ctx, digest.clone()).await;
        if matches!(Self::quorum_match(&readback), QuorumResult::Match { .. }) {
            Ok(())
        } else {
            Err(StorageError::Aborted(format!(
                "race recovery failed for {digest}"
            )))
        }
    }

    /// The Action Cache has no bulk-existence surface in REv2 (`spec.md` §4.3.2).
    pub async fn find_missing_blobs(&self) -> Result<(), StorageError> {
        Err(StorageError::Unimplemented(
            "FindMissing is not implemented for the Action Cache".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::memory::MemoryStorage;
    use crate::testutil::TestData;

    fn three_memory_backends() -> ThreeBackends<MemoryStorage> {
        let mut a = MemoryStorage::new();
        let mut b = MemoryStorage::new();
        let mut c = MemoryStorage::new();
        a.ensure_instance("main", DriverState::default());
        b.ensure_instance("main", DriverState::default());
        c.ensure_instance("main", DriverState::default());
        ThreeBackends::new(
            [Arc::new(a), Arc::new(b), Arc::new(c)],
            ["a".to_string(), "b".to_string(), "c".to_string()],
        )
    }

    #[tokio::test]
    async fn cas_get_repairs_missing_backend() {
        let backends = three_memory_backends();
        let content = TestData::from_static("main", b"hello");

        let mut attempt = backends.backends[0]
            .begin_write_blob(Context::new(), content.digest.clone(), DriverState::default())
            .await
            .unwrap();
        attempt.write(content.bytes.clone()).await.unwrap();
        attempt.commit().await.unwrap();

        let tri = TriMirroredBlobAccess::new(backends);
        let stream = tri
            .read_blob(Context::new(), content.digest.clone(), 1024, None, None, DriverState::default())
            .await
            .unwrap()
            .unwrap();
        let bytes = crate::bytes::consolidate_stream(stream).await.unwrap();
        assert_eq!(bytes, content.bytes);

        // backend B should now have been repaired.
        let missing = tri.backends.backends[1]
            .find_missing_blobs(Context::new(), vec![content.digest], DriverState::default())
            .await
            .unwrap();
        assert!(missing.is_empty());
    }

    #[tokio::test]
    async fn ac_get_with_three_matching_bodies_returns_match() {
        let backends = three_memory_backends();
        let content = TestData::from_static("main", b"result");
        let ac = TriMirroredActionCache::new(backends);

        ac.put(Context::new(), content.digest.clone(), content.bytes.clone())
            .await
            .unwrap();

        let buf = ac.get(Context::new(), content.digest).await;
        let bytes = buf.consolidate().await.unwrap();
        assert_eq!(bytes, content.bytes);
    }

    #[tokio::test]
    async fn ac_get_with_one_mismatch_invalidates_and_returns_majority() {
        let backends = three_memory_backends();
        let digest = TestData::from_static("main", b"x").digest;
        let good = Bytes::from_static(b"X");
        let bad = Bytes::from_static(b"YY");

        for idx in [0usize, 2] {
            let mut attempt = backends.backends[idx]
                .begin_write_blob(Context::new(), digest.clone(), DriverState::default())
                .await
                .unwrap();
            attempt.write(good.clone()).await.unwrap();
            attempt.commit().await.unwrap();
        }
        let mut attempt = backends.backends[1]
            .begin_write_blob(Context::new(), digest.clone(), DriverState::default())
            .await
            .unwrap();
        attempt.write(bad).await.unwrap();
        attempt.commit().await.unwrap();

        let ac = TriMirroredActionCache::new(backends);
        let buf = ac.get(Context::new(), digest).await;
        let bytes = buf.consolidate().await.unwrap();
        assert_eq!(bytes, good);
    }
}
