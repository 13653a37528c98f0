// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::bytes::consolidate_stream;
use crate::driver::{BoxReadStream, StorageError};

const CLONE_STREAM_CHANNEL_DEPTH: usize = 8;

/// A streamed blob body, per `spec.md` §3/§4.1/§9. No teacher analogue exists for this exact
/// type -- the teacher's `BlobStorage::read_blob` hands back a `BoxReadStream` directly and
/// leaves clone/discard discipline to each caller. `Buffer` centralizes that discipline, grounded
/// in the teacher's `Bytes`/`BoxReadStream`/`async_stream::stream!` idioms (`driver/memory.rs`).
pub enum Buffer {
    /// A live source of bytes, not yet consumed.
    Stream(BoxReadStream),
    /// Already-materialized content (e.g. the result of a `CloneCopy` split).
    Bytes(Bytes),
    /// A buffer that failed before any bytes were produced. `Discard` is a no-op; any read
    /// propagates `error`.
    Error(StorageError),
}

impl Buffer {
    pub fn from_stream(stream: BoxReadStream) -> Self {
        Buffer::Stream(stream)
    }

    pub fn from_bytes(bytes: Bytes) -> Self {
        Buffer::Bytes(bytes)
    }

    pub fn from_error(error: StorageError) -> Self {
        Buffer::Error(error)
    }

    /// Read this buffer to completion, materializing it into a single `Bytes`.
    pub async fn consolidate(self) -> Result<Bytes, StorageError> {
        match self {
            Buffer::Stream(stream) => consolidate_stream(stream).await,
            Buffer::Bytes(bytes) => Ok(bytes),
            Buffer::Error(err) => Err(err),
        }
    }

    /// Release this buffer's resources without reading it. A no-op for `Bytes`/`Error`
    /// variants; for a `Stream`, drops the stream (which, for a `CloneStream` half, releases
    /// this consumer's refcount on the shared producer -- see `clone_stream`).
    pub fn discard(self) {
        drop(self);
    }

    /// Splits this buffer into two independent `Buffer`s, both yielding the same content.
    ///
    /// `Error` buffers split into two copies of the same error (discarding either is a no-op,
    /// per `spec.md` §3). `Bytes` buffers split via cheap refcounted clone (`CloneCopy`, no
    /// teacher analogue needed: `Bytes::clone` already shares the backing allocation). `Stream`
    /// buffers split via `clone_stream`, a single producer task teeing reads to both consumers.
    pub fn clone_split(self) -> (Buffer, Buffer) {
        match self {
            Buffer::Error(err) => (Buffer::Error(err.clone()), Buffer::Error(err)),
            Buffer::Bytes(bytes) => (Buffer::Bytes(bytes.clone()), Buffer::Bytes(bytes)),
            Buffer::Stream(stream) => clone_stream(stream),
        }
    }

    /// Materializes this buffer into memory and hands out two independent readers over the
    /// same `Bytes` -- the `CloneCopy` strategy from `spec.md` §3, preferred over `clone_split`
    /// when the caller knows it will need the full content anyway (e.g. AC quorum-match, which
    /// must decode the whole body regardless).
    pub async fn clone_copy(self) -> Result<(Buffer, Buffer), StorageError> {
        let bytes = self.consolidate().await?;
        Ok((Buffer::Bytes(bytes.clone()), Buffer::Bytes(bytes)))
    }
}

/// Implements the `CloneStream` split: a single producer task drains `source` once and tees
/// each chunk to two bounded channels. A shared refcount (the two `Sender` halves, dropped when
/// either consumer's `Buffer` is dropped) lets the producer notice when one side has gone away
/// without needing the other side to keep consuming -- per `spec.md` §9's requirement that
/// discarding one half must not stall the other.
fn clone_stream(mut source: BoxReadStream) -> (Buffer, Buffer) {
    let (tx_a, rx_a) = mpsc::channel::<Result<Bytes, StorageError>>(CLONE_STREAM_CHANNEL_DEPTH);
    let (tx_b, rx_b) = mpsc::channel::<Result<Bytes, StorageError>>(CLONE_STREAM_CHANNEL_DEPTH);

    tokio::spawn(async move {
        while let Some(item) = source.next().await {
            let a_alive = !tx_a.is_closed();
            let b_alive = !tx_b.is_closed();
            if !a_alive && !b_alive {
                // Both consumers discarded their half; stop pulling from the source.
                return;
            }
            let stop = item.is_err();
            if a_alive && tx_a.send(item.clone()).await.is_err() {
                // consumer a dropped, ignore
            }
            if b_alive && tx_b.send(item).await.is_err() {
                // consumer b dropped, ignore
            }
            if stop {
                return;
            }
        }
    });

    let stream_a: BoxReadStream = Box::pin(ReceiverStream::new(rx_a));
    let stream_b: BoxReadStream = Box::pin(ReceiverStream::new(rx_b));
    (Buffer::Stream(stream_a), Buffer::Stream(stream_b))
}

/// Tees a buffer into a background write against `sink` plus a `Buffer` handed back to the
/// caller, used by the mirrored replication layer's repair-on-read path (`spec.md` §4.3.1,
/// §4.3.4's "returned buffer ... typically via a tee"). `sink_write` is the backend-specific
/// write closure (usually a `BlobStorage::begin_write_blob`/`write`/`commit` sequence).
pub fn tee_to_sink(
    buffer: Buffer,
) -> (Buffer, Arc<Mutex<Option<BoxReadStream>>>) {
    match buffer {
        Buffer::Stream(stream) => {
            let (caller_buf, sink_buf) = clone_stream(stream);
            let sink_stream = match sink_buf {
                Buffer::Stream(s) => s,
                _ => unreachable!("clone_stream always returns Stream halves"),
            };
            (caller_buf, Arc::new(Mutex::new(Some(sink_stream))))
        }
        other @ (Buffer::Bytes(_) | Buffer::Error(_)) => {
            let (a, b) = other.clone_split();
            let sink_stream: BoxReadStream = match b {
                Buffer::Bytes(bytes) => {
                    Box::pin(futures::stream::once(async move { Ok(bytes) }))
                }
                Buffer::Error(err) => Box::pin(futures::stream::once(async move { Err(err) })),
                Buffer::Stream(_) => unreachable!(),
            };
            (a, Arc::new(Mutex::new(Some(sink_stream))))
        }
    }
}
