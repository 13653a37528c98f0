// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

pub mod replicator;
pub mod tri;
pub mod two_way;

pub use replicator::{BlobReplicator, LocalReplicator, QueuedReplicator};
pub use tri::{ThreeBackends, TriMirroredActionCache, TriMirroredBlobAccess};
pub use two_way::{MirroredBlobAccess, Mode};
