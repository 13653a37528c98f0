// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![allow(clippy::new_without_default, clippy::len_without_is_empty)]

pub mod buffer;
mod bytes;
pub mod circular;
pub mod driver;
pub mod mirror;
pub mod testutil;

pub use digest::Digest;
