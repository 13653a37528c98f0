// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use digest::HashFunction;
use itertools::Itertools;

/// A `(major, minor)` REv2 API version. Ordered so that the merge rule in `spec.md` §6 ("MAX of
/// lows, MIN of highs") can be expressed with plain `Ord`.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ApiVersion {
    pub major: i32,
    pub minor: i32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CacheCapabilities {
    pub digest_functions: Vec<HashFunction>,
    pub action_cache_update_enabled: bool,
    pub compressors: Vec<String>,
    pub max_batch_total_size_bytes: i64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExecutionCapabilities {
    pub digest_functions: Vec<HashFunction>,
    pub exec_enabled: bool,
}

/// A server-capabilities descriptor, per `spec.md` §6: `(low_api_version, high_api_version,
/// deprecated_api_version, cache_capabilities, execution_capabilities)`. Each sub-provider
/// (a `BlobStorage::get_capabilities` implementor) returns one of these for its own subsystem;
/// `merge` combines any number of them into the descriptor the caller actually reports.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ServerCapabilities {
    pub low_api_version: Option<ApiVersion>,
    pub high_api_version: Option<ApiVersion>,
    pub deprecated_api_version: Option<ApiVersion>,
    pub cache_capabilities: Option<CacheCapabilities>,
    pub execution_capabilities: Option<ExecutionCapabilities>,
}

/// Combines per-subsystem `ServerCapabilities` responses into one descriptor, per `spec.md` §6's
/// merge rule. No teacher analogue exists for this specific merge (the teacher's
/// `capabilities_service.rs` reports a single hardcoded descriptor); this is authored fresh,
/// grounded in the general "combine N decorator responses" shape already used by
/// `existence_cache`'s cache-then-query-underlying pattern.
pub fn merge(providers: impl IntoIterator<Item = ServerCapabilities>) -> ServerCapabilities {
    providers
        .into_iter()
        .fold(ServerCapabilities::default(), merge_pair)
}

fn merge_pair(a: ServerCapabilities, b: ServerCapabilities) -> ServerCapabilities {
    let (low_api_version, high_api_version) = merge_version_range(
        a.low_api_version,
        a.high_api_version,
        b.low_api_version,
        b.high_api_version,
    );

    let deprecated_api_version = match (a.deprecated_api_version, b.deprecated_api_version) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (Some(x), None) | (None, Some(x)) => Some(x),
        (None, None) => None,
    };

    ServerCapabilities {
        low_api_version,
        high_api_version,
        deprecated_api_version,
        cache_capabilities: merge_option(a.cache_capabilities, b.cache_capabilities, |x, y| {
            CacheCapabilities {
                digest_functions: x
                    .digest_functions
                    .into_iter()
                    .chain(y.digest_functions)
                    .unique()
                    .collect(),
                action_cache_update_enabled: x.action_cache_update_enabled
                    || y.action_cache_update_enabled,
                compressors: x.compressors.into_iter().chain(y.compressors).unique().collect(),
                max_batch_total_size_bytes: x
                    .max_batch_total_size_bytes
                    .max(y.max_batch_total_size_bytes),
            }
        }),
        execution_capabilities: merge_option(
            a.execution_capabilities,
            b.execution_capabilities,
            |x, y| ExecutionCapabilities {
                digest_functions: x
                    .digest_functions
                    .into_iter()
                    .chain(y.digest_functions)
                    .unique()
                    .collect(),
                exec_enabled: x.exec_enabled || y.exec_enabled,
            },
        ),
    }
}

/// Intersects `[a_low, a_high]` and `[b_low, b_high]`: MAX of the lows, MIN of the highs. If the
/// resulting range is empty (the backends' supported ranges don't overlap at all), both bounds
/// are unset, per `spec.md` §6.
fn merge_version_range(
    a_low: Option<ApiVersion>,
    a_high: Option<ApiVersion>,
    b_low: Option<ApiVersion>,
    b_high: Option<ApiVersion>,
) -> (Option<ApiVersion>, Option<ApiVersion>) {
    let low = match (a_low, b_low) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (Some(x), None) | (None, Some(x)) => Some(x),
        (None, None) => None,
    };
    let high = match (a_high, b_high) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (Some(x), None) | (None, Some(x)) => Some(x),
        (None, None) => None,
    };
    match (low, high) {
        (Some(low), Some(high)) if low > high => (None, None),
        other => other,
    }
}

fn merge_option<T>(a: Option<T>, b: Option<T>, combine: impl FnOnce(T, T) -> T) -> Option<T> {
    match (a, b) {
        (Some(x), Some(y)) => Some(combine(x, y)),
        (Some(x), None) | (None, Some(x)) => Some(x),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use digest::HashFunction;

    use super::{merge, ApiVersion, CacheCapabilities, ServerCapabilities};

    #[test]
    fn merges_concatenates_digest_functions() {
        let a = ServerCapabilities {
            cache_capabilities: Some(CacheCapabilities {
                digest_functions: vec![HashFunction::Sha256],
                ..Default::default()
            }),
            ..Default::default()
        };
        let b = ServerCapabilities {
            cache_capabilities: Some(CacheCapabilities {
                digest_functions: vec![HashFunction::Blake3],
                ..Default::default()
            }),
            ..Default::default()
        };

        let merged = merge([a, b]);
        assert_eq!(
            merged.cache_capabilities.unwrap().digest_functions,
            vec![HashFunction::Sha256, HashFunction::Blake3]
        );
    }

    #[test]
    fn merges_ors_booleans() {
        let a = ServerCapabilities {
            cache_capabilities: Some(CacheCapabilities {
                action_cache_update_enabled: true,
                ..Default::default()
            }),
            ..Default::default()
        };
        let b = ServerCapabilities {
            cache_capabilities: Some(CacheCapabilities::default()),
            ..Default::default()
        };

        let merged = merge([a, b]);
        assert!(merged.cache_capabilities.unwrap().action_cache_update_enabled);
    }

    #[test]
    fn merges_intersects_overlapping_version_ranges() {
        let a = ServerCapabilities {
            low_api_version: Some(ApiVersion { major: 2, minor: 0 }),
            high_api_version: Some(ApiVersion { major: 2, minor: 3 }),
            ..Default::default()
        };
        let b = ServerCapabilities {
            low_api_version: Some(ApiVersion { major: 2, minor: 1 }),
            high_api_version: Some(ApiVersion { major: 2, minor: 2 }),
            ..Default::default()
        };

        let merged = merge([a, b]);
        assert_eq!(merged.low_api_version, Some(ApiVersion { major: 2, minor: 1 }));
        assert_eq!(merged.high_api_version, Some(ApiVersion { major: 2, minor: 2 }));
    }

    #[test]
    fn merges_unsets_disjoint_version_ranges() {
        let a = ServerCapabilities {
            low_api_version: Some(ApiVersion { major: 1, minor: 0 }),
            high_api_version: Some(ApiVersion { major: 1, minor: 1 }),
            ..Default::default()
        };
        let b = ServerCapabilities {
            low_api_version: Some(ApiVersion { major: 2, minor: 0 }),
            high_api_version: Some(ApiVersion { major: 2, minor: 1 }),
            ..Default::default()
        };

        let merged = merge([a, b]);
        assert_eq!(merged.low_api_version, None);
        assert_eq!(merged.high_api_version, None);
    }

    #[test]
    fn merges_takes_max_of_deprecated_version() {
        let a = ServerCapabilities {
            deprecated_api_version: Some(ApiVersion { major: 1, minor: 0 }),
            ..Default::default()
        };
        let b = ServerCapabilities {
            deprecated_api_version: Some(ApiVersion { major: 1, minor: 5 }),
            ..Default::default()
        };

        let merged = merge([a, b]);
        assert_eq!(
            merged.deprecated_api_version,
            Some(ApiVersion { major: 1, minor: 5 })
        );
    }
}
