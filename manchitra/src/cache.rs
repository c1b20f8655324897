// Copyright (C) 2025-2026 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of manchitra.
//
// manchitra is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// manchitra is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with manchitra.  If not,
// see <http://www.gnu.org/licenses/>.

//! # cache
//!
//! The manchitra read-through cache.
//!
//! The cache is *never* the source of truth: every value it holds is reconstructable from the
//! counters & the catalog, and it may be emptied at any moment with no effect beyond latency. The
//! contract that matters here is at the call sites, not in the implementations:
//! [best_effort_get] & [best_effort_put] bound each cache operation with a timeout and absorb
//! every failure, logging it & degrading to a miss. A request must never fail-- or even block--
//! because the cache is sick. Tests hold the whole crate to that by swapping in [Disabled] &
//! asserting that responses don't change.
//!
//! Cache keys are a composite of the operation name & its normalized parameters (e.g.
//! `suggest:old delhi:10`); expiry is the only invalidation. A freshly-added place can thus be
//! invisible to a cached suggestion list for up to the TTL-- bounded staleness, accepted by
//! design.

use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use snafu::{prelude::*, Backtrace};
use tracing::warn;

#[derive(Debug, Snafu)]
pub enum Error {
    // Generic variant for implementations backed by an external service
    #[snafu(display("Cache unavailable: {source}"))]
    Unavailable {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// How long we'll wait on the cache before giving up & taking the authoritative path
const CACHE_TIMEOUT: Duration = Duration::from_millis(250);

/// Object-safe trait abstracting over the cache implementation
///
/// Values are serialized strings; the callers own the encoding (JSON at present). Implementations
/// are free to evict at will-- callers may not assume a put is ever readable.
#[async_trait]
pub trait Cache {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    async fn health_check(&self) -> Result<()>;
}

/// Consult the cache, absorbing every failure mode into a miss
///
/// Timeouts, transport errors, poisoned state-- the caller sees `None` & a warning in the log.
pub async fn best_effort_get(cache: &(dyn Cache + Send + Sync), key: &str) -> Option<String> {
    match tokio::time::timeout(CACHE_TIMEOUT, cache.get(key)).await {
        Ok(Ok(hit)) => hit,
        Ok(Err(err)) => {
            warn!("cache read for {key} failed ({err}); continuing without");
            None
        }
        Err(_) => {
            warn!("cache read for {key} timed-out; continuing without");
            None
        }
    }
}

/// Populate the cache, absorbing every failure mode
pub async fn best_effort_put(
    cache: &(dyn Cache + Send + Sync),
    key: &str,
    value: &str,
    ttl: Duration,
) {
    match tokio::time::timeout(CACHE_TIMEOUT, cache.set_with_ttl(key, value, ttl)).await {
        Ok(Ok(())) => (),
        Ok(Err(err)) => warn!("cache write for {key} failed ({err}); continuing without"),
        Err(_) => warn!("cache write for {key} timed-out; continuing without"),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           InProcess                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// In-process TTL cache
///
/// A map from key to (value, expiry instant). Expired entries are dropped lazily on read; there is
/// no background sweeper (the working set here is a few hundred suggestion lists, not worth a
/// task).
#[derive(Default)]
pub struct InProcess {
    entries: RwLock<HashMap<String, (String, Instant)>>,
}

impl InProcess {
    pub fn new() -> InProcess {
        InProcess::default()
    }
}

#[async_trait]
impl Cache for InProcess {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let expired = {
            let entries = self
                .entries
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            match entries.get(key) {
                Some((value, expires)) if *expires > Instant::now() => {
                    return Ok(Some(value.clone()));
                }
                Some(_) => true,
                None => false,
            }
        };
        if expired {
            self.entries
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(key);
        }
        Ok(None)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), (value.to_owned(), Instant::now() + ttl));
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Disabled                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The null cache: every read misses, every write is dropped
///
/// Exists to prove the "cache is best-effort" contract: any test (or deployment) may use this in
/// place of a real cache & observe identical responses.
pub struct Disabled;

#[async_trait]
impl Cache for Disabled {
    async fn get(&self, _key: &str) -> Result<Option<String>> {
        Ok(None)
    }
    async fn set_with_ttl(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<()> {
        Ok(())
    }
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // A cache that's always down; used to verify the best-effort wrappers
    struct Down;

    #[derive(Debug, Snafu)]
    #[snafu(display("connection refused"))]
    struct Refused;

    #[async_trait]
    impl Cache for Down {
        async fn get(&self, _key: &str) -> Result<Option<String>> {
            Err(Error::Unavailable {
                source: Box::new(Refused),
                backtrace: Backtrace::capture(),
            })
        }
        async fn set_with_ttl(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<()> {
            Err(Error::Unavailable {
                source: Box::new(Refused),
                backtrace: Backtrace::capture(),
            })
        }
        async fn health_check(&self) -> Result<()> {
            Err(Error::Unavailable {
                source: Box::new(Refused),
                backtrace: Backtrace::capture(),
            })
        }
    }

    #[tokio::test]
    async fn hit_within_ttl_miss_after() {
        let cache = InProcess::new();
        cache
            .set_with_ttl("suggest:park:10", "[]", Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(
            Some("[]".to_owned()),
            cache.get("suggest:park:10").await.unwrap()
        );
        cache
            .set_with_ttl("suggest:lake:10", "[]", Duration::from_millis(0))
            .await
            .unwrap();
        assert_eq!(None, cache.get("suggest:lake:10").await.unwrap());
    }

    #[tokio::test]
    async fn overwrite_refreshes_ttl() {
        let cache = InProcess::new();
        cache
            .set_with_ttl("k", "v1", Duration::from_millis(0))
            .await
            .unwrap();
        cache
            .set_with_ttl("k", "v2", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(Some("v2".to_owned()), cache.get("k").await.unwrap());
    }

    #[tokio::test]
    async fn failures_degrade_to_misses() {
        let down = Down;
        assert_eq!(None, best_effort_get(&down, "k").await);
        // Must not propagate or panic
        best_effort_put(&down, "k", "v", Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn disabled_always_misses() {
        let cache = Disabled;
        cache
            .set_with_ttl("k", "v", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(None, cache.get("k").await.unwrap());
        assert!(cache.health_check().await.is_ok());
    }
}
