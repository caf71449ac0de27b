// Copyright (C) 2026 The warble developers
//
// This file is part of warble.
//
// warble is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// warble is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with warble.  If not,
// see <http://www.gnu.org/licenses/>.

//! # cache
//!
//! Abstractions for the warble cache layer.
//!
//! The cache stores serialized [CachePage](crate::entities::CachePage)s under keys of the form
//! `timeline:{viewer}:{limit}:{offset}`, & serialized tweets under `tweet:{id}`. Every entry
//! carries a TTL; the TTL is the consistency backstop, bounding staleness even if every
//! invalidation in the system were to be lost.
//!
//! Callers should treat every error from this module as absorbable: the store remains the
//! source of truth, so a failed `get` is a cache miss & a failed `delete` is covered by the
//! TTL. The timeline engine logs & degrades; it never surfaces these errors to its callers.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{redis, Config, Pool, Runtime};
use snafu::{prelude::*, Backtrace};

use crate::entities::{TweetId, UserId};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to create the Redis connection pool: {source}"))]
    CreatePool {
        source: deadpool_redis::CreatePoolError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to check-out a Redis connection: {source}"))]
    Pool {
        source: deadpool_redis::PoolError,
        backtrace: Backtrace,
    },
    #[snafu(display("Redis operation failed: {source}"))]
    Redis {
        source: redis::RedisError,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           cache keys                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

// The key formats are load-bearing: `timeline_pattern` must match exactly the keys
// `timeline_key` produces for a given viewer, & nothing else.

/// Cache key for one page of `viewer`'s timeline
pub fn timeline_key(viewer: &UserId, limit: usize, offset: usize) -> String {
    format!("timeline:{viewer}:{limit}:{offset}")
}

/// Pattern matching every cached page of `viewer`'s timeline, whatever the pagination
pub fn timeline_pattern(viewer: &UserId) -> String {
    format!("timeline:{viewer}:*")
}

/// Cache key for a standalone tweet detail entry
pub fn tweet_key(tweet: &TweetId) -> String {
    format!("tweet:{tweet}")
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        the Backend trait                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Object-safe trait abstracting over the warble cache
///
/// Values are opaque strings; serialization is the caller's business. Every write carries a TTL.
#[async_trait]
pub trait Backend {
    /// None is a miss; an expired entry is indistinguishable from an absent one
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// Delete every key matching a glob pattern; return the number deleted
    async fn delete_pattern(&self, pattern: &str) -> Result<u64>;
    /// Cheap reachability probe, for health endpoints
    async fn ping(&self) -> Result<()>;
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           RedisCache                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// [Backend] implementation in terms of a Redis instance (or anything speaking RESP)
pub struct RedisCache {
    pool: Pool,
}

impl RedisCache {
    pub fn new(url: &str) -> Result<RedisCache> {
        let pool = Config::from_url(url)
            .create_pool(Some(Runtime::Tokio1))
            .context(CreatePoolSnafu)?;
        Ok(RedisCache { pool })
    }
}

#[async_trait]
impl Backend for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.pool.get().await.context(PoolSnafu)?;
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .context(RedisSnafu)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.pool.get().await.context(PoolSnafu)?;
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<()>(&mut conn)
            .await
            .context(RedisSnafu)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.pool.get().await.context(PoolSnafu)?;
        redis::cmd("DEL")
            .arg(key)
            .query_async::<()>(&mut conn)
            .await
            .context(RedisSnafu)
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<u64> {
        // SCAN rather than KEYS; the latter blocks the server for the duration
        let mut conn = self.pool.get().await.context(PoolSnafu)?;
        let mut cursor: u64 = 0;
        let mut deleted: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .context(RedisSnafu)?;
            if !keys.is_empty() {
                let mut del = redis::cmd("DEL");
                for key in &keys {
                    del.arg(key);
                }
                deleted += del
                    .query_async::<u64>(&mut conn)
                    .await
                    .context(RedisSnafu)?;
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(deleted)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.pool.get().await.context(PoolSnafu)?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .context(RedisSnafu)?;
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           MemoryCache                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Match `text` against a glob `pattern` in which `*` matches any run of characters (the only
/// metacharacter our key patterns use)
fn glob_match(pattern: &str, text: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == text,
        Some((prefix, rest)) => match text.strip_prefix(prefix) {
            None => false,
            Some(text) => {
                if rest.is_empty() {
                    return true;
                }
                // Try every suffix of the remaining text against the remaining pattern
                (0..=text.len())
                    .filter(|i| text.is_char_boundary(*i))
                    .any(|i| glob_match(rest, &text[i..]))
            }
        },
    }
}

/// In-process [Backend] implementation
///
/// TTLs are tracked against [tokio::time::Instant], so tests may pause & advance the clock
/// rather than sleeping.
#[derive(Default)]
pub struct MemoryCache {
    entries: std::sync::Mutex<std::collections::HashMap<String, (String, tokio::time::Instant)>>,
}

impl MemoryCache {
    pub fn new() -> MemoryCache {
        MemoryCache::default()
    }
}

#[async_trait]
impl Backend for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock().unwrap(/* poisoned */);
        match entries.get(key) {
            Some((value, expires)) if *expires > tokio::time::Instant::now() => {
                Ok(Some(value.clone()))
            }
            Some(_) => {
                // Lazy expiry
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.entries.lock().unwrap(/* poisoned */).insert(
            key.to_owned(),
            (value.to_owned(), tokio::time::Instant::now() + ttl),
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().unwrap(/* poisoned */).remove(key);
        Ok(())
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<u64> {
        let mut entries = self.entries.lock().unwrap(/* poisoned */);
        let doomed = entries
            .keys()
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect::<Vec<String>>();
        for key in &doomed {
            entries.remove(key);
        }
        Ok(doomed.len() as u64)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn key_formats() {
        let viewer: UserId = "00000000-0000-0000-0000-000000000001".parse().unwrap();
        let tweet: TweetId = "00000000-0000-0000-0000-000000000002".parse().unwrap();
        assert_eq!(
            timeline_key(&viewer, 20, 40),
            "timeline:00000000-0000-0000-0000-000000000001:20:40"
        );
        assert_eq!(
            timeline_pattern(&viewer),
            "timeline:00000000-0000-0000-0000-000000000001:*"
        );
        assert_eq!(
            tweet_key(&tweet),
            "tweet:00000000-0000-0000-0000-000000000002"
        );
        // The pattern for one viewer must never match another viewer's keys
        assert!(glob_match(
            &timeline_pattern(&viewer),
            &timeline_key(&viewer, 20, 0)
        ));
        let other = UserId::new();
        assert!(!glob_match(
            &timeline_pattern(&viewer),
            &timeline_key(&other, 20, 0)
        ));
    }

    #[test]
    fn globs() {
        assert!(glob_match("a*", "abc"));
        assert!(glob_match("a*c", "abc"));
        assert!(glob_match("a*c", "ac"));
        assert!(glob_match("*", ""));
        assert!(!glob_match("a*c", "abd"));
        assert!(!glob_match("abc", "abcd"));
    }

    #[tokio::test(start_paused = true)]
    async fn ttls_expire() {
        let cache = MemoryCache::new();
        cache
            .set("timeline:x:20:0", "page", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(
            cache.get("timeline:x:20:0").await.unwrap().as_deref(),
            Some("page")
        );
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.get("timeline:x:20:0").await.unwrap(), None);
    }

    #[tokio::test]
    async fn pattern_deletes() {
        let cache = MemoryCache::new();
        for key in ["timeline:a:20:0", "timeline:a:20:20", "timeline:b:20:0"] {
            cache.set(key, "page", Duration::from_secs(60)).await.unwrap();
        }
        assert_eq!(cache.delete_pattern("timeline:a:*").await.unwrap(), 2);
        assert_eq!(cache.get("timeline:a:20:0").await.unwrap(), None);
        assert!(cache.get("timeline:b:20:0").await.unwrap().is_some());
    }
}
