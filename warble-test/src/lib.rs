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

//! # The warble Integration Tests
//!
//! Scenario tests for the timeline engine's externally observable guarantees: read-your-writes
//! for authors, TTL-bounded staleness for followers, always-live engagement numbers, & the
//! follow/unfollow & deletion invalidation rules.
//!
//! Everything runs in-process over the in-memory store, cache & bus, so the whole suite is
//! deterministic & needs no services running. The in-memory cache tracks TTLs against the tokio
//! clock, which means `#[tokio::test(start_paused = true)]` scenarios can advance time past the
//! TTL in microseconds instead of sleeping through it. This module provides the fixture; the
//! scenarios live under `tests/`.

use std::{sync::Arc, time::Duration};

use warble::{
    cache::MemoryCache,
    entities::{User, UserId},
    events::MemoryBus,
    memory,
    metrics::Instruments,
    timeline::{Engine, DEFAULT_TTL},
};

/// One warble "node": an engine over in-memory collaborators, with the collaborators kept
/// to hand so scenarios can inspect or reach around the engine
pub struct Fixture {
    pub engine: Arc<Engine>,
    pub store: Arc<memory::Store>,
    pub cache: Arc<MemoryCache>,
    pub bus: MemoryBus,
}

impl Fixture {
    pub fn new() -> Fixture {
        Fixture::with_ttl(DEFAULT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Fixture {
        Fixture::on_bus(MemoryBus::new(), ttl)
    }

    /// Build a node sharing `bus` with other nodes; this is how the cross-node consumer
    /// scenarios set themselves up
    pub fn on_bus(bus: MemoryBus, ttl: Duration) -> Fixture {
        Fixture::on_bus_and_store(bus, Arc::new(memory::Store::new()), ttl)
    }

    /// Build a node sharing both `bus` & `store` with other nodes-- the realistic cluster
    /// shape: one database, one stream, per-node caches
    pub fn on_bus_and_store(bus: MemoryBus, store: Arc<memory::Store>, ttl: Duration) -> Fixture {
        let cache = Arc::new(MemoryCache::new());
        let engine = Arc::new(Engine::new(
            store.clone() as Arc<dyn warble::storage::Backend + Send + Sync>,
            cache.clone(),
            Arc::new(bus.clone()),
            Arc::new(Instruments::new("warble-test")),
            ttl,
        ));
        Fixture {
            engine,
            store,
            cache,
            bus,
        }
    }

    /// Create a user whose display name is their username
    pub async fn user(&self, name: &str) -> User {
        self.engine
            .create_user(&name.parse().unwrap(), name)
            .await
            .unwrap()
    }
}

impl Default for Fixture {
    fn default() -> Self {
        Fixture::new()
    }
}

/// The tweet ids on a page, in order; scenarios compare these to assert page membership
pub async fn page_ids(engine: &Engine, viewer: &UserId, limit: usize) -> Vec<warble::entities::TweetId> {
    engine
        .get_timeline(viewer, limit, 0)
        .await
        .unwrap()
        .iter()
        .map(|entry| entry.tweet.id)
        .collect()
}
