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

//! Cross-node scenarios: two "nodes" sharing a store & an event bus, each with its own cache,
//! with an invalidation consumer running on the second node. Writes on node A must invalidate
//! node B's cache through the bus, not just node A's own synchronous path.

use std::{sync::Arc, time::Duration};

use warble::{consumer, memory, metrics::Instruments};
use warble_test::{page_ids, Fixture};

async fn eventually<F: Fn() -> bool>(what: &str, pred: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !pred() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed-out waiting for {what}"))
}

/// A write on node A invalidates node B's cached pages via the event bus.
#[tokio::test]
async fn remote_writes_invalidate_local_caches() {
    let ttl = Duration::from_secs(60);
    let node_a = Fixture::with_ttl(ttl);
    let store: Arc<memory::Store> = node_a.store.clone();
    let node_b = Fixture::on_bus_and_store(node_a.bus.clone(), store, ttl);
    let processor = consumer::spawn(
        node_b.engine.clone(),
        Arc::new(node_b.bus.clone()),
        Arc::new(Instruments::new("warble-test")),
    )
    .await
    .unwrap();

    let alice = node_a.user("alice").await;
    let bob = node_a.user("bob").await;
    node_a.engine.follow(&alice.id, &bob.id).await.unwrap();

    let t1 = node_a.engine.post_tweet(&bob.id, "one", None).await.unwrap();
    // Bob's timeline is now cached on node B
    assert_eq!(page_ids(&node_b.engine, &bob.id, 20).await, vec![t1.id]);

    // A post through node A synchronously invalidates only node A's cache; node B hears
    // about it from the bus
    let t2 = node_a.engine.post_tweet(&bob.id, "two", None).await.unwrap();
    eventually("node B to consume the event", || {
        node_b.bus.acked().len() >= 3 // follow + two posts
    })
    .await;
    assert_eq!(
        page_ids(&node_b.engine, &bob.id, 20).await,
        vec![t2.id, t1.id]
    );

    processor.shutdown(Duration::from_secs(5)).await.unwrap();
}

/// Follow events invalidate both parties' pages on every node.
#[tokio::test]
async fn remote_follows_are_immediate_everywhere() {
    let ttl = Duration::from_secs(60);
    let node_a = Fixture::with_ttl(ttl);
    let node_b = Fixture::on_bus_and_store(node_a.bus.clone(), node_a.store.clone(), ttl);
    let processor = consumer::spawn(
        node_b.engine.clone(),
        Arc::new(node_b.bus.clone()),
        Arc::new(Instruments::new("warble-test")),
    )
    .await
    .unwrap();

    let alice = node_a.user("alice").await;
    let bob = node_a.user("bob").await;
    let tweet = node_a.engine.post_tweet(&bob.id, "hello", None).await.unwrap();

    // Alice's empty timeline is cached on node B...
    assert_eq!(page_ids(&node_b.engine, &alice.id, 20).await, vec![]);

    // ...she follows Bob through node A...
    node_a.engine.follow(&alice.id, &bob.id).await.unwrap();
    eventually("node B to consume the events", || {
        node_b.bus.acked().len() >= 2 // the post + the follow
    })
    .await;

    // ...and node B serves the new meaning of her timeline at once
    assert_eq!(page_ids(&node_b.engine, &alice.id, 20).await, vec![tweet.id]);
    processor.shutdown(Duration::from_secs(5)).await.unwrap();
}
