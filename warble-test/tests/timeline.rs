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

//! Scenario tests for the timeline engine's consistency guarantees.

use std::time::Duration;

use warble_test::{page_ids, Fixture};

/// An author always reads their own writes: posting invalidates the author's cached pages
/// synchronously, so the very next read reflects the post.
#[tokio::test]
async fn authors_read_their_own_writes() {
    let fx = Fixture::new();
    let alice = fx.user("alice").await;

    let t1 = fx.engine.post_tweet(&alice.id, "first", None).await.unwrap();
    assert_eq!(page_ids(&fx.engine, &alice.id, 20).await, vec![t1.id]);

    // That read cached the page; the next post must punch through it
    let t2 = fx.engine.post_tweet(&alice.id, "second", None).await.unwrap();
    assert_eq!(
        page_ids(&fx.engine, &alice.id, 20).await,
        vec![t2.id, t1.id]
    );
}

/// A follower's page membership may lag a new tweet, but by no more than the TTL.
#[tokio::test(start_paused = true)]
async fn follower_staleness_is_bounded_by_the_ttl() {
    let ttl = Duration::from_secs(60);
    let fx = Fixture::with_ttl(ttl);
    let alice = fx.user("alice").await;
    let bob = fx.user("bob").await;
    fx.engine.follow(&alice.id, &bob.id).await.unwrap();

    let t1 = fx.engine.post_tweet(&bob.id, "one", None).await.unwrap();
    assert_eq!(page_ids(&fx.engine, &alice.id, 20).await, vec![t1.id]);

    // A new tweet invalidates only Bob's own pages; Alice's cached page is now stale...
    let t2 = fx.engine.post_tweet(&bob.id, "two", None).await.unwrap();
    assert_eq!(page_ids(&fx.engine, &alice.id, 20).await, vec![t1.id]);

    // ...but no read after the TTL can miss it
    tokio::time::advance(ttl + Duration::from_secs(1)).await;
    assert_eq!(
        page_ids(&fx.engine, &alice.id, 20).await,
        vec![t2.id, t1.id]
    );
}

/// Engagement numbers are never stale, even when the page itself is served from the cache.
#[tokio::test]
async fn engagement_is_always_live() {
    let fx = Fixture::new();
    let alice = fx.user("alice").await;
    let bob = fx.user("bob").await;
    let carol = fx.user("carol").await;
    fx.engine.follow(&alice.id, &bob.id).await.unwrap();

    let tweet = fx.engine.post_tweet(&bob.id, "hot take", None).await.unwrap();
    let page = fx.engine.get_timeline(&alice.id, 20, 0).await.unwrap();
    assert_eq!(page[0].engagement.counters.likes, 0);

    // Likes, retweets & replies land while Alice's page sits in the cache
    fx.engine.like(&carol.id, &tweet.id).await.unwrap();
    fx.engine.like(&alice.id, &tweet.id).await.unwrap();
    fx.engine.retweet(&carol.id, &tweet.id).await.unwrap();
    fx.engine
        .post_tweet(&carol.id, "replying", Some(tweet.id))
        .await
        .unwrap();

    let page = fx.engine.get_timeline(&alice.id, 20, 0).await.unwrap();
    let engagement = &page[0].engagement;
    assert_eq!(engagement.counters.likes, 2);
    assert_eq!(engagement.counters.retweets, 1);
    assert_eq!(engagement.counters.replies, 1);
    assert!(engagement.liked);
    assert!(!engagement.retweeted);
}

/// Deleting a tweet is never visible through any cache: the author's pages are invalidated &
/// the overlay drops the entry from other viewers' still-cached pages.
#[tokio::test]
async fn deleted_tweets_are_not_served() {
    let fx = Fixture::new();
    let alice = fx.user("alice").await;
    let bob = fx.user("bob").await;
    fx.engine.follow(&alice.id, &bob.id).await.unwrap();

    let t1 = fx.engine.post_tweet(&bob.id, "one", None).await.unwrap();
    let t2 = fx.engine.post_tweet(&bob.id, "two", None).await.unwrap();
    // Alice's page, with both tweets, is now cached
    assert_eq!(
        page_ids(&fx.engine, &alice.id, 20).await,
        vec![t2.id, t1.id]
    );

    fx.engine.delete_tweet(&bob.id, &t2.id).await.unwrap();

    // Alice's cached page still nominally holds t2; serving drops it
    assert_eq!(page_ids(&fx.engine, &alice.id, 20).await, vec![t1.id]);
    // And its standalone detail entry is gone too
    assert!(fx.engine.tweet_detail(&alice.id, &t2.id).await.is_err());
}

/// Follow & unfollow change what a timeline means, so both take effect immediately for both
/// parties-- no TTL wait.
#[tokio::test]
async fn follow_and_unfollow_are_immediate() {
    let fx = Fixture::new();
    let alice = fx.user("alice").await;
    let bob = fx.user("bob").await;

    let tweet = fx.engine.post_tweet(&bob.id, "hello", None).await.unwrap();
    // Alice's (empty) timeline is now cached
    assert_eq!(page_ids(&fx.engine, &alice.id, 20).await, vec![]);

    fx.engine.follow(&alice.id, &bob.id).await.unwrap();
    assert_eq!(page_ids(&fx.engine, &alice.id, 20).await, vec![tweet.id]);

    fx.engine.unfollow(&alice.id, &bob.id).await.unwrap();
    assert_eq!(page_ids(&fx.engine, &alice.id, 20).await, vec![]);
}

/// Distinct (limit, offset) pairs are distinct cache entries, & pagination windows behave.
#[tokio::test]
async fn pages_are_cached_per_window() {
    let fx = Fixture::new();
    let alice = fx.user("alice").await;

    let mut ids = Vec::new();
    for n in 0..5 {
        ids.push(
            fx.engine
                .post_tweet(&alice.id, &format!("tweet {n}"), None)
                .await
                .unwrap()
                .id,
        );
    }
    ids.reverse(); // newest first

    let first = fx.engine.get_timeline(&alice.id, 2, 0).await.unwrap();
    let second = fx.engine.get_timeline(&alice.id, 2, 2).await.unwrap();
    let third = fx.engine.get_timeline(&alice.id, 2, 4).await.unwrap();
    assert_eq!(
        first
            .iter()
            .chain(second.iter())
            .chain(third.iter())
            .map(|e| e.tweet.id)
            .collect::<Vec<_>>(),
        ids
    );
}

/// The four engagement toggles are idempotent round-trips.
#[tokio::test]
async fn engagement_toggles_round_trip() {
    let fx = Fixture::new();
    let alice = fx.user("alice").await;
    let bob = fx.user("bob").await;
    let tweet = fx.engine.post_tweet(&bob.id, "hello", None).await.unwrap();

    assert!(fx.engine.like(&alice.id, &tweet.id).await.unwrap());
    assert!(!fx.engine.like(&alice.id, &tweet.id).await.unwrap());
    assert!(fx.engine.unlike(&alice.id, &tweet.id).await.unwrap());
    assert!(!fx.engine.unlike(&alice.id, &tweet.id).await.unwrap());

    assert!(fx.engine.retweet(&alice.id, &tweet.id).await.unwrap());
    assert!(fx.engine.unretweet(&alice.id, &tweet.id).await.unwrap());

    let detail = fx.engine.tweet_detail(&alice.id, &tweet.id).await.unwrap();
    assert_eq!(detail.engagement.counters.likes, 0);
    assert_eq!(detail.engagement.counters.retweets, 0);
}

/// Duplicate follows conflict; reflexive follows are rejected outright.
#[tokio::test]
async fn follow_graph_constraints() {
    let fx = Fixture::new();
    let alice = fx.user("alice").await;
    let bob = fx.user("bob").await;

    fx.engine.follow(&alice.id, &bob.id).await.unwrap();
    assert!(fx.engine.follow(&alice.id, &bob.id).await.is_err());
    assert!(fx.engine.follow(&alice.id, &alice.id).await.is_err());
    // Unfollowing someone never followed is an error, not a silent no-op
    assert!(fx.engine.unfollow(&bob.id, &alice.id).await.is_err());
}
