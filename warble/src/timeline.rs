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

//! # timeline
//!
//! The warble timeline engine-- the heart of the service.
//!
//! # Reads
//!
//! [get_timeline](Engine::get_timeline) is cache-aside: look for
//! `timeline:{viewer}:{limit}:{offset}`; on a miss, run the fan-out-on-read query against the
//! store & populate the entry under a short TTL (sixty seconds by default). Either way, the
//! engagement numbers embedded in the page are only a snapshot from population time, so before
//! serving we overlay live counters & viewer flags fetched in one batched store round-trip.
//! Page *membership* may thus be up to a TTL stale, but the numbers on what is served never
//! are.
//!
//! # Writes
//!
//! Every write runs in three steps: the store transaction, then synchronous cache invalidation
//! per the policy table in [apply_event](Engine::apply_event), then a best-effort publish onto
//! the event bus so every node's consumer repeats the invalidation locally. The policy:
//!
//! | trigger            | invalidated                                        |
//! |--------------------|----------------------------------------------------|
//! | tweet created      | `timeline:{author}:*`                              |
//! | tweet deleted      | `timeline:{author}:*`, `tweet:{id}`                |
//! | follow/unfollow    | `timeline:{follower}:*`, `timeline:{followee}:*`   |
//! | (un)like/(un)retweet | `tweet:{id}`                                     |
//!
//! Note what is *not* there: a new tweet does not invalidate the author's followers' pages.
//! With the overlay handling counters, the only staleness followers can see is page
//! membership, & the TTL bounds that at a cost of one pattern-delete instead of one per
//! follower. The TTL is the backstop for everything else, too: a crashed node, a lost event, a
//! cache that was down during invalidation-- all self-heal within one TTL.
//!
//! # Failure policy
//!
//! The store is the source of truth & its errors propagate. The cache & the bus are
//! accelerants: every failure there is logged, counted & absorbed, degrading to
//! read-from-store & TTL-expiry respectively.

use std::{sync::Arc, time::Duration};

use snafu::{prelude::*, Backtrace};
use tracing::{debug, warn};

use crate::{
    cache::{self, timeline_key, timeline_pattern, tweet_key},
    counter_add,
    entities::{self, CachePage, TimelineEntry, Tweet, TweetId, User, UserId, Username},
    events::{Bus, Event},
    metrics::{Instruments, Registration, Sort},
    storage,
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("limit must be between 1 and {MAX_PAGE_SIZE}; got {limit}"))]
    BadLimit { limit: usize, backtrace: Backtrace },
    #[snafu(display("{source}"))]
    Entities {
        source: entities::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("{follower} does not follow {followee}"))]
    NotFollowing {
        follower: UserId,
        followee: UserId,
        backtrace: Backtrace,
    },
    #[snafu(display("No such tweet: {tweet}"))]
    NoSuchTweet {
        tweet: TweetId,
        backtrace: Backtrace,
    },
    #[snafu(display("No such user: {user}"))]
    NoSuchUser { user: UserId, backtrace: Backtrace },
    #[snafu(display("{source}"))]
    Storage {
        source: storage::Error,
        backtrace: Backtrace,
    },
}

impl Error {
    /// Map this error to an HTTP status & user-facing message
    pub fn as_status_and_msg(&self) -> (axum::http::StatusCode, String) {
        use axum::http::StatusCode;
        let msg = format!("{}", self);
        match self {
            Error::BadLimit { .. } | Error::Entities { .. } => (StatusCode::BAD_REQUEST, msg),
            Error::NotFollowing { .. }
            | Error::NoSuchTweet { .. }
            | Error::NoSuchUser { .. } => (StatusCode::NOT_FOUND, msg),
            Error::Storage { source, .. } => match source {
                storage::Error::Conflict { .. } => (StatusCode::CONFLICT, msg),
                storage::Error::NotFound { .. } => (StatusCode::NOT_FOUND, msg),
                storage::Error::Unavailable { .. } => {
                    (StatusCode::SERVICE_UNAVAILABLE, msg)
                }
                storage::Error::Other { .. } => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            metrics                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { Registration::new("timeline.cache.hits", Sort::IntegralCounter) }
inventory::submit! { Registration::new("timeline.cache.misses", Sort::IntegralCounter) }
inventory::submit! { Registration::new("timeline.cache.errors", Sort::IntegralCounter) }
inventory::submit! { Registration::new("timeline.invalidations", Sort::IntegralCounter) }
inventory::submit! { Registration::new("timeline.publish.failures", Sort::IntegralCounter) }

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          the Engine                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Hard ceiling on the page size a caller may request
pub const MAX_PAGE_SIZE: usize = 100;

/// Default cache TTL; overridable via [Engine::new]
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Store/cache/bus reachability, as reported by [Engine::health]
#[derive(Clone, Copy, Debug, serde::Serialize)]
pub struct Health {
    pub store: bool,
    pub cache: bool,
    pub bus: bool,
}

/// The timeline engine
///
/// Holds handles to its three collaborators; they are injected at construction, so tests can
/// swap in in-memory implementations (or deliberately broken ones).
pub struct Engine {
    store: Arc<dyn storage::Backend + Send + Sync>,
    cache: Arc<dyn cache::Backend + Send + Sync>,
    bus: Arc<dyn Bus>,
    instruments: Arc<Instruments>,
    ttl: Duration,
}

impl Engine {
    pub fn new(
        store: Arc<dyn storage::Backend + Send + Sync>,
        cache: Arc<dyn cache::Backend + Send + Sync>,
        bus: Arc<dyn Bus>,
        instruments: Arc<Instruments>,
        ttl: Duration,
    ) -> Engine {
        Engine {
            store,
            cache,
            bus,
            instruments,
            ttl,
        }
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    //                                           reads                                            //
    ////////////////////////////////////////////////////////////////////////////////////////////////

    /// Serve one page of `viewer`'s timeline: cache-aside, with live engagement overlaid
    pub async fn get_timeline(
        &self,
        viewer: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<TimelineEntry>> {
        ensure!(limit >= 1 && limit <= MAX_PAGE_SIZE, BadLimitSnafu { limit });
        let key = timeline_key(viewer, limit, offset);
        if let Some(page) = self.cached_page(&key).await {
            counter_add!(self.instruments, "timeline.cache.hits", 1, &[]);
            return self.overlay(viewer, page.entries).await;
        }
        counter_add!(self.instruments, "timeline.cache.misses", 1, &[]);
        let entries = self
            .store
            .timeline_page(viewer, limit, offset)
            .await
            .context(StorageSnafu)?;
        let page = CachePage {
            entries: entries.clone(),
            populated_at: chrono::Utc::now(),
        };
        self.populate(&key, &page).await;
        Ok(entries)
    }

    /// Serve a single tweet through its standalone `tweet:{id}` cache entry, again with live
    /// engagement overlaid
    pub async fn tweet_detail(&self, viewer: &UserId, tweet: &TweetId) -> Result<TimelineEntry> {
        let key = tweet_key(tweet);
        if let Some(text) = self.cached_text(&key).await {
            match serde_json::from_str::<TimelineEntry>(&text) {
                Ok(entry) => {
                    counter_add!(self.instruments, "timeline.cache.hits", 1, &[]);
                    let mut entries = self.overlay(viewer, vec![entry]).await?;
                    match entries.pop() {
                        Some(entry) => return Ok(entry),
                        // Cached but gone from the store; drop the entry & report not-found
                        None => {
                            self.drop_key(&key).await;
                            return NoSuchTweetSnafu { tweet: *tweet }.fail();
                        }
                    }
                }
                Err(err) => {
                    warn!("Undecodable cache entry under {key} ({err}); treating as a miss");
                }
            }
        }
        counter_add!(self.instruments, "timeline.cache.misses", 1, &[]);
        let tweet_row = self
            .store
            .tweet_by_id(tweet)
            .await
            .context(StorageSnafu)?
            .context(NoSuchTweetSnafu { tweet: *tweet })?;
        let author = self
            .store
            .user_by_id(&tweet_row.author_id)
            .await
            .context(StorageSnafu)?
            .context(NoSuchUserSnafu {
                user: tweet_row.author_id,
            })?;
        let engagement = self
            .store
            .engagement(viewer, &[*tweet])
            .await
            .context(StorageSnafu)?
            .remove(tweet)
            .unwrap_or_default();
        let entry = TimelineEntry {
            tweet: tweet_row,
            author_username: author.username,
            author_display_name: author.display_name,
            engagement,
        };
        if let Ok(text) = serde_json::to_string(&entry) {
            self.set_best_effort(&key, &text).await;
        }
        Ok(entry)
    }

    /// Replace each entry's snapshot engagement with live numbers, in one batched store
    /// round-trip. Entries whose tweet has vanished from the store are dropped rather than
    /// served with numbers we cannot vouch for.
    async fn overlay(
        &self,
        viewer: &UserId,
        entries: Vec<TimelineEntry>,
    ) -> Result<Vec<TimelineEntry>> {
        let ids = entries.iter().map(|e| e.tweet.id).collect::<Vec<TweetId>>();
        let mut live = self
            .store
            .engagement(viewer, &ids)
            .await
            .context(StorageSnafu)?;
        Ok(entries
            .into_iter()
            .filter_map(|mut entry| {
                live.remove(&entry.tweet.id).map(|engagement| {
                    entry.engagement = engagement;
                    entry
                })
            })
            .collect())
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    //                                           writes                                           //
    ////////////////////////////////////////////////////////////////////////////////////////////////

    /// Post a tweet (or a reply, if `reply_to` is given)
    pub async fn post_tweet(
        &self,
        author: &UserId,
        body: &str,
        reply_to: Option<TweetId>,
    ) -> Result<Tweet> {
        let body = entities::validate_body(body).context(EntitiesSnafu)?;
        self.store
            .user_by_id(author)
            .await
            .context(StorageSnafu)?
            .context(NoSuchUserSnafu { user: *author })?;
        if let Some(parent) = &reply_to {
            self.store
                .tweet_by_id(parent)
                .await
                .context(StorageSnafu)?
                .context(NoSuchTweetSnafu { tweet: *parent })?;
        }
        let tweet = self
            .store
            .add_tweet(author, &body, reply_to)
            .await
            .context(StorageSnafu)?;
        let event = Event::TweetCreated {
            author: *author,
            tweet: tweet.id,
        };
        self.apply_event(&event).await;
        // A reply bumps the parent's reply count, so its standalone entry is stale too
        if let Some(parent) = &reply_to {
            self.drop_key(&tweet_key(parent)).await;
        }
        self.publish_best_effort(&event).await;
        Ok(tweet)
    }

    pub async fn delete_tweet(&self, author: &UserId, tweet: &TweetId) -> Result<()> {
        let deleted = self
            .store
            .delete_tweet(author, tweet)
            .await
            .context(StorageSnafu)?;
        ensure!(deleted, NoSuchTweetSnafu { tweet: *tweet });
        let event = Event::TweetDeleted {
            author: *author,
            tweet: *tweet,
        };
        self.apply_event(&event).await;
        self.publish_best_effort(&event).await;
        Ok(())
    }

    pub async fn follow(&self, follower: &UserId, followee: &UserId) -> Result<()> {
        self.store
            .user_by_id(followee)
            .await
            .context(StorageSnafu)?
            .context(NoSuchUserSnafu { user: *followee })?;
        self.store
            .follow(follower, followee)
            .await
            .context(StorageSnafu)?;
        let event = Event::Followed {
            follower: *follower,
            followee: *followee,
        };
        self.apply_event(&event).await;
        self.publish_best_effort(&event).await;
        Ok(())
    }

    pub async fn unfollow(&self, follower: &UserId, followee: &UserId) -> Result<()> {
        let removed = self
            .store
            .unfollow(follower, followee)
            .await
            .context(StorageSnafu)?;
        ensure!(
            removed,
            NotFollowingSnafu {
                follower: *follower,
                followee: *followee
            }
        );
        let event = Event::Unfollowed {
            follower: *follower,
            followee: *followee,
        };
        self.apply_event(&event).await;
        self.publish_best_effort(&event).await;
        Ok(())
    }

    /// Like a tweet; returns false if `user` had already liked it (idempotent, & in that case
    /// neither invalidation nor publication happens-- nothing changed)
    pub async fn like(&self, user: &UserId, tweet: &TweetId) -> Result<bool> {
        self.engage(
            user,
            tweet,
            Event::Liked {
                user: *user,
                tweet: *tweet,
            },
        )
        .await
    }

    pub async fn unlike(&self, user: &UserId, tweet: &TweetId) -> Result<bool> {
        self.engage(
            user,
            tweet,
            Event::Unliked {
                user: *user,
                tweet: *tweet,
            },
        )
        .await
    }

    pub async fn retweet(&self, user: &UserId, tweet: &TweetId) -> Result<bool> {
        self.engage(
            user,
            tweet,
            Event::Retweeted {
                user: *user,
                tweet: *tweet,
            },
        )
        .await
    }

    pub async fn unretweet(&self, user: &UserId, tweet: &TweetId) -> Result<bool> {
        self.engage(
            user,
            tweet,
            Event::Unretweeted {
                user: *user,
                tweet: *tweet,
            },
        )
        .await
    }

    /// Common path for the four engagement toggles
    async fn engage(&self, user: &UserId, tweet: &TweetId, event: Event) -> Result<bool> {
        self.store
            .tweet_by_id(tweet)
            .await
            .context(StorageSnafu)?
            .context(NoSuchTweetSnafu { tweet: *tweet })?;
        let changed = match &event {
            Event::Liked { .. } => self.store.like(user, tweet).await,
            Event::Unliked { .. } => self.store.unlike(user, tweet).await,
            Event::Retweeted { .. } => self.store.retweet(user, tweet).await,
            Event::Unretweeted { .. } => self.store.unretweet(user, tweet).await,
            _ => unreachable!(),
        }
        .context(StorageSnafu)?;
        if changed {
            self.apply_event(&event).await;
            self.publish_best_effort(&event).await;
        }
        Ok(changed)
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    //                                        invalidation                                        //
    ////////////////////////////////////////////////////////////////////////////////////////////////

    /// The invalidation policy table. Called synchronously by every write & asynchronously by
    /// the consumer for every event off the bus; deliberately idempotent & commutative, since
    /// the two paths race & events may be re-delivered.
    pub async fn apply_event(&self, event: &Event) {
        match event {
            Event::TweetCreated { author, .. } => {
                self.drop_pattern(&timeline_pattern(author)).await;
            }
            Event::TweetDeleted { author, tweet } => {
                self.drop_pattern(&timeline_pattern(author)).await;
                self.drop_key(&tweet_key(tweet)).await;
            }
            Event::Followed { follower, followee }
            | Event::Unfollowed { follower, followee } => {
                self.drop_pattern(&timeline_pattern(follower)).await;
                self.drop_pattern(&timeline_pattern(followee)).await;
            }
            Event::Liked { tweet, .. }
            | Event::Unliked { tweet, .. }
            | Event::Retweeted { tweet, .. }
            | Event::Unretweeted { tweet, .. } => {
                self.drop_key(&tweet_key(tweet)).await;
            }
        }
    }

    /// Store/cache/bus reachability, for the health endpoint
    pub async fn health(&self) -> Health {
        Health {
            store: self.store.ping().await.is_ok(),
            cache: self.cache.ping().await.is_ok(),
            bus: self.bus.ping().await.is_ok(),
        }
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    //                                 absorbing cache/bus failures                               //
    ////////////////////////////////////////////////////////////////////////////////////////////////

    async fn cached_text(&self, key: &str) -> Option<String> {
        match self.cache.get(key).await {
            Ok(hit) => hit,
            Err(err) => {
                warn!("Cache get of {key} failed ({err}); treating as a miss");
                counter_add!(self.instruments, "timeline.cache.errors", 1, &[]);
                None
            }
        }
    }

    async fn cached_page(&self, key: &str) -> Option<CachePage> {
        let text = self.cached_text(key).await?;
        match serde_json::from_str::<CachePage>(&text) {
            Ok(page) => Some(page),
            Err(err) => {
                warn!("Undecodable cache entry under {key} ({err}); treating as a miss");
                None
            }
        }
    }

    async fn populate(&self, key: &str, page: &CachePage) {
        match serde_json::to_string(page) {
            Ok(text) => self.set_best_effort(key, &text).await,
            Err(err) => warn!("Failed to encode a cache page for {key}: {err}"),
        }
    }

    async fn set_best_effort(&self, key: &str, text: &str) {
        if let Err(err) = self.cache.set(key, text, self.ttl).await {
            warn!("Cache population of {key} failed ({err}); the page was served from the store");
            counter_add!(self.instruments, "timeline.cache.errors", 1, &[]);
        }
    }

    async fn drop_key(&self, key: &str) {
        match self.cache.delete(key).await {
            Ok(()) => {
                counter_add!(self.instruments, "timeline.invalidations", 1, &[]);
            }
            Err(err) => {
                warn!("Cache invalidation of {key} failed ({err}); the TTL will cover it");
                counter_add!(self.instruments, "timeline.cache.errors", 1, &[]);
            }
        }
    }

    async fn drop_pattern(&self, pattern: &str) {
        match self.cache.delete_pattern(pattern).await {
            Ok(n) => {
                debug!("Invalidated {n} cache entries matching {pattern}");
                counter_add!(self.instruments, "timeline.invalidations", n, &[]);
            }
            Err(err) => {
                warn!("Cache invalidation of {pattern} failed ({err}); the TTL will cover it");
                counter_add!(self.instruments, "timeline.cache.errors", 1, &[]);
            }
        }
    }

    async fn publish_best_effort(&self, event: &Event) {
        if let Err(err) = self.bus.publish(event).await {
            warn!("Failed to publish {event:?} ({err}); remote caches will age out via TTL");
            counter_add!(self.instruments, "timeline.publish.failures", 1, &[]);
        }
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    //                                      user operations                                       //
    ////////////////////////////////////////////////////////////////////////////////////////////////

    // Users don't touch the cache, but routing them through the engine keeps the handlers to a
    // single seam.

    pub async fn create_user(&self, username: &Username, display_name: &str) -> Result<User> {
        self.store
            .add_user(username, display_name)
            .await
            .context(StorageSnafu)
    }

    pub async fn user_by_name(&self, name: &Username) -> Result<Option<User>> {
        self.store.user_for_name(name).await.context(StorageSnafu)
    }

    pub async fn following(&self, user: &UserId) -> Result<Vec<UserId>> {
        self.store.following(user).await.context(StorageSnafu)
    }

    pub async fn followers(&self, user: &UserId) -> Result<Vec<UserId>> {
        self.store.followers(user).await.context(StorageSnafu)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        cache::{Backend as CacheBackend, MemoryCache},
        events::MemoryBus,
        memory,
        storage::Backend as StorageBackend,
    };

    /// A cache in which every operation fails; for exercising the degrade paths
    mod mock {
        use super::*;
        use async_trait::async_trait;

        pub struct BrokenCache;

        fn refused() -> cache::Error {
            cache::Error::Redis {
                source: deadpool_redis::redis::RedisError::from(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "connection refused",
                )),
                backtrace: snafu::Backtrace::capture(),
            }
        }

        #[async_trait]
        impl cache::Backend for BrokenCache {
            async fn get(&self, _key: &str) -> cache::Result<Option<String>> {
                Err(refused())
            }
            async fn set(
                &self,
                _key: &str,
                _value: &str,
                _ttl: Duration,
            ) -> cache::Result<()> {
                Err(refused())
            }
            async fn delete(&self, _key: &str) -> cache::Result<()> {
                Err(refused())
            }
            async fn delete_pattern(&self, _pattern: &str) -> cache::Result<u64> {
                Err(refused())
            }
            async fn ping(&self) -> cache::Result<()> {
                Err(refused())
            }
        }
    }

    fn engine_over(
        store: Arc<memory::Store>,
        cache: Arc<dyn cache::Backend + Send + Sync>,
        bus: MemoryBus,
    ) -> Engine {
        Engine::new(
            store,
            cache,
            Arc::new(bus),
            Arc::new(Instruments::new("warble-test")),
            DEFAULT_TTL,
        )
    }

    async fn seeded_store() -> (Arc<memory::Store>, User, User) {
        let store = Arc::new(memory::Store::new());
        let alice = store.add_user(&"alice".parse().unwrap(), "Alice").await.unwrap();
        let bob = store.add_user(&"bob".parse().unwrap(), "Bob").await.unwrap();
        (store, alice, bob)
    }

    #[tokio::test]
    async fn cache_failures_degrade_to_the_store() {
        let (store, alice, bob) = seeded_store().await;
        let bus = MemoryBus::new();
        let engine = engine_over(store, Arc::new(mock::BrokenCache), bus.clone());

        engine.follow(&alice.id, &bob.id).await.unwrap();
        let tweet = engine.post_tweet(&bob.id, "hello", None).await.unwrap();

        // Every cache operation failed, yet reads & writes both succeed
        let page = engine.get_timeline(&alice.id, 20, 0).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].tweet.id, tweet.id);
        assert_eq!(engine.tweet_detail(&alice.id, &tweet.id).await.unwrap().tweet.id, tweet.id);
        // ...and the events still went out
        assert_eq!(bus.published().len(), 2);
    }

    #[tokio::test]
    async fn the_policy_table() {
        let (store, alice, bob) = seeded_store().await;
        let cache = Arc::new(MemoryCache::new());
        let engine = engine_over(store, cache.clone(), MemoryBus::new());
        let tweet = TweetId::new();

        let seed = |cache: Arc<MemoryCache>, alice: UserId, bob: UserId, tweet: TweetId| async move {
            for key in [
                timeline_key(&alice, 20, 0),
                timeline_key(&alice, 20, 20),
                timeline_key(&bob, 20, 0),
                tweet_key(&tweet),
            ] {
                cache.set(&key, "x", Duration::from_secs(60)).await.unwrap();
            }
        };

        // New tweet: only the author's pages go
        seed(cache.clone(), alice.id, bob.id, tweet).await;
        engine
            .apply_event(&Event::TweetCreated {
                author: alice.id,
                tweet,
            })
            .await;
        assert!(cache.get(&timeline_key(&alice.id, 20, 0)).await.unwrap().is_none());
        assert!(cache.get(&timeline_key(&alice.id, 20, 20)).await.unwrap().is_none());
        assert!(cache.get(&timeline_key(&bob.id, 20, 0)).await.unwrap().is_some());
        assert!(cache.get(&tweet_key(&tweet)).await.unwrap().is_some());

        // Follow: both parties' pages go
        seed(cache.clone(), alice.id, bob.id, tweet).await;
        engine
            .apply_event(&Event::Followed {
                follower: alice.id,
                followee: bob.id,
            })
            .await;
        assert!(cache.get(&timeline_key(&alice.id, 20, 0)).await.unwrap().is_none());
        assert!(cache.get(&timeline_key(&bob.id, 20, 0)).await.unwrap().is_none());
        assert!(cache.get(&tweet_key(&tweet)).await.unwrap().is_some());

        // Like: only the standalone tweet entry goes
        seed(cache.clone(), alice.id, bob.id, tweet).await;
        engine
            .apply_event(&Event::Liked {
                user: alice.id,
                tweet,
            })
            .await;
        assert!(cache.get(&tweet_key(&tweet)).await.unwrap().is_none());
        assert!(cache.get(&timeline_key(&alice.id, 20, 0)).await.unwrap().is_some());
        assert!(cache.get(&timeline_key(&bob.id, 20, 0)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn invalidation_is_idempotent() {
        let (store, alice, bob) = seeded_store().await;
        let cache = Arc::new(MemoryCache::new());
        let engine = engine_over(store, cache.clone(), MemoryBus::new());
        let event = Event::TweetCreated {
            author: alice.id,
            tweet: TweetId::new(),
        };

        let unrelated = timeline_key(&bob.id, 20, 0);
        cache.set(&unrelated, "x", Duration::from_secs(60)).await.unwrap();
        cache
            .set(&timeline_key(&alice.id, 20, 0), "x", Duration::from_secs(60))
            .await
            .unwrap();

        // Applying the same event twice (re-delivery, or the sync & async paths racing) leaves
        // the cache exactly as applying it once does
        engine.apply_event(&event).await;
        engine.apply_event(&event).await;
        assert!(cache.get(&timeline_key(&alice.id, 20, 0)).await.unwrap().is_none());
        assert!(cache.get(&unrelated).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn counters_are_live_even_on_cached_pages() {
        let (store, alice, bob) = seeded_store().await;
        let engine = engine_over(store, Arc::new(MemoryCache::new()), MemoryBus::new());

        engine.follow(&alice.id, &bob.id).await.unwrap();
        let tweet = engine.post_tweet(&bob.id, "hello", None).await.unwrap();

        // First read populates the cache with zero likes...
        let page = engine.get_timeline(&alice.id, 20, 0).await.unwrap();
        assert_eq!(page[0].engagement.counters.likes, 0);

        // ...a like invalidates only the tweet entry, so the second read is a cache hit...
        assert!(engine.like(&alice.id, &tweet.id).await.unwrap());
        let page = engine.get_timeline(&alice.id, 20, 0).await.unwrap();

        // ...yet the served numbers are current
        assert_eq!(page[0].engagement.counters.likes, 1);
        assert!(page[0].engagement.liked);
    }

    #[tokio::test]
    async fn duplicate_likes_change_nothing() {
        let (store, alice, bob) = seeded_store().await;
        let bus = MemoryBus::new();
        let engine = engine_over(store, Arc::new(MemoryCache::new()), bus.clone());

        let tweet = engine.post_tweet(&bob.id, "hello", None).await.unwrap();
        assert!(engine.like(&alice.id, &tweet.id).await.unwrap());
        assert!(!engine.like(&alice.id, &tweet.id).await.unwrap());
        // One TweetCreated, one Liked; no event for the no-op
        assert_eq!(bus.published().len(), 2);
    }

    #[tokio::test]
    async fn page_limits() {
        let (store, alice, _bob) = seeded_store().await;
        let engine = engine_over(store, Arc::new(MemoryCache::new()), MemoryBus::new());
        assert!(matches!(
            engine.get_timeline(&alice.id, 0, 0).await,
            Err(Error::BadLimit { .. })
        ));
        assert!(matches!(
            engine.get_timeline(&alice.id, MAX_PAGE_SIZE + 1, 0).await,
            Err(Error::BadLimit { .. })
        ));
    }
}
