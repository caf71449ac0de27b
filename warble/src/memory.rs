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

//! # memory
//!
//! In-process [Storage] implementation.
//!
//! [Storage]: crate::storage
//!
//! Used by the test suites and by `warbled --in-memory` for kicking the tires without a
//! database. A single [RwLock] guards all state; contention is not a concern at the scales this
//! backend is meant for.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use itertools::Itertools;
use tokio::sync::RwLock;

use crate::{
    entities::{
        Counters, Engagement, FollowEdge, TimelineEntry, Tweet, TweetId, User, UserId, Username,
    },
    storage::{Backend, Error, Result},
};

#[derive(Default)]
struct Inner {
    users: HashMap<UserId, User>,
    by_name: HashMap<Username, UserId>,
    tweets: HashMap<TweetId, Tweet>,
    /// Insertion sequence, used to break creation-time ties deterministically
    seq: HashMap<TweetId, u64>,
    next_seq: u64,
    follows: HashSet<(UserId, UserId)>,
    likes: HashMap<TweetId, HashSet<UserId>>,
    retweets: HashMap<TweetId, HashSet<UserId>>,
}

impl Inner {
    fn counters(&self, tweet: &TweetId) -> Counters {
        Counters {
            likes: self.likes.get(tweet).map(HashSet::len).unwrap_or(0) as u64,
            retweets: self.retweets.get(tweet).map(HashSet::len).unwrap_or(0) as u64,
            replies: self
                .tweets
                .values()
                .filter(|t| t.reply_to.as_ref() == Some(tweet))
                .count() as u64,
        }
    }
    fn engagement(&self, viewer: &UserId, tweet: &TweetId) -> Engagement {
        Engagement {
            counters: self.counters(tweet),
            liked: self
                .likes
                .get(tweet)
                .map(|s| s.contains(viewer))
                .unwrap_or(false),
            retweeted: self
                .retweets
                .get(tweet)
                .map(|s| s.contains(viewer))
                .unwrap_or(false),
        }
    }
    fn entry(&self, viewer: &UserId, tweet: &Tweet) -> TimelineEntry {
        let author = &self.users[&tweet.author_id];
        TimelineEntry {
            tweet: tweet.clone(),
            author_username: author.username.clone(),
            author_display_name: author.display_name.clone(),
            engagement: self.engagement(viewer, &tweet.id),
        }
    }
}

/// In-memory [Backend] implementation
#[derive(Default)]
pub struct Store {
    inner: RwLock<Inner>,
}

impl Store {
    pub fn new() -> Store {
        Store::default()
    }
}

#[async_trait]
impl Backend for Store {
    async fn add_user(&self, username: &Username, display_name: &str) -> Result<User> {
        let mut inner = self.inner.write().await;
        if inner.by_name.contains_key(username) {
            return Err(Error::conflict(format!("username {username}")));
        }
        let user = User {
            id: UserId::new(),
            username: username.clone(),
            display_name: display_name.to_owned(),
            created_at: Utc::now(),
        };
        inner.by_name.insert(username.clone(), user.id);
        inner.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn user_for_name(&self, name: &Username) -> Result<Option<User>> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_name
            .get(name)
            .and_then(|id| inner.users.get(id))
            .cloned())
    }

    async fn user_by_id(&self, id: &UserId) -> Result<Option<User>> {
        Ok(self.inner.read().await.users.get(id).cloned())
    }

    async fn add_tweet(
        &self,
        author: &UserId,
        body: &str,
        reply_to: Option<TweetId>,
    ) -> Result<Tweet> {
        let mut inner = self.inner.write().await;
        if !inner.users.contains_key(author) {
            return Err(Error::not_found(format!("user {author}")));
        }
        if let Some(parent) = &reply_to {
            if !inner.tweets.contains_key(parent) {
                return Err(Error::not_found(format!("tweet {parent}")));
            }
        }
        let tweet = Tweet {
            id: TweetId::new(),
            author_id: *author,
            body: body.to_owned(),
            reply_to,
            created_at: Utc::now(),
        };
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.seq.insert(tweet.id, seq);
        inner.tweets.insert(tweet.id, tweet.clone());
        Ok(tweet)
    }

    async fn delete_tweet(&self, author: &UserId, tweet: &TweetId) -> Result<bool> {
        let mut inner = self.inner.write().await;
        match inner.tweets.get(tweet) {
            Some(t) if t.author_id == *author => {
                inner.tweets.remove(tweet);
                inner.seq.remove(tweet);
                inner.likes.remove(tweet);
                inner.retweets.remove(tweet);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn tweet_by_id(&self, tweet: &TweetId) -> Result<Option<Tweet>> {
        Ok(self.inner.read().await.tweets.get(tweet).cloned())
    }

    async fn follow(&self, follower: &UserId, followee: &UserId) -> Result<()> {
        let edge = FollowEdge::new(*follower, *followee)
            .map_err(|_| Error::conflict("reflexive follow"))?;
        let mut inner = self.inner.write().await;
        if !inner.users.contains_key(followee) {
            return Err(Error::not_found(format!("user {followee}")));
        }
        if !inner.follows.insert((edge.follower, edge.followee)) {
            return Err(Error::conflict(format!("{follower} follows {followee}")));
        }
        Ok(())
    }

    async fn unfollow(&self, follower: &UserId, followee: &UserId) -> Result<bool> {
        Ok(self
            .inner
            .write()
            .await
            .follows
            .remove(&(*follower, *followee)))
    }

    async fn following(&self, user: &UserId) -> Result<Vec<UserId>> {
        Ok(self
            .inner
            .read()
            .await
            .follows
            .iter()
            .filter(|(follower, _)| follower == user)
            .map(|(_, followee)| *followee)
            .collect())
    }

    async fn followers(&self, user: &UserId) -> Result<Vec<UserId>> {
        Ok(self
            .inner
            .read()
            .await
            .follows
            .iter()
            .filter(|(_, followee)| followee == user)
            .map(|(follower, _)| *follower)
            .collect())
    }

    async fn like(&self, user: &UserId, tweet: &TweetId) -> Result<bool> {
        let mut inner = self.inner.write().await;
        if !inner.tweets.contains_key(tweet) {
            return Err(Error::not_found(format!("tweet {tweet}")));
        }
        Ok(inner.likes.entry(*tweet).or_default().insert(*user))
    }

    async fn unlike(&self, user: &UserId, tweet: &TweetId) -> Result<bool> {
        let mut inner = self.inner.write().await;
        Ok(inner
            .likes
            .get_mut(tweet)
            .map(|s| s.remove(user))
            .unwrap_or(false))
    }

    async fn retweet(&self, user: &UserId, tweet: &TweetId) -> Result<bool> {
        let mut inner = self.inner.write().await;
        if !inner.tweets.contains_key(tweet) {
            return Err(Error::not_found(format!("tweet {tweet}")));
        }
        Ok(inner.retweets.entry(*tweet).or_default().insert(*user))
    }

    async fn unretweet(&self, user: &UserId, tweet: &TweetId) -> Result<bool> {
        let mut inner = self.inner.write().await;
        Ok(inner
            .retweets
            .get_mut(tweet)
            .map(|s| s.remove(user))
            .unwrap_or(false))
    }

    async fn timeline_page(
        &self,
        viewer: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<TimelineEntry>> {
        let inner = self.inner.read().await;
        let mut authors: HashSet<UserId> = inner
            .follows
            .iter()
            .filter(|(follower, _)| follower == viewer)
            .map(|(_, followee)| *followee)
            .collect();
        authors.insert(*viewer);
        Ok(inner
            .tweets
            .values()
            .filter(|t| authors.contains(&t.author_id))
            .sorted_by_key(|t| {
                std::cmp::Reverse((t.created_at, inner.seq.get(&t.id).copied().unwrap_or(0)))
            })
            .skip(offset)
            .take(limit)
            .map(|t| inner.entry(viewer, t))
            .collect())
    }

    async fn engagement(
        &self,
        viewer: &UserId,
        tweets: &[TweetId],
    ) -> Result<HashMap<TweetId, Engagement>> {
        let inner = self.inner.read().await;
        Ok(tweets
            .iter()
            .filter(|id| inner.tweets.contains_key(id))
            .map(|id| (*id, inner.engagement(viewer, id)))
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    async fn user(store: &Store, name: &str) -> User {
        store
            .add_user(&name.parse().unwrap(), name)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn fan_out_on_read() {
        let store = Store::new();
        let alice = user(&store, "alice").await;
        let bob = user(&store, "bob").await;
        let carol = user(&store, "carol").await;

        let t1 = store.add_tweet(&bob.id, "one", None).await.unwrap();
        let _t2 = store.add_tweet(&carol.id, "two", None).await.unwrap();
        let t3 = store.add_tweet(&alice.id, "three", None).await.unwrap();

        store.follow(&alice.id, &bob.id).await.unwrap();

        // Alice sees her own tweet & Bob's, newest first; Carol's is invisible
        let page = store.timeline_page(&alice.id, 10, 0).await.unwrap();
        assert_eq!(
            page.iter().map(|e| e.tweet.id).collect::<Vec<_>>(),
            vec![t3.id, t1.id]
        );

        store.unfollow(&alice.id, &bob.id).await.unwrap();
        let page = store.timeline_page(&alice.id, 10, 0).await.unwrap();
        assert_eq!(
            page.iter().map(|e| e.tweet.id).collect::<Vec<_>>(),
            vec![t3.id]
        );
    }

    #[tokio::test]
    async fn follows_are_unique_and_irreflexive() {
        let store = Store::new();
        let alice = user(&store, "alice").await;
        let bob = user(&store, "bob").await;

        assert!(store.follow(&alice.id, &alice.id).await.unwrap_err().is_conflict());
        store.follow(&alice.id, &bob.id).await.unwrap();
        assert!(store.follow(&alice.id, &bob.id).await.unwrap_err().is_conflict());
        assert!(store.unfollow(&alice.id, &bob.id).await.unwrap());
        assert!(!store.unfollow(&alice.id, &bob.id).await.unwrap());
    }

    #[tokio::test]
    async fn engagement_is_live() {
        let store = Store::new();
        let alice = user(&store, "alice").await;
        let bob = user(&store, "bob").await;

        let tweet = store.add_tweet(&bob.id, "hello", None).await.unwrap();
        assert!(store.like(&alice.id, &tweet.id).await.unwrap());
        // A second like from the same user is a no-op, not an error
        assert!(!store.like(&alice.id, &tweet.id).await.unwrap());
        store
            .add_tweet(&alice.id, "re: hello", Some(tweet.id))
            .await
            .unwrap();

        let eng = store
            .engagement(&alice.id, &[tweet.id])
            .await
            .unwrap()[&tweet.id];
        assert_eq!(eng.counters.likes, 1);
        assert_eq!(eng.counters.replies, 1);
        assert_eq!(eng.counters.retweets, 0);
        assert!(eng.liked);
        assert!(!eng.retweeted);
    }
}
