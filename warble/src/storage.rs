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

//! # storage
//!
//! Abstractions for the warble storage layer.
//!
//! The store is the one collaborator whose failures can surface to callers, so unlike the cache
//! & event-bus boundaries its [Error] is structured: writers need to distinguish a conflict
//! (duplicate follow, say) from the backend being down.

use std::collections::HashMap;

use async_trait::async_trait;
use snafu::{prelude::*, Backtrace};

use crate::entities::{Engagement, Tweet, TweetId, User, UserId, Username};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Conflict: {what}"))]
    Conflict { what: String, backtrace: Backtrace },
    #[snafu(display("{what} not found"))]
    NotFound { what: String, backtrace: Backtrace },
    #[snafu(display("The storage backend failed: {source}"))]
    Other {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
        backtrace: Backtrace,
    },
    #[snafu(display("The storage backend is unavailable: {source}"))]
    Unavailable {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
        backtrace: Backtrace,
    },
}

impl Error {
    pub fn conflict(what: impl Into<String>) -> Error {
        ConflictSnafu { what: what.into() }.build()
    }
    pub fn not_found(what: impl Into<String>) -> Error {
        NotFoundSnafu { what: what.into() }.build()
    }
    pub fn other(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error::Other {
            source: Box::new(err),
            backtrace: Backtrace::capture(),
        }
    }
    pub fn unavailable(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error::Unavailable {
            source: Box::new(err),
            backtrace: Backtrace::capture(),
        }
    }
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Object-safe trait abstracting over the warble store
///
/// Implemented for PostgreSQL in [postgres](crate::postgres) and in-memory (for tests & demos)
/// in [memory](crate::memory). All writes are transactional: either the entire operation lands
/// or none of it does.
#[async_trait]
pub trait Backend {
    /// Create a user; [Error::Conflict] if the username is taken
    async fn add_user(&self, username: &Username, display_name: &str) -> Result<User>;
    /// Retrieve a [User] given a textual username; None means there is no user by that name
    async fn user_for_name(&self, name: &Username) -> Result<Option<User>>;
    async fn user_by_id(&self, id: &UserId) -> Result<Option<User>>;
    /// Create a tweet for `author`; `body` is assumed validated
    /// (see [validate_body](crate::entities::validate_body))
    async fn add_tweet(
        &self,
        author: &UserId,
        body: &str,
        reply_to: Option<TweetId>,
    ) -> Result<Tweet>;
    /// Delete `tweet` if it exists & is authored by `author`; return whether anything was
    /// deleted. Likes & retweets of the tweet go with it.
    async fn delete_tweet(&self, author: &UserId, tweet: &TweetId) -> Result<bool>;
    async fn tweet_by_id(&self, tweet: &TweetId) -> Result<Option<Tweet>>;
    /// Record a follow edge; [Error::Conflict] if it already exists or is reflexive
    async fn follow(&self, follower: &UserId, followee: &UserId) -> Result<()>;
    /// Remove a follow edge; return whether it existed
    async fn unfollow(&self, follower: &UserId, followee: &UserId) -> Result<bool>;
    async fn following(&self, user: &UserId) -> Result<Vec<UserId>>;
    async fn followers(&self, user: &UserId) -> Result<Vec<UserId>>;
    /// Record a like; return false if it was already there (idempotent, not an error)
    async fn like(&self, user: &UserId, tweet: &TweetId) -> Result<bool>;
    async fn unlike(&self, user: &UserId, tweet: &TweetId) -> Result<bool>;
    async fn retweet(&self, user: &UserId, tweet: &TweetId) -> Result<bool>;
    async fn unretweet(&self, user: &UserId, tweet: &TweetId) -> Result<bool>;
    /// The fan-out-on-read timeline query: tweets authored by `viewer` or by anyone `viewer`
    /// follows, newest first, bounded by `limit`/`offset`. Returns full
    /// [TimelineEntry](crate::entities::TimelineEntry) rows with engagement as of now (a
    /// snapshot, from the caller's perspective).
    async fn timeline_page(
        &self,
        viewer: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<crate::entities::TimelineEntry>>;
    /// Current engagement (counters + `viewer`'s flags) for a batch of tweets. Tweets that no
    /// longer exist are simply absent from the result.
    async fn engagement(
        &self,
        viewer: &UserId,
        tweets: &[TweetId],
    ) -> Result<HashMap<TweetId, Engagement>>;
    /// Cheap reachability probe, for health endpoints
    async fn ping(&self) -> Result<()>;
}
