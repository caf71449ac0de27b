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

//! # postgres
//!
//! [Storage] implementation for PostgreSQL.
//!
//! [Storage]: crate::storage
//!
//! The expected schema:
//!
//! ```sql
//! create table users (
//!     id           uuid primary key,
//!     username     text not null unique,
//!     display_name text not null,
//!     created_at   timestamptz not null default now()
//! );
//! create table tweets (
//!     id         uuid primary key,
//!     author_id  uuid not null references users (id),
//!     reply_to   uuid,
//!     body       text not null,
//!     created_at timestamptz not null default now()
//! );
//! create index tweets_by_author on tweets (author_id, created_at desc);
//! create table follows (
//!     follower_id uuid not null references users (id),
//!     followee_id uuid not null references users (id),
//!     created_at  timestamptz not null default now(),
//!     primary key (follower_id, followee_id),
//!     check (follower_id <> followee_id)
//! );
//! create table likes (
//!     user_id  uuid not null,
//!     tweet_id uuid not null,
//!     primary key (user_id, tweet_id)
//! );
//! create table retweets (
//!     user_id  uuid not null,
//!     tweet_id uuid not null,
//!     primary key (user_id, tweet_id)
//! );
//! ```
//!
//! # Read/write routing
//!
//! [Session] holds two pools: the authoritative primary, and (optionally) a lagging read
//! replica. Writes always go to the primary, inside a transaction. Reads prefer the replica;
//! if the replica is unreachable the read is retried once against the primary before the error
//! is surfaced. Timeline reads being the hot path, this keeps the primary's load down without
//! making the replica a single point of failure.

use std::collections::HashMap;

use async_trait::async_trait;
use snafu::{prelude::*, Backtrace};
use sqlx::{
    postgres::{PgPool, PgPoolOptions},
    Row,
};
use tap::Pipe;
use tracing::warn;
use uuid::Uuid;

use crate::{
    entities::{
        Counters, Engagement, FollowEdge, TimelineEntry, Tweet, TweetId, User, UserId, Username,
    },
    storage::{self, Backend},
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to connect to PostgreSQL: {source}"))]
    Connect {
        source: sqlx::Error,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        error taxonomy                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Would retrying against a different host plausibly help?
fn is_unavailable(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::WorkerCrashed
    )
}

/// Map an [sqlx::Error] onto the structured [storage::Error] taxonomy
fn classify(err: sqlx::Error) -> storage::Error {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return storage::Error::conflict(db.message().to_owned());
        }
    }
    if is_unavailable(&err) {
        storage::Error::unavailable(err)
    } else {
        storage::Error::other(err)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                  warble PostgreSQL session type                                //
////////////////////////////////////////////////////////////////////////////////////////////////////

mod sql {
    pub const INSERT_USER: &str =
        "insert into users (id, username, display_name, created_at) values ($1, $2, $3, $4)";
    pub const SELECT_USER_BY_NAME: &str =
        "select id, username, display_name, created_at from users where username = $1";
    pub const SELECT_USER_BY_ID: &str =
        "select id, username, display_name, created_at from users where id = $1";
    pub const INSERT_TWEET: &str =
        "insert into tweets (id, author_id, reply_to, body, created_at) values ($1, $2, $3, $4, $5)";
    pub const SELECT_TWEET: &str =
        "select id, author_id, reply_to, body, created_at from tweets where id = $1";
    pub const DELETE_TWEET_LIKES: &str = "delete from likes where tweet_id = $1";
    pub const DELETE_TWEET_RETWEETS: &str = "delete from retweets where tweet_id = $1";
    pub const DELETE_TWEET: &str = "delete from tweets where id = $1 and author_id = $2";
    pub const INSERT_FOLLOW: &str =
        "insert into follows (follower_id, followee_id, created_at) values ($1, $2, $3)";
    pub const DELETE_FOLLOW: &str =
        "delete from follows where follower_id = $1 and followee_id = $2";
    pub const SELECT_FOLLOWING: &str =
        "select followee_id from follows where follower_id = $1";
    pub const SELECT_FOLLOWERS: &str =
        "select follower_id from follows where followee_id = $1";
    pub const INSERT_LIKE: &str =
        "insert into likes (user_id, tweet_id) values ($1, $2) on conflict do nothing";
    pub const DELETE_LIKE: &str = "delete from likes where user_id = $1 and tweet_id = $2";
    pub const INSERT_RETWEET: &str =
        "insert into retweets (user_id, tweet_id) values ($1, $2) on conflict do nothing";
    pub const DELETE_RETWEET: &str = "delete from retweets where user_id = $1 and tweet_id = $2";
    /// The fan-out-on-read join: the viewer's own tweets plus everyone they follow, newest
    /// first, with engagement sub-selects evaluated as of this statement
    pub const TIMELINE_PAGE: &str = "\
select t.id, t.author_id, t.reply_to, t.body, t.created_at, u.username, u.display_name,
       (select count(*) from likes l where l.tweet_id = t.id) as likes,
       (select count(*) from retweets r where r.tweet_id = t.id) as retweets,
       (select count(*) from tweets c where c.reply_to = t.id) as replies,
       exists(select 1 from likes l where l.tweet_id = t.id and l.user_id = $1) as liked,
       exists(select 1 from retweets r where r.tweet_id = t.id and r.user_id = $1) as retweeted
from tweets t join users u on u.id = t.author_id
where t.author_id = $1
   or t.author_id in (select followee_id from follows where follower_id = $1)
order by t.created_at desc, t.id desc
limit $2 offset $3";
    pub const ENGAGEMENT: &str = "\
select t.id,
       (select count(*) from likes l where l.tweet_id = t.id) as likes,
       (select count(*) from retweets r where r.tweet_id = t.id) as retweets,
       (select count(*) from tweets c where c.reply_to = t.id) as replies,
       exists(select 1 from likes l where l.tweet_id = t.id and l.user_id = $1) as liked,
       exists(select 1 from retweets r where r.tweet_id = t.id and r.user_id = $1) as retweeted
from tweets t where t.id = any($2)";
}

fn user_from_row(row: &sqlx::postgres::PgRow) -> StdResult<User, sqlx::Error> {
    Ok(User {
        id: UserId::from_uuid(row.try_get("id")?),
        username: row
            .try_get::<String, _>("username")?
            .try_into()
            .map_err(|err| sqlx::Error::Decode(Box::new(err)))?,
        display_name: row.try_get("display_name")?,
        created_at: row.try_get("created_at")?,
    })
}

fn tweet_from_row(row: &sqlx::postgres::PgRow) -> StdResult<Tweet, sqlx::Error> {
    Ok(Tweet {
        id: TweetId::from_uuid(row.try_get("id")?),
        author_id: UserId::from_uuid(row.try_get("author_id")?),
        body: row.try_get("body")?,
        reply_to: row
            .try_get::<Option<Uuid>, _>("reply_to")?
            .map(TweetId::from_uuid),
        created_at: row.try_get("created_at")?,
    })
}

fn engagement_from_row(row: &sqlx::postgres::PgRow) -> StdResult<Engagement, sqlx::Error> {
    Ok(Engagement {
        counters: Counters {
            likes: row.try_get::<i64, _>("likes")? as u64,
            retweets: row.try_get::<i64, _>("retweets")? as u64,
            replies: row.try_get::<i64, _>("replies")? as u64,
        },
        liked: row.try_get("liked")?,
        retweeted: row.try_get("retweeted")?,
    })
}

/// `warble`-specific PostgreSQL session type
///
/// Instantiate via [Session::new] with a primary connection string & an optional read-replica
/// connection string.
pub struct Session {
    primary: PgPool,
    replica: Option<PgPool>,
}

impl Session {
    pub async fn new(
        primary_url: &str,
        replica_url: Option<&str>,
        max_connections: u32,
    ) -> Result<Session> {
        let primary = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(primary_url)
            .await
            .context(ConnectSnafu)?;
        let replica = match replica_url {
            Some(url) => PgPoolOptions::new()
                .max_connections(max_connections)
                .connect(url)
                .await
                .context(ConnectSnafu)?
                .pipe(Some),
            None => None,
        };
        Ok(Session { primary, replica })
    }

    /// Run a read against the replica if we have one, falling back to the primary exactly once
    /// if the replica looks unreachable. `run` may be invoked twice, so it rebuilds its query
    /// each call; [PgPool] is handed over by value (it's an `Arc` under the hood) to keep the
    /// closure's lifetime simple.
    async fn read<T, F, Fut>(&self, what: &str, run: F) -> storage::Result<T>
    where
        F: Fn(PgPool) -> Fut,
        Fut: std::future::Future<Output = StdResult<T, sqlx::Error>>,
    {
        match &self.replica {
            Some(replica) => match run(replica.clone()).await {
                Ok(value) => Ok(value),
                Err(err) if is_unavailable(&err) => {
                    warn!("Replica unavailable while reading {what} ({err}); retrying against the primary");
                    run(self.primary.clone()).await.map_err(classify)
                }
                Err(err) => Err(classify(err)),
            },
            None => run(self.primary.clone()).await.map_err(classify),
        }
    }
}

#[async_trait]
impl Backend for Session {
    async fn add_user(&self, username: &Username, display_name: &str) -> storage::Result<User> {
        let user = User {
            id: UserId::new(),
            username: username.clone(),
            display_name: display_name.to_owned(),
            created_at: chrono::Utc::now(),
        };
        sqlx::query(sql::INSERT_USER)
            .bind(user.id.as_uuid())
            .bind(user.username.as_str())
            .bind(&user.display_name)
            .bind(user.created_at)
            .execute(&self.primary)
            .await
            .map_err(classify)?;
        Ok(user)
    }

    async fn user_for_name(&self, name: &Username) -> storage::Result<Option<User>> {
        let name = name.as_str().to_owned();
        self.read("a user", move |pool| {
            let name = name.clone();
            async move {
                sqlx::query(sql::SELECT_USER_BY_NAME)
                    .bind(name)
                    .fetch_optional(&pool)
                    .await?
                    .as_ref()
                    .map(user_from_row)
                    .transpose()
            }
        })
        .await
    }

    async fn user_by_id(&self, id: &UserId) -> storage::Result<Option<User>> {
        let id = id.as_uuid();
        self.read("a user", move |pool| async move {
            sqlx::query(sql::SELECT_USER_BY_ID)
                .bind(id)
                .fetch_optional(&pool)
                .await?
                .as_ref()
                .map(user_from_row)
                .transpose()
        })
        .await
    }

    async fn add_tweet(
        &self,
        author: &UserId,
        body: &str,
        reply_to: Option<TweetId>,
    ) -> storage::Result<Tweet> {
        let tweet = Tweet {
            id: TweetId::new(),
            author_id: *author,
            body: body.to_owned(),
            reply_to,
            created_at: chrono::Utc::now(),
        };
        let mut tx = self.primary.begin().await.map_err(classify)?;
        sqlx::query(sql::INSERT_TWEET)
            .bind(tweet.id.as_uuid())
            .bind(tweet.author_id.as_uuid())
            .bind(tweet.reply_to.map(|id| id.as_uuid()))
            .bind(&tweet.body)
            .bind(tweet.created_at)
            .execute(&mut *tx)
            .await
            .map_err(classify)?;
        tx.commit().await.map_err(classify)?;
        Ok(tweet)
    }

    async fn delete_tweet(&self, author: &UserId, tweet: &TweetId) -> storage::Result<bool> {
        // Single transaction: the tweet & its likes/retweets go together, or not at all. The
        // guarded delete comes first; if `author` doesn't own the tweet nothing else may be
        // touched.
        let mut tx = self.primary.begin().await.map_err(classify)?;
        let deleted = sqlx::query(sql::DELETE_TWEET)
            .bind(tweet.as_uuid())
            .bind(author.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(classify)?
            .rows_affected()
            > 0;
        if !deleted {
            tx.rollback().await.map_err(classify)?;
            return Ok(false);
        }
        sqlx::query(sql::DELETE_TWEET_LIKES)
            .bind(tweet.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(classify)?;
        sqlx::query(sql::DELETE_TWEET_RETWEETS)
            .bind(tweet.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(classify)?;
        tx.commit().await.map_err(classify)?;
        Ok(true)
    }

    async fn tweet_by_id(&self, tweet: &TweetId) -> storage::Result<Option<Tweet>> {
        let id = tweet.as_uuid();
        self.read("a tweet", move |pool| async move {
            sqlx::query(sql::SELECT_TWEET)
                .bind(id)
                .fetch_optional(&pool)
                .await?
                .as_ref()
                .map(tweet_from_row)
                .transpose()
        })
        .await
    }

    async fn follow(&self, follower: &UserId, followee: &UserId) -> storage::Result<()> {
        // The check constraint would catch this too, but the error message is friendlier here
        let edge = FollowEdge::new(*follower, *followee)
            .map_err(|_| storage::Error::conflict("reflexive follow"))?;
        sqlx::query(sql::INSERT_FOLLOW)
            .bind(edge.follower.as_uuid())
            .bind(edge.followee.as_uuid())
            .bind(chrono::Utc::now())
            .execute(&self.primary)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn unfollow(&self, follower: &UserId, followee: &UserId) -> storage::Result<bool> {
        sqlx::query(sql::DELETE_FOLLOW)
            .bind(follower.as_uuid())
            .bind(followee.as_uuid())
            .execute(&self.primary)
            .await
            .map_err(classify)?
            .rows_affected()
            .pipe(|n| Ok(n > 0))
    }

    async fn following(&self, user: &UserId) -> storage::Result<Vec<UserId>> {
        let id = user.as_uuid();
        self.read("follow edges", move |pool| async move {
            sqlx::query(sql::SELECT_FOLLOWING)
                .bind(id)
                .fetch_all(&pool)
                .await?
                .iter()
                .map(|row| row.try_get::<Uuid, _>("followee_id").map(UserId::from_uuid))
                .collect()
        })
        .await
    }

    async fn followers(&self, user: &UserId) -> storage::Result<Vec<UserId>> {
        let id = user.as_uuid();
        self.read("follow edges", move |pool| async move {
            sqlx::query(sql::SELECT_FOLLOWERS)
                .bind(id)
                .fetch_all(&pool)
                .await?
                .iter()
                .map(|row| row.try_get::<Uuid, _>("follower_id").map(UserId::from_uuid))
                .collect()
        })
        .await
    }

    async fn like(&self, user: &UserId, tweet: &TweetId) -> storage::Result<bool> {
        sqlx::query(sql::INSERT_LIKE)
            .bind(user.as_uuid())
            .bind(tweet.as_uuid())
            .execute(&self.primary)
            .await
            .map_err(classify)?
            .rows_affected()
            .pipe(|n| Ok(n > 0))
    }

    async fn unlike(&self, user: &UserId, tweet: &TweetId) -> storage::Result<bool> {
        sqlx::query(sql::DELETE_LIKE)
            .bind(user.as_uuid())
            .bind(tweet.as_uuid())
            .execute(&self.primary)
            .await
            .map_err(classify)?
            .rows_affected()
            .pipe(|n| Ok(n > 0))
    }

    async fn retweet(&self, user: &UserId, tweet: &TweetId) -> storage::Result<bool> {
        sqlx::query(sql::INSERT_RETWEET)
            .bind(user.as_uuid())
            .bind(tweet.as_uuid())
            .execute(&self.primary)
            .await
            .map_err(classify)?
            .rows_affected()
            .pipe(|n| Ok(n > 0))
    }

    async fn unretweet(&self, user: &UserId, tweet: &TweetId) -> storage::Result<bool> {
        sqlx::query(sql::DELETE_RETWEET)
            .bind(user.as_uuid())
            .bind(tweet.as_uuid())
            .execute(&self.primary)
            .await
            .map_err(classify)?
            .rows_affected()
            .pipe(|n| Ok(n > 0))
    }

    async fn timeline_page(
        &self,
        viewer: &UserId,
        limit: usize,
        offset: usize,
    ) -> storage::Result<Vec<TimelineEntry>> {
        let viewer = viewer.as_uuid();
        self.read("a timeline page", move |pool| async move {
            sqlx::query(sql::TIMELINE_PAGE)
                .bind(viewer)
                .bind(limit as i64)
                .bind(offset as i64)
                .fetch_all(&pool)
                .await?
                .iter()
                .map(|row| {
                    Ok(TimelineEntry {
                        tweet: tweet_from_row(row)?,
                        author_username: row
                            .try_get::<String, _>("username")?
                            .try_into()
                            .map_err(|err| sqlx::Error::Decode(Box::new(err)))?,
                        author_display_name: row.try_get("display_name")?,
                        engagement: engagement_from_row(row)?,
                    })
                })
                .collect()
        })
        .await
    }

    async fn engagement(
        &self,
        viewer: &UserId,
        tweets: &[TweetId],
    ) -> storage::Result<HashMap<TweetId, Engagement>> {
        let viewer = viewer.as_uuid();
        let ids = tweets.iter().map(|id| id.as_uuid()).collect::<Vec<Uuid>>();
        self.read("engagement", move |pool| {
            let ids = ids.clone();
            async move {
                sqlx::query(sql::ENGAGEMENT)
                    .bind(viewer)
                    .bind(ids)
                    .fetch_all(&pool)
                    .await?
                    .iter()
                    .map(|row| {
                        Ok((
                            TweetId::from_uuid(row.try_get("id")?),
                            engagement_from_row(row)?,
                        ))
                    })
                    .collect()
            }
        })
        .await
    }

    async fn ping(&self) -> storage::Result<()> {
        sqlx::query("select 1")
            .execute(&self.primary)
            .await
            .map_err(classify)?;
        Ok(())
    }
}
