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

//! # events
//!
//! The warble event bus.
//!
//! Every successful write publishes a [Event] describing what changed. The timeline engine
//! performs its synchronous invalidations before the publish, so the bus is a second,
//! asynchronous line of defense: a consumer (see [consumer](crate::consumer)) applies the same
//! invalidation policy on every node, catching entries the writing node couldn't see.
//! Publication is best-effort; a lost event is covered by the cache TTL.
//!
//! The production implementation rides on Redis Streams with a consumer group per deployment,
//! so each event is processed once per group however many consumers are running.

use async_trait::async_trait;
use deadpool_redis::{redis, Config, Pool, Runtime};
use serde::{Deserialize, Serialize};
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
    #[snafu(display("Failed to encode an event: {source}"))]
    Encode {
        source: serde_json::Error,
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
//                                             events                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A write that has already been applied to the store
///
/// Wire format is JSON under the single `event` field of a stream entry; the `kind` tag keeps
/// the format self-describing so consumers can skip kinds they don't know.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    TweetCreated { author: UserId, tweet: TweetId },
    TweetDeleted { author: UserId, tweet: TweetId },
    Followed { follower: UserId, followee: UserId },
    Unfollowed { follower: UserId, followee: UserId },
    Liked { user: UserId, tweet: TweetId },
    Unliked { user: UserId, tweet: TweetId },
    Retweeted { user: UserId, tweet: TweetId },
    Unretweeted { user: UserId, tweet: TweetId },
}

/// One entry as read off the bus: an opaque delivery id (for acking) & the raw payload
///
/// The payload stays raw here: a payload that fails to parse must still be ackable, else it
/// would be re-delivered forever.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub id: String,
    pub payload: String,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                     Bus & Subscription traits                                  //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Object-safe trait abstracting over the warble event bus
#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, event: &Event) -> Result<()>;
    /// Join (creating if need be) this deployment's consumer group & return a handle for
    /// reading from it
    async fn subscribe(&self) -> Result<Box<dyn Subscription>>;
    /// Cheap reachability probe, for health endpoints
    async fn ping(&self) -> Result<()>;
}

/// A consumer-group membership; vended by [Bus::subscribe]
#[async_trait]
pub trait Subscription: Send {
    /// Block for the next batch of deliveries; an empty batch means the wait timed-out (call
    /// again)
    async fn next_batch(&mut self) -> Result<Vec<Delivery>>;
    /// Acknowledge a delivery so the group never sees it again
    async fn ack(&mut self, id: &str) -> Result<()>;
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            RedisBus                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

const BLOCK_MILLIS: u64 = 5000;

/// Default number of entries read per XREADGROUP; overridable via [RedisBus::new]
pub const DEFAULT_BATCH_SIZE: usize = 32;

/// [Bus] implementation in terms of a Redis Stream
pub struct RedisBus {
    pool: Pool,
    stream: String,
    group: String,
    consumer: String,
    batch_size: usize,
}

impl RedisBus {
    pub fn new(
        url: &str,
        stream: &str,
        group: &str,
        consumer: &str,
        batch_size: usize,
    ) -> Result<RedisBus> {
        let pool = Config::from_url(url)
            .create_pool(Some(Runtime::Tokio1))
            .context(CreatePoolSnafu)?;
        Ok(RedisBus {
            pool,
            stream: stream.to_owned(),
            group: group.to_owned(),
            consumer: consumer.to_owned(),
            batch_size: batch_size.max(1),
        })
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn publish(&self, event: &Event) -> Result<()> {
        let payload = serde_json::to_string(event).context(EncodeSnafu)?;
        let mut conn = self.pool.get().await.context(PoolSnafu)?;
        redis::cmd("XADD")
            .arg(&self.stream)
            .arg("*")
            .arg("event")
            .arg(payload)
            .query_async::<String>(&mut conn)
            .await
            .context(RedisSnafu)?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<Box<dyn Subscription>> {
        let mut conn = self.pool.get().await.context(PoolSnafu)?;
        // MKSTREAM so subscribing before the first publish works; BUSYGROUP just means some
        // other consumer got here first
        match redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async::<()>(&mut conn)
            .await
        {
            Ok(()) => {}
            Err(err) if err.to_string().contains("BUSYGROUP") => {}
            Err(err) => return Err(err).context(RedisSnafu),
        }
        Ok(Box::new(RedisSubscription {
            pool: self.pool.clone(),
            stream: self.stream.clone(),
            group: self.group.clone(),
            consumer: self.consumer.clone(),
            batch_size: self.batch_size,
        }))
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

struct RedisSubscription {
    pool: Pool,
    stream: String,
    group: String,
    consumer: String,
    batch_size: usize,
}

/// The shape into which a (non-nil) XREADGROUP reply decodes: one (stream, entries) pair per
/// stream requested, each entry an (id, field-value map) pair
type ReadGroupReply = Vec<(String, Vec<(String, std::collections::HashMap<String, String>)>)>;

#[async_trait]
impl Subscription for RedisSubscription {
    async fn next_batch(&mut self) -> Result<Vec<Delivery>> {
        let mut conn = self.pool.get().await.context(PoolSnafu)?;
        let reply: Option<ReadGroupReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(self.batch_size)
            .arg("BLOCK")
            .arg(BLOCK_MILLIS)
            .arg("STREAMS")
            .arg(&self.stream)
            .arg(">")
            .query_async(&mut conn)
            .await
            .context(RedisSnafu)?;
        Ok(reply
            .unwrap_or_default()
            .into_iter()
            .flat_map(|(_, entries)| entries)
            .filter_map(|(id, mut fields)| {
                fields.remove("event").map(|payload| Delivery { id, payload })
            })
            .collect())
    }

    async fn ack(&mut self, id: &str) -> Result<()> {
        let mut conn = self.pool.get().await.context(PoolSnafu)?;
        redis::cmd("XACK")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(id)
            .query_async::<u64>(&mut conn)
            .await
            .context(RedisSnafu)?;
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           MemoryBus                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Default)]
struct MemoryBusState {
    next_id: u64,
    subscribers: Vec<tokio::sync::mpsc::UnboundedSender<Delivery>>,
    published: Vec<Event>,
    acked: Vec<String>,
}

/// In-process [Bus] implementation for the test suites
///
/// Deliveries fan-out to every subscription; [MemoryBus::published] & [MemoryBus::acked] let
/// tests assert on traffic after the fact.
#[derive(Clone, Default)]
pub struct MemoryBus {
    state: std::sync::Arc<std::sync::Mutex<MemoryBusState>>,
}

impl MemoryBus {
    pub fn new() -> MemoryBus {
        MemoryBus::default()
    }
    /// Every event published so far, in order
    pub fn published(&self) -> Vec<Event> {
        self.state.lock().unwrap(/* poisoned */).published.clone()
    }
    /// Every delivery id acked so far, in order
    pub fn acked(&self) -> Vec<String> {
        self.state.lock().unwrap(/* poisoned */).acked.clone()
    }
    /// Inject a raw payload, bypassing [Event] serialization; for exercising consumers against
    /// malformed traffic
    pub fn inject_raw(&self, payload: &str) {
        let mut state = self.state.lock().unwrap(/* poisoned */);
        state.next_id += 1;
        let delivery = Delivery {
            id: state.next_id.to_string(),
            payload: payload.to_owned(),
        };
        state
            .subscribers
            .retain(|tx| tx.send(delivery.clone()).is_ok());
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, event: &Event) -> Result<()> {
        let payload = serde_json::to_string(event).context(EncodeSnafu)?;
        let mut state = self.state.lock().unwrap(/* poisoned */);
        state.published.push(*event);
        state.next_id += 1;
        let delivery = Delivery {
            id: state.next_id.to_string(),
            payload,
        };
        state
            .subscribers
            .retain(|tx| tx.send(delivery.clone()).is_ok());
        Ok(())
    }

    async fn subscribe(&self) -> Result<Box<dyn Subscription>> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        self.state.lock().unwrap(/* poisoned */).subscribers.push(tx);
        Ok(Box::new(MemorySubscription {
            rx,
            state: self.state.clone(),
        }))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

struct MemorySubscription {
    rx: tokio::sync::mpsc::UnboundedReceiver<Delivery>,
    state: std::sync::Arc<std::sync::Mutex<MemoryBusState>>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_batch(&mut self) -> Result<Vec<Delivery>> {
        match self.rx.recv().await {
            Some(first) => {
                let mut batch = vec![first];
                while let Ok(delivery) = self.rx.try_recv() {
                    batch.push(delivery);
                }
                Ok(batch)
            }
            // All senders dropped; report an empty batch forever rather than erroring
            None => Ok(Vec::new()),
        }
    }

    async fn ack(&mut self, id: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap(/* poisoned */)
            .acked
            .push(id.to_owned());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wire_format() {
        let author = UserId::new();
        let tweet = TweetId::new();
        let event = Event::TweetCreated { author, tweet };
        let text = serde_json::to_string(&event).unwrap();
        assert!(text.contains("\"kind\":\"tweet_created\""));
        assert_eq!(serde_json::from_str::<Event>(&text).unwrap(), event);
    }

    #[tokio::test]
    async fn fan_out() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe().await.unwrap();
        let event = Event::Liked {
            user: UserId::new(),
            tweet: TweetId::new(),
        };
        bus.publish(&event).await.unwrap();
        let batch = sub.next_batch().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(
            serde_json::from_str::<Event>(&batch[0].payload).unwrap(),
            event
        );
        sub.ack(&batch[0].id).await.unwrap();
        assert_eq!(bus.acked(), vec![batch[0].id.clone()]);
        assert_eq!(bus.published(), vec![event]);
    }
}
