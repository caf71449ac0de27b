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

//! # consumer
//!
//! The invalidation consumer: the asynchronous half of the cache-invalidation scheme.
//!
//! Each node runs one of these. It drains the event bus & replays each event through
//! [Engine::apply_event], so invalidations triggered on *other* nodes land here too. The loop
//! must never stall on bad input: a payload that fails to parse is logged, counted & acked--
//! re-delivering it forever would wedge the whole group behind one poisoned entry. Ditto for a
//! parseable event whose invalidation fails; the TTL covers it.
//!
//! [Engine::apply_event]: crate::timeline::Engine::apply_event
//!
//! [spawn] subscribes *before* spawning the loop, so a subscription failure surfaces at
//! startup rather than inside a detached task. The returned [Processor] is a handle for
//! graceful shutdown.

use std::{future::Future, pin::Pin, sync::Arc, task::Poll, time::Duration};

use pin_project::pin_project;
use snafu::{prelude::*, Backtrace};
use tokio::{
    sync::Notify,
    task::{JoinError, JoinHandle},
};
use tracing::{debug, error, warn};

use crate::{
    counter_add,
    events::{Bus, Event},
    gauge_setu,
    metrics::{Instruments, Registration, Sort},
    timeline::Engine,
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("The consumer failed to run to completion: {source}"))]
    Join {
        source: JoinError,
        backtrace: Backtrace,
    },
    #[snafu(display("Timed-out shutting down the consumer: {source}"))]
    ShutdownTimeout {
        source: tokio::time::error::Elapsed,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to subscribe to the event bus: {source}"))]
    Subscribe { source: crate::events::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            metrics                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { Registration::new("consumer.events", Sort::IntegralCounter) }
inventory::submit! { Registration::new("consumer.poisoned", Sort::IntegralCounter) }
inventory::submit! { Registration::new("consumer.ack.failures", Sort::IntegralCounter) }
inventory::submit! { Registration::new("consumer.batch.size", Sort::IntegralGauge) }

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          the Processor                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Handle to a running consumer; its single interesting method, [shutdown](Processor::shutdown),
/// consumes the instance & resolves to the result of the loop
#[pin_project]
pub struct Processor {
    #[pin]
    processor: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

impl Future for Processor {
    type Output = std::result::Result<(), JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        this.processor.poll(cx)
    }
}

impl Processor {
    /// Signal the loop to exit & wait up to `timeout` for it to do so
    pub async fn shutdown(self, timeout: Duration) -> Result<()> {
        self.shutdown.notify_one();
        tokio::time::timeout(timeout, self.processor)
            .await
            .context(ShutdownTimeoutSnafu)?
            .context(JoinSnafu)
    }
}

/// How long to back-off when the bus itself errors, lest we spin
const BACKOFF: Duration = Duration::from_secs(1);

/// Subscribe to `bus` & spawn the invalidation loop
pub async fn spawn(
    engine: Arc<Engine>,
    bus: Arc<dyn Bus>,
    instruments: Arc<Instruments>,
) -> Result<Processor> {
    let mut subscription = bus.subscribe().await.context(SubscribeSnafu)?;
    let shutdown = Arc::new(Notify::new());
    let shutdown2 = shutdown.clone();
    let processor = tokio::spawn(async move {
        loop {
            let batch = tokio::select! {
                _ = shutdown2.notified() => {
                    debug!("The invalidation consumer is shutting down");
                    return;
                }
                batch = subscription.next_batch() => batch,
            };
            let deliveries = match batch {
                Ok(deliveries) => deliveries,
                Err(err) => {
                    error!("Failed to read from the event bus ({err}); backing-off");
                    tokio::time::sleep(BACKOFF).await;
                    continue;
                }
            };
            gauge_setu!(
                instruments,
                "consumer.batch.size",
                deliveries.len() as u64,
                &[]
            );
            for delivery in deliveries {
                match serde_json::from_str::<Event>(&delivery.payload) {
                    Ok(event) => {
                        engine.apply_event(&event).await;
                        counter_add!(instruments, "consumer.events", 1, &[]);
                    }
                    Err(err) => {
                        // Ack it anyway, below: re-delivery would wedge the group
                        warn!(
                            "Dropping an undecodable event ({err}): {:.128}",
                            delivery.payload
                        );
                        counter_add!(instruments, "consumer.poisoned", 1, &[]);
                    }
                }
                if let Err(err) = subscription.ack(&delivery.id).await {
                    warn!("Failed to ack {} ({err}); it may be re-delivered", delivery.id);
                    counter_add!(instruments, "consumer.ack.failures", 1, &[]);
                }
            }
        }
    });
    Ok(Processor {
        processor,
        shutdown,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        cache::{timeline_key, Backend as CacheBackend, MemoryCache},
        events::MemoryBus,
        memory,
        timeline::DEFAULT_TTL,
    };

    async fn eventually<F: Fn() -> bool>(what: &str, pred: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !pred() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed-out waiting for {what}"))
    }

    fn fixture() -> (Arc<Engine>, Arc<MemoryCache>, MemoryBus) {
        let cache = Arc::new(MemoryCache::new());
        let bus = MemoryBus::new();
        let engine = Arc::new(Engine::new(
            Arc::new(memory::Store::new()),
            cache.clone(),
            Arc::new(bus.clone()),
            Arc::new(Instruments::new("warble-test")),
            DEFAULT_TTL,
        ));
        (engine, cache, bus)
    }

    #[tokio::test]
    async fn events_invalidate_remotely() {
        let (engine, cache, bus) = fixture();
        let instruments = Arc::new(Instruments::new("warble-test"));
        let processor = spawn(engine, Arc::new(bus.clone()), instruments)
            .await
            .unwrap();

        // Seed a cached page as if some other node had populated it, then deliver that node's
        // event through the bus
        let author = crate::entities::UserId::new();
        let key = timeline_key(&author, 20, 0);
        cache.set(&key, "page", DEFAULT_TTL).await.unwrap();
        bus.publish(&Event::TweetCreated {
            author,
            tweet: crate::entities::TweetId::new(),
        })
        .await
        .unwrap();

        eventually("the event to be acked", || bus.acked().len() == 1).await;
        assert!(cache.get(&key).await.unwrap().is_none());
        processor.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn poisoned_events_are_dropped_not_retried() {
        let (engine, cache, bus) = fixture();
        let instruments = Arc::new(Instruments::new("warble-test"));
        let processor = spawn(engine, Arc::new(bus.clone()), instruments)
            .await
            .unwrap();

        bus.inject_raw("{ not json");
        // A good event behind the poisoned one still gets through
        let author = crate::entities::UserId::new();
        let key = timeline_key(&author, 20, 0);
        cache.set(&key, "page", DEFAULT_TTL).await.unwrap();
        bus.publish(&Event::TweetCreated {
            author,
            tweet: crate::entities::TweetId::new(),
        })
        .await
        .unwrap();

        // Both the poisoned delivery & the good one get acked
        eventually("both deliveries to be acked", || bus.acked().len() == 2).await;
        assert!(cache.get(&key).await.unwrap().is_none());
        processor.shutdown(Duration::from_secs(5)).await.unwrap();
    }
}
