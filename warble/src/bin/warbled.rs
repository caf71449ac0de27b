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

//! # warbled
//!
//! The warble server.
//!
//! Configuration comes from a TOML file (`-c`); the handful of command-line options cover
//! process startup & the things one wants to override ad hoc. `--in-memory` runs the entire
//! service in-process-- no PostgreSQL, no Redis-- which is handy for kicking the tires:
//!
//! ```text
//! $ warbled --in-memory -a 127.0.0.1:3000
//! ```

use std::{path::PathBuf, sync::Arc, time::Duration};

use axum::Router;
use clap::{crate_authors, crate_version, value_parser, Arg, ArgAction, Command};
use serde::Deserialize;
use snafu::{prelude::*, Backtrace};
use tokio::{
    net::TcpListener,
    signal::unix::{signal, SignalKind},
    sync::Notify,
};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use warble::{
    cache::{MemoryCache, RedisCache},
    consumer,
    events::{Bus, MemoryBus, RedisBus},
    follows,
    http::Warble,
    memory,
    metrics::Instruments,
    postgres, timeline, timelines, tweets, users,
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                     application Error type                                     //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("Failed to bind {address}: {source}"))]
    Bind {
        address: String,
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to connect to the event bus: {source}"))]
    Bus { source: warble::events::Error },
    #[snafu(display("Failed to create the cache client: {source}"))]
    Cache { source: warble::cache::Error },
    #[snafu(display("Failed to read the configuration file {}: {source}", path.display()))]
    Config {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to parse the configuration file: {source}"))]
    ConfigParse {
        source: toml::de::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The invalidation consumer failed: {source}"))]
    Consumer { source: warble::consumer::Error },
    #[snafu(display("Bad RUST_LOG/logging directive: {source}"))]
    EnvFilter {
        source: tracing_subscriber::filter::ParseError,
        backtrace: Backtrace,
    },
    #[snafu(display("While serving HTTP: {source}"))]
    Serve {
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to connect to the store: {source}"))]
    Storage { source: postgres::Error },
    #[snafu(display("Failed to start the tokio runtime: {source}"))]
    TokioRuntime {
        source: std::io::Error,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         configuration                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// warbled configuration; everything has a default suitable for local development
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct Config {
    /// Address on which to serve
    address: String,
    /// Cache TTL, in seconds-- the consistency backstop
    ttl_secs: u64,
    /// PostgreSQL connection string for the primary
    database_url: String,
    /// Optional PostgreSQL connection string for a read replica
    replica_url: Option<String>,
    max_connections: u32,
    /// Redis connection string; serves both the cache & the event stream
    redis_url: String,
    event_stream: String,
    consumer_group: String,
    /// How many events the invalidation consumer reads per round-trip
    consumer_batch: usize,
    /// Run entirely in-process: in-memory store, cache & bus
    in_memory: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            address: "0.0.0.0:3000".to_owned(),
            ttl_secs: timeline::DEFAULT_TTL.as_secs(),
            database_url: "postgres://warble@localhost/warble".to_owned(),
            replica_url: None,
            max_connections: 16,
            redis_url: "redis://127.0.0.1/".to_owned(),
            event_stream: "warble:events".to_owned(),
            consumer_group: "warble".to_owned(),
            consumer_batch: warble::events::DEFAULT_BATCH_SIZE,
            in_memory: false,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           the server                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// How long shutdown will wait for the consumer to drain
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

async fn serve(cfg: Config) -> Result<()> {
    let instruments = Arc::new(Instruments::new("warble"));

    let (store, cache, bus): (
        Arc<dyn warble::storage::Backend + Send + Sync>,
        Arc<dyn warble::cache::Backend + Send + Sync>,
        Arc<dyn Bus>,
    ) = if cfg.in_memory {
        info!("Running in-memory; nothing will be persisted");
        (
            Arc::new(memory::Store::new()),
            Arc::new(MemoryCache::new()),
            Arc::new(MemoryBus::new()),
        )
    } else {
        (
            Arc::new(
                postgres::Session::new(
                    &cfg.database_url,
                    cfg.replica_url.as_deref(),
                    cfg.max_connections,
                )
                .await
                .context(StorageSnafu)?,
            ),
            Arc::new(RedisCache::new(&cfg.redis_url).context(CacheSnafu)?),
            Arc::new(
                RedisBus::new(
                    &cfg.redis_url,
                    &cfg.event_stream,
                    &cfg.consumer_group,
                    // Unique per process, so multiple nodes can share the group
                    &format!("warbled-{}", Uuid::new_v4().as_hyphenated()),
                    cfg.consumer_batch,
                )
                .context(BusSnafu)?,
            ),
        )
    };

    let engine = Arc::new(timeline::Engine::new(
        store,
        cache,
        bus.clone(),
        instruments.clone(),
        Duration::from_secs(cfg.ttl_secs),
    ));
    let processor = consumer::spawn(engine.clone(), bus, instruments.clone())
        .await
        .context(ConsumerSnafu)?;

    let state = Arc::new(Warble {
        engine,
        instruments,
    });
    let app = Router::new()
        .merge(users::make_router(state.clone()))
        .merge(tweets::make_router(state.clone()))
        .merge(follows::make_router(state.clone()))
        .merge(timelines::make_router(state.clone()))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Graceful shutdown: SIGINT or SIGTERM stops the listener, then the consumer drains
    let nfy = Arc::new(Notify::new());
    {
        let nfy = nfy.clone();
        tokio::spawn(async move {
            let mut sigint = signal(SignalKind::interrupt()).unwrap(/* no more signals */);
            let mut sigterm = signal(SignalKind::terminate()).unwrap(/* no more signals */);
            tokio::select! {
                _ = sigint.recv() => {},
                _ = sigterm.recv() => {},
            }
            info!("Shutdown signal received");
            nfy.notify_waiters();
        });
    }

    let listener = TcpListener::bind(&cfg.address).await.context(BindSnafu {
        address: cfg.address.clone(),
    })?;
    info!("warbled {} listening on {}", crate_version!(), cfg.address);
    let nfy2 = nfy.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { nfy2.notified().await })
        .await
        .context(ServeSnafu)?;

    processor.shutdown(SHUTDOWN_TIMEOUT).await.context(ConsumerSnafu)?;
    info!("warbled shut down cleanly");
    Ok(())
}

fn main() -> Result<()> {
    let matches = Command::new("warbled")
        .version(crate_version!())
        .author(crate_authors!())
        .about("A small social network with a cache-aside timeline engine")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .num_args(1)
                .value_parser(value_parser!(PathBuf))
                .env("WARBLE_CONFIG")
                .help("path to a TOML configuration file"),
        )
        .arg(
            Arg::new("address")
                .short('a')
                .long("address")
                .num_args(1)
                .env("WARBLE_ADDRESS")
                .help("address on which to serve; overrides the configuration file"),
        )
        .arg(
            Arg::new("in-memory")
                .short('M')
                .long("in-memory")
                .num_args(0)
                .action(ArgAction::SetTrue)
                .help("run with in-memory store, cache & event bus (nothing is persisted)"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .num_args(0)
                .action(ArgAction::SetTrue)
                .help("produce prolix output"),
        )
        .get_matches();

    let mut cfg: Config = match matches.get_one::<PathBuf>("config") {
        Some(path) => toml::from_str(
            &std::fs::read_to_string(path).context(ConfigSnafu { path: path.clone() })?,
        )
        .context(ConfigParseSnafu)?,
        None => Config::default(),
    };
    if let Some(address) = matches.get_one::<String>("address") {
        cfg.address = address.clone();
    }
    if matches.get_flag("in-memory") {
        cfg.in_memory = true;
    }

    let default_level = if matches.get_flag("verbose") {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .parse(
                    std::env::var("RUST_LOG").unwrap_or_else(|_| format!("warble={default_level}")),
                )
                .context(EnvFilterSnafu)?,
        )
        .init();

    tokio::runtime::Runtime::new()
        .context(TokioRuntimeSnafu)?
        .block_on(serve(cfg))
}
