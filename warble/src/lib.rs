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

//! # warble
//!
//! A small social network-- tweets, follows, likes, retweets-- built around a cache-aside
//! timeline engine.
//!
//! The interesting part is not the social network; it's how the home timeline is served. See
//! [timeline] for the cache-aside read path, the write-triggered invalidation policy & the
//! live-engagement overlay, and [consumer] for the asynchronous half of invalidation. The
//! remaining modules are collaborators ([storage], [cache], [events]) & thin HTTP surface
//! ([users], [tweets], [follows], [timelines]).

pub mod cache;
pub mod consumer;
pub mod entities;
pub mod events;
pub mod follows;
pub mod http;
pub mod memory;
pub mod metrics;
pub mod postgres;
pub mod storage;
pub mod timeline;
pub mod timelines;
pub mod tweets;
pub mod users;
