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

//! # timelines
//!
//! The timeline API-- one read endpoint over the engine's cache-aside path-- plus the health
//! probe.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tower_http::{cors::CorsLayer, set_header::SetResponseHeaderLayer};

use crate::{
    entities::UserId,
    http::{error_response, Warble},
};

fn default_limit() -> usize {
    20
}

#[derive(Debug, Deserialize)]
struct TimelineParams {
    viewer: UserId,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

async fn timeline(
    State(state): State<Arc<Warble>>,
    Query(params): Query<TimelineParams>,
) -> axum::response::Response {
    match state
        .engine
        .get_timeline(&params.viewer, params.limit, params.offset)
        .await
    {
        Ok(entries) => Json(entries).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn health(State(state): State<Arc<Warble>>) -> axum::response::Response {
    let health = state.engine.health().await;
    // The store is the source of truth; without it we are down. Cache & bus degrade.
    let status = if health.store {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health)).into_response()
}

/// Return a router for the timeline API; merged with the other routers in the binary
pub fn make_router(state: Arc<Warble>) -> Router<Arc<Warble>> {
    Router::new()
        .route("/timeline", get(timeline))
        .route("/health", get(health))
        .layer(SetResponseHeaderLayer::if_not_present(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
