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

//! # follows
//!
//! The follow-graph API. Following or unfollowing changes what the follower's timeline *means*,
//! so the engine invalidates both parties' cached pages synchronously; a user who follows
//! someone & immediately reloads sees the change.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tower_http::{cors::CorsLayer, set_header::SetResponseHeaderLayer};
use tracing::info;

use crate::{
    counter_add,
    entities::UserId,
    http::{error_response, Warble},
    metrics::{Registration, Sort},
};

inventory::submit! { Registration::new("follows.created", Sort::IntegralCounter) }
inventory::submit! { Registration::new("follows.removed", Sort::IntegralCounter) }
inventory::submit! { Registration::new("follows.failures", Sort::IntegralCounter) }

#[derive(Debug, Deserialize)]
struct FollowReq {
    follower: UserId,
    followee: UserId,
}

async fn follow(
    State(state): State<Arc<Warble>>,
    Json(req): Json<FollowReq>,
) -> axum::response::Response {
    match state.engine.follow(&req.follower, &req.followee).await {
        Ok(()) => {
            info!("{} now follows {}", req.follower, req.followee);
            counter_add!(state.instruments, "follows.created", 1, &[]);
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => {
            counter_add!(state.instruments, "follows.failures", 1, &[]);
            error_response(&err)
        }
    }
}

async fn unfollow(
    State(state): State<Arc<Warble>>,
    Query(req): Query<FollowReq>,
) -> axum::response::Response {
    match state.engine.unfollow(&req.follower, &req.followee).await {
        Ok(()) => {
            counter_add!(state.instruments, "follows.removed", 1, &[]);
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => {
            counter_add!(state.instruments, "follows.failures", 1, &[]);
            error_response(&err)
        }
    }
}

async fn following(
    State(state): State<Arc<Warble>>,
    Path(user): Path<UserId>,
) -> axum::response::Response {
    match state.engine.following(&user).await {
        Ok(ids) => Json(ids).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn followers(
    State(state): State<Arc<Warble>>,
    Path(user): Path<UserId>,
) -> axum::response::Response {
    match state.engine.followers(&user).await {
        Ok(ids) => Json(ids).into_response(),
        Err(err) => error_response(&err),
    }
}

/// Return a router for the follow-graph API; merged with the other routers in the binary
pub fn make_router(state: Arc<Warble>) -> Router<Arc<Warble>> {
    Router::new()
        .route("/follows", post(follow).delete(unfollow))
        .route("/users/{id}/following", get(following))
        .route("/users/{id}/followers", get(followers))
        .layer(SetResponseHeaderLayer::if_not_present(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
