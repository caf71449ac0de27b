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

//! # tweets
//!
//! The tweet API: posting & deleting tweets, the engagement toggles, & tweet detail.
//!
//! With authentication out of scope, the acting user arrives in the request itself: in the
//! body for POSTs, as the `user`/`viewer`/`author` query parameter otherwise. Each handler is
//! a thin shim over one [Engine](crate::timeline::Engine) method; the invalidation policy
//! lives there, not here.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, set_header::SetResponseHeaderLayer};
use tracing::info;

use crate::{
    counter_add,
    entities::{TweetId, UserId},
    http::{error_response, Warble},
    metrics::{Registration, Sort},
};

inventory::submit! { Registration::new("tweets.posted", Sort::IntegralCounter) }
inventory::submit! { Registration::new("tweets.deleted", Sort::IntegralCounter) }
inventory::submit! { Registration::new("tweets.failures", Sort::IntegralCounter) }
inventory::submit! { Registration::new("tweets.engagements", Sort::IntegralCounter) }

#[derive(Debug, Deserialize)]
struct PostTweetReq {
    author: UserId,
    body: String,
    reply_to: Option<TweetId>,
}

#[derive(Debug, Deserialize)]
struct AsUser {
    user: UserId,
}

#[derive(Debug, Deserialize)]
struct AsAuthor {
    author: UserId,
}

#[derive(Debug, Deserialize)]
struct AsViewer {
    viewer: UserId,
}

/// Body for the four engagement toggles; `changed` is false when the toggle was a no-op
#[derive(Debug, Serialize)]
struct EngageRsp {
    changed: bool,
}

async fn post_tweet(
    State(state): State<Arc<Warble>>,
    Json(req): Json<PostTweetReq>,
) -> axum::response::Response {
    match state
        .engine
        .post_tweet(&req.author, &req.body, req.reply_to)
        .await
    {
        Ok(tweet) => {
            info!("User {} posted tweet {}", req.author, tweet.id);
            counter_add!(state.instruments, "tweets.posted", 1, &[]);
            (StatusCode::CREATED, Json(tweet)).into_response()
        }
        Err(err) => {
            counter_add!(state.instruments, "tweets.failures", 1, &[]);
            error_response(&err)
        }
    }
}

async fn delete_tweet(
    State(state): State<Arc<Warble>>,
    Path(tweet): Path<TweetId>,
    Query(AsAuthor { author }): Query<AsAuthor>,
) -> axum::response::Response {
    match state.engine.delete_tweet(&author, &tweet).await {
        Ok(()) => {
            counter_add!(state.instruments, "tweets.deleted", 1, &[]);
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => {
            counter_add!(state.instruments, "tweets.failures", 1, &[]);
            error_response(&err)
        }
    }
}

async fn detail(
    State(state): State<Arc<Warble>>,
    Path(tweet): Path<TweetId>,
    Query(AsViewer { viewer }): Query<AsViewer>,
) -> axum::response::Response {
    match state.engine.tweet_detail(&viewer, &tweet).await {
        Ok(entry) => Json(entry).into_response(),
        Err(err) => error_response(&err),
    }
}

macro_rules! engagement_handler {
    ($name:ident) => {
        async fn $name(
            State(state): State<Arc<Warble>>,
            Path(tweet): Path<TweetId>,
            Query(AsUser { user }): Query<AsUser>,
        ) -> axum::response::Response {
            match state.engine.$name(&user, &tweet).await {
                Ok(changed) => {
                    counter_add!(state.instruments, "tweets.engagements", 1, &[]);
                    Json(EngageRsp { changed }).into_response()
                }
                Err(err) => {
                    counter_add!(state.instruments, "tweets.failures", 1, &[]);
                    error_response(&err)
                }
            }
        }
    };
}

engagement_handler!(like);
engagement_handler!(unlike);
engagement_handler!(retweet);
engagement_handler!(unretweet);

/// Return a router for the tweet API; merged with the other routers in the binary
pub fn make_router(state: Arc<Warble>) -> Router<Arc<Warble>> {
    Router::new()
        .route("/tweets", post(post_tweet))
        .route("/tweets/{id}", get(detail).delete(delete_tweet))
        .route("/tweets/{id}/like", post(like).delete(unlike))
        .route("/tweets/{id}/retweet", post(retweet).delete(unretweet))
        .layer(SetResponseHeaderLayer::if_not_present(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
