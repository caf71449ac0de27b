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

//! # users
//!
//! The user API: signup & lookup. Minimal by design-- users exist here so that follows &
//! timelines have someone to hang off of; there is no authentication in warble.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
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
    entities::Username,
    http::{error_response, ErrorResponseBody, Warble},
    metrics::{Registration, Sort},
};

inventory::submit! { Registration::new("users.signups", Sort::IntegralCounter) }
inventory::submit! { Registration::new("users.signup.failures", Sort::IntegralCounter) }

#[derive(Debug, Deserialize)]
struct SignupReq {
    username: Username,
    /// Defaults to the username
    display_name: Option<String>,
}

async fn signup(
    State(state): State<Arc<Warble>>,
    Json(req): Json<SignupReq>,
) -> axum::response::Response {
    let display_name = req
        .display_name
        .as_deref()
        .unwrap_or_else(|| req.username.as_str());
    match state.engine.create_user(&req.username, display_name).await {
        Ok(user) => {
            info!("Created user {}", user.username);
            counter_add!(state.instruments, "users.signups", 1, &[]);
            (StatusCode::CREATED, Json(user)).into_response()
        }
        Err(err) => {
            counter_add!(state.instruments, "users.signup.failures", 1, &[]);
            error_response(&err)
        }
    }
}

async fn lookup(
    State(state): State<Arc<Warble>>,
    Path(username): Path<Username>,
) -> axum::response::Response {
    match state.engine.user_by_name(&username).await {
        Ok(Some(user)) => Json(user).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponseBody {
                error: format!("No user named {username}"),
            }),
        )
            .into_response(),
        Err(err) => error_response(&err),
    }
}

/// Return a router for the user API; merged with the other routers in the binary
pub fn make_router(state: Arc<Warble>) -> Router<Arc<Warble>> {
    Router::new()
        .route("/users", post(signup))
        .route("/users/{username}", get(lookup))
        .layer(SetResponseHeaderLayer::if_not_present(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
