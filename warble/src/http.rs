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

//! # http
//!
//! Odds & ends shared by the warble HTTP modules: the application state struct & the standard
//! JSON error body.
//!
//! The HTTP layer is deliberately thin. Handlers validate their inputs, call one [Engine]
//! method & map the result; anything smarter belongs in [timeline](crate::timeline).
//!
//! [Engine]: crate::timeline::Engine

use std::sync::Arc;

use axum::Json;
use serde::{Deserialize, Serialize};

use crate::{metrics::Instruments, timeline::Engine};

/// A serializable struct for use in HTTP error responses
///
/// Every handler returns errors as a JSON body of this shape; there's no way to make axum
/// enforce that, but there's at least one standard representation.
#[derive(Debug, Deserialize, Serialize)]
pub struct ErrorResponseBody {
    pub error: String,
}

impl axum::response::IntoResponse for ErrorResponseBody {
    fn into_response(self) -> axum::response::Response {
        Json(self).into_response()
    }
}

/// Application state available to all handlers
pub struct Warble {
    pub engine: Arc<Engine>,
    pub instruments: Arc<Instruments>,
}

/// Render an engine error as (status, JSON body)
pub fn error_response(err: &crate::timeline::Error) -> axum::response::Response {
    use axum::response::IntoResponse;
    let (status, msg) = err.as_status_and_msg();
    (status, Json(ErrorResponseBody { error: msg })).into_response()
}
