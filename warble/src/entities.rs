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

//! # warble models
//!
//! Foundational types: identifiers, users, tweets, follow edges, and the denormalized timeline
//! projection that flows through the cache. Everything here is a plain value type; the storage
//! and cache layers decide how these are persisted.

use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use snafu::{prelude::*, Backtrace};
use unicode_segmentation::UnicodeSegmentation;
use uuid::Uuid;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{name} is not a valid warble username"))]
    BadUsername { name: String, backtrace: Backtrace },
    #[snafu(display("Tweet bodies may not be empty"))]
    EmptyBody { backtrace: Backtrace },
    #[snafu(display("Tweet bodies may be at most {MAX_BODY_GRAPHEMES} graphemes; got {count}"))]
    OverlongBody { count: usize, backtrace: Backtrace },
    #[snafu(display("A user cannot follow themself"))]
    SelfFollow { backtrace: Backtrace },
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          Identifiers                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// define_id!
///
/// Declare a newtype struct wrapping [Uuid] to be used as an opaque identifier for some other
/// sort of entity. I could have used [Uuid] directly, but I couldn't bring myself to use the same
/// type to identify users & tweets: mixing the two up should be a compile-time error, not a
/// 3 a.m. page.
macro_rules! define_id {
    ($type_name:ident) => {
        #[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
        #[serde(transparent)]
        pub struct $type_name(Uuid);
        impl $type_name {
            pub fn new() -> $type_name {
                $type_name(Uuid::new_v4())
            }
            pub fn from_uuid(uuid: Uuid) -> $type_name {
                $type_name(uuid)
            }
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }
        impl Default for $type_name {
            fn default() -> Self {
                Self::new()
            }
        }
        impl Display for $type_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0.as_hyphenated())
            }
        }
        impl FromStr for $type_name {
            type Err = uuid::Error;
            fn from_str(s: &str) -> StdResult<Self, Self::Err> {
                Ok($type_name(Uuid::parse_str(s)?))
            }
        }
    };
}

define_id!(UserId);
define_id!(TweetId);

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         users & follows                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

lazy_static! {
    // Lowercase alphanumerics & underscore, between one & thirty-two characters. ASCII-only is
    // deliberate: usernames appear in cache keys & URLs.
    static ref USERNAME: Regex = Regex::new("^[a-z0-9_]{1,32}$").unwrap(/* known good */);
}

/// A validated warble username
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct Username(String);

impl Username {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Username {
    type Error = Error;
    fn try_from(value: String) -> Result<Username> {
        if USERNAME.is_match(&value) {
            Ok(Username(value))
        } else {
            BadUsernameSnafu { name: value }.fail()
        }
    }
}

impl FromStr for Username {
    type Err = Error;
    fn from_str(s: &str) -> Result<Username> {
        Username::try_from(s.to_owned())
    }
}

impl From<Username> for String {
    fn from(value: Username) -> Self {
        value.0
    }
}

impl Display for Username {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A warble user; only the fields the timeline projection needs
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct User {
    pub id: UserId,
    pub username: Username,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

/// A follow edge: `follower` sees `followee`'s tweets
///
/// Must be unique & irreflexive; the former is enforced by the storage layer, the latter here
/// (and again by the storage layer, for backends with a suitable constraint).
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct FollowEdge {
    pub follower: UserId,
    pub followee: UserId,
}

impl FollowEdge {
    pub fn new(follower: UserId, followee: UserId) -> Result<FollowEdge> {
        ensure!(follower != followee, SelfFollowSnafu);
        Ok(FollowEdge { follower, followee })
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             tweets                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Maximum tweet body length, in grapheme clusters (not bytes, not chars-- an emoji family
/// counts as one)
pub const MAX_BODY_GRAPHEMES: usize = 280;

/// Validate a tweet body; returns the trimmed text
pub fn validate_body(text: &str) -> Result<String> {
    let text = text.trim();
    ensure!(!text.is_empty(), EmptyBodySnafu);
    let count = text.graphemes(true).count();
    ensure!(count <= MAX_BODY_GRAPHEMES, OverlongBodySnafu { count });
    Ok(text.to_owned())
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Tweet {
    pub id: TweetId,
    pub author_id: UserId,
    pub body: String,
    /// If set, this tweet is a reply to another; creating one bumps the parent's reply count in
    /// the timeline projection
    pub reply_to: Option<TweetId>,
    pub created_at: DateTime<Utc>,
}

/// Live engagement numbers for a single tweet
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Counters {
    pub likes: u64,
    pub retweets: u64,
    pub replies: u64,
}

/// Engagement from a particular viewer's perspective: the counters plus that viewer's own
/// interaction flags
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Engagement {
    pub counters: Counters,
    pub liked: bool,
    pub retweeted: bool,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      timeline projection                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A denormalized projection of a tweet as it appears in a viewer's timeline
///
/// Ephemeral: reconstructed from storage rows on every cache miss, never independently
/// persisted. The embedded [Engagement] is a snapshot taken at population time; the timeline
/// engine overlays live values at serve time, so consumers never see these fields staler than
/// the request that served them.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TimelineEntry {
    pub tweet: Tweet,
    pub author_username: Username,
    pub author_display_name: String,
    pub engagement: Engagement,
}

/// A TTL-bound, ordered page of [TimelineEntry], as stored in the cache
///
/// Keyed by (viewer, limit, offset); owned exclusively by the cache with the timeline engine as
/// sole writer/deleter. Lifecycle: absent -> populated -> expired-or-invalidated -> absent.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CachePage {
    pub entries: Vec<TimelineEntry>,
    pub populated_at: DateTime<Utc>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn usernames() {
        assert!("alice".parse::<Username>().is_ok());
        assert!("a_1".parse::<Username>().is_ok());
        assert!("".parse::<Username>().is_err());
        assert!("Alice".parse::<Username>().is_err());
        assert!("bad name".parse::<Username>().is_err());
        assert!("x".repeat(33).parse::<Username>().is_err());
    }

    #[test]
    fn bodies() {
        assert!(validate_body("   ").is_err());
        assert_eq!(validate_body(" hi ").unwrap(), "hi");
        // 280 heart emoji are 280 graphemes, tho rather more bytes
        assert!(validate_body(&"\u{2764}\u{fe0f}".repeat(280)).is_ok());
        assert!(validate_body(&"x".repeat(281)).is_err());
    }

    #[test]
    fn follow_edges_are_irreflexive() {
        let user = UserId::new();
        assert!(FollowEdge::new(user, user).is_err());
        assert!(FollowEdge::new(user, UserId::new()).is_ok());
    }
}
