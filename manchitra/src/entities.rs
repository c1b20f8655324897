// Copyright (C) 2025-2026 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of manchitra.
//
// manchitra is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// manchitra is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with manchitra.  If not,
// see <http://www.gnu.org/licenses/>.

//! # manchitra models
//!
//! ## Introduction
//!
//! I hate these sort of "catch-all" modules named "models" or "entities", but these types are truly
//! foundational: everything an entity can accrue (views, likes, poll votes) and the refined
//! identifier types that name the parties involved. The identifiers deserve a word: user identity
//! is minted by an external identity provider, so from this crate's perspective a [UserId] is an
//! opaque string. "Opaque" doesn't mean "arbitrary", though-- a stray control character in a user
//! id will happily round-trip through the store and come back to bite whoever renders it, so we
//! validate on construction *and* on deserialization.

use std::{collections::HashSet, fmt::Display, ops::Deref, str::FromStr};

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use snafu::{prelude::*, Backtrace};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{text} is not a valid poll option identifier"))]
    BadOptionId { text: String, backtrace: Backtrace },
    #[snafu(display("{text} is not a valid ranking kind (expected \"views\" or \"visits\")"))]
    BadRankingKind { text: String, backtrace: Backtrace },
    #[snafu(display("{text} is not a valid user identifier"))]
    BadUserId { text: String, backtrace: Backtrace },
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

fn mk_serde_de_err<'de, D: serde::Deserializer<'de>>(err: impl std::error::Error) -> D::Error {
    <D::Error as serde::de::Error>::custom(format!("{:?}", err))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          Identifiers                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An opaque identifier for a place or post capable of accruing engagement
///
/// The catalog (an external collaborator) assigns these; this crate only ever receives them,
/// stores counters under them, and hands them back. A plain integer wrapped in a newtype so that a
/// view count can't be mistaken for an entity id in a function signature.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct EntityId(pub u64);

impl Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for EntityId {
    fn from(value: u64) -> Self {
        EntityId(value)
    }
}

// manchitra user identifiers are minted elsewhere; we accept printable ASCII, one to 128
// characters, no whitespace.
const MAX_USER_ID_LENGTH: usize = 128;

lazy_static! {
    static ref USER_ID: Regex = Regex::new("^[!-~]+$").unwrap(/* known good */);
}

fn check_user_id(s: &str) -> bool {
    !s.is_empty() && s.len() <= MAX_USER_ID_LENGTH && USER_ID.is_match(s)
}

/// A refined type representing an externally-minted user identifier
// Boy... writing refined types in Rust involves a *lot* of boilerplate. I have to wonder if there
// isn't a better way...
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Construct a [UserId] from a `&str`, copying it
    ///
    /// User identifiers must be printable, non-whitespace ASCII, from one to 128 characters. To
    /// *move* a [String] into a [UserId] (with validity checking) use [TryFrom::try_from()].
    pub fn new(text: &str) -> Result<UserId> {
        check_user_id(text)
            .then_some(UserId(text.to_owned()))
            .ok_or(
                BadUserIdSnafu {
                    text: text.to_owned(),
                }
                .build(),
            )
    }
}

impl AsRef<str> for UserId {
    fn as_ref(&self) -> &str {
        self.deref()
    }
}

impl Deref for UserId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// Implement `Deserialize` by hand to fail if the serialized value isn't a legit `UserId`
impl<'de> Deserialize<'de> for UserId {
    fn deserialize<D>(deserializer: D) -> StdResult<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        UserId::try_from(s).map_err(mk_serde_de_err::<'de, D>)
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = Error;

    fn from_str(s: &str) -> StdResult<Self, Self::Err> {
        UserId::new(s)
    }
}

impl TryFrom<String> for UserId {
    type Error = Error;

    fn try_from(text: String) -> StdResult<Self, Self::Error> {
        if check_user_id(&text) {
            Ok(UserId(text))
        } else {
            BadUserIdSnafu { text }.fail()
        }
    }
}

// Poll option identifiers are assigned by whoever authored the poll; same alphabet as user ids,
// but shorter.
const MAX_OPTION_ID_LENGTH: usize = 64;

fn check_option_id(s: &str) -> bool {
    !s.is_empty() && s.len() <= MAX_OPTION_ID_LENGTH && USER_ID.is_match(s)
}

/// A refined type representing a poll option identifier
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct OptionId(String);

impl OptionId {
    pub fn new(text: &str) -> Result<OptionId> {
        check_option_id(text)
            .then_some(OptionId(text.to_owned()))
            .ok_or(
                BadOptionIdSnafu {
                    text: text.to_owned(),
                }
                .build(),
            )
    }
}

impl AsRef<str> for OptionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for OptionId {
    fn deserialize<D>(deserializer: D) -> StdResult<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        OptionId::try_from(s).map_err(mk_serde_de_err::<'de, D>)
    }
}

impl Display for OptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for OptionId {
    type Error = Error;

    fn try_from(text: String) -> StdResult<Self, Self::Error> {
        if check_option_id(&text) {
            Ok(OptionId(text))
        } else {
            BadOptionIdSnafu { text }.fail()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          RankingKind                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The counter family over which a ranking is computed
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RankingKind {
    Views,
    Visits,
}

impl Display for RankingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                RankingKind::Views => "views",
                RankingKind::Visits => "visits",
            }
        )
    }
}

impl FromStr for RankingKind {
    type Err = Error;

    fn from_str(s: &str) -> StdResult<Self, Self::Err> {
        match s {
            "views" => Ok(RankingKind::Views),
            "visits" => Ok(RankingKind::Visits),
            text => BadRankingKindSnafu { text }.fail(),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        engagement records                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Per-entity view counter; created lazily on first view, never deleted
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ViewCounter {
    pub entity: EntityId,
    pub views: u64,
    #[serde(rename = "last-viewed-at")]
    pub last_viewed_at: DateTime<Utc>,
}

/// Per-entity like state
///
/// `liked_by` holds the identities of registered users who currently like the entity; `anonymous`
/// counts likes placed with no identity attached (an intentionally lower-fidelity path: no toggle,
/// no undo). The total like count is always `liked_by.len() + anonymous`-- the two are kept
/// separate precisely so that the membership invariant remains checkable.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct LikeSet {
    #[serde(rename = "liked-by")]
    pub liked_by: HashSet<UserId>,
    pub anonymous: u64,
}

impl LikeSet {
    pub fn likes(&self) -> u64 {
        self.liked_by.len() as u64 + self.anonymous
    }
}

/// The result of toggling a like for a (entity, user) pair
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct LikeOutcome {
    pub liked: bool,
    pub likes: u64,
}

/// One option in a poll
///
/// `votes` is stored redundantly with `voters`; the storage backend is obligated to update the two
/// in a single atomic operation, so `votes == voters.len()` at all times.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PollOption {
    pub id: OptionId,
    pub text: String,
    pub votes: u64,
    pub voters: HashSet<UserId>,
}

impl PollOption {
    pub fn new(id: OptionId, text: &str) -> PollOption {
        PollOption {
            id,
            text: text.to_owned(),
            votes: 0,
            voters: HashSet::new(),
        }
    }
}

/// The poll attached to a post, if any
///
/// Single-choice polls (`allow_multiple == false`) maintain the invariant that a given voter
/// appears in at most one option's `voters` set; this is enforced procedurally by the storage
/// backend's vote operation, not by the shape of the type.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PollState {
    pub options: Vec<PollOption>,
    #[serde(rename = "allow-multiple")]
    pub allow_multiple: bool,
    #[serde(rename = "expires-at")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl PollState {
    pub fn total_votes(&self) -> u64 {
        self.options.iter().map(|o| o.votes).sum()
    }
    pub fn is_closed(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        ranking snapshots                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// One row of a ranking snapshot; rank 1 is the highest score
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RankingEntry {
    pub entity: EntityId,
    pub score: u64,
    pub rank: u32,
}

/// A fully-materialized top-N ranking
///
/// Snapshots are replaced wholesale on every recomputation (never patched in place) and are keyed
/// in the store by `(kind, size bucket)`. A stale snapshot is acceptable to serve until the next
/// recomputation lands.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RankingSnapshot {
    pub kind: RankingKind,
    pub entries: Vec<RankingEntry>,
    #[serde(rename = "computed-at")]
    pub computed_at: DateTime<Utc>,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             Place                                               //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Denormalized display metadata for a place, owned by the external catalog
///
/// This crate fetches these by id & never mutates them.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Place {
    pub id: EntityId,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    pub area: String,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn user_ids() {
        assert!(UserId::new("auth0|62ab1").is_ok());
        assert!(UserId::new("").is_err());
        assert!(UserId::new("has space").is_err());
        assert!(UserId::new(&"x".repeat(129)).is_err());
        // Deserialization must apply the same validation
        assert!(serde_json::from_str::<UserId>("\"jane.doe\"").is_ok());
        assert!(serde_json::from_str::<UserId>("\"\"").is_err());
    }

    #[test]
    fn option_ids() {
        assert!(OptionId::new("opt-a").is_ok());
        assert!(OptionId::new(&"y".repeat(65)).is_err());
    }

    #[test]
    fn ranking_kinds() {
        assert_eq!("views".parse::<RankingKind>().unwrap(), RankingKind::Views);
        assert_eq!(
            "visits".parse::<RankingKind>().unwrap(),
            RankingKind::Visits
        );
        assert!("likes".parse::<RankingKind>().is_err());
        assert_eq!(
            serde_json::to_string(&RankingKind::Views).unwrap(),
            "\"views\""
        );
    }

    #[test]
    fn like_set_count() {
        let mut set = LikeSet::default();
        assert_eq!(0, set.likes());
        set.liked_by.insert(UserId::new("u1").unwrap());
        set.anonymous = 2;
        assert_eq!(3, set.likes());
    }

    #[test]
    fn poll_close() {
        let poll = PollState {
            options: vec![PollOption::new(OptionId::new("a").unwrap(), "Option A")],
            allow_multiple: false,
            expires_at: Some(Utc::now() - chrono::Duration::minutes(1)),
        };
        assert!(poll.is_closed(Utc::now()));
        let open = PollState {
            expires_at: None,
            ..poll.clone()
        };
        assert!(!open.is_closed(Utc::now()));
    }
}
