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

//! # storage
//!
//! Abstractions for the manchitra storage layer.
//!
//! The counters & membership sets defined in [entities](crate::entities) are the sole source of
//! truth for engagement state; everything else in this crate (ranking snapshots, cache entries) is
//! derived & rebuildable. The contract below is therefore strict about atomicity: every mutating
//! operation must be a *single* atomic update at the backend. In particular, a toggle must be
//! conditioned on membership as it stands at the moment of the mutation-- not on a snapshot read
//! earlier in the request-- or two concurrent toggles for the same (entity, user) pair can leave
//! the count & the set disagreeing forever. Backends with native atomic update expressions should
//! use them; the bundled in-memory backend holds its lock across the whole read-modify-write.

use std::collections::HashMap;

use async_trait::async_trait;
use snafu::{prelude::*, Backtrace};

use crate::entities::{
    EntityId, LikeOutcome, LikeSet, OptionId, PollState, RankingKind, RankingSnapshot, UserId,
};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    // Generic variant for backend implementations to wrap their native failures in
    #[snafu(display("Storage backend failure: {source}"))]
    Backend {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
        backtrace: Backtrace,
    },
    #[snafu(display("Post {entity} has no poll"))]
    NoPoll { entity: EntityId },
    #[snafu(display("The poll on post {entity} has closed"))]
    PollClosed { entity: EntityId },
}

impl Error {
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error::Backend {
            source: Box::new(err),
            backtrace: Backtrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[async_trait]
pub trait Backend {
    /// Record one view of `entity`; return the new view count.
    ///
    /// The counter is created lazily (starting at zero) on first view-- a missing entity is never
    /// an error here. The increment must be atomic at the backend (an atomic `+1`, not
    /// read-then-write), and it stamps the counter's last-viewed time.
    async fn increment_view(&self, entity: &EntityId) -> Result<u64>;
    /// Retrieve the view count for `entity`; zero if absent (never an error for a missing entity)
    async fn view_count(&self, entity: &EntityId) -> Result<u64>;
    /// Retrieve view counts for all entities
    ///
    /// This is a full scan, present for the ranking aggregator. At current cardinalities (a few
    /// thousand places) this is fine; a backend fronting a large catalog should page or stream
    /// rather than materialize the lot.
    async fn all_view_counts(&self) -> Result<HashMap<EntityId, u64>>;
    /// Record one visit to `entity`; same contract as [increment_view](Backend::increment_view)
    async fn record_visit(&self, entity: &EntityId) -> Result<u64>;
    /// Retrieve the visit count for `entity`; zero if absent
    async fn visit_count(&self, entity: &EntityId) -> Result<u64>;
    /// Retrieve visit counts for all entities (full scan; see
    /// [all_view_counts](Backend::all_view_counts))
    async fn all_visit_counts(&self) -> Result<HashMap<EntityId, u64>>;
    /// Flip `user`'s like of `entity`
    ///
    /// If `user` is currently a member of the entity's like set, remove them & decrement the
    /// count; otherwise add them & increment. The membership test and the mutation must be one
    /// atomic operation. Counts floor at zero.
    async fn toggle_like(&self, entity: &EntityId, user: &UserId) -> Result<LikeOutcome>;
    /// Record a like with no identity attached
    ///
    /// Always increments; no membership is recorded & there is no way to undo. This is the
    /// intentionally lower-fidelity path for unauthenticated callers.
    async fn like_anonymous(&self, entity: &EntityId) -> Result<u64>;
    /// Retrieve the like state for `entity`; empty if absent
    async fn like_state(&self, entity: &EntityId) -> Result<LikeSet>;
    /// Retrieve the poll attached to post `entity`, if any
    async fn poll(&self, entity: &EntityId) -> Result<Option<PollState>>;
    /// Create or replace the poll attached to post `entity`
    ///
    /// Poll authorship belongs to the wider application; this operation exists for seeding &
    /// administration.
    async fn put_poll(&self, entity: &EntityId, poll: &PollState) -> Result<()>;
    /// Apply `voter`'s vote(s) to the poll on post `entity`; return the resulting poll state
    ///
    /// For multiple-choice polls, membership is toggled independently per requested option. For
    /// single-choice polls, voting the currently-held option unvotes it; voting a different option
    /// moves the vote (at most one active option per voter). Unknown option ids are silently
    /// ignored. When `allow_multiple` is `None` the stored poll's own setting governs; a `Some`
    /// value overrides it for this request (the wire protocol has always carried the flag &
    /// existing clients send it).
    ///
    /// Fails with [Error::NoPoll] if the post has no poll, [Error::PollClosed] if the poll has
    /// expired. On any failure the poll state must be left unchanged-- no partial count/membership
    /// updates.
    async fn apply_votes(
        &self,
        entity: &EntityId,
        options: &[OptionId],
        voter: &UserId,
        allow_multiple: Option<bool>,
    ) -> Result<PollState>;
    /// Retrieve the most recent ranking snapshot for `(kind, bucket)`, if one has been computed
    async fn ranking_snapshot(
        &self,
        kind: RankingKind,
        bucket: u32,
    ) -> Result<Option<RankingSnapshot>>;
    /// Replace the ranking snapshot for `(snapshot.kind, bucket)` wholesale
    ///
    /// Concurrent writers race; last write wins (the snapshot is derived state & the race is
    /// benign-- recomputation is idempotent).
    async fn put_ranking_snapshot(&self, snapshot: &RankingSnapshot, bucket: u32) -> Result<()>;
}
