// Copyright (C) 2026 Michael Herstine <sp1ff@pobox.com>
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

//! # memory
//!
//! The bundled, in-process implementation of the manchitra storage contract.
//!
//! One [Mutex] guards all the tables; every trait method takes the lock exactly once & performs
//! its entire read-modify-write under it, with no await point while held. That is the whole
//! atomicity story: simple, and exactly the guarantee a networked backend must reproduce with its
//! native atomic update expressions. This backend also implements the background task queue's
//! storage contract, leasing tasks with an expiry so a crashed holder's work is eventually
//! re-offered.

use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use snafu::prelude::*;
use uuid::Uuid;

use crate::{
    background_tasks,
    entities::{
        EntityId, LikeOutcome, LikeSet, OptionId, PollState, RankingKind, RankingSnapshot, UserId,
        ViewCounter,
    },
    storage::{self, NoPollSnafu, PollClosedSnafu},
};

// How long a leased task is off the market before other processes may pick it up.
fn task_lease() -> Duration {
    Duration::seconds(30)
}

#[derive(Clone, Debug)]
struct QueuedTask {
    tag: Uuid,
    task: Vec<u8>,
    created: DateTime<Utc>,
    lease_expires: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Tables {
    views: HashMap<EntityId, ViewCounter>,
    visits: HashMap<EntityId, u64>,
    likes: HashMap<EntityId, LikeSet>,
    polls: HashMap<EntityId, PollState>,
    snapshots: HashMap<(RankingKind, u32), RankingSnapshot>,
    tasks: HashMap<Uuid, QueuedTask>,
}

/// In-memory storage backend
#[derive(Default)]
pub struct Memory {
    tables: Mutex<Tables>,
}

impl Memory {
    pub fn new() -> Memory {
        Memory::default()
    }
    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        // A poisoned lock means some *other* request panicked mid-update; our updates are all
        // completed-or-untouched, so the data is still coherent & we keep serving.
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl storage::Backend for Memory {
    async fn increment_view(&self, entity: &EntityId) -> storage::Result<u64> {
        let mut tables = self.lock();
        let counter = tables.views.entry(*entity).or_insert_with(|| ViewCounter {
            entity: *entity,
            views: 0,
            last_viewed_at: Utc::now(),
        });
        counter.views += 1;
        counter.last_viewed_at = Utc::now();
        Ok(counter.views)
    }

    async fn view_count(&self, entity: &EntityId) -> storage::Result<u64> {
        Ok(self.lock().views.get(entity).map(|c| c.views).unwrap_or(0))
    }

    async fn all_view_counts(&self) -> storage::Result<HashMap<EntityId, u64>> {
        Ok(self
            .lock()
            .views
            .iter()
            .map(|(id, c)| (*id, c.views))
            .collect())
    }

    async fn record_visit(&self, entity: &EntityId) -> storage::Result<u64> {
        let mut tables = self.lock();
        let count = tables.visits.entry(*entity).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn visit_count(&self, entity: &EntityId) -> storage::Result<u64> {
        Ok(self.lock().visits.get(entity).copied().unwrap_or(0))
    }

    async fn all_visit_counts(&self) -> storage::Result<HashMap<EntityId, u64>> {
        Ok(self.lock().visits.clone())
    }

    async fn toggle_like(&self, entity: &EntityId, user: &UserId) -> storage::Result<LikeOutcome> {
        let mut tables = self.lock();
        let set = tables.likes.entry(*entity).or_default();
        let liked = if set.liked_by.remove(user) {
            false
        } else {
            set.liked_by.insert(user.clone());
            true
        };
        Ok(LikeOutcome {
            liked,
            likes: set.likes(),
        })
    }

    async fn like_anonymous(&self, entity: &EntityId) -> storage::Result<u64> {
        let mut tables = self.lock();
        let set = tables.likes.entry(*entity).or_default();
        set.anonymous += 1;
        Ok(set.likes())
    }

    async fn like_state(&self, entity: &EntityId) -> storage::Result<LikeSet> {
        Ok(self.lock().likes.get(entity).cloned().unwrap_or_default())
    }

    async fn poll(&self, entity: &EntityId) -> storage::Result<Option<PollState>> {
        Ok(self.lock().polls.get(entity).cloned())
    }

    async fn put_poll(&self, entity: &EntityId, poll: &PollState) -> storage::Result<()> {
        self.lock().polls.insert(*entity, poll.clone());
        Ok(())
    }

    async fn apply_votes(
        &self,
        entity: &EntityId,
        options: &[OptionId],
        voter: &UserId,
        allow_multiple: Option<bool>,
    ) -> storage::Result<PollState> {
        let mut tables = self.lock();
        let poll = tables
            .polls
            .get_mut(entity)
            .context(NoPollSnafu { entity: *entity })?;
        if poll.is_closed(Utc::now()) {
            return PollClosedSnafu { entity: *entity }.fail();
        }
        if allow_multiple.unwrap_or(poll.allow_multiple) {
            // Toggle membership independently per requested option; a duplicate id in the request
            // would otherwise toggle twice & cancel itself out.
            let mut seen: HashSet<&OptionId> = HashSet::new();
            for requested in options.iter().filter(|o| seen.insert(o)) {
                if let Some(option) = poll.options.iter_mut().find(|o| &o.id == requested) {
                    if option.voters.remove(voter) {
                        option.votes = option.votes.saturating_sub(1);
                    } else {
                        option.voters.insert(voter.clone());
                        option.votes += 1;
                    }
                }
                // unknown option ids are silently ignored
            }
        } else if let Some(requested) = options
            .iter()
            .find(|req| poll.options.iter().any(|o| &o.id == *req))
        {
            // Single choice: at most one active option per voter. Voting the held option unvotes
            // it; voting a different option moves the vote.
            let held = poll
                .options
                .iter()
                .find(|o| o.voters.contains(voter))
                .map(|o| o.id.clone());
            if let Some(ref held) = held {
                let option = poll.options.iter_mut().find(|o| &o.id == held).unwrap(/* just found */);
                option.voters.remove(voter);
                option.votes = option.votes.saturating_sub(1);
            }
            if held.as_ref() != Some(requested) {
                let option = poll.options.iter_mut().find(|o| &o.id == requested).unwrap(/* just found */);
                option.voters.insert(voter.clone());
                option.votes += 1;
            }
        }
        Ok(poll.clone())
    }

    async fn ranking_snapshot(
        &self,
        kind: RankingKind,
        bucket: u32,
    ) -> storage::Result<Option<RankingSnapshot>> {
        Ok(self.lock().snapshots.get(&(kind, bucket)).cloned())
    }

    async fn put_ranking_snapshot(
        &self,
        snapshot: &RankingSnapshot,
        bucket: u32,
    ) -> storage::Result<()> {
        self.lock()
            .snapshots
            .insert((snapshot.kind, bucket), snapshot.clone());
        Ok(())
    }
}

#[async_trait]
impl background_tasks::Backend for Memory {
    async fn write_task(&self, tag: &Uuid, buf: &[u8]) -> background_tasks::Result<()> {
        self.lock().tasks.insert(
            Uuid::new_v4(),
            QueuedTask {
                tag: *tag,
                task: buf.to_vec(),
                created: Utc::now(),
                lease_expires: None,
            },
        );
        Ok(())
    }

    async fn lease_task(&self) -> background_tasks::Result<Option<(Uuid, Uuid, Vec<u8>)>> {
        let mut tables = self.lock();
        let now = Utc::now();
        // Oldest leaseable task first, so a stream of enqueues can't starve an early one.
        let candidate = tables
            .tasks
            .iter()
            .filter(|(_, t)| t.lease_expires.map(|at| at <= now).unwrap_or(true))
            .min_by_key(|(_, t)| t.created)
            .map(|(id, t)| (t.tag, *id, t.task.clone()));
        if let Some((_, id, _)) = candidate {
            if let Some(task) = tables.tasks.get_mut(&id) {
                task.lease_expires = Some(now + task_lease());
            }
        }
        Ok(candidate)
    }

    async fn close_task(&self, uuid: &Uuid) -> background_tasks::Result<()> {
        self.lock().tasks.remove(uuid);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::{
        entities::{PollOption, PollState},
        storage::Backend,
    };

    fn user(s: &str) -> UserId {
        UserId::new(s).unwrap()
    }

    fn opt(s: &str) -> OptionId {
        OptionId::new(s).unwrap()
    }

    fn two_option_poll(allow_multiple: bool) -> PollState {
        PollState {
            options: vec![
                PollOption::new(opt("a"), "Option A"),
                PollOption::new(opt("b"), "Option B"),
            ],
            allow_multiple,
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn views_are_monotonic() {
        let mem = Memory::new();
        let e1 = EntityId(1);
        assert_eq!(0, mem.view_count(&e1).await.unwrap());
        for expected in 1..=3u64 {
            assert_eq!(expected, mem.increment_view(&e1).await.unwrap());
        }
        assert_eq!(3, mem.view_count(&e1).await.unwrap());
        assert_eq!(0, mem.view_count(&EntityId(2)).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_views_all_land() {
        let mem = Arc::new(Memory::new());
        let e1 = EntityId(1);
        let handles: Vec<_> = (0..64)
            .map(|_| {
                let mem = mem.clone();
                tokio::spawn(async move { mem.increment_view(&e1).await.unwrap() })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(64, mem.view_count(&e1).await.unwrap());
    }

    #[tokio::test]
    async fn toggle_is_its_own_inverse() {
        let mem = Memory::new();
        let p1 = EntityId(7);
        let u1 = user("u1");
        let outcome = mem.toggle_like(&p1, &u1).await.unwrap();
        assert!(outcome.liked);
        assert_eq!(1, outcome.likes);
        let outcome = mem.toggle_like(&p1, &u1).await.unwrap();
        assert!(!outcome.liked);
        assert_eq!(0, outcome.likes);
        let state = mem.like_state(&p1).await.unwrap();
        assert_eq!(0, state.likes());
        assert!(state.liked_by.is_empty());
    }

    #[tokio::test]
    async fn count_matches_membership_under_concurrency() {
        let mem = Arc::new(Memory::new());
        let p1 = EntityId(7);
        // An even number of toggles per user must return every user to not-liked, and the count
        // to the anonymous-only total, no matter how the toggles interleave.
        let handles: Vec<_> = (0..8)
            .flat_map(|i| {
                let mem = mem.clone();
                (0..4).map(move |_| {
                    let mem = mem.clone();
                    tokio::spawn(async move {
                        mem.toggle_like(&p1, &user(&format!("u{}", i))).await.unwrap()
                    })
                })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }
        let state = mem.like_state(&p1).await.unwrap();
        assert_eq!(state.liked_by.len() as u64, state.likes());
        assert!(state.liked_by.is_empty());
    }

    #[tokio::test]
    async fn anonymous_likes_only_count() {
        let mem = Memory::new();
        let p1 = EntityId(9);
        for expected in 1..=3u64 {
            assert_eq!(expected, mem.like_anonymous(&p1).await.unwrap());
        }
        let state = mem.like_state(&p1).await.unwrap();
        assert_eq!(3, state.likes());
        assert!(state.liked_by.is_empty());
    }

    #[tokio::test]
    async fn single_choice_votes_move() {
        let mem = Memory::new();
        let post = EntityId(11);
        mem.put_poll(&post, &two_option_poll(false)).await.unwrap();
        let u1 = user("u1");

        let poll = mem
            .apply_votes(&post, &[opt("a")], &u1, None)
            .await
            .unwrap();
        assert_eq!(1, poll.options[0].votes);
        assert_eq!(0, poll.options[1].votes);

        let poll = mem
            .apply_votes(&post, &[opt("b")], &u1, None)
            .await
            .unwrap();
        assert_eq!(0, poll.options[0].votes);
        assert_eq!(1, poll.options[1].votes);

        // Voting the held option again unvotes it
        let poll = mem
            .apply_votes(&post, &[opt("b")], &u1, None)
            .await
            .unwrap();
        assert_eq!(0, poll.options[1].votes);
        assert_eq!(0, poll.total_votes());

        // At no point may a voter appear under more than one option
        for option in poll.options {
            assert_eq!(option.votes as usize, option.voters.len());
        }
    }

    #[tokio::test]
    async fn multiple_choice_votes_toggle_independently() {
        let mem = Memory::new();
        let post = EntityId(12);
        mem.put_poll(&post, &two_option_poll(true)).await.unwrap();
        let u1 = user("u1");

        let poll = mem
            .apply_votes(&post, &[opt("a"), opt("b")], &u1, None)
            .await
            .unwrap();
        assert_eq!(2, poll.total_votes());

        let poll = mem
            .apply_votes(&post, &[opt("a")], &u1, None)
            .await
            .unwrap();
        assert_eq!(0, poll.options[0].votes);
        assert_eq!(1, poll.options[1].votes);
    }

    #[tokio::test]
    async fn unknown_options_are_ignored() {
        let mem = Memory::new();
        let post = EntityId(13);
        mem.put_poll(&post, &two_option_poll(true)).await.unwrap();
        let poll = mem
            .apply_votes(&post, &[opt("nope"), opt("a")], &user("u1"), None)
            .await
            .unwrap();
        assert_eq!(1, poll.total_votes());
        assert_eq!(1, poll.options[0].votes);
    }

    #[tokio::test]
    async fn closed_and_missing_polls_refuse_votes() {
        let mem = Memory::new();
        let post = EntityId(14);
        assert!(matches!(
            mem.apply_votes(&post, &[opt("a")], &user("u1"), None).await,
            Err(crate::storage::Error::NoPoll { .. })
        ));
        let mut poll = two_option_poll(false);
        poll.expires_at = Some(Utc::now() - Duration::minutes(5));
        mem.put_poll(&post, &poll).await.unwrap();
        assert!(matches!(
            mem.apply_votes(&post, &[opt("a")], &user("u1"), None).await,
            Err(crate::storage::Error::PollClosed { .. })
        ));
        // ...and the refusal mutated nothing
        let stored = mem.poll(&post).await.unwrap().unwrap();
        assert_eq!(0, stored.total_votes());
    }

    #[tokio::test]
    async fn request_flag_overrides_stored_arity() {
        let mem = Memory::new();
        let post = EntityId(15);
        mem.put_poll(&post, &two_option_poll(false)).await.unwrap();
        let poll = mem
            .apply_votes(&post, &[opt("a"), opt("b")], &user("u1"), Some(true))
            .await
            .unwrap();
        assert_eq!(2, poll.total_votes());
    }

    #[tokio::test]
    async fn snapshots_replace_wholesale() {
        use crate::entities::{RankingEntry, RankingSnapshot};
        let mem = Memory::new();
        assert!(mem
            .ranking_snapshot(RankingKind::Views, 10)
            .await
            .unwrap()
            .is_none());
        let snapshot = RankingSnapshot {
            kind: RankingKind::Views,
            entries: vec![RankingEntry {
                entity: EntityId(1),
                score: 5,
                rank: 1,
            }],
            computed_at: Utc::now(),
        };
        mem.put_ranking_snapshot(&snapshot, 10).await.unwrap();
        let read = mem
            .ranking_snapshot(RankingKind::Views, 10)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(1, read.entries.len());
        // The (kind, bucket) key separates size buckets
        assert!(mem
            .ranking_snapshot(RankingKind::Views, 25)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn task_leases_expire() {
        use crate::background_tasks::Backend;
        let mem = Memory::new();
        let tag = Uuid::new_v4();
        mem.write_task(&tag, &[1, 2, 3]).await.unwrap();
        let (got_tag, id, buf) = mem.lease_task().await.unwrap().unwrap();
        assert_eq!(tag, got_tag);
        assert_eq!(vec![1, 2, 3], buf);
        // While leased, the task is off the market
        assert!(mem.lease_task().await.unwrap().is_none());
        mem.close_task(&id).await.unwrap();
        assert!(mem.lease_task().await.unwrap().is_none());
    }
}
