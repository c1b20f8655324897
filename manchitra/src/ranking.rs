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

//! # ranking
//!
//! The popularity ranking aggregator.
//!
//! ## The model
//!
//! A ranking is a pure function of the counters: read them all, sort, truncate to N, join the
//! catalog metadata in. We don't maintain it incrementally-- every recomputation replaces the
//! persisted snapshot wholesale, and readers serve whatever snapshot is there. The consequence is
//! eventual consistency by design: a view recorded now appears in the "top" lists only after the
//! next successful recomputation, which is triggered off the hot path (see
//! [background_tasks](crate::background_tasks)). Concurrent recomputations race; last write wins,
//! and since the computation is deterministic over whatever counter state it read, the loser's
//! snapshot is merely *slightly* staler-- not wrong.
//!
//! Determinism matters for testability, so the sort order is total: descending by score, ties
//! broken by ascending entity id.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tracing::debug;
use uuid::Uuid;

use crate::{
    background_tasks::{self, BackgroundTask, Context, TaggedTask, Task},
    catalog::Catalog,
    entities::{Place, RankingEntry, RankingKind, RankingSnapshot},
    storage::Backend as StorageBackend,
};

/// The size buckets recomputed on every trigger; readers may ask for any `n` up to the largest.
pub const SIZE_BUCKETS: [u32; 2] = [10, 25];

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to read {kind} counters: {source}"))]
    Counters {
        kind: RankingKind,
        source: crate::storage::Error,
    },
    #[snafu(display("Failed to join catalog metadata: {source}"))]
    Metadata { source: crate::catalog::Error },
    #[snafu(display("Failed to persist a {kind} snapshot: {source}"))]
    Persist {
        kind: RankingKind,
        source: crate::storage::Error,
    },
    #[snafu(display("Failed to read a {kind} snapshot: {source}"))]
    Snapshot {
        kind: RankingKind,
        source: crate::storage::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// A ranking row joined with its catalog metadata, ready for display
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct RankedPlace {
    pub place: Place,
    pub score: u64,
}

/// Recompute the top-`n` ranking for `kind` from the raw counters & persist it
///
/// Entities with no catalog entry are dropped (after truncation-- an uncatalogued entity occupies
/// its slot, it just isn't shown), so the returned snapshot may hold fewer than `n` entries.
pub async fn recompute_top_n(
    storage: &(dyn StorageBackend + Send + Sync),
    catalog: &(dyn Catalog + Send + Sync),
    kind: RankingKind,
    n: u32,
) -> Result<RankingSnapshot> {
    let counts = match kind {
        RankingKind::Views => storage.all_view_counts().await,
        RankingKind::Visits => storage.all_visit_counts().await,
    }
    .context(CountersSnafu { kind })?;

    let mut scored: Vec<_> = counts.into_iter().collect();
    scored.sort_by(|(a_id, a_score), (b_id, b_score)| {
        b_score.cmp(a_score).then(a_id.cmp(b_id))
    });
    scored.truncate(n as usize);

    let mut entries = Vec::with_capacity(scored.len());
    for (entity, score) in scored {
        if catalog
            .place(&entity)
            .await
            .context(MetadataSnafu)?
            .is_some()
        {
            entries.push(RankingEntry {
                entity,
                score,
                rank: entries.len() as u32 + 1,
            });
        } else {
            debug!("dropping uncatalogued entity {entity} from the {kind} top-{n}");
        }
    }

    let snapshot = RankingSnapshot {
        kind,
        entries,
        computed_at: Utc::now(),
    };
    storage
        .put_ranking_snapshot(&snapshot, n)
        .await
        .context(PersistSnafu { kind })?;
    Ok(snapshot)
}

/// Serve the most recent top-`n` snapshot for `kind`, joined with catalog metadata
///
/// Empty if no snapshot has been computed yet. Callers needing freshness must call
/// [recompute_top_n] explicitly.
pub async fn top_n(
    storage: &(dyn StorageBackend + Send + Sync),
    catalog: &(dyn Catalog + Send + Sync),
    kind: RankingKind,
    n: u32,
) -> Result<Vec<RankedPlace>> {
    let snapshot = match storage
        .ranking_snapshot(kind, n)
        .await
        .context(SnapshotSnafu { kind })?
    {
        Some(snapshot) => snapshot,
        None => return Ok(Vec::new()),
    };
    let mut ranked = Vec::with_capacity(snapshot.entries.len());
    for entry in snapshot.entries {
        // A place can vanish from the catalog after the snapshot was cut; drop it here too.
        if let Some(place) = catalog.place(&entry.entity).await.context(MetadataSnafu)? {
            ranked.push(RankedPlace {
                place,
                score: entry.score,
            });
        }
    }
    Ok(ranked)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                     RecomputeRankings task                                      //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The background task enqueued by every successful view/visit increment
///
/// Recomputes both size buckets for its kind. Enqueue failure never fails the originating
/// increment (the caller logs & moves on), and execution failure leaves the previous snapshot in
/// place-- stale, not wrong.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct RecomputeRankings {
    pub kind: RankingKind,
}

const RECOMPUTE_RANKINGS: Uuid = Uuid::from_fields(
    0x6b1f07e2,
    0x9c44,
    0x4e31,
    &[0x92, 0x5d, 0x18, 0xaa, 0x30, 0x5b, 0xe2, 0x41],
);

#[async_trait]
impl Task<Context> for RecomputeRankings {
    async fn exec(self: Box<Self>, context: Context) -> background_tasks::Result<()> {
        for n in SIZE_BUCKETS {
            recompute_top_n(context.storage.as_ref(), context.catalog.as_ref(), self.kind, n)
                .await
                .map_err(background_tasks::Error::new)?;
        }
        Ok(())
    }
    fn timeout(&self) -> Option<Duration> {
        // A full scan plus two sorts; generous, but a wedged backend shouldn't pin a worker slot.
        Some(Duration::from_secs(30))
    }
}

impl TaggedTask<Context> for RecomputeRankings {
    type Tag = Uuid;
    fn get_tag() -> Self::Tag {
        RECOMPUTE_RANKINGS
    }
}

inventory::submit! {
    BackgroundTask {
        id: RECOMPUTE_RANKINGS,
        de: |buf| {
            Ok(Box::new(
                rmp_serde::from_slice::<RecomputeRankings>(buf)
                    .map_err(background_tasks::Error::new)?,
            ))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        catalog,
        entities::{EntityId, Place},
        memory::Memory,
    };

    fn place(id: u64, name: &str) -> Place {
        Place {
            id: EntityId(id),
            name: name.to_owned(),
            lat: 22.57,
            lon: 88.36,
            area: "Kalighat".to_owned(),
        }
    }

    async fn seed_views(mem: &Memory, entity: u64, n: u64) {
        for _ in 0..n {
            mem.increment_view(&EntityId(entity)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn sorted_descending_with_ascending_id_ties() {
        let mem = Memory::new();
        let cat = catalog::InMemory::new((1..=4).map(|i| place(i, &format!("Place {}", i))));
        seed_views(&mem, 1, 2).await;
        seed_views(&mem, 2, 5).await;
        seed_views(&mem, 3, 5).await;
        seed_views(&mem, 4, 1).await;

        let snapshot = recompute_top_n(&mem, &cat, RankingKind::Views, 10)
            .await
            .unwrap();
        let ids: Vec<u64> = snapshot.entries.iter().map(|e| e.entity.0).collect();
        assert_eq!(vec![2, 3, 1, 4], ids);
        let ranks: Vec<u32> = snapshot.entries.iter().map(|e| e.rank).collect();
        assert_eq!(vec![1, 2, 3, 4], ranks);
        // Every included score >= every excluded score (nothing excluded here, but the scores
        // must be non-increasing)
        assert!(snapshot.entries.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[tokio::test]
    async fn truncates_and_beats_the_excluded() {
        let mem = Memory::new();
        let cat = catalog::InMemory::new((1..=5).map(|i| place(i, &format!("Place {}", i))));
        for (id, views) in [(1u64, 9u64), (2, 7), (3, 5), (4, 3), (5, 1)] {
            seed_views(&mem, id, views).await;
        }
        let snapshot = recompute_top_n(&mem, &cat, RankingKind::Views, 3)
            .await
            .unwrap();
        assert_eq!(3, snapshot.entries.len());
        let min_included = snapshot.entries.iter().map(|e| e.score).min().unwrap();
        assert!(min_included >= 3);
    }

    #[tokio::test]
    async fn uncatalogued_entities_are_dropped_not_errored() {
        let mem = Memory::new();
        let cat = catalog::InMemory::new([place(1, "Mudiali Club")]);
        seed_views(&mem, 1, 3).await;
        seed_views(&mem, 99, 10).await; // no catalog entry

        let snapshot = recompute_top_n(&mem, &cat, RankingKind::Views, 10)
            .await
            .unwrap();
        assert_eq!(1, snapshot.entries.len());
        assert_eq!(EntityId(1), snapshot.entries[0].entity);
        assert_eq!(3, snapshot.entries[0].score);
    }

    #[tokio::test]
    async fn top_n_serves_the_snapshot_not_the_counters() {
        let mem = Memory::new();
        let cat = catalog::InMemory::new([place(1, "Mudiali Club")]);
        assert!(top_n(&mem, &cat, RankingKind::Views, 10)
            .await
            .unwrap()
            .is_empty());

        seed_views(&mem, 1, 3).await;
        recompute_top_n(&mem, &cat, RankingKind::Views, 10)
            .await
            .unwrap();

        // New views don't show until the next recomputation
        seed_views(&mem, 1, 4).await;
        let ranked = top_n(&mem, &cat, RankingKind::Views, 10).await.unwrap();
        assert_eq!(1, ranked.len());
        assert_eq!(3, ranked[0].score);

        recompute_top_n(&mem, &cat, RankingKind::Views, 10)
            .await
            .unwrap();
        let ranked = top_n(&mem, &cat, RankingKind::Views, 10).await.unwrap();
        assert_eq!(7, ranked[0].score);
    }

    #[tokio::test]
    async fn recompute_task_round_trips_through_the_queue() {
        use std::sync::Arc;

        use crate::{
            background_tasks::{BackgroundTasks, Sender},
            metrics::Instruments,
        };

        let mem = Arc::new(Memory::new());
        let cat = Arc::new(catalog::InMemory::new([place(1, "Mudiali Club")]));
        seed_views(&mem, 1, 3).await;

        let queue = Arc::new(BackgroundTasks::new(mem.clone()));
        let processor = background_tasks::new(
            queue.clone(),
            Context {
                storage: mem.clone(),
                catalog: cat.clone(),
            },
            None,
            Arc::new(Instruments::new("manchitra")),
        );
        queue
            .send(RecomputeRankings {
                kind: RankingKind::Views,
            })
            .await
            .unwrap();
        // Give the processor a beat to lease & run the task
        tokio::time::sleep(Duration::from_millis(750)).await;
        processor.shutdown(Duration::from_secs(5)).await.unwrap();

        let ranked = top_n(mem.as_ref(), cat.as_ref(), RankingKind::Views, 10)
            .await
            .unwrap();
        assert_eq!(1, ranked.len());
        assert_eq!(3, ranked[0].score);
        // Both size buckets were cut
        assert!(mem
            .ranking_snapshot(RankingKind::Views, 25)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn visits_are_their_own_family() {
        let mem = Memory::new();
        let cat = catalog::InMemory::new([place(1, "Mudiali Club"), place(2, "Suruchi Sangha")]);
        mem.record_visit(&EntityId(2)).await.unwrap();
        seed_views(&mem, 1, 5).await;

        let snapshot = recompute_top_n(&mem, &cat, RankingKind::Visits, 10)
            .await
            .unwrap();
        assert_eq!(1, snapshot.entries.len());
        assert_eq!(EntityId(2), snapshot.entries[0].entity);
    }
}
