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

//! # View & visit counting API
//!
//! The write path of the ranking pipeline. Recording a view is two steps: land the atomic
//! increment (that's the request), then enqueue a ranking recomputation (that's fire & forget--
//! an enqueue failure is logged & swallowed, because the increment already happened & the caller's
//! view *will* be reflected by whatever recomputation runs next).

use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{Path, State},
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tower_http::{cors::CorsLayer, set_header::SetResponseHeaderLayer};
use tracing::{error, info, warn};

use crate::{
    background_tasks::Sender,
    counter_add,
    entities::{EntityId, RankingKind},
    http::ErrorResponseBody,
    manchitra::Manchitra,
    metrics::{self, Sort},
    ranking::RecomputeRankings,
    storage,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to record a view of {entity}: {source}"))]
    View {
        entity: EntityId,
        source: storage::Error,
    },
    #[snafu(display("Failed to record a visit to {entity}: {source}"))]
    Visit {
        entity: EntityId,
        source: storage::Error,
    },
    #[snafu(display("Failed to read view counts: {source}"))]
    Counts { source: storage::Error },
}

impl Error {
    pub fn as_status_and_msg(&self) -> (StatusCode, String) {
        // Everything here is a storage failure-- own up to it.
        (StatusCode::INTERNAL_SERVER_ERROR, format!("{}", self))
    }
}

impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let (code, msg) = self.as_status_and_msg();
        (code, Json(ErrorResponseBody { error: msg })).into_response()
    }
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                     `/places/{id}/view`                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("views.increments.successful", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("views.increments.failures", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("views.recompute-enqueue.failures", Sort::IntegralCounter) }

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct ViewRsp {
    pub entity: EntityId,
    pub views: u64,
}

/// Record one view of a place
///
/// The counter is created on first view; there is no notion of "unknown place" on this path (the
/// catalog & the counters are reconciled at ranking time, not here). On success, a ranking
/// recomputation is enqueued as a side effect; failure *of the enqueue* does not fail the request.
async fn increment_view(
    State(state): State<Arc<Manchitra>>,
    Path(id): Path<u64>,
) -> axum::response::Response {
    async fn increment_view1(state: &Manchitra, entity: EntityId) -> Result<ViewRsp> {
        let views = state
            .storage
            .increment_view(&entity)
            .await
            .context(ViewSnafu { entity })?;
        Ok(ViewRsp { entity, views })
    }

    let entity = EntityId(id);
    match increment_view1(&state, entity).await {
        Ok(rsp) => {
            counter_add!(state.instruments, "views.increments.successful", 1, &[]);
            if let Err(err) = state
                .task_sender
                .send(RecomputeRankings {
                    kind: RankingKind::Views,
                })
                .await
            {
                // The increment landed; rankings will just be stale until the next trigger.
                warn!("Failed to enqueue a ranking recomputation for {entity}: {err}");
                counter_add!(state.instruments, "views.recompute-enqueue.failures", 1, &[]);
            }
            (StatusCode::OK, Json(rsp)).into_response()
        }
        Err(err) => {
            error!("{:#?}", err);
            counter_add!(state.instruments, "views.increments.failures", 1, &[]);
            err.into_response()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                     `/places/{id}/visit`                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("visits.increments.successful", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("visits.increments.failures", Sort::IntegralCounter) }

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct VisitRsp {
    pub entity: EntityId,
    pub visits: u64,
}

/// Record one visit to a place; the `visits` counter family mirrors `views`
async fn record_visit(
    State(state): State<Arc<Manchitra>>,
    Path(id): Path<u64>,
) -> axum::response::Response {
    async fn record_visit1(state: &Manchitra, entity: EntityId) -> Result<VisitRsp> {
        let visits = state
            .storage
            .record_visit(&entity)
            .await
            .context(VisitSnafu { entity })?;
        Ok(VisitRsp { entity, visits })
    }

    let entity = EntityId(id);
    match record_visit1(&state, entity).await {
        Ok(rsp) => {
            counter_add!(state.instruments, "visits.increments.successful", 1, &[]);
            if let Err(err) = state
                .task_sender
                .send(RecomputeRankings {
                    kind: RankingKind::Visits,
                })
                .await
            {
                warn!("Failed to enqueue a ranking recomputation for {entity}: {err}");
                counter_add!(state.instruments, "views.recompute-enqueue.failures", 1, &[]);
            }
            (StatusCode::OK, Json(rsp)).into_response()
        }
        Err(err) => {
            error!("{:#?}", err);
            counter_add!(state.instruments, "visits.increments.failures", 1, &[]);
            err.into_response()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        `/places/views`                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("views.reads.successful", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("views.reads.failures", Sort::IntegralCounter) }

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ViewCountsRsp {
    pub counts: HashMap<EntityId, u64>,
}

/// Retrieve the view counts for all places
async fn all_views(State(state): State<Arc<Manchitra>>) -> axum::response::Response {
    match state.storage.all_view_counts().await.context(CountsSnafu) {
        Ok(counts) => {
            info!("Served {} view counters", counts.len());
            counter_add!(state.instruments, "views.reads.successful", 1, &[]);
            (StatusCode::OK, Json(ViewCountsRsp { counts })).into_response()
        }
        Err(err) => {
            error!("{:#?}", err);
            counter_add!(state.instruments, "views.reads.failures", 1, &[]);
            err.into_response()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Public API                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Return a router for the view-counting API; presumably merged with the other API routers
pub fn make_router(state: Arc<Manchitra>) -> Router<Arc<Manchitra>> {
    Router::new()
        .route("/places/views", get(all_views))
        .route("/places/{id}/view", post(increment_view))
        .route("/places/{id}/visit", post(record_visit))
        .layer(SetResponseHeaderLayer::if_not_present(
            CONTENT_TYPE,
            HeaderValue::from_static("text/json; charset=utf-8"),
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
