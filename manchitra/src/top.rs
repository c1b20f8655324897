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

//! # Top-N API
//!
//! Reads serve the persisted snapshot (stale is fine; that's the deal), so they're cheap. The
//! explicit recompute endpoint is *not* cheap-- it's a full counter scan-- which is why it demands
//! a confirmation flag: too many ops incidents start with someone replaying a request log.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tower_http::{cors::CorsLayer, set_header::SetResponseHeaderLayer};
use tracing::{error, info};

use crate::{
    counter_add,
    entities::{RankingKind, RankingSnapshot},
    http::ErrorResponseBody,
    manchitra::Manchitra,
    metrics::{self, Sort},
    ranking::{self, RankedPlace},
};

/// The largest top-N a caller may request
const MAX_LIMIT: u32 = 25;

const DEFAULT_LIMIT: u32 = 10;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{text} is not a ranking kind"))]
    BadKind {
        text: String,
        source: crate::entities::Error,
    },
    #[snafu(display("limit may not exceed {MAX_LIMIT} (got {limit})"))]
    LimitTooLarge { limit: u32 },
    #[snafu(display("Recomputation is expensive; pass confirm=true if you mean it"))]
    NotConfirmed,
    #[snafu(display("Failed to read the {kind} ranking: {source}"))]
    Read {
        kind: RankingKind,
        source: ranking::Error,
    },
    #[snafu(display("Failed to recompute the {kind} rankings: {source}"))]
    Recompute {
        kind: RankingKind,
        source: ranking::Error,
    },
}

impl Error {
    pub fn as_status_and_msg(&self) -> (StatusCode, String) {
        match self {
            Error::BadKind { .. } | Error::LimitTooLarge { .. } | Error::NotConfirmed => {
                (StatusCode::BAD_REQUEST, format!("{}", self))
            }
            Error::Read { .. } | Error::Recompute { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{}", self))
            }
        }
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
//                                            `/top`                                               //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("top.reads.successful", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("top.reads.failures", Sort::IntegralCounter) }

#[derive(Clone, Debug, Deserialize)]
struct TopQuery {
    kind: Option<String>,
    limit: Option<u32>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TopRsp {
    pub kind: RankingKind,
    pub entries: Vec<RankedPlace>,
}

/// Serve the current top-N ranking
///
/// Parameters:
///
/// - kind: "views" (the default) or "visits"
///
/// - limit: at most 25; defaults to 10
///
/// This serves the most recent *snapshot*; a view recorded a moment ago may not be reflected
/// until the next recomputation lands.
async fn top(
    State(state): State<Arc<Manchitra>>,
    Query(query): Query<TopQuery>,
) -> axum::response::Response {
    async fn top1(state: &Manchitra, query: &TopQuery) -> Result<TopRsp> {
        let kind = match &query.kind {
            Some(text) => text
                .parse::<RankingKind>()
                .context(BadKindSnafu { text: text.clone() })?,
            None => RankingKind::Views,
        };
        let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
        ensure!(limit <= MAX_LIMIT, LimitTooLargeSnafu { limit });
        // Serve from the snapshot bucket that covers the request
        let bucket = *ranking::SIZE_BUCKETS
            .iter()
            .find(|b| **b >= limit)
            .unwrap_or(&MAX_LIMIT);
        let mut entries = ranking::top_n(
            state.storage.as_ref(),
            state.catalog.as_ref(),
            kind,
            bucket,
        )
        .await
        .context(ReadSnafu { kind })?;
        entries.truncate(limit as usize);
        Ok(TopRsp { kind, entries })
    }

    match top1(&state, &query).await {
        Ok(rsp) => {
            counter_add!(state.instruments, "top.reads.successful", 1, &[]);
            (StatusCode::OK, Json(rsp)).into_response()
        }
        Err(err) => {
            error!("{:#?}", err);
            counter_add!(state.instruments, "top.reads.failures", 1, &[]);
            err.into_response()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       `/top/recompute`                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("top.recomputes.successful", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("top.recomputes.failures", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("top.recomputes.refused", Sort::IntegralCounter) }

#[derive(Clone, Debug, Deserialize)]
struct RecomputeReq {
    kind: RankingKind,
    #[serde(default)]
    confirm: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RecomputeRsp {
    pub top10: RankingSnapshot,
    pub top25: RankingSnapshot,
}

/// Recompute both size buckets for a ranking kind, synchronously
///
/// The usual trigger for recomputation is the background task enqueued by a view increment; this
/// endpoint exists for operators (fresh deployment, restored backup, suspicion). The `confirm`
/// flag must be `true` or the request is refused without touching the counters.
async fn recompute(
    State(state): State<Arc<Manchitra>>,
    Json(req): Json<RecomputeReq>,
) -> axum::response::Response {
    async fn recompute1(state: &Manchitra, req: &RecomputeReq) -> Result<RecomputeRsp> {
        ensure!(req.confirm, NotConfirmedSnafu);
        let top10 = ranking::recompute_top_n(
            state.storage.as_ref(),
            state.catalog.as_ref(),
            req.kind,
            10,
        )
        .await
        .context(RecomputeSnafu { kind: req.kind })?;
        let top25 = ranking::recompute_top_n(
            state.storage.as_ref(),
            state.catalog.as_ref(),
            req.kind,
            25,
        )
        .await
        .context(RecomputeSnafu { kind: req.kind })?;
        Ok(RecomputeRsp { top10, top25 })
    }

    match recompute1(&state, &req).await {
        Ok(rsp) => {
            info!(
                "Recomputed the {} rankings ({} entries at n=25)",
                req.kind,
                rsp.top25.entries.len()
            );
            counter_add!(state.instruments, "top.recomputes.successful", 1, &[]);
            (StatusCode::OK, Json(rsp)).into_response()
        }
        Err(Error::NotConfirmed) => {
            counter_add!(state.instruments, "top.recomputes.refused", 1, &[]);
            Error::NotConfirmed.into_response()
        }
        Err(err) => {
            error!("{:#?}", err);
            counter_add!(state.instruments, "top.recomputes.failures", 1, &[]);
            err.into_response()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Public API                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Return a router for the ranking API; presumably merged with the other API routers
pub fn make_router(state: Arc<Manchitra>) -> Router<Arc<Manchitra>> {
    Router::new()
        .route("/top", get(top))
        .route("/top/recompute", post(recompute))
        .layer(SetResponseHeaderLayer::if_not_present(
            CONTENT_TYPE,
            HeaderValue::from_static("text/json; charset=utf-8"),
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
