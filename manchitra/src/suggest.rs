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

//! # Suggestion search API
//!
//! The read-through cache's poster child. Autocomplete traffic is bursty & repetitive (everyone in
//! town types "kal" on the same evening), so results are cached under a key derived from the
//! normalized query & limit. The cache is strictly an accelerator: on any miss, error or timeout
//! we fall through to the catalog + counters & serve the same payload we would have cached. The
//! only caller-visible difference is the `cached` flag (& the latency).

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tower_http::{cors::CorsLayer, set_header::SetResponseHeaderLayer};
use tracing::{debug, error, warn};

use crate::{
    cache::{best_effort_get, best_effort_put},
    counter_add,
    entities::EntityId,
    http::ErrorResponseBody,
    manchitra::Manchitra,
    metrics::{self, Sort},
    storage,
};

/// Queries shorter than this (after trimming) short-circuit to an empty response
const MIN_QUERY_LENGTH: usize = 2;

const MAX_LIMIT: usize = 20;

const DEFAULT_LIMIT: usize = 10;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("limit may not exceed {MAX_LIMIT} (got {limit})"))]
    LimitTooLarge { limit: usize },
    #[snafu(display("Failed to search the catalog: {source}"))]
    Search { source: crate::catalog::Error },
    #[snafu(display("Failed to read view counts: {source}"))]
    Views { source: storage::Error },
}

impl Error {
    pub fn as_status_and_msg(&self) -> (StatusCode, String) {
        match self {
            Error::LimitTooLarge { .. } => (StatusCode::BAD_REQUEST, format!("{}", self)),
            Error::Search { .. } | Error::Views { .. } => {
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
//                                          `/suggest`                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("suggest.cache.hits", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("suggest.cache.misses", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("suggest.failures", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("suggest.short-circuits", Sort::IntegralCounter) }

#[derive(Clone, Debug, Deserialize)]
struct SuggestQuery {
    q: Option<String>,
    limit: Option<usize>,
}

/// One suggestion: a place, plus the view count that ranked it
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Suggestion {
    pub entity: EntityId,
    pub name: String,
    pub area: String,
    pub views: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SuggestRsp {
    pub suggestions: Vec<Suggestion>,
    pub cached: bool,
}

/// Compute the key under which this (query, limit) pair is cached: the operation name & the
/// normalized parameters
fn cache_key(normalized: &str, limit: usize) -> String {
    format!("suggest:{}:{}", normalized, limit)
}

/// The authoritative computation: search the catalog, rank the hits by view count
async fn compute(state: &Manchitra, normalized: &str, limit: usize) -> Result<Vec<Suggestion>> {
    let places = state
        .catalog
        .search(normalized, limit)
        .await
        .context(SearchSnafu)?;
    let counts = state
        .storage
        .all_view_counts()
        .await
        .context(ViewsSnafu)?;
    Ok(places
        .into_iter()
        .map(|place| {
            let views = counts.get(&place.id).copied().unwrap_or(0);
            Suggestion {
                entity: place.id,
                name: place.name,
                area: place.area,
                views,
            }
        })
        .sorted_by(|a, b| {
            b.views
                .cmp(&a.views)
                .then_with(|| a.name.cmp(&b.name))
                .then(a.entity.cmp(&b.entity))
        })
        .collect())
}

/// Suggest places matching a partial query
///
/// Parameters:
///
/// - q: the (partial) query; fewer than two characters after trimming returns an empty list
///   without touching the cache or the store
///
/// - limit: at most 20; defaults to 10
///
/// The response's `cached` flag reports whether the list came from the cache; the list itself is
/// identical either way (for a fixed store state).
async fn suggest(
    State(state): State<Arc<Manchitra>>,
    Query(query): Query<SuggestQuery>,
) -> axum::response::Response {
    async fn suggest1(state: &Manchitra, query: &SuggestQuery) -> Result<SuggestRsp> {
        let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
        ensure!(limit <= MAX_LIMIT, LimitTooLargeSnafu { limit });

        let normalized = query
            .q
            .as_deref()
            .unwrap_or("")
            .trim()
            .to_lowercase();
        // chars, not bytes-- plenty of place names here aren't ASCII
        if normalized.chars().count() < MIN_QUERY_LENGTH {
            counter_add!(state.instruments, "suggest.short-circuits", 1, &[]);
            return Ok(SuggestRsp {
                suggestions: Vec::new(),
                cached: false,
            });
        }

        let key = cache_key(&normalized, limit);
        if let Some(text) = best_effort_get(state.cache.as_ref(), &key).await {
            match serde_json::from_str::<Vec<Suggestion>>(&text) {
                Ok(suggestions) => {
                    debug!("suggestion cache hit for {key}");
                    counter_add!(state.instruments, "suggest.cache.hits", 1, &[]);
                    return Ok(SuggestRsp {
                        suggestions,
                        cached: true,
                    });
                }
                // A corrupt entry is just a miss; it'll be overwritten below.
                Err(err) => warn!("corrupt cache entry under {key} ({err}); recomputing"),
            }
        }

        let suggestions = compute(state, &normalized, limit).await?;
        counter_add!(state.instruments, "suggest.cache.misses", 1, &[]);
        match serde_json::to_string(&suggestions) {
            Ok(text) => best_effort_put(state.cache.as_ref(), &key, &text, state.suggest_ttl).await,
            Err(err) => warn!("failed to serialize suggestions for {key} ({err}); not caching"),
        }
        Ok(SuggestRsp {
            suggestions,
            cached: false,
        })
    }

    match suggest1(&state, &query).await {
        Ok(rsp) => (StatusCode::OK, Json(rsp)).into_response(),
        Err(err) => {
            error!("{:#?}", err);
            counter_add!(state.instruments, "suggest.failures", 1, &[]);
            err.into_response()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Public API                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Return a router for the suggestion API; presumably merged with the other API routers
pub fn make_router(state: Arc<Manchitra>) -> Router<Arc<Manchitra>> {
    Router::new()
        .route("/suggest", get(suggest))
        .layer(SetResponseHeaderLayer::if_not_present(
            CONTENT_TYPE,
            HeaderValue::from_static("text/json; charset=utf-8"),
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
