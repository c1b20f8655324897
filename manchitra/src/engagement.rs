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

//! # Engagement API
//!
//! Likes & poll votes: the read-modify-write half of the pipeline. All the delicate state
//! machinery (membership-conditioned toggles, single-choice exclusivity) lives behind the storage
//! contract; this module's job is input validation *before* any mutation is attempted, and mapping
//! outcomes & failures onto the wire.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use snafu::{prelude::*, IntoError};
use tower_http::{cors::CorsLayer, set_header::SetResponseHeaderLayer};
use tracing::{debug, error, info};

use crate::{
    counter_add,
    entities::{EntityId, OptionId, PollState, UserId},
    http::ErrorResponseBody,
    manchitra::Manchitra,
    metrics::{self, Sort},
    storage,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Poll votes require a signed-in voter"))]
    AnonymousVoter,
    #[snafu(display("A vote request must name at least one option"))]
    NoOptions,
    #[snafu(display("Post {entity} has no poll"))]
    NoPoll { entity: EntityId },
    #[snafu(display("The poll on post {entity} has closed"))]
    PollClosed { entity: EntityId },
    #[snafu(display("Failed to update the like state on {entity}: {source}"))]
    Like {
        entity: EntityId,
        source: storage::Error,
    },
    #[snafu(display("Failed to apply votes on {entity}: {source}"))]
    Vote {
        entity: EntityId,
        source: storage::Error,
    },
}

impl Error {
    pub fn as_status_and_msg(&self) -> (StatusCode, String) {
        match self {
            ////////////////////////////////////////////////////////////////////////////////////////
            // Broken requests-- tell the caller how to fix it
            ////////////////////////////////////////////////////////////////////////////////////////
            Error::AnonymousVoter => (StatusCode::BAD_REQUEST, format!("{}", self)),
            Error::NoOptions => (StatusCode::BAD_REQUEST, format!("{}", self)),
            Error::PollClosed { .. } => (StatusCode::BAD_REQUEST, format!("{}", self)),
            Error::NoPoll { .. } => (StatusCode::NOT_FOUND, format!("{}", self)),
            ////////////////////////////////////////////////////////////////////////////////////////
            // Internal failure-- own up to it
            ////////////////////////////////////////////////////////////////////////////////////////
            Error::Like { .. } | Error::Vote { .. } => {
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
//                                     `/places/{id}/like`                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("engagement.likes.toggles", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("engagement.likes.anonymous", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("engagement.likes.failures", Sort::IntegralCounter) }

#[derive(Clone, Debug, Deserialize)]
struct LikeReq {
    /// The caller's identity as vouched-for by the identity provider; absent for anonymous likes
    user: Option<UserId>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct LikeRsp {
    pub liked: bool,
    pub likes: u64,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct AnonymousLikeRsp {
    pub likes: u64,
}

/// Like (or un-like) a place
///
/// With an identity attached this is an idempotent-pair toggle: two identical requests return the
/// like state to where it started. Without one, it's a plain increment-- no membership, no undo.
/// The trade-off is intentional: anonymous engagement still counts for rankings, it just can't be
/// taken back.
async fn toggle_like(
    State(state): State<Arc<Manchitra>>,
    Path(id): Path<u64>,
    Json(req): Json<LikeReq>,
) -> axum::response::Response {
    let entity = EntityId(id);
    match req.user {
        Some(user) => {
            match state
                .storage
                .toggle_like(&entity, &user)
                .await
                .context(LikeSnafu { entity })
            {
                Ok(outcome) => {
                    debug!("{user} now {} {entity}", if outcome.liked { "likes" } else { "does not like" });
                    counter_add!(state.instruments, "engagement.likes.toggles", 1, &[]);
                    (
                        StatusCode::OK,
                        Json(LikeRsp {
                            liked: outcome.liked,
                            likes: outcome.likes,
                        }),
                    )
                        .into_response()
                }
                Err(err) => {
                    error!("{:#?}", err);
                    counter_add!(state.instruments, "engagement.likes.failures", 1, &[]);
                    err.into_response()
                }
            }
        }
        None => match state
            .storage
            .like_anonymous(&entity)
            .await
            .context(LikeSnafu { entity })
        {
            Ok(likes) => {
                counter_add!(state.instruments, "engagement.likes.anonymous", 1, &[]);
                (StatusCode::OK, Json(AnonymousLikeRsp { likes })).into_response()
            }
            Err(err) => {
                error!("{:#?}", err);
                counter_add!(state.instruments, "engagement.likes.failures", 1, &[]);
                err.into_response()
            }
        },
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      `/posts/{id}/vote`                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("engagement.votes.successful", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("engagement.votes.failures", Sort::IntegralCounter) }

#[derive(Clone, Debug, Deserialize)]
struct VoteReq {
    options: Vec<OptionId>,
    voter: Option<UserId>,
    #[serde(rename = "allow-multiple")]
    allow_multiple: Option<bool>,
}

/// One poll option as presented on the wire: the voter roll stays server-side
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OptionView {
    pub id: OptionId,
    pub text: String,
    pub votes: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PollRsp {
    pub options: Vec<OptionView>,
    #[serde(rename = "total-votes")]
    pub total_votes: u64,
}

impl From<PollState> for PollRsp {
    fn from(poll: PollState) -> Self {
        PollRsp {
            total_votes: poll.total_votes(),
            options: poll
                .options
                .into_iter()
                .map(|o| OptionView {
                    id: o.id,
                    text: o.text,
                    votes: o.votes,
                })
                .collect(),
        }
    }
}

/// Vote in the poll attached to a post
///
/// Parameters:
///
/// - options: the option id(s) being voted; at least one is required. Unknown ids are ignored.
///
/// - voter: the caller's identity. Required-- the toggle/move semantics are meaningless without
///   one.
///
/// - allow-multiple: optional; overrides the poll's own arity for this request (legacy clients
///   have always sent it). When absent, the stored poll governs.
async fn vote_poll(
    State(state): State<Arc<Manchitra>>,
    Path(id): Path<u64>,
    Json(req): Json<VoteReq>,
) -> axum::response::Response {
    async fn vote_poll1(state: &Manchitra, entity: EntityId, req: &VoteReq) -> Result<PollRsp> {
        // Validate *everything* before any mutation is attempted
        ensure!(!req.options.is_empty(), NoOptionsSnafu);
        let voter = req.voter.as_ref().context(AnonymousVoterSnafu)?;
        state
            .storage
            .apply_votes(&entity, &req.options, voter, req.allow_multiple)
            .await
            .map_err(|err| match err {
                storage::Error::NoPoll { entity } => Error::NoPoll { entity },
                storage::Error::PollClosed { entity } => Error::PollClosed { entity },
                err => VoteSnafu { entity }.into_error(err),
            })
            .map(PollRsp::from)
    }

    let entity = EntityId(id);
    match vote_poll1(&state, entity, &req).await {
        Ok(rsp) => {
            info!("Applied votes on {entity}; {} total", rsp.total_votes);
            counter_add!(state.instruments, "engagement.votes.successful", 1, &[]);
            (StatusCode::OK, Json(rsp)).into_response()
        }
        Err(err) => {
            error!("{:#?}", err);
            counter_add!(state.instruments, "engagement.votes.failures", 1, &[]);
            err.into_response()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Public API                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Return a router for the engagement API; presumably merged with the other API routers
pub fn make_router(state: Arc<Manchitra>) -> Router<Arc<Manchitra>> {
    Router::new()
        .route("/places/{id}/like", post(toggle_like))
        .route("/posts/{id}/vote", post(vote_poll))
        .layer(SetResponseHeaderLayer::if_not_present(
            CONTENT_TYPE,
            HeaderValue::from_static("text/json; charset=utf-8"),
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
