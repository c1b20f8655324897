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

//! Integration tests for the engagement API: like toggles & poll votes.

use chrono::{Duration, Utc};
use reqwest::{Client, StatusCode};
use serde_json::json;

use manchitra::{
    engagement::{AnonymousLikeRsp, LikeRsp, PollRsp},
    entities::{EntityId, OptionId, PollOption, PollState},
    storage::Backend,
};
use manchitra_test::{spawn_default_app, TestApp};

async fn seed_poll(app: &TestApp, post: u64, allow_multiple: bool) {
    let poll = PollState {
        options: vec![
            PollOption::new(OptionId::new("a").unwrap(), "Option A"),
            PollOption::new(OptionId::new("b").unwrap(), "Option B"),
        ],
        allow_multiple,
        expires_at: None,
    };
    app.storage
        .put_poll(&EntityId(post), &poll)
        .await
        .unwrap();
}

#[tokio::test]
async fn toggling_twice_returns_to_start() {
    let app = spawn_default_app().await;
    let client = Client::new();

    let rsp = client
        .post(app.url.join("/api/v1/places/1/like").unwrap())
        .json(&json!({"user": "u1"}))
        .send()
        .await
        .unwrap();
    assert_eq!(StatusCode::OK, rsp.status());
    let body = rsp.json::<LikeRsp>().await.unwrap();
    assert!(body.liked);
    assert_eq!(1, body.likes);

    let rsp = client
        .post(app.url.join("/api/v1/places/1/like").unwrap())
        .json(&json!({"user": "u1"}))
        .send()
        .await
        .unwrap();
    let body = rsp.json::<LikeRsp>().await.unwrap();
    assert!(!body.liked);
    assert_eq!(0, body.likes);
}

#[tokio::test]
async fn distinct_users_like_independently() {
    let app = spawn_default_app().await;
    let client = Client::new();

    for user in ["u1", "u2", "u3"] {
        let rsp = client
            .post(app.url.join("/api/v1/places/1/like").unwrap())
            .json(&json!({ "user": user }))
            .send()
            .await
            .unwrap();
        assert!(rsp.json::<LikeRsp>().await.unwrap().liked);
    }
    // u2 un-likes; the others stand
    let rsp = client
        .post(app.url.join("/api/v1/places/1/like").unwrap())
        .json(&json!({"user": "u2"}))
        .send()
        .await
        .unwrap();
    let body = rsp.json::<LikeRsp>().await.unwrap();
    assert!(!body.liked);
    assert_eq!(2, body.likes);
}

#[tokio::test]
async fn anonymous_likes_accumulate_with_no_membership() {
    let app = spawn_default_app().await;
    let client = Client::new();

    for expected in 1..=3u64 {
        let rsp = client
            .post(app.url.join("/api/v1/places/5/like").unwrap())
            .json(&json!({}))
            .send()
            .await
            .unwrap();
        assert_eq!(StatusCode::OK, rsp.status());
        let body = rsp.json::<AnonymousLikeRsp>().await.unwrap();
        assert_eq!(expected, body.likes);
    }

    let state = app.storage.like_state(&EntityId(5)).await.unwrap();
    assert_eq!(3, state.likes());
    assert!(state.liked_by.is_empty());
}

#[tokio::test]
async fn single_choice_poll_end_to_end() {
    let app = spawn_default_app().await;
    let client = Client::new();
    seed_poll(&app, 101, false).await;

    let vote = |options: Vec<&'static str>| {
        let client = client.clone();
        let url = app.url.join("/api/v1/posts/101/vote").unwrap();
        async move {
            client
                .post(url)
                .json(&json!({"options": options, "voter": "u1"}))
                .send()
                .await
                .unwrap()
                .json::<PollRsp>()
                .await
                .unwrap()
        }
    };

    let poll = vote(vec!["a"]).await;
    assert_eq!(1, poll.options[0].votes);
    assert_eq!(0, poll.options[1].votes);
    assert_eq!(1, poll.total_votes);

    // Voting a different option moves the vote
    let poll = vote(vec!["b"]).await;
    assert_eq!(0, poll.options[0].votes);
    assert_eq!(1, poll.options[1].votes);

    // Voting the held option again unvotes it
    let poll = vote(vec!["b"]).await;
    assert_eq!(0, poll.options[1].votes);
    assert_eq!(0, poll.total_votes);
}

#[tokio::test]
async fn multi_choice_poll_toggles_independently() {
    let app = spawn_default_app().await;
    let client = Client::new();
    seed_poll(&app, 102, true).await;

    let rsp = client
        .post(app.url.join("/api/v1/posts/102/vote").unwrap())
        .json(&json!({"options": ["a", "b"], "voter": "u1"}))
        .send()
        .await
        .unwrap();
    let poll = rsp.json::<PollRsp>().await.unwrap();
    assert_eq!(2, poll.total_votes);

    // Unknown options are silently ignored
    let rsp = client
        .post(app.url.join("/api/v1/posts/102/vote").unwrap())
        .json(&json!({"options": ["nope"], "voter": "u1"}))
        .send()
        .await
        .unwrap();
    assert_eq!(StatusCode::OK, rsp.status());
    let poll = rsp.json::<PollRsp>().await.unwrap();
    assert_eq!(2, poll.total_votes);
}

#[tokio::test]
async fn malformed_votes_mutate_nothing() {
    let app = spawn_default_app().await;
    let client = Client::new();
    seed_poll(&app, 103, false).await;

    // Empty option list
    let rsp = client
        .post(app.url.join("/api/v1/posts/103/vote").unwrap())
        .json(&json!({"options": [], "voter": "u1"}))
        .send()
        .await
        .unwrap();
    assert_eq!(StatusCode::BAD_REQUEST, rsp.status());

    // Anonymous voter
    let rsp = client
        .post(app.url.join("/api/v1/posts/103/vote").unwrap())
        .json(&json!({"options": ["a"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(StatusCode::BAD_REQUEST, rsp.status());

    // Postless poll
    let rsp = client
        .post(app.url.join("/api/v1/posts/999/vote").unwrap())
        .json(&json!({"options": ["a"], "voter": "u1"}))
        .send()
        .await
        .unwrap();
    assert_eq!(StatusCode::NOT_FOUND, rsp.status());

    // None of the above touched the poll
    let poll = app.storage.poll(&EntityId(103)).await.unwrap().unwrap();
    assert_eq!(0, poll.total_votes());
}

#[tokio::test]
async fn closed_polls_refuse_votes() {
    let app = spawn_default_app().await;
    let client = Client::new();

    let poll = PollState {
        options: vec![PollOption::new(OptionId::new("a").unwrap(), "Option A")],
        allow_multiple: false,
        expires_at: Some(Utc::now() - Duration::minutes(1)),
    };
    app.storage.put_poll(&EntityId(104), &poll).await.unwrap();

    let rsp = client
        .post(app.url.join("/api/v1/posts/104/vote").unwrap())
        .json(&json!({"options": ["a"], "voter": "u1"}))
        .send()
        .await
        .unwrap();
    assert_eq!(StatusCode::BAD_REQUEST, rsp.status());
}
