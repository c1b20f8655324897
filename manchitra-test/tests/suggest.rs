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

//! Integration tests for suggestion search & its read-through cache, including the cache
//! transparency property: a disabled cache changes the `cached` flag & nothing else.

use std::sync::Arc;

use reqwest::{Client, StatusCode};

use manchitra::{cache::Disabled, suggest::SuggestRsp};
use manchitra_test::{sample_places, spawn_app, spawn_default_app, TestApp};

/// Two views of place 1, five of place 3
async fn seed_views(app: &TestApp, client: &Client) {
    for (id, n) in [(1u64, 2u64), (3, 5)] {
        for _ in 0..n {
            client
                .post(app.url.join(&format!("/api/v1/places/{}/view", id)).unwrap())
                .send()
                .await
                .unwrap();
        }
    }
}

async fn suggest(app: &TestApp, client: &Client, q: &str) -> SuggestRsp {
    let rsp = client
        .get(app.url.join(&format!("/api/v1/suggest?q={}", q)).unwrap())
        .send()
        .await
        .unwrap();
    assert_eq!(StatusCode::OK, rsp.status());
    rsp.json::<SuggestRsp>().await.unwrap()
}

#[tokio::test]
async fn ranked_by_views_and_cached_on_second_read() {
    let app = spawn_default_app().await;
    let client = Client::new();
    seed_views(&app, &client).await;

    let first = suggest(&app, &client, "kalighat").await;
    assert!(!first.cached);
    assert_eq!(2, first.suggestions.len());
    // Place 3 has more views, so it leads
    assert_eq!("Tridhara Sammilani", first.suggestions[0].name);
    assert_eq!(5, first.suggestions[0].views);
    assert_eq!("Mudiali Club", first.suggestions[1].name);

    let second = suggest(&app, &client, "kalighat").await;
    assert!(second.cached);
    assert_eq!(first.suggestions, second.suggestions);

    // Normalization: case & surrounding whitespace hit the same entry
    let third = suggest(&app, &client, "%20KALIGHAT%20").await;
    assert!(third.cached);
    assert_eq!(first.suggestions, third.suggestions);
}

#[tokio::test]
async fn disabling_the_cache_changes_nothing_but_the_flag() {
    let cached_app = spawn_default_app().await;
    let plain_app = spawn_app(Arc::new(Disabled), sample_places()).await;
    let client = Client::new();
    seed_views(&cached_app, &client).await;
    seed_views(&plain_app, &client).await;

    let with_cache = suggest(&cached_app, &client, "kalighat").await;
    let without = suggest(&plain_app, &client, "kalighat").await;
    assert_eq!(with_cache.suggestions, without.suggestions);

    // And on re-read, only the flag differs
    let with_cache = suggest(&cached_app, &client, "kalighat").await;
    let without = suggest(&plain_app, &client, "kalighat").await;
    assert!(with_cache.cached);
    assert!(!without.cached);
    assert_eq!(with_cache.suggestions, without.suggestions);
}

#[tokio::test]
async fn short_queries_short_circuit() {
    let app = spawn_default_app().await;
    let client = Client::new();

    for q in ["", "k", "%20%20k%20"] {
        let rsp = suggest(&app, &client, q).await;
        assert!(rsp.suggestions.is_empty());
        assert!(!rsp.cached);
    }
}

#[tokio::test]
async fn limits_are_enforced() {
    let app = spawn_default_app().await;
    let client = Client::new();

    let rsp = client
        .get(app.url.join("/api/v1/suggest?q=kalighat&limit=21").unwrap())
        .send()
        .await
        .unwrap();
    assert_eq!(StatusCode::BAD_REQUEST, rsp.status());

    let rsp = client
        .get(app.url.join("/api/v1/suggest?q=kalighat&limit=1").unwrap())
        .send()
        .await
        .unwrap();
    assert_eq!(StatusCode::OK, rsp.status());
    let body = rsp.json::<SuggestRsp>().await.unwrap();
    assert!(body.suggestions.len() <= 1);
}
