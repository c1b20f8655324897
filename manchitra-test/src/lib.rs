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

//! # The manchitra Integration Tests
//!
//! Each test in this crate boots a complete manchitra service-- real router, real background task
//! processor, in-memory backend-- on an ephemeral port & drives it over HTTP, exactly as a client
//! would. No external fixtures are required, which is the point: the storage contract is the only
//! thing a production backend adds, and *that* is exercised by the unit tests against the same
//! trait.

use std::{sync::Arc, time::Duration};

use axum::{routing::get, Router};
use reqwest::Url;
use tokio::net::TcpListener;

use manchitra::{
    background_tasks::{self, BackgroundTasks, Context},
    cache::{Cache, InProcess},
    catalog,
    engagement::make_router as make_engagement_router,
    entities::Place,
    manchitra::Manchitra,
    memory::Memory,
    metrics::Instruments,
    suggest::make_router as make_suggest_router,
    top::make_router as make_top_router,
    views::make_router as make_views_router,
};

/// A running manchitra service, plus handles for seeding state behind its back
pub struct TestApp {
    pub url: Url,
    /// The backend, for seeding polls & inspecting state directly
    pub storage: Arc<Memory>,
    pub state: Arc<Manchitra>,
}

async fn healthcheck() -> &'static str {
    "GOOD"
}

/// Boot a complete manchitra service on an ephemeral port
///
/// `cache` lets a test swap implementations (e.g. [Disabled](manchitra::cache::Disabled), to
/// demonstrate cache transparency); `places` seeds the catalog.
pub async fn spawn_app(cache: Arc<dyn Cache + Send + Sync>, places: Vec<Place>) -> TestApp {
    let storage = Arc::new(Memory::new());
    let catalog: Arc<dyn catalog::Catalog + Send + Sync> = Arc::new(catalog::InMemory::new(places));
    let instruments = Arc::new(Instruments::new("manchitra"));

    let queue = Arc::new(BackgroundTasks::new(storage.clone()));
    // Quick pickup; tests shouldn't dawdle
    let _processor = background_tasks::new(
        queue.clone(),
        Context {
            storage: storage.clone(),
            catalog: catalog.clone(),
        },
        Some(background_tasks::Config {
            sleep_duration: Duration::from_millis(50),
            ..Default::default()
        }),
        instruments.clone(),
    );

    let state = Arc::new(Manchitra {
        storage: storage.clone(),
        catalog,
        cache,
        task_sender: queue,
        registry: prometheus_registry(),
        instruments,
        suggest_ttl: Duration::from_secs(3600),
    });

    let app = Router::new()
        .route("/healthcheck", get(healthcheck))
        .nest("/api/v1", make_views_router(state.clone()))
        .nest("/api/v1", make_engagement_router(state.clone()))
        .nest("/api/v1", make_top_router(state.clone()))
        .nest("/api/v1", make_suggest_router(state.clone()))
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind an ephemeral port");
    let addr = listener.local_addr().expect("Failed to read the bound address");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("Server exited");
    });

    TestApp {
        url: Url::parse(&format!("http://{}", addr)).expect("Failed to parse the server URL"),
        storage,
        state,
    }
}

fn prometheus_registry() -> prometheus::Registry {
    prometheus::Registry::new()
}

/// A couple of Kolkata pandals for the catalog
pub fn sample_places() -> Vec<Place> {
    use manchitra::entities::EntityId;
    vec![
        Place {
            id: EntityId(1),
            name: "Mudiali Club".to_owned(),
            lat: 22.512,
            lon: 88.345,
            area: "Kalighat".to_owned(),
        },
        Place {
            id: EntityId(2),
            name: "Suruchi Sangha".to_owned(),
            lat: 22.498,
            lon: 88.332,
            area: "New Alipore".to_owned(),
        },
        Place {
            id: EntityId(3),
            name: "Tridhara Sammilani".to_owned(),
            lat: 22.517,
            lon: 88.348,
            area: "Kalighat".to_owned(),
        },
    ]
}

/// Boot a service with the stock in-process cache & the sample catalog
pub async fn spawn_default_app() -> TestApp {
    spawn_app(Arc::new(InProcess::new()), sample_places()).await
}
