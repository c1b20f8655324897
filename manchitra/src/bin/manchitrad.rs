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

//! # manchitrad
//!
//! The Manchitra engagement service.
//!
//! Serves the view/visit counters, likes & polls, popularity rankings & suggestion search for the
//! Manchitra map application. Runs in the foreground (it's expected to live in a container);
//! `SIGHUP` re-reads configuration, `SIGTERM` shuts down gracefully.

use std::{
    future::IntoFuture,
    net::SocketAddr,
    path::PathBuf,
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{extract::State, response::IntoResponse, routing::get, Router};
use clap::{crate_authors, crate_version, value_parser, Arg, ArgAction, Command};
use http::{HeaderName, HeaderValue, StatusCode};
use opentelemetry::{global, KeyValue};
use serde::Deserialize;
use snafu::{prelude::*, IntoError};
use tap::Pipe;
use tokio::{
    net::TcpListener,
    signal::unix::{signal, SignalKind},
    sync::Notify,
};
use tower_http::{
    request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, Level};
use tracing_subscriber::{
    filter::EnvFilter, fmt, layer::SubscriberExt, Layer, Registry as TracingRegistry,
};

use manchitra::{
    background_tasks::{self, BackgroundTasks, Context},
    cache::InProcess,
    catalog,
    engagement::make_router as make_engagement_router,
    manchitra::Manchitra,
    memory::Memory,
    metrics::{check_metric_registrations, Instruments},
    suggest::make_router as make_suggest_router,
    top::make_router as make_top_router,
    views::make_router as make_views_router,
};

/// The manchitrad application error type
///
/// Contra my usual approach of designing a module's error type to be fairly small, at the
/// application level I provide a fairly rich set of errors in the hopes of helping operators;
/// [Snafu] keeps the boilerplate manageable.
///
/// [Snafu]: https://docs.rs/snafu/latest/snafu/index.html
///
/// [Debug] is implemented by hand (via [Display]): `main()` returns `Result<(), Error>` & the Rust
/// runtime prints the `Debug` representation of the `Err` variant on exit, which in the derived
/// form is unreadable.
#[derive(Snafu)]
pub enum Error {
    #[snafu(display("Failed to bind to {addr}: {source}"))]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[snafu(display("Failed to load the place catalog: {source}"))]
    Catalog { source: manchitra::catalog::Error },
    #[snafu(display("Unable to read configuration file {pth:?}: {source}"))]
    ConfigNotFound {
        pth: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Error parsing configuration file {pth:?}: {source}"))]
    ConfigParse {
        pth: PathBuf,
        source: toml::de::Error,
    },
    #[snafu(display("Failed to parse RUST_LOG: {source}"))]
    EnvFilter {
        source: tracing_subscriber::filter::FromEnvError,
    },
    #[snafu(display("While building the Prometheus exporter, {source}"))]
    Exporter {
        source: opentelemetry::metrics::MetricsError,
    },
    #[snafu(display("Failed to set the tracing subscriber: {source}"))]
    Subscriber {
        source: tracing::subscriber::SetGlobalDefaultError,
    },
    #[snafu(display("Failed to instantiate a Tokio runtime: {source}"))]
    TokioRuntime { source: std::io::Error },
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self, f)
    }
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         configuration                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Logging-related options read from the command line or the environment
struct LogOpts {
    pub plain: bool,
    pub level: Level,
}

impl LogOpts {
    fn new(matches: &clap::ArgMatches) -> LogOpts {
        LogOpts {
            plain: matches.get_flag("plain"),
            level: match (
                matches.get_flag("debug"),
                matches.get_flag("verbose"),
                matches.get_flag("quiet"),
            ) {
                (true, _, _) => Level::TRACE,
                (false, true, _) => Level::DEBUG,
                (false, false, true) => Level::ERROR,
                (_, _, _) => Level::INFO,
            },
        }
    }
}

/// Configuration options read from the CLI (or the environment)
struct CliOpts {
    pub log_opts: LogOpts,
    pub cfg: Option<PathBuf>,
}

impl CliOpts {
    fn new(matches: clap::ArgMatches) -> CliOpts {
        CliOpts {
            log_opts: LogOpts::new(&matches),
            cfg: matches.get_one::<PathBuf>("config").cloned(),
        }
    }
}

/// Manchitra configuration, version one
#[derive(Clone, Debug, Deserialize)]
struct ConfigV1 {
    /// Local address at which to listen for public requests; specify as "address:port"
    #[serde(rename = "public-address")]
    public_address: SocketAddr,
    /// Address at which to listen for operator requests; specify as "address:port"
    #[serde(rename = "private-address")]
    private_address: SocketAddr,
    /// JSON file holding the place catalog; omit to start with an empty catalog
    #[serde(rename = "catalog-file")]
    catalog_file: Option<PathBuf>,
    /// TTL applied to cached suggestion lists
    #[serde(rename = "suggest-ttl")]
    suggest_ttl: Duration,
    #[serde(rename = "background-tasks")]
    background_tasks: background_tasks::Config,
}

impl Default for ConfigV1 {
    fn default() -> Self {
        ConfigV1 {
            public_address: "0.0.0.0:20779".parse::<SocketAddr>().unwrap(/* known good */),
            private_address: "127.0.0.1:20780".parse::<SocketAddr>().unwrap(/* known good */),
            catalog_file: None,
            suggest_ttl: Duration::from_secs(3600),
            background_tasks: background_tasks::Config::default(),
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "version")] // tag "internally"
enum Configuration {
    #[serde(rename = "1")]
    V1(ConfigV1),
}

/// Parse the manchitra configuration file
fn parse_config(cfg: &Option<PathBuf>) -> Result<ConfigV1> {
    let (pth, defaulted): (PathBuf, bool) = cfg.as_ref().map_or_else(
        || (PathBuf::from_str("/etc/manchitra.toml").unwrap(), true),
        |p| (p.clone(), false),
    );
    match std::fs::read_to_string(&pth) {
        Ok(text) => match toml::from_str::<Configuration>(&text) {
            Ok(Configuration::V1(cfg)) => Ok(cfg),
            Err(err) => Err(ConfigParseSnafu { pth }.into_error(err)),
        },
        Err(err) => {
            if defaulted {
                Ok(ConfigV1::default())
            } else {
                Err(ConfigNotFoundSnafu { pth }.into_error(err))
            }
        }
    }
}

/// Configure manchitra logging: to stdout, compact or JSON
#[allow(clippy::type_complexity)]
fn configure_logging(
    logopts: &LogOpts,
) -> Result<(Box<dyn Layer<TracingRegistry> + Send + Sync>, EnvFilter)> {
    let filter = EnvFilter::builder()
        .with_default_directive(logopts.level.into())
        .from_env()
        .context(EnvFilterSnafu)?;

    // `compact()` & `json()` produce layers *of different types*; it is for this reason that
    // `Box<dyn Layer<S> + Send + Sync>` implements `Layer`:
    let formatter: Box<dyn Layer<TracingRegistry> + Send + Sync> = if logopts.plain {
        Box::new(fmt::Layer::default().compact().with_writer(std::io::stdout))
    } else {
        Box::new(
            fmt::Layer::default()
                .json()
                .with_current_span(true)
                .with_writer(std::io::stdout),
        )
    };

    Ok((formatter, filter))
}

/// Initialize telemetry
///
/// Must be invoked before any instruments are accessed. Returns the prometheus [Registry] whose
/// contents back the `/metrics` endpoint.
///
/// [Registry]: prometheus::Registry
fn init_telemetry() -> Result<prometheus::Registry> {
    check_metric_registrations();
    let registry = prometheus::Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()
        .context(ExporterSnafu)?;
    let provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
        .with_reader(exporter)
        .with_resource(opentelemetry_sdk::Resource::new(vec![KeyValue::new(
            "service.name",
            "manchitra",
        )]))
        .build();
    global::set_meter_provider(provider);
    Ok(registry)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           the server                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn healthcheck() -> &'static str {
    "GOOD"
}

async fn metrics(State(state): State<Arc<Manchitra>>) -> String {
    prometheus::TextEncoder::new()
        .encode_to_string(&state.registry.gather())
        .unwrap_or_else(|err| {
            error!("Failed to encode Prometheus metrics: {err}");
            String::new()
        })
}

/// Operator's view of the cache: 200 if it's answering, 503 if not. The *service* is healthy
/// either way (the cache is best-effort); this endpoint exists so an operator can tell "slow
/// because cold cache" from "slow because dead cache".
async fn cache_health(State(state): State<Arc<Manchitra>>) -> axum::response::Response {
    match state.cache.health_check().await {
        Ok(_) => (StatusCode::OK, "GOOD").into_response(),
        Err(err) => {
            error!("cache health check failed: {err}");
            (StatusCode::SERVICE_UNAVAILABLE, format!("{}", err)).into_response()
        }
    }
}

/// Counter for generating request IDs; a u64 carries less information than the traditional UUID,
/// but it's enough, more readable & a useful gauge of how long the server's been up.
#[derive(Clone, Debug, Default)]
struct RequestIdGenerator {
    counter: Arc<AtomicU64>,
}

impl MakeRequestId for RequestIdGenerator {
    fn make_request_id<B>(&mut self, _request: &axum::extract::Request<B>) -> Option<RequestId> {
        self.counter
            .fetch_add(1, Ordering::SeqCst)
            .to_string()
            .pipe(|s| RequestId::new(HeaderValue::from_str(&s).unwrap(/* known good */)))
            .pipe(Some)
    }
}

/// Make the [Router] that will be accessible to the world
fn make_world_router(state: Arc<Manchitra>) -> Router {
    Router::new()
        .route("/healthcheck", get(healthcheck))
        .route("/metrics", get(metrics))
        .nest("/api/v1", make_views_router(state.clone()))
        .nest("/api/v1", make_engagement_router(state.clone()))
        .nest("/api/v1", make_top_router(state.clone()))
        .nest("/api/v1", make_suggest_router(state.clone()))
        // Incoming requests must hit the `SetRequestIdLayer` *first*, so it's the last/outer
        // layer applied:
        .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
            "x-request-id",
        )))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(SetRequestIdLayer::new(
            HeaderName::from_static("x-request-id"),
            RequestIdGenerator::default(),
        ))
        .with_state(state)
}

/// Make the [Router] that will only be locally accessible
fn make_local_router(state: Arc<Manchitra>) -> Router {
    Router::new()
        .route("/ops/cache/health", get(cache_health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve manchitra API requests
async fn serve(opts: CliOpts, mut cfg: ConfigV1) -> Result<()> {
    // Produce a future which can be used to signal graceful shutdown, below.
    async fn shutdown_signal(nfy: Arc<Notify>) {
        nfy.notified().await
    }

    let mut sighup = signal(SignalKind::hangup()).unwrap();
    let mut sigterm = signal(SignalKind::terminate()).unwrap();

    let registry = init_telemetry()?;
    let instruments = Arc::new(Instruments::new("manchitra"));

    // The backing store & cache live across SIGHUP passes (re-reading configuration shouldn't
    // zero the counters); listeners & routers are rebuilt each pass.
    let memory = Arc::new(Memory::new());
    let cache = Arc::new(InProcess::new());

    loop {
        let catalog: Arc<dyn manchitra::catalog::Catalog + Send + Sync> = match &cfg.catalog_file {
            Some(pth) => Arc::new(catalog::InMemory::from_file(pth).context(CatalogSnafu)?),
            None => Arc::new(catalog::InMemory::empty()),
        };

        // Background task processing: `queue` is the persistent task queue backed by our
        // datastore; keep a reference for the web service (the sender side) & move one into a
        // `Processor` (the receiver side).
        let queue = Arc::new(BackgroundTasks::new(memory.clone()));
        let task_processor = background_tasks::new(
            queue.clone(),
            Context {
                storage: memory.clone(),
                catalog: catalog.clone(),
            },
            Some(cfg.background_tasks.clone()),
            instruments.clone(),
        );

        let state = Arc::new(Manchitra {
            storage: memory.clone(),
            catalog,
            cache: cache.clone(),
            task_sender: queue,
            registry: registry.clone(),
            instruments: instruments.clone(),
            suggest_ttl: cfg.suggest_ttl,
        });

        let world_nfy = Arc::new(Notify::new());
        let local_nfy = Arc::new(Notify::new());

        let world_server = axum::serve(
            TcpListener::bind(cfg.public_address)
                .await
                .context(BindSnafu {
                    addr: cfg.public_address,
                })?,
            make_world_router(state.clone()),
        )
        .with_graceful_shutdown(shutdown_signal(world_nfy.clone()));

        let local_server = axum::serve(
            TcpListener::bind(cfg.private_address)
                .await
                .context(BindSnafu {
                    addr: cfg.private_address,
                })?,
            make_local_router(state.clone()),
        )
        .with_graceful_shutdown(shutdown_signal(local_nfy.clone()));

        let (mut processor_join_handle, processor_shutdown) = task_processor.into_parts();

        let mut world_server = Box::pin(world_server.into_future());
        let mut local_server = Box::pin(local_server.into_future());

        fn log_on_err<T, E>(x: StdResult<T, E>)
        where
            E: std::fmt::Debug,
        {
            if let Err(err) = x {
                error!("{:?}", err);
            }
        }

        tokio::select! {
            // The servers *should* never shut down on their own.
            _ = &mut world_server => unimplemented!(),
            _ = &mut local_server => unimplemented!(),
            _ = sighup.recv() => {
                info!("Received SIGHUP; re-reading configuration.");
                world_nfy.notify_one();
                local_nfy.notify_one();
                processor_shutdown.notify_one();
                log_on_err(world_server.await);
                log_on_err(local_server.await);
                log_on_err(processor_join_handle.await);
                // Failure to re-parse falls back to the last known-good configuration.
                cfg = match parse_config(&opts.cfg) {
                    Ok(cfg) => cfg,
                    Err(err) => {
                        error!("While re-reading configuration: {err}; keeping the old one.");
                        cfg
                    }
                };
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM; terminating.");
                world_nfy.notify_one();
                local_nfy.notify_one();
                log_on_err(world_server.await);
                log_on_err(local_server.await);
                processor_shutdown.notify_one();
                match tokio::time::timeout(Duration::from_secs(5), processor_join_handle).await {
                    Ok(Err(err)) => error!("Failed to shut-down the task processor: {:?}", err),
                    Err(err) => error!("Failed waiting to shut-down the task processor: {:?}", err),
                    _ => ()
                };
                break;
            }
            res = &mut processor_join_handle => {
                // This shouldn't happen!
                error!("The background task processor exited early with {:?}; shutting-down.", res);
                world_nfy.notify_one();
                local_nfy.notify_one();
                log_on_err(world_server.await);
                log_on_err(local_server.await);
                break;
            },
        }
    }

    Ok(())
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                    main() & process startup                                     //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn go_async(opts: CliOpts) -> Result<()> {
    let cfg = parse_config(&opts.cfg)?;
    let (formatter, filter) = configure_logging(&opts.log_opts)?;
    tracing::subscriber::set_global_default(
        TracingRegistry::default().with(formatter).with(filter),
    )
    .context(SubscriberSnafu)?;

    info!("manchitra version {} starting.", crate_version!());

    serve(opts, cfg).await
}

fn main() -> Result<()> {
    // Most of manchitrad's configuration is read from file; the command-line options govern where
    // to find that file & how to log. Each has a corresponding environment variable for the sake
    // of convenience when running manchitra in a container.
    let opts = CliOpts::new(
        Command::new("manchitrad")
            .version(crate_version!())
            .author(crate_authors!())
            .about("The Manchitra engagement service")
            .long_about(
                "manchitrad serves view/visit counters, likes & polls, popularity rankings \
                 & suggestion search for the Manchitra map application.",
            )
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .num_args(1)
                    .value_parser(value_parser!(PathBuf))
                    .env("MANCHITRA_CONFIG")
                    .help(
                        "path (absolute or relative to the process' current directory) to a \
                         configuration file",
                    ),
            )
            .arg(
                Arg::new("debug")
                    .short('D')
                    .long("debug")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("MANCHITRA_DEBUG")
                    .help("produce debug output"),
            )
            .arg(
                Arg::new("plain")
                    .short('p')
                    .long("plain")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("MANCHITRA_PLAIN")
                    .help("log in human-readable format, not JSON/structured logging"),
            )
            .arg(
                Arg::new("quiet")
                    .short('q')
                    .long("quiet")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("MANCHITRA_QUIET")
                    .help("produce only error output"),
            )
            .arg(
                Arg::new("verbose")
                    .short('v')
                    .long("verbose")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("MANCHITRA_VERBOSE")
                    .help("produce prolix output"),
            )
            .get_matches(),
    );

    tokio::runtime::Runtime::new()
        .context(TokioRuntimeSnafu)?
        .block_on(go_async(opts))
}
