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

//! # Background Task Processing
//!
//! Ranking recomputation belongs off the hot path: a view increment should return as soon as the
//! counter lands, with the (comparatively expensive) top-N recomputation happening nearline,
//! best-effort. The obvious move is [tokio::spawn], but I'd rather not accept the lack of
//! durability entailed: if the process is halted after `spawn` returns but before the task runs,
//! the task is simply lost, and the rankings stay stale until some *other* view happens to land.
//!
//! Instead, this module (ab)uses the data store as a task queue: handlers "send" tasks, which are
//! serialized & persisted; a single background worker per process leases them (with an expiry, so
//! a crashed holder's tasks are eventually re-offered to someone else), executes them & marks them
//! complete. At-least-once delivery, with synchronization pushed down to the store-- which is what
//! keeps this correct when manchitra runs as several instances. Recomputation is idempotent, so
//! at-least-once is exactly the right guarantee.

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc, task::Poll, time::Duration};

use async_trait::async_trait;
use pin_project::pin_project;
use rmp_serde::to_vec;
use serde::{Deserialize, Serialize};
use snafu::{prelude::*, Backtrace};
use tokio::{
    sync::Notify,
    task::{Id, JoinError, JoinHandle, JoinSet},
};
use uuid::Uuid;

use crate::{
    catalog::Catalog,
    counter_add,
    metrics::{self, Instruments, Sort},
    storage::Backend as StorageBackend,
    updown_add,
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    // Generic error variant trait implementations can use
    #[snafu(display("{source}"))]
    Background {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to mark a task complete: {source}"))]
    Completion {
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },
    #[snafu(display("Failed to deserialize a task: {source}"))]
    De {
        source: rmp_serde::decode::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("{uuid} is not a recognized task tag"))]
    Tag { uuid: Uuid },
    #[snafu(display("Task processing failed to run to completion: {source}"))]
    Join {
        source: tokio::task::JoinError,
        backtrace: Backtrace,
    },
    #[snafu(display("Timeout shutting-down the task processor: {source}"))]
    ShutdownTimeout {
        source: tokio::time::error::Elapsed,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to pick-up a new task: {source}"))]
    Take {
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },
    #[snafu(display("Tried to remove an unknown TaskId"))]
    TaskId { backtrace: Backtrace },
    #[snafu(display("Failed to serialize a task to messagepack: {source}"))]
    TaskSer {
        source: rmp_serde::encode::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to wait for in-flight tasks: {source}"))]
    Timeout { source: tokio::time::error::Elapsed },
}

impl Error {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error::Background {
            source: Box::new(err),
            backtrace: Backtrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             tasks                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Trait defining a "task" for our purposes: anything [Send] that can consume itself into an async
/// computation yielding `Result<()>`.
// This trait *must* be object-safe in order to allow `process()` (below) to handle tasks in a
// generic way; the generic context parameter has to sit at the trait level for the same reason.
#[async_trait]
pub trait Task<C>: Send {
    /// Consume this task, executing it against `context`
    async fn exec(self: Box<Self>, context: C) -> Result<()>;
    fn timeout(&self) -> Option<Duration>;
}

/// A [Task] that can return a per-type tag; needed to find the right deserializer at pickup time
pub trait TaggedTask<C>: Task<C> {
    type Tag;
    fn get_tag() -> Self::Tag;
}

/// The ability to collect, or "send", [Task]s
///
/// Generic over the task type (rather than making `send()` generic) so that implementors can
/// constrain which tasks they accept.
#[async_trait]
pub trait Sender<C, T: Task<C>> {
    async fn send(&self, task: T) -> Result<()>;
}

/// The ability to harvest, or "receive", [Task]s generically: move a task trait object out of the
/// backend together with a cookie identifying it, then later mark it complete.
#[async_trait]
pub trait Receiver<C> {
    type TaskId: Send + 'static;
    async fn mark_complete(&self, cookie: Self::TaskId) -> Result<()>;
    async fn take_task(&self) -> Result<Option<(Box<dyn Task<C>>, Self::TaskId)>>;
}

/// Blanket implementation for [Arc]s; if `T` is a [Receiver], then so is `Arc<T>`.
#[async_trait]
impl<C, T: Receiver<C> + Send + Sync> Receiver<C> for Arc<T> {
    type TaskId = T::TaskId;
    async fn mark_complete(&self, cookie: Self::TaskId) -> Result<()> {
        self.as_ref().mark_complete(cookie).await
    }
    async fn take_task(&self) -> Result<Option<(Box<dyn Task<C>>, Self::TaskId)>> {
        self.as_ref().take_task().await
    }
}

/// [Processor] manages the ongoing processing of background tasks; hold it for the lifetime of
/// the service & call `shutdown()` (or `into_parts()` for use in a `select!`) to stop.
#[pin_project]
pub struct Processor {
    #[pin]
    processor: JoinHandle<Result<()>>,
    shutdown: Arc<Notify>,
}

impl Future for Processor {
    type Output = std::result::Result<Result<()>, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        this.processor.poll(cx)
    }
}

impl Processor {
    /// Consume the instance; signal the processing task to shut down & wait up to `timeout` for it
    pub async fn shutdown(self, timeout: Duration) -> Result<()> {
        self.shutdown.notify_one();
        tokio::time::timeout(timeout, self.processor)
            .await
            .context(ShutdownTimeoutSnafu)?
            .context(JoinSnafu)?
    }
    /// Split the instance back into its parts; convenient when waiting on the processor along
    /// with other futures in a `tokio::select!`
    pub fn into_parts(self) -> (JoinHandle<Result<()>>, Arc<Notify>) {
        (self.processor, self.shutdown)
    }
}

/// Configuration parameters for processing background tasks
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Timeout that will be used for any task that doesn't define its own
    #[serde(rename = "default-timeout")]
    pub default_timeout: Duration,
    /// The maximum number of tasks to drive concurrently
    #[serde(rename = "max-concurrent-tasks")]
    pub max_concurrent_tasks: usize,
    /// Amount of time to sleep when we have no tasks in process
    #[serde(rename = "sleep-duration")]
    pub sleep_duration: Duration,
    /// Amount of time to wait for in-flight tasks on shutdown
    #[serde(rename = "shutdown-timeout")]
    pub shutdown_timeout: Duration,
    /// Maximum amount of time to drive in-flight tasks without attempting to pick-up new tasks
    #[serde(rename = "pickup-timeout")]
    pub pickup_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(5),
            max_concurrent_tasks: 8,
            sleep_duration: Duration::from_millis(250),
            shutdown_timeout: Duration::from_millis(500),
            pickup_timeout: Duration::from_millis(1000),
        }
    }
}

inventory::submit! { metrics::Registration::new("background.processor.tasks.completed", Sort::IntegralCounter) }

inventory::submit! { metrics::Registration::new("background.processor.tasks.inflight", Sort::UpDown) }

/// Process background tasks. `receiver` is a [Receiver] from which we can draw tasks, `config`
/// holds the algorithm's parameters & `shutdown` is a [Notify] the caller can use to signal this
/// function to exit.
async fn process<C: Clone + 'static, R: Receiver<C>>(
    receiver: R,
    context: C,
    config: Config,
    shutdown: Arc<Notify>,
    instruments: Arc<Instruments>,
) -> Result<()> {
    // The outline: maintain a `JoinSet` of currently running tasks,
    let mut tasks: HashMap<Id, R::TaskId> = HashMap::new();
    let mut futures = JoinSet::new();
    // and loop until told to stop:
    let mut done = false;
    while !done {
        // So long as we don't have too much on our plate, try 'n grab another task:
        if futures.len() < config.max_concurrent_tasks {
            if let Some((task, cookie)) = receiver.take_task().await.context(TakeSnafu)? {
                let id = futures
                    .spawn(tokio::time::timeout(
                        task.timeout().unwrap_or(config.default_timeout),
                        task.exec(context.clone()),
                    ))
                    .id();
                tasks.insert(id, cookie);
                updown_add!(instruments, "background.processor.tasks.inflight", 1, &[]);
            }
        }

        if !futures.is_empty() {
            // We've got at least one task; drive 'em all forward, while watching for shutdown:
            tokio::select! {
                result = futures.join_next_with_id() => {
                    match result {
                        Some(Ok((id, _))) => {
                            // The task completed (and was consumed in the process); all that
                            // remains is to mark it so.
                            let cookie = tasks.remove(&id).context(TaskIdSnafu)?;
                            receiver.mark_complete(cookie).await.context(CompletionSnafu)?;
                            counter_add!(instruments, "background.processor.tasks.completed", 1, &[]);
                            updown_add!(instruments, "background.processor.tasks.inflight", -1, &[]);
                        },
                        Some(Err(err)) => {
                            return Err(Error::Join { source: err, backtrace: Backtrace::capture() });
                        },
                        None => unimplemented!(), // Precluded by `.is_empty()`, above.
                    }
                },
                // If `futures` holds a single long-running task, we could get stuck driving it
                // while new tasks pile-up in the queue; stopping periodically lets us pick them up.
                _ = tokio::time::sleep(config.pickup_timeout) => (),
                _ = shutdown.notified() => {
                    done = true;
                }
            }
        } else {
            // Nothing in flight; hang out a bit before polling the queue again, while remaining
            // mindful of our shutdown notification:
            tokio::select! {
                _ = tokio::time::sleep(config.sleep_duration) => (),
                _ = shutdown.notified() => {
                    done = true;
                }
            }
        }
    }

    // Give any in-flight tasks a chance to complete:
    tokio::time::timeout(config.shutdown_timeout, futures.join_all())
        .await
        .context(TimeoutSnafu)?;

    Ok(())
}

/// Create a new [Processor] given a [Receiver].
pub fn new<C: Clone + Send + 'static, R: Receiver<C> + Send + 'static>(
    receiver: R,
    context: C,
    config: Option<Config>,
    instruments: Arc<Instruments>,
) -> Processor {
    let shutdown = Arc::new(Notify::new());
    let processor = tokio::spawn(process(
        receiver,
        context,
        config.unwrap_or_default(),
        shutdown.clone(),
        instruments,
    ));
    Processor {
        processor,
        shutdown,
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                    the manchitra task system                                    //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Everything a manchitra background task gets to work with
#[derive(Clone)]
pub struct Context {
    pub storage: Arc<dyn StorageBackend + Send + Sync>,
    pub catalog: Arc<dyn Catalog + Send + Sync>,
}

/// To register a background task type: assign a tag (a [Uuid]) & a function that knows how to
/// deserialize a [MessagePack] serialization of a task of that type.
///
/// [MessagePack]: https://msgpack.org/
// No centralized registry of task sorts; Tolnay's [inventory] once again.
pub struct BackgroundTask {
    pub id: Uuid,
    #[allow(clippy::type_complexity)]
    pub de: fn(&[u8]) -> Result<Box<dyn Task<Context>>>,
}

inventory::collect!(BackgroundTask);

/// Object-safe trait over the storage operations required by [BackgroundTasks]
#[async_trait]
pub trait Backend {
    async fn write_task(&self, tag: &Uuid, buf: &[u8]) -> Result<()>;
    // Returns (type tag, task id, messagepack)
    async fn lease_task(&self) -> Result<Option<(Uuid, Uuid, Vec<u8>)>>;
    async fn close_task(&self, uuid: &Uuid) -> Result<()>;
}

/// The manchitra background task queue, backed by the data store
pub struct BackgroundTasks {
    storage: Arc<dyn Backend + Send + Sync>,
}

impl BackgroundTasks {
    pub fn new(storage: Arc<dyn Backend + Send + Sync>) -> BackgroundTasks {
        BackgroundTasks { storage }
    }
}

#[async_trait]
impl<T> Sender<Context, T> for BackgroundTasks
where
    T: TaggedTask<Context, Tag = Uuid> + Serialize + 'static,
{
    /// Serialize to MessagePack, then write to the task table; once this returns the task is
    /// persisted & won't be lost to a shutdown
    async fn send(&self, task: T) -> Result<()> {
        let tag = T::get_tag();
        let buf = to_vec(&task).context(TaskSerSnafu)?;
        self.storage.write_task(&tag, &buf).await
    }
}

#[async_trait]
impl Receiver<Context> for BackgroundTasks {
    type TaskId = Uuid;
    async fn mark_complete(&self, cookie: Self::TaskId) -> Result<()> {
        self.storage.close_task(&cookie).await
    }
    async fn take_task(&self) -> Result<Option<(Box<dyn Task<Context>>, Self::TaskId)>> {
        match self.storage.lease_task().await? {
            Some((tag, id, buf)) => {
                match inventory::iter::<BackgroundTask>().find(|t| t.id == tag) {
                    Some(t) => Ok(Some(((t.de)(&buf)?, id))),
                    None => TagSnafu { uuid: tag }.fail(),
                }
            }
            None => Ok(None),
        }
    }
}

// Let's pressure-test the machinery by mocking-up implementations of the traits & driving
// `process()`:
#[cfg(test)]
mod mock {

    use std::{
        collections::HashSet,
        ops::DerefMut,
        sync::Mutex,
    };

    use super::*;

    #[derive(Clone, Debug, Serialize)]
    struct SleepTask {
        pub duration: Duration,
    }

    #[async_trait]
    impl Task<()> for SleepTask {
        async fn exec(self: Box<Self>, _: ()) -> Result<()> {
            Ok(tokio::time::sleep(self.duration).await)
        }
        fn timeout(&self) -> Option<Duration> {
            Some(Duration::from_secs(10))
        }
    }

    struct InMemory {
        pub tasks: Mutex<HashMap<Uuid, Box<dyn Task<()>>>>,
        pub checkouts: Mutex<HashSet<Uuid>>,
    }

    #[async_trait]
    impl Receiver<()> for InMemory {
        type TaskId = Uuid;
        async fn mark_complete(&self, cookie: Self::TaskId) -> Result<()> {
            self.checkouts.lock().unwrap().remove(&cookie);
            Ok(())
        }
        async fn take_task(&self) -> Result<Option<(Box<dyn Task<()>>, Self::TaskId)>> {
            let mut m = self.tasks.lock().unwrap();
            let key = { m.keys().next().cloned() };
            match key {
                Some(key) => {
                    let task = m.deref_mut().remove(&key).unwrap();
                    self.checkouts.lock().unwrap().insert(key);
                    Ok(Some((task, key)))
                }
                None => Ok(None),
            }
        }
    }

    #[async_trait]
    impl<T: Task<()> + 'static> Sender<(), T> for InMemory {
        async fn send(&self, task: T) -> Result<()> {
            self.tasks
                .lock()
                .unwrap()
                .insert(Uuid::new_v4(), Box::new(task));
            Ok(())
        }
    }

    // Exercise Sender, Receiver & the processing loop
    #[tokio::test]
    async fn send_and_receive() {
        let sender = Arc::new(InMemory {
            tasks: Mutex::new(HashMap::new()),
            checkouts: Mutex::new(HashSet::new()),
        });
        let receiver = sender.clone();
        let processor = new(
            receiver,
            (),
            Some(Config {
                // Choose this slightly longer than the longest task below, in case that task has
                // just gotten started when the shutdown signal arrives.
                shutdown_timeout: Duration::from_millis(800),
                ..Default::default()
            }),
            Arc::new(Instruments::new("manchitra")),
        );

        for millis in [250, 500, 350, 750] {
            sender
                .send(SleepTask {
                    duration: Duration::from_millis(millis),
                })
                .await
                .unwrap();
        }

        let result = processor.shutdown(Duration::from_secs(5)).await;
        assert!(result.is_ok());
    }
}
