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

use std::{sync::Arc, time::Duration};

use crate::{
    background_tasks::BackgroundTasks, cache::Cache, catalog::Catalog, metrics,
    storage::Backend as StorageBackend,
};

/// Application state available to all handlers
pub struct Manchitra {
    pub storage: Arc<dyn StorageBackend + Send + Sync>,
    pub catalog: Arc<dyn Catalog + Send + Sync>,
    pub cache: Arc<dyn Cache + Send + Sync>,
    pub task_sender: Arc<BackgroundTasks>,
    pub registry: prometheus::Registry,
    pub instruments: Arc<metrics::Instruments>,
    /// TTL applied to cached suggestion lists
    pub suggest_ttl: Duration,
}
