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

//! # catalog
//!
//! The boundary to the place catalog.
//!
//! Place metadata (names, coordinates, areas) is owned by the wider application; this crate only
//! holds entity ids & joins metadata in at read time. An entity with engagement but no catalog
//! entry is *dropped* from rankings & suggestions, never an error-- the catalog and the counters
//! are updated by different actors & transient disagreement between them is normal.

use std::{collections::HashMap, path::Path};

use async_trait::async_trait;
use snafu::{prelude::*, Backtrace};

use crate::entities::{EntityId, Place};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Catalog backend failure: {source}"))]
    Backend {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
        backtrace: Backtrace,
    },
    #[snafu(display("Unable to read the catalog file: {source}"))]
    CatalogRead { source: std::io::Error },
    #[snafu(display("Error parsing the catalog file: {source}"))]
    CatalogParse { source: serde_json::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

#[async_trait]
pub trait Catalog {
    /// Retrieve a place's display metadata by id. None means the catalog doesn't know the entity.
    async fn place(&self, id: &EntityId) -> Result<Option<Place>>;
    /// Case-insensitive substring search over place names & areas, up to `limit` results
    ///
    /// Result order is deterministic (name, then id); any relevance ranking happens at the call
    /// site, where the counters live.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Place>>;
}

/// Catalog held wholly in memory, loaded once at startup
pub struct InMemory {
    places: HashMap<EntityId, Place>,
}

impl InMemory {
    pub fn new(places: impl IntoIterator<Item = Place>) -> InMemory {
        InMemory {
            places: places.into_iter().map(|p| (p.id, p)).collect(),
        }
    }
    /// Load a catalog from a JSON file containing an array of places
    pub fn from_file(path: &Path) -> Result<InMemory> {
        let text = std::fs::read_to_string(path).context(CatalogReadSnafu)?;
        let places: Vec<Place> = serde_json::from_str(&text).context(CatalogParseSnafu)?;
        Ok(InMemory::new(places))
    }
    pub fn empty() -> InMemory {
        InMemory {
            places: HashMap::new(),
        }
    }
}

#[async_trait]
impl Catalog for InMemory {
    async fn place(&self, id: &EntityId) -> Result<Option<Place>> {
        Ok(self.places.get(id).cloned())
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Place>> {
        let needle = query.to_lowercase();
        let mut hits: Vec<&Place> = self
            .places
            .values()
            .filter(|p| {
                p.name.to_lowercase().contains(&needle) || p.area.to_lowercase().contains(&needle)
            })
            .collect();
        hits.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(hits.into_iter().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn place(id: u64, name: &str, area: &str) -> Place {
        Place {
            id: EntityId(id),
            name: name.to_owned(),
            lat: 22.57,
            lon: 88.36,
            area: area.to_owned(),
        }
    }

    #[tokio::test]
    async fn lookup_by_id() {
        let catalog = InMemory::new([place(1, "Mudiali Club", "Kalighat")]);
        assert!(catalog.place(&EntityId(1)).await.unwrap().is_some());
        assert!(catalog.place(&EntityId(2)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn search_is_case_insensitive_and_bounded() {
        let catalog = InMemory::new([
            place(1, "Mudiali Club", "Kalighat"),
            place(2, "Suruchi Sangha", "New Alipore"),
            place(3, "Tridhara Sammilani", "Kalighat"),
        ]);
        let hits = catalog.search("KALIGHAT", 10).await.unwrap();
        assert_eq!(2, hits.len());
        // Deterministic order: by name
        assert_eq!("Mudiali Club", hits[0].name);
        let hits = catalog.search("a", 2).await.unwrap();
        assert_eq!(2, hits.len());
    }
}
