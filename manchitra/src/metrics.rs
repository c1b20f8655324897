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

//! # manchitra metrics
//!
//! manchitra uses [OpenTelemetry] to collect metrics. OTel advises re-using instruments rather
//! than re-creating them at each collection site, which raises the question of where to keep them.
//! I'd rather not litter the application state with dozens of `Counter<u64>` fields, nor maintain
//! a centralized list of every metric in the program, so this module leans on David Tolnay's
//! [inventory] crate: each collection site *registers* its metric by name & sort,
//!
//! [OpenTelemetry]: https://docs.rs/opentelemetry/latest/opentelemetry/index.html
//! [inventory]: https://docs.rs/inventory/latest/inventory/index.html
//!
//! ```ignore
//! inventory::submit! { metrics::Registration::new("views.increments", Sort::IntegralCounter) }
//! ```
//!
//! and the [Instruments] constructor (invoked once, at startup) collects every registration,
//! checks for name collisions & pre-builds the instruments. At the collection site:
//!
//! ```ignore
//! counter_add!(state.instruments, "views.increments", 1, &[]);
//! ```
//!
//! Lookup failure or a sort mismatch panics; these are logic errors that a richer type system
//! would have caught at compile time, and the collision check at startup keeps the blast radius
//! to "you misspelled the name at the collection site".

use std::collections::{hash_map::Entry, HashMap, HashSet};

use opentelemetry::{
    global,
    metrics::{Counter, UpDownCounter},
    KeyValue,
};

/// Instrument type
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Sort {
    /// Corresponds to `Counter<u64>`
    IntegralCounter,
    /// Corresponds to `UpDownCounter<i64>` (in-flight gauges & the like)
    UpDown,
}

/// One registered metric: a name & a sort
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Registration {
    name: &'static str,
    sort: Sort,
}

impl Registration {
    pub const fn new(name: &'static str, sort: Sort) -> Registration {
        Registration { name, sort }
    }
    pub fn name(&self) -> String {
        self.name.to_string()
    }
    pub fn sort(&self) -> Sort {
        self.sort
    }
}

inventory::collect!(Registration);

/// Panic early if two collection sites claimed the same metric name
pub fn check_metric_registrations() {
    let mut names: HashSet<String> = HashSet::new();
    IntoIterator::into_iter(inventory::iter::<Registration>).for_each(|reg| {
        if !names.insert(reg.name()) {
            panic!("The metric name {} was registered twice", reg.name());
        }
    });
}

enum Instrument {
    CounterU64(Counter<u64>),
    UpDownI64(UpDownCounter<i64>),
}

/// Container for OTel instruments
pub struct Instruments {
    map: HashMap<String, Instrument>,
}

impl Instruments {
    pub fn new(prefix: &'static str) -> Instruments {
        let mut m: HashMap<String, Instrument> = HashMap::new();
        let meter = global::meter(prefix);
        // Pre-creating every registered instrument may build some that are never used, but it
        // means `add` doesn't need `&mut self` & the container can live in an Arc.
        IntoIterator::into_iter(inventory::iter::<Registration>).for_each(|reg| {
            let name = reg.name();
            match m.entry(reg.name()) {
                Entry::Occupied(_) => {
                    panic!("The metric name {} was used twice", name)
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(match reg.sort() {
                        Sort::IntegralCounter => {
                            Instrument::CounterU64(meter.u64_counter(name).init())
                        }
                        Sort::UpDown => {
                            Instrument::UpDownI64(meter.i64_up_down_counter(name).init())
                        }
                    });
                }
            }
        });

        Instruments { map: m }
    }
    // panics if `name` doesn't name a counter
    pub fn add(&self, name: &str, count: u64, attributes: &[KeyValue]) {
        if let Some(Instrument::CounterU64(c)) = self.map.get(name) {
            c.add(count, attributes);
        } else {
            panic!("{} does not name a counter", name);
        }
    }
    // panics if `name` doesn't name an up/down counter
    pub fn updown(&self, name: &str, delta: i64, attributes: &[KeyValue]) {
        if let Some(Instrument::UpDownI64(c)) = self.map.get(name) {
            c.add(delta, attributes);
        } else {
            panic!("{} does not name an up/down counter", name);
        }
    }
}

#[macro_export]
macro_rules! counter_add {
    ($instr:expr, $name:expr, $count:expr, $attrs:expr) => {
        $instr.add($name, $count, $attrs);
    };
}

#[macro_export]
macro_rules! updown_add {
    ($instr:expr, $name:expr, $delta:expr, $attrs:expr) => {
        $instr.updown($name, $delta, $attrs);
    };
}
