// SPDX-License-Identifier: MPL-2.0

//! Entropy: the transactional package lifecycle core of a binary package
//! manager (spec.md §1). [`Context`] bundles the installed store, repository
//! set, resource lock, fetcher and C7/C8/trigger collaborators; the phase
//! lists under [`action`] drive one package in or out; [`Orchestrator`]
//! serializes many such actions into a single FIFO queue and reports their
//! progress, mirroring the layering of the teacher's own `moss` library
//! crate (`examples/serpent-os-tools/crates/moss/src/lib.rs`): a top-level
//! re-export of the few types a caller actually constructs, with the rest
//! left as `pub mod`s for anything that needs the detail.

pub use self::context::{Context, Paths};
pub use self::error::{Error, Kind, Outcome};
pub use self::orchestrator::{Activity, Event, Orchestrator};

pub mod action;
pub mod config;
pub mod context;
pub mod error;
pub mod orchestrator;
