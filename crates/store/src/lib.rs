// SPDX-License-Identifier: MPL-2.0

//! Package Repository Store (spec.md §4.2, C2): a typed record store over
//! packages — atoms, versions, dependencies, provided files, licenses,
//! signatures and triggers — with atom-match, reverse-depends, content
//! iteration and content-diff. Backing format is an embedded SQLite
//! database via `sqlx`, following the teacher's `moss::db` meta/state
//! split generalized to meta+content+automerge in one schema (SPEC_FULL.md
//! §4).

mod database;
mod error;
pub mod package;
pub mod repository;

pub use crate::database::{Database, MatchOutcome};
pub use crate::error::Error;
pub use crate::package::{AtomFields, ContentEntry, Id, InstallSource, Kind, Record, Signatures, TriggerSpec};
