// SPDX-License-Identifier: MPL-2.0

//! Atom & version algebra.
//!
//! An [`Atom`] is a structured package identifier:
//! `category/name[-version][:slot][#tag][~rev]`. A [`Dependency`] wraps an
//! [`Atom`] with a comparison operator, optional blocker markers and
//! optional `||( a b )` any-of alternatives.

mod atom;
mod dependency;
mod version;

pub use crate::atom::{Atom, ParseError};
pub use crate::dependency::{AnyOf, Blocker, Dependency, DependencyParseError, Operator, UseConditional};
pub use crate::version::Version;

/// `(key, slot)` pair used for installed-store uniqueness (spec.md invariant 2)
/// and as the tie-break grouping for [`Atom`] resolution.
pub type KeySlot = (Key, Option<String>);

/// The `category/name` portion of an [`Atom`], independent of version/slot/tag.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display)]
#[display("{category}/{name}")]
pub struct Key {
    pub category: String,
    pub name: String,
}

/// Ordering result of [`compare_versions`]. A thin wrapper keeps call sites
/// reading as `Ordering` without pulling in `std::cmp::Ordering`'s `Equal`
/// naming ambiguity next to package "equality" concepts elsewhere.
pub type Ordering = std::cmp::Ordering;

/// Compare two [`Version`]s. Never fails: malformed input is rejected at
/// parse time, not at comparison time.
pub fn compare_versions(a: &Version, b: &Version) -> Ordering {
    a.cmp(b)
}

/// Does `candidate` satisfy the constraint expressed by `dep`?
pub fn matches(dep: &Dependency, candidate: &Atom) -> bool {
    dep.matches(candidate)
}

/// Extract the `(key, slot)` identity an [`Atom`] installs under.
pub fn key_slot(atom: &Atom) -> KeySlot {
    (atom.key.clone(), atom.slot.clone())
}
