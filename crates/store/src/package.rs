// SPDX-License-Identifier: MPL-2.0

use std::path::PathBuf;

use atom::{Atom, Dependency};
use serde::{Deserialize, Serialize};

/// Repository-local integer primary key (spec.md §3 Package record).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display, derive_more::From, derive_more::Into)]
pub struct Id(pub i64);

/// How a package came to be installed (spec.md §3 Installed record /
/// §11 explicit-vs-dependency tracking); `Explicit` records are the roots
/// C4's `orphaned()` reachability walk starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum InstallSource {
    Explicit,
    Dependency,
    Unknown,
}

impl Default for InstallSource {
    fn default() -> Self {
        InstallSource::Unknown
    }
}

/// A file-kind tag for a content entry (spec.md §3 content set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum Kind {
    File,
    Dir,
    Sym,
}

/// One path owned by a package, plus content-safety metadata used for
/// change detection (spec.md §3 content-safety).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentEntry {
    pub path: PathBuf,
    pub kind: Kind,
    pub mtime: Option<i64>,
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Signatures {
    pub sha1: Option<String>,
    pub sha256: Option<String>,
    pub sha512: Option<String>,
    pub gpg: Option<String>,
}

/// A named bundle of executable hooks (spec.md §3 triggers).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerSpec {
    pub name: String,
    pub handler: String,
}

/// The full record for one package (spec.md §3 Package/Installed record).
/// Shared shape for both available and installed stores; installed-only
/// fields are `None`/empty on an available record.
#[derive(Debug, Clone, Default)]
pub struct Record {
    pub atom: AtomFields,
    pub dependencies: Vec<Dependency>,
    pub conflicts: Vec<Dependency>,
    /// Declared provided virtuals (dependency-atom strings another
    /// package's dependency can match against).
    pub provides: Vec<String>,
    /// soname -> path, this package's provided shared libraries.
    pub libraries: Vec<(String, PathBuf)>,
    /// sonames this package links against (consulted by C7).
    pub needed: Vec<String>,
    pub licenses: Vec<String>,
    pub content: Vec<ContentEntry>,
    pub triggers: Vec<TriggerSpec>,
    pub signatures: Signatures,
    pub size: Option<i64>,
    pub download_url: Option<String>,
    pub artifact_checksum: Option<String>,
    pub install_source: InstallSource,
    /// Cross-reference to the source package manager (spec.md §3).
    pub spm_uid: Option<String>,
    pub date_installed: Option<i64>,
    pub repository_of_origin: Option<String>,
    /// Refuses removal via `reverse_queue` unless `system_packages=true`
    /// (spec.md §4.4 `NotRemovableError`).
    pub system_critical: bool,
}

/// The atom-identifying columns of a [`Record`], split out so callers can
/// build one without repeating `atom::Atom`'s parse/format machinery for the
/// revision field (which in this store is a plain column, not part of
/// `atom::Version`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AtomFields {
    pub category: String,
    pub name: String,
    pub version: Option<String>,
    pub revision: u64,
    pub slot: Option<String>,
    pub tag: Option<String>,
}

impl AtomFields {
    pub fn key(&self) -> (String, String) {
        (self.category.clone(), self.name.clone())
    }

    pub fn to_atom(&self) -> Result<Atom, atom::ParseError> {
        let mut s = format!("{}/{}", self.category, self.name);
        if let Some(version) = &self.version {
            s.push('-');
            s.push_str(version);
        }
        if let Some(slot) = &self.slot {
            s.push(':');
            s.push_str(slot);
        }
        if let Some(tag) = &self.tag {
            s.push('#');
            s.push_str(tag);
        }
        if self.revision > 0 {
            s.push('~');
            s.push_str(&self.revision.to_string());
        }
        atom::parse_atom(&s)
    }
}
