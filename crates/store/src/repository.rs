// SPDX-License-Identifier: MPL-2.0

//! `repository_id -> (Database, artifact-url-pattern)` mapping (spec.md §3
//! Repository set) plus the cross-repository tie-break rules `atom_match`
//! needs once more than one available store is enabled.

use std::collections::HashMap;

use atom::Dependency;

use crate::database::MatchOutcome;
use crate::error::Error;
use crate::{Database, Id};

#[derive(Debug, Clone)]
pub struct RepositoryEntry {
    pub database: Database,
    /// Pattern used to build a download URL for a record in this
    /// repository (spec.md §3 Repository set); e.g. `https://host/{path}`.
    pub artifact_url_pattern: String,
    /// Lower wins ties (spec.md §4.2 tie-break (c)).
    pub priority: u32,
    /// Operator-configured preferred repository (spec.md §4.2 tie-break (b)).
    pub preferred: bool,
}

/// A mapping of enabled repositories, plus the single installed store, that
/// together back every C4 solver query (spec.md §3 Repository set, §4.4).
#[derive(Debug, Clone, Default)]
pub struct RepositorySet {
    available: HashMap<String, RepositoryEntry>,
    /// A package-file added as an ephemeral repository for one transaction
    /// (spec.md §3: "A package-file can be added as an ephemeral repository
    /// for the duration of one transaction").
    ephemeral: Option<RepositoryEntry>,
}

impl RepositorySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, repository_id: impl Into<String>, entry: RepositoryEntry) {
        self.available.insert(repository_id.into(), entry);
    }

    pub fn set_ephemeral(&mut self, entry: RepositoryEntry) {
        self.ephemeral = Some(entry);
    }

    pub fn clear_ephemeral(&mut self) {
        self.ephemeral = None;
    }

    fn all_entries(&self) -> impl Iterator<Item = (Option<&str>, &RepositoryEntry)> {
        self.available
            .iter()
            .map(|(id, entry)| (Some(id.as_str()), entry))
            .chain(self.ephemeral.as_ref().map(|entry| (None, entry)))
    }

    /// Resolve `dep` against every enabled repository plus (if supplied)
    /// the installed store, applying the full three-level tie-break from
    /// spec.md §4.2: (a) highest version+revision per key+slot, (b)
    /// preferred repository per config, (c) lowest repository priority
    /// number.
    pub async fn atom_match(
        &self,
        dep: &Dependency,
        slot: Option<&str>,
        tag: Option<&str>,
        installed: Option<&Database>,
    ) -> Result<Option<(Option<String>, Id)>, Error> {
        let mut candidates: Vec<(Option<String>, bool, u32, Id, atom::Atom)> = Vec::new();

        for (repository_id, entry) in self.all_entries() {
            if let MatchOutcome::Matched(id) = entry.database.atom_match(dep, slot, tag).await? {
                let record = entry.database.get(id).await?;
                if let Ok(candidate_atom) = record.atom.to_atom() {
                    candidates.push((
                        repository_id.map(String::from),
                        entry.preferred,
                        entry.priority,
                        id,
                        candidate_atom,
                    ));
                }
            }
        }

        if let Some(installed) = installed {
            if let MatchOutcome::Matched(id) = installed.atom_match(dep, slot, tag).await? {
                let record = installed.get(id).await?;
                if let Ok(candidate_atom) = record.atom.to_atom() {
                    candidates.push((None, false, u32::MAX, id, candidate_atom));
                }
            }
        }

        candidates.sort_by(|a, b| {
            let version_order = b.4.version.cmp(&a.4.version).then(b.4.revision.cmp(&a.4.revision));
            if version_order != std::cmp::Ordering::Equal {
                return version_order;
            }
            // (b) preferred repository wins; (c) lower priority number wins.
            b.1.cmp(&a.1).then(a.2.cmp(&b.2))
        });

        Ok(candidates.into_iter().next().map(|(repo, _, _, id, _)| (repo, id)))
    }

    pub fn get(&self, repository_id: &str) -> Option<&RepositoryEntry> {
        self.available.get(repository_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RepositoryEntry)> {
        self.available.iter().map(|(id, entry)| (id.as_str(), entry))
    }
}
