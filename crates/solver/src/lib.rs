// SPDX-License-Identifier: MPL-2.0

//! Dependency Solver (spec.md §4.4, C4): computes install queues (forward
//! closure) and removal queues (reverse closure) over the union of enabled
//! repositories and the installed store, generalizing the teacher's
//! `moss::registry::transaction` (forward-closure-only, single repository
//! set) with removal-side closures, collision detection and disk-space
//! pre-flight checks.

use std::collections::HashSet;

use atom::Dependency;
use dag::Dag;
use store::repository::RepositorySet;
use store::{Database, Id};
use thiserror::Error;

mod options;

pub use crate::options::Options;

/// Identifies one package across the union of repositories plus the
/// installed store. `repository_id = None` means the installed store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Candidate {
    pub repository_id: Option<String>,
    pub package_id: Id,
}

impl Candidate {
    fn installed(package_id: Id) -> Self {
        Candidate {
            repository_id: None,
            package_id,
        }
    }
}

/// A dependency atom that resolved to nothing in any enabled repository or
/// the installed store (spec.md §4.4 `NotFoundError`).
#[derive(Debug, Error)]
#[error("no candidate satisfies dependency: {0}")]
pub struct NotFoundError(pub String);

#[derive(Debug, Error)]
pub enum Error {
    #[error("dependency solve")]
    NotFound(#[from] NotFoundError),
    #[error("collision: {0}")]
    Collision(#[from] CollisionError),
    #[error("not removable: {0}")]
    NotRemovable(#[from] NotRemovableError),
    #[error("disk full: {0}")]
    DiskFull(#[from] DiskFullError),
    #[error("store")]
    Store(#[from] store::Error),
}

#[derive(Debug, Error)]
pub enum CollisionError {
    #[error("{a:?} and {b:?} both claim key/slot {key}:{slot:?}")]
    KeySlot {
        a: Candidate,
        b: Candidate,
        key: String,
        slot: Option<String>,
    },
    #[error("{a:?} and {b:?} both install {path}")]
    ContentOverlap { a: Candidate, b: Candidate, path: String },
}

#[derive(Debug, Error)]
#[error("{0} is system-critical; pass system_packages=true to remove it")]
pub struct NotRemovableError(pub String);

#[derive(Debug, Error)]
pub enum DiskFullError {
    #[error("download needs {needed} bytes, {available} available")]
    Download { needed: u64, available: u64 },
    #[error("unpack needs {needed} bytes (1.5x headroom), {available} available")]
    Unpack { needed: u64, available: u64 },
}

/// The two halves of a resolved action queue (spec.md §4.4).
#[derive(Debug, Clone, Default)]
pub struct Queue {
    pub install_seq: Vec<Candidate>,
    pub removal_seq: Vec<Candidate>,
    /// Dependency cycles broken during ordering, logged rather than failed
    /// (spec.md §4.4 step 4).
    pub broken_cycles: Vec<(Candidate, Candidate)>,
}

/// The two halves of `orphaned()`'s split (spec.md §4.4).
#[derive(Debug, Clone, Default)]
pub struct Orphaned {
    pub manual_review: Vec<Id>,
    pub safe_to_remove: Vec<Id>,
}

pub struct Solver<'a> {
    repositories: &'a RepositorySet,
    installed: &'a Database,
}

impl<'a> Solver<'a> {
    pub fn new(repositories: &'a RepositorySet, installed: &'a Database) -> Self {
        Self { repositories, installed }
    }

    /// `install_queue(requested, deep?, recursive?, relaxed?, build_deps?)`
    /// (spec.md §4.4).
    pub async fn install_queue(&self, requested: &[Candidate], options: Options) -> Result<Queue, Error> {
        let mut dag: Dag<Candidate> = Dag::new();
        let mut insertion_order = Vec::new();
        let mut seen: HashSet<Candidate> = HashSet::new();
        let mut frontier: Vec<Candidate> = requested.to_vec();

        for candidate in requested {
            dag.add_node_or_get_index(candidate.clone());
            insertion_order.push(candidate.clone());
            seen.insert(candidate.clone());
        }

        let mut depth = 0usize;
        loop {
            if frontier.is_empty() {
                break;
            }
            // Non-recursive installs only pull the direct dependencies of
            // the requested set; anything past depth 1 is skipped.
            if depth > 0 && !options.recursive {
                break;
            }
            depth += 1;

            let mut next = Vec::new();
            for candidate in &frontier {
                let record = self.fetch(candidate).await?;
                let node = dag.add_node_or_get_index(candidate.clone());

                for dep in &record.dependencies {
                    if dep.blocker.is_some() {
                        continue;
                    }
                    let resolved = self.resolve(dep, &options).await?;
                    let dep_node = dag.add_node_or_get_index(resolved.clone());
                    if seen.insert(resolved.clone()) {
                        insertion_order.push(resolved.clone());
                        next.push(resolved.clone());
                    }
                    // Edge dependency -> dependent: spec.md §4.4 step 4
                    // orders B before A for "A depends on B".
                    dag.add_edge_allow_cycle(dep_node, node);
                }

                if options.deep {
                    self.pull_deep_upgrade_candidates(candidate, &mut dag, &mut seen, &mut insertion_order, &mut next)
                        .await?;
                }
            }
            frontier = next;
        }

        let candidates: Vec<Candidate> = dag.iter_nodes().cloned().collect();
        self.detect_collisions(&candidates, &options).await?;

        let (ordered, broken) = dag.toposort_breaking_cycles(&insertion_order);
        for edge in &broken {
            log::warn!("dependency cycle broken: {:?} -> {:?}", edge.from, edge.to);
        }

        let removal_seq = self.displaced_and_conflicting(&candidates).await?;

        Ok(Queue {
            install_seq: ordered,
            removal_seq,
            broken_cycles: broken.into_iter().map(|e| (e.from, e.to)).collect(),
        })
    }

    /// `reverse_queue(targets) -> seq | NotRemovableError` (spec.md §4.4).
    pub async fn reverse_queue(&self, targets: &[Id], system_packages: bool) -> Result<Vec<Id>, Error> {
        for &target in targets {
            let record = self.installed.get(target).await?;
            if record.system_critical && !system_packages {
                let atom = record.atom.to_atom().map(|a| a.to_string()).unwrap_or_default();
                return Err(NotRemovableError(atom).into());
            }
        }

        let mut dag: Dag<Id> = Dag::new();
        let all = self.installed.all_ids().await?;
        for id in &all {
            dag.add_node_or_get_index(*id);
        }
        for id in &all {
            for dependent in self.installed.retrieve_depends(*id).await? {
                // dependent depends on id: edge id -> dependent, so walking
                // outgoing edges from a target reaches everything that
                // (transitively) depends on it.
                let a = dag.add_node_or_get_index(*id);
                let b = dag.add_node_or_get_index(dependent);
                dag.add_edge_allow_cycle(a, b);
            }
        }

        // Dependents must be removed before the dependency they rely on,
        // the reverse of install order: transpose the extracted reachable
        // set so topo sort yields dependents first.
        let reachable = dag.subgraph(targets);
        let insertion_order: Vec<Id> = reachable.iter_nodes().copied().collect();
        let removal_graph = reachable.transpose();
        let (ordered, _) = removal_graph.toposort_breaking_cycles(&insertion_order);
        Ok(ordered)
    }

    /// `orphaned() -> (manual_review, safe_to_remove)` (spec.md §4.4).
    pub async fn orphaned(&self) -> Result<Orphaned, Error> {
        let flagged = self.installed.all_ids_with_flags().await?;
        let roots: Vec<Id> = flagged
            .iter()
            .filter(|(_, system_critical, source)| *system_critical || *source == store::InstallSource::Explicit)
            .map(|(id, _, _)| *id)
            .collect();

        let mut dag: Dag<Id> = Dag::new();
        for (id, _, _) in &flagged {
            dag.add_node_or_get_index(*id);
        }
        for (id, _, _) in &flagged {
            for dependency_id in self.forward_installed_dependencies(*id).await? {
                let a = dag.add_node_or_get_index(*id);
                let b = dag.add_node_or_get_index(dependency_id);
                dag.add_edge_allow_cycle(a, b);
            }
        }

        let reachable: HashSet<Id> = dag.subgraph(&roots).iter_nodes().copied().collect();

        let mut manual_review = Vec::new();
        let mut safe_to_remove = Vec::new();
        for (id, system_critical, source) in &flagged {
            if reachable.contains(id) {
                continue;
            }
            if *system_critical || *source == store::InstallSource::Explicit {
                manual_review.push(*id);
            } else {
                safe_to_remove.push(*id);
            }
        }

        Ok(Orphaned {
            manual_review,
            safe_to_remove,
        })
    }

    /// Disk-space pre-flight (spec.md §4.4): fail fast before any artifact
    /// is downloaded if either target filesystem lacks headroom. Unpack
    /// needs `unpack_size * 1.5`.
    pub fn check_disk_space(
        download_needed: u64,
        download_available: u64,
        unpack_size: u64,
        unpack_available: u64,
    ) -> Result<(), DiskFullError> {
        if download_needed > download_available {
            return Err(DiskFullError::Download {
                needed: download_needed,
                available: download_available,
            });
        }
        let unpack_needed = unpack_size.saturating_mul(3) / 2;
        if unpack_needed > unpack_available {
            return Err(DiskFullError::Unpack {
                needed: unpack_needed,
                available: unpack_available,
            });
        }
        Ok(())
    }

    async fn fetch(&self, candidate: &Candidate) -> Result<store::Record, Error> {
        let record = match &candidate.repository_id {
            None => self.installed.get(candidate.package_id).await?,
            Some(repository_id) => {
                let entry = self
                    .repositories
                    .get(repository_id)
                    .ok_or_else(|| NotFoundError(repository_id.clone()))?;
                entry.database.get(candidate.package_id).await?
            }
        };
        Ok(record)
    }

    async fn resolve(&self, dep: &Dependency, _options: &Options) -> Result<Candidate, Error> {
        let slot = dep.atom.slot.as_deref();
        let tag = dep.atom.tag.as_deref();

        if let Some((repository_id, id)) = self.repositories.atom_match(dep, slot, tag, Some(self.installed)).await? {
            return Ok(Candidate {
                repository_id,
                package_id: id,
            });
        }

        Err(NotFoundError(dep.atom.to_string()).into())
    }

    /// `deep`: re-resolve a candidate's already-satisfied dependencies
    /// against the available repositories even when the installed store
    /// already satisfies them, so an older installed dependency is
    /// considered for upgrade rather than silently kept (SPEC_FULL.md §4
    /// note on generalizing teacher's forward-only transaction).
    async fn pull_deep_upgrade_candidates(
        &self,
        candidate: &Candidate,
        dag: &mut Dag<Candidate>,
        seen: &mut HashSet<Candidate>,
        insertion_order: &mut Vec<Candidate>,
        next: &mut Vec<Candidate>,
    ) -> Result<(), Error> {
        let record = self.fetch(candidate).await?;
        for dep in &record.dependencies {
            if dep.blocker.is_some() {
                continue;
            }
            let Some((repository_id, id)) = self
                .repositories
                .atom_match(dep, dep.atom.slot.as_deref(), dep.atom.tag.as_deref(), None)
                .await?
            else {
                continue;
            };
            let upgrade_candidate = Candidate {
                repository_id,
                package_id: id,
            };
            if seen.insert(upgrade_candidate.clone()) {
                dag.add_node_or_get_index(upgrade_candidate.clone());
                insertion_order.push(upgrade_candidate.clone());
                next.push(upgrade_candidate);
            }
        }
        Ok(())
    }

    async fn detect_collisions(&self, candidates: &[Candidate], options: &Options) -> Result<(), Error> {
        let mut by_key_slot: std::collections::HashMap<atom::KeySlot, Candidate> = std::collections::HashMap::new();
        let mut records = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            let record = self.fetch(candidate).await?;
            let Ok(atom) = record.atom.to_atom() else {
                records.push(record);
                continue;
            };
            let key_slot = atom::key_slot(&atom);

            if let Some(existing) = by_key_slot.get(&key_slot) {
                if existing.package_id != candidate.package_id {
                    let is_installed_upgrade_pair = options.relaxed
                        && (existing.repository_id.is_none() || candidate.repository_id.is_none());
                    if !is_installed_upgrade_pair {
                        return Err(CollisionError::KeySlot {
                            a: existing.clone(),
                            b: candidate.clone(),
                            key: key_slot.0.to_string(),
                            slot: key_slot.1,
                        }
                        .into());
                    }
                }
            } else {
                by_key_slot.insert(key_slot, candidate.clone());
            }
            records.push(record);
        }

        for (i, a) in candidates.iter().enumerate() {
            for (j, b) in candidates.iter().enumerate().skip(i + 1) {
                if a.package_id == b.package_id {
                    continue;
                }
                let (Ok(atom_a), Ok(atom_b)) = (records[i].atom.to_atom(), records[j].atom.to_atom()) else {
                    continue;
                };
                if atom::key_slot(&atom_a) == atom::key_slot(&atom_b) {
                    continue;
                }
                let paths_a: HashSet<_> = records[i].content.iter().map(|c| c.path.clone()).collect();
                if let Some(overlap) = records[j].content.iter().find(|c| paths_a.contains(&c.path)) {
                    return Err(CollisionError::ContentOverlap {
                        a: a.clone(),
                        b: b.clone(),
                        path: overlap.path.to_string_lossy().into_owned(),
                    }
                    .into());
                }
            }
        }

        Ok(())
    }

    /// Packages displaced by same-(key,slot) replacement, plus conflicting
    /// installed packages (spec.md §4.4 step 5 / §4.6 `remove_conflicts`).
    async fn displaced_and_conflicting(&self, candidates: &[Candidate]) -> Result<Vec<Candidate>, Error> {
        let mut removals = Vec::new();

        for candidate in candidates {
            let record = self.fetch(candidate).await?;
            if candidate.repository_id.is_some() {
                if let Ok(existing) = self
                    .installed
                    .find_by_key_slot(&record.atom.category, &record.atom.name, record.atom.slot.as_deref())
                    .await
                {
                    if let Some(existing_id) = existing {
                        if existing_id != candidate.package_id {
                            removals.push(Candidate::installed(existing_id));
                        }
                    }
                }
            }

            for conflict in &record.conflicts {
                if let store::MatchOutcome::Matched(id) =
                    self.installed.atom_match(conflict, conflict.atom.slot.as_deref(), conflict.atom.tag.as_deref()).await?
                {
                    let target = self.installed.get(id).await?;
                    if target.system_critical {
                        let atom = target.atom.to_atom().map(|a| a.to_string()).unwrap_or_default();
                        return Err(NotRemovableError(atom).into());
                    }
                    removals.push(Candidate::installed(id));
                }
            }
        }

        removals.dedup_by(|a, b| a.package_id == b.package_id && a.repository_id == b.repository_id);
        Ok(removals)
    }

    async fn forward_installed_dependencies(&self, id: Id) -> Result<Vec<Id>, Error> {
        let record = self.installed.get(id).await?;
        let mut out = Vec::new();
        for dep in &record.dependencies {
            if dep.blocker.is_some() {
                continue;
            }
            if let store::MatchOutcome::Matched(dep_id) =
                self.installed.atom_match(dep, dep.atom.slot.as_deref(), dep.atom.tag.as_deref()).await?
            {
                out.push(dep_id);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::package::{AtomFields, Record};
    use store::repository::RepositoryEntry;

    fn record(category: &str, name: &str, version: &str, deps: &[&str]) -> Record {
        Record {
            atom: AtomFields {
                category: category.into(),
                name: name.into(),
                version: Some(version.into()),
                revision: 0,
                slot: None,
                tag: None,
            },
            dependencies: deps.iter().map(|d| Dependency::parse(d).unwrap()).collect(),
            content: vec![store::package::ContentEntry {
                path: format!("/bin/{name}").into(),
                kind: store::package::Kind::File,
                mtime: None,
                sha256: None,
            }],
            ..Default::default()
        }
    }

    async fn repo_with(records: Vec<Record>) -> Database {
        let db = Database::open_memory().await.unwrap();
        for r in records {
            db.handle_package(r).await.unwrap();
        }
        db
    }

    #[tokio::test]
    async fn install_queue_orders_dependency_before_dependent() {
        let available = repo_with(vec![record("sys", "bar", "1.0", &[]), record("app", "foo", "1.0", &["sys/bar"])]).await;
        let installed = Database::open_memory().await.unwrap();

        let mut repos = RepositorySet::new();
        repos.add(
            "main",
            RepositoryEntry {
                database: available.clone(),
                artifact_url_pattern: String::new(),
                priority: 0,
                preferred: false,
            },
        );

        let foo_id = available.find_by_key_slot("app", "foo", None).await.unwrap().unwrap();
        let requested = vec![Candidate {
            repository_id: Some("main".into()),
            package_id: foo_id,
        }];

        let solver = Solver::new(&repos, &installed);
        let queue = solver
            .install_queue(&requested, Options { recursive: true, ..Default::default() })
            .await
            .unwrap();

        let names: Vec<String> = {
            let mut out = Vec::new();
            for c in &queue.install_seq {
                let r = solver.fetch(c).await.unwrap();
                out.push(r.atom.name);
            }
            out
        };
        assert_eq!(names, vec!["bar", "foo"]);
    }

    #[tokio::test]
    async fn install_queue_fails_on_missing_dependency() {
        let available = repo_with(vec![record("app", "foo", "1.0", &["sys/bar"])]).await;
        let installed = Database::open_memory().await.unwrap();

        let mut repos = RepositorySet::new();
        repos.add(
            "main",
            RepositoryEntry {
                database: available.clone(),
                artifact_url_pattern: String::new(),
                priority: 0,
                preferred: false,
            },
        );

        let foo_id = available.find_by_key_slot("app", "foo", None).await.unwrap().unwrap();
        let requested = vec![Candidate {
            repository_id: Some("main".into()),
            package_id: foo_id,
        }];

        let solver = Solver::new(&repos, &installed);
        let err = solver
            .install_queue(&requested, Options { recursive: true, ..Default::default() })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn reverse_queue_refuses_system_critical() {
        let installed = Database::open_memory().await.unwrap();
        let mut r = record("sys", "libc", "1.0", &[]);
        r.system_critical = true;
        let id = installed.handle_package(r).await.unwrap();

        let repos = RepositorySet::new();
        let solver = Solver::new(&repos, &installed);

        let err = solver.reverse_queue(&[id], false).await.unwrap_err();
        assert!(matches!(err, Error::NotRemovable(_)));

        assert!(solver.reverse_queue(&[id], true).await.is_ok());
    }

    #[tokio::test]
    async fn disk_space_check_applies_unpack_multiplier() {
        assert!(Solver::check_disk_space(100, 100, 100, 149).is_err());
        assert!(Solver::check_disk_space(100, 100, 100, 150).is_ok());
    }

    #[tokio::test]
    async fn orphaned_splits_unreachable_by_critical_flag() {
        let installed = Database::open_memory().await.unwrap();

        let mut root = record("app", "editor", "1.0", &["sys/libfoo"]);
        root.install_source = store::InstallSource::Explicit;
        installed.handle_package(root).await.unwrap();

        let mut dep = record("sys", "libfoo", "1.0", &[]);
        dep.install_source = store::InstallSource::Dependency;
        installed.handle_package(dep).await.unwrap();

        let mut orphan = record("app", "forgotten", "1.0", &[]);
        orphan.install_source = store::InstallSource::Dependency;
        installed.handle_package(orphan).await.unwrap();

        let repos = RepositorySet::new();
        let solver = Solver::new(&repos, &installed);
        let orphaned = solver.orphaned().await.unwrap();

        assert_eq!(orphaned.safe_to_remove.len(), 1);
        assert!(orphaned.manual_review.is_empty());
    }
}
