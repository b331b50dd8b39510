// SPDX-License-Identifier: MPL-2.0

//! Preserved Libraries Manager (spec.md §4.7, C7): retains shared
//! libraries that `install_clean` is about to delete while any still-
//! installed package references their soname, and garbage-collects them
//! once nothing needs them anymore. Generalizes the teacher's
//! `client::prune` state-vs-package reference counting
//! (`examples/serpent-os-tools/moss/src/client/prune.rs`) to soname-vs-
//! installed-package reference counting.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use fs_err::tokio::{self as fs};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const REGISTRY_FILE: &str = "registry.json";

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("registry serialization: {0}")]
    Json(#[from] serde_json::Error),
    #[error("store: {0}")]
    Store(#[from] store::Error),
}

/// A retained library: `(soname, original-path, preserving-package-id)`
/// (spec.md §4.7).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Entry {
    pub soname: String,
    pub original_path: PathBuf,
    pub preserving_package_id: i64,
}

impl Entry {
    pub fn preserving_package_id(&self) -> store::Id {
        store::Id(self.preserving_package_id)
    }
}

/// On-disk registry of preserved libraries, keyed by soname. Keying by
/// soname, rather than appending a record per preservation event, is what
/// fixes the reappearing-soname bug noted in SPEC_FULL.md §13: a later
/// `retain` for the same soname updates the existing entry in place
/// instead of leaving a stale duplicate that points at a path the new
/// install has already overwritten.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    entries: HashMap<String, Entry>,
}

pub struct Registry {
    preserved_dir: PathBuf,
    file: RegistryFile,
}

impl Registry {
    /// Loads the registry from `preserved_dir`, creating an empty one if
    /// no registry file exists there yet.
    pub async fn load(preserved_dir: impl Into<PathBuf>) -> Result<Self, Error> {
        let preserved_dir = preserved_dir.into();
        fs::create_dir_all(&preserved_dir).await?;

        let registry_path = preserved_dir.join(REGISTRY_FILE);
        let file = match fs::read(&registry_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => RegistryFile::default(),
            Err(err) => return Err(err.into()),
        };

        Ok(Self { preserved_dir, file })
    }

    async fn persist(&self) -> Result<(), Error> {
        let bytes = serde_json::to_vec_pretty(&self.file)?;
        fs::write(self.preserved_dir.join(REGISTRY_FILE), bytes).await?;
        Ok(())
    }

    /// Deterministic on-disk location for a preserved soname.
    fn preserved_path(&self, soname: &str) -> PathBuf {
        self.preserved_dir.join(soname)
    }

    /// Retains a library about to be deleted: moves `original_path` (its
    /// current location) into the preserved-libs directory and records
    /// the entry. If `soname` is already preserved, the existing entry is
    /// updated in place and the on-disk copy is refreshed from
    /// `original_path` rather than left stale.
    pub async fn retain(
        &mut self,
        soname: &str,
        original_path: &Path,
        preserving_package_id: store::Id,
    ) -> Result<PathBuf, Error> {
        let dest = self.preserved_path(soname);
        fs::rename(original_path, &dest).await?;

        self.file.entries.insert(
            soname.to_string(),
            Entry {
                soname: soname.to_string(),
                original_path: original_path.to_path_buf(),
                preserving_package_id: preserving_package_id.0,
            },
        );
        self.persist().await?;
        Ok(dest)
    }

    /// Where a preserved soname currently lives on disk, if it is retained.
    pub fn location(&self, soname: &str) -> Option<PathBuf> {
        self.file.entries.get(soname).map(|_| self.preserved_path(soname))
    }

    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.file.entries.values()
    }

    /// The `preserved_libs_gc` phase (spec.md §4.7): removes and physically
    /// deletes every entry whose soname is no longer needed by any
    /// installed package. Returns the entries that were collected.
    pub async fn gc(&mut self, installed: &store::Database) -> Result<Vec<Entry>, Error> {
        let mut collected = Vec::new();
        let entries = std::mem::take(&mut self.file.entries);

        for (soname, entry) in entries {
            let consumers = installed.packages_needing_soname(&soname).await?;
            if consumers.is_empty() {
                let path = self.preserved_path(&soname);
                match fs::remove_file(&path).await {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
                log::info!("garbage collected preserved library {soname}");
                collected.push(entry);
            } else {
                self.file.entries.insert(soname, entry);
            }
        }

        self.persist().await?;
        Ok(collected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("preserve-test-{}-{}", std::process::id(), name));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn retain_moves_file_and_records_entry() {
        let work = scratch_dir("retain");
        let original = work.join("libbaz.so.1");
        std::fs::write(&original, b"elf").unwrap();

        let mut registry = Registry::load(work.join("preserved")).await.unwrap();
        let dest = registry.retain("libbaz.so.1", &original, store::Id(42)).await.unwrap();

        assert!(!original.exists());
        assert!(dest.exists());
        assert_eq!(registry.location("libbaz.so.1"), Some(dest));
        assert_eq!(registry.entries().count(), 1);
    }

    #[tokio::test]
    async fn retain_reuses_entry_on_soname_reappearance() {
        let work = scratch_dir("reappear");
        let first = work.join("first").join("libbaz.so.1");
        std::fs::create_dir_all(first.parent().unwrap()).unwrap();
        std::fs::write(&first, b"v1").unwrap();

        let mut registry = Registry::load(work.join("preserved")).await.unwrap();
        registry.retain("libbaz.so.1", &first, store::Id(1)).await.unwrap();

        let second = work.join("second").join("libbaz.so.1");
        std::fs::create_dir_all(second.parent().unwrap()).unwrap();
        std::fs::write(&second, b"v2").unwrap();
        registry.retain("libbaz.so.1", &second, store::Id(2)).await.unwrap();

        // Exactly one entry survives, now pointing at the second owner,
        // rather than a stale duplicate left over from the first retain.
        assert_eq!(registry.entries().count(), 1);
        let entry = registry.entries().next().unwrap();
        assert_eq!(entry.preserving_package_id(), store::Id(2));
        assert_eq!(entry.original_path, second);

        let preserved = registry.location("libbaz.so.1").unwrap();
        assert_eq!(std::fs::read(preserved).unwrap(), b"v2");
    }

    #[tokio::test]
    async fn load_persists_across_instances() {
        let work = scratch_dir("persist");
        let original = work.join("libfoo.so.2");
        std::fs::write(&original, b"elf").unwrap();

        let preserved_dir = work.join("preserved");
        let mut registry = Registry::load(&preserved_dir).await.unwrap();
        registry.retain("libfoo.so.2", &original, store::Id(7)).await.unwrap();
        drop(registry);

        let reloaded = Registry::load(&preserved_dir).await.unwrap();
        assert_eq!(reloaded.entries().count(), 1);
        assert!(reloaded.location("libfoo.so.2").is_some());
    }
}
