// SPDX-License-Identifier: MPL-2.0

//! The explicit context value threaded through every operation (spec.md §9
//! design note: "re-architect [the singleton client] as an explicit context
//! value"), generalized from the teacher's own `Client` (`examples/
//! serpent-os-tools/crates/moss/src/client/mod.rs`): one struct bundling the
//! installed store, the repository set, the resource lock, the fetcher, and
//! the C7/C8/trigger collaborators, built once at startup by [`Context::open`].

use std::path::{Path, PathBuf};

use store::repository::RepositorySet;
use tokio::sync::Mutex;

use crate::config::Settings;
use crate::Error;

/// Filesystem layout under one entropy root (spec.md §6 "On-disk state").
#[derive(Debug, Clone)]
pub struct Paths {
    pub root: PathBuf,
    pub cache_dir: PathBuf,
    pub unpack_root: PathBuf,
    pub preserved_libs_dir: PathBuf,
    pub locks_dir: PathBuf,
    pub triggers_dir: PathBuf,
}

impl Paths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            cache_dir: root.join("var/cache/entropy/packages"),
            unpack_root: root.join("var/cache/entropy/unpack"),
            preserved_libs_dir: root.join("var/lib/entropy/preserved"),
            locks_dir: root.join("var/lib/entropy/locks"),
            triggers_dir: root.join("usr/share/entropy/triggers"),
            root,
        }
    }

    /// `<unpack-root>/<sanitized-download-path>/image/` (spec.md §6): `:`
    /// and `~` are replaced with `_` since they are meaningful separators in
    /// an atom string and would otherwise make an unsafe path component.
    pub fn image_dir(&self, download_path: &str) -> PathBuf {
        let sanitized: String = download_path.chars().map(|c| if c == ':' || c == '~' { '_' } else { c }).collect();
        self.unpack_root.join(sanitized).join("image")
    }

    pub fn installed_db_path(&self) -> PathBuf {
        self.root.join("var/lib/entropy/installed.db")
    }
}

/// Everything one action phase list needs, built once per process (or once
/// per ephemeral root, mirroring the teacher's `Client::ephemeral`).
pub struct Context {
    pub paths: Paths,
    pub installed: store::Database,
    pub repositories: RepositorySet,
    pub lock: lock::ResourceLock,
    pub fetcher: fetch::Fetcher,
    pub preserved: Mutex<preserve::Registry>,
    pub settings: Settings,
    pub triggers: triggers::Registry,
}

impl Context {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let paths = Paths::new(root);

        if let Some(parent) = paths.installed_db_path().parent() {
            fs_err::tokio::create_dir_all(parent).await?;
        }
        let installed = store::Database::open(paths.installed_db_path(), false).await?;

        let settings = Settings::load(&paths.root).await;

        let lock = lock::ResourceLock::open(lock::resource_path(&paths.locks_dir, "root"))?;
        let fetcher = fetch::Fetcher::new(&paths.cache_dir);
        let preserved = Mutex::new(preserve::Registry::load(&paths.preserved_libs_dir).await?);
        let triggers = triggers::Registry::load(&paths.triggers_dir).await?;

        Ok(Self {
            paths,
            installed,
            repositories: RepositorySet::new(),
            lock,
            fetcher,
            preserved,
            settings,
            triggers,
        })
    }

    pub fn configuration_files(&self) -> configure::ConfigurationFiles {
        configure::ConfigurationFiles::new(self.settings.protection_roots())
    }

    pub fn root(&self) -> &Path {
        &self.paths.root
    }
}
