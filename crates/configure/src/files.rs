// SPDX-License-Identifier: MPL-2.0

use std::path::{Path, PathBuf};

use fs_err::tokio as fs;
use md5::{Digest, Md5};
use thiserror::Error;

const STASH_PREFIX: &str = "._cfg";

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("destination has no parent directory: {0:?}")]
    NoParent(PathBuf),
}

/// A pending configuration update: a stashed file sitting beside the live
/// file it would have overwritten (spec.md §4.8).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationUpdate {
    pub live_path: PathBuf,
    pub stash_path: PathBuf,
}

/// Scans one or more known directories for stashed configuration updates
/// and manages them (spec.md §4.8: `merge`, `discard`, `diff`).
#[derive(Debug, Clone)]
pub struct ConfigurationFiles {
    roots: Vec<PathBuf>,
}

impl ConfigurationFiles {
    pub fn new(roots: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            roots: roots.into_iter().collect(),
        }
    }

    /// Writes `new_content` beside `dest` under a reserved stash name
    /// (`._cfgNNNN_<original-name>`), leaving `dest` untouched. The
    /// counter is the lowest unused value for this destination in its
    /// directory, so repeated stashes of the same file accumulate rather
    /// than collide.
    pub async fn stash(&self, dest: &Path, new_content: &[u8]) -> Result<ConfigurationUpdate, Error> {
        let dir = dest.parent().ok_or_else(|| Error::NoParent(dest.to_path_buf()))?;
        let name = dest
            .file_name()
            .ok_or_else(|| Error::NoParent(dest.to_path_buf()))?
            .to_string_lossy()
            .into_owned();

        let counter = self.next_counter(dir, &name).await?;
        let stash_path = dir.join(format!("{STASH_PREFIX}{counter:04}_{name}"));
        fs::write(&stash_path, new_content).await?;

        Ok(ConfigurationUpdate {
            live_path: dest.to_path_buf(),
            stash_path,
        })
    }

    async fn next_counter(&self, dir: &Path, original_name: &str) -> Result<u32, Error> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };

        let mut max_seen = None;
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if let Some((counter, original)) = parse_stash_name(&name) {
                if original == original_name {
                    max_seen = Some(max_seen.map_or(counter, |m: u32| m.max(counter)));
                }
            }
        }
        Ok(max_seen.map_or(0, |m| m + 1))
    }

    /// Recursively walks every configured root, returning every pending
    /// stash found.
    pub async fn pending(&self) -> Result<Vec<ConfigurationUpdate>, Error> {
        let mut updates = Vec::new();
        for root in &self.roots {
            self.walk(root.clone(), &mut updates).await?;
        }
        Ok(updates)
    }

    async fn walk(&self, root: PathBuf, updates: &mut Vec<ConfigurationUpdate>) -> Result<(), Error> {
        let mut stack = vec![root];
        while let Some(current) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&current).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(path);
                    continue;
                }

                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if let Some((_, original)) = parse_stash_name(name) {
                    let live_path = path.parent().map(|p| p.join(original)).unwrap_or_else(|| PathBuf::from(name));
                    updates.push(ConfigurationUpdate {
                        live_path,
                        stash_path: path,
                    });
                }
            }
        }
        Ok(())
    }

    /// Accepts the stashed content: renames it over the live file.
    pub async fn merge(&self, update: &ConfigurationUpdate) -> Result<(), Error> {
        fs::rename(&update.stash_path, &update.live_path).await?;
        Ok(())
    }

    /// Rejects the stashed content: deletes it, keeping the live file
    /// untouched.
    pub async fn discard(&self, update: &ConfigurationUpdate) -> Result<(), Error> {
        fs::remove_file(&update.stash_path).await?;
        Ok(())
    }

    /// Returns the stash path for a pending update so a caller can run
    /// its own diff against the live file.
    pub fn diff(&self, update: &ConfigurationUpdate) -> PathBuf {
        update.stash_path.clone()
    }

    /// MD5 digest of a file's current content, for comparison against the
    /// automerge digest recorded at last install (spec.md §4.8).
    pub async fn digest(path: &Path) -> Result<String, Error> {
        let bytes = fs::read(path).await?;
        let mut hasher = Md5::new();
        hasher.update(&bytes);
        Ok(hex::encode(hasher.finalize()))
    }
}

fn parse_stash_name(filename: &str) -> Option<(u32, String)> {
    let rest = filename.strip_prefix(STASH_PREFIX)?;
    let underscore = rest.find('_')?;
    let (digits, rest) = rest.split_at(underscore);
    let counter: u32 = digits.parse().ok()?;
    let original = rest.strip_prefix('_')?.to_string();
    Some((counter, original))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("configure-test-{}-{}", std::process::id(), name));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn parses_well_formed_stash_names() {
        assert_eq!(parse_stash_name("._cfg0000_bar.conf"), Some((0, "bar.conf".to_string())));
        assert_eq!(parse_stash_name("._cfg0042_a_b.conf"), Some((42, "a_b.conf".to_string())));
    }

    #[test]
    fn rejects_names_without_the_prefix() {
        assert_eq!(parse_stash_name("bar.conf"), None);
        assert_eq!(parse_stash_name("._cfgXXXX_bar.conf"), None);
    }

    #[tokio::test]
    async fn stash_uses_incrementing_counter_per_destination() {
        let dir = scratch_dir("counter");
        let dest = dir.join("bar.conf");
        std::fs::write(&dest, b"live").unwrap();

        let files = ConfigurationFiles::new([dir.clone()]);
        let first = files.stash(&dest, b"new-1").await.unwrap();
        let second = files.stash(&dest, b"new-2").await.unwrap();

        assert_ne!(first.stash_path, second.stash_path);
        assert!(first.stash_path.file_name().unwrap().to_str().unwrap().starts_with("._cfg0000_"));
        assert!(second.stash_path.file_name().unwrap().to_str().unwrap().starts_with("._cfg0001_"));
        assert_eq!(std::fs::read(&dest).unwrap(), b"live");
    }

    #[tokio::test]
    async fn pending_finds_stashes_recursively() {
        let dir = scratch_dir("pending");
        let nested = dir.join("etc").join("sub");
        std::fs::create_dir_all(&nested).unwrap();
        let dest = nested.join("bar.conf");
        std::fs::write(&dest, b"live").unwrap();

        let files = ConfigurationFiles::new([dir.clone()]);
        let update = files.stash(&dest, b"new").await.unwrap();

        let pending = files.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].stash_path, update.stash_path);
        assert_eq!(pending[0].live_path, dest);
    }

    #[tokio::test]
    async fn merge_replaces_live_file_with_stash() {
        let dir = scratch_dir("merge");
        let dest = dir.join("bar.conf");
        std::fs::write(&dest, b"live").unwrap();

        let files = ConfigurationFiles::new([dir.clone()]);
        let update = files.stash(&dest, b"new").await.unwrap();
        files.merge(&update).await.unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"new");
        assert!(!update.stash_path.exists());
    }

    #[tokio::test]
    async fn discard_removes_stash_and_keeps_live_file() {
        let dir = scratch_dir("discard");
        let dest = dir.join("bar.conf");
        std::fs::write(&dest, b"live").unwrap();

        let files = ConfigurationFiles::new([dir.clone()]);
        let update = files.stash(&dest, b"new").await.unwrap();
        files.discard(&update).await.unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"live");
        assert!(!update.stash_path.exists());
    }

    #[tokio::test]
    async fn digest_matches_known_md5() {
        let dir = scratch_dir("digest");
        let path = dir.join("bar.conf");
        std::fs::write(&path, b"hello world").unwrap();

        let digest = ConfigurationFiles::digest(&path).await.unwrap();
        assert_eq!(digest, "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }
}
