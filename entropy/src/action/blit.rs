// SPDX-License-Identifier: MPL-2.0

//! Image→root merge (spec.md §4.6 "the core of `install`"). Walks an
//! unpacked package image and blits it onto the live filesystem, handling
//! stale symlinks, symlinked directories, split-debug exclusion, collision
//! detection and C8 configuration protection along the way.
//!
//! Grounded on `original_source/lib/entropy/client/interfaces/package/
//! actions/install.py`'s `workout_subdir`/`workout_file` closures for the
//! decision tree, and on the teacher's own `tokio::fs`-based directory
//! walking (`examples/serpent-os-tools/crates/moss/src/client/mod.rs`'s
//! `blit_root`/`blit_element`, which walks a `vfs::tree::Tree` rather than a
//! live directory — this walks the image directory directly instead, since
//! this system builds no intermediate tree structure).

use std::collections::{BTreeSet, HashMap};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use configure::{Classification, ConfigurationFiles, ConfigurationUpdate, Decision, ProtectionRules};
use md5::{Digest, Md5};

use crate::Error;

const SPLITDEBUG_PREFIX: &str = "usr/lib/debug";
const INFO_DIR_NAME: &str = "info";
const INFO_EXTENSION: &str = "info";

/// Everything observed while merging one package's image into the live
/// filesystem, needed by the phases above `install` (spec.md §4.6: filter
/// the recorded content file, write the automerge table, surface pending
/// `ConfigurationUpdate`s).
#[derive(Debug, Default)]
pub struct BlitReport {
    pub affected_directories: BTreeSet<PathBuf>,
    pub affected_infofiles: BTreeSet<PathBuf>,
    /// Relative paths dropped from the content set before it's recorded —
    /// split-debug skips today, per spec.md §4.6's "filter the recorded
    /// content file" step.
    pub items_not_installed: Vec<PathBuf>,
    pub configuration_updates: Vec<ConfigurationUpdate>,
    /// destination path (as recorded in the live filesystem) -> md5 of the
    /// content now live there, for every config-protected destination that
    /// was overwritten this pass.
    pub automerge_files: HashMap<String, String>,
}

pub struct Blitter<'a> {
    pub live_root: &'a Path,
    pub protection: &'a ProtectionRules,
    pub configuration_files: &'a ConfigurationFiles,
    pub installed: &'a store::Database,
    /// The installed package being replaced, if any: exempt from the
    /// collision check since its own files are expected to be overwritten.
    pub replaced_package: Option<store::Id>,
    /// The previously-recorded automerge digests for the package being
    /// replaced, keyed by destination path — the comparison baseline for
    /// C8's automerge decision.
    pub recorded_digests: &'a HashMap<String, String>,
    pub strict_collisions: bool,
    pub splitdebug: bool,
}

impl<'a> Blitter<'a> {
    /// Walks `image_root` and merges it onto `self.live_root`.
    pub async fn merge(&self, image_root: &Path) -> Result<BlitReport, Error> {
        let mut report = BlitReport::default();
        let mut stack = vec![PathBuf::new()];

        while let Some(rel_dir) = stack.pop() {
            let image_dir = image_root.join(&rel_dir);
            let mut entries = tokio::fs::read_dir(&image_dir).await?;

            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                let rel = rel_dir.join(&name);
                let image_path = image_root.join(&rel);
                let live_path = self.live_root.join(&rel);

                let meta = tokio::fs::symlink_metadata(&image_path).await?;

                if meta.is_dir() {
                    self.blit_directory(&live_path, &image_path).await?;
                    stack.push(rel);
                } else if meta.file_type().is_symlink() {
                    self.blit_symlink_dir_or_file(&rel, &image_path, &live_path, &mut report).await?;
                } else {
                    self.blit_file(&rel, &image_path, &live_path, &mut report).await?;
                }
            }
        }

        Ok(report)
    }

    /// Handles one directory entry in the image tree (spec.md §4.6 "For
    /// each directory encountered").
    async fn blit_directory(&self, live_path: &Path, image_path: &Path) -> Result<(), Error> {
        match tokio::fs::symlink_metadata(live_path).await {
            Ok(meta) if meta.file_type().is_symlink() => {
                // Stale if the symlink's target doesn't resolve.
                if tokio::fs::metadata(live_path).await.is_err() {
                    log::warn!("removing stale symlink at {live_path:?} to make way for a directory");
                    tokio::fs::remove_file(live_path).await?;
                    tokio::fs::create_dir(live_path).await?;
                }
                // else: a live symlink to a real directory stands in for it;
                // children are written straight through it.
            }
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                log::warn!("removing file at {live_path:?} where a directory is expected");
                tokio::fs::remove_file(live_path).await?;
                tokio::fs::create_dir(live_path).await?;
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::create_dir(live_path).await?;
            }
            Err(err) => return Err(err.into()),
        }

        replicate_ownership(image_path, live_path).await;
        Ok(())
    }

    /// A symlinked directory or a plain symlink leaf encountered in the
    /// image. Directory-symlinks are replicated and replace any live
    /// directory of the same name (spec.md §4.6); leaf symlinks go through
    /// the same collision/protection/atomic-move handling as regular files.
    async fn blit_symlink_dir_or_file(
        &self,
        rel: &Path,
        image_path: &Path,
        live_path: &Path,
        report: &mut BlitReport,
    ) -> Result<(), Error> {
        // Disambiguate "symlinked directory" from "symlink leaf file" by
        // whether the image symlink's target is itself a directory.
        let points_at_dir = tokio::fs::metadata(image_path).await.map(|m| m.is_dir()).unwrap_or(false);

        if points_at_dir {
            if let Ok(meta) = tokio::fs::symlink_metadata(live_path).await {
                if meta.is_dir() && !meta.file_type().is_symlink() {
                    log::warn!("replacing live directory {live_path:?} with a symlink from the package image");
                    tokio::fs::remove_dir_all(live_path).await?;
                } else {
                    tokio::fs::remove_file(live_path).await?;
                }
            }
            let target = tokio::fs::read_link(image_path).await?;
            tokio::fs::symlink(&target, live_path).await?;
            Ok(())
        } else {
            self.blit_file(rel, image_path, live_path, report).await
        }
    }

    /// Handles one regular file or leaf symlink (spec.md §4.6 "For each
    /// regular file or symlink encountered").
    async fn blit_file(
        &self,
        rel: &Path,
        image_path: &Path,
        live_path: &Path,
        report: &mut BlitReport,
    ) -> Result<(), Error> {
        if let Some(parent) = rel.parent() {
            report.affected_directories.insert(parent.to_path_buf());
            if parent.file_name().and_then(|n| n.to_str()) == Some(INFO_DIR_NAME)
                && rel.extension().and_then(|e| e.to_str()) == Some(INFO_EXTENSION)
            {
                report.affected_infofiles.insert(rel.to_path_buf());
            }
        }

        if !self.splitdebug && rel.starts_with(SPLITDEBUG_PREFIX) {
            report.items_not_installed.push(rel.to_path_buf());
            return Ok(());
        }

        let exists = tokio::fs::symlink_metadata(live_path).await.is_ok();

        if self.strict_collisions {
            if let Some(owner) = self.collision_owner(rel).await? {
                return Err(Error::Collision(format!("{} (owned by package {owner})", rel.display())));
            }
        }

        let is_symlink = tokio::fs::symlink_metadata(image_path).await?.file_type().is_symlink();
        let dest_key = live_path.to_string_lossy().into_owned();

        let decision = if is_symlink {
            // Symlink leaves aren't config-protected content.
            Decision::Overwrite
        } else {
            match self.protection.classify(live_path, exists) {
                Classification::Overwrite => Decision::Overwrite,
                Classification::Protected => {
                    let live_digest = ConfigurationFiles::digest(live_path).await.ok();
                    let recorded = self.recorded_digests.get(&dest_key);
                    self.protection.decide(live_path, exists, live_digest.as_deref(), recorded.map(String::as_str))
                }
            }
        };

        match decision {
            Decision::Stash => {
                let content = tokio::fs::read(image_path).await?;
                let update = self.configuration_files.stash(live_path, &content).await?;
                report.configuration_updates.push(update);
            }
            Decision::Overwrite => {
                if !is_symlink {
                    let digest = file_digest(image_path).await?;
                    if matches!(self.protection.classify(live_path, exists), Classification::Protected) {
                        report.automerge_files.insert(dest_key, digest);
                    }
                }
                atomic_move(image_path, live_path).await?;
            }
        }

        Ok(())
    }

    async fn collision_owner(&self, rel: &Path) -> Result<Option<store::Id>, Error> {
        let path_string = Path::new("/").join(rel).to_string_lossy().into_owned();
        let owners = self.installed.search_belongs(&path_string).await?;
        Ok(owners.into_iter().find(|id| Some(*id) != self.replaced_package))
    }
}

async fn file_digest(path: &Path) -> Result<String, Error> {
    let bytes = tokio::fs::read(path).await?;
    let mut hasher = Md5::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Best-effort ownership/permission replication: failures are logged, never
/// fatal, since an unprivileged test run (or a container without
/// `CAP_CHOWN`) should still be able to exercise the merge logic.
async fn replicate_ownership(image_path: &Path, live_path: &Path) {
    let Ok(meta) = tokio::fs::metadata(image_path).await else {
        return;
    };
    if let Err(err) = tokio::fs::set_permissions(live_path, meta.permissions()).await {
        log::warn!("failed to replicate permissions onto {live_path:?}: {err}");
    }
    let uid = nix::unistd::Uid::from_raw(meta.uid());
    let gid = nix::unistd::Gid::from_raw(meta.gid());
    if let Err(err) = nix::unistd::chown(live_path, Some(uid), Some(gid)) {
        log::debug!("failed to replicate ownership onto {live_path:?}: {err}");
    }
}

/// Atomic move from image to live (spec.md §4.6): same filesystem renames
/// directly; otherwise falls back to copy+fsync+rename+unlink. A circular
/// symlink at the destination is removed and the rename retried once.
async fn atomic_move(image_path: &Path, live_path: &Path) -> Result<(), Error> {
    match tokio::fs::rename(image_path, live_path).await {
        Ok(()) => Ok(()),
        Err(err) if err.raw_os_error() == Some(libc_eloop()) => {
            log::warn!("circular symlink at {live_path:?}, removing and retrying move");
            tokio::fs::remove_file(live_path).await.ok();
            tokio::fs::rename(image_path, live_path).await?;
            Ok(())
        }
        Err(err) if err.raw_os_error() == Some(libc_exdev()) => {
            if let Ok(target) = tokio::fs::read_link(image_path).await {
                tokio::fs::symlink(&target, live_path).await?;
                tokio::fs::remove_file(image_path).await?;
                return Ok(());
            }
            let bytes = tokio::fs::read(image_path).await?;
            let tmp = live_path.with_extension("entropy-tmp");
            {
                let mut out = tokio::fs::File::create(&tmp).await?;
                use tokio::io::AsyncWriteExt;
                out.write_all(&bytes).await?;
                out.sync_all().await?;
            }
            tokio::fs::rename(&tmp, live_path).await?;
            tokio::fs::remove_file(image_path).await.ok();
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

fn libc_eloop() -> i32 {
    nix::libc::ELOOP
}

fn libc_exdev() -> i32 {
    nix::libc::EXDEV
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("blit-test-{}-{}", std::process::id(), name));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn rules() -> ProtectionRules {
        ProtectionRules {
            protect: vec![],
            mask: vec![],
            skip: vec![],
        }
    }

    #[tokio::test]
    async fn fresh_file_is_moved_into_place() {
        let work = scratch_dir("fresh");
        let image = work.join("image");
        let live = work.join("live");
        std::fs::create_dir_all(image.join("bin")).unwrap();
        std::fs::create_dir_all(&live).unwrap();
        std::fs::write(image.join("bin/foo"), b"elf").unwrap();

        let installed = store::Database::open_memory().await.unwrap();
        let recorded = HashMap::new();
        let configuration_files = ConfigurationFiles::new([live.clone()]);
        let protection = rules();

        let blitter = Blitter {
            live_root: &live,
            protection: &protection,
            configuration_files: &configuration_files,
            installed: &installed,
            replaced_package: None,
            recorded_digests: &recorded,
            strict_collisions: true,
            splitdebug: false,
        };

        let report = blitter.merge(&image).await.unwrap();
        assert!(live.join("bin/foo").exists());
        assert!(report.affected_directories.contains(Path::new("bin")));
    }

    #[tokio::test]
    async fn splitdebug_content_is_skipped_when_disabled() {
        let work = scratch_dir("splitdebug");
        let image = work.join("image");
        let live = work.join("live");
        std::fs::create_dir_all(image.join("usr/lib/debug")).unwrap();
        std::fs::create_dir_all(&live).unwrap();
        std::fs::write(image.join("usr/lib/debug/foo.debug"), b"debug").unwrap();

        let installed = store::Database::open_memory().await.unwrap();
        let recorded = HashMap::new();
        let configuration_files = ConfigurationFiles::new([live.clone()]);
        let protection = rules();

        let blitter = Blitter {
            live_root: &live,
            protection: &protection,
            configuration_files: &configuration_files,
            installed: &installed,
            replaced_package: None,
            recorded_digests: &recorded,
            strict_collisions: true,
            splitdebug: false,
        };

        let report = blitter.merge(&image).await.unwrap();
        assert!(!live.join("usr/lib/debug/foo.debug").exists());
        assert_eq!(report.items_not_installed, vec![PathBuf::from("usr/lib/debug/foo.debug")]);
    }

    #[tokio::test]
    async fn collision_with_another_package_is_refused() {
        let work = scratch_dir("collision");
        let image = work.join("image");
        let live = work.join("live");
        std::fs::create_dir_all(image.join("bin")).unwrap();
        std::fs::create_dir_all(&live).unwrap();
        std::fs::write(image.join("bin/foo"), b"elf").unwrap();

        let installed = store::Database::open_memory().await.unwrap();
        let other = installed
            .handle_package(store::Record {
                atom: store::AtomFields {
                    category: "sys".into(),
                    name: "other".into(),
                    version: Some("1.0".into()),
                    ..Default::default()
                },
                content: vec![store::ContentEntry {
                    path: "/bin/foo".into(),
                    kind: store::Kind::File,
                    mtime: None,
                    sha256: None,
                }],
                ..Default::default()
            })
            .await
            .unwrap();
        let _ = other;

        let recorded = HashMap::new();
        let configuration_files = ConfigurationFiles::new([live.clone()]);
        let protection = rules();

        let blitter = Blitter {
            live_root: &live,
            protection: &protection,
            configuration_files: &configuration_files,
            installed: &installed,
            replaced_package: None,
            recorded_digests: &recorded,
            strict_collisions: true,
            splitdebug: false,
        };

        let err = blitter.merge(&image).await.unwrap_err();
        assert!(matches!(err, Error::Collision(_)));
    }

    #[tokio::test]
    async fn modified_protected_file_is_stashed_not_overwritten() {
        let work = scratch_dir("protect");
        let image = work.join("image");
        let live = work.join("live");
        std::fs::create_dir_all(image.join("etc")).unwrap();
        std::fs::create_dir_all(live.join("etc")).unwrap();
        std::fs::write(image.join("etc/bar.conf"), b"new content").unwrap();
        std::fs::write(live.join("etc/bar.conf"), b"user edited").unwrap();

        let installed = store::Database::open_memory().await.unwrap();
        let recorded = HashMap::new(); // no recorded digest => treated as modified
        let configuration_files = ConfigurationFiles::new([live.clone()]);
        let protection = ProtectionRules {
            protect: vec![live.join("etc")],
            mask: vec![],
            skip: vec![],
        };

        let blitter = Blitter {
            live_root: &live,
            protection: &protection,
            configuration_files: &configuration_files,
            installed: &installed,
            replaced_package: None,
            recorded_digests: &recorded,
            strict_collisions: true,
            splitdebug: false,
        };

        let report = blitter.merge(&image).await.unwrap();
        assert_eq!(std::fs::read(live.join("etc/bar.conf")).unwrap(), b"user edited");
        assert_eq!(report.configuration_updates.len(), 1);
    }

    #[tokio::test]
    async fn stale_symlink_is_replaced_with_directory() {
        let work = scratch_dir("stale-symlink");
        let image = work.join("image");
        let live = work.join("live");
        std::fs::create_dir_all(image.join("usr/share")).unwrap();
        std::fs::create_dir_all(&live).unwrap();
        std::fs::create_dir_all(live.join("usr")).unwrap();
        std::os::unix::fs::symlink(live.join("does-not-exist"), live.join("usr/share")).unwrap();
        std::fs::write(image.join("usr/share/thing"), b"data").unwrap();

        let installed = store::Database::open_memory().await.unwrap();
        let recorded = HashMap::new();
        let configuration_files = ConfigurationFiles::new([live.clone()]);
        let protection = rules();

        let blitter = Blitter {
            live_root: &live,
            protection: &protection,
            configuration_files: &configuration_files,
            installed: &installed,
            replaced_package: None,
            recorded_digests: &recorded,
            strict_collisions: true,
            splitdebug: false,
        };

        let report = blitter.merge(&image).await.unwrap();
        let _ = report;
        assert!(live.join("usr/share").is_dir());
        assert!(!live.join("usr/share").symlink_metadata().unwrap().file_type().is_symlink());
        assert!(live.join("usr/share/thing").exists());
    }
}
