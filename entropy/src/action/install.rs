// SPDX-License-Identifier: MPL-2.0

//! The INSTALL phase list (spec.md §4.6): `remove_conflicts`, `unpack` (or
//! `merge`), `setup`, `pre_install`, `install`, a conditional
//! replace-vs-fresh branch, `install_spm`, `post_install`, `cleanup`.
//! `cleanup` always runs, even when an earlier phase failed, mirroring the
//! teacher's own `client::install::install`'s best-effort tidy-up around a
//! hard failure.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use store::{Id, Record};

use crate::action::blit::Blitter;
use crate::action::spm::{HookMetadata, SourceManagerHooks};
use crate::context::Context;
use crate::Error;

/// How the package image is produced before the merge (spec.md §4.6
/// "`unpack`/`merge`, mutually exclusive"): the common case extracts a
/// fetched artifact; a local-directory install mirrors an already-built
/// tree directly, skipping the artifact container entirely.
pub enum ImageSource<'a> {
    Artifact { path: &'a Path, host_arch: &'a str },
    Directory(&'a Path),
}

/// Everything one INSTALL action needs once the solver has picked a
/// candidate and the artifact (if any) has been fetched.
pub struct InstallRequest<'a> {
    pub record: Record,
    pub source: ImageSource<'a>,
    /// Installed row being upgraded/replaced in place, if this is not a
    /// fresh install (same (category, name, slot) key).
    pub replaces: Option<Id>,
    /// Other installed packages this candidate conflicts with or displaces,
    /// already computed by `solver::Solver::install_queue`'s `removal_seq`
    /// and resolved down to installed ids for this one candidate.
    pub conflicting_removals: Vec<Id>,
}

#[derive(Debug, Default)]
pub struct InstallOutcome {
    pub package_id: Id,
    pub affected_directories: BTreeSet<PathBuf>,
    pub affected_infofiles: BTreeSet<PathBuf>,
    pub configuration_updates: Vec<configure::ConfigurationUpdate>,
    pub preserved_libraries: Vec<preserve::Entry>,
}

/// A nested REMOVE dispatch (conflict resolution) may recurse into another
/// INSTALL only indirectly via the orchestrator re-running the solver; the
/// depth limit here only bounds `remove_conflicts`' own recursion into
/// [`super::remove::remove`], which never re-enters `install`.
const MAX_CONFLICT_DEPTH: usize = 8;

pub async fn install(
    ctx: &Context,
    spm: &dyn SourceManagerHooks,
    request: InstallRequest<'_>,
    depth: usize,
) -> Result<InstallOutcome, Error> {
    remove_conflicts(ctx, &request.conflicting_removals, depth).await?;

    let unpack_key = request.record.atom.to_atom().map(|a| a.to_string()).unwrap_or_else(|_| request.record.atom.key().1);
    let image_dir = ctx.paths.image_dir(&unpack_key);

    let result = run_phases(ctx, spm, request.record, request.replaces, &image_dir, request.source).await;

    // cleanup (spec.md §4.6): always attempted, success or failure.
    if let Err(err) = tokio::fs::remove_dir_all(&image_dir).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            log::warn!("cleanup: failed to remove unpack directory {image_dir:?}: {err}");
        }
    }

    result
}

async fn run_phases(
    ctx: &Context,
    spm: &dyn SourceManagerHooks,
    mut record: Record,
    replaces: Option<Id>,
    image_dir: &Path,
    source: ImageSource<'_>,
) -> Result<InstallOutcome, Error> {
    match source {
        ImageSource::Artifact { path, host_arch } => unpack(path, host_arch, image_dir).await?,
        ImageSource::Directory(dir) => merge_directory(dir, image_dir).await?,
    }

    let metadata = HookMetadata {
        category: &record.atom.category,
        name: &record.atom.name,
        version: record.atom.version.as_deref().unwrap_or(""),
        slot: record.atom.slot.as_deref(),
        image_dir,
        spm_uid: None,
    };
    spm.install_setup(&metadata)?;
    spm.install_unpack(&metadata)?;
    replicate_tree_ownership(image_dir).await;

    ctx.triggers.run("preinstall", ctx.root())?;

    // `handle_package` below deletes the `previous` row as part of
    // committing the replacement at the same (key, slot) — so everything
    // `install_clean` needs from the old record (its content, for the
    // stale-path diff, and its provided libraries, for C7) must be read
    // out now, before that commit, not after.
    let old_record = match replaces {
        Some(previous) => Some(ctx.installed.get(previous).await?),
        None => None,
    };

    let recorded_digests = match replaces {
        Some(previous) => ctx.installed.retrieve_automerge_files(previous).await?,
        None => Default::default(),
    };
    let configuration_files = ctx.configuration_files();
    let protection = ctx.settings.protection.clone();

    let blitter = Blitter {
        live_root: ctx.root(),
        protection: &protection,
        configuration_files: &configuration_files,
        installed: &ctx.installed,
        replaced_package: replaces,
        recorded_digests: &recorded_digests,
        strict_collisions: ctx.settings.collision_strict,
        splitdebug: ctx.settings.splitdebug,
    };
    let report = blitter.merge(image_dir).await?;

    let skipped: std::collections::HashSet<&Path> = report.items_not_installed.iter().map(PathBuf::as_path).collect();
    record.content.retain(|entry| !skipped.contains(entry.path.as_path()));

    // Content-diff against the old record while both are still in hand
    // (spec.md §4.2 `content_diff`, §4.6 "filter the recorded content
    // file"/`install_clean`), since `handle_package` below is about to
    // delete the old row this diff depends on.
    let stale_paths = old_record.as_ref().map(|old| stale_content_paths(&old.content, &record.content));

    let spm_uid = spm.install_spm(&HookMetadata { spm_uid: None, ..metadata })?;
    record.spm_uid = spm_uid;

    let package_id = ctx.installed.handle_package(record).await?;
    if !report.automerge_files.is_empty() {
        ctx.installed.insert_automerge_files(package_id, &report.automerge_files).await?;
    }

    let preserved_libraries = if let Some(previous) = replaces {
        ctx.triggers.run("preremove", ctx.root())?;
        let old_record = old_record.expect("replaces implies old_record was fetched above");
        let stale_paths = stale_paths.expect("replaces implies stale_paths was computed above");
        let preserved = install_clean(ctx, previous, &old_record, &stale_paths).await?;
        ctx.triggers.run("postremove", ctx.root())?;
        preserved
    } else {
        preserved_libs_gc(ctx).await?
    };

    ctx.triggers.run("postinstall", ctx.root())?;

    Ok(InstallOutcome {
        package_id,
        affected_directories: report.affected_directories,
        affected_infofiles: report.affected_infofiles,
        configuration_updates: report.configuration_updates,
        preserved_libraries,
    })
}

/// `remove_conflicts` (spec.md §4.6): conflicting/displaced installed
/// packages are removed before this candidate's files are merged in, via a
/// nested REMOVE dispatch bounded by [`MAX_CONFLICT_DEPTH`] so a
/// pathological conflict cycle can't recurse unboundedly.
async fn remove_conflicts(ctx: &Context, ids: &[Id], depth: usize) -> Result<(), Error> {
    if ids.is_empty() {
        return Ok(());
    }
    if depth >= MAX_CONFLICT_DEPTH {
        return Err(Error::ConflictDepthExceeded(MAX_CONFLICT_DEPTH));
    }
    for &id in ids {
        super::remove::remove(ctx, id, depth + 1).await?;
    }
    Ok(())
}

async fn unpack(artifact_path: &Path, host_arch: &str, image_dir: &Path) -> Result<(), Error> {
    tokio::fs::create_dir_all(image_dir).await?;

    let artifact_path = artifact_path.to_path_buf();
    let host_arch = host_arch.to_string();
    let image_dir = image_dir.to_path_buf();

    tokio::task::spawn_blocking(move || -> Result<(), archive::Error> {
        let file = std::fs::File::open(&artifact_path)?;
        let mut reader = std::io::BufReader::new(file);
        archive::read_metadata_checked(&mut reader, &host_arch)?;
        let mut tar = archive::tar_archive(&mut reader)?;
        tar.unpack(&image_dir)?;
        Ok(())
    })
    .await
    .map_err(|err| Error::Internal(err.to_string()))??;

    Ok(())
}

/// `merge` (spec.md §4.6): mirrors an already-built directory tree into
/// the unpack root instead of extracting an artifact, for a local-directory
/// install.
async fn merge_directory(source: &Path, image_dir: &Path) -> Result<(), Error> {
    tokio::fs::create_dir_all(image_dir).await?;
    let mut stack = vec![PathBuf::new()];
    while let Some(rel) = stack.pop() {
        let src_dir = source.join(&rel);
        let mut entries = tokio::fs::read_dir(&src_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let rel = rel.join(entry.file_name());
            let src = source.join(&rel);
            let dst = image_dir.join(&rel);
            let meta = tokio::fs::symlink_metadata(&src).await?;
            if meta.is_dir() {
                tokio::fs::create_dir_all(&dst).await?;
                stack.push(rel);
            } else if meta.file_type().is_symlink() {
                let target = tokio::fs::read_link(&src).await?;
                tokio::fs::symlink(target, &dst).await?;
            } else {
                tokio::fs::copy(&src, &dst).await?;
            }
        }
    }
    Ok(())
}

async fn replicate_tree_ownership(_image_dir: &Path) {
    // Ownership is replicated per-entry during the blit merge itself
    // (`Blitter::blit_directory`/`replicate_ownership`); `setup` only needs
    // the image tree to exist on disk before the hooks above run.
}

/// `install_clean` (spec.md §4.6, conditional branch): deletes files the
/// previous installed version owned that the new version no longer does,
/// preserving any shared library still `needed` by another installed
/// package (C7) rather than deleting it out from under it.
///
/// Takes `old_record` and `stale_paths` as already-computed inputs rather
/// than reading them from the store itself: by the time this phase runs,
/// `handle_package` has already deleted `previous`'s row (it replaces any
/// existing record at the same (key, slot) inside the same commit), so a
/// fresh `ctx.installed.get(previous)`/`content_diff` here would hit
/// `Error::RowNotFound` instead of the old content.
async fn install_clean(ctx: &Context, previous: Id, old_record: &Record, stale_paths: &[String]) -> Result<Vec<preserve::Entry>, Error> {
    let stale: std::collections::HashSet<&str> = stale_paths.iter().map(String::as_str).collect();

    let mut preserved = Vec::new();
    let mut preserved_sonames = std::collections::HashSet::new();

    for (soname, lib_path) in &old_record.libraries {
        if !stale.contains(lib_path.to_string_lossy().as_ref()) {
            continue;
        }
        let consumers = ctx.installed.packages_needing_soname(soname).await?;
        if consumers.iter().any(|&id| id != previous) {
            let live_path = ctx.root().join(lib_path.strip_prefix("/").unwrap_or(lib_path));
            let mut registry = ctx.preserved.lock().await;
            if tokio::fs::symlink_metadata(&live_path).await.is_ok() {
                let dest = registry.retain(soname, &live_path, previous).await?;
                preserved.push(preserve::Entry {
                    soname: soname.clone(),
                    original_path: dest,
                    preserving_package_id: previous.0,
                });
            }
            preserved_sonames.insert(lib_path.clone());
        }
    }

    for path in stale_paths {
        let rel = Path::new(path.as_str()).strip_prefix("/").unwrap_or(Path::new(path.as_str()));
        if preserved_sonames.iter().any(|p: &PathBuf| p.to_string_lossy() == *path) {
            continue;
        }
        let live_path = ctx.root().join(rel);
        match tokio::fs::remove_file(&live_path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }

    Ok(preserved)
}

/// The in-memory equivalent of `store::Database::content_diff`, usable
/// before the old record's row has been committed away by `handle_package`:
/// paths `old_content` owns that `new_content` does not.
fn stale_content_paths(old_content: &[store::package::ContentEntry], new_content: &[store::package::ContentEntry]) -> Vec<String> {
    let new_paths: std::collections::HashSet<String> = new_content.iter().map(|entry| entry.path.to_string_lossy().into_owned()).collect();
    old_content
        .iter()
        .map(|entry| entry.path.to_string_lossy().into_owned())
        .filter(|path| !new_paths.contains(path))
        .collect()
}

/// `preserved_libs_gc` (spec.md §4.7, conditional branch for a fresh,
/// non-replacing install): nothing was just displaced, but a prior action
/// may have left preserved libraries that are now unreferenced, so this is
/// still a convenient point to sweep them.
async fn preserved_libs_gc(ctx: &Context) -> Result<Vec<preserve::Entry>, Error> {
    let mut registry = ctx.preserved.lock().await;
    Ok(registry.gc(&ctx.installed).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::spm::NullSourceManager;
    use std::path::PathBuf;
    use store::package::AtomFields;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("install-test-{}-{}", std::process::id(), name));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    async fn context_at(root: &Path) -> Context {
        Context::open(root).await.unwrap()
    }

    fn record(name: &str) -> Record {
        Record {
            atom: AtomFields {
                category: "app".into(),
                name: name.into(),
                version: Some("1.0".into()),
                ..Default::default()
            },
            content: vec![store::package::ContentEntry {
                path: "/usr/bin/hello".into(),
                kind: store::package::Kind::File,
                mtime: None,
                sha256: None,
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn fresh_install_merges_directory_and_records_package() {
        let root = scratch_dir("fresh");
        let image_source = scratch_dir("fresh-src");
        std::fs::create_dir_all(image_source.join("usr/bin")).unwrap();
        std::fs::write(image_source.join("usr/bin/hello"), b"bin").unwrap();

        let ctx = context_at(&root).await;
        let spm = NullSourceManager;

        let request = InstallRequest {
            record: record("hello"),
            source: ImageSource::Directory(&image_source),
            replaces: None,
            conflicting_removals: Vec::new(),
        };

        let outcome = install(&ctx, &spm, request, 0).await.unwrap();
        assert!(root.join("usr/bin/hello").exists());
        assert!(ctx.installed.get(outcome.package_id).await.is_ok());
    }

    #[tokio::test]
    async fn conflict_depth_limit_is_enforced() {
        let root = scratch_dir("depth");
        let ctx = context_at(&root).await;
        let err = remove_conflicts(&ctx, &[Id(1)], MAX_CONFLICT_DEPTH).await.unwrap_err();
        assert!(matches!(err, Error::ConflictDepthExceeded(_)));
    }

    fn md5_hex(bytes: &[u8]) -> String {
        use md5::{Digest, Md5};
        let mut hasher = Md5::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    // Spec scenario 2: upgrading a package in place must not clobber a
    // protected config file the user has since modified, and must not fail
    // with `RowNotFound` trying to read the old record after `handle_package`
    // has already deleted it.
    #[tokio::test]
    async fn replace_preserves_modified_config_file_across_upgrade() {
        let root = scratch_dir("replace-config");
        std::fs::create_dir_all(root.join("etc")).unwrap();

        let ctx = context_at(&root).await;
        let spm = NullSourceManager;

        let previous = ctx
            .installed
            .handle_package(Record {
                atom: AtomFields {
                    category: "app".into(),
                    name: "bar".into(),
                    version: Some("1.0".into()),
                    ..Default::default()
                },
                content: vec![store::package::ContentEntry {
                    path: "/etc/bar.conf".into(),
                    kind: store::package::Kind::File,
                    mtime: None,
                    sha256: None,
                }],
                ..Default::default()
            })
            .await
            .unwrap();

        // The live file has drifted from what the package originally shipped.
        std::fs::write(root.join("etc/bar.conf"), b"user-edited").unwrap();
        let dest_key = root.join("etc/bar.conf").to_string_lossy().into_owned();
        let recorded = std::collections::HashMap::from([(dest_key, md5_hex(b"orig"))]);
        ctx.installed.insert_automerge_files(previous, &recorded).await.unwrap();

        let image_source = scratch_dir("replace-config-src");
        std::fs::create_dir_all(image_source.join("etc")).unwrap();
        std::fs::write(image_source.join("etc/bar.conf"), b"new-upstream").unwrap();

        let request = InstallRequest {
            record: Record {
                atom: AtomFields {
                    category: "app".into(),
                    name: "bar".into(),
                    version: Some("2.0".into()),
                    ..Default::default()
                },
                content: vec![store::package::ContentEntry {
                    path: "/etc/bar.conf".into(),
                    kind: store::package::Kind::File,
                    mtime: None,
                    sha256: None,
                }],
                ..Default::default()
            },
            source: ImageSource::Directory(&image_source),
            replaces: Some(previous),
            conflicting_removals: Vec::new(),
        };

        let outcome = install(&ctx, &spm, request, 0).await.unwrap();

        assert_eq!(std::fs::read(root.join("etc/bar.conf")).unwrap(), b"user-edited");
        assert_eq!(outcome.configuration_updates.len(), 1);
        assert!(ctx.installed.get(outcome.package_id).await.is_ok());
        assert!(ctx.installed.get(previous).await.is_err());
    }

    // Spec scenario 3: replacing a library package that drops a soname still
    // `needed` by another installed package must preserve the old library
    // file instead of deleting it.
    #[tokio::test]
    async fn replace_preserves_shared_library_still_needed_by_consumer() {
        let root = scratch_dir("replace-library");
        std::fs::create_dir_all(root.join("usr/lib")).unwrap();
        std::fs::write(root.join("usr/lib/libfoo.so.1"), b"elf").unwrap();

        let ctx = context_at(&root).await;
        let spm = NullSourceManager;

        let previous = ctx
            .installed
            .handle_package(Record {
                atom: AtomFields {
                    category: "app".into(),
                    name: "libfoo".into(),
                    version: Some("1.0".into()),
                    ..Default::default()
                },
                content: vec![store::package::ContentEntry {
                    path: "/usr/lib/libfoo.so.1".into(),
                    kind: store::package::Kind::File,
                    mtime: None,
                    sha256: None,
                }],
                libraries: vec![("libfoo.so.1".into(), "/usr/lib/libfoo.so.1".into())],
                ..Default::default()
            })
            .await
            .unwrap();

        ctx.installed
            .handle_package(Record {
                atom: AtomFields {
                    category: "app".into(),
                    name: "consumer".into(),
                    version: Some("1.0".into()),
                    ..Default::default()
                },
                needed: vec!["libfoo.so.1".into()],
                ..Default::default()
            })
            .await
            .unwrap();

        let image_source = scratch_dir("replace-library-src");
        std::fs::create_dir_all(&image_source).unwrap();

        let request = InstallRequest {
            record: Record {
                atom: AtomFields {
                    category: "app".into(),
                    name: "libfoo".into(),
                    version: Some("2.0".into()),
                    ..Default::default()
                },
                ..Default::default()
            },
            source: ImageSource::Directory(&image_source),
            replaces: Some(previous),
            conflicting_removals: Vec::new(),
        };

        let outcome = install(&ctx, &spm, request, 0).await.unwrap();

        assert!(!root.join("usr/lib/libfoo.so.1").exists());
        assert_eq!(outcome.preserved_libraries.len(), 1);
        let preserved = &outcome.preserved_libraries[0];
        assert_eq!(preserved.soname, "libfoo.so.1");
        assert_eq!(preserved.preserving_package_id(), previous);
        assert!(preserved.original_path.exists());
        assert_eq!(std::fs::read(&preserved.original_path).unwrap(), b"elf");
    }
}
