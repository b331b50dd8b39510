// SPDX-License-Identifier: MPL-2.0

//! The REMOVE phase list (spec.md §4.6): `pre_remove`, `remove`, `remove_spm`,
//! `post_remove`, `cleanup`. Reused directly by `remove_conflicts` (nested,
//! install-side dispatch) and by a standalone user-initiated remove action.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use configure::Classification;
use store::Id;

use crate::action::spm::{HookMetadata, SourceManagerHooks};
use crate::context::Context;
use crate::Error;

#[derive(Debug, Default)]
pub struct RemoveOutcome {
    pub removed_files: Vec<PathBuf>,
    pub preserved_libraries: Vec<preserve::Entry>,
    pub protected_files_kept: Vec<PathBuf>,
}

pub async fn remove(ctx: &Context, package_id: Id, depth: usize) -> Result<RemoveOutcome, Error> {
    remove_with_spm(ctx, &crate::action::spm::NullSourceManager, package_id, depth).await
}

/// Same as [`remove`], but runs the `remove_spm` hook against an explicit
/// source-package-manager collaborator rather than the no-op default.
pub async fn remove_with_spm(
    ctx: &Context,
    spm: &dyn SourceManagerHooks,
    package_id: Id,
    depth: usize,
) -> Result<RemoveOutcome, Error> {
    log::trace!("remove({package_id}) at conflict depth {depth}");
    let record = ctx.installed.get(package_id).await?;
    if record.system_critical {
        let atom = record.atom.to_atom().map(|a| a.to_string()).unwrap_or_default();
        return Err(Error::NotRemovable(atom));
    }

    ctx.triggers.run("preremove", ctx.root())?;

    let outcome = delete_content(ctx, package_id, &record).await?;

    let metadata = HookMetadata {
        category: &record.atom.category,
        name: &record.atom.name,
        version: record.atom.version.as_deref().unwrap_or(""),
        slot: record.atom.slot.as_deref(),
        image_dir: ctx.root(),
        spm_uid: record.spm_uid.as_deref(),
    };
    spm.remove_spm(&metadata)?;

    ctx.installed.remove(package_id).await?;

    ctx.triggers.run("postremove", ctx.root())?;

    // preserved_libs_gc (spec.md §4.7): a removal may have just made another
    // preserved soname's last consumer go away.
    {
        let mut registry = ctx.preserved.lock().await;
        let mut collected = registry.gc(&ctx.installed).await?;
        let mut outcome = outcome;
        outcome.preserved_libraries.append(&mut collected);
        return Ok(outcome);
    }
}

/// The `remove` phase proper: deletes every content path the package owns,
/// honoring C8 protection (a locally-modified protected file is left in
/// place rather than deleted) and C7 preservation (a still-`needed` shared
/// library is retained rather than deleted). Directories are removed last,
/// and only if left empty, so deleting files doesn't leave half the tree
/// gone if cleanup is interrupted.
async fn delete_content(ctx: &Context, package_id: Id, record: &store::Record) -> Result<RemoveOutcome, Error> {
    let mut outcome = RemoveOutcome::default();
    let mut directories: BTreeSet<PathBuf> = BTreeSet::new();
    let recorded_digests = ctx.installed.retrieve_automerge_files(package_id).await?;

    let libraries: std::collections::HashMap<&Path, &str> =
        record.libraries.iter().map(|(soname, path)| (path.as_path(), soname.as_str())).collect();

    for entry in &record.content {
        let rel = entry.path.strip_prefix("/").unwrap_or(&entry.path);
        let live_path = ctx.root().join(rel);

        match entry.kind {
            store::package::Kind::Dir => {
                directories.insert(live_path);
                continue;
            }
            store::package::Kind::File | store::package::Kind::Sym => {}
        }

        if let Some(soname) = libraries.get(entry.path.as_path()) {
            let consumers = ctx.installed.packages_needing_soname(soname).await?;
            if consumers.iter().any(|&id| id != package_id) {
                if tokio::fs::symlink_metadata(&live_path).await.is_ok() {
                    let mut registry = ctx.preserved.lock().await;
                    let dest = registry.retain(soname, &live_path, package_id).await?;
                    outcome.preserved_libraries.push(preserve::Entry {
                        soname: soname.to_string(),
                        original_path: dest,
                        preserving_package_id: package_id.0,
                    });
                }
                continue;
            }
        }

        if entry.kind == store::package::Kind::File {
            let classification = ctx.settings.protection.classify(&live_path, true);
            if classification == Classification::Protected {
                let live_digest = configure::ConfigurationFiles::digest(&live_path).await.ok();
                let recorded = recorded_digests.get(&live_path.to_string_lossy().into_owned());
                if live_digest.as_deref() != recorded.map(String::as_str) {
                    log::info!("keeping locally-modified protected file {live_path:?} on removal");
                    outcome.protected_files_kept.push(live_path);
                    continue;
                }
            }
        }

        match tokio::fs::remove_file(&live_path).await {
            Ok(()) => outcome.removed_files.push(live_path),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }

    // Deepest directories first so a parent only attempts removal once its
    // children are gone.
    for dir in directories.into_iter().rev() {
        match tokio::fs::remove_dir(&dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            // Non-empty (another package still owns a sibling) or any other
            // removal failure is not fatal to the action: cleanup is
            // best-effort past the file-deletion step.
            Err(_) => {}
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::package::{AtomFields, ContentEntry, Kind};
    use store::Record;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("remove-test-{}-{}", std::process::id(), name));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn removes_plain_file_and_drops_store_row() {
        let root = scratch_dir("plain");
        std::fs::create_dir_all(root.join("usr/bin")).unwrap();
        std::fs::write(root.join("usr/bin/hello"), b"bin").unwrap();

        let ctx = Context::open(&root).await.unwrap();
        let id = ctx
            .installed
            .handle_package(Record {
                atom: AtomFields {
                    category: "app".into(),
                    name: "hello".into(),
                    version: Some("1.0".into()),
                    ..Default::default()
                },
                content: vec![
                    ContentEntry {
                        path: "/usr/bin".into(),
                        kind: Kind::Dir,
                        mtime: None,
                        sha256: None,
                    },
                    ContentEntry {
                        path: "/usr/bin/hello".into(),
                        kind: Kind::File,
                        mtime: None,
                        sha256: None,
                    },
                ],
                ..Default::default()
            })
            .await
            .unwrap();

        let outcome = remove(&ctx, id, 0).await.unwrap();
        assert!(!root.join("usr/bin/hello").exists());
        assert_eq!(outcome.removed_files.len(), 1);
        assert!(ctx.installed.get(id).await.is_err());
    }

    #[tokio::test]
    async fn system_critical_package_is_refused() {
        let root = scratch_dir("critical");
        let ctx = Context::open(&root).await.unwrap();
        let id = ctx
            .installed
            .handle_package(Record {
                atom: AtomFields {
                    category: "sys".into(),
                    name: "libc".into(),
                    version: Some("1.0".into()),
                    ..Default::default()
                },
                system_critical: true,
                ..Default::default()
            })
            .await
            .unwrap();

        let err = remove(&ctx, id, 0).await.unwrap_err();
        assert!(matches!(err, Error::NotRemovable(_)));
    }
}
