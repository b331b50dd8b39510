// SPDX-License-Identifier: MPL-2.0

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use atom::Dependency;
use sqlx::{sqlite::SqliteConnectOptions, Acquire, Executor, Pool, Row, Sqlite};
use tokio::sync::Mutex;

use crate::error::Error;
use crate::package::{AtomFields, ContentEntry, InstallSource, Kind, Record, Signatures, TriggerSpec};
use crate::Id;

/// Outcome of [`Database::atom_match`] (spec.md §4.2: "status `0` on match,
/// `1` on no-match").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    Matched(Id),
    NoMatch,
}

/// One typed relational store over packages (spec.md §4.2 C2). Backs either
/// an available repository or the single installed store — same schema,
/// callers decide which instance plays which role.
#[derive(Debug, Clone)]
pub struct Database {
    pool: Arc<Mutex<Pool<Sqlite>>>,
}

impl Database {
    pub async fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Self, Error> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .read_only(read_only)
            .foreign_keys(true);

        Self::connect(options).await
    }

    pub async fn open_memory() -> Result<Self, Error> {
        Self::connect("sqlite::memory:".parse::<SqliteConnectOptions>()?).await
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self, Error> {
        let pool = sqlx::SqlitePool::connect_with(options).await?;
        sqlx::migrate!("migrations").run(&pool).await?;
        Ok(Self { pool: Arc::new(Mutex::new(pool)) })
    }

    /// Flushes writes; readers opening a fresh connection thereafter see
    /// either pre- or post-commit state, never partial (spec.md invariant 5).
    pub async fn commit(&self) -> Result<(), Error> {
        let pool = self.pool.lock().await;
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE);").execute(&*pool).await?;
        Ok(())
    }

    pub async fn wipe(&self) -> Result<(), Error> {
        let pool = self.pool.lock().await;
        sqlx::query("DELETE FROM packages;").execute(&*pool).await?;
        Ok(())
    }

    /// `atom_match(dep_atom, slot, tag) -> (package_id, status)`: resolves a
    /// dependency against this single store. Tie-break within one store is
    /// just "highest version+revision" (spec.md §4.2 (a)); cross-repository
    /// tie-break (b)/(c) lives in [`crate::repository::RepositorySet`].
    pub async fn atom_match(
        &self,
        dep: &Dependency,
        slot: Option<&str>,
        tag: Option<&str>,
    ) -> Result<MatchOutcome, Error> {
        let candidates = self.query_by_key(&dep.atom.key.category, &dep.atom.key.name).await?;

        let mut best: Option<(Id, AtomFields)> = None;
        for (id, fields) in candidates {
            if let Some(slot) = slot {
                if fields.slot.as_deref() != Some(slot) {
                    continue;
                }
            }
            if let Some(tag) = tag {
                if fields.tag.as_deref() != Some(tag) {
                    continue;
                }
            }
            let Ok(candidate_atom) = fields.to_atom() else { continue };
            if !dep.matches(&candidate_atom) {
                continue;
            }

            let better = match &best {
                None => true,
                Some((_, current)) => is_higher(&fields, current),
            };
            if better {
                best = Some((id, fields));
            }
        }

        Ok(match best {
            Some((id, _)) => MatchOutcome::Matched(id),
            None => MatchOutcome::NoMatch,
        })
    }

    async fn query_by_key(&self, category: &str, name: &str) -> Result<Vec<(Id, AtomFields)>, Error> {
        let pool = self.pool.lock().await;
        let rows = sqlx::query(
            "SELECT package_id, category, name, version, revision, slot, tag
             FROM packages WHERE category = ? AND name = ?;",
        )
        .bind(category)
        .bind(name)
        .fetch_all(&*pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let id = Id(row.get::<i64, _>("package_id"));
                let fields = AtomFields {
                    category: row.get("category"),
                    name: row.get("name"),
                    version: row.get("version"),
                    revision: row.get::<i64, _>("revision") as u64,
                    slot: row.get("slot"),
                    tag: row.get("tag"),
                };
                (id, fields)
            })
            .collect())
    }

    /// `search_belongs(path) -> [package_id]`: which packages own a live file.
    pub async fn search_belongs(&self, path: &str) -> Result<Vec<Id>, Error> {
        let pool = self.pool.lock().await;
        let rows = sqlx::query("SELECT DISTINCT package_id FROM package_content WHERE path = ?;")
            .bind(path)
            .fetch_all(&*pool)
            .await?;
        Ok(rows.into_iter().map(|r| Id(r.get::<i64, _>("package_id"))).collect())
    }

    /// `retrieve_depends(package_id) -> [package_id]`: reverse-dependency
    /// lookup — every other package in this store whose declared
    /// dependency atom matches `package_id`'s own atom.
    pub async fn retrieve_depends(&self, package_id: Id) -> Result<Vec<Id>, Error> {
        let target = self.get(package_id).await?;
        let target_atom = target.atom.to_atom()?;

        let all = self.all_ids_and_dependencies().await?;
        Ok(all
            .into_iter()
            .filter(|(id, _)| *id != package_id)
            .filter(|(_, deps)| deps.iter().any(|d| d.matches(&target_atom)))
            .map(|(id, _)| id)
            .collect())
    }

    async fn all_ids_and_dependencies(&self) -> Result<Vec<(Id, Vec<Dependency>)>, Error> {
        let pool = self.pool.lock().await;
        let rows = sqlx::query("SELECT package_id, dependency FROM package_dependencies;")
            .fetch_all(&*pool)
            .await?;

        let mut by_id: HashMap<i64, Vec<Dependency>> = HashMap::new();
        for row in rows {
            let id: i64 = row.get("package_id");
            let raw: String = row.get("dependency");
            if let Ok(dep) = Dependency::parse(&raw) {
                by_id.entry(id).or_default().push(dep);
            }
        }

        Ok(by_id.into_iter().map(|(id, deps)| (Id(id), deps)).collect())
    }

    /// `retrieve_content(package_id) -> stream<(path, kind)>`, ordered by
    /// path. Modeled as a restartable `Vec` rather than a literal generator
    /// (spec.md §9 design note): calling this again yields a fresh,
    /// independent sequence, which is all the two-pass content filter in
    /// §4.6 and the diff-then-merge step in §4.8 need.
    pub async fn retrieve_content(&self, package_id: Id) -> Result<Vec<ContentEntry>, Error> {
        let pool = self.pool.lock().await;
        let rows = sqlx::query(
            "SELECT path, kind, mtime, sha256 FROM package_content
             WHERE package_id = ? ORDER BY path ASC;",
        )
        .bind(package_id.0)
        .fetch_all(&*pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ContentEntry {
                path: row.get::<String, _>("path").into(),
                kind: row
                    .get::<String, _>("kind")
                    .parse::<Kind>()
                    .unwrap_or(Kind::File),
                mtime: row.get("mtime"),
                sha256: row.get("sha256"),
            })
            .collect())
    }

    /// `content_diff(removed, new_store, new) -> stream<path>`: paths owned
    /// by `removed` in this store and not owned by `new` in `new_store`.
    /// Path comparison is case-sensitive with no normalization here — the
    /// caller (the action engine's `install_clean` phase) applies
    /// realpath-based symlink-target normalization against the live
    /// filesystem before treating a path as genuinely unique to the old
    /// package (spec.md §4.6, resolved Open Question in SPEC_FULL.md §13).
    pub async fn content_diff(&self, removed: Id, new_store: &Database, new: Id) -> Result<Vec<String>, Error> {
        let old_content = self.retrieve_content(removed).await?;
        let new_content = new_store.retrieve_content(new).await?;

        let new_paths: std::collections::HashSet<String> = new_content
            .into_iter()
            .map(|e| e.path.to_string_lossy().into_owned())
            .collect();

        Ok(old_content
            .into_iter()
            .map(|e| e.path.to_string_lossy().into_owned())
            .filter(|p| !new_paths.contains(p))
            .collect())
    }

    pub async fn get(&self, package_id: Id) -> Result<Record, Error> {
        let pool = self.pool.lock().await;

        let row = sqlx::query(
            "SELECT category, name, version, revision, slot, tag, download_url,
                    artifact_checksum, size, sha1, sha256, sha512, gpg_signature,
                    install_source, spm_uid, date_installed, repository_of_origin,
                    system_critical
             FROM packages WHERE package_id = ?;",
        )
        .bind(package_id.0)
        .fetch_optional(&*pool)
        .await?
        .ok_or(Error::RowNotFound)?;

        let atom = AtomFields {
            category: row.get("category"),
            name: row.get("name"),
            version: row.get("version"),
            revision: row.get::<i64, _>("revision") as u64,
            slot: row.get("slot"),
            tag: row.get("tag"),
        };

        let dependencies = fetch_dependency_rows(&*pool, "package_dependencies", package_id).await?;
        let conflicts = fetch_dependency_rows(&*pool, "package_conflicts", package_id).await?;

        let provides: Vec<String> = sqlx::query("SELECT virtual_atom FROM package_provides WHERE package_id = ?;")
            .bind(package_id.0)
            .fetch_all(&*pool)
            .await?
            .into_iter()
            .map(|r| r.get("virtual_atom"))
            .collect();

        let libraries: Vec<(String, std::path::PathBuf)> =
            sqlx::query("SELECT soname, path FROM package_libraries WHERE package_id = ?;")
                .bind(package_id.0)
                .fetch_all(&*pool)
                .await?
                .into_iter()
                .map(|r| (r.get::<String, _>("soname"), r.get::<String, _>("path").into()))
                .collect();

        let needed: Vec<String> = sqlx::query("SELECT soname FROM package_needed WHERE package_id = ?;")
            .bind(package_id.0)
            .fetch_all(&*pool)
            .await?
            .into_iter()
            .map(|r| r.get("soname"))
            .collect();

        let licenses: Vec<String> = sqlx::query("SELECT license FROM package_licenses WHERE package_id = ?;")
            .bind(package_id.0)
            .fetch_all(&*pool)
            .await?
            .into_iter()
            .map(|r| r.get("license"))
            .collect();

        let triggers: Vec<TriggerSpec> =
            sqlx::query("SELECT name, handler FROM package_triggers WHERE package_id = ?;")
                .bind(package_id.0)
                .fetch_all(&*pool)
                .await?
                .into_iter()
                .map(|r| TriggerSpec {
                    name: r.get("name"),
                    handler: r.get("handler"),
                })
                .collect();

        drop(pool);
        let content = self.retrieve_content(package_id).await?;

        let install_source = row
            .get::<String, _>("install_source")
            .parse::<InstallSource>()
            .unwrap_or_default();

        Ok(Record {
            atom,
            dependencies,
            conflicts,
            provides,
            libraries,
            needed,
            licenses,
            content,
            triggers,
            signatures: Signatures {
                sha1: row.get("sha1"),
                sha256: row.get("sha256"),
                sha512: row.get("sha512"),
                gpg: row.get("gpg_signature"),
            },
            size: row.get("size"),
            download_url: row.get("download_url"),
            artifact_checksum: row.get("artifact_checksum"),
            install_source,
            spm_uid: row.get("spm_uid"),
            date_installed: row.get("date_installed"),
            repository_of_origin: row.get("repository_of_origin"),
            system_critical: row.get("system_critical"),
        })
    }

    pub async fn find_by_key_slot(&self, category: &str, name: &str, slot: Option<&str>) -> Result<Option<Id>, Error> {
        let pool = self.pool.lock().await;
        let row = if let Some(slot) = slot {
            sqlx::query("SELECT package_id FROM packages WHERE category = ? AND name = ? AND slot = ?;")
                .bind(category)
                .bind(name)
                .bind(slot)
                .fetch_optional(&*pool)
                .await?
        } else {
            sqlx::query("SELECT package_id FROM packages WHERE category = ? AND name = ? AND slot IS NULL;")
                .bind(category)
                .bind(name)
                .fetch_optional(&*pool)
                .await?
        };
        Ok(row.map(|r| Id(r.get::<i64, _>("package_id"))))
    }

    pub async fn all_ids(&self) -> Result<Vec<Id>, Error> {
        let pool = self.pool.lock().await;
        let rows = sqlx::query("SELECT package_id FROM packages;").fetch_all(&*pool).await?;
        Ok(rows.into_iter().map(|r| Id(r.get::<i64, _>("package_id"))).collect())
    }

    /// `(id, system_critical, install_source)` for every installed package,
    /// the cheap projection C4's `reverse_queue`/`orphaned` need without
    /// fetching each record's full content and dependency lists.
    pub async fn all_ids_with_flags(&self) -> Result<Vec<(Id, bool, InstallSource)>, Error> {
        let pool = self.pool.lock().await;
        let rows = sqlx::query("SELECT package_id, system_critical, install_source FROM packages;")
            .fetch_all(&*pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| {
                let install_source = r
                    .get::<String, _>("install_source")
                    .parse::<InstallSource>()
                    .unwrap_or_default();
                (Id(r.get::<i64, _>("package_id")), r.get("system_critical"), install_source)
            })
            .collect())
    }

    /// `handle_package(record, formatted_content=true) -> package_id`:
    /// atomic insertion of a full record, replacing any existing package at
    /// the same `(key, slot)` so invariant 2 (at most one record per
    /// `(key, slot)`) always holds.
    pub async fn handle_package(&self, record: Record) -> Result<Id, Error> {
        let pool = self.pool.lock().await;
        let mut tx = pool.begin().await?;

        if let Some(existing) = find_key_slot_conn(tx.acquire().await?, &record.atom.category, &record.atom.name, record.atom.slot.as_deref()).await? {
            delete_package_conn(tx.acquire().await?, existing).await?;
        }

        let inserted_id: i64 = sqlx::query(
            "INSERT INTO packages (
                category, name, version, revision, slot, tag, download_url,
                artifact_checksum, size, sha1, sha256, sha512, gpg_signature,
                install_source, spm_uid, date_installed, repository_of_origin,
                system_critical
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING package_id;",
        )
        .bind(&record.atom.category)
        .bind(&record.atom.name)
        .bind(&record.atom.version)
        .bind(record.atom.revision as i64)
        .bind(&record.atom.slot)
        .bind(&record.atom.tag)
        .bind(&record.download_url)
        .bind(&record.artifact_checksum)
        .bind(record.size)
        .bind(&record.signatures.sha1)
        .bind(&record.signatures.sha256)
        .bind(&record.signatures.sha512)
        .bind(&record.signatures.gpg)
        .bind(record.install_source.to_string())
        .bind(&record.spm_uid)
        .bind(record.date_installed)
        .bind(&record.repository_of_origin)
        .bind(record.system_critical)
        .fetch_one(tx.acquire().await?)
        .await?
        .get(0);

        let id = Id(inserted_id);

        for dep in &record.dependencies {
            sqlx::query("INSERT INTO package_dependencies (package_id, dependency) VALUES (?, ?);")
                .bind(inserted_id)
                .bind(dep_to_string(dep))
                .execute(tx.acquire().await?)
                .await?;
        }
        for dep in &record.conflicts {
            sqlx::query("INSERT INTO package_conflicts (package_id, conflict) VALUES (?, ?);")
                .bind(inserted_id)
                .bind(dep_to_string(dep))
                .execute(tx.acquire().await?)
                .await?;
        }
        for provide in &record.provides {
            sqlx::query("INSERT INTO package_provides (package_id, virtual_atom) VALUES (?, ?);")
                .bind(inserted_id)
                .bind(provide)
                .execute(tx.acquire().await?)
                .await?;
        }
        for (soname, path) in &record.libraries {
            sqlx::query("INSERT INTO package_libraries (package_id, soname, path) VALUES (?, ?, ?);")
                .bind(inserted_id)
                .bind(soname)
                .bind(path.to_string_lossy().into_owned())
                .execute(tx.acquire().await?)
                .await?;
        }
        for soname in &record.needed {
            sqlx::query("INSERT INTO package_needed (package_id, soname) VALUES (?, ?);")
                .bind(inserted_id)
                .bind(soname)
                .execute(tx.acquire().await?)
                .await?;
        }
        for license in &record.licenses {
            sqlx::query("INSERT INTO package_licenses (package_id, license) VALUES (?, ?);")
                .bind(inserted_id)
                .bind(license)
                .execute(tx.acquire().await?)
                .await?;
        }
        for entry in &record.content {
            sqlx::query(
                "INSERT INTO package_content (package_id, path, kind, mtime, sha256) VALUES (?, ?, ?, ?, ?);",
            )
            .bind(inserted_id)
            .bind(entry.path.to_string_lossy().into_owned())
            .bind(entry.kind.to_string())
            .bind(entry.mtime)
            .bind(&entry.sha256)
            .execute(tx.acquire().await?)
            .await?;
        }
        for trigger in &record.triggers {
            sqlx::query("INSERT INTO package_triggers (package_id, name, handler) VALUES (?, ?, ?);")
                .bind(inserted_id)
                .bind(&trigger.name)
                .bind(&trigger.handler)
                .execute(tx.acquire().await?)
                .await?;
        }

        tx.commit().await?;

        Ok(id)
    }

    pub async fn remove(&self, package_id: Id) -> Result<(), Error> {
        let pool = self.pool.lock().await;
        delete_package_conn(&*pool, package_id).await
    }

    pub async fn insert_automerge_files(&self, package_id: Id, files: &HashMap<String, String>) -> Result<(), Error> {
        let pool = self.pool.lock().await;
        let mut tx = pool.begin().await?;

        sqlx::query("DELETE FROM automerge_files WHERE package_id = ?;")
            .bind(package_id.0)
            .execute(tx.acquire().await?)
            .await?;

        for (destination, md5) in files {
            sqlx::query("INSERT INTO automerge_files (package_id, destination_path, md5) VALUES (?, ?, ?);")
                .bind(package_id.0)
                .bind(destination)
                .bind(md5)
                .execute(tx.acquire().await?)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn retrieve_automerge_files(&self, package_id: Id) -> Result<HashMap<String, String>, Error> {
        let pool = self.pool.lock().await;
        let rows = sqlx::query("SELECT destination_path, md5 FROM automerge_files WHERE package_id = ?;")
            .bind(package_id.0)
            .fetch_all(&*pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get::<String, _>("destination_path"), r.get::<String, _>("md5")))
            .collect())
    }

    pub async fn retrieve_trigger_data(&self, package_id: Id) -> Result<Vec<TriggerSpec>, Error> {
        let pool = self.pool.lock().await;
        let rows = sqlx::query("SELECT name, handler FROM package_triggers WHERE package_id = ?;")
            .bind(package_id.0)
            .fetch_all(&*pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| TriggerSpec {
                name: r.get("name"),
                handler: r.get("handler"),
            })
            .collect())
    }

    /// Which still-installed packages (in this, the installed, store) list
    /// `soname` in their `needed` set (consulted by C7 before deleting a
    /// library during `install_clean`).
    pub async fn packages_needing_soname(&self, soname: &str) -> Result<Vec<Id>, Error> {
        let pool = self.pool.lock().await;
        let rows = sqlx::query("SELECT DISTINCT package_id FROM package_needed WHERE soname = ?;")
            .bind(soname)
            .fetch_all(&*pool)
            .await?;
        Ok(rows.into_iter().map(|r| Id(r.get::<i64, _>("package_id"))).collect())
    }
}

fn dep_to_string(dep: &Dependency) -> String {
    let mut s = String::new();
    if let Some(blocker) = dep.blocker {
        s.push_str(match blocker {
            atom::Blocker::Weak => "!",
            atom::Blocker::Strong => "!!",
        });
    }
    if let Some(op) = dep.operator {
        s.push_str(&op.to_string());
    }
    s.push_str(&dep.atom.to_string());
    if !dep.uses.is_empty() {
        s.push('[');
        s.push_str(
            &dep.uses
                .iter()
                .map(|u| if u.negated { format!("-{}", u.flag) } else { u.flag.clone() })
                .collect::<Vec<_>>()
                .join(","),
        );
        s.push(']');
    }
    s
}

async fn fetch_dependency_rows<'a>(
    pool: &Pool<Sqlite>,
    table: &str,
    package_id: Id,
) -> Result<Vec<Dependency>, Error> {
    let column = if table == "package_conflicts" { "conflict" } else { "dependency" };
    let query = format!("SELECT {column} FROM {table} WHERE package_id = ?;");
    let rows = sqlx::query(&query).bind(package_id.0).fetch_all(pool).await?;
    Ok(rows
        .into_iter()
        .filter_map(|r| Dependency::parse(&r.get::<String, _>(0)).ok())
        .collect())
}

async fn find_key_slot_conn<'c>(
    conn: impl Executor<'c, Database = Sqlite>,
    category: &str,
    name: &str,
    slot: Option<&str>,
) -> Result<Option<Id>, Error> {
    let row = if let Some(slot) = slot {
        sqlx::query("SELECT package_id FROM packages WHERE category = ? AND name = ? AND slot = ?;")
            .bind(category)
            .bind(name)
            .bind(slot)
            .fetch_optional(conn)
            .await?
    } else {
        sqlx::query("SELECT package_id FROM packages WHERE category = ? AND name = ? AND slot IS NULL;")
            .bind(category)
            .bind(name)
            .fetch_optional(conn)
            .await?
    };
    Ok(row.map(|r| Id(r.get::<i64, _>("package_id"))))
}

async fn delete_package_conn<'c>(conn: impl Executor<'c, Database = Sqlite>, package_id: Id) -> Result<(), Error> {
    sqlx::query("DELETE FROM packages WHERE package_id = ?;")
        .bind(package_id.0)
        .execute(conn)
        .await?;
    Ok(())
}

/// Highest version+revision wins (spec.md §4.2 tie-break (a)).
fn is_higher(candidate: &AtomFields, current: &AtomFields) -> bool {
    let cv = candidate.version.as_deref().and_then(|v| atom::Version::parse(v).ok());
    let ov = current.version.as_deref().and_then(|v| atom::Version::parse(v).ok());
    match (cv, ov) {
        (Some(cv), Some(ov)) => match cv.cmp(&ov) {
            std::cmp::Ordering::Equal => candidate.revision > current.revision,
            ordering => ordering == std::cmp::Ordering::Greater,
        },
        (Some(_), None) => true,
        _ => candidate.revision > current.revision,
    }
}
