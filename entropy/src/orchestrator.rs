// SPDX-License-Identifier: MPL-2.0

//! Transaction Orchestrator (spec.md §4.9, C9): accepts enqueued actions,
//! serializes them against [`lock::ResourceLock`] (C3), drives each through
//! C6's phase list, and reports progress/outcome as the narrow command/event
//! channel named in spec.md §9's design note. A single worker task drains
//! the queue FIFO, matching the teacher's own `Client` — which only ever
//! drives one CLI subcommand's worth of work at a time
//! (`examples/serpent-os-tools/crates/moss/src/client/mod.rs`) — generalized
//! here into an explicit queue that can outlive any one request and supports
//! cooperative cancellation between items.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use atom::Atom;
use solver::{Candidate, Options as SolverOptions, Solver};
use store::{Id, Record};
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;

use crate::action::install::{install, ImageSource, InstallRequest};
use crate::action::remove::remove_with_spm;
use crate::action::spm::{NullSourceManager, SourceManagerHooks};
use crate::action::{ActionKind, ActionQueueItem, ActionTarget, Status};
use crate::context::Context;
use crate::error::Outcome;
use crate::Error;

/// spec.md §4.9 "current activity": `UPDATING_REPOSITORIES`,
/// `MANAGING_APPLICATIONS`, `UPGRADING_SYSTEM`, or `AVAILABLE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Available,
    UpdatingRepositories,
    ManagingApplications,
    UpgradingSystem,
}

/// The signal events of spec.md §6's exposed API.
#[derive(Debug, Clone)]
pub enum Event {
    ActivityStarted(Activity),
    ActivityProgress { activity: Activity, percent: Option<u8> },
    ActivityCompleted(Activity),
    ProcessingApplication { item_id: u64 },
    ApplicationProcessingUpdate { item_id: u64, percent: Option<u8> },
    ApplicationProcessed { item_id: u64, outcome: Outcome },
    ApplicationsManaged { processed: usize },
    ConfigurationUpdatesAvailable(usize),
    RepositoriesUpdated,
    UpdatesAvailable(usize),
}

/// Absent from the original Python `upgrade.py` (SPEC_FULL.md §11): bounds
/// the "did the upgrade expose more updates" re-spawn loop so a repository
/// graph that never converges can't spin the orchestrator forever.
const MAX_UPGRADE_RESPAWNS: usize = 8;

const EVENT_CHANNEL_CAPACITY: usize = 256;

struct Shared {
    items: Mutex<Vec<ActionQueueItem>>,
    queue: Mutex<VecDeque<u64>>,
    notify: Notify,
    activity: Mutex<Activity>,
    interrupted: AtomicBool,
    next_id: AtomicU64,
    shutdown: AtomicBool,
}

impl Shared {
    async fn find(&self, item_id: u64) -> Option<ActionQueueItem> {
        self.items.lock().await.iter().find(|item| item.id == item_id).cloned()
    }

    async fn set_status(&self, item_id: u64, status: Status) {
        if let Some(item) = self.items.lock().await.iter_mut().find(|item| item.id == item_id) {
            item.status = status;
        }
    }
}

/// Accepts `enqueue_action`/`interrupt`/activity queries (spec.md §6) and
/// drives a single background worker that runs the phase lists of
/// [`crate::action`]. Cloning an `Orchestrator` shares the same queue and
/// worker — it is a cheap handle, like the teacher's own `Client` passed
/// around by reference.
#[derive(Clone)]
pub struct Orchestrator {
    ctx: Arc<Context>,
    spm: Arc<dyn SourceManagerHooks>,
    shared: Arc<Shared>,
    events: broadcast::Sender<Event>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Orchestrator {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self::with_source_manager(ctx, Arc::new(NullSourceManager))
    }

    pub fn with_source_manager(ctx: Arc<Context>, spm: Arc<dyn SourceManagerHooks>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            items: Mutex::new(Vec::new()),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            activity: Mutex::new(Activity::Available),
            interrupted: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
        });

        let worker = tokio::spawn(worker_loop(ctx.clone(), spm.clone(), shared.clone(), events.clone()));

        Orchestrator {
            ctx,
            spm,
            shared,
            events,
            worker: Arc::new(Mutex::new(Some(worker))),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub async fn activity(&self) -> Activity {
        *self.shared.activity.lock().await
    }

    pub async fn action_queue_items(&self) -> Vec<ActionQueueItem> {
        self.shared.items.lock().await.clone()
    }

    /// `enqueue_action` (spec.md §6): appends an install or remove request
    /// to the FIFO queue and wakes the worker. Returns the assigned item id.
    pub async fn enqueue_action(&self, kind: ActionKind, target: ActionTarget) -> u64 {
        self.enqueue_item(kind, target, false, false).await
    }

    /// Same as [`Self::enqueue_action`], but runs the solver/fetch phases
    /// without ever touching the live filesystem or installed store
    /// (`simulate: bool` in spec.md §3's `ActionQueueItem`).
    pub async fn enqueue_simulated(&self, kind: ActionKind, target: ActionTarget) -> u64 {
        self.enqueue_item(kind, target, true, false).await
    }

    async fn enqueue_item(&self, kind: ActionKind, target: ActionTarget, simulate: bool, allow_system_critical: bool) -> u64 {
        let id = self.shared.next_id.fetch_add(1, AtomicOrdering::SeqCst);
        let item = ActionQueueItem {
            id,
            kind,
            target,
            status: Status::Enqueued,
            simulate,
            authorized: true,
            allow_system_critical,
        };
        self.shared.items.lock().await.push(item);
        self.shared.queue.lock().await.push_back(id);
        self.shared.notify.notify_one();
        id
    }

    /// `update_repositories` (spec.md §6): out of scope per spec.md §1 (the
    /// HTTP/rsync sync fetcher is an external collaborator); this only
    /// drives the `UPDATING_REPOSITORIES` activity bracket and signal so a
    /// caller driving an external sync can still see it reflected in
    /// `activity()`/`activity_started`/`activity_completed`.
    pub async fn update_repositories(&self, sync: impl std::future::Future<Output = Result<(), Error>>) -> Result<(), Error> {
        self.run_activity(Activity::UpdatingRepositories, sync).await?;
        let _ = self.events.send(Event::RepositoriesUpdated);
        Ok(())
    }

    /// `upgrade_system` (spec.md §6, §4.9): resolves every installed
    /// package against the union of enabled repositories, enqueues the
    /// ones with a newer candidate as one `UPGRADING_SYSTEM` batch, waits
    /// for it to drain, and — spec.md §4.9's self-update re-spawn — re-runs
    /// the same resolution against the post-commit installed store,
    /// repeating while it still finds updates, up to
    /// [`MAX_UPGRADE_RESPAWNS`].
    pub async fn upgrade_system(&self) -> Result<usize, Error> {
        let mut total = 0usize;
        for _ in 0..MAX_UPGRADE_RESPAWNS {
            let candidates = self.pending_upgrades().await?;
            if candidates.is_empty() {
                break;
            }
            let _ = self.events.send(Event::UpdatesAvailable(candidates.len()));

            {
                let mut activity = self.shared.activity.lock().await;
                *activity = Activity::UpgradingSystem;
            }
            let _ = self.events.send(Event::ActivityStarted(Activity::UpgradingSystem));

            let mut item_ids = Vec::with_capacity(candidates.len());
            for atom in candidates {
                item_ids.push(self.enqueue_item(ActionKind::Install, ActionTarget::Requested(atom), false, false).await);
            }
            self.wait_for(&item_ids).await;
            total += item_ids.len();

            {
                let mut activity = self.shared.activity.lock().await;
                *activity = Activity::Available;
            }
            let _ = self.events.send(Event::ActivityCompleted(Activity::UpgradingSystem));
        }
        Ok(total)
    }

    async fn run_activity(&self, activity: Activity, future: impl std::future::Future<Output = Result<(), Error>>) -> Result<(), Error> {
        {
            let mut current = self.shared.activity.lock().await;
            *current = activity;
        }
        let _ = self.events.send(Event::ActivityStarted(activity));
        let result = future.await;
        {
            let mut current = self.shared.activity.lock().await;
            *current = Activity::Available;
        }
        let _ = self.events.send(Event::ActivityCompleted(activity));
        result
    }

    /// Every installed package's key resolved against the newest candidate
    /// across enabled repositories, filtered to the ones that are actually
    /// newer than what's installed.
    async fn pending_upgrades(&self) -> Result<Vec<Atom>, Error> {
        let ids = self.ctx.installed.all_ids().await?;
        let mut out = Vec::new();
        for id in ids {
            let record = self.ctx.installed.get(id).await?;
            let Ok(atom) = record.atom.to_atom() else { continue };
            let Ok(key_dep) = atom::Dependency::parse(&format!("{}/{}", atom.key.category, atom.key.name)) else {
                continue;
            };
            let Some((repository_id, candidate_id)) =
                self.ctx.repositories.atom_match(&key_dep, atom.slot.as_deref(), atom.tag.as_deref(), None).await?
            else {
                continue;
            };
            let Some(repository_id) = repository_id else { continue };
            let entry = match self.ctx.repositories.get(&repository_id) {
                Some(entry) => entry,
                None => continue,
            };
            let candidate_record = entry.database.get(candidate_id).await?;
            let Ok(candidate_atom) = candidate_record.atom.to_atom() else { continue };
            let ordering = candidate_atom.version.cmp(&atom.version).then(candidate_atom.revision.cmp(&atom.revision));
            if ordering == std::cmp::Ordering::Greater {
                out.push(candidate_atom);
            }
        }
        Ok(out)
    }

    /// `interrupt()` (spec.md §6, §5 Cancellation): sets the flag the
    /// worker checks at phase/item boundaries. An in-flight phase is never
    /// aborted mid-flight; only items not yet `Applying` are affected.
    pub fn interrupt(&self) {
        self.shared.interrupted.store(true, AtomicOrdering::SeqCst);
    }

    /// Clears a prior [`Self::interrupt`], so a fresh batch of enqueues
    /// isn't immediately cancelled by a stale flag.
    pub fn reset_interrupt(&self) {
        self.shared.interrupted.store(false, AtomicOrdering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.shared.interrupted.load(AtomicOrdering::SeqCst)
    }

    /// `merge_configuration`/`discard_configuration`/`diff_configuration`
    /// (spec.md §6): thin pass-throughs to C8's `ConfigurationFiles`, which
    /// is stateless with respect to the queue, so they don't need to go
    /// through the worker.
    pub async fn merge_configuration(&self, update: &configure::ConfigurationUpdate) -> Result<(), Error> {
        Ok(self.ctx.configuration_files().merge(update).await?)
    }

    pub async fn discard_configuration(&self, update: &configure::ConfigurationUpdate) -> Result<(), Error> {
        Ok(self.ctx.configuration_files().discard(update).await?)
    }

    pub fn diff_configuration(&self, update: &configure::ConfigurationUpdate) -> PathBuf {
        self.ctx.configuration_files().diff(update)
    }

    /// Blocks until every id in `ids` reaches a terminal [`Status`],
    /// polling the shared item table. Used by [`Self::upgrade_system`] to
    /// wait out one batch before deciding whether to re-spawn.
    async fn wait_for(&self, ids: &[u64]) {
        loop {
            let items = self.shared.items.lock().await;
            let all_terminal = ids
                .iter()
                .all(|id| items.iter().find(|item| item.id == *id).map_or(true, |item| item.status.is_terminal()));
            drop(items);
            if all_terminal {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }

    /// Stops the worker task. Items already drained from the queue and
    /// mid-flight are allowed to finish; nothing new is dequeued after this.
    pub async fn shutdown(&self) {
        self.shared.shutdown.store(true, AtomicOrdering::SeqCst);
        self.shared.notify.notify_one();
        if let Some(handle) = self.worker.lock().await.take() {
            let _ = handle.await;
        }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }
}

async fn worker_loop(ctx: Arc<Context>, spm: Arc<dyn SourceManagerHooks>, shared: Arc<Shared>, events: broadcast::Sender<Event>) {
    let mut processed_since_available = 0usize;

    loop {
        if shared.shutdown.load(AtomicOrdering::SeqCst) {
            return;
        }

        let next_id = shared.queue.lock().await.pop_front();

        let Some(item_id) = next_id else {
            let mut activity = shared.activity.lock().await;
            if *activity != Activity::Available {
                let completed = *activity;
                *activity = Activity::Available;
                drop(activity);
                let _ = events.send(Event::ActivityCompleted(completed));
                if processed_since_available > 0 {
                    let _ = events.send(Event::ApplicationsManaged {
                        processed: processed_since_available,
                    });
                    processed_since_available = 0;
                }
            } else {
                drop(activity);
            }

            tokio::select! {
                () = shared.notify.notified() => {}
                () = tokio::time::sleep(std::time::Duration::from_millis(200)) => {}
            }
            continue;
        };

        // Cooperative cancellation between items (spec.md §5): an
        // interrupted queue fails every remaining item with
        // `PermissionDenied` without attempting any of its phases.
        if shared.interrupted.load(AtomicOrdering::SeqCst) {
            shared.set_status(item_id, Status::Cancelled).await;
            let _ = events.send(Event::ApplicationProcessed {
                item_id,
                outcome: Outcome::PermissionDenied,
            });
            continue;
        }

        shared.set_status(item_id, Status::Authorized).await;

        {
            let mut activity = shared.activity.lock().await;
            if *activity == Activity::Available {
                *activity = Activity::ManagingApplications;
                let started = *activity;
                drop(activity);
                let _ = events.send(Event::ActivityStarted(started));
            }
        }

        let _ = events.send(Event::ProcessingApplication { item_id });

        let result = process_item(&ctx, spm.as_ref(), &shared, item_id).await;
        processed_since_available += 1;

        let Some(item) = shared.find(item_id).await else { continue };
        let (status, outcome) = match result {
            Ok(()) => (Status::Done, Outcome::Success),
            Err(err) => {
                log::warn!("action {item_id} failed: {err}");
                (Status::Failed, Outcome::from_kind(err.kind(), item.kind))
            }
        };
        shared.set_status(item_id, status).await;
        let _ = events.send(Event::ApplicationProcessed { item_id, outcome });
    }
}

/// Runs one item's `Preparing -> Fetching -> Applying -> Committing` span
/// (spec.md §4.6 state machine), promoting the resource lock from shared to
/// exclusive around the whole span (spec.md §4.9: "upgrades the resource
/// lock from shared to exclusive, asking peers to release first").
async fn process_item(ctx: &Context, spm: &dyn SourceManagerHooks, shared: &Shared, item_id: u64) -> Result<(), Error> {
    let Some(item) = shared.find(item_id).await else {
        return Err(Error::Internal(format!("action {item_id} vanished from the queue")));
    };

    shared.set_status(item_id, Status::Preparing).await;
    let _guard = ctx.lock.acquire(lock::Mode::Exclusive, true)?;

    match item.kind {
        ActionKind::Install => {
            let ActionTarget::Requested(atom) = &item.target else {
                return Err(Error::Internal("install item missing a requested atom".into()));
            };
            let requested = resolve_requested(ctx, atom).await?;
            run_install(ctx, spm, shared, item_id, item.simulate, &[requested]).await
        }
        ActionKind::Remove => {
            let ActionTarget::Installed(package_id) = &item.target else {
                return Err(Error::Internal("remove item missing an installed package id".into()));
            };
            run_remove(ctx, spm, shared, item_id, item.simulate, *package_id, item.allow_system_critical).await
        }
    }
}

async fn resolve_requested(ctx: &Context, atom: &Atom) -> Result<Candidate, Error> {
    let dep = atom::Dependency::parse(&atom.to_string()).map_err(|err| Error::Internal(err.to_string()))?;
    let resolved = ctx
        .repositories
        .atom_match(&dep, atom.slot.as_deref(), atom.tag.as_deref(), None)
        .await?
        .ok_or_else(|| solver::Error::from(solver::NotFoundError(atom.to_string())))?;
    Ok(Candidate {
        repository_id: resolved.0,
        package_id: resolved.1,
    })
}

async fn run_install(
    ctx: &Context,
    spm: &dyn SourceManagerHooks,
    shared: &Shared,
    item_id: u64,
    simulate: bool,
    requested: &[Candidate],
) -> Result<(), Error> {
    let solver = Solver::new(&ctx.repositories, &ctx.installed);
    let queue = solver.install_queue(requested, SolverOptions { recursive: true, ..Default::default() }).await?;

    shared.set_status(item_id, Status::Fetching).await;

    let to_install: Vec<&Candidate> = queue.install_seq.iter().filter(|c| c.repository_id.is_some()).collect();
    let mut fetched: HashMap<Id, (Record, PathBuf)> = HashMap::new();
    for candidate in &to_install {
        let record = fetch_record(ctx, candidate).await?;
        if !simulate {
            let artifact_path = fetch_artifact(ctx, candidate, &record).await?;
            fetched.insert(candidate.package_id, (record, artifact_path));
        } else {
            fetched.insert(candidate.package_id, (record, PathBuf::new()));
        }
    }

    if simulate {
        return Ok(());
    }

    shared.set_status(item_id, Status::Applying).await;

    let mut replaced_ids: HashSet<Id> = HashSet::new();
    let mut replaces_for: HashMap<Id, Id> = HashMap::new();
    for candidate in &to_install {
        let (record, _) = &fetched[&candidate.package_id];
        if let Some(existing) = ctx.installed.find_by_key_slot(&record.atom.category, &record.atom.name, record.atom.slot.as_deref()).await? {
            replaces_for.insert(candidate.package_id, existing);
            replaced_ids.insert(existing);
        }
    }

    let standalone_conflicts: Vec<Id> =
        queue.removal_seq.iter().map(|c| c.package_id).filter(|id| !replaced_ids.contains(id)).collect();

    let host_arch = std::env::consts::ARCH;
    for (index, candidate) in to_install.iter().enumerate() {
        let (record, artifact_path) = fetched.remove(&candidate.package_id).expect("fetched above");
        let conflicting_removals = if index == 0 { standalone_conflicts.clone() } else { Vec::new() };
        let request = InstallRequest {
            record,
            source: ImageSource::Artifact {
                path: &artifact_path,
                host_arch,
            },
            replaces: replaces_for.get(&candidate.package_id).copied(),
            conflicting_removals,
        };
        install(ctx, spm, request, 0).await?;

        shared.set_status(item_id, Status::Committing).await;
    }

    Ok(())
}

async fn run_remove(
    ctx: &Context,
    spm: &dyn SourceManagerHooks,
    shared: &Shared,
    item_id: u64,
    simulate: bool,
    package_id: Id,
    allow_system_critical: bool,
) -> Result<(), Error> {
    let solver = Solver::new(&ctx.repositories, &ctx.installed);
    let order = solver.reverse_queue(&[package_id], allow_system_critical).await?;

    shared.set_status(item_id, Status::Fetching).await;
    if simulate {
        return Ok(());
    }

    shared.set_status(item_id, Status::Applying).await;
    for id in order {
        remove_with_spm(ctx, spm, id, 0).await?;
        shared.set_status(item_id, Status::Committing).await;
    }
    Ok(())
}

async fn fetch_record(ctx: &Context, candidate: &Candidate) -> Result<Record, Error> {
    match &candidate.repository_id {
        None => Ok(ctx.installed.get(candidate.package_id).await?),
        Some(repository_id) => {
            let entry = ctx
                .repositories
                .get(repository_id)
                .ok_or_else(|| Error::Internal(format!("unknown repository {repository_id}")))?;
            Ok(entry.database.get(candidate.package_id).await?)
        }
    }
}

async fn fetch_artifact(ctx: &Context, candidate: &Candidate, record: &Record) -> Result<PathBuf, Error> {
    let url_str = record
        .download_url
        .as_deref()
        .ok_or_else(|| Error::Internal(format!("package {} has no download url", candidate.package_id)))?;
    let url = url::Url::parse(url_str)?;
    let filename = record.artifact_checksum.clone().unwrap_or_else(|| candidate.package_id.0.to_string());
    let dest = ctx.paths.cache_dir.join(filename);
    ctx.fetcher.fetch_one(&url, &dest, record.artifact_checksum.as_deref(), |_progress| {}).await?;
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::package::AtomFields;

    fn scratch_root(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("orchestrator-test-{}-{}", std::process::id(), name));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn enqueue_remove_of_unknown_package_reports_failure() {
        let root = scratch_root("remove-missing");
        let ctx = Arc::new(Context::open(&root).await.unwrap());
        let orchestrator = Orchestrator::new(ctx);

        let mut events = orchestrator.subscribe();
        let id = orchestrator.enqueue_action(ActionKind::Remove, ActionTarget::Installed(Id(999))).await;

        let outcome = loop {
            match events.recv().await.unwrap() {
                Event::ApplicationProcessed { item_id, outcome } if item_id == id => break outcome,
                _ => continue,
            }
        };
        assert!(matches!(outcome, Outcome::InternalError | Outcome::RemoveError | Outcome::DependenciesNotFoundError));
    }

    #[tokio::test]
    async fn interrupt_cancels_queued_items_before_they_run() {
        let root = scratch_root("interrupt");
        let ctx = Arc::new(Context::open(&root).await.unwrap());
        let id = ctx
            .installed
            .handle_package(Record {
                atom: AtomFields {
                    category: "app".into(),
                    name: "hello".into(),
                    version: Some("1.0".into()),
                    ..Default::default()
                },
                ..Default::default()
            })
            .await
            .unwrap();

        let orchestrator = Orchestrator::new(ctx.clone());
        orchestrator.interrupt();

        let mut events = orchestrator.subscribe();
        let item_id = orchestrator.enqueue_action(ActionKind::Remove, ActionTarget::Installed(id)).await;

        let outcome = loop {
            match events.recv().await.unwrap() {
                Event::ApplicationProcessed { item_id: got, outcome } if got == item_id => break outcome,
                _ => continue,
            }
        };
        assert!(matches!(outcome, Outcome::PermissionDenied));
        assert!(ctx.installed.get(id).await.is_ok(), "cancelled removal must not touch the installed store");
    }

    #[tokio::test]
    async fn activity_returns_to_available_after_queue_drains() {
        let root = scratch_root("activity");
        let ctx = Arc::new(Context::open(&root).await.unwrap());
        let orchestrator = Orchestrator::new(ctx);

        let mut events = orchestrator.subscribe();
        let id = orchestrator.enqueue_action(ActionKind::Remove, ActionTarget::Installed(Id(1))).await;
        loop {
            if let Event::ApplicationProcessed { item_id, .. } = events.recv().await.unwrap() {
                if item_id == id {
                    break;
                }
            }
        }

        for _ in 0..50 {
            if orchestrator.activity().await == Activity::Available {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("activity did not return to Available after the queue drained");
    }
}
