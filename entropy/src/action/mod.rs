// SPDX-License-Identifier: MPL-2.0

//! The transactional package lifecycle (spec.md §4.6): one action is either
//! an install or a remove, driven through a fixed phase list by
//! [`crate::orchestrator`]. Phase functions live in [`install`] and
//! [`remove`]; the image→root merge they share lives in [`blit`]; the
//! external source-package-manager collaborator lives in [`spm`].

pub mod blit;
pub mod install;
pub mod remove;
pub mod spm;

pub use spm::{HookMetadata, NullSourceManager, SourceManagerHooks};

use atom::Atom;
use store::Id;

/// Which side of the phase list an action belongs to — also the
/// discriminant [`crate::error::Outcome::from_kind`] dispatches on to
/// disambiguate a plain I/O failure (spec.md §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Install,
    Remove,
}

/// One action's progress through its phase list (spec.md §4.6's named
/// states). The orchestrator advances an item through these in order;
/// `Cancelled` can only be entered between phases, never mid-phase, since a
/// single phase's filesystem mutation is itself atomic or not attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Enqueued,
    Authorized,
    Preparing,
    Fetching,
    Applying,
    Committing,
    Done,
    Failed,
    Cancelled,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Done | Status::Failed | Status::Cancelled)
    }
}

/// One unit of work accepted by `enqueue_action` (spec.md §6, §3
/// `ActionQueueItem`). `target` names a package available in some
/// configured repository for an install, or an already-installed package's
/// row id for a remove.
#[derive(Debug, Clone)]
pub struct ActionQueueItem {
    pub id: u64,
    pub kind: ActionKind,
    pub target: ActionTarget,
    pub status: Status,
    /// Dry-run: the solver and fetcher still execute, but `Applying`
    /// is skipped and the item is reported `Done` without touching the
    /// filesystem or the installed store.
    pub simulate: bool,
    /// Set by the policy authorizer during `Enqueued -> Authorized`
    /// (spec.md §4.6 state machine); `enqueue_action` always creates an
    /// item with this `false`.
    pub authorized: bool,
    /// Remove-only: lets `reverse_queue` remove a `system_critical` target
    /// instead of failing with `NotRemovable` (spec.md §4.4
    /// `reverse_queue`'s `system_packages` argument).
    pub allow_system_critical: bool,
}

impl ActionQueueItem {
    pub fn install(id: u64, atom: Atom) -> Self {
        ActionQueueItem {
            id,
            kind: ActionKind::Install,
            target: ActionTarget::Requested(atom),
            status: Status::Enqueued,
            simulate: false,
            authorized: false,
            allow_system_critical: false,
        }
    }

    pub fn remove(id: u64, package_id: Id) -> Self {
        ActionQueueItem {
            id,
            kind: ActionKind::Remove,
            target: ActionTarget::Installed(package_id),
            status: Status::Enqueued,
            simulate: false,
            authorized: false,
            allow_system_critical: false,
        }
    }
}

/// What an action is acting on, resolved once at enqueue time so later
/// phases never need to re-parse the atom.
#[derive(Debug, Clone)]
pub enum ActionTarget {
    /// Install: the atom as requested by the caller, resolved against the
    /// repository set by the solver during `Preparing`.
    Requested(Atom),
    /// Remove: the installed package's row id, already resolved.
    Installed(Id),
}
