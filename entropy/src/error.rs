// SPDX-License-Identifier: MPL-2.0

//! Error kinds and user-visible outcomes (spec.md §7). Every crate below
//! this one keeps its own `thiserror` enum; [`Error`] aggregates them with
//! `#[from]` the way the teacher's own `client::install::Error` aggregates
//! `transaction::Error`/`db::meta::Error`/etc, and [`Kind`] is the one place
//! those per-crate errors get collapsed into the coarse classification the
//! orchestrator reports outcomes from.

use thiserror::Error;

use crate::action::ActionKind;

#[derive(Debug, Error)]
pub enum Error {
    #[error("archive")]
    Archive(#[from] archive::Error),
    #[error("store")]
    Store(#[from] store::Error),
    #[error("solver")]
    Solver(#[from] solver::Error),
    #[error("fetch")]
    Fetch(#[from] fetch::Error),
    #[error("lock")]
    Lock(#[from] lock::Error),
    #[error("preserve")]
    Preserve(#[from] preserve::Error),
    #[error("configure")]
    Configure(#[from] configure::Error),
    #[error("triggers")]
    Triggers(#[from] triggers::Error),
    #[error("atom parse: {0}")]
    Atom(#[from] atom::ParseError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("url parse: {0}")]
    Url(#[from] url::ParseError),

    #[error("collision: {0} is owned by another installed package")]
    Collision(String),
    #[error("package is not removable: {0}")]
    NotRemovable(String),
    #[error("architecture mismatch: artifact is {artifact}, host is {host}")]
    InvalidArchitecture { artifact: String, host: String },
    #[error("insufficient disk space: need {needed} bytes, {available} available")]
    DiskFull { needed: u64, available: u64 },
    #[error("operation aborted")]
    Aborted,
    #[error("conflict removal recursed past the depth limit ({0})")]
    ConflictDepthExceeded(usize),
    #[error("internal error: {0}")]
    Internal(String),
}

/// The coarse error classification of spec.md §7. Distinct from [`Error`]:
/// every phase returns a rich [`Error`], and only the orchestrator boundary
/// (spec.md §7 propagation policy: "only the orchestrator translates kinds
/// into the user-visible outcome") collapses it down to a `Kind` and then an
/// [`Outcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Parse,
    NotFound,
    Collision,
    NotRemovable,
    ChecksumMismatch,
    SignatureMismatch,
    DiskFull,
    PermissionDenied,
    LockBusy,
    IoError,
    Aborted,
    InvalidArchitecture,
    InternalError,
}

impl Error {
    pub fn kind(&self) -> Kind {
        match self {
            Error::Archive(archive::Error::ArchMismatch { .. }) => Kind::InvalidArchitecture,
            Error::Archive(_) => Kind::IoError,
            Error::Atom(_) => Kind::Parse,
            Error::Store(store::Error::RowNotFound) => Kind::NotFound,
            Error::Store(_) => Kind::IoError,
            Error::Solver(solver::Error::NotFound(_)) => Kind::NotFound,
            Error::Solver(solver::Error::Collision(_)) => Kind::Collision,
            Error::Solver(solver::Error::NotRemovable(_)) => Kind::NotRemovable,
            Error::Solver(solver::Error::DiskFull(_)) => Kind::DiskFull,
            Error::Solver(solver::Error::Store(_)) => Kind::IoError,
            Error::Fetch(fetch::Error::Checksum { .. }) => Kind::ChecksumMismatch,
            Error::Fetch(_) => Kind::IoError,
            Error::Lock(lock::Error::Busy) | Error::Lock(lock::Error::Refused) => Kind::LockBusy,
            Error::Lock(_) => Kind::IoError,
            Error::Preserve(_) => Kind::IoError,
            Error::Configure(_) => Kind::IoError,
            Error::Triggers(_) => Kind::IoError,
            Error::Io(_) => Kind::IoError,
            Error::Url(_) => Kind::Parse,
            Error::Collision(_) => Kind::Collision,
            Error::NotRemovable(_) => Kind::NotRemovable,
            Error::InvalidArchitecture { .. } => Kind::InvalidArchitecture,
            Error::DiskFull { .. } => Kind::DiskFull,
            Error::Aborted => Kind::Aborted,
            Error::ConflictDepthExceeded(_) => Kind::InternalError,
            Error::Internal(_) => Kind::InternalError,
        }
    }
}

/// User-visible outcome of one action (spec.md §7 / §6 `action_processed`
/// signal payload).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    InstallError,
    RemoveError,
    DownloadError,
    DependenciesNotFoundError,
    DependenciesCollisionError,
    DependenciesNotRemovableError,
    DiskFullError,
    PermissionDenied,
    InternalError,
}

impl Outcome {
    /// Maps a phase failure's [`Kind`] onto the outcome enum, disambiguating
    /// `IoError`/`ChecksumMismatch` by which side of the phase list failed
    /// (spec.md §7: `INSTALL_ERROR`/`REMOVE_ERROR`/`DOWNLOAD_ERROR` are all
    /// "I/O went wrong", just at different points in the action).
    pub fn from_kind(kind: Kind, action: ActionKind) -> Outcome {
        match kind {
            Kind::NotFound => Outcome::DependenciesNotFoundError,
            Kind::Collision => Outcome::DependenciesCollisionError,
            Kind::NotRemovable => Outcome::DependenciesNotRemovableError,
            Kind::DiskFull => Outcome::DiskFullError,
            Kind::Aborted => Outcome::PermissionDenied,
            Kind::ChecksumMismatch | Kind::SignatureMismatch => Outcome::DownloadError,
            Kind::Parse | Kind::InvalidArchitecture | Kind::InternalError | Kind::LockBusy => Outcome::InternalError,
            Kind::PermissionDenied => Outcome::PermissionDenied,
            Kind::IoError => match action {
                ActionKind::Install => Outcome::InstallError,
                ActionKind::Remove => Outcome::RemoveError,
            },
        }
    }
}
