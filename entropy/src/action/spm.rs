// SPDX-License-Identifier: MPL-2.0

//! Source-package-manager hook collaborator (spec.md §6: "Source-package-
//! manager install-setup and install-unpack hooks, called with the install
//! metadata"). Modeled as a trait, not a concrete implementation, per
//! spec.md's framing that this collaborator's interface is specified but its
//! implementation is out of scope — mirrors how the teacher treats
//! `container::Container` as an external collaborator it drives but does
//! not implement.

use std::path::Path;

use crate::Error;

/// Metadata describing one package action, passed to every hook (spec.md
/// §6 "called with the install metadata").
#[derive(Debug, Clone)]
pub struct HookMetadata<'a> {
    pub category: &'a str,
    pub name: &'a str,
    pub version: &'a str,
    pub slot: Option<&'a str>,
    pub image_dir: &'a Path,
    pub spm_uid: Option<&'a str>,
}

/// Hooks a source package manager (SPM) may want run around an install
/// (spec.md §4.6 `setup`/`install_spm` phases). Default methods are no-ops
/// so a deployment with no SPM integration can use [`NullSourceManager`]
/// unchanged.
pub trait SourceManagerHooks: Send + Sync {
    /// Runs before the image tree is built out, during the `setup` phase.
    fn install_setup(&self, _metadata: &HookMetadata<'_>) -> Result<(), Error> {
        Ok(())
    }

    /// Runs after unpack, also during `setup`, once the image tree exists
    /// on disk but before ownership/permissions are applied.
    fn install_unpack(&self, _metadata: &HookMetadata<'_>) -> Result<(), Error> {
        Ok(())
    }

    /// Runs during `install_spm`: persist whatever cross-reference the SPM
    /// needs and return the `spm_uid` to record against the installed row.
    fn install_spm(&self, _metadata: &HookMetadata<'_>) -> Result<Option<String>, Error> {
        Ok(None)
    }

    /// Runs during `remove_spm`: drop whatever cross-reference the SPM was
    /// keeping for this package.
    fn remove_spm(&self, _metadata: &HookMetadata<'_>) -> Result<(), Error> {
        Ok(())
    }
}

/// No SPM integration configured: every hook is a no-op.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSourceManager;

impl SourceManagerHooks for NullSourceManager {}
