// SPDX-License-Identifier: MPL-2.0

//! Configuration Protection (spec.md §4.8, C8): classifies filesystem
//! destinations as protected, masked, or skipped, decides whether a
//! protected file may be overwritten or must be stashed beside the live
//! copy, and scans/manages the resulting pending updates. Generalizes the
//! teacher's `crates/config` YAML domain loader (admin/vendor merge) with
//! the install-time file-protection decision the teacher itself doesn't
//! need, since `moss` never mutates `/etc` files directly.

mod files;
mod protection;

pub use files::{ConfigurationUpdate, ConfigurationFiles, Error};
pub use protection::{Classification, Decision, ProtectionRules};
