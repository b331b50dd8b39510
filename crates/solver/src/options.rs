// SPDX-License-Identifier: MPL-2.0

/// Knobs accepted by [`crate::Solver::install_queue`] (spec.md §4.4).
#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    /// Re-resolve already-satisfied dependencies against available
    /// repositories instead of keeping the installed version.
    pub deep: bool,
    /// Pull the full transitive closure rather than just direct
    /// dependencies of the requested set.
    pub recursive: bool,
    /// Exempt an installed package and its own upgrade candidate from
    /// (key, slot) collision detection (SPEC_FULL.md §13 resolved Open
    /// Question 2).
    pub relaxed: bool,
    /// Include build-time-only dependencies in the closure.
    pub build_deps: bool,
}
