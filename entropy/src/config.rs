// SPDX-License-Identifier: MPL-2.0

//! Configuration loading (spec.md §10 ambient stack): a trimmed, single-
//! domain version of the teacher's `crates/config` (`Config` trait +
//! `Manager::system` merging vendor (`usr/share`) then admin (`etc`) YAML).
//! `entropy` only ever has one configuration domain — its own settings — so
//! the generic `Config`/`Manager` split collapses into one `Settings::load`,
//! but the vendor-then-admin merge order and the `.yaml` extension
//! convention are carried over unchanged.

use std::path::{Path, PathBuf};

use serde::Deserialize;

const PROGRAM: &str = "entropy";
const DOMAIN: &str = "config";
const EXTENSION: &str = "yaml";

/// Deserialized shape of one `config.yaml` file. Every field is optional so
/// the vendor and admin files can each override only what they care about;
/// [`Fragment::merge`] lets a later (higher-priority) fragment win per field.
#[derive(Debug, Clone, Default, Deserialize)]
struct Fragment {
    protect: Option<Vec<PathBuf>>,
    mask: Option<Vec<PathBuf>>,
    skip: Option<Vec<PathBuf>>,
    splitdebug: Option<bool>,
    network_parallelism: Option<usize>,
    collision_strict: Option<bool>,
}

impl Fragment {
    fn merge(self, other: Fragment) -> Fragment {
        Fragment {
            protect: other.protect.or(self.protect),
            mask: other.mask.or(self.mask),
            skip: other.skip.or(self.skip),
            splitdebug: other.splitdebug.or(self.splitdebug),
            network_parallelism: other.network_parallelism.or(self.network_parallelism),
            collision_strict: other.collision_strict.or(self.collision_strict),
        }
    }
}

/// Resolved settings used across C6/C8/C5 (protect/mask/skip lists feed
/// [`configure::ProtectionRules`]; `network_parallelism` feeds
/// `fetch::Fetcher::fetch_many`; `collision_strict` feeds the C6 collision
/// policy).
#[derive(Debug, Clone)]
pub struct Settings {
    pub protection: configure::ProtectionRules,
    pub splitdebug: bool,
    pub network_parallelism: usize,
    pub collision_strict: bool,
    protection_roots: Vec<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            protection: configure::ProtectionRules::default(),
            splitdebug: false,
            network_parallelism: 4,
            collision_strict: true,
            protection_roots: Vec::new(),
        }
    }
}

impl Settings {
    /// Loads `usr/share/entropy/config.yaml` (vendor defaults) then
    /// `etc/entropy/config.yaml` (admin override) under `root`, in that
    /// order, matching the teacher's vendor-then-admin precedence. Missing
    /// files are not an error: a system with no configuration at all still
    /// gets workable defaults.
    pub async fn load(root: &Path) -> Self {
        let vendor = root.join("usr/share").join(PROGRAM).join(format!("{DOMAIN}.{EXTENSION}"));
        let admin = root.join("etc").join(PROGRAM).join(format!("{DOMAIN}.{EXTENSION}"));

        let mut fragment = Fragment::default();
        for path in [vendor, admin] {
            if let Some(read) = read_fragment(&path).await {
                fragment = fragment.merge(read);
            }
        }

        let defaults = Settings::default();
        let protect = fragment.protect.unwrap_or_else(|| vec![root.join("etc")]);
        let mask = fragment.mask.unwrap_or_default();
        let skip = fragment.skip.unwrap_or_else(|| vec![root.join("etc/entropy")]);

        Settings {
            protection: configure::ProtectionRules {
                protect: protect.clone(),
                mask,
                skip,
            },
            splitdebug: fragment.splitdebug.unwrap_or(defaults.splitdebug),
            network_parallelism: fragment.network_parallelism.unwrap_or(defaults.network_parallelism),
            collision_strict: fragment.collision_strict.unwrap_or(defaults.collision_strict),
            protection_roots: protect,
        }
    }

    /// Roots `configure::ConfigurationFiles` recursively scans for pending
    /// stashes — the same paths protection applies under.
    pub fn protection_roots(&self) -> Vec<PathBuf> {
        self.protection_roots.clone()
    }
}

async fn read_fragment(path: &Path) -> Option<Fragment> {
    let bytes = tokio::fs::read(path).await.ok()?;
    serde_yaml::from_slice(&bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_merge_prefers_later_value() {
        let a = Fragment {
            splitdebug: Some(false),
            ..Fragment::default()
        };
        let b = Fragment {
            splitdebug: Some(true),
            network_parallelism: Some(8),
            ..Fragment::default()
        };
        let merged = a.merge(b);
        assert_eq!(merged.splitdebug, Some(true));
        assert_eq!(merged.network_parallelism, Some(8));
    }

    #[tokio::test]
    async fn load_defaults_when_no_files_present() {
        let root = std::env::temp_dir().join(format!("entropy-config-test-{}", std::process::id()));
        std::fs::create_dir_all(&root).unwrap();

        let settings = Settings::load(&root).await;
        assert!(settings.collision_strict);
        assert_eq!(settings.network_parallelism, 4);
    }

    #[tokio::test]
    async fn load_merges_vendor_then_admin() {
        let root = std::env::temp_dir().join(format!("entropy-config-test-merge-{}", std::process::id()));
        let vendor_dir = root.join("usr/share/entropy");
        let admin_dir = root.join("etc/entropy");
        std::fs::create_dir_all(&vendor_dir).unwrap();
        std::fs::create_dir_all(&admin_dir).unwrap();

        std::fs::write(vendor_dir.join("config.yaml"), "splitdebug: false\nnetwork_parallelism: 2\n").unwrap();
        std::fs::write(admin_dir.join("config.yaml"), "network_parallelism: 6\n").unwrap();

        let settings = Settings::load(&root).await;
        assert!(!settings.splitdebug);
        assert_eq!(settings.network_parallelism, 6);
    }
}
