// SPDX-License-Identifier: MPL-2.0

//! Trigger hook execution (spec.md §4.6: the "preinstall"/"postinstall"
//! triggers run by `pre_install`/`post_install`). A simpler model than the
//! teacher's own `crates/triggers`: that crate matches glob path patterns
//! accumulated across a whole transaction against handlers pulled from a
//! `BTreeMap<Pattern, PathDefinition>`; the action engine here only ever
//! needs to run one named bundle of hooks at a fixed point in a phase
//! list, so the pattern-matching layer is dropped and `Bundle`/`Hook`
//! keep only the handler shape (`format::Handler::Run`) and YAML loading
//! convention from that crate.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse trigger bundle {0:?}: {1}")]
    Yaml(PathBuf, #[source] serde_yaml::Error),
    #[error("spawn trigger hook {0:?}: {1}")]
    Spawn(PathBuf, #[source] std::io::Error),
    #[error("trigger hook {hook:?} exited with {status}")]
    Failed { hook: PathBuf, status: ExitStatus },
}

/// One executable step within a [`Bundle`].
#[derive(Debug, Clone, Deserialize)]
pub struct Hook {
    pub run: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

/// A named bundle of hooks, e.g. "preinstall" or "postinstall".
#[derive(Debug, Clone, Deserialize)]
pub struct Bundle {
    pub name: String,
    #[serde(default)]
    pub hooks: Vec<Hook>,
}

/// The set of trigger bundles known to the action engine, loaded from a
/// directory of YAML files (one `Bundle` per file), matching the
/// teacher's own config-loading convention of one domain-object per file.
#[derive(Debug, Default)]
pub struct Registry {
    bundles: HashMap<String, Bundle>,
}

impl Registry {
    pub fn new(bundles: impl IntoIterator<Item = Bundle>) -> Self {
        Self {
            bundles: bundles.into_iter().map(|b| (b.name.clone(), b)).collect(),
        }
    }

    /// Loads every `*.yaml` file in `dir` as a [`Bundle`]. A missing
    /// directory yields an empty registry rather than an error, since a
    /// package system with no configured triggers is a normal state.
    pub async fn load(dir: &Path) -> Result<Self, Error> {
        let mut bundles = HashMap::new();

        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self { bundles }),
            Err(err) => return Err(err.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            let content = tokio::fs::read_to_string(&path).await?;
            let bundle: Bundle = serde_yaml::from_str(&content).map_err(|err| Error::Yaml(path.clone(), err))?;
            bundles.insert(bundle.name.clone(), bundle);
        }

        Ok(Self { bundles })
    }

    pub fn get(&self, name: &str) -> Option<&Bundle> {
        self.bundles.get(name)
    }

    /// Runs every hook in the named bundle, in order, with `root` as the
    /// hook's working directory. A bundle with no registered hooks for
    /// `name` is a no-op: most phases have nothing to run. Stops at the
    /// first failing hook, matching spec.md §7's "phase returns" error
    /// propagation.
    pub fn run(&self, name: &str, root: &Path) -> Result<(), Error> {
        let Some(bundle) = self.bundles.get(name) else {
            return Ok(());
        };

        for hook in &bundle.hooks {
            log::debug!("running trigger hook {:?} for {name}", hook.run);
            let status = std::process::Command::new(&hook.run)
                .args(&hook.args)
                .current_dir(root)
                .status()
                .map_err(|err| Error::Spawn(hook.run.clone(), err))?;
            if !status.success() {
                return Err(Error::Failed {
                    hook: hook.run.clone(),
                    status,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("triggers-test-{}-{}", std::process::id(), name));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn missing_bundle_is_a_noop() {
        let registry = Registry::new([]);
        assert!(registry.run("preinstall", Path::new("/")).is_ok());
    }

    #[test]
    fn runs_hooks_in_order_and_stops_on_failure() {
        let dir = scratch_dir("order");
        let registry = Registry::new([Bundle {
            name: "preinstall".to_string(),
            hooks: vec![
                Hook {
                    run: PathBuf::from("/bin/true"),
                    args: vec![],
                },
                Hook {
                    run: PathBuf::from("/bin/false"),
                    args: vec![],
                },
                Hook {
                    run: PathBuf::from("/bin/true"),
                    args: vec![],
                },
            ],
        }]);

        let err = registry.run("preinstall", &dir).unwrap_err();
        assert!(matches!(err, Error::Failed { .. }));
    }

    #[tokio::test]
    async fn load_reads_yaml_bundles_from_directory() {
        let dir = scratch_dir("load");
        std::fs::write(
            dir.join("preinstall.yaml"),
            "name: preinstall\nhooks:\n  - run: /bin/true\n    args: []\n",
        )
        .unwrap();
        std::fs::write(dir.join("not-a-trigger.txt"), "ignored").unwrap();

        let registry = Registry::load(&dir).await.unwrap();
        assert!(registry.get("preinstall").is_some());
        assert_eq!(registry.get("preinstall").unwrap().hooks.len(), 1);
    }

    #[tokio::test]
    async fn load_tolerates_missing_directory() {
        let dir = scratch_dir("missing").join("does-not-exist");
        let registry = Registry::load(&dir).await.unwrap();
        assert!(registry.get("preinstall").is_none());
    }
}
