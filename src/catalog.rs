//! Workflow catalog: immutable snapshots loaded from a directory of YAML files.
use crate::error::{NotaryError, NotaryResult};
use crate::workflow::Workflow;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// One consistent set of workflows, keyed by file stem.
#[derive(Debug, Clone, Default)]
pub struct CatalogSnapshot {
    workflows: BTreeMap<String, Arc<Workflow>>,
}

impl CatalogSnapshot {
    pub fn from_workflows(workflows: impl IntoIterator<Item = Workflow>) -> NotaryResult<Self> {
        let mut map = BTreeMap::new();
        for wf in workflows {
            let key = wf.key().to_string();
            if map.insert(key.clone(), Arc::new(wf)).is_some() {
                return Err(NotaryError::config(format!("workflow '{key}' defined twice")));
            }
        }
        Ok(Self { workflows: map })
    }

    /// Loads every `*.yaml` / `*.yml` file in `dir`. Any invalid file fails the whole load.
    pub fn load_dir(dir: &Path) -> NotaryResult<Self> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| NotaryError::config(format!("reading {}: {e}", dir.display())))?;

        let mut paths = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|e| NotaryError::config(format!("reading {}: {e}", dir.display())))?
                .path();
            if path.is_file() && is_workflow_file(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        let workflows = paths
            .iter()
            .map(|p| {
                Workflow::load(p).map_err(|e| match e {
                    NotaryError::Configuration(msg) => {
                        NotaryError::config(format!("{}: {msg}", p.display()))
                    }
                    other => other,
                })
            })
            .collect::<NotaryResult<Vec<_>>>()?;
        Self::from_workflows(workflows)
    }

    pub fn get(&self, key: &str) -> NotaryResult<Arc<Workflow>> {
        self.workflows
            .get(key)
            .cloned()
            .ok_or_else(|| NotaryError::not_found("workflow", key))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.workflows.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }
}

fn is_workflow_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// Holds the active snapshot. Readers clone the `Arc` and keep a consistent view
/// even while a reload swaps in a new one.
#[derive(Debug)]
pub struct Catalog {
    dir: PathBuf,
    current: RwLock<Arc<CatalogSnapshot>>,
}

impl Catalog {
    pub fn open(dir: impl Into<PathBuf>) -> NotaryResult<Self> {
        let dir = dir.into();
        let snapshot = CatalogSnapshot::load_dir(&dir)?;
        info!(dir = %dir.display(), workflows = snapshot.len(), "workflow catalog loaded");

        Ok(Self {
            dir,
            current: RwLock::new(Arc::new(snapshot)),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn snapshot(&self) -> NotaryResult<Arc<CatalogSnapshot>> {
        self.current
            .read()
            .map(|guard| Arc::clone(&*guard))
            .map_err(|_| NotaryError::store(anyhow::anyhow!("catalog lock poisoned")))
    }

    /// Re-reads the directory. On failure the previous snapshot stays active.
    pub fn reload(&self) -> NotaryResult<Arc<CatalogSnapshot>> {
        let fresh = match CatalogSnapshot::load_dir(&self.dir) {
            Ok(snapshot) => Arc::new(snapshot),
            Err(err) => {
                warn!(dir = %self.dir.display(), error = %err, "catalog reload rejected");
                return Err(err);
            }
        };

        let mut guard = self
            .current
            .write()
            .map_err(|_| NotaryError::store(anyhow::anyhow!("catalog lock poisoned")))?;
        *guard = Arc::clone(&fresh);

        info!(dir = %self.dir.display(), workflows = fresh.len(), "workflow catalog reloaded");
        Ok(fresh)
    }
}
