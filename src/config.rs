//! Runtime configuration: optional YAML file, then environment overrides.
use crate::error::{NotaryError, NotaryResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use tracing::info;

pub const ENV_MAX_ATTACHMENT_BYTES: &str = "NOTARY_MAX_ATTACHMENT_BYTES";
pub const ENV_DATA_DIR: &str = "NOTARY_DATA_DIR";
pub const ENV_WORKFLOWS_DIR: &str = "NOTARY_WORKFLOWS_DIR";
pub const ENV_LOG: &str = "NOTARY_LOG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotaryConfig {
    /// Upper bound for a single attachment, in bytes.
    #[serde(default = "default_max_attachment_bytes")]
    pub max_attachment_bytes: u64,

    /// Holds the sled database and the blob directory.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Directory of workflow YAML files.
    #[serde(default = "default_workflows_dir")]
    pub workflows_dir: PathBuf,

    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_max_attachment_bytes() -> u64 {
    25 * 1024 * 1024
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_workflows_dir() -> PathBuf {
    PathBuf::from("workflows")
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for NotaryConfig {
    fn default() -> Self {
        Self {
            max_attachment_bytes: default_max_attachment_bytes(),
            data_dir: default_data_dir(),
            workflows_dir: default_workflows_dir(),
            log_filter: default_log_filter(),
        }
    }
}

impl NotaryConfig {
    /// Reads `path` if given, then applies `NOTARY_*` environment overrides.
    pub fn load(path: Option<&Path>) -> NotaryResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;

        info!(
            data_dir = %config.data_dir.display(),
            workflows_dir = %config.workflows_dir.display(),
            max_attachment_bytes = config.max_attachment_bytes,
            "configuration loaded"
        );
        Ok(config)
    }

    pub fn from_file(path: &Path) -> NotaryResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| NotaryError::config(format!("reading {}: {e}", path.display())))?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> NotaryResult<Self> {
        serde_yaml::from_str(raw).map_err(|e| NotaryError::config(format!("malformed config: {e}")))
    }

    /// `lookup` maps a variable name to its value; split out so tests need not touch the process env.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> NotaryResult<()> {
        if let Some(raw) = lookup(ENV_MAX_ATTACHMENT_BYTES) {
            self.max_attachment_bytes = raw.trim().parse().map_err(|_| {
                NotaryError::config(format!("{ENV_MAX_ATTACHMENT_BYTES} must be an integer, got '{raw}'"))
            })?;
        }
        if let Some(dir) = lookup(ENV_DATA_DIR) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup(ENV_WORKFLOWS_DIR) {
            self.workflows_dir = PathBuf::from(dir);
        }
        if let Some(filter) = lookup(ENV_LOG) {
            self.log_filter = filter;
        }
        Ok(())
    }

    pub fn validate(&self) -> NotaryResult<()> {
        if self.max_attachment_bytes == 0 {
            return Err(NotaryError::config("max_attachment_bytes must be positive"));
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("notary.db")
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }
}
