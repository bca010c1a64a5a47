//! Workspace discovery and the `.trellis/` directory layout.
//!
//! A workspace is any directory holding a `.trellis/` dir:
//!
//! ```text
//! <root>/
//!   trellis.yaml      pipeline definition
//!   trellis.lock      recorded stage state
//!   params.yaml       parameter sections
//!   .trellis/
//!     config.yaml     workspace settings (remote url)
//!     cache/          content-addressed artifact store
//!     exps/           experiment run records
//!     tmp/            run lock and scratch space
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cache::fs::FsCacheStore;
use crate::error::{Result, TrellisError};
use crate::pipeline::PIPELINE_FILE;
use crate::state::LOCK_FILE;

/// Directory marking a workspace root.
pub const TRELLIS_DIR: &str = ".trellis";

/// File name of the parameter store at the workspace root.
pub const PARAMS_FILE: &str = "params.yaml";

const CONFIG_FILE: &str = "config.yaml";
const RUN_LOCK: &str = "tmp/run.lock";

const CONFIG_TEMPLATE: &str = "\
# Trellis workspace configuration.
#
# remote:
#   url: https://artifacts.example.com/trellis
";

const GITIGNORE: &str = "cache/\nexps/\ntmp/\n";

/// Contents of `.trellis/config.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteSettings>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSettings {
    pub url: String,
}

/// Handle to a discovered workspace root.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Create the `.trellis/` layout under `dir`.
    pub fn init(dir: &Path) -> Result<Self> {
        let trellis = dir.join(TRELLIS_DIR);
        if trellis.exists() {
            return Err(TrellisError::AlreadyInitialized(dir.display().to_string()));
        }

        std::fs::create_dir_all(trellis.join("cache"))?;
        std::fs::create_dir_all(trellis.join("exps"))?;
        std::fs::create_dir_all(trellis.join("tmp"))?;
        std::fs::write(trellis.join(".gitignore"), GITIGNORE)?;
        std::fs::write(trellis.join(CONFIG_FILE), CONFIG_TEMPLATE)?;

        Ok(Self {
            root: dir.to_path_buf(),
        })
    }

    /// Walk upward from `start` until a `.trellis/` dir is found.
    pub fn discover(start: &Path) -> Result<Self> {
        let origin = std::fs::canonicalize(start)
            .map_err(|_| TrellisError::WorkspaceNotFound(start.display().to_string()))?;

        let mut dir = origin.as_path();
        loop {
            if dir.join(TRELLIS_DIR).is_dir() {
                return Ok(Self {
                    root: dir.to_path_buf(),
                });
            }
            dir = match dir.parent() {
                Some(parent) => parent,
                None => {
                    return Err(TrellisError::WorkspaceNotFound(origin.display().to_string()))
                }
            };
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn trellis_dir(&self) -> PathBuf {
        self.root.join(TRELLIS_DIR)
    }

    pub fn pipeline_path(&self) -> PathBuf {
        self.root.join(PIPELINE_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    pub fn params_path(&self) -> PathBuf {
        self.root.join(PARAMS_FILE)
    }

    pub fn exps_dir(&self) -> PathBuf {
        self.trellis_dir().join("exps")
    }

    /// Open the workspace's artifact cache.
    pub fn cache(&self) -> Result<FsCacheStore> {
        Ok(FsCacheStore::new(self.trellis_dir().join("cache"))?)
    }

    /// Read `.trellis/config.yaml`. Missing or comment-only files give the
    /// default config.
    pub fn config(&self) -> Result<WorkspaceConfig> {
        let path = self.trellis_dir().join(CONFIG_FILE);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Default::default()),
            Err(e) => return Err(e.into()),
        };
        let parsed: Option<WorkspaceConfig> = serde_yaml::from_str(&text)?;
        Ok(parsed.unwrap_or_default())
    }

    pub fn save_config(&self, config: &WorkspaceConfig) -> Result<()> {
        let text = serde_yaml::to_string(config)?;
        std::fs::write(self.trellis_dir().join(CONFIG_FILE), text)?;
        Ok(())
    }

    /// Take the exclusive run lock. At most one repro or experiment can
    /// mutate the workspace at a time; a second caller gets
    /// [`TrellisError::WorkspaceLocked`] instead of waiting.
    pub fn lock_run(&self) -> Result<RunGuard> {
        let path = self.trellis_dir().join(RUN_LOCK);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path);
        match file {
            Ok(mut file) => {
                let _ = write!(file, "{}", std::process::id());
                Ok(RunGuard { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(TrellisError::WorkspaceLocked(path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Holds the run lock; removing the lock file on drop releases it.
pub struct RunGuard {
    path: PathBuf,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
