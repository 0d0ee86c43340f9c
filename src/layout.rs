//! Where the frontend, the engine and the snapshot storage live on disk, and
//! the commands used to run them.

use crate::model::{Invocation, LaunchConfig, LaunchPlan};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration problems found before anything is started.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("frontend directory or manage.py not found: {0}")]
    MissingFrontend(PathBuf),

    #[error("engine script not found: {0}")]
    MissingEngine(PathBuf),

    #[error("storage directory not found: {0}")]
    MissingStorage(PathBuf),

    #[error("failed to read storage directory {path}: {source}")]
    StorageUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no usable snapshot under {0}; put a simulation folder there or pass --origin")]
    NoSnapshot(PathBuf),
}

pub const MANAGE_PY: &str = "manage.py";

#[derive(Debug, Clone)]
pub struct ProjectLayout {
    pub python: PathBuf,
    pub frontend_dir: PathBuf,
    pub engine_dir: PathBuf,
    pub engine_script: PathBuf,
    pub storage_dir: PathBuf,
}

impl ProjectLayout {
    /// Fill in the conventional locations under `root` for anything not
    /// given explicitly.
    pub fn new(
        root: &Path,
        python: impl Into<PathBuf>,
        frontend_dir: Option<PathBuf>,
        engine_dir: Option<PathBuf>,
        engine_script: &Path,
        storage_dir: Option<PathBuf>,
    ) -> Self {
        let frontend_dir =
            frontend_dir.unwrap_or_else(|| root.join("environment").join("frontend_server"));
        let engine_dir = engine_dir.unwrap_or_else(|| {
            root.join("generative_agents-main")
                .join("reverie")
                .join("backend_server")
        });
        let engine_script = engine_dir.join(engine_script);
        let storage_dir = storage_dir.unwrap_or_else(|| frontend_dir.join("storage"));
        Self {
            python: python.into(),
            frontend_dir,
            engine_dir,
            engine_script,
            storage_dir,
        }
    }

    /// Check the required paths, reporting the first one missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.frontend_dir.is_dir() || !self.frontend_dir.join(MANAGE_PY).is_file() {
            return Err(ConfigError::MissingFrontend(self.frontend_dir.clone()));
        }
        if !self.engine_script.is_file() {
            return Err(ConfigError::MissingEngine(self.engine_script.clone()));
        }
        if !self.storage_dir.is_dir() {
            return Err(ConfigError::MissingStorage(self.storage_dir.clone()));
        }
        Ok(())
    }

    pub fn plan(&self, cfg: &LaunchConfig) -> LaunchPlan {
        let manage = || Invocation::new(&self.python, &self.frontend_dir).arg(MANAGE_PY);

        let mut frontend = manage().arg("runserver");
        if let Some(port) = cfg.port {
            frontend = frontend.arg(format!("127.0.0.1:{port}"));
        }

        LaunchPlan {
            migrate: manage().arg("migrate"),
            frontend,
            engine: Invocation::new(&self.python, &self.engine_dir)
                .arg(self.engine_script.to_string_lossy()),
        }
    }
}
