//! File system locations.

use crate::{CoreError, CoreResult};
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Paths {
    /// Base directory (~/.courier)
    base_dir: PathBuf,
}

impl Paths {
    /// Uses `~/.courier` as the base directory.
    pub fn new() -> CoreResult<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| CoreError::Path("Could not determine home directory".to_string()))?;
        Ok(Self {
            base_dir: home.join(".courier"),
        })
    }

    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    /// `<base>/config.json`
    pub fn config_file(&self) -> PathBuf {
        self.base_dir.join("config.json")
    }

    /// `<base>/courier.sqlite`
    pub fn database_file(&self) -> PathBuf {
        self.base_dir.join("courier.sqlite")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    /// `<base>/logs/courier.jsonl`
    pub fn log_file(&self) -> PathBuf {
        self.logs_dir().join("courier.jsonl")
    }

    pub fn ensure_dirs(&self) -> CoreResult<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        std::fs::create_dir_all(self.logs_dir())?;
        Ok(())
    }
}
