use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::{BaseDirs, ProjectDirs};
use once_cell::sync::Lazy;

use crate::normalizer::StoreLayout;

static DEFAULT_DB_NAME: &str = "taskmaster.sqlite3";
static SESSION_FILE_NAME: &str = "session";
static ENV_DATA_DIR: &str = "TASKMASTER_DATA_DIR";
static ENV_LAYOUT: &str = "TASKMASTER_LAYOUT";
static ENV_MAX_TASKS: &str = "TASKMASTER_MAX_TASKS";

/// Upper bound on tasks held in one in-memory snapshot.
pub const DEFAULT_MAX_TASKS: usize = 500;

static PROJECT_DIRS: Lazy<Option<ProjectDirs>> =
    Lazy::new(|| ProjectDirs::from("dev", "taskmaster", "taskmaster"));

#[derive(Debug, Clone)]
pub struct AppConfig {
    data_dir: PathBuf,
    db_path: PathBuf,
    session_path: PathBuf,
    layout: StoreLayout,
    max_tasks: usize,
}

impl AppConfig {
    /// Construct [`AppConfig`] by resolving the data directory using the provided override,
    /// environment variables, and platform defaults.
    pub fn discover(data_dir_override: Option<PathBuf>) -> Result<Self> {
        let data_dir = resolve_data_dir(data_dir_override)?;
        if !data_dir.exists() {
            fs::create_dir_all(&data_dir).with_context(|| {
                format!("Failed to create data directory at {}", data_dir.display())
            })?;
        }
        let mut config = Self::from_data_dir(data_dir)?;
        if let Ok(layout) = env::var(ENV_LAYOUT) {
            config.layout = layout
                .parse()
                .with_context(|| format!("Invalid {ENV_LAYOUT}"))?;
        }
        if let Ok(max) = env::var(ENV_MAX_TASKS) {
            config.max_tasks = max
                .trim()
                .parse()
                .with_context(|| format!("Invalid {ENV_MAX_TASKS} '{max}'"))?;
        }
        Ok(config)
    }

    /// Construct [`AppConfig`] directly from a resolved data directory.
    pub fn from_data_dir(data_dir: PathBuf) -> Result<Self> {
        let db_path = data_dir.join(DEFAULT_DB_NAME);
        let session_path = data_dir.join(SESSION_FILE_NAME);
        Ok(Self {
            data_dir,
            db_path,
            session_path,
            layout: StoreLayout::default(),
            max_tasks: DEFAULT_MAX_TASKS,
        })
    }

    pub fn with_layout(mut self, layout: StoreLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_max_tasks(mut self, max_tasks: usize) -> Self {
        self.max_tasks = max_tasks.max(1);
        self
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn session_path(&self) -> &Path {
        &self.session_path
    }

    pub fn layout(&self) -> StoreLayout {
        self.layout
    }

    pub fn max_tasks(&self) -> usize {
        self.max_tasks
    }
}

fn resolve_data_dir(data_dir_override: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(dir) = data_dir_override {
        return Ok(dir);
    }

    if let Ok(env_dir) = env::var(ENV_DATA_DIR) {
        return Ok(PathBuf::from(env_dir));
    }

    if cfg!(debug_assertions) {
        let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        let dev_dir = manifest_dir.join("..").join("tmp").join("dev-taskmaster");
        return Ok(dev_dir);
    }

    if let Some(project) = &*PROJECT_DIRS {
        return Ok(project.data_dir().to_path_buf());
    }

    if let Some(base) = BaseDirs::new() {
        return Ok(base.home_dir().join(".taskmaster"));
    }

    Ok(env::current_dir()?.join(".taskmaster"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn data_dir_override_wins_and_is_created() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("nested").join("data");
        let config = AppConfig::discover(Some(target.clone())).unwrap();
        assert!(target.exists());
        assert_eq!(config.data_dir(), target.as_path());
        assert_eq!(config.db_path(), target.join(DEFAULT_DB_NAME).as_path());
        assert_eq!(config.session_path(), target.join(SESSION_FILE_NAME).as_path());
    }

    #[test]
    fn defaults_and_overrides() {
        let dir = TempDir::new().unwrap();
        let config = AppConfig::from_data_dir(dir.path().to_path_buf()).unwrap();
        assert_eq!(config.layout(), StoreLayout::Tree);
        assert_eq!(config.max_tasks(), DEFAULT_MAX_TASKS);

        let config = config
            .with_layout(StoreLayout::Collection)
            .with_max_tasks(0);
        assert_eq!(config.layout(), StoreLayout::Collection);
        assert_eq!(config.max_tasks(), 1);
    }
}
