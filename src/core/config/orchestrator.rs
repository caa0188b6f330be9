use crate::core::config::data::Config;
use crate::core::config::io::ConfigError;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

#[derive(Default)]
struct ConfigCacheState {
    config: Option<Config>,
    modified: Option<SystemTime>,
}

/// Caches the config file and re-reads it when its mtime changes.
pub struct ConfigOrchestrator {
    path: PathBuf,
    state: Mutex<ConfigCacheState>,
}

impl ConfigOrchestrator {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            state: Mutex::new(ConfigCacheState::default()),
        }
    }

    pub fn from_default_path() -> Result<Self, ConfigError> {
        Ok(Self::new(Config::get_config_path()?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load_with_cache(&self) -> Result<Config, ConfigError> {
        let mut state = self.lock_state();
        Self::refresh(&self.path, &mut state)?;
        Ok(state.config.clone().unwrap_or_default())
    }

    /// Applies `mutator` to the current config and persists the result.
    /// Nothing is written when the mutator fails.
    pub fn mutate<F, T, E>(&self, mutator: F) -> Result<T, Box<dyn std::error::Error>>
    where
        F: FnOnce(&mut Config) -> Result<T, E>,
        Box<dyn std::error::Error>: From<E>,
    {
        let mut state = self.lock_state();
        Self::refresh(&self.path, &mut state)?;

        let mut working = state.config.clone().unwrap_or_default();
        let result = mutator(&mut working)?;
        working.save_to_path(&self.path)?;
        state.modified = Self::modified_time(&self.path);
        state.config = Some(working);
        Ok(result)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ConfigCacheState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn refresh(path: &Path, state: &mut ConfigCacheState) -> Result<(), ConfigError> {
        let disk_modified = Self::modified_time(path);
        if state.config.is_none() || state.modified != disk_modified {
            state.config = Some(Config::load_from_path(path)?);
            state.modified = disk_modified;
        }
        Ok(())
    }

    fn modified_time(path: &Path) -> Option<SystemTime> {
        fs::metadata(path).ok()?.modified().ok()
    }
}
