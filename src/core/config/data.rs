use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq)]
pub struct Config {
    /// Root URL of the local model server, e.g. `http://127.0.0.1:8000`
    pub base_url: Option<String>,
    /// Model used when `--model` is not given
    pub default_model: Option<String>,
    /// Cancel turns that stream for longer than this many seconds
    pub turn_timeout_secs: Option<u64>,
}

/// Keys accepted by `localchat set` and `localchat unset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKey {
    BaseUrl,
    DefaultModel,
    TurnTimeoutSecs,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 3] = [
        ConfigKey::BaseUrl,
        ConfigKey::DefaultModel,
        ConfigKey::TurnTimeoutSecs,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ConfigKey::BaseUrl => "base-url",
            ConfigKey::DefaultModel => "default-model",
            ConfigKey::TurnTimeoutSecs => "turn-timeout-secs",
        }
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfigKey {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace('_', "-");
        ConfigKey::ALL
            .into_iter()
            .find(|key| key.as_str() == normalized)
            .ok_or_else(|| {
                let known: Vec<&str> = ConfigKey::ALL.iter().map(|key| key.as_str()).collect();
                format!("Unknown config key '{value}'. Known keys: {}", known.join(", "))
            })
    }
}

/// Get a user-friendly display string for a path
/// Converts absolute paths to use ~ notation on Unix-like systems when possible
pub fn path_display<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();

    #[cfg(unix)]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let home_path = PathBuf::from(home);
            if let Ok(relative) = path.strip_prefix(&home_path) {
                return format!("~/{}", relative.display());
            }
        }
    }

    path.display().to_string()
}

impl Config {
    pub fn set(&mut self, key: ConfigKey, value: &str) -> Result<(), String> {
        let value = value.trim();
        if value.is_empty() {
            return Err(format!("A value is required for {key}"));
        }
        match key {
            ConfigKey::BaseUrl => self.base_url = Some(value.to_string()),
            ConfigKey::DefaultModel => self.default_model = Some(value.to_string()),
            ConfigKey::TurnTimeoutSecs => {
                let secs = value
                    .parse::<u64>()
                    .map_err(|_| format!("{key} must be a whole number of seconds"))?;
                self.turn_timeout_secs = (secs > 0).then_some(secs);
            }
        }
        Ok(())
    }

    pub fn unset(&mut self, key: ConfigKey) {
        match key {
            ConfigKey::BaseUrl => self.base_url = None,
            ConfigKey::DefaultModel => self.default_model = None,
            ConfigKey::TurnTimeoutSecs => self.turn_timeout_secs = None,
        }
    }
}
