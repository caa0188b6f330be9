use std::time::Duration;

use crate::core::config::data::Config;
use crate::utils::url::normalize_base_url;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";
pub const BASE_URL_ENV: &str = "LOCALCHAT_BASE_URL";

impl Config {
    /// Picks the server URL: command line, then `LOCALCHAT_BASE_URL`, then the
    /// config file, then [`DEFAULT_BASE_URL`].
    pub fn resolve_base_url(&self, cli_override: Option<&str>) -> String {
        let env_value = std::env::var(BASE_URL_ENV).ok();
        self.resolve_base_url_with(cli_override, env_value.as_deref())
    }

    pub(crate) fn resolve_base_url_with(
        &self,
        cli_override: Option<&str>,
        env_value: Option<&str>,
    ) -> String {
        let chosen = [cli_override, env_value, self.base_url.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|value| !value.is_empty())
            .unwrap_or(DEFAULT_BASE_URL);
        normalize_base_url(chosen)
    }

    pub fn resolve_model(&self, cli_override: Option<&str>) -> Option<String> {
        cli_override
            .or(self.default_model.as_deref())
            .map(str::trim)
            .filter(|model| !model.is_empty())
            .map(str::to_string)
    }

    pub fn turn_timeout(&self) -> Option<Duration> {
        self.turn_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}
