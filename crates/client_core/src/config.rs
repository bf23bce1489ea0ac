use std::{fs, path::Path, str::FromStr, time::Duration};

use anyhow::Context;
use serde::Deserialize;
use tracing::debug;

use crate::channel::ReconnectPolicy;

pub const SETTINGS_FILE: &str = "sync.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    pub api_url: String,
    /// Derived from `api_url` when unset.
    pub realtime_url: Option<String>,
    pub page_size: usize,
    pub cache_ttl_seconds: u64,
    pub profile_cache_ttl_seconds: u64,
    pub reconnect_initial_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub request_timeout_seconds: u64,
    pub dedup_window: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:8443".into(),
            realtime_url: None,
            page_size: 20,
            cache_ttl_seconds: 60,
            profile_cache_ttl_seconds: 300,
            reconnect_initial_delay_ms: 500,
            reconnect_max_delay_ms: 30_000,
            request_timeout_seconds: 15,
            dedup_window: 512,
        }
    }
}

impl SyncSettings {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }

    pub fn profile_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.profile_cache_ttl_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let initial_delay = Duration::from_millis(self.reconnect_initial_delay_ms.max(1));
        ReconnectPolicy {
            initial_delay,
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms).max(initial_delay),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    api_url: Option<String>,
    realtime_url: Option<String>,
    page_size: Option<usize>,
    cache_ttl_seconds: Option<u64>,
    profile_cache_ttl_seconds: Option<u64>,
    reconnect_initial_delay_ms: Option<u64>,
    reconnect_max_delay_ms: Option<u64>,
    request_timeout_seconds: Option<u64>,
    dedup_window: Option<usize>,
}

/// Defaults, then `sync.toml` in the working directory, then environment.
pub fn load_settings() -> SyncSettings {
    let mut settings = SyncSettings::default();
    if let Ok(file_cfg) = read_file(Path::new(SETTINGS_FILE)) {
        apply_file(&mut settings, file_cfg);
    }
    apply_env(&mut settings, |name| std::env::var(name).ok());
    settings
}

/// Like [`load_settings`] with an explicit file that must exist and parse.
pub fn load_settings_from(path: &Path) -> anyhow::Result<SyncSettings> {
    let mut settings = SyncSettings::default();
    apply_file(&mut settings, read_file(path)?);
    apply_env(&mut settings, |name| std::env::var(name).ok());
    Ok(settings)
}

fn read_file(path: &Path) -> anyhow::Result<FileSettings> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read settings file '{}'", path.display()))?;
    toml::from_str(&raw)
        .with_context(|| format!("failed to parse settings file '{}'", path.display()))
}

fn apply_file(settings: &mut SyncSettings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.api_url {
        settings.api_url = v;
    }
    if let Some(v) = file_cfg.realtime_url {
        settings.realtime_url = Some(v);
    }
    if let Some(v) = file_cfg.page_size {
        settings.page_size = v;
    }
    if let Some(v) = file_cfg.cache_ttl_seconds {
        settings.cache_ttl_seconds = v;
    }
    if let Some(v) = file_cfg.profile_cache_ttl_seconds {
        settings.profile_cache_ttl_seconds = v;
    }
    if let Some(v) = file_cfg.reconnect_initial_delay_ms {
        settings.reconnect_initial_delay_ms = v;
    }
    if let Some(v) = file_cfg.reconnect_max_delay_ms {
        settings.reconnect_max_delay_ms = v;
    }
    if let Some(v) = file_cfg.request_timeout_seconds {
        settings.request_timeout_seconds = v;
    }
    if let Some(v) = file_cfg.dedup_window {
        settings.dedup_window = v;
    }
}

/// `SYNC_<KEY>` first, then `APP__<KEY>`, which wins when both are set.
fn env_value(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    let app = env(&format!("APP__{key}"));
    app.or_else(|| env(&format!("SYNC_{key}")))
}

fn env_parsed<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env_value(env, key)?;
    match raw.trim().parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            debug!(key, raw = raw.as_str(), "engine: ignoring unparsable setting");
            None
        }
    }
}

fn apply_env(settings: &mut SyncSettings, env: impl Fn(&str) -> Option<String>) {
    if let Some(v) = env_value(&env, "API_URL") {
        settings.api_url = v;
    }
    if let Some(v) = env_value(&env, "REALTIME_URL") {
        settings.realtime_url = Some(v);
    }
    if let Some(v) = env_parsed(&env, "PAGE_SIZE") {
        settings.page_size = v;
    }
    if let Some(v) = env_parsed(&env, "CACHE_TTL_SECONDS") {
        settings.cache_ttl_seconds = v;
    }
    if let Some(v) = env_parsed(&env, "PROFILE_CACHE_TTL_SECONDS") {
        settings.profile_cache_ttl_seconds = v;
    }
    if let Some(v) = env_parsed(&env, "RECONNECT_INITIAL_DELAY_MS") {
        settings.reconnect_initial_delay_ms = v;
    }
    if let Some(v) = env_parsed(&env, "RECONNECT_MAX_DELAY_MS") {
        settings.reconnect_max_delay_ms = v;
    }
    if let Some(v) = env_parsed(&env, "REQUEST_TIMEOUT_SECONDS") {
        settings.request_timeout_seconds = v;
    }
    if let Some(v) = env_parsed(&env, "DEDUP_WINDOW") {
        settings.dedup_window = v;
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
