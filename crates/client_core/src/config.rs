use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use tracing::warn;

pub const DEFAULT_API_URL: &str = "http://localhost:8080/api";
pub const DEFAULT_WS_URL: &str = "ws://localhost:8080/ws/chat";
pub const DEFAULT_SETTINGS_FILE: &str = "client.toml";

/// Delay schedule between reconnection attempts. No attempt limit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the computed delay randomly added or removed, in `0.0..=1.0`.
    pub jitter: f64,
}

impl ReconnectPolicy {
    /// Same delay on every attempt, no jitter.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }
}

impl Default for ReconnectPolicy {
    /// Fixed 5 s between attempts. Growth and jitter are opt-in through settings.
    fn default() -> Self {
        Self::fixed(Duration::from_millis(5000))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub api_url: String,
    pub ws_url: String,
    pub reconnect: ReconnectPolicy,
    pub search_debounce: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.into(),
            ws_url: DEFAULT_WS_URL.into(),
            reconnect: ReconnectPolicy::default(),
            search_debounce: Duration::from_millis(400),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileSettings {
    api_url: Option<String>,
    ws_url: Option<String>,
    reconnect_initial_ms: Option<u64>,
    reconnect_max_ms: Option<u64>,
    reconnect_multiplier: Option<f64>,
    reconnect_jitter: Option<f64>,
    search_debounce_ms: Option<u64>,
}

pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(DEFAULT_SETTINGS_FILE), |key| std::env::var(key).ok())
}

/// Defaults, then the optional toml file, then environment overrides.
pub fn load_settings_from(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file_cfg) => apply_file_settings(&mut settings, file_cfg),
            Err(err) => warn!(path = %path.display(), %err, "ignoring unparsable settings file"),
        }
    }

    apply_env_overrides(&mut settings, env);
    settings
}

fn apply_file_settings(settings: &mut ClientSettings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.api_url {
        settings.api_url = v;
    }
    if let Some(v) = file_cfg.ws_url {
        settings.ws_url = v;
    }
    if let Some(v) = file_cfg.reconnect_initial_ms {
        settings.reconnect.initial_delay = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.reconnect_max_ms {
        settings.reconnect.max_delay = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.reconnect_multiplier.filter(|v| v.is_finite()) {
        settings.reconnect.multiplier = v;
    }
    if let Some(v) = file_cfg.reconnect_jitter.filter(|v| v.is_finite()) {
        settings.reconnect.jitter = v;
    }
    if let Some(v) = file_cfg.search_debounce_ms {
        settings.search_debounce = Duration::from_millis(v);
    }
}

fn apply_env_overrides(settings: &mut ClientSettings, env: impl Fn(&str) -> Option<String>) {
    if let Some(v) = env("CHAT_API_URL") {
        settings.api_url = v;
    }
    if let Some(v) = env("APP__API_URL") {
        settings.api_url = v;
    }

    if let Some(v) = env("CHAT_WS_URL") {
        settings.ws_url = v;
    }
    if let Some(v) = env("APP__WS_URL") {
        settings.ws_url = v;
    }

    if let Some(parsed) = env("APP__RECONNECT_INITIAL_MS").and_then(|v| v.parse::<u64>().ok()) {
        settings.reconnect.initial_delay = Duration::from_millis(parsed);
    }
    if let Some(parsed) = env("APP__RECONNECT_MAX_MS").and_then(|v| v.parse::<u64>().ok()) {
        settings.reconnect.max_delay = Duration::from_millis(parsed);
    }
    if let Some(parsed) = env("APP__RECONNECT_MULTIPLIER").and_then(parse_finite) {
        settings.reconnect.multiplier = parsed;
    }
    if let Some(parsed) = env("APP__RECONNECT_JITTER").and_then(parse_finite) {
        settings.reconnect.jitter = parsed;
    }
    if let Some(parsed) = env("APP__SEARCH_DEBOUNCE_MS").and_then(|v| v.parse::<u64>().ok()) {
        settings.search_debounce = Duration::from_millis(parsed);
    }
}

// `f64::from_str` accepts "NaN" and "inf".
fn parse_finite(raw: String) -> Option<f64> {
    raw.parse::<f64>().ok().filter(|v| v.is_finite())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
