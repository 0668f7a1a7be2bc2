use std::{collections::HashMap, fs, path::Path, time::Duration};

use anyhow::{anyhow, Context};
use url::Url;

pub const SETTINGS_FILE: &str = "workshop.toml";

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub api_base_url: String,
    /// Explicit realtime endpoint; derived from `api_base_url` when unset.
    pub realtime_url: Option<String>,
    pub request_timeout: Duration,
    pub refresh_timeout: Duration,
    /// Deadline for opening the realtime connection.
    pub realtime_timeout: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:3333".into(),
            realtime_url: None,
            request_timeout: Duration::from_secs(15),
            refresh_timeout: Duration::from_secs(10),
            realtime_timeout: Duration::from_secs(10),
        }
    }
}

impl ClientSettings {
    pub fn with_api_base_url(api_base_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            ..Self::default()
        }
    }

    pub fn api_base_url(&self) -> anyhow::Result<Url> {
        let raw = self.api_base_url.trim();
        let normalized = if raw.ends_with('/') {
            raw.to_string()
        } else {
            format!("{raw}/")
        };
        Url::parse(&normalized).with_context(|| format!("invalid api base url '{raw}'"))
    }

    pub fn realtime_url(&self) -> anyhow::Result<Url> {
        if let Some(raw) = &self.realtime_url {
            return Url::parse(raw.trim())
                .with_context(|| format!("invalid realtime url '{raw}'"));
        }
        derive_realtime_url(&self.api_base_url)
    }
}

pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(SETTINGS_FILE))
}

pub fn load_settings_from(path: &Path) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            apply_overrides(&mut settings, |key| file_cfg.get(key).cloned());
        }
    }

    apply_overrides(&mut settings, |key| match key {
        "api_base_url" => std::env::var("APP__API_BASE_URL")
            .or_else(|_| std::env::var("WORKSHOP_API_URL"))
            .ok(),
        "realtime_url" => std::env::var("APP__REALTIME_URL")
            .or_else(|_| std::env::var("WORKSHOP_REALTIME_URL"))
            .ok(),
        "request_timeout_ms" => std::env::var("APP__REQUEST_TIMEOUT_MS").ok(),
        "refresh_timeout_ms" => std::env::var("APP__REFRESH_TIMEOUT_MS").ok(),
        "realtime_timeout_ms" => std::env::var("APP__REALTIME_TIMEOUT_MS").ok(),
        _ => None,
    });

    settings
}

fn apply_overrides(settings: &mut ClientSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("api_base_url") {
        settings.api_base_url = v;
    }
    if let Some(v) = lookup("realtime_url") {
        settings.realtime_url = Some(v);
    }
    if let Some(ms) = lookup("request_timeout_ms").and_then(|v| v.parse::<u64>().ok()) {
        settings.request_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = lookup("refresh_timeout_ms").and_then(|v| v.parse::<u64>().ok()) {
        settings.refresh_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = lookup("realtime_timeout_ms").and_then(|v| v.parse::<u64>().ok()) {
        settings.realtime_timeout = Duration::from_millis(ms);
    }
}

/// Maps an http(s) API origin onto the websocket endpoint served next to it.
pub fn derive_realtime_url(api_base_url: &str) -> anyhow::Result<Url> {
    let api_base_url = api_base_url.trim().trim_end_matches('/');
    let ws_url = if let Some(rest) = api_base_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = api_base_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return Err(anyhow!(
            "api base url must start with http:// or https://: {api_base_url}"
        ));
    };
    Url::parse(&format!("{ws_url}/ws"))
        .with_context(|| format!("invalid realtime url derived from '{api_base_url}'"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
