use std::fs;

use anyhow::{anyhow, Context};
use serde::Deserialize;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub api_base_url: String,
    pub inbox_poll_interval_ms: u64,
    pub read_debounce_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8000".into(),
            inbox_poll_interval_ms: 10_000,
            read_debounce_ms: 500,
        }
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("inbox.toml") {
        if let Ok(file_cfg) = toml::from_str::<toml::Table>(&raw) {
            if let Some(v) = file_cfg.get("api_base_url").and_then(|v| v.as_str()) {
                settings.api_base_url = v.to_string();
            }
            if let Some(v) = file_cfg
                .get("inbox_poll_interval_ms")
                .and_then(|v| v.as_integer())
            {
                settings.inbox_poll_interval_ms = v as u64;
            }
            if let Some(v) = file_cfg.get("read_debounce_ms").and_then(|v| v.as_integer()) {
                settings.read_debounce_ms = v as u64;
            }
        }
    }

    if let Ok(v) = std::env::var("API_BASE_URL") {
        settings.api_base_url = v;
    }
    if let Ok(v) = std::env::var("APP__API_BASE_URL") {
        settings.api_base_url = v;
    }

    if let Ok(v) = std::env::var("INBOX_POLL_INTERVAL_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.inbox_poll_interval_ms = parsed;
        }
    }
    if let Ok(v) = std::env::var("APP__INBOX_POLL_INTERVAL_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.inbox_poll_interval_ms = parsed;
        }
    }

    if let Ok(v) = std::env::var("READ_DEBOUNCE_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.read_debounce_ms = parsed;
        }
    }
    if let Ok(v) = std::env::var("APP__READ_DEBOUNCE_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.read_debounce_ms = parsed;
        }
    }

    settings
}

/// Rewrite the REST base url into the websocket base the real-time channels
/// connect through.
pub fn websocket_base(api_base_url: &str) -> anyhow::Result<String> {
    let parsed = Url::parse(api_base_url)
        .with_context(|| format!("invalid api base url '{api_base_url}'"))?;
    let rewritten = match parsed.scheme() {
        "https" => api_base_url.replacen("https://", "wss://", 1),
        "http" => api_base_url.replacen("http://", "ws://", 1),
        other => {
            return Err(anyhow!(
                "api base url must be http(s), got scheme '{other}'"
            ))
        }
    };
    Ok(rewritten.trim_end_matches('/').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_base_rewrites_scheme() {
        assert_eq!(
            websocket_base("http://127.0.0.1:8000").expect("ws base"),
            "ws://127.0.0.1:8000"
        );
        assert_eq!(
            websocket_base("https://api.example.com/").expect("wss base"),
            "wss://api.example.com"
        );
    }

    #[test]
    fn websocket_base_rejects_non_http_schemes() {
        assert!(websocket_base("ftp://api.example.com").is_err());
        assert!(websocket_base("not a url").is_err());
    }

    #[test]
    fn default_settings_cover_poll_and_debounce() {
        let settings = Settings::default();
        assert_eq!(settings.inbox_poll_interval_ms, 10_000);
        assert_eq!(settings.read_debounce_ms, 500);
    }
}
