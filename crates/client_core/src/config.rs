use std::{collections::HashMap, fs, path::Path, time::Duration};

use tracing::warn;

use crate::backoff::{BackoffGrowth, BackoffPolicy};

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub api_base_url: String,
    pub ws_url: String,
    pub refresh_path: String,
    pub token_query_param: String,
    pub request_timeout: Duration,
    pub history_page_size: u32,
    pub ack_timeout: Duration,
    pub send_connect_handshake: bool,
    pub backoff: BackoffPolicy,
    pub credentials_db_url: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8080".into(),
            ws_url: "ws://127.0.0.1:8080/ws".into(),
            refresh_path: "/auth/refresh".into(),
            token_query_param: "token".into(),
            request_timeout: Duration::from_secs(15),
            history_page_size: 50,
            ack_timeout: Duration::from_secs(1),
            send_connect_handshake: true,
            backoff: BackoffPolicy::default(),
            credentials_db_url: "sqlite://./data/credentials.db".into(),
        }
    }
}

pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new("client.toml"), |key| std::env::var(key).ok())
}

/// Defaults, then the flat `key = value` file, then environment overrides.
pub fn load_settings_from(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<HashMap<String, toml::Value>>(&raw) {
            Ok(file_cfg) => {
                for (key, value) in file_cfg {
                    let value = match value {
                        toml::Value::String(text) => text,
                        other => other.to_string(),
                    };
                    apply_setting(&mut settings, &key, &value);
                }
            }
            Err(err) => warn!(path = %path.display(), error = %err, "ignoring unreadable settings file"),
        }
    }

    let overrides = [
        ("CHAT_API_URL", "api_base_url"),
        ("APP__API_URL", "api_base_url"),
        ("CHAT_WS_URL", "ws_url"),
        ("APP__WS_URL", "ws_url"),
        ("APP__REFRESH_PATH", "refresh_path"),
        ("APP__TOKEN_QUERY_PARAM", "token_query_param"),
        ("APP__REQUEST_TIMEOUT_MS", "request_timeout_ms"),
        ("APP__HISTORY_PAGE_SIZE", "history_page_size"),
        ("APP__ACK_TIMEOUT_MS", "ack_timeout_ms"),
        ("APP__SEND_CONNECT_HANDSHAKE", "send_connect_handshake"),
        ("APP__RECONNECT_BASE_MS", "reconnect_base_ms"),
        ("APP__RECONNECT_MAX_MS", "reconnect_max_ms"),
        ("APP__RECONNECT_GROWTH", "reconnect_growth"),
        ("APP__RECONNECT_MAX_ATTEMPTS", "reconnect_max_attempts"),
        ("APP__CREDENTIALS_DB", "credentials_db_url"),
    ];
    for (var, key) in overrides {
        if let Some(value) = env(var) {
            apply_setting(&mut settings, key, &value);
        }
    }

    settings
}

fn apply_setting(settings: &mut ClientSettings, key: &str, value: &str) {
    let value = value.trim();
    match key {
        "api_base_url" => settings.api_base_url = value.to_string(),
        "ws_url" => settings.ws_url = value.to_string(),
        "refresh_path" => settings.refresh_path = value.to_string(),
        "token_query_param" => settings.token_query_param = value.to_string(),
        "credentials_db_url" => settings.credentials_db_url = value.to_string(),
        "request_timeout_ms" => {
            if let Some(ms) = parse_number(key, value) {
                settings.request_timeout = Duration::from_millis(ms);
            }
        }
        "ack_timeout_ms" => {
            if let Some(ms) = parse_number(key, value) {
                settings.ack_timeout = Duration::from_millis(ms);
            }
        }
        "history_page_size" => {
            if let Some(size) = parse_number(key, value) {
                settings.history_page_size = size;
            }
        }
        "send_connect_handshake" => match value.parse::<bool>() {
            Ok(flag) => settings.send_connect_handshake = flag,
            Err(_) => warn!(key, value, "ignoring non-boolean setting"),
        },
        "reconnect_base_ms" => {
            if let Some(ms) = parse_number(key, value) {
                settings.backoff.base_delay = Duration::from_millis(ms);
            }
        }
        "reconnect_max_ms" => {
            if let Some(ms) = parse_number(key, value) {
                settings.backoff.max_delay = Duration::from_millis(ms);
            }
        }
        "reconnect_growth" => match value.parse::<BackoffGrowth>() {
            Ok(growth) => settings.backoff.growth = growth,
            Err(err) => warn!(key, error = %err, "ignoring setting"),
        },
        "reconnect_max_attempts" => {
            settings.backoff.max_attempts = match value {
                "" | "none" | "unlimited" => None,
                _ => match value.parse::<u32>() {
                    Ok(max) => Some(max),
                    Err(_) => {
                        warn!(key, value, "ignoring non-numeric setting");
                        settings.backoff.max_attempts
                    }
                },
            };
        }
        _ => warn!(key, "ignoring unknown setting"),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Option<T> {
    let parsed = value.parse::<T>().ok();
    if parsed.is_none() {
        warn!(key, value, "ignoring non-numeric setting");
    }
    parsed
}

/// Accepts a bare file path or any sqlite url form.
pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return ClientSettings::default().credentials_db_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
