use super::*;

use std::{collections::HashMap, time::Duration};

fn no_env(_: &str) -> Option<String> {
    None
}

#[test]
fn defaults_apply_when_nothing_is_configured() {
    let settings = load_settings_from(Path::new("/nonexistent/client.toml"), no_env);
    assert_eq!(settings.refresh_path, "/auth/refresh");
    assert_eq!(settings.token_query_param, "token");
    assert_eq!(settings.history_page_size, 50);
    assert_eq!(settings.ack_timeout, Duration::from_secs(1));
    assert_eq!(settings.backoff, BackoffPolicy::default());
}

#[test]
fn file_values_then_env_overrides() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("client.toml");
    fs::write(
        &path,
        r#"
api_base_url = "https://api.example.com"
ws_url = "wss://ws.example.com/production/"
reconnect_growth = "exponential"
reconnect_max_attempts = 3
ack_timeout_ms = 2500
"#,
    )
    .expect("write settings");

    let env: HashMap<&str, &str> = HashMap::from([
        ("APP__WS_URL", "wss://override.example.com/"),
        ("APP__RECONNECT_MAX_ATTEMPTS", "unlimited"),
        ("APP__RECONNECT_BASE_MS", "250"),
    ]);
    let settings = load_settings_from(&path, |key| env.get(key).map(|v| v.to_string()));

    assert_eq!(settings.api_base_url, "https://api.example.com");
    assert_eq!(settings.ws_url, "wss://override.example.com/");
    assert_eq!(settings.backoff.growth, BackoffGrowth::Exponential);
    assert_eq!(settings.backoff.max_attempts, None);
    assert_eq!(settings.backoff.base_delay, Duration::from_millis(250));
    assert_eq!(settings.ack_timeout, Duration::from_millis(2500));
}

#[test]
fn malformed_numbers_keep_previous_values() {
    let env: HashMap<&str, &str> = HashMap::from([
        ("APP__HISTORY_PAGE_SIZE", "lots"),
        ("APP__SEND_CONNECT_HANDSHAKE", "false"),
    ]);
    let settings = load_settings_from(Path::new("/nonexistent/client.toml"), |key| {
        env.get(key).map(|v| v.to_string())
    });
    assert_eq!(settings.history_page_size, 50);
    assert!(!settings.send_connect_handshake);
}

#[test]
fn normalizes_plain_file_path_to_sqlite_url() {
    assert_eq!(
        normalize_database_url("./data/credentials.db"),
        "sqlite://./data/credentials.db"
    );
    assert_eq!(
        normalize_database_url("sqlite:./data/credentials.db"),
        "sqlite://./data/credentials.db"
    );
    assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
    assert_eq!(
        normalize_database_url("  "),
        ClientSettings::default().credentials_db_url
    );
}
