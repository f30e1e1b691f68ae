use std::{collections::HashMap, fs, time::Duration};

use crate::{call::CallConfig, transport::TransportConfig};

/// Client endpoints and tuning. Defaults target a local dev server;
/// `client.toml` and `APP__*` environment variables override field by field.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Authenticated session endpoint.
    pub ws_url: String,
    /// Anonymous (guest) session endpoint.
    pub guest_ws_url: String,
    pub auth_base_url: String,
    pub data_dir: Option<String>,
    pub transport: TransportConfig,
    pub call: CallConfig,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            ws_url: "ws://127.0.0.1:8443/ws".into(),
            guest_ws_url: "ws://127.0.0.1:8443/ws/guest".into(),
            auth_base_url: "http://127.0.0.1:8443".into(),
            data_dir: None,
            transport: TransportConfig::default(),
            call: CallConfig::default(),
        }
    }
}

pub fn load_settings() -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string("client.toml") {
        apply_toml(&mut settings, &raw);
    }
    apply_env(&mut settings);

    settings
}

fn apply_toml(settings: &mut ClientSettings, raw: &str) {
    let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(raw) else {
        return;
    };
    if let Some(v) = file_cfg.get("ws_url") {
        settings.ws_url = v.clone();
    }
    if let Some(v) = file_cfg.get("guest_ws_url") {
        settings.guest_ws_url = v.clone();
    }
    if let Some(v) = file_cfg.get("auth_base_url") {
        settings.auth_base_url = v.clone();
    }
    if let Some(v) = file_cfg.get("data_dir") {
        settings.data_dir = Some(v.clone());
    }
    if let Some(v) = file_cfg.get("request_timeout_secs") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.transport.request_timeout = Duration::from_secs(parsed);
        }
    }
    if let Some(v) = file_cfg.get("request_max_attempts") {
        if let Ok(parsed) = v.parse::<u32>() {
            settings.transport.max_attempts = parsed;
        }
    }
    if let Some(v) = file_cfg.get("call_connect_timeout_secs") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.call.connect_timeout = Duration::from_secs(parsed);
        }
    }
}

fn apply_env(settings: &mut ClientSettings) {
    if let Ok(v) = std::env::var("APP__WS_URL") {
        settings.ws_url = v;
    }
    if let Ok(v) = std::env::var("APP__GUEST_WS_URL") {
        settings.guest_ws_url = v;
    }
    if let Ok(v) = std::env::var("APP__AUTH_BASE_URL") {
        settings.auth_base_url = v;
    }
    if let Ok(v) = std::env::var("APP__DATA_DIR") {
        settings.data_dir = Some(v);
    }
    if let Ok(v) = std::env::var("APP__REQUEST_TIMEOUT_SECS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.transport.request_timeout = Duration::from_secs(parsed);
        }
    }
    if let Ok(v) = std::env::var("APP__REQUEST_MAX_ATTEMPTS") {
        if let Ok(parsed) = v.parse::<u32>() {
            settings.transport.max_attempts = parsed;
        }
    }
    if let Ok(v) = std::env::var("APP__RECONNECT_INITIAL_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.transport.reconnect_initial = Duration::from_millis(parsed);
        }
    }
    if let Ok(v) = std::env::var("APP__RECONNECT_MAX_SECS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.transport.reconnect_max = Duration::from_secs(parsed);
        }
    }
    if let Ok(v) = std::env::var("APP__CALL_CONNECT_TIMEOUT_SECS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.call.connect_timeout = Duration::from_secs(parsed);
        }
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
