use chrono::Utc;

const CONFIG_PATH: &str = "PVE_TELEMETRY_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "./config.json";

pub fn get_config_path() -> String {
    std::env::var(CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string())
}

const API_TOKEN: &str = "PVE_API_TOKEN";

pub fn get_api_token() -> Option<String> {
    std::env::var(API_TOKEN).ok().filter(|t| !t.is_empty())
}

const MQTT_PASSWORD: &str = "MQTT_PASSWORD";

pub fn get_mqtt_password() -> Option<String> {
    std::env::var(MQTT_PASSWORD).ok().filter(|p| !p.is_empty())
}

/// Per-connection MQTT client id derived from the current time
pub fn client_id(prefix: &str) -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("{prefix}-{nanos}")
}
