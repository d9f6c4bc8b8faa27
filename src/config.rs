use std::env;
use std::time::Duration;

use serde_json::{json, Value};

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub max_reconnect_attempts: u32,
    pub reconnect_interval: Duration,
    pub log_level: String,
    pub debug_mode: bool,
    pub connection_timeout: Duration,
    pub ping_interval: Duration,
    pub telemetry_buffer_size: usize,
    pub ice_servers: Value,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8000),
            max_reconnect_attempts: env::var("MAX_RECONNECT_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            reconnect_interval: env::var("RECONNECT_INTERVAL")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(2)),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()),
            debug_mode: env::var("DEBUG_MODE")
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            connection_timeout: env::var("CONNECTION_TIMEOUT")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(30)),
            ping_interval: env::var("PING_INTERVAL")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(20)),
            telemetry_buffer_size: env::var("TELEMETRY_BUFFER_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(100),
            ice_servers: env::var("WEBRTC_ICE_SERVERS")
                .ok()
                .and_then(|v| serde_json::from_str(&v).ok())
                .unwrap_or_else(default_ice_servers),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8000,
            max_reconnect_attempts: 5,
            reconnect_interval: Duration::from_secs(2),
            log_level: "INFO".to_string(),
            debug_mode: false,
            connection_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(20),
            telemetry_buffer_size: 100,
            ice_servers: default_ice_servers(),
        }
    }
}

fn default_ice_servers() -> Value {
    json!([{ "urls": ["stun:stun.l.google.com:19302"] }])
}
