//! ICE/RTC configuration handed out by the session service.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::envelope::Payload;

/// Keepalive interval used when the configuration does not carry one.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(10_000);

const FALLBACK_STUN: &str = "stun:223.254.128.13:3478";
const FALLBACK_TURN: &str = "turn:223.254.128.13:3479";

/// Where the installed configuration came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    /// Fetched from the session service
    Service,
    /// Pushed to the device over the broker
    Pushed,
    /// Built-in default after a failed fetch
    Fallback,
}

/// Option blobs are JSON text on the wire; tolerate services that inline them.
fn blob<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

/// STUN/TURN servers plus the opaque option blobs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcConfig {
    #[serde(default)]
    pub stun_servers: Vec<String>,
    #[serde(default)]
    pub turn_servers: Vec<String>,
    #[serde(default, deserialize_with = "blob", skip_serializing_if = "Option::is_none")]
    pub rtc_configuration: Option<String>,
    #[serde(default, deserialize_with = "blob", skip_serializing_if = "Option::is_none")]
    pub extra_config: Option<String>,
}

impl RtcConfig {
    /// Built-in configuration: one STUN and one TURN server.
    pub fn fallback() -> Self {
        let rtc = serde_json::json!({
            "iceServers": [{ "urls": FALLBACK_STUN }, { "urls": FALLBACK_TURN }],
            "iceCandidatePoolSize": 10,
            "bundlePolicy": "max-bundle",
            "rtcpMuxPolicy": "require",
        });
        let extra = serde_json::json!({
            "video": true,
            "audio": true,
            "timeout": 30000,
            "retryAttempts": 3,
            "keepAliveInterval": 10000,
        });
        Self {
            stun_servers: vec![FALLBACK_STUN.to_string()],
            turn_servers: vec![FALLBACK_TURN.to_string()],
            rtc_configuration: Some(rtc.to_string()),
            extra_config: Some(extra.to_string()),
        }
    }

    /// A service response is usable only if it names at least one server.
    pub fn is_usable(&self) -> bool {
        !(self.stun_servers.is_empty() && self.turn_servers.is_empty())
    }

    /// Keepalive interval from `extraConfig.keepAliveInterval` (milliseconds).
    pub fn keepalive_interval(&self) -> Duration {
        self.keepalive_interval_or(DEFAULT_KEEPALIVE_INTERVAL)
    }

    /// Same, with `default` when the blob has no usable interval. The value
    /// may be a number or a numeric string.
    pub fn keepalive_interval_or(&self, default: Duration) -> Duration {
        self.extra_config
            .as_deref()
            .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
            .and_then(|extra| match extra.get("keepAliveInterval")? {
                serde_json::Value::Number(n) => n.as_u64(),
                serde_json::Value::String(s) => s.trim().parse::<u64>().ok(),
                _ => None,
            })
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(default)
    }

    /// Configuration carried by a config-service push.
    pub fn from_payload(data: &Payload) -> Self {
        Self {
            stun_servers: data.stun_servers.clone().unwrap_or_default(),
            turn_servers: data.turn_servers.clone().unwrap_or_default(),
            rtc_configuration: data.rtc_configuration.clone(),
            extra_config: data.extra_config.clone(),
        }
    }

    /// Copy the configuration into a config-service payload.
    pub fn fill_payload(&self, data: &mut Payload) {
        data.stun_servers = Some(self.stun_servers.clone());
        data.turn_servers = Some(self.turn_servers.clone());
        data.rtc_configuration = self.rtc_configuration.clone();
        data.extra_config = self.extra_config.clone();
    }
}
