use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8080";
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_NEGOTIATION_ATTEMPTS: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_owned()],
            username: None,
            credential: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CallConfig {
    pub relay_url: String,
    pub ice_servers: Vec<IceServer>,
    /// Time a connection may spend before reaching `connected`.
    pub negotiation_timeout: Duration,
    /// Attempts per participant, the first one included.
    pub max_negotiation_attempts: u8,
    /// Time allowed for the relay to send `welcome` after connecting.
    pub handshake_timeout: Duration,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_owned(),
            ice_servers: vec![
                IceServer::stun("stun:stun.l.google.com:19302"),
                IceServer {
                    urls: vec!["turn:openrelay.metered.ca:80".to_owned()],
                    username: Some("openrelayproject".to_owned()),
                    credential: Some("openrelayproject".to_owned()),
                },
            ],
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            max_negotiation_attempts: DEFAULT_MAX_NEGOTIATION_ATTEMPTS,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl CallConfig {
    /// Defaults overridden by `VOICE_MESH_*` environment variables.
    ///
    /// `VOICE_MESH_ICE_SERVERS` holds a JSON array of `IceServer` objects.
    /// Unparseable values are logged and skipped.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("VOICE_MESH_RELAY_URL") {
            config.relay_url = url;
        }
        if let Some(raw) = lookup("VOICE_MESH_ICE_SERVERS") {
            match serde_json::from_str::<Vec<IceServer>>(&raw) {
                Ok(servers) => config.ice_servers = servers,
                Err(e) => log::warn!("Ignoring VOICE_MESH_ICE_SERVERS: {}", e),
            }
        }
        if let Some(secs) = parse_number::<u64>(&lookup, "VOICE_MESH_NEGOTIATION_TIMEOUT_SECS") {
            config.negotiation_timeout = Duration::from_secs(secs);
        }
        if let Some(attempts) = parse_number::<u8>(&lookup, "VOICE_MESH_MAX_ATTEMPTS") {
            config.max_negotiation_attempts = attempts.max(1);
        }
        if let Some(secs) = parse_number::<u64>(&lookup, "VOICE_MESH_HANDSHAKE_TIMEOUT_SECS") {
            config.handshake_timeout = Duration::from_secs(secs);
        }

        config
    }
}

fn parse_number<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring {}: {:?} is not a number", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_carry_stun_and_turn() {
        let config = CallConfig::default();
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.negotiation_timeout, Duration::from_secs(15));
        assert_eq!(config.max_negotiation_attempts, 2);
        assert!(config.ice_servers[1].username.is_some());
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = CallConfig::from_lookup(lookup_from(&[
            ("VOICE_MESH_RELAY_URL", "wss://relay.example/ws"),
            ("VOICE_MESH_NEGOTIATION_TIMEOUT_SECS", "5"),
            ("VOICE_MESH_MAX_ATTEMPTS", "0"),
            (
                "VOICE_MESH_ICE_SERVERS",
                r#"[{"urls":["stun:stun.example:3478"],"username":null,"credential":null}]"#,
            ),
        ]));
        assert_eq!(config.relay_url, "wss://relay.example/ws");
        assert_eq!(config.negotiation_timeout, Duration::from_secs(5));
        assert_eq!(config.max_negotiation_attempts, 1);
        assert_eq!(config.ice_servers, vec![IceServer::stun("stun:stun.example:3478")]);
    }

    #[test]
    fn bad_values_fall_back_to_defaults() {
        let config = CallConfig::from_lookup(lookup_from(&[
            ("VOICE_MESH_NEGOTIATION_TIMEOUT_SECS", "soon"),
            ("VOICE_MESH_ICE_SERVERS", "not json"),
        ]));
        assert_eq!(config.negotiation_timeout, DEFAULT_NEGOTIATION_TIMEOUT);
        assert_eq!(config.ice_servers.len(), 2);
    }
}
