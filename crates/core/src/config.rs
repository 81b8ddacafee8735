//! Server configuration, decoded from a JSON document read once at startup.
//!
//! Every key is optional; missing keys take their defaults. Unknown keys
//! are rejected so typos fail loudly instead of being silently ignored.

use std::net::IpAddr;
use std::path::Path;

use serde::Deserialize;

use crate::error::{RelayError, Result};

/// Runtime configuration for the relay server.
///
/// ```
/// use rtsp_relay::Config;
///
/// let config = Config::from_json(r#"{"listen_port": 8554}"#).unwrap();
/// assert_eq!(config.listen_port, 8554);
/// assert_eq!(config.listen_address, "0.0.0.0");
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address the RTSP control socket listens on.
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Port the RTSP control socket listens on.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Lowest RTP port the allocator may hand out (rounded up to even).
    #[serde(default = "default_rtp_port_min")]
    pub rtp_port_min: u16,
    /// Highest port the allocator may hand out (inclusive, RTCP side).
    #[serde(default = "default_rtp_port_max")]
    pub rtp_port_max: u16,
    /// Idle read timeout for RTSP control connections, in seconds.
    #[serde(default = "default_read_timeout_seconds")]
    pub read_timeout_seconds: u64,
    /// Maximum concurrent RTSP connections; excess accepts are dropped.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    554
}

fn default_rtp_port_min() -> u16 {
    20000
}

fn default_rtp_port_max() -> u16 {
    30000
}

fn default_read_timeout_seconds() -> u64 {
    60
}

fn default_max_connections() -> usize {
    64
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            listen_port: default_listen_port(),
            rtp_port_min: default_rtp_port_min(),
            rtp_port_max: default_rtp_port_max(),
            read_timeout_seconds: default_read_timeout_seconds(),
            max_connections: default_max_connections(),
        }
    }
}

impl Config {
    /// Decode a configuration from UTF-8 JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Config =
            serde_json::from_str(text).map_err(|e| RelayError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and decode a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| RelayError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    /// Check internal consistency. Called by [`from_json`](Self::from_json)
    /// and again by [`Server::start`](crate::Server::start) since fields
    /// are public and may have been overridden.
    pub fn validate(&self) -> Result<()> {
        self.listen_ip()?;
        if self.rtp_port_min >= self.rtp_port_max {
            return Err(RelayError::Config(format!(
                "rtp_port_min {} must be below rtp_port_max {}",
                self.rtp_port_min, self.rtp_port_max
            )));
        }
        if self.max_connections == 0 {
            return Err(RelayError::Config(
                "max_connections must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// `host:port` string for the TCP listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.listen_address, self.listen_port)
    }

    /// Parsed listen address, also used to bind RTP listener sockets.
    pub fn listen_ip(&self) -> Result<IpAddr> {
        self.listen_address
            .parse()
            .map_err(|_| RelayError::Config(format!("invalid listen_address: {:?}", self.listen_address)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_takes_defaults() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config.listen_address, "0.0.0.0");
        assert_eq!(config.listen_port, 554);
        assert_eq!(config.rtp_port_min, 20000);
        assert_eq!(config.rtp_port_max, 30000);
        assert_eq!(config.read_timeout_seconds, 60);
        assert_eq!(config.max_connections, 64);
    }

    #[test]
    fn partial_document_overrides_some_keys() {
        let config = Config::from_json(
            r#"{"listen_address": "127.0.0.1", "rtp_port_min": 40000, "rtp_port_max": 41000}"#,
        )
        .unwrap();
        assert_eq!(config.listen_address, "127.0.0.1");
        assert_eq!(config.rtp_port_min, 40000);
        assert_eq!(config.listen_port, 554);
    }

    #[test]
    fn unknown_key_is_rejected() {
        let err = Config::from_json(r#"{"listen_prot": 554}"#).unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(matches!(
            Config::from_json("not json"),
            Err(RelayError::Config(_))
        ));
    }

    #[test]
    fn inverted_port_range_is_rejected() {
        let err =
            Config::from_json(r#"{"rtp_port_min": 30000, "rtp_port_max": 20000}"#).unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[test]
    fn bad_listen_address_is_rejected() {
        let err = Config::from_json(r#"{"listen_address": "not-an-ip"}"#).unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }
}
