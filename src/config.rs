//! Server configuration.
//!
//! Every field has a default; JSON documents only need the values they change.
//! Durations are written as milliseconds.

use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::handshake::CipherSuite;

pub const DEFAULT_PORT: u16 = 7250;
pub const DEFAULT_MULTICAST_PORT: u16 = 7251;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Listener and per-connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on; `None` binds the dual-stack wildcard.
    pub listen_address: Option<IpAddr>,
    pub port: u16,
    /// How long the accept thread blocks before checking for shutdown.
    #[serde(with = "duration_ms")]
    pub accept_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub client_read_timeout: Duration,
    /// Bound on a cookie-verified handshake, from server hello to Finished.
    #[serde(with = "duration_ms")]
    pub handshake_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub gc_interval: Duration,
    /// PEM certificate chain sent to nodes in the server hello.
    pub certificate_path: Option<PathBuf>,
    /// PKCS#8 PEM Ed25519 signing key.
    pub key_path: Option<PathBuf>,
    /// Cipher suites in preference order; `None` enables all of them.
    pub cipher_suites: Option<Vec<String>>,
    pub multicast: MulticastConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: None,
            port: DEFAULT_PORT,
            accept_timeout: Duration::from_millis(250),
            client_read_timeout: Duration::from_millis(500),
            handshake_timeout: Duration::from_secs(5),
            gc_interval: Duration::from_secs(1),
            certificate_path: None,
            key_path: None,
            cipher_suites: None,
            multicast: MulticastConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("accept_timeout", self.accept_timeout),
            ("client_read_timeout", self.client_read_timeout),
            ("handshake_timeout", self.handshake_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
            }
        }
        if self.certificate_path.is_some() && self.key_path.is_none() {
            return Err(ConfigError::Invalid(
                "certificate_path requires key_path".into(),
            ));
        }
        self.suites()?;
        self.multicast.validate()
    }

    /// Socket address the listener binds.
    pub fn listen_addr(&self) -> SocketAddr {
        let ip = self
            .listen_address
            .unwrap_or(IpAddr::V6(Ipv6Addr::UNSPECIFIED));
        SocketAddr::new(ip, self.port)
    }

    /// Parsed cipher-suite preference list.
    pub fn suites(&self) -> Result<Vec<CipherSuite>, ConfigError> {
        let Some(names) = &self.cipher_suites else {
            return Ok(CipherSuite::ALL.to_vec());
        };
        let mut suites = Vec::with_capacity(names.len());
        for name in names {
            let suite = CipherSuite::from_name(name)
                .ok_or_else(|| ConfigError::Invalid(format!("unknown cipher suite {name:?}")))?;
            if !suites.contains(&suite) {
                suites.push(suite);
            }
        }
        if suites.is_empty() {
            return Err(ConfigError::Invalid("cipher suite list is empty".into()));
        }
        Ok(suites)
    }

    pub fn listen(mut self, address: IpAddr, port: u16) -> Self {
        self.listen_address = Some(address);
        self.port = port;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = timeout;
        self
    }

    pub fn client_read_timeout(mut self, timeout: Duration) -> Self {
        self.client_read_timeout = timeout;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }

    pub fn identity_paths(mut self, key: impl Into<PathBuf>, certificate: Option<PathBuf>) -> Self {
        self.key_path = Some(key.into());
        self.certificate_path = certificate;
        self
    }

    pub fn cipher_suites<I, S>(mut self, suites: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cipher_suites = Some(suites.into_iter().map(Into::into).collect());
        self
    }

    pub fn multicast(mut self, multicast: MulticastConfig) -> Self {
        self.multicast = multicast;
        self
    }
}

/// Group broadcast and key rotation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MulticastConfig {
    pub group: IpAddr,
    pub port: u16,
    pub ttl: u32,
    /// Outgoing interface address; `None` lets the OS choose.
    pub interface: Option<IpAddr>,
    #[serde(with = "duration_ms")]
    pub rekey_interval: Duration,
    /// Keys kept valid, counting the current one.
    pub key_history: usize,
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            group: IpAddr::V4(Ipv4Addr::new(239, 42, 0, 1)),
            port: DEFAULT_MULTICAST_PORT,
            ttl: 1,
            interface: None,
            rekey_interval: Duration::from_secs(300),
            key_history: 3,
        }
    }
}

impl MulticastConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.group.is_multicast() {
            return Err(ConfigError::Invalid(format!(
                "{} is not a multicast group",
                self.group
            )));
        }
        if let Some(interface) = self.interface {
            if interface.is_ipv4() != self.group.is_ipv4() {
                return Err(ConfigError::Invalid(
                    "multicast interface and group differ in address family".into(),
                ));
            }
        }
        if self.rekey_interval.is_zero() {
            return Err(ConfigError::Invalid("rekey_interval must be non-zero".into()));
        }
        if self.key_history == 0 {
            return Err(ConfigError::Invalid("key_history must be at least 1".into()));
        }
        Ok(())
    }

    pub fn group_addr(&self) -> SocketAddr {
        SocketAddr::new(self.group, self.port)
    }

    pub fn group(mut self, group: IpAddr, port: u16) -> Self {
        self.group = group;
        self.port = port;
        self
    }

    pub fn ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn interface(mut self, interface: IpAddr) -> Self {
        self.interface = Some(interface);
        self
    }

    pub fn rekey_interval(mut self, interval: Duration) -> Self {
        self.rekey_interval = interval;
        self
    }

    pub fn key_history(mut self, depth: usize) -> Self {
        self.key_history = depth;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ServerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.listen_addr().port(), DEFAULT_PORT);
        assert!(config.listen_addr().ip().is_unspecified());
        assert_eq!(config.suites().unwrap(), CipherSuite::ALL.to_vec());
        assert_eq!(config.multicast.key_history, 3);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = ServerConfig::from_json_str(
            r#"{
                "port": 9000,
                "client_read_timeout": 150,
                "cipher_suites": ["xchacha20-poly1305-sha256"],
                "multicast": { "group": "239.1.2.3", "rekey_interval": 60000 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.client_read_timeout, Duration::from_millis(150));
        assert_eq!(config.accept_timeout, Duration::from_millis(250));
        assert_eq!(config.suites().unwrap(), vec![CipherSuite::XChaCha20Poly1305Sha256]);
        assert_eq!(config.multicast.group_addr(), "239.1.2.3:7251".parse().unwrap());
        assert_eq!(config.multicast.rekey_interval, Duration::from_secs(60));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(ServerConfig::from_json_str(r#"{"cipher_suites": ["rc4"]}"#).is_err());
        assert!(ServerConfig::from_json_str(r#"{"cipher_suites": []}"#).is_err());
        assert!(ServerConfig::from_json_str(r#"{"multicast": {"group": "10.0.0.1"}}"#).is_err());
        assert!(ServerConfig::from_json_str(r#"{"multicast": {"key_history": 0}}"#).is_err());
        assert!(ServerConfig::from_json_str(r#"{"accept_timeout": 0}"#).is_err());
        assert!(ServerConfig::from_json_str(r#"{"certificate_path": "/tmp/c.pem"}"#).is_err());
        assert!(matches!(
            ServerConfig::from_json_str("{"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn builders_chain() {
        let config = ServerConfig::default()
            .listen("127.0.0.1".parse().unwrap(), 0)
            .handshake_timeout(Duration::from_secs(1))
            .cipher_suites(["CHACHA20-POLY1305-SHA256"])
            .multicast(MulticastConfig::default().key_history(5).ttl(4));
        config.validate().unwrap();
        assert_eq!(config.listen_addr(), "127.0.0.1:0".parse().unwrap());
        assert_eq!(config.multicast.key_history, 5);
        assert_eq!(config.multicast.ttl, 4);
    }

    #[test]
    fn missing_file_reports_path() {
        let err = ServerConfig::from_json_file("/nonexistent/pixelnet.json").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/pixelnet.json"));
    }
}
