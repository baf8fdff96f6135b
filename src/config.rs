//! src/config.rs
//!
//! Defines the strongly-typed `Config` struct for all runtime parameters,
//! loaded from files and environment variables via `figment`.

use crate::error::{Error, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Top-level struct holding all cluster configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Unique name of the local member, also its reachable `host:port`.
    pub local_name: String,
    /// Names of at least one other known cluster member.
    pub peers: Vec<String>,
    /// Address the transport binds its UDP socket and TCP listener to.
    pub bind_addr: SocketAddr,
    /// Initial metadata for the local member.
    pub local_metadata: HashMap<String, String>,
    /// Shared secret for packet signatures. When absent, a random secret is
    /// generated at startup and only same-process peers will verify.
    pub secret: Option<String>,
    pub ping_interval_ms: u64,
    pub ping_timeout_ms: u64,
    pub ping_req_count: usize,
    pub ping_req_timeout_ms: u64,
    pub suspect_timeout_ms: u64,
    pub sync_interval_ms: u64,
}

impl Config {
    /// Loads configuration from `config.toml` and `SWIM_`-prefixed
    /// environment variables, layered over the defaults.
    pub fn load() -> Result<Self> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file("config.toml"))
            .merge(Env::prefixed("SWIM_"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Checks for configuration that can never run a cluster.
    pub fn validate(&self) -> Result<()> {
        if self.local_name.is_empty() {
            return Err(Error::InvalidConfig(
                "this cluster instance needs a local name",
            ));
        }
        if self.peers.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one cluster peer name is required",
            ));
        }
        Ok(())
    }

    /// The local metadata with values as raw bytes, as carried by gossip.
    pub fn local_metadata_bytes(&self) -> HashMap<String, Vec<u8>> {
        self.local_metadata
            .iter()
            .map(|(key, val)| (key.clone(), val.clone().into_bytes()))
            .collect()
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn ping_req_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_req_timeout_ms)
    }

    pub fn suspect_timeout(&self) -> Duration {
        Duration::from_millis(self.suspect_timeout_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local_name: String::new(),
            peers: Vec::new(),
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 7374),
            local_metadata: HashMap::new(),
            secret: None,
            ping_interval_ms: 1000,
            ping_timeout_ms: 300,
            ping_req_count: 1,
            ping_req_timeout_ms: 900,
            suspect_timeout_ms: 5000,
            sync_interval_ms: 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_loading_from_file() {
        Jail::expect_with(|jail| {
            let config_content = r#"
                local_name = "10.0.0.1:7374"
                peers = ["10.0.0.2:7374"]
                bind_addr = "0.0.0.0:7374"
                ping_interval_ms = 100
                suspect_timeout_ms = 2000
                [local_metadata]
                rack = "a1"
            "#;
            jail.create_file("config.toml", config_content)?;

            let config = Config::load().expect("config loads");
            assert_eq!(config.local_name, "10.0.0.1:7374");
            assert_eq!(config.peers, vec!["10.0.0.2:7374".to_string()]);
            assert_eq!(config.ping_interval_ms, 100);
            assert_eq!(config.suspect_timeout_ms, 2000);
            // Untouched options keep their defaults.
            assert_eq!(config.ping_timeout_ms, 300);
            assert_eq!(
                config.local_metadata_bytes().get("rack"),
                Some(&b"a1".to_vec())
            );
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_file() {
        Jail::expect_with(|jail| {
            let config_content = r#"
                local_name = "file-name:1"
                peers = ["10.0.0.2:7374"]
            "#;
            jail.create_file("config.toml", config_content)?;
            jail.set_env("SWIM_LOCAL_NAME", "env-name:1");
            jail.set_env("SWIM_SECRET", "hunter2");
            let config = Config::load().expect("config loads");
            assert_eq!(config.local_name, "env-name:1");
            assert_eq!(config.secret.as_deref(), Some("hunter2"));
            Ok(())
        });
    }

    #[test]
    fn test_missing_local_name_is_rejected() {
        let config = Config {
            peers: vec!["10.0.0.2:7374".to_string()],
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_missing_peers_is_rejected() {
        let config = Config {
            local_name: "10.0.0.1:7374".to_string(),
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfig(_))
        ));
    }
}
