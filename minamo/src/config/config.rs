use std::fs::File;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use minamo_proto::socks5::{Credentials, UserInfo};
use serde::Deserialize;

/// Default value for the server display name
fn default_server_name() -> String {
    "minamo".to_string()
}

/// Default value for the UDP listen address
fn default_listen_address() -> SocketAddr {
    "0.0.0.0:20220".parse().unwrap()
}

/// Default value for the path MTU
fn default_mtu() -> usize {
    1500
}

/// Default value for the relay batch size
fn default_relay_batch_size() -> usize {
    64
}

/// Default value for the listener receive batch size
fn default_server_recv_batch_size() -> usize {
    64
}

/// Default value for the per-session send channel capacity
fn default_send_channel_capacity() -> usize {
    1024
}

/// Default value for the NAT idle timeout
fn default_nat_timeout() -> Duration {
    Duration::from_secs(300)
}

/// A username/password entry.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct UserConfig {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Server display name, used in logs and routing decisions
    #[serde(default = "default_server_name")]
    pub server_name: String,
    /// UDP relay listen address
    #[serde(default = "default_listen_address")]
    pub listen_address: SocketAddr,
    /// SOCKS5 TCP listen address; the TCP service is disabled when unset
    #[serde(default)]
    pub tcp_listen_address: Option<SocketAddr>,
    /// Firewall mark for the listener socket, 0 = unset (Linux only)
    #[serde(default)]
    pub listener_fwmark: u32,
    /// Path MTU used to size receive buffers
    #[serde(default = "default_mtu")]
    pub mtu: usize,
    /// Packets moved per batch between the send channel and the sockets
    #[serde(default = "default_relay_batch_size")]
    pub relay_batch_size: usize,
    /// Datagrams pulled off the listener per batch
    #[serde(default = "default_server_recv_batch_size")]
    pub server_recv_batch_size: usize,
    /// Capacity of each session's send channel
    #[serde(default = "default_send_channel_capacity")]
    pub send_channel_capacity: usize,
    /// Idle duration after which an upstream session is evicted
    #[serde(with = "duration", default = "default_nat_timeout")]
    pub nat_timeout: Duration,
    /// "" or "sendmmsg" for batched I/O, anything else for the generic path
    #[serde(default)]
    pub batch_mode: String,
    /// Username/password credentials; authentication is off when empty
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

impl Config {
    /// Load configuration from file path
    pub fn load<T: AsRef<Path>>(path: T) -> Result<Self> {
        let file = File::open(path)?;
        let config: Config = serde_yaml::from_reader(file)?;
        // validate, some fields are interdependent
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.mtu < 576 {
            return Err(anyhow::format_err!(
                "mtu must be at least 576, got {}",
                self.mtu
            ));
        }
        if self.relay_batch_size < 1 {
            return Err(anyhow::format_err!("relay_batch_size must be at least 1"));
        }
        if self.server_recv_batch_size < 1 {
            return Err(anyhow::format_err!(
                "server_recv_batch_size must be at least 1"
            ));
        }
        if self.send_channel_capacity < 1 {
            return Err(anyhow::format_err!(
                "send_channel_capacity must be at least 1"
            ));
        }
        if self.nat_timeout < Duration::from_secs(1) {
            return Err(anyhow::format_err!(
                "nat_timeout must be at least 1s, got {:?}",
                self.nat_timeout
            ));
        }
        // Length bounds on every credential entry.
        self.credentials()?;
        Ok(())
    }

    /// Builds the credentials table; `None` when no users are configured.
    pub fn credentials(&self) -> Result<Option<Credentials>> {
        if self.users.is_empty() {
            return Ok(None);
        }
        let mut credentials = Credentials::new();
        for user in &self.users {
            credentials
                .insert(UserInfo::new(user.username.clone(), user.password.clone()))
                .map_err(|e| anyhow::format_err!("invalid user '{}': {}", user.username, e))?;
        }
        Ok(Some(credentials))
    }
}

mod duration {
    use std::time::Duration;

    use serde::de::Error;
    use serde::{Deserialize, Deserializer};

    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("invalid value: {s}, expected 10s, 10ms or 10m"))?;
        let (num, unit) = s.split_at(split);
        let n: u64 = num
            .parse()
            .map_err(|_| format!("invalid value: {s}, expected 10s, 10ms or 10m"))?;
        match unit {
            "ms" => Ok(Duration::from_millis(n)),
            "s" => Ok(Duration::from_secs(n)),
            "m" => Ok(Duration::from_secs(n * 60)),
            _ => Err(format!("invalid value: {s}, expected 10s, 10ms or 10m")),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    fn load(content: &str) -> Result<Config> {
        let mut tmp_file = NamedTempFile::new().expect("Failed to create tempfile");
        tmp_file.write_all(content.as_bytes()).unwrap();
        Config::load(tmp_file.path())
    }

    #[test]
    fn test_load_config_with_default_values() {
        let config = load("{}").unwrap();

        assert_eq!(config.server_name, "minamo");
        assert_eq!(
            config.listen_address,
            "0.0.0.0:20220".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(config.tcp_listen_address, None);
        assert_eq!(config.listener_fwmark, 0);
        assert_eq!(config.mtu, 1500);
        assert_eq!(config.relay_batch_size, 64);
        assert_eq!(config.server_recv_batch_size, 64);
        assert_eq!(config.send_channel_capacity, 1024);
        assert_eq!(config.nat_timeout, Duration::from_secs(300));
        assert_eq!(config.batch_mode, "");
        assert!(config.users.is_empty());
        assert!(config.credentials().unwrap().is_none());
    }

    #[test]
    fn test_load_config_with_all_fields() {
        let content = r#"
        server_name: "edge-01"
        listen_address: "127.0.0.1:20221"
        tcp_listen_address: "127.0.0.1:1080"
        listener_fwmark: 7936
        mtu: 1400
        relay_batch_size: 32
        server_recv_batch_size: 16
        send_channel_capacity: 256
        nat_timeout: 2m
        batch_mode: "sendmmsg"
        users:
          - username: alice
            password: correct-horse
          - username: bob
            password: battery-staple
        "#;

        let config = load(content).unwrap();

        assert_eq!(config.server_name, "edge-01");
        assert_eq!(
            config.listen_address,
            "127.0.0.1:20221".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            config.tcp_listen_address,
            Some("127.0.0.1:1080".parse().unwrap())
        );
        assert_eq!(config.listener_fwmark, 7936);
        assert_eq!(config.mtu, 1400);
        assert_eq!(config.relay_batch_size, 32);
        assert_eq!(config.server_recv_batch_size, 16);
        assert_eq!(config.send_channel_capacity, 256);
        assert_eq!(config.nat_timeout, Duration::from_secs(120));
        assert_eq!(config.batch_mode, "sendmmsg");

        let credentials = config.credentials().unwrap().unwrap();
        assert_eq!(credentials.len(), 2);
        assert_eq!(credentials.get("alice").unwrap().password, "correct-horse");
    }

    #[test]
    fn test_load_config_rejects_small_mtu() {
        assert!(load("mtu: 500").is_err());
    }

    #[test]
    fn test_load_config_rejects_short_nat_timeout() {
        assert!(load("nat_timeout: 500ms").is_err());
    }

    #[test]
    fn test_load_config_rejects_zero_batch_size() {
        assert!(load("relay_batch_size: 0").is_err());
        assert!(load("server_recv_batch_size: 0").is_err());
        assert!(load("send_channel_capacity: 0").is_err());
    }

    #[test]
    fn test_load_config_rejects_invalid_user() {
        let content = r#"
        users:
          - username: ""
            password: secret
        "#;
        assert!(load(content).is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(
            duration::parse_duration("300s").unwrap(),
            Duration::from_secs(300)
        );
        assert_eq!(
            duration::parse_duration("250ms").unwrap(),
            Duration::from_millis(250)
        );
        assert_eq!(
            duration::parse_duration("5m").unwrap(),
            Duration::from_secs(300)
        );
        assert!(duration::parse_duration("300").is_err());
        assert!(duration::parse_duration("s").is_err());
        assert!(duration::parse_duration("10h").is_err());
    }
}
