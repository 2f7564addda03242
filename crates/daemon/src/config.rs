use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::address::Address;
use crate::constants::KEY_BYTES;

/// Top-level configuration for the nextpath daemon.
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub timing: TimingConfig,
}

#[derive(Debug, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Platform id reported by the client, clamped to the protocol maximum.
    #[serde(default)]
    pub platform_id: u32,
    #[serde(default)]
    pub connection_type: u32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            platform_id: 0,
            connection_type: 0,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct NetworkConfig {
    /// Local UDP bind address.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Address clients use to reach this server, if different from the bind address.
    pub public_address: Option<String>,
    /// Server a client connects to.
    pub server_address: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            public_address: None,
            server_address: None,
        }
    }
}

impl NetworkConfig {
    pub fn bind_address(&self) -> Result<SocketAddr> {
        self.bind_address
            .parse()
            .with_context(|| format!("Invalid bind address: {}", self.bind_address))
    }

    pub fn public_address(&self) -> Result<Option<Address>> {
        self.public_address
            .as_deref()
            .map(|s| s.parse::<Address>().with_context(|| format!("Invalid public address: {}", s)))
            .transpose()
    }

    pub fn server_address(&self) -> Result<Option<Address>> {
        self.server_address
            .as_deref()
            .map(|s| s.parse::<Address>().with_context(|| format!("Invalid server address: {}", s)))
            .transpose()
    }
}

/// Keys, all base64 encoded 32 byte values.
#[derive(Debug, Deserialize, Default)]
pub struct SecurityConfig {
    /// Ed25519 secret the server signs upgrade packets with.
    pub customer_private_key: Option<String>,
    /// Matching public key the client verifies with.
    pub customer_public_key: Option<String>,
    /// X25519 secret the server opens its route tokens with.
    pub server_route_private_key: Option<String>,
    /// Control-plane X25519 public key.
    pub backend_public_key: Option<String>,
}

fn decode_key(name: &str, value: Option<&str>) -> Result<[u8; KEY_BYTES]> {
    let Some(value) = value else {
        bail!("security.{} is not set", name);
    };
    let bytes = STANDARD
        .decode(value.trim())
        .with_context(|| format!("security.{} is not valid base64", name))?;
    let Ok(key) = <[u8; KEY_BYTES]>::try_from(bytes.as_slice()) else {
        bail!("security.{} must be {} bytes, got {}", name, KEY_BYTES, bytes.len());
    };
    Ok(key)
}

pub fn encode_key(key: &[u8; KEY_BYTES]) -> String {
    STANDARD.encode(key)
}

impl SecurityConfig {
    pub fn signing_key(&self) -> Result<SigningKey> {
        let bytes = decode_key("customer_private_key", self.customer_private_key.as_deref())?;
        Ok(SigningKey::from_bytes(&bytes))
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        let bytes = decode_key("customer_public_key", self.customer_public_key.as_deref())?;
        VerifyingKey::from_bytes(&bytes).context("security.customer_public_key is not a valid Ed25519 key")
    }

    pub fn route_secret(&self) -> Result<crypto_box::SecretKey> {
        let bytes = decode_key("server_route_private_key", self.server_route_private_key.as_deref())?;
        Ok(crypto_box::SecretKey::from(bytes))
    }

    pub fn backend_public_key(&self) -> Result<crypto_box::PublicKey> {
        let bytes = decode_key("backend_public_key", self.backend_public_key.as_deref())?;
        Ok(crypto_box::PublicKey::from(bytes))
    }
}

/// Worker timing. Protocol timeouts are fixed and live in `constants`.
#[derive(Debug, Deserialize, Clone)]
pub struct TimingConfig {
    /// Worker tick. Default: 100ms
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// Seconds between backend session updates. Default: 10
    #[serde(default = "default_backend_update_interval")]
    pub backend_update_interval_secs: u64,

    /// Seconds between metrics summary log lines. Default: 30
    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval(),
            backend_update_interval_secs: default_backend_update_interval(),
            status_interval_secs: default_status_interval(),
        }
    }
}

impl TimingConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn backend_update_interval(&self) -> Duration {
        Duration::from_secs(self.backend_update_interval_secs)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs.max(1))
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_bind_address() -> String {
    "0.0.0.0:40000".to_string()
}
fn default_tick_interval() -> u64 {
    100
}
fn default_backend_update_interval() -> u64 {
    10
}
fn default_status_interval() -> u64 {
    30
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .context(format!("Failed to read config file: {:?}", path.as_ref()))?;
        let config: Config = toml::from_str(&content).context("Failed to parse TOML config")?;
        Ok(config)
    }

    /// Load from default paths or return default config.
    pub fn load_or_default() -> Self {
        let paths = [
            "/etc/nextpath/config.toml",
            "~/.nextpath/config.toml",
            "./config.toml",
        ];

        for path in &paths {
            let expanded = shellexpand::tilde(path).to_string();
            if Path::new(&expanded).exists() {
                if let Ok(config) = Self::load(&expanded) {
                    return config;
                }
            }
        }

        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.network.bind_address().unwrap().port(), 40000);
        assert_eq!(config.timing.tick_interval(), Duration::from_millis(100));
        assert_eq!(config.timing.backend_update_interval(), Duration::from_secs(10));
        assert!(config.security.signing_key().is_err());
    }

    #[test]
    fn test_parse_toml() {
        let signing_key = SigningKey::from_bytes(&[7u8; KEY_BYTES]);
        let text = format!(
            r#"
            [network]
            bind_address = "127.0.0.1:5000"
            public_address = "5.6.7.8:40000"

            [security]
            customer_private_key = "{}"
            customer_public_key = "{}"
            backend_public_key = "{}"

            [timing]
            tick_interval_ms = 50
            "#,
            encode_key(&signing_key.to_bytes()),
            encode_key(&signing_key.verifying_key().to_bytes()),
            encode_key(&[9u8; KEY_BYTES]),
        );
        let config: Config = toml::from_str(&text).unwrap();

        assert_eq!(config.network.bind_address().unwrap(), "127.0.0.1:5000".parse().unwrap());
        assert_eq!(
            config.network.public_address().unwrap(),
            Some("5.6.7.8:40000".parse().unwrap())
        );
        assert_eq!(config.network.server_address().unwrap(), None);
        assert_eq!(config.security.signing_key().unwrap(), signing_key);
        assert_eq!(config.security.verifying_key().unwrap(), signing_key.verifying_key());
        assert_eq!(config.security.backend_public_key().unwrap().as_bytes(), &[9u8; KEY_BYTES]);
        assert_eq!(config.timing.tick_interval_ms, 50);
        assert_eq!(config.timing.status_interval_secs, 30);
    }

    #[test]
    fn test_bad_keys_rejected() {
        let security = SecurityConfig {
            customer_private_key: Some("not base64!".to_string()),
            backend_public_key: Some(encode_key(&[1u8; KEY_BYTES])[..10].to_string()),
            ..Default::default()
        };
        assert!(security.signing_key().is_err());
        assert!(security.backend_public_key().is_err());
        assert!(security.route_secret().is_err());
    }
}
