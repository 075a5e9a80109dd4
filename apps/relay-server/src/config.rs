//! Relay server configuration.
//!
//! Reads TOML from `$PAIRWAVE_CONFIG`, or `~/.config/pairwave/relay.toml`
//! when the variable is unset. A missing file is created with defaults.

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use pairwave_protocol::Region;
use pairwave_relay::{
    OUTBOX_CAPACITY, RelayConfig, SEND_BUFFER_SIZE, ServerConfig, SessionConfig,
    StaticRegionLookup, TokenIdentityResolver,
};

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "PAIRWAVE_CONFIG";

pub const DEFAULT_PORT: u16 = 7780;

/// On-disk relay settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelaySettings {
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_send_buffer")]
    pub send_buffer: usize,
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,
    #[serde(default = "default_max_violations")]
    pub max_violations: u32,
    /// Region for clients whose address has no override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_region: Option<String>,
    /// Token -> display name. Empty means open mode.
    #[serde(default)]
    pub auth_tokens: BTreeMap<String, String>,
    /// Client address -> region.
    #[serde(default)]
    pub region_overrides: BTreeMap<String, String>,
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_send_buffer() -> usize {
    SEND_BUFFER_SIZE
}

fn default_outbox_capacity() -> usize {
    OUTBOX_CAPACITY
}

fn default_max_violations() -> u32 {
    RelayConfig::default().max_violations
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            send_buffer: default_send_buffer(),
            outbox_capacity: default_outbox_capacity(),
            max_violations: default_max_violations(),
            default_region: None,
            auth_tokens: BTreeMap::new(),
            region_overrides: BTreeMap::new(),
        }
    }
}

impl RelaySettings {
    /// Loads settings from `path`, writing defaults there first if the file
    /// does not exist.
    pub fn load_or_create(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            let settings = Self::default();
            settings.save(path)?;
            tracing::info!(path = %path.display(), "wrote default relay config");
            return Ok(settings);
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let settings: Self =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        settings.validate()?;
        tracing::debug!(path = %path.display(), "relay config loaded");
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.handshake_timeout_secs > 0,
            "handshake_timeout_secs must be positive"
        );
        anyhow::ensure!(self.send_buffer > 0, "send_buffer must be positive");
        anyhow::ensure!(self.max_violations > 0, "max_violations must be positive");
        Ok(())
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind: self.bind,
            port: self.port,
            session: SessionConfig {
                handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
                send_buffer_size: self.send_buffer,
                outbox_capacity: self.outbox_capacity,
            },
        }
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            max_violations: self.max_violations,
        }
    }

    pub fn identity_resolver(&self) -> TokenIdentityResolver {
        if self.auth_tokens.is_empty() {
            return TokenIdentityResolver::open();
        }
        let tokens: HashMap<String, String> = self
            .auth_tokens
            .iter()
            .map(|(token, name)| (token.clone(), name.clone()))
            .collect();
        TokenIdentityResolver::with_tokens(tokens)
    }

    pub fn region_lookup(&self) -> anyhow::Result<StaticRegionLookup> {
        let mut overrides = HashMap::new();
        for (addr, region) in &self.region_overrides {
            let ip: IpAddr = addr
                .parse()
                .with_context(|| format!("invalid address in region_overrides: {addr:?}"))?;
            overrides.insert(ip, Region::new(region));
        }
        Ok(StaticRegionLookup::new(
            self.default_region.as_deref().map(Region::new),
            overrides,
        ))
    }
}

/// Resolves the config file location.
pub fn config_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_ENV)
        && !path.is_empty()
    {
        return Ok(PathBuf::from(path));
    }
    let home = std::env::var("HOME").context("HOME is not set")?;
    Ok(PathBuf::from(home)
        .join(".config")
        .join("pairwave")
        .join("relay.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairwave_relay::{IdentityResolver, RegionLookup};

    #[test]
    fn missing_file_is_created_with_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("relay.toml");

        let settings = RelaySettings::load_or_create(&path).unwrap();
        assert_eq!(settings, RelaySettings::default());
        assert!(path.exists());

        let again = RelaySettings::load_or_create(&path).unwrap();
        assert_eq!(again, settings);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("relay.toml");
        std::fs::write(
            &path,
            r#"
port = 9000
default_region = "us"

[auth_tokens]
secret = "Alice"

[region_overrides]
"10.0.0.7" = "FR"
"#,
        )
        .unwrap();

        let settings = RelaySettings::load_or_create(&path).unwrap();
        assert_eq!(settings.port, 9000);
        assert_eq!(settings.handshake_timeout_secs, 10);
        assert_eq!(settings.send_buffer, SEND_BUFFER_SIZE);
        assert_eq!(settings.auth_tokens.get("secret").map(String::as_str), Some("Alice"));

        let resolver = settings.identity_resolver();
        assert_eq!(
            resolver.resolve(Some("Bearer secret"), None).unwrap().display_name,
            "Alice"
        );
        assert!(resolver.resolve(Some("Bearer other"), None).is_err());

        let lookup = settings.region_lookup().unwrap();
        assert_eq!(
            lookup.region_for("10.0.0.7".parse().unwrap()).unwrap(),
            Region::new("FR")
        );
        assert_eq!(
            lookup.region_for("10.0.0.8".parse().unwrap()).unwrap(),
            Region::new("US")
        );
    }

    #[test]
    fn invalid_values_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("relay.toml");

        std::fs::write(&path, "handshake_timeout_secs = 0\n").unwrap();
        assert!(RelaySettings::load_or_create(&path).is_err());

        std::fs::write(&path, "port = \"not a number\"\n").unwrap();
        assert!(RelaySettings::load_or_create(&path).is_err());
    }

    #[test]
    fn bad_override_address_is_an_error() {
        let settings = RelaySettings {
            region_overrides: BTreeMap::from([("nope".to_string(), "FR".to_string())]),
            ..RelaySettings::default()
        };
        assert!(settings.region_lookup().is_err());
    }

    #[test]
    fn server_config_carries_session_settings() {
        let settings = RelaySettings {
            handshake_timeout_secs: 3,
            send_buffer: 32,
            ..RelaySettings::default()
        };
        let config = settings.server_config();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.session.handshake_timeout, Duration::from_secs(3));
        assert_eq!(config.session.send_buffer_size, 32);
        assert_eq!(settings.relay_config().max_violations, 8);
    }
}
