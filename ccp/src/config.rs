//! Host bootstrap configuration: where to listen and which source
//! addresses may connect, loaded from a TOML file.

use std::net::Ipv4Addr;
use std::path::Path;

use serde::Deserialize;

use crate::error::CcpError;

#[derive(Debug, Deserialize)]
struct RawHostConfig {
    host: String,
    port: u16,
    #[serde(default)]
    whitelist: String,
}

/// Resolved host configuration, ready to pass to [`crate::server::Server::bind`].
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub host: String,
    pub port: u16,
    pub whitelist: Vec<Ipv4Addr>,
}

impl HostConfig {
    /// Reads and parses a config file from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<HostConfig, CcpError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| CcpError::Bootstrap(format!("could not read config file {}: {e}", path.display())))?;
        HostConfig::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<HostConfig, CcpError> {
        let raw: RawHostConfig = toml::from_str(text).map_err(|e| CcpError::Bootstrap(e.to_string()))?;
        HostConfig::from_raw(raw)
    }

    fn from_raw(raw: RawHostConfig) -> Result<HostConfig, CcpError> {
        let whitelist = if raw.whitelist.trim().is_empty() {
            Vec::new()
        } else {
            raw.whitelist
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse::<Ipv4Addr>()
                        .map_err(|e| CcpError::Bootstrap(format!("invalid whitelist entry '{s}': {e}")))
                })
                .collect::<Result<Vec<_>, _>>()?
        };
        Ok(HostConfig {
            host: raw.host,
            port: raw.port,
            whitelist,
        })
    }
}
