//! Node configuration.

use std::fmt::Display;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use hailmesh_dispatch::NegotiationConfig;
use hailmesh_geo::DEFAULT_BIAS;
use hailmesh_transfer::TransportConfig;
use hailmesh_wire::{ENVELOPE_LEN, MAX_PACKET_LEN};

use crate::directory::DirectoryConfig;
use crate::error::{Error, Result};

/// Settings shared by every node role.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    /// Directory endpoint: bind address for the directory, destination for everyone else
    pub directory_addr: SocketAddr,
    /// Local endpoint for taxis and customers
    pub bind_addr: SocketAddr,
    /// Cluster bias box half-width
    pub bias: f64,
    /// Taxis allowed to approach one customer at once
    pub max_approaching: u32,
    /// How long to wait for a LIST reply or ping replies
    pub fetch_timeout: Duration,
    /// Largest LIST datagram the directory sends
    pub max_packet_len: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            directory_addr: SocketAddr::from(([127, 0, 0, 1], 20000)),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            bias: DEFAULT_BIAS,
            max_approaching: 2,
            fetch_timeout: Duration::from_millis(2000),
            max_packet_len: MAX_PACKET_LEN,
        }
    }
}

impl NodeConfig {
    /// Create config from environment variables with sensible defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env), reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let bias: f64 = parse_var(&lookup, "HAILMESH_BIAS", defaults.bias)?;
        if !bias.is_finite() || bias <= 0.0 {
            return Err(Error::Config(format!(
                "HAILMESH_BIAS must be a positive number, got {bias}"
            )));
        }

        let max_packet_len: usize =
            parse_var(&lookup, "HAILMESH_MAX_PACKET", defaults.max_packet_len)?;
        // Command, count and one envelope.
        if max_packet_len < 8 + ENVELOPE_LEN {
            return Err(Error::Config(format!(
                "HAILMESH_MAX_PACKET is too small: {max_packet_len}"
            )));
        }

        let timeout_ms: u64 = parse_var(
            &lookup,
            "HAILMESH_FETCH_TIMEOUT_MS",
            defaults.fetch_timeout.as_millis() as u64,
        )?;

        Ok(Self {
            directory_addr: parse_var(&lookup, "HAILMESH_DIRECTORY_ADDR", defaults.directory_addr)?,
            bind_addr: parse_var(&lookup, "HAILMESH_BIND_ADDR", defaults.bind_addr)?,
            bias,
            max_approaching: parse_var(&lookup, "HAILMESH_MAX_APPROACHING", defaults.max_approaching)?,
            fetch_timeout: Duration::from_millis(timeout_ms),
            max_packet_len,
        })
    }

    pub fn negotiation(&self) -> NegotiationConfig {
        NegotiationConfig::default().with_max_approaching(self.max_approaching)
    }

    pub fn directory(&self) -> DirectoryConfig {
        DirectoryConfig {
            bias: self.bias,
            max_packet_len: self.max_packet_len,
        }
    }

    /// Transport settings for a taxi or customer endpoint.
    pub fn local_transport(&self) -> TransportConfig {
        TransportConfig::bind(self.bind_addr)
    }

    /// Transport settings for the directory endpoint.
    pub fn directory_transport(&self) -> TransportConfig {
        TransportConfig::bind(self.directory_addr)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("invalid {key}={raw:?}: {e}"))),
        None => Ok(default),
    }
}
