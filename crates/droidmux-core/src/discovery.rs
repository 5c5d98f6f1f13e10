//! Device discovery and property collaborators used by the registry.
//!
//! The registry never enumerates devices or reads properties itself. It calls
//! three traits:
//!
//! - [`DeviceDiscovery`] lists devices the host can see right now,
//! - [`Connector`] opens a [`Connection`] to a discovered endpoint,
//! - [`PropertyReader`] reads a connected device's system properties.
//!
//! The default implementations work over TCP: [`StaticDiscovery`] checks a
//! configured list of `host:port` endpoints, [`TcpConnector`] dials them, and
//! [`GetpropReader`] runs `getprop` on the device.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::mux::StreamError;
use crate::transport::{ConnectError, Connection, ConnectionConfig};

/// Errors from discovery and property collaborators.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// Enumeration failed as a whole.
    #[error("discovery failed: {0}")]
    Failed(String),

    /// A device stream failed while reading properties.
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where a device can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceEndpoint {
    /// adbd listening on a TCP `host:port`.
    Tcp(String),
}

impl std::fmt::Display for DeviceEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceEndpoint::Tcp(addr) => write!(f, "tcp:{addr}"),
        }
    }
}

/// Device state as reported by discovery (the `adb devices` vocabulary).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportedState {
    Device,
    Offline,
    Unauthorized,
    Bootloader,
    Other(String),
}

impl ReportedState {
    pub fn parse(state: &str) -> Self {
        match state.trim() {
            "device" => ReportedState::Device,
            "offline" => ReportedState::Offline,
            "unauthorized" => ReportedState::Unauthorized,
            "bootloader" => ReportedState::Bootloader,
            other => ReportedState::Other(other.to_string()),
        }
    }
}

/// One device seen by a discovery pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    pub serial: String,
    pub endpoint: DeviceEndpoint,
    pub state: ReportedState,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Enumerates the devices currently visible to the host.
#[async_trait]
pub trait DeviceDiscovery: Send + Sync {
    async fn discover(&self) -> Result<Vec<DiscoveredDevice>, DiscoveryError>;
}

/// Reads system properties from a connected device.
#[async_trait]
pub trait PropertyReader: Send + Sync {
    async fn read_properties(
        &self,
        connection: &Connection,
    ) -> Result<BTreeMap<String, String>, DiscoveryError>;
}

/// Establishes transport connections to discovered endpoints.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &DeviceEndpoint) -> Result<Connection, ConnectError>;
}

// ---------------------------------------------------------------------------
// StaticDiscovery
// ---------------------------------------------------------------------------

/// Discovery over a fixed list of TCP endpoints.
///
/// An endpoint that accepts a TCP connection within the probe timeout is
/// reported as [`ReportedState::Device`]; unreachable endpoints are left out
/// of the pass, so the registry ages them out.
#[derive(Debug, Clone)]
pub struct StaticDiscovery {
    endpoints: Vec<String>,
    probe_timeout: Duration,
}

impl StaticDiscovery {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self {
            endpoints,
            probe_timeout: Duration::from_millis(500),
        }
    }

    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }
}

#[async_trait]
impl DeviceDiscovery for StaticDiscovery {
    async fn discover(&self) -> Result<Vec<DiscoveredDevice>, DiscoveryError> {
        let mut found = Vec::with_capacity(self.endpoints.len());
        for addr in &self.endpoints {
            match timeout(self.probe_timeout, TcpStream::connect(addr.as_str())).await {
                Ok(Ok(_)) => {
                    trace!(%addr, "endpoint reachable");
                    found.push(DiscoveredDevice {
                        serial: addr.clone(),
                        endpoint: DeviceEndpoint::Tcp(addr.clone()),
                        state: ReportedState::Device,
                    });
                }
                Ok(Err(e)) => debug!(%addr, error = %e, "endpoint unreachable"),
                Err(_) => debug!(%addr, "endpoint probe timed out"),
            }
        }
        Ok(found)
    }
}

// ---------------------------------------------------------------------------
// TcpConnector
// ---------------------------------------------------------------------------

/// Connects to TCP endpoints with [`Connection::connect_tcp`].
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    config: ConnectionConfig,
}

impl TcpConnector {
    pub fn new(config: ConnectionConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &DeviceEndpoint) -> Result<Connection, ConnectError> {
        match endpoint {
            DeviceEndpoint::Tcp(addr) => Connection::connect_tcp(addr, &self.config).await,
        }
    }
}

// ---------------------------------------------------------------------------
// GetpropReader
// ---------------------------------------------------------------------------

/// Reads properties by running `getprop` over a shell stream.
#[derive(Debug, Clone, Default)]
pub struct GetpropReader;

#[async_trait]
impl PropertyReader for GetpropReader {
    async fn read_properties(
        &self,
        connection: &Connection,
    ) -> Result<BTreeMap<String, String>, DiscoveryError> {
        let mut stream = connection.open("shell:getprop").await?;
        let output = stream.read_to_end().await?;
        Ok(parse_getprop(&String::from_utf8_lossy(&output)))
    }
}

/// Parse `getprop` output: one `[key]: [value]` entry per line.
pub fn parse_getprop(output: &str) -> BTreeMap<String, String> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let (key, value) = line.split_once("]: [")?;
            let key = key.strip_prefix('[')?;
            let value = value.strip_suffix(']')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}
