//! # droidmux-core
//!
//! Core library for talking to Android devices over the ADB wire protocol
//! without an ADB toolchain.
//!
//! ## Modules
//!
//! - [`protocol`] - ADB frame codec (24-byte header, checksum, CNXN banner)
//! - [`transport`] - Connection handshake and socket ownership
//! - [`mux`] - Logical streams with per-stream flow control
//! - [`discovery`] - Device discovery, connector and property collaborators
//! - [`registry`] - Device registry with reconciliation, backoff and eviction
//! - [`gateway`] - Shell, logcat and UI dump operations over a device stream
//! - [`shell`] - Shell protocol v2 packets and line assembly
//! - [`hierarchy`] - `uiautomator` page source parsing
//! - [`query`] - Element lookup by natural-language query
//! - [`config`] - Persistent configuration in `~/.droidmux/`
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use droidmux_core::config::DroidmuxConfig;
//! use droidmux_core::discovery::{GetpropReader, StaticDiscovery, TcpConnector};
//! use droidmux_core::gateway::Gateway;
//! use droidmux_core::registry::DeviceRegistry;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DroidmuxConfig::load();
//! let registry = Arc::new(DeviceRegistry::new(
//!     Arc::new(StaticDiscovery::new(config.endpoints.clone())),
//!     Arc::new(GetpropReader),
//!     Arc::new(TcpConnector::new(config.connection_config())),
//!     config.registry_config(),
//! ));
//! registry.update(true).await?;
//!
//! let gateway = Gateway::new(registry, config.gateway_config());
//! let output = gateway
//!     .run_shell("192.168.1.20:5555", "getprop ro.product.model", &CancellationToken::new())
//!     .await?;
//! println!("{}", output.stdout);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod discovery;
pub mod gateway;
pub mod hierarchy;
pub mod mux;
pub mod protocol;
pub mod query;
pub mod registry;
pub mod shell;
pub mod transport;
