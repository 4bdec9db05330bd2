//! # Session Gateway
//!
//! A multiplexing TCP gateway between many short-lived clients and a small
//! set of long-lived backend servers.
//!
//! Clients and servers both connect to the gateway and authenticate with a
//! single handshake frame. The gateway then forwards client payloads to the
//! server the client named, prefixed with the client's uid, and relays
//! server payloads (single-target or broadcast) back to clients. Client
//! links are encrypted and optionally compressed; server links are plain.
//!
//! ## Layers
//! - [`core`]: frame header, checksum, codec
//! - [`protocol`]: payload encodings carried inside frames
//! - [`runtime`]: execution lanes
//! - [`session`]: connection state machine and the session logic variants
//! - [`proxy`]: the gateway's accept loop and routing tables
//! - [`cluster`]: the backend server's and the end-user client's links to the
//!   gateway, and the LAN peer link
//! - [`utils`]: compression, crypto, logging, metrics, ring buffer
//!
//! ## Example
//! ```no_run
//! use session_gateway::config::ProxyConfig;
//! use session_gateway::proxy::ProxyManager;
//!
//! # async fn run() -> session_gateway::error::Result<()> {
//! let manager = ProxyManager::new(ProxyConfig::default())?;
//! let addr = manager.start().await?;
//! println!("listening on {addr}");
//! manager.stop();
//! # Ok(())
//! # }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod cluster;
pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod proxy;
pub mod runtime;
pub mod session;
pub mod utils;

pub use cluster::{ClientLink, ClientMessage, ClusterLink, InboundMessage, InnerPairLink};
pub use config::{ClientConfig, ClusterConfig, InnerPairConfig, ProxyConfig};
pub use error::{GatewayError, Result};
pub use proxy::ProxyManager;
