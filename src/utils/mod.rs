//! # Utility Modules
//!
//! Supporting pieces used throughout the gateway.
//!
//! ## Components
//! - **Compression**: LZ4 and Zstd with size limits and a size threshold
//! - **Crypto**: ChaCha20-Poly1305 for client payloads
//! - **Logging**: tracing subscriber setup
//! - **Metrics**: atomic counters
//! - **Ring Buffer**: SPSC byte ring drained by cluster and inner pair links

pub mod compression;
pub mod crypto;
pub mod logging;
pub mod metrics;
pub mod ring_buffer;
