//! # Protocol Payloads
//!
//! Encodings for the payloads that ride inside frames: the authentication
//! exchange, uid-addressed routing payloads, broadcast target lists and the
//! connect-confirm notice.

pub mod messages;


pub use messages::{AuthRequest, AuthResponse, ConnectConfirm, ErrorCode, LinkType, ServerIdentity};
