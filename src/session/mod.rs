//! # Sessions
//!
//! A session is one TCP connection plus the logic variant currently
//! interpreting its frames.
//!
//! ## Components
//! - **Connection**: socket, reassembly buffer, timers and the close state machine
//! - **Logic**: the `ProtocolLogic` contract and the `SessionLogic` enum
//! - **Variants**: `handshake` (Default), `client`, `server`, `active`, `inner`,
//!   `endpoint`

pub mod active;
pub mod client;
pub mod connection;
pub mod endpoint;
pub mod handshake;
pub mod inner;
pub mod logic;
pub mod server;


pub use connection::{Connection, ConnectionHandle, ConnectionState, WeakConnection};
pub use logic::{Outgoing, ProtocolLogic, RoleTag, Router, SessionLogic, Unwrapped};
