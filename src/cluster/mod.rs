//! Links into the gateway from outside it: the backend server's connector,
//! the end-user client's link and the direct peer-to-peer link.

pub mod active;
pub mod client;
pub mod inner;

pub use active::{ClusterLink, InboundMessage};
pub use client::{ClientLink, ClientMessage};
pub use inner::InnerPairLink;
