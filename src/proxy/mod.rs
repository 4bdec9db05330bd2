//! Gateway side: listener, lanes and routing tables.

pub mod manager;
pub mod tables;

pub use manager::ProxyManager;
pub use tables::{Route, RoutingTables, Table};
