//! # Cluster Link
//!
//! The backend server's connector to the gateway. [`ClusterLink::connect`]
//! opens one outbound connection on a private lane, authenticates with the
//! configured identity and from then on:
//!
//! - [`ClusterLink::send`] addresses a payload to one client
//! - [`ClusterLink::broadcast`] fans a payload out to a list of clients
//! - [`ClusterLink::pick_msg`] drains inbound client payloads, one per call
//!
//! Inbound payloads queue in a ring buffer between the lane and the caller;
//! when the ring is full the lane stops reading until `pick_msg` frees space.

use crate::config::ClusterConfig;
use crate::core::frame::{Command, MAX_PAYLOAD_LEN};
use crate::core::{Uid, UID_LEN};
use crate::error::constants::ERR_NOT_AUTHENTICATED;
use crate::error::{GatewayError, Result};
use crate::protocol::messages::{encode_addressed, encode_broadcast, AuthRequest};
use crate::runtime::LanePool;
use crate::session::active::{ActiveOutboundLogic, AddressBook, AuthStatus, ENTRY_HEADER_LEN};
use crate::session::connection::{Connection, ConnectionHandle};
use crate::session::logic::{AuthState, Outgoing, SessionLogic};
use crate::utils::metrics::GatewayMetrics;
use crate::utils::ring_buffer::{ring_buffer, RingConsumer};
use bytes::Bytes;
use dashmap::DashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tracing::info;

/// One client payload taken out of the ring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Client the payload came from
    pub uid: Uid,
    /// Raw frame command; `Kick` means the client left
    pub command: u16,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn command(&self) -> Option<Command> {
        Command::from_u16(self.command)
    }

    pub fn is_departure(&self) -> bool {
        self.command() == Some(Command::Kick)
    }
}

pub struct ClusterLink {
    lanes: LanePool,
    connection: ConnectionHandle,
    storage: RingConsumer,
    status: Arc<AuthStatus>,
    addresses: AddressBook,
    metrics: Arc<GatewayMetrics>,
}

impl ClusterLink {
    /// Connect to the gateway and queue the authentication request.
    pub fn connect(config: ClusterConfig) -> Result<Self> {
        config.validate_strict()?;
        let ip: IpAddr = config
            .proxy_ip
            .parse()
            .map_err(|_| GatewayError::ConfigError(format!("Invalid proxy_ip: '{}'", config.proxy_ip)))?;
        let addr = SocketAddr::new(ip, config.proxy_port);

        let lanes = LanePool::new(1)?;
        let (producer, storage) = ring_buffer(config.ring_capacity);
        let status = Arc::new(AuthStatus::default());
        let addresses: AddressBook = Arc::new(DashMap::new());
        let metrics = Arc::new(GatewayMetrics::new());

        let logic = SessionLogic::ActiveOutbound(ActiveOutboundLogic::new(
            Arc::clone(&status),
            producer,
            Arc::clone(&addresses),
        ));
        let connection = Connection::new(lanes.next_uid(), logic, Arc::clone(&metrics));

        let request = AuthRequest {
            area_id: config.area_id,
            server_id: config.sid,
            link_type: config.link_type,
            platform: config.platform.as_bytes().to_vec(),
        };
        let connection = connection.connect(&lanes, addr, config.keepalive);
        // Sent by the lane as soon as the socket is up.
        connection.send(Outgoing::Payload(request.encode()))?;
        info!(
            gateway = %addr,
            area_id = config.area_id,
            sid = config.sid,
            link_type = ?config.link_type,
            "Cluster link connecting"
        );

        Ok(Self {
            lanes,
            connection,
            storage,
            status,
            addresses,
            metrics,
        })
    }

    pub fn auth_state(&self) -> AuthState {
        self.status.state()
    }

    /// Uid the gateway registered this server under
    pub fn assigned_uid(&self) -> Option<Uid> {
        self.status.assigned_uid()
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        &self.metrics
    }

    fn ensure_verified(&self) -> Result<()> {
        match self.status.state() {
            AuthState::VerifiedOk => Ok(()),
            _ => Err(GatewayError::InvalidState(ERR_NOT_AUTHENTICATED)),
        }
    }

    /// Address `payload` to one client.
    pub fn send(&self, client: Uid, payload: &[u8]) -> Result<()> {
        self.ensure_verified()?;
        if payload.len() + UID_LEN > MAX_PAYLOAD_LEN {
            return Err(GatewayError::OversizedPayload(payload.len()));
        }
        self.connection
            .send(Outgoing::Payload(encode_addressed(client, payload)))
    }

    /// Deliver `payload` to every client in `targets`.
    pub fn broadcast(&self, targets: &[Uid], payload: &[u8]) -> Result<()> {
        self.ensure_verified()?;
        let body = encode_broadcast(targets, payload)?;
        if body.len() > MAX_PAYLOAD_LEN {
            return Err(GatewayError::OversizedPayload(body.len()));
        }
        self.connection
            .send(Outgoing::Command(Command::Broadcast, body))
    }

    /// Ask the gateway to disconnect `client`.
    pub fn kick_client(&self, client: Uid) -> Result<()> {
        self.ensure_verified()?;
        let notice = Bytes::copy_from_slice(&client.to_be_bytes());
        self.connection
            .send(Outgoing::Command(Command::Kick, notice))
    }

    /// Next queued client payload, if a complete one is available.
    pub fn pick_msg(&mut self) -> Option<InboundMessage> {
        let mut head = [0u8; ENTRY_HEADER_LEN];
        if !self.storage.peek(&mut head) {
            return None;
        }
        let len = usize::from(u16::from_be_bytes([head[6], head[7]]));
        let mut entry = vec![0u8; ENTRY_HEADER_LEN + len];
        if !self.storage.try_read(&mut entry) {
            return None;
        }
        let payload = entry.split_off(ENTRY_HEADER_LEN);
        Some(InboundMessage {
            uid: u32::from_be_bytes([head[0], head[1], head[2], head[3]]),
            command: u16::from_be_bytes([head[4], head[5]]),
            payload,
        })
    }

    /// Address the gateway confirmed for `client`
    pub fn remote_ip(&self, client: Uid) -> Option<Ipv4Addr> {
        self.addresses.get(&client).map(|ip| *ip)
    }

    /// Close the link and stop its lane.
    pub fn stop(self) {
        self.connection.close(false);
        self.lanes.shutdown();
        info!("Cluster link stopped");
    }
}
