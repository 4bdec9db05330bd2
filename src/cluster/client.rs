//! # Client Link
//!
//! An end-user client's connection to the gateway. [`ClientLink::connect`]
//! opens one outbound connection on a private lane and sends the
//! authentication request for the configured server. Once the gateway has
//! answered, payloads travel encrypted in both directions:
//!
//! - [`ClientLink::send`] frames one payload right away
//! - [`ClientLink::queue`] and [`ClientLink::flush`] batch small blocks into
//!   bundles, each filling at most one frame
//! - [`ClientLink::pick_msg`] drains inbound payloads, one per call

use crate::config::ClientConfig;
use crate::core::frame::Command;
use crate::core::Uid;
use crate::error::constants::ERR_NOT_AUTHENTICATED;
use crate::error::{GatewayError, Result};
use crate::protocol::messages::{encode_bundle, AuthRequest, LinkType, BUNDLE_PREFIX_LEN};
use crate::runtime::LanePool;
use crate::session::active::AuthStatus;
use crate::session::connection::{Connection, ConnectionHandle};
use crate::session::endpoint::{EndpointLogic, ENDPOINT_ENTRY_HEADER_LEN, MAX_ENDPOINT_PAYLOAD_LEN};
use crate::session::logic::{AuthState, Outgoing, SessionLogic};
use crate::utils::metrics::GatewayMetrics;
use crate::utils::ring_buffer::{ring_buffer, RingConsumer};
use bytes::Bytes;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, info};

/// One payload from the server, decrypted and decompressed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientMessage {
    /// Raw frame command
    pub command: u16,
    pub payload: Vec<u8>,
}

impl ClientMessage {
    pub fn command(&self) -> Option<Command> {
        Command::from_u16(self.command)
    }
}

pub struct ClientLink {
    lanes: LanePool,
    connection: ConnectionHandle,
    storage: RingConsumer,
    status: Arc<AuthStatus>,
    queued: Vec<Bytes>,
    metrics: Arc<GatewayMetrics>,
}

impl ClientLink {
    /// Connect to the gateway and queue the authentication request.
    pub fn connect(config: ClientConfig) -> Result<Self> {
        config.validate_strict()?;
        let ip: IpAddr = config
            .proxy_ip
            .parse()
            .map_err(|_| GatewayError::ConfigError(format!("Invalid proxy_ip: '{}'", config.proxy_ip)))?;
        let addr = SocketAddr::new(ip, config.proxy_port);

        let lanes = LanePool::new(1)?;
        let (producer, storage) = ring_buffer(config.ring_capacity);
        let status = Arc::new(AuthStatus::default());
        let metrics = Arc::new(GatewayMetrics::new());

        let logic = SessionLogic::Endpoint(EndpointLogic::new(
            Arc::clone(&status),
            producer,
            config.compression,
        ));
        let connection = Connection::new(lanes.next_uid(), logic, Arc::clone(&metrics));

        let request = AuthRequest {
            area_id: config.area_id,
            server_id: config.sid,
            link_type: LinkType::ClientProxy,
            platform: config.platform.as_bytes().to_vec(),
        };
        let connection = connection.connect(&lanes, addr, config.keepalive);
        connection.send(Outgoing::Payload(request.encode()))?;
        info!(gateway = %addr, area_id = config.area_id, sid = config.sid, "Client link connecting");

        Ok(Self {
            lanes,
            connection,
            storage,
            status,
            queued: Vec::new(),
            metrics,
        })
    }

    pub fn auth_state(&self) -> AuthState {
        self.status.state()
    }

    /// Uid of the server the gateway routed this client to
    pub fn server_uid(&self) -> Option<Uid> {
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

    /// Send `payload` to the server as one frame.
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        self.ensure_verified()?;
        if payload.len() > MAX_ENDPOINT_PAYLOAD_LEN {
            return Err(GatewayError::OversizedPayload(payload.len()));
        }
        self.connection
            .send(Outgoing::Payload(Bytes::copy_from_slice(payload)))
    }

    /// Hold `block` until the next [`flush`](Self::flush).
    pub fn queue(&mut self, block: &[u8]) -> Result<()> {
        if BUNDLE_PREFIX_LEN + block.len() > MAX_ENDPOINT_PAYLOAD_LEN {
            return Err(GatewayError::OversizedPayload(block.len()));
        }
        self.queued.push(Bytes::copy_from_slice(block));
        Ok(())
    }

    /// Send every queued block, packed into as few bundles as fit a frame.
    /// Returns the number of frames sent.
    pub fn flush(&mut self) -> Result<usize> {
        self.ensure_verified()?;
        let mut frames = 0;
        let mut start = 0;
        let mut size = 0;
        for (index, block) in self.queued.iter().enumerate() {
            let cost = BUNDLE_PREFIX_LEN + block.len();
            if size + cost > MAX_ENDPOINT_PAYLOAD_LEN {
                self.send_bundle(start, index)?;
                frames += 1;
                start = index;
                size = 0;
            }
            size += cost;
        }
        if start < self.queued.len() {
            self.send_bundle(start, self.queued.len())?;
            frames += 1;
        }
        debug!(blocks = self.queued.len(), frames, "Queued blocks flushed");
        self.queued.clear();
        Ok(frames)
    }

    fn send_bundle(&self, start: usize, end: usize) -> Result<()> {
        let bundle = encode_bundle(&self.queued[start..end])?;
        self.connection.send(Outgoing::Payload(bundle))
    }

    /// Next queued server payload, if a complete one is available.
    pub fn pick_msg(&mut self) -> Option<ClientMessage> {
        let mut head = [0u8; ENDPOINT_ENTRY_HEADER_LEN];
        if !self.storage.peek(&mut head) {
            return None;
        }
        let len = usize::from(u16::from_be_bytes([head[2], head[3]]));
        let mut entry = vec![0u8; ENDPOINT_ENTRY_HEADER_LEN + len];
        if !self.storage.try_read(&mut entry) {
            return None;
        }
        let payload = entry.split_off(ENDPOINT_ENTRY_HEADER_LEN);
        Some(ClientMessage {
            command: u16::from_be_bytes([head[0], head[1]]),
            payload,
        })
    }

    /// Close the link and stop its lane.
    pub fn stop(self) {
        self.connection.close(false);
        self.lanes.shutdown();
        info!("Client link stopped");
    }
}
