//! Direct LAN link between two peers, without the gateway in between.
//!
//! One side connects, the other accepts exactly one peer. Frames carry no
//! sequence, handshake or encryption; [`InnerPairLink::pick_msg`] returns
//! them whole, header included.

use crate::config::InnerPairConfig;
use crate::core::frame::{Command, Frame, FrameHeader, HEADER_LEN};
use crate::error::{GatewayError, Result};
use crate::runtime::LanePool;
use crate::session::connection::{Connection, ConnectionHandle};
use crate::session::inner::InnerPairLogic;
use crate::session::logic::{Outgoing, SessionLogic};
use crate::utils::metrics::GatewayMetrics;
use crate::utils::ring_buffer::{ring_buffer, RingConsumer};
use bytes::Bytes;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

pub struct InnerPairLink {
    lanes: LanePool,
    connection: ConnectionHandle,
    storage: RingConsumer,
    metrics: Arc<GatewayMetrics>,
}

impl InnerPairLink {
    /// Connect to the configured peer, or accept one on `listened_port`.
    pub async fn start(config: InnerPairConfig) -> Result<Self> {
        config.validate_strict()?;
        if config.is_connector {
            let ip: IpAddr = config
                .ip
                .parse()
                .map_err(|_| GatewayError::ConfigError(format!("Invalid peer ip: '{}'", config.ip)))?;
            Self::connect(SocketAddr::new(ip, config.port), &config)
        } else {
            let listener = TcpListener::bind(("0.0.0.0", config.listened_port)).await?;
            Self::accept_on(listener, &config).await
        }
    }

    pub fn connect(addr: SocketAddr, config: &InnerPairConfig) -> Result<Self> {
        let (lanes, connection, storage, metrics) = Self::prepare(config)?;
        let handle = connection.connect(&lanes, addr, config.keepalive);
        info!(peer = %addr, "Inner pair connecting");
        Ok(Self {
            lanes,
            connection: handle,
            storage,
            metrics,
        })
    }

    /// Accept a single peer from `listener`; the listener is closed afterwards.
    pub async fn accept_on(listener: TcpListener, config: &InnerPairConfig) -> Result<Self> {
        let (stream, peer) = listener.accept().await?;
        drop(listener);
        let (lanes, connection, storage, metrics) = Self::prepare(config)?;
        let handle = connection.accept(&lanes, stream, config.keepalive)?;
        info!(%peer, "Inner pair peer accepted");
        Ok(Self {
            lanes,
            connection: handle,
            storage,
            metrics,
        })
    }

    fn prepare(
        config: &InnerPairConfig,
    ) -> Result<(LanePool, Connection, RingConsumer, Arc<GatewayMetrics>)> {
        let lanes = LanePool::new(1)?;
        let (producer, storage) = ring_buffer(config.ring_capacity);
        let metrics = Arc::new(GatewayMetrics::new());
        let connection = Connection::new(
            lanes.next_uid(),
            SessionLogic::InnerPair(InnerPairLogic::new(producer)),
            Arc::clone(&metrics),
        );
        Ok((lanes, connection, storage, metrics))
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        &self.metrics
    }

    pub fn send(&self, payload: &[u8]) -> Result<()> {
        self.connection
            .send(Outgoing::Payload(Bytes::copy_from_slice(payload)))
    }

    pub fn send_command(&self, command: Command, payload: &[u8]) -> Result<()> {
        self.connection
            .send(Outgoing::Command(command, Bytes::copy_from_slice(payload)))
    }

    /// Next complete frame from the peer.
    pub fn pick_msg(&mut self) -> Option<Frame> {
        let mut raw = [0u8; HEADER_LEN];
        if !self.storage.peek(&mut raw) {
            return None;
        }
        // Written by this crate from a verified frame.
        let header = FrameHeader::parse(&raw).ok()?;
        let mut entry = vec![0u8; HEADER_LEN + usize::from(header.length)];
        if !self.storage.try_read(&mut entry) {
            return None;
        }
        let payload = Bytes::from(entry).slice(HEADER_LEN..);
        Some(Frame { header, payload })
    }

    pub fn stop(self) {
        self.connection.close(false);
        self.lanes.shutdown();
        info!("Inner pair link stopped");
    }
}
