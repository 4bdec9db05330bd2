//! Plain LAN link between two peers. No sequence, no handshake, no crypto;
//! each frame lands in the ring buffer exactly as it came off the wire.

use crate::core::frame::{Command, Frame, FrameHeader, HEADER_LEN};
use crate::error::Result;
use crate::session::connection::WeakConnection;
use crate::session::logic::{frame_plain, Outgoing, ProtocolLogic, RoleTag, Unwrapped};
use crate::utils::ring_buffer::RingProducer;
use bytes::Bytes;
use tracing::debug;

pub struct InnerPairLogic {
    storage: RingProducer,
    connection: WeakConnection,
}

impl InnerPairLogic {
    pub fn new(storage: RingProducer) -> Self {
        Self {
            storage,
            connection: WeakConnection::default(),
        }
    }
}

impl ProtocolLogic for InnerPairLogic {
    fn role(&self) -> RoleTag {
        RoleTag::InnerPair
    }

    fn attach(&mut self, connection: WeakConnection) {
        self.connection = connection;
    }

    fn unwrap(&mut self, frame: Frame) -> Result<Unwrapped> {
        frame.verify()?;
        if frame.header.is_keepalive() {
            return Ok(Unwrapped::Consumed);
        }
        Ok(Unwrapped::Deliver(frame.header, frame.payload))
    }

    fn wrap(&mut self, outgoing: Outgoing) -> Result<Frame> {
        frame_plain(outgoing, Command::RoutingTransparent, 0)
    }

    fn required_prefix(&self) -> usize {
        HEADER_LEN
    }

    fn try_deliver(&mut self, header: &FrameHeader, payload: &Bytes) -> bool {
        let stored = self
            .storage
            .try_write_parts(&[&header.to_bytes()[..], &payload[..]]);
        if !stored {
            debug!(len = payload.len(), "Storage full, delivery postponed");
        }
        stored
    }

    fn kick_peer(&mut self) {
        if let Some(connection) = self.connection.upgrade() {
            debug!(uid = connection.uid(), "Inner pair link closed");
        }
    }
}
