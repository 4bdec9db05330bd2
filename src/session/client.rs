//! Gateway side of an authenticated client.
//!
//! Inbound: mask and sequence check, decrypt, decompress when flagged, then
//! forward to the client's server prefixed with the client uid.
//! Outbound: compress when it pays, encrypt, frame as `RoutingTransparent`.

use crate::core::frame::{Command, Frame, FrameHeader, HEADER_LEN, MAX_PAYLOAD_LEN};
use crate::core::{Uid, UID_LEN};
use crate::error::{GatewayError, Result};
use crate::protocol::messages::encode_addressed;
use crate::session::connection::WeakConnection;
use crate::session::logic::{Outgoing, ProtocolLogic, RoleTag, Router, Sequencer, Unwrapped};
use crate::utils::compression::{self, CompressionKind, COMPRESSION_THRESHOLD};
use crate::utils::crypto::{Direction, KeyMaterial, SessionCipher, TAG_LEN};
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

pub struct ClientLogic {
    sequencer: Sequencer,
    cipher: SessionCipher,
    target: Uid,
    compression: CompressionKind,
    router: Arc<dyn Router>,
    connection: WeakConnection,
}

impl ClientLogic {
    /// Continue a session whose handshake used `sequencer` and issued `material`.
    pub fn new(
        sequencer: Sequencer,
        material: KeyMaterial,
        target: Uid,
        compression: CompressionKind,
        router: Arc<dyn Router>,
    ) -> Self {
        Self {
            sequencer,
            cipher: SessionCipher::new(&material),
            target,
            compression,
            router,
            connection: WeakConnection::default(),
        }
    }

    /// Server uid this client is routed to
    pub fn target(&self) -> Uid {
        self.target
    }
}

impl ProtocolLogic for ClientLogic {
    fn role(&self) -> RoleTag {
        RoleTag::ClientFacing
    }

    fn attach(&mut self, connection: WeakConnection) {
        self.connection = connection;
    }

    fn unwrap(&mut self, frame: Frame) -> Result<Unwrapped> {
        frame.verify()?;
        self.sequencer.accept(frame.header.sequence)?;
        if frame.header.is_keepalive() {
            return Ok(Unwrapped::Consumed);
        }

        let plain = self
            .cipher
            .open(Direction::Upstream, frame.header.sequence, &frame.payload)?;
        let plain = if frame.header.compressed {
            compression::decompress(&plain, self.compression)?
        } else {
            plain
        };
        if plain.len() + UID_LEN > MAX_PAYLOAD_LEN {
            return Err(GatewayError::OversizedPayload(plain.len()));
        }
        Ok(Unwrapped::Deliver(frame.header, Bytes::from(plain)))
    }

    fn wrap(&mut self, outgoing: Outgoing) -> Result<Frame> {
        let (command, payload) = match outgoing {
            Outgoing::Keepalive => return Ok(Frame::keepalive(self.sequencer.next_outgoing())),
            Outgoing::Payload(payload) => (Command::RoutingTransparent, payload),
            Outgoing::Command(command, payload) => (command, payload),
        };

        let (body, compressed) =
            match compression::maybe_compress(&payload, self.compression, COMPRESSION_THRESHOLD)? {
                Some(packed) => (packed, true),
                None => (payload.to_vec(), false),
            };
        if body.len() + TAG_LEN > MAX_PAYLOAD_LEN {
            return Err(GatewayError::OversizedPayload(body.len()));
        }

        let sequence = self.sequencer.next_outgoing();
        let sealed = self.cipher.seal(Direction::Downstream, sequence, &body)?;
        Frame::seal(command.as_u16(), compressed, sequence, Bytes::from(sealed))
    }

    fn required_prefix(&self) -> usize {
        HEADER_LEN + UID_LEN
    }

    fn try_deliver(&mut self, _header: &FrameHeader, payload: &Bytes) -> bool {
        let Some(connection) = self.connection.upgrade() else {
            return true;
        };
        let routed = encode_addressed(connection.uid(), payload);
        if let Err(e) = self.router.send_to_server(self.target, Outgoing::Payload(routed)) {
            debug!(uid = connection.uid(), target = self.target, error = %e, "Client payload dropped");
        }
        true
    }

    fn kick_peer(&mut self) {
        let Some(connection) = self.connection.upgrade() else {
            return;
        };
        let notice = Bytes::copy_from_slice(&connection.uid().to_be_bytes());
        if let Err(e) = self
            .router
            .send_to_server(self.target, Outgoing::Command(Command::Kick, notice))
        {
            debug!(uid = connection.uid(), target = self.target, error = %e, "Leave notice not delivered");
        }
    }
}
