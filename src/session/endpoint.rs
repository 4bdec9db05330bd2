//! End-user side of a client link.
//!
//! Mirrors [`ClientLogic`](crate::session::client::ClientLogic) from the
//! other end of the socket. Until the gateway answers, payloads go out plain
//! as `AuthenticationAAA`. A successful answer carries the key material;
//! from then on outbound payloads are compressed when it pays and sealed for
//! upstream, inbound payloads are opened and decompressed. Each one becomes
//! a ring buffer entry
//!
//! ```text
//! command:u16 | length:u16 | payload[length]
//! ```

use crate::core::frame::{Command, Frame, FrameHeader, HEADER_LEN, MAX_PAYLOAD_LEN};
use crate::error::{GatewayError, Result};
use crate::protocol::messages::AuthResponse;
use crate::session::active::AuthStatus;
use crate::session::connection::WeakConnection;
use crate::session::logic::{
    frame_plain, AuthState, Outgoing, ProtocolLogic, RoleTag, Sequencer, Unwrapped,
};
use crate::utils::compression::{self, CompressionKind, COMPRESSION_THRESHOLD};
use crate::utils::crypto::{Direction, SessionCipher, TAG_LEN};
use crate::utils::ring_buffer::RingProducer;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Bytes in front of every ring entry payload
pub const ENDPOINT_ENTRY_HEADER_LEN: usize = 4;

/// Largest payload that still fits one sealed frame
pub const MAX_ENDPOINT_PAYLOAD_LEN: usize = MAX_PAYLOAD_LEN - TAG_LEN;

pub struct EndpointLogic {
    sequencer: Sequencer,
    cipher: Option<SessionCipher>,
    compression: CompressionKind,
    status: Arc<AuthStatus>,
    storage: RingProducer,
    connection: WeakConnection,
}

impl EndpointLogic {
    pub fn new(status: Arc<AuthStatus>, storage: RingProducer, compression: CompressionKind) -> Self {
        Self {
            sequencer: Sequencer::default(),
            cipher: None,
            compression,
            status,
            storage,
            connection: WeakConnection::default(),
        }
    }

    fn on_auth_response(&mut self, frame: &Frame) -> Result<Unwrapped> {
        let response = AuthResponse::decode(&frame.payload)?;
        if response.is_success() {
            info!(server_uid = response.assigned_uid, "Gateway accepted client");
            self.cipher = Some(SessionCipher::new(&response.material));
            self.status.verified(response.assigned_uid);
        } else {
            warn!(error = ?response.error, "Gateway rejected client");
            self.status.failed();
            if let Some(connection) = self.connection.upgrade() {
                connection.kick();
            }
        }
        Ok(Unwrapped::Consumed)
    }
}

impl ProtocolLogic for EndpointLogic {
    fn role(&self) -> RoleTag {
        RoleTag::Endpoint
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

        let Some(cipher) = self.cipher.as_ref() else {
            return match self.status.state() {
                AuthState::Unverified => self.on_auth_response(&frame),
                _ => Ok(Unwrapped::Consumed),
            };
        };

        let plain = cipher.open(Direction::Downstream, frame.header.sequence, &frame.payload)?;
        let plain = if frame.header.compressed {
            compression::decompress(&plain, self.compression)?
        } else {
            plain
        };
        if plain.len() > usize::from(u16::MAX) {
            return Err(GatewayError::OversizedPayload(plain.len()));
        }
        Ok(Unwrapped::Deliver(frame.header, Bytes::from(plain)))
    }

    fn wrap(&mut self, outgoing: Outgoing) -> Result<Frame> {
        let Some(cipher) = self.cipher.as_ref() else {
            let sequence = self.sequencer.next_outgoing();
            return frame_plain(outgoing, Command::AuthenticationAAA, sequence);
        };
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
        if body.len() > MAX_ENDPOINT_PAYLOAD_LEN {
            return Err(GatewayError::OversizedPayload(body.len()));
        }

        let sequence = self.sequencer.next_outgoing();
        let sealed = cipher.seal(Direction::Upstream, sequence, &body)?;
        Frame::seal(command.as_u16(), compressed, sequence, Bytes::from(sealed))
    }

    fn required_prefix(&self) -> usize {
        HEADER_LEN
    }

    fn try_deliver(&mut self, header: &FrameHeader, payload: &Bytes) -> bool {
        let mut entry = [0u8; ENDPOINT_ENTRY_HEADER_LEN];
        entry[..2].copy_from_slice(&header.command.to_be_bytes());
        entry[2..].copy_from_slice(&(payload.len() as u16).to_be_bytes());

        let stored = self.storage.try_write_parts(&[&entry[..], &payload[..]]);
        if !stored {
            debug!(len = payload.len(), "Storage full, delivery postponed");
        }
        stored
    }

    fn kick_peer(&mut self) {
        debug!("Client link closed");
    }
}
