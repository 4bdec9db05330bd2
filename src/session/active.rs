//! Backend server's own link to the gateway.
//!
//! This side starts the handshake: until the gateway answers, payloads are
//! framed as `AuthenticationAAA`. After a successful answer every inbound
//! addressed payload becomes one ring buffer entry
//!
//! ```text
//! uid:u32 | command:u16 | length:u16 | payload[length]
//! ```
//!
//! and `ConnectionConfirm` notices fill the client address table instead.

use crate::core::frame::{Command, Frame, FrameHeader, HEADER_LEN};
use crate::core::{Uid, UID_LEN};
use crate::error::Result;
use crate::protocol::messages::{decode_addressed, AuthResponse, ConnectConfirm};
use crate::session::connection::WeakConnection;
use crate::session::logic::{
    frame_plain, AuthState, Outgoing, ProtocolLogic, RoleTag, Sequencer, Unwrapped,
};
use crate::utils::ring_buffer::RingProducer;
use bytes::Bytes;
use dashmap::DashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Bytes in front of every ring entry payload
pub const ENTRY_HEADER_LEN: usize = 8;

/// Authentication progress shared with the owning link
#[derive(Debug, Default)]
pub struct AuthStatus {
    state: AtomicU8,
    assigned_uid: AtomicU32,
}

impl AuthStatus {
    pub fn state(&self) -> AuthState {
        match self.state.load(Ordering::Acquire) {
            1 => AuthState::VerifiedOk,
            2 => AuthState::VerifiedFailed,
            _ => AuthState::Unverified,
        }
    }

    /// Uid the gateway assigned, once verified
    pub fn assigned_uid(&self) -> Option<Uid> {
        match self.state() {
            AuthState::VerifiedOk => Some(self.assigned_uid.load(Ordering::Acquire)),
            _ => None,
        }
    }

    pub(crate) fn verified(&self, uid: Uid) {
        self.assigned_uid.store(uid, Ordering::Release);
        self.state
            .store(AuthState::VerifiedOk as u8, Ordering::Release);
    }

    pub(crate) fn failed(&self) {
        self.state
            .store(AuthState::VerifiedFailed as u8, Ordering::Release);
    }
}

/// Client uid to remote address, as confirmed by the gateway
pub type AddressBook = Arc<DashMap<Uid, Ipv4Addr>>;

pub struct ActiveOutboundLogic {
    sequencer: Sequencer,
    status: Arc<AuthStatus>,
    storage: RingProducer,
    addresses: AddressBook,
    connection: WeakConnection,
}

impl ActiveOutboundLogic {
    pub fn new(status: Arc<AuthStatus>, storage: RingProducer, addresses: AddressBook) -> Self {
        Self {
            sequencer: Sequencer::default(),
            status,
            storage,
            addresses,
            connection: WeakConnection::default(),
        }
    }

    fn on_auth_response(&mut self, payload: &[u8]) -> Result<Unwrapped> {
        let response = AuthResponse::decode(payload)?;
        if response.is_success() {
            info!(
                assigned_uid = response.assigned_uid,
                link_type = ?response.link_type,
                "Gateway accepted authentication"
            );
            self.status.verified(response.assigned_uid);
        } else {
            warn!(error = ?response.error, "Gateway rejected authentication");
            self.status.failed();
            if let Some(connection) = self.connection.upgrade() {
                connection.kick();
            }
        }
        Ok(Unwrapped::Consumed)
    }
}

impl ProtocolLogic for ActiveOutboundLogic {
    fn role(&self) -> RoleTag {
        RoleTag::ActiveOutboundFacing
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

        match self.status.state() {
            AuthState::Unverified => self.on_auth_response(&frame.payload),
            AuthState::VerifiedFailed => Ok(Unwrapped::Consumed),
            AuthState::VerifiedOk => match frame.header.command() {
                Some(Command::ConnectionConfirm) => {
                    let confirm = ConnectConfirm::decode(&frame.payload)?;
                    debug!(client = confirm.client_uid, ip = %confirm.remote_ip, "Client confirmed");
                    self.addresses.insert(confirm.client_uid, confirm.remote_ip);
                    Ok(Unwrapped::Consumed)
                }
                Some(Command::Kick) => {
                    let (client, _) = decode_addressed(&frame.payload)?;
                    self.addresses.remove(&client);
                    Ok(Unwrapped::Deliver(frame.header, frame.payload))
                }
                _ => Ok(Unwrapped::Deliver(frame.header, frame.payload)),
            },
        }
    }

    fn wrap(&mut self, outgoing: Outgoing) -> Result<Frame> {
        let default = match self.status.state() {
            AuthState::VerifiedOk => Command::RoutingTransparent,
            _ => Command::AuthenticationAAA,
        };
        let sequence = self.sequencer.next_outgoing();
        frame_plain(outgoing, default, sequence)
    }

    fn required_prefix(&self) -> usize {
        HEADER_LEN + UID_LEN
    }

    fn try_deliver(&mut self, header: &FrameHeader, payload: &Bytes) -> bool {
        let (client, body) = match decode_addressed(payload) {
            Ok(parts) => parts,
            Err(e) => {
                warn!(error = %e, "Dropping unaddressed payload");
                return true;
            }
        };

        let mut entry = [0u8; ENTRY_HEADER_LEN];
        entry[..4].copy_from_slice(&client.to_be_bytes());
        entry[4..6].copy_from_slice(&header.command.to_be_bytes());
        entry[6..].copy_from_slice(&(body.len() as u16).to_be_bytes());

        let stored = self.storage.try_write_parts(&[&entry[..], &body[..]]);
        if !stored {
            debug!(client, len = body.len(), "Storage full, delivery postponed");
        }
        stored
    }

    fn kick_peer(&mut self) {
        debug!("Gateway link closed");
    }
}
