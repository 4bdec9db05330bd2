//! Default logic: the state of every accepted connection until it has
//! authenticated.
//!
//! The first non-keepalive frame must be an `AuthenticationAAA` request.
//! The router decides the role and promotes the connection. The reply is
//! framed here in plain form and written before the replacement logic takes
//! over; a failed attempt gets an error reply and the connection is kicked
//! once the reply is out.

use crate::core::frame::{Command, Frame, FrameHeader, HEADER_LEN};
use crate::error::constants::{ERR_CONNECTION_GONE, ERR_EXPECTED_AUTH};
use crate::error::{GatewayError, Result};
use crate::protocol::messages::{AuthRequest, AuthResponse, ErrorCode, LinkType};
use crate::session::client::ClientLogic;
use crate::session::connection::WeakConnection;
use crate::session::logic::{
    frame_plain, AuthState, Outgoing, ProtocolLogic, RoleTag, Router, Sequencer, SessionLogic,
    Unwrapped,
};
use crate::session::server::ServerLogic;
use crate::utils::compression::CompressionKind;
use crate::utils::crypto::KeyMaterial;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{info, warn};

pub struct DefaultLogic {
    sequencer: Sequencer,
    auth: AuthState,
    compression: CompressionKind,
    router: Arc<dyn Router>,
    connection: WeakConnection,
}

impl DefaultLogic {
    pub fn new(router: Arc<dyn Router>, compression: CompressionKind) -> Self {
        Self {
            sequencer: Sequencer::default(),
            auth: AuthState::Unverified,
            compression,
            router,
            connection: WeakConnection::default(),
        }
    }

    pub fn auth_state(&self) -> AuthState {
        self.auth
    }

    fn authenticate(&mut self, frame: Frame) -> Result<Unwrapped> {
        let connection = self
            .connection
            .upgrade()
            .ok_or(GatewayError::InvalidState(ERR_CONNECTION_GONE))?;
        let uid = connection.uid();

        let request = match frame.header.command() {
            Some(Command::AuthenticationAAA) => AuthRequest::decode(&frame.payload),
            _ => Err(GatewayError::Malformed(ERR_EXPECTED_AUTH)),
        };
        let request = match request {
            Ok(request) => request,
            Err(e) => return self.reject(uid, e, LinkType::ClientProxy),
        };

        let verdict = match self.router.verify_authentication(
            request.link_type,
            request.identity(),
            uid,
            connection.remote_ipv4(),
        ) {
            Ok(verdict) => verdict,
            Err(e) => return self.reject(uid, e, request.link_type),
        };

        self.auth = AuthState::VerifiedOk;
        let material = KeyMaterial::generate();
        let reply = self.frame_response(&AuthResponse {
            error: ErrorCode::Success,
            material: material.clone(),
            assigned_uid: verdict.assigned_uid,
            link_type: verdict.link_type,
        })?;

        let next = if request.link_type == LinkType::ClientProxy {
            SessionLogic::Client(ClientLogic::new(
                self.sequencer,
                material,
                verdict.assigned_uid,
                self.compression,
                Arc::clone(&self.router),
            ))
        } else {
            SessionLogic::Server(ServerLogic::new(
                self.sequencer,
                verdict.link_type,
                Arc::clone(&self.router),
            ))
        };
        info!(
            uid,
            link_type = ?request.link_type,
            assigned_uid = verdict.assigned_uid,
            "Authenticated"
        );
        Ok(Unwrapped::Handshake {
            reply,
            next: Some(next),
        })
    }

    fn reject(&mut self, uid: u32, error: GatewayError, link_type: LinkType) -> Result<Unwrapped> {
        self.auth = AuthState::VerifiedFailed;
        warn!(uid, error = %error, "Authentication rejected");
        let reply = self.frame_response(&AuthResponse::failure(
            ErrorCode::for_error(&error),
            link_type,
        ))?;
        Ok(Unwrapped::Handshake { reply, next: None })
    }

    fn frame_response(&mut self, response: &AuthResponse) -> Result<Frame> {
        self.wrap(Outgoing::Command(
            Command::AuthenticationAAA,
            response.encode(),
        ))
    }
}

impl ProtocolLogic for DefaultLogic {
    fn role(&self) -> RoleTag {
        RoleTag::Unverified
    }

    fn attach(&mut self, connection: WeakConnection) {
        self.connection = connection;
    }

    fn unwrap(&mut self, frame: Frame) -> Result<Unwrapped> {
        frame.verify()?;
        self.sequencer.accept(frame.header.sequence)?;
        if frame.header.is_keepalive() || self.auth != AuthState::Unverified {
            return Ok(Unwrapped::Consumed);
        }
        self.authenticate(frame)
    }

    fn wrap(&mut self, outgoing: Outgoing) -> Result<Frame> {
        let sequence = self.sequencer.next_outgoing();
        frame_plain(outgoing, Command::AuthenticationAAA, sequence)
    }

    fn required_prefix(&self) -> usize {
        HEADER_LEN
    }

    fn try_deliver(&mut self, _header: &FrameHeader, _payload: &Bytes) -> bool {
        // Nothing is delivered before authentication.
        true
    }

    fn kick_peer(&mut self) {}
}
