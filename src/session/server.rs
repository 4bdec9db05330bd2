//! Gateway side of an authenticated backend server.
//!
//! Frames are plain. A `Broadcast` frame fans its payload out to the listed
//! clients, a `Kick` frame kicks the named client, and anything else is an
//! addressed payload for one client.

use crate::core::frame::{Command, Frame, FrameHeader, HEADER_LEN};
use crate::core::UID_LEN;
use crate::error::Result;
use crate::protocol::messages::{decode_addressed, decode_broadcast, LinkType};
use crate::session::connection::WeakConnection;
use crate::session::logic::{
    frame_plain, Outgoing, ProtocolLogic, RoleTag, Router, Sequencer, Unwrapped,
};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct ServerLogic {
    sequencer: Sequencer,
    link_type: LinkType,
    router: Arc<dyn Router>,
    connection: WeakConnection,
}

impl ServerLogic {
    pub fn new(sequencer: Sequencer, link_type: LinkType, router: Arc<dyn Router>) -> Self {
        Self {
            sequencer,
            link_type,
            router,
            connection: WeakConnection::default(),
        }
    }
}

impl ProtocolLogic for ServerLogic {
    fn role(&self) -> RoleTag {
        RoleTag::ServerFacing(self.link_type)
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
        Ok(Unwrapped::Deliver(frame.header, frame.payload))
    }

    fn wrap(&mut self, outgoing: Outgoing) -> Result<Frame> {
        let sequence = self.sequencer.next_outgoing();
        frame_plain(outgoing, Command::RoutingTransparent, sequence)
    }

    fn required_prefix(&self) -> usize {
        HEADER_LEN - UID_LEN
    }

    fn try_deliver(&mut self, header: &FrameHeader, payload: &Bytes) -> bool {
        match header.command() {
            Some(Command::Broadcast) => match decode_broadcast(payload) {
                Ok((targets, body)) => {
                    let sent = self.router.broadcast_fanout(&targets, body);
                    debug!(targets = targets.len(), sent, "Broadcast fanned out");
                }
                Err(e) => warn!(error = %e, "Dropping malformed broadcast"),
            },
            Some(Command::Kick) => match decode_addressed(payload) {
                Ok((client, _)) => {
                    self.router.kick_client(client);
                }
                Err(e) => warn!(error = %e, "Dropping malformed kick"),
            },
            _ => match decode_addressed(payload) {
                Ok((client, body)) => {
                    if let Err(e) = self.router.send_to_client(client, body) {
                        debug!(client, error = %e, "Server payload dropped");
                    }
                }
                Err(e) => warn!(error = %e, "Dropping unaddressed payload"),
            },
        }
        true
    }

    fn kick_peer(&mut self) {
        if let Some(connection) = self.connection.upgrade() {
            let kicked = self.router.kick_clients_of_server(connection.uid());
            debug!(uid = connection.uid(), kicked, "Server gone, clients kicked");
        }
    }
}
