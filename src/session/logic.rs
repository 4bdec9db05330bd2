//! # Session Logic
//!
//! The pluggable half of a connection. The connection owns the socket and
//! the timers; its logic decides what a frame means and how an outgoing
//! payload is framed.
//!
//! ## Variants
//! - **Default**: unauthenticated; expects an auth request and hands over
//!   to one of the two gateway roles
//! - **Client**: gateway side of a client link; encrypted, compressed
//! - **Server**: gateway side of a backend server link; plain, addressed
//! - **ActiveOutbound**: backend server's own link to the gateway
//! - **InnerPair**: plain LAN link between two peers
//! - **Endpoint**: end-user client's own link to the gateway
//!
//! A role transition replaces the whole variant. The connection applies it
//! between two frames, so no frame is ever seen by two variants.

use crate::core::frame::{Command, Frame, FrameHeader};
use crate::core::Uid;
use crate::error::{GatewayError, Result};
use crate::protocol::messages::{LinkType, ServerIdentity};
use crate::session::active::ActiveOutboundLogic;
use crate::session::client::ClientLogic;
use crate::session::connection::WeakConnection;
use crate::session::endpoint::EndpointLogic;
use crate::session::handshake::DefaultLogic;
use crate::session::inner::InnerPairLogic;
use crate::session::server::ServerLogic;
use bytes::Bytes;
use std::net::Ipv4Addr;

/// Something to send on a connection, before framing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    /// Framed with the variant's default command
    Payload(Bytes),
    /// Framed with an explicit command
    Command(Command, Bytes),
    /// Zero-length heartbeat
    Keepalive,
}

/// What a logic made of one inbound frame
pub enum Unwrapped {
    /// Hand the payload to `try_deliver`
    Deliver(FrameHeader, Bytes),
    /// Fully handled inside the logic
    Consumed,
    /// Write `reply` first; then switch to `next`, or kick when it is `None`
    Handshake {
        reply: Frame,
        next: Option<SessionLogic>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleTag {
    Unverified,
    ClientFacing,
    ServerFacing(LinkType),
    ActiveOutboundFacing,
    InnerPair,
    Endpoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthState {
    Unverified = 0,
    VerifiedOk = 1,
    VerifiedFailed = 2,
}

/// Outcome of a successful authentication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    /// Target server uid for clients, own uid for servers
    pub assigned_uid: Uid,
    /// Server role the connection was routed to or registered as
    pub link_type: LinkType,
}

/// Per-direction frame counters.
///
/// Every received frame must carry exactly the previous sequence plus one;
/// every sent frame carries the next value of an independent counter. Both
/// start so that the first frame is 1.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sequencer {
    last_received: u32,
    last_sent: u32,
}

impl Sequencer {
    pub fn accept(&mut self, sequence: u32) -> Result<()> {
        let expected = self.last_received.wrapping_add(1);
        if sequence != expected {
            return Err(GatewayError::SequenceMismatch {
                expected,
                actual: sequence,
            });
        }
        self.last_received = sequence;
        Ok(())
    }

    pub fn next_outgoing(&mut self) -> u32 {
        self.last_sent = self.last_sent.wrapping_add(1);
        self.last_sent
    }
}

/// The manager operations a logic calls into.
pub trait Router: Send + Sync {
    /// Decide a connection's role and promote it. On success the uid has
    /// moved out of the unmanaged table.
    fn verify_authentication(
        &self,
        link_type: LinkType,
        identity: ServerIdentity,
        uid: Uid,
        remote_ip: Ipv4Addr,
    ) -> Result<Verdict>;

    fn send_to_server(&self, server: Uid, outgoing: Outgoing) -> Result<()>;

    fn send_to_client(&self, client: Uid, payload: Bytes) -> Result<()>;

    /// Returns the number of targets the payload was posted to
    fn broadcast_fanout(&self, targets: &[Uid], payload: Bytes) -> usize;

    fn kick_client(&self, client: Uid) -> bool;

    fn kick_clients_of_server(&self, server: Uid) -> usize;
}

/// Contract shared by every variant
pub trait ProtocolLogic {
    fn role(&self) -> RoleTag;

    /// Give the logic its back-reference to the owning connection.
    fn attach(&mut self, connection: WeakConnection);

    fn unwrap(&mut self, frame: Frame) -> Result<Unwrapped>;

    fn wrap(&mut self, outgoing: Outgoing) -> Result<Frame>;

    /// Bytes of framing this variant adds in front of a payload
    fn required_prefix(&self) -> usize;

    /// `false` means the receiver is full; the same payload is offered again later.
    fn try_deliver(&mut self, header: &FrameHeader, payload: &Bytes) -> bool;

    /// Tell the other side of a route that this connection is gone.
    fn kick_peer(&mut self);
}

pub enum SessionLogic {
    Default(DefaultLogic),
    Client(ClientLogic),
    Server(ServerLogic),
    ActiveOutbound(ActiveOutboundLogic),
    InnerPair(InnerPairLogic),
    Endpoint(EndpointLogic),
}

macro_rules! dispatch {
    ($self:ident, $logic:ident => $call:expr) => {
        match $self {
            SessionLogic::Default($logic) => $call,
            SessionLogic::Client($logic) => $call,
            SessionLogic::Server($logic) => $call,
            SessionLogic::ActiveOutbound($logic) => $call,
            SessionLogic::InnerPair($logic) => $call,
            SessionLogic::Endpoint($logic) => $call,
        }
    };
}

impl ProtocolLogic for SessionLogic {
    fn role(&self) -> RoleTag {
        dispatch!(self, logic => logic.role())
    }

    fn attach(&mut self, connection: WeakConnection) {
        dispatch!(self, logic => logic.attach(connection))
    }

    fn unwrap(&mut self, frame: Frame) -> Result<Unwrapped> {
        dispatch!(self, logic => logic.unwrap(frame))
    }

    fn wrap(&mut self, outgoing: Outgoing) -> Result<Frame> {
        dispatch!(self, logic => logic.wrap(outgoing))
    }

    fn required_prefix(&self) -> usize {
        dispatch!(self, logic => logic.required_prefix())
    }

    fn try_deliver(&mut self, header: &FrameHeader, payload: &Bytes) -> bool {
        dispatch!(self, logic => logic.try_deliver(header, payload))
    }

    fn kick_peer(&mut self) {
        dispatch!(self, logic => logic.kick_peer())
    }
}

/// Frame a payload without encryption or compression.
pub(crate) fn frame_plain(outgoing: Outgoing, default: Command, sequence: u32) -> Result<Frame> {
    match outgoing {
        Outgoing::Keepalive => Ok(Frame::keepalive(sequence)),
        Outgoing::Payload(payload) => Frame::seal(default.as_u16(), false, sequence, payload),
        Outgoing::Command(command, payload) => {
            Frame::seal(command.as_u16(), false, sequence, payload)
        }
    }
}
