//! # Payload Encodings
//!
//! Auxiliary payloads that ride inside frames: the authentication handshake,
//! addressed routing payloads, broadcast target lists and the gateway's
//! notices to servers. All integers are big-endian.
//!
//! ```text
//! auth request   areaId:u16 serverId:u16 linkType:u8 platform..NUL platformLength:u16
//! auth response  errorCode:u8 subtract:u8 modulus:u8 key:[u8;10] assignedUid:u32 linkType:u8
//! addressed      uid:u32 payload..
//! broadcast      targetCount:u16 targets:u32[targetCount] payload..
//! confirm        clientUid:u32 remoteIpv4:u32
//! bundle         (size:u16 block[size])..
//! ```
//!
//! Bundles are a convention between a client and its server: the gateway
//! forwards them like any other payload.

use crate::core::{Uid, UID_LEN};
use crate::error::constants::*;
use crate::error::{GatewayError, Result};
use crate::utils::crypto::{KeyMaterial, KEY_LEN};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Upper bound on the uid list of a single broadcast
pub const MAX_BROADCAST_TARGETS: usize = 1024;

/// Size prefix in front of every bundled block
pub const BUNDLE_PREFIX_LEN: usize = 2;

/// Role a connection announces in its auth request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum LinkType {
    ClientProxy = 0x01,
    GameServer = 0x09,
    ChatServer = 0x0a,
    DbServer = 0x0b,
    /// A game server's own outbound link; registered as `GameServer`
    ActiveGameServer = 0x21,
    InnerPair = 0x22,
}

impl LinkType {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0x01 => Some(LinkType::ClientProxy),
            0x09 => Some(LinkType::GameServer),
            0x0a => Some(LinkType::ChatServer),
            0x0b => Some(LinkType::DbServer),
            0x21 => Some(LinkType::ActiveGameServer),
            0x22 => Some(LinkType::InnerPair),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Link types that register in the server table
    pub fn is_server(self) -> bool {
        matches!(
            self,
            LinkType::GameServer
                | LinkType::ChatServer
                | LinkType::DbServer
                | LinkType::ActiveGameServer
        )
    }

    /// Role the gateway records for a server link
    pub fn server_role(self) -> Self {
        match self {
            LinkType::ActiveGameServer => LinkType::GameServer,
            other => other,
        }
    }
}

/// Result code of the authentication handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    Success = 0,
    ServerNotFound = 1,
    DuplicateServer = 2,
    Malformed = 3,
}

impl ErrorCode {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(ErrorCode::Success),
            1 => Some(ErrorCode::ServerNotFound),
            2 => Some(ErrorCode::DuplicateServer),
            3 => Some(ErrorCode::Malformed),
            _ => None,
        }
    }

    /// Code reported to a peer whose authentication failed with `err`
    pub fn for_error(err: &GatewayError) -> Self {
        match err {
            GatewayError::ServerNotFound(_) | GatewayError::RouteMiss(_) => {
                ErrorCode::ServerNotFound
            }
            GatewayError::DuplicateServer(_) => ErrorCode::DuplicateServer,
            _ => ErrorCode::Malformed,
        }
    }
}

/// `(areaId << 48) | (serverId << 32) | hash(platform)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerIdentity(pub u64);

impl ServerIdentity {
    pub fn derive(area_id: u16, server_id: u16, platform: &[u8]) -> Self {
        let hash = platform
            .iter()
            .fold(0u32, |h, b| h.wrapping_mul(31).wrapping_add(u32::from(*b)));
        Self((u64::from(area_id) << 48) | (u64::from(server_id) << 32) | u64::from(hash))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    pub area_id: u16,
    pub server_id: u16,
    pub link_type: LinkType,
    pub platform: Vec<u8>,
}

impl AuthRequest {
    const FIXED_LEN: usize = 2 + 2 + 1 + 1 + 2;

    pub fn identity(&self) -> ServerIdentity {
        ServerIdentity::derive(self.area_id, self.server_id, &self.platform)
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(Self::FIXED_LEN + self.platform.len());
        out.put_u16(self.area_id);
        out.put_u16(self.server_id);
        out.put_u8(self.link_type.as_u8());
        out.put_slice(&self.platform);
        out.put_u8(0);
        out.put_u16(self.platform.len() as u16);
        out.freeze()
    }

    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < Self::FIXED_LEN {
            return Err(GatewayError::Malformed(ERR_TRUNCATED_AUTH_REQUEST));
        }
        let tail = src.len() - 2;
        let platform_len = usize::from(u16::from_be_bytes([src[tail], src[tail + 1]]));
        if 5 + platform_len + 1 != tail {
            return Err(GatewayError::Malformed(ERR_PLATFORM_LENGTH));
        }
        if src[5 + platform_len] != 0 {
            return Err(GatewayError::Malformed(ERR_PLATFORM_NOT_TERMINATED));
        }
        let link_type =
            LinkType::from_u8(src[4]).ok_or(GatewayError::Malformed(ERR_UNKNOWN_LINK_TYPE))?;
        Ok(Self {
            area_id: u16::from_be_bytes([src[0], src[1]]),
            server_id: u16::from_be_bytes([src[2], src[3]]),
            link_type,
            platform: src[5..5 + platform_len].to_vec(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResponse {
    pub error: ErrorCode,
    pub material: KeyMaterial,
    /// Target server uid for clients, own uid for servers, 0 on failure
    pub assigned_uid: Uid,
    pub link_type: LinkType,
}

impl AuthResponse {
    pub const ENCODED_LEN: usize = 1 + 1 + 1 + KEY_LEN + 4 + 1;

    pub fn failure(error: ErrorCode, link_type: LinkType) -> Self {
        Self {
            error,
            material: KeyMaterial::zeroed(),
            assigned_uid: 0,
            link_type,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error == ErrorCode::Success
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(Self::ENCODED_LEN);
        out.put_u8(self.error as u8);
        out.put_u8(self.material.subtract);
        out.put_u8(self.material.modulus);
        out.put_slice(&self.material.key);
        out.put_u32(self.assigned_uid);
        out.put_u8(self.link_type.as_u8());
        out.freeze()
    }

    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() != Self::ENCODED_LEN {
            return Err(GatewayError::Malformed(ERR_TRUNCATED_AUTH_RESPONSE));
        }
        let error = ErrorCode::from_u8(src[0]).ok_or(GatewayError::Malformed(ERR_UNKNOWN_ERROR_CODE))?;
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&src[3..3 + KEY_LEN]);
        let uid_at = 3 + KEY_LEN;
        let link_type = LinkType::from_u8(src[uid_at + 4])
            .ok_or(GatewayError::Malformed(ERR_UNKNOWN_LINK_TYPE))?;
        Ok(Self {
            error,
            material: KeyMaterial {
                subtract: src[1],
                modulus: src[2],
                key,
            },
            assigned_uid: u32::from_be_bytes([
                src[uid_at],
                src[uid_at + 1],
                src[uid_at + 2],
                src[uid_at + 3],
            ]),
            link_type,
        })
    }
}

/// Prefix `payload` with the uid it is addressed to or came from.
pub fn encode_addressed(uid: Uid, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(UID_LEN + payload.len());
    out.put_u32(uid);
    out.put_slice(payload);
    out.freeze()
}

/// Split the leading uid off an addressed payload without copying.
pub fn decode_addressed(payload: &Bytes) -> Result<(Uid, Bytes)> {
    if payload.len() < UID_LEN {
        return Err(GatewayError::Malformed(ERR_MISSING_UID));
    }
    let uid = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    Ok((uid, payload.slice(UID_LEN..)))
}

pub fn encode_broadcast(targets: &[Uid], payload: &[u8]) -> Result<Bytes> {
    if targets.len() > MAX_BROADCAST_TARGETS {
        return Err(GatewayError::TooManyTargets(targets.len()));
    }
    let mut out = BytesMut::with_capacity(2 + targets.len() * UID_LEN + payload.len());
    out.put_u16(targets.len() as u16);
    for uid in targets {
        out.put_u32(*uid);
    }
    out.put_slice(payload);
    Ok(out.freeze())
}

/// Parse the target list and slice the shared remainder once.
pub fn decode_broadcast(payload: &Bytes) -> Result<(Vec<Uid>, Bytes)> {
    if payload.len() < 2 {
        return Err(GatewayError::Malformed(ERR_TRUNCATED_BROADCAST));
    }
    let count = usize::from(u16::from_be_bytes([payload[0], payload[1]]));
    if count > MAX_BROADCAST_TARGETS {
        return Err(GatewayError::TooManyTargets(count));
    }
    let body = 2 + count * UID_LEN;
    if payload.len() < body {
        return Err(GatewayError::Malformed(ERR_TRUNCATED_BROADCAST));
    }
    let targets = payload[2..body]
        .chunks_exact(UID_LEN)
        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Ok((targets, payload.slice(body..)))
}

/// Gateway notice that a client was routed to this server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectConfirm {
    pub client_uid: Uid,
    pub remote_ip: Ipv4Addr,
}

impl ConnectConfirm {
    pub const ENCODED_LEN: usize = 8;

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(Self::ENCODED_LEN);
        out.put_u32(self.client_uid);
        out.put_u32(u32::from(self.remote_ip));
        out.freeze()
    }

    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() != Self::ENCODED_LEN {
            return Err(GatewayError::Malformed(ERR_TRUNCATED_CONFIRM));
        }
        Ok(Self {
            client_uid: u32::from_be_bytes([src[0], src[1], src[2], src[3]]),
            remote_ip: Ipv4Addr::from(u32::from_be_bytes([src[4], src[5], src[6], src[7]])),
        })
    }
}

/// Pack `blocks` into one payload, each behind its size.
pub fn encode_bundle<B: AsRef<[u8]>>(blocks: &[B]) -> Result<Bytes> {
    let total = blocks
        .iter()
        .map(|b| BUNDLE_PREFIX_LEN + b.as_ref().len())
        .sum();
    let mut out = BytesMut::with_capacity(total);
    for block in blocks {
        let block = block.as_ref();
        let size = u16::try_from(block.len())
            .map_err(|_| GatewayError::OversizedPayload(block.len()))?;
        out.put_u16(size);
        out.put_slice(block);
    }
    Ok(out.freeze())
}

/// Split a bundle back into its blocks without copying.
pub fn decode_bundle(payload: &Bytes) -> Result<Vec<Bytes>> {
    let mut blocks = Vec::new();
    let mut at = 0;
    while at < payload.len() {
        if payload.len() - at < BUNDLE_PREFIX_LEN {
            return Err(GatewayError::Malformed(ERR_TRUNCATED_BUNDLE));
        }
        let size = usize::from(u16::from_be_bytes([payload[at], payload[at + 1]]));
        let start = at + BUNDLE_PREFIX_LEN;
        if payload.len() - start < size {
            return Err(GatewayError::Malformed(ERR_TRUNCATED_BUNDLE));
        }
        blocks.push(payload.slice(start..start + size));
        at = start + size;
    }
    Ok(blocks)
}
