//! # Frame
//!
//! A frame is a fixed 12-byte header followed by `length` payload bytes.
//!
//! ```text
//! offset  size  field
//! 0       1     magic (0x2e)
//! 1       2     payload length
//! 3       2     mask (checksum)
//! 5       2     command (bits 0..15) | compressed flag (bit 15)
//! 7       4     sequence
//! 11      1     reserved, always 0
//! ```
//!
//! A frame with a zero-length payload is a keepalive.

use crate::error::{GatewayError, Result};
use bytes::{BufMut, Bytes, BytesMut};

use super::mask;

/// First byte of every frame
pub const FRAME_MAGIC: u8 = 0x2e;

/// Encoded header size
pub const HEADER_LEN: usize = 12;

/// Largest payload the length field can describe
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

const COMPRESSED_FLAG: u16 = 0x8000;
const COMMAND_MASK: u16 = 0x7fff;

/// Header bytes covered by the checksum (everything but the mask field)
const CHECKSUM_SPAN: usize = HEADER_LEN - 2;

/// Command tag carried in the header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Command {
    AuthenticationAAA = 0x7e8e,
    Heartbeat = 0x7e8f,
    RoutingTransparent = 0x7e90,
    Broadcast = 0x7e91,
    ConnectionConfirm = 0x7e92,
    Kick = 0x7e93,
}

impl Command {
    pub fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            0x7e8e => Some(Command::AuthenticationAAA),
            0x7e8f => Some(Command::Heartbeat),
            0x7e90 => Some(Command::RoutingTransparent),
            0x7e91 => Some(Command::Broadcast),
            0x7e92 => Some(Command::ConnectionConfirm),
            0x7e93 => Some(Command::Kick),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u16,
    pub mask: u16,
    /// 15-bit command value; unknown values are carried through untouched
    pub command: u16,
    pub compressed: bool,
    pub sequence: u32,
}

impl FrameHeader {
    pub fn new(command: u16, length: u16, compressed: bool, sequence: u32) -> Self {
        Self {
            length,
            mask: 0,
            command: command & COMMAND_MASK,
            compressed,
            sequence,
        }
    }

    /// Known command, if the raw value maps to one
    pub fn command(&self) -> Option<Command> {
        Command::from_u16(self.command)
    }

    pub fn is_keepalive(&self) -> bool {
        self.length == 0
    }

    fn cmd_flag(&self) -> u16 {
        let flag = if self.compressed { COMPRESSED_FLAG } else { 0 };
        (self.command & COMMAND_MASK) | flag
    }

    /// Header bytes in wire order, mask field skipped
    fn checksum_span(&self) -> [u8; CHECKSUM_SPAN] {
        let mut out = [0u8; CHECKSUM_SPAN];
        out[0] = FRAME_MAGIC;
        out[1..3].copy_from_slice(&self.length.to_be_bytes());
        out[3..5].copy_from_slice(&self.cmd_flag().to_be_bytes());
        out[5..9].copy_from_slice(&self.sequence.to_be_bytes());
        out[9] = 0;
        out
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = FRAME_MAGIC;
        out[1..3].copy_from_slice(&self.length.to_be_bytes());
        out[3..5].copy_from_slice(&self.mask.to_be_bytes());
        out[5..7].copy_from_slice(&self.cmd_flag().to_be_bytes());
        out[7..11].copy_from_slice(&self.sequence.to_be_bytes());
        out[11] = 0;
        out
    }

    pub fn write_to(&self, dst: &mut BytesMut) {
        dst.put_slice(&self.to_bytes());
    }

    /// Parse the first `HEADER_LEN` bytes of `src`.
    pub fn parse(src: &[u8]) -> Result<Self> {
        if src.len() < HEADER_LEN {
            return Err(GatewayError::InvalidHeader);
        }
        if src[0] != FRAME_MAGIC {
            return Err(GatewayError::InvalidMagic(src[0]));
        }
        if src[11] != 0 {
            return Err(GatewayError::InvalidHeader);
        }
        let cmd_flag = u16::from_be_bytes([src[5], src[6]]);
        Ok(Self {
            length: u16::from_be_bytes([src[1], src[2]]),
            mask: u16::from_be_bytes([src[3], src[4]]),
            command: cmd_flag & COMMAND_MASK,
            compressed: cmd_flag & COMPRESSED_FLAG != 0,
            sequence: u32::from_be_bytes([src[7], src[8], src[9], src[10]]),
        })
    }
}

/// Header plus payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    /// Build a frame and compute its mask.
    pub fn seal(command: u16, compressed: bool, sequence: u32, payload: Bytes) -> Result<Self> {
        let length = u16::try_from(payload.len())
            .map_err(|_| GatewayError::OversizedPayload(payload.len()))?;
        let mut header = FrameHeader::new(command, length, compressed, sequence);
        header.mask = mask::compute(&header.checksum_span(), &payload);
        Ok(Self { header, payload })
    }

    /// Zero-length heartbeat
    pub fn keepalive(sequence: u32) -> Self {
        let mut header = FrameHeader::new(Command::Heartbeat.as_u16(), 0, false, sequence);
        header.mask = mask::compute(&header.checksum_span(), &[]);
        Self {
            header,
            payload: Bytes::new(),
        }
    }

    /// Check length and mask against the payload actually received.
    pub fn verify(&self) -> Result<()> {
        if usize::from(self.header.length) != self.payload.len() {
            return Err(GatewayError::InvalidHeader);
        }
        if mask::verify(&self.header.checksum_span(), &self.payload, self.header.mask) {
            Ok(())
        } else {
            Err(GatewayError::ChecksumMismatch)
        }
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(self.encoded_len());
        self.header.write_to(&mut out);
        out.put_slice(&self.payload);
        out
    }
}
