//! # Core Wire Components
//!
//! Frame header, checksum and the tokio codec that splits a byte stream
//! into frames.
//!
//! ## Wire Format
//! ```text
//! [Magic(1)] [Length(2)] [Mask(2)] [Cmd(15)|Compressed(1)] [Sequence(4)] [Reserved(1)] [Payload(Length)]
//! ```
//! All integers are big-endian.
//!
//! ## Validation
//! - Magic byte and reserved byte are checked before the payload is awaited
//! - Payload length is bounded by the 16-bit length field
//! - The mask is a 16-bit one's-complement checksum over header and payload

pub mod codec;
pub mod frame;
pub mod mask;

/// Connection identifier; unique per live connection and never 0
pub type Uid = u32;

/// Bytes used by a uid on the wire
pub const UID_LEN: usize = 4;
