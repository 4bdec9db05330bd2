//! Tokio codec for frames.
//!
//! The decoder validates the header as soon as 12 bytes are buffered, then
//! waits for the full payload. The consumed bytes are split off the front
//! of the buffer, which keeps the remainder compacted at offset zero.

use crate::core::frame::{Frame, FrameHeader, HEADER_LEN};
use crate::error::{GatewayError, Result};
use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = GatewayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let header = FrameHeader::parse(&src[..HEADER_LEN])?;
        let total = HEADER_LEN + usize::from(header.length);
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut raw = src.split_to(total);
        let payload = raw.split_off(HEADER_LEN).freeze();
        Ok(Some(Frame { header, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = GatewayError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        dst.reserve(frame.encoded_len());
        frame.header.write_to(dst);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}
