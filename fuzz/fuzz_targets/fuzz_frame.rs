#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use session_gateway::core::codec::FrameCodec;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Decode a raw byte stream - test for panics and runaway buffering
    let mut codec = FrameCodec;
    let mut buf = BytesMut::from(data);
    while let Ok(Some(frame)) = codec.decode(&mut buf) {
        let _ = frame.verify();
    }
});
