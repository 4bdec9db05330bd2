#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use session_gateway::protocol::messages::{decode_broadcast, AuthRequest, AuthResponse, ConnectConfirm};

fuzz_target!(|data: &[u8]| {
    if let Ok(request) = AuthRequest::decode(data) {
        let _ = AuthRequest::decode(&request.encode());
    }
    let _ = AuthResponse::decode(data);
    let _ = ConnectConfirm::decode(data);
    let _ = decode_broadcast(&Bytes::copy_from_slice(data));
});
