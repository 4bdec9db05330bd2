#![no_main]

use libfuzzer_sys::fuzz_target;
use session_gateway::utils::compression::{compress, decompress, CompressionKind};

fuzz_target!(|data: &[u8]| {
    for kind in [CompressionKind::Lz4, CompressionKind::Zstd] {
        if let Ok(compressed) = compress(data, kind) {
            let _ = decompress(&compressed, kind);
        }
        // Malformed input must fail cleanly within the size limit
        let _ = decompress(data, kind);
    }
});
