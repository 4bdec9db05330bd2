//! 16-bit one's-complement checksum carried in the header `mask` field.
//!
//! The sum runs over the header bytes with the mask field left out,
//! followed by the payload. An odd trailing byte is padded with zero on the
//! right. Verification adds the transmitted mask to the same sum; a valid
//! frame folds to `0xffff`, whose complement is zero.

fn sum_words(data: &[u8], mut acc: u64) -> u64 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        acc += u64::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = chunks.remainder() {
        acc += u64::from(u16::from_be_bytes([*last, 0]));
    }
    acc
}

fn fold(mut acc: u64) -> u16 {
    while acc >> 16 != 0 {
        acc = (acc & 0xffff) + (acc >> 16);
    }
    acc as u16
}

/// Mask for a header (mask field excluded) followed by its payload.
///
/// `header` must have even length so the payload starts on a word boundary.
pub fn compute(header: &[u8], payload: &[u8]) -> u16 {
    debug_assert!(header.len() % 2 == 0);
    !fold(sum_words(payload, sum_words(header, 0)))
}

/// True when `mask` matches the header and payload.
pub fn verify(header: &[u8], payload: &[u8], mask: u16) -> bool {
    let acc = sum_words(payload, sum_words(header, 0)) + u64::from(mask);
    !fold(acc) == 0
}
