//! Internet checksum (RFC 1071) over 16-bit words.
//!
//! Words are the big-endian reading of the wire bytes, so the result can be
//! written back with `to_be_bytes`. Callers must pass an even number of bytes
//! to [`be_words`]: an odd trailing byte is dropped, not zero-padded.

/// Checksum of a run of words.
///
/// A computed value of `0` is returned as `0xFFFF`, so a zero checksum field
/// always means "no checksum" on the wire.
pub fn checksum(words: &[u16]) -> u16 {
    checksum2(words, &[])
}

/// Checksum over the concatenation of two runs of words, for a pseudo-header
/// that is not contiguous with the header it covers.
pub fn checksum2(prefix: &[u16], suffix: &[u16]) -> u16 {
    let mut sum: u32 = 0;
    for word in prefix.iter().chain(suffix) {
        sum += u32::from(*word);
    }

    sum = (sum >> 16) + (sum & 0xFFFF);
    sum += sum >> 16;

    match !(sum as u16) {
        0 => 0xFFFF,
        result => result,
    }
}

/// Read bytes as big-endian 16-bit words
pub fn be_words(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}

/// Checksum of a byte buffer (see [`be_words`] for the length contract)
pub fn checksum_bytes(bytes: &[u8]) -> u16 {
    checksum(&be_words(bytes))
}
