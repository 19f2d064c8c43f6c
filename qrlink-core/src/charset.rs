//! ISO-8859-1 mapping shared by frames, digests and tokens.
//! One character per byte: code points 0..=255 map to the byte of the same value.

/// A character that has no single-byte ISO-8859-1 representation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("character {ch:?} at position {position} is outside ISO-8859-1")]
pub struct CharsetError {
    pub ch: char,
    pub position: usize,
}

/// Encode text as ISO-8859-1 bytes. Fails on the first character above U+00FF.
pub fn to_latin1_bytes(text: &str) -> Result<Vec<u8>, CharsetError> {
    text.chars()
        .enumerate()
        .map(|(position, ch)| u8::try_from(ch).map_err(|_| CharsetError { ch, position }))
        .collect()
}

/// Decode ISO-8859-1 bytes. Total: every byte is a valid character.
pub fn from_latin1_bytes(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

pub fn is_latin1(text: &str) -> bool {
    text.chars().all(|ch| u32::from(ch) <= 0xFF)
}
