//! Back-channel framing: length-prefix (4 bytes LE) + bincode payload.

use crate::protocol::Message;

const LEN_SIZE: usize = 4;
const MAX_MESSAGE_LEN: u32 = 64 * 1024; // acks and handshakes are a few bytes

/// Encode a message into a single frame: 4 bytes LE length + bincode payload.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, WireEncodeError> {
    let payload = bincode::serialize(msg).map_err(WireEncodeError::Encode)?;
    let len = payload.len() as u32;
    if len > MAX_MESSAGE_LEN {
        return Err(WireEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Error encoding a message (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum WireEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("message too large")]
    TooLarge,
}

/// Decode one message from the front of `bytes`. Returns the message and the number of bytes consumed.
/// Call with a partial buffer; `NeedMore` means try again after more data arrives.
pub fn decode_message(bytes: &[u8]) -> Result<(Message, usize), WireDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(WireDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > MAX_MESSAGE_LEN as usize {
        return Err(WireDecodeError::TooLarge);
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(WireDecodeError::NeedMore);
    }
    let msg: Message =
        bincode::deserialize(&bytes[LEN_SIZE..LEN_SIZE + len]).map_err(WireDecodeError::Decode)?;
    Ok((msg, LEN_SIZE + len))
}

/// Error decoding a message (need more bytes, too large, or bincode failure).
#[derive(Debug, thiserror::Error)]
pub enum WireDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("message too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

/// Accumulates back-channel bytes and yields complete messages.
#[derive(Debug, Default)]
pub struct MessageBuffer {
    buf: Vec<u8>,
}

impl MessageBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete message, `Ok(None)` if more bytes are needed.
    pub fn next_message(&mut self) -> Result<Option<Message>, WireDecodeError> {
        match decode_message(&self.buf) {
            Ok((msg, consumed)) => {
                self.buf.drain(..consumed);
                Ok(Some(msg))
            }
            Err(WireDecodeError::NeedMore) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
