//! Forward-channel frames: ack token + content + SHA-256 digest.
//!
//! No length prefix: the content is whatever sits between the fixed-width
//! token at the head and the fixed-width digest at the tail. Frames are
//! ISO-8859-1 text so they survive QR encoding in byte mode.

use crate::charset::{self, CharsetError};
use crate::identity::{AckToken, ACK_LEN};
use crate::integrity::{self, ContentDigest, DIGEST_LEN};
use crate::protocol::INVITATION_TAG;

/// Shortest valid frame: token + empty content + digest.
pub const MIN_FRAME_LEN: usize = ACK_LEN + DIGEST_LEN;

/// An encoded frame, ready to hand to the forward channel.
/// Invariant: every character is ISO-8859-1 and the length is at least `MIN_FRAME_LEN`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(String);

impl Frame {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Length in characters, which equals the length in bytes on the wire.
    pub fn len(&self) -> usize {
        self.0.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// ISO-8859-1 bytes of the frame.
    pub fn to_bytes(&self) -> Vec<u8> {
        // Invariant guarantees every char fits in a byte.
        self.0.chars().map(|ch| u32::from(ch) as u8).collect()
    }
}

/// Parsed parts of a scanned frame. The digest is not checked by decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub ack: AckToken,
    pub content: String,
    pub digest: ContentDigest,
}

impl DecodedFrame {
    /// True when the carried digest matches the carried content.
    pub fn is_intact(&self) -> bool {
        integrity::verify(&self.content, &self.digest)
    }

    /// Back-channel address if this frame is a pairing invitation.
    pub fn invitation_address(&self) -> Option<&str> {
        self.content.strip_prefix(INVITATION_TAG)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {len} bytes is shorter than {min}", min = MIN_FRAME_LEN)]
    Malformed { len: usize },
    #[error("not representable in ISO-8859-1: {0}")]
    Unrepresentable(#[from] CharsetError),
}

/// Build a frame: `ack || content || digest(content)`.
pub fn encode_frame(ack: AckToken, content: &str) -> Result<Frame, FrameError> {
    let digest = integrity::digest(content)?;
    let mut out = String::with_capacity(MIN_FRAME_LEN + content.len());
    out.push_str(&ack.to_latin1());
    out.push_str(content);
    out.push_str(&digest.to_latin1());
    Ok(Frame(out))
}

/// Invitation frame advertising the sender's back-channel address before pairing.
pub fn invitation_frame(ack: AckToken, address: &str) -> Result<Frame, FrameError> {
    encode_frame(ack, &format!("{}{}", INVITATION_TAG, address))
}

/// Split scanned text into token, content and digest.
pub fn decode_frame(text: &str) -> Result<DecodedFrame, FrameError> {
    let bytes = charset::to_latin1_bytes(text)?;
    if bytes.len() < MIN_FRAME_LEN {
        return Err(FrameError::Malformed { len: bytes.len() });
    }
    let content_end = bytes.len() - DIGEST_LEN;
    let ack = AckToken::from_bytes([bytes[0], bytes[1]]);
    let mut digest = [0u8; DIGEST_LEN];
    digest.copy_from_slice(&bytes[content_end..]);
    Ok(DecodedFrame {
        ack,
        content: charset::from_latin1_bytes(&bytes[ACK_LEN..content_end]),
        digest: ContentDigest::from_bytes(digest),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn layout_is_token_content_digest() {
        let ack = AckToken::from_bytes([b'x', b'y']);
        let frame = encode_frame(ack, "hello").unwrap();
        let s = frame.as_str();
        assert!(s.starts_with("xyhello"));
        assert_eq!(frame.len(), MIN_FRAME_LEN + 5);
        let tail: String = s.chars().skip(ACK_LEN + 5).collect();
        assert_eq!(tail, integrity::digest("hello").unwrap().to_latin1());
    }

    #[test]
    fn empty_content_is_minimum_frame() {
        let frame = encode_frame(AckToken::generate(), "").unwrap();
        assert_eq!(frame.len(), MIN_FRAME_LEN);
        let decoded = decode_frame(frame.as_str()).unwrap();
        assert_eq!(decoded.content, "");
        assert!(decoded.is_intact());
    }

    #[test]
    fn short_input_is_malformed() {
        let frame = encode_frame(AckToken::generate(), "").unwrap();
        let short: String = frame.as_str().chars().take(MIN_FRAME_LEN - 1).collect();
        assert_eq!(
            decode_frame(&short),
            Err(FrameError::Malformed {
                len: MIN_FRAME_LEN - 1
            })
        );
        assert!(matches!(decode_frame(""), Err(FrameError::Malformed { len: 0 })));
    }

    #[test]
    fn wide_content_is_rejected_not_mangled() {
        assert!(matches!(
            encode_frame(AckToken::generate(), "naïve ✓"),
            Err(FrameError::Unrepresentable(_))
        ));
        assert!(matches!(
            decode_frame(&"✓".repeat(40)),
            Err(FrameError::Unrepresentable(_))
        ));
    }

    #[test]
    fn decode_does_not_verify() {
        let frame = encode_frame(AckToken::generate(), "payload").unwrap();
        let tampered = frame.as_str().replacen("payload", "paylOad", 1);
        let decoded = decode_frame(&tampered).unwrap();
        assert_eq!(decoded.content, "paylOad");
        assert!(!decoded.is_intact());
    }

    #[test]
    fn invitation_carries_address() {
        let frame = invitation_frame(AckToken::generate(), "192.168.1.4:45681").unwrap();
        let decoded = decode_frame(frame.as_str()).unwrap();
        assert!(decoded.is_intact());
        assert_eq!(decoded.invitation_address(), Some("192.168.1.4:45681"));
    }

    #[test]
    fn bytes_match_characters() {
        let frame = encode_frame(AckToken::from_bytes([0xFF, 0x00]), "é").unwrap();
        let bytes = frame.to_bytes();
        assert_eq!(bytes.len(), frame.len());
        assert_eq!(&bytes[..3], &[0xFF, 0x00, 0xE9]);
    }

    fn latin1_text() -> impl Strategy<Value = String> {
        proptest::collection::vec(any::<u8>(), 0..256)
            .prop_map(|bytes| charset::from_latin1_bytes(&bytes))
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(token in any::<[u8; 2]>(), content in latin1_text()) {
            let ack = AckToken::from_bytes(token);
            let frame = encode_frame(ack, &content).unwrap();
            let decoded = decode_frame(frame.as_str()).unwrap();
            prop_assert_eq!(decoded.ack, ack);
            prop_assert_eq!(&decoded.content, &content);
            prop_assert_eq!(decoded.digest, integrity::digest(&content).unwrap());
            prop_assert!(decoded.is_intact());
        }

        #[test]
        fn single_byte_tamper_is_detected(
            content in proptest::collection::vec(any::<u8>(), 1..128),
            pick in any::<prop::sample::Index>(),
            mask in 1u8..=255,
        ) {
            let text = charset::from_latin1_bytes(&content);
            let frame = encode_frame(AckToken::generate(), &text).unwrap();
            let mut bytes = frame.to_bytes();
            let at = ACK_LEN + pick.index(content.len());
            bytes[at] ^= mask;
            let decoded = decode_frame(&charset::from_latin1_bytes(&bytes)).unwrap();
            prop_assert!(!decoded.is_intact());
        }
    }
}
