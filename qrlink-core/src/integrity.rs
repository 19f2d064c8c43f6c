//! Integrity: SHA-256 content digest carried at the tail of every frame.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::charset::{self, CharsetError};

/// Digest width in bytes (and in ISO-8859-1 characters once rendered).
pub const DIGEST_LEN: usize = 32;

/// SHA-256 of a content string's ISO-8859-1 bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentDigest([u8; DIGEST_LEN]);

impl ContentDigest {
    pub fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        ContentDigest(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Fixed-width rendering used on the wire: 32 ISO-8859-1 characters.
    pub fn to_latin1(&self) -> String {
        charset::from_latin1_bytes(&self.0)
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ContentDigest(")?;
        for b in &self.0[..4] {
            write!(f, "{:02x}", b)?;
        }
        f.write_str("..)")
    }
}

/// Hash raw bytes.
pub fn hash_bytes(bytes: &[u8]) -> ContentDigest {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    ContentDigest(hasher.finalize().into())
}

/// Digest of a content string. Fails when the content cannot be expressed in ISO-8859-1.
pub fn digest(content: &str) -> Result<ContentDigest, CharsetError> {
    let bytes = charset::to_latin1_bytes(content)?;
    Ok(hash_bytes(&bytes))
}

/// Verify content against an expected digest. Unencodable content never verifies.
pub fn verify(content: &str, expected: &ContentDigest) -> bool {
    digest(content).map(|d| d == *expected).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_verify_roundtrip() {
        let d = digest("hello frame").unwrap();
        assert!(verify("hello frame", &d));
    }

    #[test]
    fn verify_rejects_tampered() {
        let d = digest("hello frame").unwrap();
        assert!(!verify("hellO frame", &d));
    }

    #[test]
    fn known_vector() {
        let d = digest("abc").unwrap();
        assert_eq!(
            &d.as_bytes()[..8],
            &[0xba, 0x78, 0x16, 0xbf, 0x8f, 0x01, 0xcf, 0xea]
        );
    }

    #[test]
    fn high_half_hashed_as_single_bytes() {
        assert_eq!(digest("é").unwrap(), hash_bytes(&[0xE9]));
    }

    #[test]
    fn rendering_is_fixed_width() {
        let d = digest("").unwrap();
        assert_eq!(d.to_latin1().chars().count(), DIGEST_LEN);
    }

    #[test]
    fn wide_content_has_no_digest() {
        assert!(digest("snow ☃").is_err());
        let d = digest("snow").unwrap();
        assert!(!verify("snow ☃", &d));
    }
}
