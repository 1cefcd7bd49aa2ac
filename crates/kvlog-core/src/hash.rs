//! Short key digest used to bucket keys.
//!
//! The digest is the first six hex characters of the CRC32 of the key,
//! taken over the checksum's little-endian bytes. Collisions are expected;
//! every user must fall back to exact byte comparison.

/// Number of hex characters in a digest.
pub const DIGEST_LEN: usize = 6;

/// Compute the 24-bit bucketing digest of a byte key.
pub fn key_digest(key: &[u8]) -> String {
    let checksum = crc32fast::hash(key);
    let mut digest = hex::encode(checksum.to_le_bytes());
    digest.truncate(DIGEST_LEN);
    digest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_six_lowercase_hex_chars() {
        let digest = key_digest(b"some key");
        assert_eq!(digest.len(), DIGEST_LEN);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn digest_is_deterministic() {
        assert_eq!(key_digest(b"k1"), key_digest(b"k1"));
        assert_ne!(key_digest(b"k1"), key_digest(b"k2"));
    }

    #[test]
    fn digest_uses_little_endian_checksum_bytes() {
        // CRC32("123456789") = 0xCBF43926, little-endian bytes 26 39 f4 cb.
        assert_eq!(key_digest(b"123456789"), "2639f4");
    }

    #[test]
    fn empty_key_has_a_digest() {
        assert_eq!(key_digest(b""), "000000");
    }
}
