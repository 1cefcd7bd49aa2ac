//! Symmetric envelope encryption for payloads crossing the log boundary.
//!
//! Each call to [`CryptoEnvelope::encrypt`] draws a fresh random 16-byte IV,
//! encrypts with AES-256-CBC and PKCS#7 padding, and returns `IV || ciphertext`.
//! [`Envelope`] wraps the optional envelope so callers can apply it
//! unconditionally: when encryption is disabled every operation is the
//! identity.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::error::CryptoError;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// AES block size, also the width of the prepended IV.
pub const IV_LEN: usize = 16;

/// Length of the hex-encoded 256-bit key.
pub const KEY_HEX_LEN: usize = 64;

/// AES-256-CBC envelope over a single configured key.
#[derive(Clone)]
pub struct CryptoEnvelope {
    key: [u8; 32],
}

impl std::fmt::Debug for CryptoEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoEnvelope").finish_non_exhaustive()
    }
}

impl CryptoEnvelope {
    /// Build an envelope from a 64-character hex key.
    pub fn from_hex(key_hex: &str) -> Result<Self, CryptoError> {
        if key_hex.len() != KEY_HEX_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "must be {KEY_HEX_LEN} hex characters (256 bits), got {}",
                key_hex.len()
            )));
        }
        if !key_hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CryptoError::InvalidKey(
                "contains characters outside 0-9a-fA-F".to_string(),
            ));
        }
        let mut key = [0u8; 32];
        hex::decode_to_slice(key_hex, &mut key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self { key })
    }

    /// Encrypt a non-empty payload, returning `IV || ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if plaintext.is_empty() {
            return Err(CryptoError::EmptyPlaintext);
        }
        let mut iv = [0u8; IV_LEN];
        getrandom::getrandom(&mut iv).map_err(|e| CryptoError::Random(e.to_string()))?;

        let cipher = Aes256CbcEnc::new_from_slices(&self.key, &iv)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt `IV || ciphertext` produced by [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, input: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if input.len() <= IV_LEN + 1 {
            return Err(CryptoError::CiphertextTooShort {
                min: IV_LEN + 1,
                actual: input.len(),
            });
        }
        let (iv, ciphertext) = input.split_at(IV_LEN);
        let cipher = Aes256CbcDec::new_from_slices(&self.key, iv)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        cipher
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|e| CryptoError::Decrypt(e.to_string()))
    }
}

/// The envelope as applied to log traffic: either on or the identity.
#[derive(Debug, Clone, Default)]
pub enum Envelope {
    #[default]
    Disabled,
    Enabled(CryptoEnvelope),
}

impl Envelope {
    pub fn is_enabled(&self) -> bool {
        matches!(self, Envelope::Enabled(_))
    }

    /// Encrypt a key or value.
    pub fn seal(&self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self {
            Envelope::Disabled => Ok(payload.to_vec()),
            Envelope::Enabled(envelope) => envelope.encrypt(payload),
        }
    }

    /// Decrypt a key or value.
    pub fn open(&self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self {
            Envelope::Disabled => Ok(payload.to_vec()),
            Envelope::Enabled(envelope) => envelope.decrypt(payload),
        }
    }

    /// Encrypt a header name; the envelope output is base64 text.
    pub fn seal_header_name(&self, name: &str) -> Result<String, CryptoError> {
        match self {
            Envelope::Disabled => Ok(name.to_string()),
            Envelope::Enabled(envelope) => Ok(STANDARD.encode(envelope.encrypt(name.as_bytes())?)),
        }
    }

    /// Reverse [`seal_header_name`](Self::seal_header_name).
    pub fn open_header_name(&self, name: &str) -> Result<String, CryptoError> {
        match self {
            Envelope::Disabled => Ok(name.to_string()),
            Envelope::Enabled(envelope) => {
                let raw = STANDARD.decode(name)?;
                Ok(String::from_utf8(envelope.decrypt(&raw)?)?)
            }
        }
    }

    /// Encrypt a header value; the envelope output is base64-wrapped.
    pub fn seal_header_value(&self, value: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self {
            Envelope::Disabled => Ok(value.to_vec()),
            Envelope::Enabled(envelope) => {
                Ok(STANDARD.encode(envelope.encrypt(value)?).into_bytes())
            }
        }
    }

    /// Reverse [`seal_header_value`](Self::seal_header_value).
    pub fn open_header_value(&self, value: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self {
            Envelope::Disabled => Ok(value.to_vec()),
            Envelope::Enabled(envelope) => envelope.decrypt(&STANDARD.decode(value)?),
        }
    }
}
