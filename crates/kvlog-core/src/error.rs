//! Error types for configuration and the crypto envelope.

use thiserror::Error;

/// Errors raised while loading or validating configuration.
///
/// All of these are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },

    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Errors raised by [`crate::crypto::CryptoEnvelope`].
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption key {0}")]
    InvalidKey(String),

    #[error("cannot encrypt an empty payload")]
    EmptyPlaintext,

    #[error("ciphertext must be longer than {min} bytes, got {actual}")]
    CiphertextTooShort { min: usize, actual: usize },

    #[error("decryption failed: {0}")]
    Decrypt(String),

    #[error("header is not valid base64: {0}")]
    HeaderEncoding(#[from] base64::DecodeError),

    #[error("decrypted header name is not UTF-8")]
    HeaderUtf8(#[from] std::string::FromUtf8Error),

    #[error("random source unavailable: {0}")]
    Random(String),
}
