//! Field-level encryption for secrets stored alongside ordinary records.
//!
//! The passphrase lives in the settings source, the ciphertext lives in the
//! database. Reading a protected column requires both.

pub mod cipher;
pub mod field;

use thiserror::Error;

pub use self::cipher::FieldCipher;
pub use self::field::{EncryptedField, FieldValue, StoredValue};

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("setting '{key}' is not configured")]
    MissingPassphrase { key: String },

    #[error("no passphrase configured for field cipher")]
    NoPassphrase,

    #[error("encryption failed: {reason}")]
    Encryption { reason: &'static str },

    #[error("decryption failed: {reason}")]
    Decryption { reason: &'static str },

    #[error("malformed stored value: {reason}")]
    MalformedStoredValue { reason: String },

    #[error("plaintext must not start with the reserved prefix '{prefix}'")]
    ReservedPrefix { prefix: &'static str },
}

impl From<base64::DecodeError> for CryptoError {
    fn from(e: base64::DecodeError) -> Self {
        Self::MalformedStoredValue {
            reason: e.to_string(),
        }
    }
}

pub type CryptoResult<T> = Result<T, CryptoError>;
