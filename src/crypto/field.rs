//! Tagged storage encoding for encrypted columns.
//!
//! A stored value looks like `encrypted-field:<base64(salt || iv || ciphertext)>`.
//! Anything without the tag is treated as plaintext on the way out of
//! storage, which is what lets a freshly submitted password and a value read
//! back from the database share one decode path.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use zeroize::Zeroizing;

use super::cipher::{FieldCipher, BLOCK_LEN, IV_LEN, SALT_LEN};
use super::{CryptoError, CryptoResult};
use crate::config::SettingsSource;

pub const PREFIX: &str = "encrypted-field:";

const IV_START: usize = SALT_LEN;
const CIPHERTEXT_START: usize = IV_START + IV_LEN;

/// A value produced by [`EncryptedField::to_storage`] or loaded verbatim
/// from a protected column. Holding one means "already encrypted".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue(String);

impl StoredValue {
    /// Wrap a string read from storage without inspecting it.
    pub fn from_db(raw: String) -> Self {
        Self(raw)
    }

    pub fn is_encrypted(&self) -> bool {
        self.0.starts_with(PREFIX)
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl AsRef<str> for StoredValue {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Input to [`EncryptedField::to_storage`].
#[derive(Debug, Clone)]
pub enum FieldValue {
    Plain(Zeroizing<String>),
    Stored(StoredValue),
}

impl FieldValue {
    pub fn plain(s: impl Into<String>) -> Self {
        Self::Plain(Zeroizing::new(s.into()))
    }
}

impl From<StoredValue> for FieldValue {
    fn from(v: StoredValue) -> Self {
        Self::Stored(v)
    }
}

/// Codec for one protected column.
#[derive(Debug)]
pub struct EncryptedField {
    cipher: FieldCipher,
}

impl EncryptedField {
    /// Look up the passphrase under `passphrase_setting`. A missing or empty
    /// setting is a configuration error, raised here rather than on first use.
    pub fn from_settings(
        settings: &dyn SettingsSource,
        passphrase_setting: &str,
    ) -> CryptoResult<Self> {
        let passphrase = settings
            .lookup(passphrase_setting)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| CryptoError::MissingPassphrase {
                key: passphrase_setting.to_string(),
            })?;

        Ok(Self {
            cipher: FieldCipher::new(passphrase.as_str()),
        })
    }

    /// Column width needed for plaintexts of up to `max_len` bytes.
    pub fn stored_len(max_len: usize) -> usize {
        PREFIX.len() + FieldCipher::stored_len(max_len)
    }

    pub fn to_storage(&self, value: &FieldValue) -> CryptoResult<StoredValue> {
        let plain = match value {
            FieldValue::Stored(stored) => return Ok(stored.clone()),
            FieldValue::Plain(plain) => plain,
        };
        if plain.starts_with(PREFIX) {
            return Err(CryptoError::ReservedPrefix { prefix: PREFIX });
        }

        let sealed = self.cipher.encrypt(plain.as_bytes())?;
        let mut blob = Zeroizing::new(Vec::with_capacity(
            SALT_LEN + IV_LEN + sealed.ciphertext.len(),
        ));
        blob.extend_from_slice(&sealed.salt);
        blob.extend_from_slice(&sealed.iv);
        blob.extend_from_slice(&sealed.ciphertext);

        Ok(StoredValue(format!("{}{}", PREFIX, STANDARD.encode(blob.as_slice()))))
    }

    pub fn from_storage(&self, value: &str) -> CryptoResult<Zeroizing<String>> {
        let Some(encoded) = value.strip_prefix(PREFIX) else {
            return Ok(Zeroizing::new(value.to_string()));
        };

        let blob = Zeroizing::new(STANDARD.decode(encoded)?);
        if blob.len() < CIPHERTEXT_START + BLOCK_LEN {
            return Err(CryptoError::MalformedStoredValue {
                reason: format!(
                    "{} bytes is shorter than salt, iv and one cipher block",
                    blob.len()
                ),
            });
        }

        let salt = &blob[..IV_START];
        let iv = &blob[IV_START..CIPHERTEXT_START];
        let ciphertext = &blob[CIPHERTEXT_START..];
        let plain = self.cipher.decrypt(salt, iv, ciphertext)?;

        String::from_utf8(plain)
            .map(Zeroizing::new)
            .map_err(|_| CryptoError::Decryption {
                reason: "plaintext is not valid UTF-8",
            })
    }
}
