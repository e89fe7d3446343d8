//! AES-256-CBC cipher keyed by PBKDF2 over a long-lived passphrase.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

use super::{CryptoError, CryptoResult};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub const SALT_LEN: usize = 8;
pub const IV_LEN: usize = 32;
pub const KEY_LEN: usize = 32;
pub const BLOCK_LEN: usize = 16;
pub const KDF_ROUNDS: u32 = 1000;

/// Output of one encryption: everything needed to decrypt except the passphrase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub salt: [u8; SALT_LEN],
    pub iv: [u8; IV_LEN],
    pub ciphertext: Vec<u8>,
}

/// Symmetric cipher for a single field value.
///
/// Every call to [`FieldCipher::encrypt`] draws a fresh salt and IV, so the
/// same plaintext never produces the same ciphertext twice. Only the first
/// [`BLOCK_LEN`] bytes of the stored IV feed the CBC chain.
pub struct FieldCipher {
    passphrase: Zeroizing<String>,
}

impl FieldCipher {
    pub fn new(passphrase: impl Into<String>) -> Self {
        Self {
            passphrase: Zeroizing::new(passphrase.into()),
        }
    }

    /// Storage needed for the base64 form of a plaintext up to `max_len` bytes.
    pub fn stored_len(max_len: usize) -> usize {
        // PKCS#7 always adds between 1 and 16 bytes.
        let padded = (max_len / BLOCK_LEN + 1) * BLOCK_LEN;
        base64_len(SALT_LEN + IV_LEN + padded)
    }

    /// PBKDF2-HMAC-SHA256 with a fixed round count.
    pub fn derive_key(&self, salt: &[u8]) -> Zeroizing<[u8; KEY_LEN]> {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        pbkdf2_hmac::<Sha256>(self.passphrase.as_bytes(), salt, KDF_ROUNDS, &mut key[..]);
        key
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> CryptoResult<Sealed> {
        if self.passphrase.is_empty() {
            return Err(CryptoError::NoPassphrase);
        }

        let mut salt = [0u8; SALT_LEN];
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut iv);

        let key = self.derive_key(&salt);
        let ciphertext =
            encryptor(&key[..], &iv[..BLOCK_LEN])?.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        Ok(Sealed {
            salt,
            iv,
            ciphertext,
        })
    }

    pub fn decrypt(&self, salt: &[u8], iv: &[u8], ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
        if self.passphrase.is_empty() {
            return Err(CryptoError::Decryption {
                reason: "no passphrase configured",
            });
        }
        if ciphertext.is_empty() || ciphertext.len() % BLOCK_LEN != 0 {
            return Err(CryptoError::Decryption {
                reason: "ciphertext length is not a multiple of the block size",
            });
        }
        if iv.len() < BLOCK_LEN {
            return Err(CryptoError::Decryption {
                reason: "iv too short",
            });
        }

        let key = self.derive_key(salt);
        let mut buf = ciphertext.to_vec();
        let result = decryptor(&key[..], &iv[..BLOCK_LEN])?
            .decrypt_padded_mut::<Pkcs7>(&mut buf)
            .map(|pt| pt.to_vec())
            .map_err(|_| CryptoError::Decryption {
                reason: "bad padding",
            });
        buf.zeroize();
        result
    }
}

impl std::fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldCipher").finish_non_exhaustive()
    }
}

fn encryptor(key: &[u8], iv: &[u8]) -> CryptoResult<Aes256CbcEnc> {
    Aes256CbcEnc::new_from_slices(key, iv).map_err(|_| CryptoError::Encryption {
        reason: "invalid key or iv length",
    })
}

fn decryptor(key: &[u8], iv: &[u8]) -> CryptoResult<Aes256CbcDec> {
    Aes256CbcDec::new_from_slices(key, iv).map_err(|_| CryptoError::Decryption {
        reason: "invalid key or iv length",
    })
}

fn base64_len(len: usize) -> usize {
    4 * len.div_ceil(3)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let cipher = FieldCipher::new("correct horse battery staple");
        let sealed = cipher.encrypt(b"hunter2").unwrap();
        let plain = cipher
            .decrypt(&sealed.salt, &sealed.iv, &sealed.ciphertext)
            .unwrap();
        assert_eq!(plain, b"hunter2");
    }

    #[test]
    fn test_empty_plaintext_round_trip() {
        let cipher = FieldCipher::new("pw");
        let sealed = cipher.encrypt(b"").unwrap();
        assert_eq!(sealed.ciphertext.len(), BLOCK_LEN);
        let plain = cipher
            .decrypt(&sealed.salt, &sealed.iv, &sealed.ciphertext)
            .unwrap();
        assert!(plain.is_empty());
    }

    #[test]
    fn test_fresh_salt_and_iv_per_call() {
        let cipher = FieldCipher::new("pw");
        let a = cipher.encrypt(b"same").unwrap();
        let b = cipher.encrypt(b"same").unwrap();
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_derive_key_is_deterministic() {
        let cipher = FieldCipher::new("pw");
        let salt = [7u8; SALT_LEN];
        assert_eq!(*cipher.derive_key(&salt), *cipher.derive_key(&salt));
        assert_ne!(*cipher.derive_key(&salt), *cipher.derive_key(&[8u8; SALT_LEN]));
    }

    #[test]
    fn test_ciphertext_is_block_aligned() {
        let cipher = FieldCipher::new("pw");
        for len in [0usize, 1, 15, 16, 17, 300] {
            let sealed = cipher.encrypt(&vec![b'x'; len]).unwrap();
            assert_eq!(sealed.ciphertext.len() % BLOCK_LEN, 0);
            assert!(sealed.ciphertext.len() > len);
        }
    }

    #[test]
    fn test_rejects_unaligned_ciphertext() {
        let cipher = FieldCipher::new("pw");
        let err = cipher.decrypt(&[0; SALT_LEN], &[0; IV_LEN], &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, CryptoError::Decryption { .. }));
    }

    #[test]
    fn test_bad_key_material_reports_the_failing_direction() {
        let key = [0u8; KEY_LEN];
        let short_iv = [0u8; BLOCK_LEN - 1];

        let err = encryptor(&key, &short_iv).err().unwrap();
        assert!(matches!(err, CryptoError::Encryption { .. }));
        assert!(err.to_string().starts_with("encryption failed"));

        let err = decryptor(&key[..KEY_LEN - 1], &[0u8; BLOCK_LEN]).err().unwrap();
        assert!(matches!(err, CryptoError::Decryption { .. }));
    }

    #[test]
    fn test_missing_passphrase() {
        let cipher = FieldCipher::new("");
        assert!(matches!(cipher.encrypt(b"x"), Err(CryptoError::NoPassphrase)));
        let err = cipher
            .decrypt(&[0; SALT_LEN], &[0; IV_LEN], &[0; BLOCK_LEN])
            .unwrap_err();
        assert!(matches!(err, CryptoError::Decryption { .. }));
    }

    #[test]
    fn test_wrong_passphrase_never_yields_original() {
        let sealed = FieldCipher::new("right").encrypt(b"secret value").unwrap();
        let other = FieldCipher::new("wrong");
        match other.decrypt(&sealed.salt, &sealed.iv, &sealed.ciphertext) {
            Ok(plain) => assert_ne!(plain, b"secret value"),
            Err(e) => assert!(matches!(e, CryptoError::Decryption { .. })),
        }
    }

    #[test]
    fn test_stored_len_covers_actual_output() {
        assert_eq!(base64_len(0), 0);
        assert_eq!(base64_len(1), 4);
        assert_eq!(base64_len(3), 4);
        assert_eq!(base64_len(4), 8);
        // 8 + 32 + 304 = 344 bytes -> 460 base64 chars
        assert_eq!(FieldCipher::stored_len(300), 460);
    }
}
