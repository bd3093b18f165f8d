//! Control channel encryption
//!
//! Each message is encrypted on its own: the plaintext is base64-encoded,
//! then encrypted with AES-256 in CFB mode under a fresh random IV. The IV
//! travels in the clear ahead of the ciphertext:
//!
//! ```text
//! IV (16 bytes) || AES-256-CFB(base64(plaintext))
//! ```

use crate::error::CryptoError;
use aes::Aes256;
use base64::Engine;
use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;

type Encryptor = cfb_mode::Encryptor<Aes256>;
type Decryptor = cfb_mode::Decryptor<Aes256>;

/// Length of the shared key in bytes (256 bits)
pub const KEY_LENGTH: usize = 32;
/// Length of the initialization vector (one AES block)
pub const IV_LENGTH: usize = 16;

/// Shared symmetric key for the control channel
#[derive(Clone)]
pub struct ControlCipher {
    key: [u8; KEY_LENGTH],
}

impl std::fmt::Debug for ControlCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlCipher").finish_non_exhaustive()
    }
}

impl ControlCipher {
    /// Create from raw key bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_LENGTH {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_LENGTH,
                actual: bytes.len(),
            });
        }

        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(bytes);
        Ok(Self { key })
    }

    /// Create from the hex form used in configuration files
    pub fn from_hex(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(encoded.trim()).map_err(|_| CryptoError::InvalidKeyEncoding)?;
        Self::from_bytes(&bytes)
    }

    /// Encrypt one message
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut iv = [0u8; IV_LENGTH];
        OsRng.fill_bytes(&mut iv);

        let encoded = base64::engine::general_purpose::STANDARD.encode(plaintext);

        let mut out = Vec::with_capacity(IV_LENGTH + encoded.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(encoded.as_bytes());

        Encryptor::new(&self.key.into(), &iv.into()).encrypt(&mut out[IV_LENGTH..]);
        out
    }

    /// Decrypt one message produced by [`ControlCipher::encrypt`]
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.len() < IV_LENGTH {
            return Err(CryptoError::CiphertextTooShort(data.len()));
        }

        let mut iv = [0u8; IV_LENGTH];
        iv.copy_from_slice(&data[..IV_LENGTH]);

        let mut buf = data[IV_LENGTH..].to_vec();
        Decryptor::new(&self.key.into(), &iv.into()).decrypt(&mut buf);

        base64::engine::general_purpose::STANDARD
            .decode(&buf)
            .map_err(|_| CryptoError::InvalidPayload)
    }
}
