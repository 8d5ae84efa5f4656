use crate::error::{ConfigurationError, ProtectError};
use aes_gcm::{
  aead::{Aead, AeadCore, KeyInit, OsRng},
  Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose, Engine};
use std::fmt;

// 96 bit nonce used by GCM
const NONCE_SIZE: usize = 12;

/// Symmetric protect/unprotect used for the affinity keys handed out to clients.
pub trait DataProtector: fmt::Debug + Send + Sync {
  fn protect(&self, plaintext: &[u8]) -> Result<Vec<u8>, ProtectError>;

  fn unprotect(&self, protected: &[u8]) -> Result<Vec<u8>, ProtectError>;
}

/// AES-256-GCM with a random nonce per call. The nonce is prepended to the ciphertext.
pub struct AesGcmProtector {
  cipher: Aes256Gcm,
}

impl AesGcmProtector {
  pub fn new(key: &[u8; 32]) -> AesGcmProtector {
    AesGcmProtector {
      cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
    }
  }

  pub fn generate() -> AesGcmProtector {
    let key = Aes256Gcm::generate_key(&mut OsRng);
    AesGcmProtector {
      cipher: Aes256Gcm::new(&key),
    }
  }

  pub fn from_base64(encoded: &str) -> Result<AesGcmProtector, ConfigurationError> {
    let bytes = general_purpose::STANDARD
      .decode(encoded.trim())
      .map_err(|e| ConfigurationError::InvalidProtectionKey(e.to_string()))?;
    let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
      ConfigurationError::InvalidProtectionKey(format!("expected 32 bytes, got {}", bytes.len()))
    })?;
    Ok(AesGcmProtector::new(&key))
  }
}

impl fmt::Debug for AesGcmProtector {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.write_str("AesGcmProtector")
  }
}

impl DataProtector for AesGcmProtector {
  fn protect(&self, plaintext: &[u8]) -> Result<Vec<u8>, ProtectError> {
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = self
      .cipher
      .encrypt(&nonce, plaintext)
      .map_err(|_| ProtectError::Encryption)?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce);
    output.extend_from_slice(&ciphertext);
    Ok(output)
  }

  fn unprotect(&self, protected: &[u8]) -> Result<Vec<u8>, ProtectError> {
    if protected.len() < NONCE_SIZE {
      return Err(ProtectError::Truncated);
    }
    let (nonce, ciphertext) = protected.split_at(NONCE_SIZE);
    self
      .cipher
      .decrypt(Nonce::from_slice(nonce), ciphertext)
      .map_err(|_| ProtectError::Authentication)
  }
}
