//! AES-256-GCM encryption for credential tokens.
//!
//! Each sensitive field is encrypted independently with a unique nonce.
//! The master key must be 32 bytes (256 bits) and is provided from an
//! environment variable at startup.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use thiserror::Error;

/// Size of the encryption key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Failure modes for token encryption and decryption.
///
/// `decrypt` never returns wrong-but-plausible plaintext: GCM authentication
/// rejects a wrong key, a truncated payload, and any tampering.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption key must be {KEY_SIZE} bytes (256 bits), got {0} bytes")]
    BadKeyLength(usize),
    #[error("encryption key is not valid base64")]
    BadKeyEncoding(#[source] base64::DecodeError),
    #[error("ciphertext or nonce is not valid base64")]
    BadCiphertextEncoding(#[source] base64::DecodeError),
    #[error("invalid nonce size: expected {NONCE_SIZE}, got {0}")]
    BadNonceLength(usize),
    #[error("encryption failed")]
    EncryptFailed,
    #[error("decryption failed (wrong key or corrupted data)")]
    DecryptFailed,
    #[error("decrypted data is not valid UTF-8")]
    NotUtf8(#[from] std::string::FromUtf8Error),
}

/// Validates that the master key is exactly 32 bytes when base64 decoded.
pub fn validate_key(key_base64: &str) -> Result<Vec<u8>, CryptoError> {
    let key_bytes = BASE64
        .decode(key_base64)
        .map_err(CryptoError::BadKeyEncoding)?;

    if key_bytes.len() != KEY_SIZE {
        return Err(CryptoError::BadKeyLength(key_bytes.len()));
    }

    Ok(key_bytes)
}

/// Encrypts plaintext using AES-256-GCM with a random nonce.
///
/// Returns the ciphertext and the nonce used, both base64-encoded for
/// storage. The nonce is random per call and is never reused.
pub fn encrypt(plaintext: &str, key: &[u8]) -> Result<(String, String), CryptoError> {
    if key.len() != KEY_SIZE {
        return Err(CryptoError::BadKeyLength(key.len()));
    }

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::BadKeyLength(key.len()))?;

    let nonce_bytes = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext_bytes = cipher
        .encrypt(&nonce_bytes, plaintext.as_bytes())
        .map_err(|_| CryptoError::EncryptFailed)?;

    Ok((BASE64.encode(&ciphertext_bytes), BASE64.encode(nonce_bytes)))
}

/// Decrypts ciphertext using AES-256-GCM.
///
/// The nonce and key must match the ones used during encryption. Fails
/// closed on corrupted or tampered input.
pub fn decrypt(ciphertext: &str, nonce: &str, key: &[u8]) -> Result<String, CryptoError> {
    if key.len() != KEY_SIZE {
        return Err(CryptoError::BadKeyLength(key.len()));
    }

    let ciphertext_bytes = BASE64
        .decode(ciphertext)
        .map_err(CryptoError::BadCiphertextEncoding)?;
    let nonce_bytes = BASE64
        .decode(nonce)
        .map_err(CryptoError::BadCiphertextEncoding)?;

    if nonce_bytes.len() != NONCE_SIZE {
        return Err(CryptoError::BadNonceLength(nonce_bytes.len()));
    }

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::BadKeyLength(key.len()))?;

    let nonce = Nonce::from_slice(&nonce_bytes);

    let plaintext_bytes = cipher
        .decrypt(nonce, ciphertext_bytes.as_ref())
        .map_err(|_| CryptoError::DecryptFailed)?;

    Ok(String::from_utf8(plaintext_bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_validation() {
        // Valid 32-byte key (base64-encoded)
        let valid_key = BASE64.encode([0u8; 32]);
        assert!(validate_key(&valid_key).is_ok());

        // Too short
        let short_key = BASE64.encode([0u8; 16]);
        assert!(matches!(
            validate_key(&short_key),
            Err(CryptoError::BadKeyLength(16))
        ));

        // Too long
        let long_key = BASE64.encode([0u8; 64]);
        assert!(validate_key(&long_key).is_err());

        // Invalid base64
        assert!(matches!(
            validate_key("not-valid-base64!@#$"),
            Err(CryptoError::BadKeyEncoding(_))
        ));
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = [0u8; 32];
        let plaintext = "my-secret-access-token-12345";

        let (ciphertext, nonce) = encrypt(plaintext, &key).expect("Encryption failed");
        assert_ne!(ciphertext, plaintext);

        let decrypted = decrypt(&ciphertext, &nonce, &key).expect("Decryption failed");
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_different_nonces() {
        let key = [0u8; 32];
        let plaintext = "same-plaintext";

        let (ciphertext1, nonce1) = encrypt(plaintext, &key).unwrap();
        let (ciphertext2, nonce2) = encrypt(plaintext, &key).unwrap();

        // Random nonces must differ, so ciphertexts differ too
        assert_ne!(nonce1, nonce2);
        assert_ne!(ciphertext1, ciphertext2);

        assert_eq!(decrypt(&ciphertext1, &nonce1, &key).unwrap(), plaintext);
        assert_eq!(decrypt(&ciphertext2, &nonce2, &key).unwrap(), plaintext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let key1 = [0u8; 32];
        let key2 = [1u8; 32];

        let (ciphertext, nonce) = encrypt("secret", &key1).unwrap();

        assert!(matches!(
            decrypt(&ciphertext, &nonce, &key2),
            Err(CryptoError::DecryptFailed)
        ));
    }

    #[test]
    fn test_wrong_nonce_fails() {
        let key = [0u8; 32];

        let (ciphertext, _) = encrypt("secret", &key).unwrap();
        let (_, wrong_nonce) = encrypt("other", &key).unwrap();

        assert!(decrypt(&ciphertext, &wrong_nonce, &key).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = [0u8; 32];

        let (mut ciphertext, nonce) = encrypt("secret", &key).unwrap();
        ciphertext.push('X');

        // Authenticated encryption detects tampering
        assert!(decrypt(&ciphertext, &nonce, &key).is_err());
    }

    #[test]
    fn test_truncated_ciphertext_fails() {
        let key = [0u8; 32];

        let (ciphertext, nonce) = encrypt("a-token-long-enough-to-truncate", &key).unwrap();
        let truncated = &ciphertext[..ciphertext.len() / 2];

        assert!(decrypt(truncated, &nonce, &key).is_err());
    }
}
