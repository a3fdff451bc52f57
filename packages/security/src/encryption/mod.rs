// ABOUTME: Secret value encryption using ChaCha20-Poly1305 AEAD
// ABOUTME: Key is derived with HKDF-SHA256 from the configured secret key
//
// SECURITY MODEL:
// - Anyone holding the configured secret key can decrypt every stored secret
// - Changing the key makes previously stored secrets unreadable
// - Ciphertext layout is base64(nonce || ciphertext || tag)

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ring::{
    aead::{self, Nonce, UnboundKey},
    error::Unspecified,
    hkdf,
    rand::{SecureRandom, SystemRandom},
};
use std::sync::Arc;

/// Salt for key derivation (constant, not secret)
const KEY_SALT: &[u8] = b"kernel-secret-encryption-salt-v1";

/// HKDF info string binding the derived key to its purpose
const KEY_INFO: &[u8] = b"agent-secret-encryption";

/// Nonce size for ChaCha20-Poly1305
const NONCE_SIZE: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum EncryptionError {
    #[error("Failed to generate random data: {0}")]
    RandomGeneration(String),

    #[error("Failed to encrypt data: {0}")]
    Encryption(String),

    #[error("Failed to decrypt data: {0}")]
    Decryption(String),

    #[error("Failed to derive encryption key: {0}")]
    KeyDerivation(String),

    #[error("Invalid encrypted data format")]
    InvalidFormat,
}

impl From<Unspecified> for EncryptionError {
    fn from(_: Unspecified) -> Self {
        EncryptionError::Encryption("Cryptographic operation failed".to_string())
    }
}

/// Encrypts and decrypts secret values with a key derived from a passphrase.
#[derive(Debug, Clone)]
pub struct SecretCipher {
    rng: Arc<SystemRandom>,
    encryption_key: Vec<u8>,
}

impl SecretCipher {
    pub fn from_secret_key(secret_key: &str) -> Result<Self, EncryptionError> {
        if secret_key.is_empty() {
            return Err(EncryptionError::KeyDerivation(
                "Secret key must not be empty".to_string(),
            ));
        }

        let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, KEY_SALT);
        let prk = salt.extract(secret_key.as_bytes());

        let mut encryption_key = vec![0u8; 32]; // 256-bit key
        prk.expand(&[KEY_INFO], hkdf::HKDF_SHA256)
            .map_err(|_| EncryptionError::KeyDerivation("HKDF expansion failed".to_string()))?
            .fill(&mut encryption_key)
            .map_err(|_| EncryptionError::KeyDerivation("Key fill failed".to_string()))?;

        Ok(Self {
            rng: Arc::new(SystemRandom::new()),
            encryption_key,
        })
    }

    /// Returns base64-encoded: nonce || ciphertext || tag
    pub fn encrypt(&self, plaintext: &str) -> Result<String, EncryptionError> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        self.rng.fill(&mut nonce_bytes).map_err(|_| {
            EncryptionError::RandomGeneration("Failed to generate nonce".to_string())
        })?;
        let nonce = Nonce::try_assume_unique_for_key(&nonce_bytes)?;

        let unbound_key = UnboundKey::new(&aead::CHACHA20_POLY1305, &self.encryption_key)?;
        let sealing_key = aead::LessSafeKey::new(unbound_key);

        let mut in_out = plaintext.as_bytes().to_vec();
        sealing_key
            .seal_in_place_append_tag(nonce, aead::Aad::empty(), &mut in_out)
            .map_err(|_| EncryptionError::Encryption("Seal operation failed".to_string()))?;

        let mut result = Vec::with_capacity(NONCE_SIZE + in_out.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&in_out);

        Ok(BASE64.encode(&result))
    }

    /// Expects base64-encoded: nonce || ciphertext || tag
    pub fn decrypt(&self, ciphertext: &str) -> Result<String, EncryptionError> {
        if ciphertext.is_empty() {
            return Ok(String::new());
        }

        let encrypted_data = BASE64
            .decode(ciphertext)
            .map_err(|_| EncryptionError::InvalidFormat)?;

        if encrypted_data.len() < NONCE_SIZE + aead::CHACHA20_POLY1305.tag_len() {
            return Err(EncryptionError::InvalidFormat);
        }

        let (nonce_bytes, ciphertext_and_tag) = encrypted_data.split_at(NONCE_SIZE);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)?;

        let unbound_key = UnboundKey::new(&aead::CHACHA20_POLY1305, &self.encryption_key)?;
        let opening_key = aead::LessSafeKey::new(unbound_key);

        let mut in_out = ciphertext_and_tag.to_vec();
        let plaintext = opening_key
            .open_in_place(nonce, aead::Aad::empty(), &mut in_out)
            .map_err(|_| EncryptionError::Decryption("Open operation failed".to_string()))?;

        String::from_utf8(plaintext.to_vec())
            .map_err(|_| EncryptionError::Decryption("Invalid UTF-8 in decrypted data".to_string()))
    }
}

/// Last four characters of a secret for display; shorter values are shown whole.
pub fn secret_hint(plaintext: &str) -> String {
    let count = plaintext.chars().count();
    if count > 4 {
        plaintext.chars().skip(count - 4).collect()
    } else {
        plaintext.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let cipher = SecretCipher::from_secret_key("unit-test-key").unwrap();
        let plaintext = "sk-test-1234567890abcdef";

        let encrypted = cipher.encrypt(plaintext).unwrap();
        assert!(!encrypted.is_empty());
        assert_ne!(encrypted, plaintext);
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), plaintext);
    }

    #[test]
    fn test_encrypt_empty_string() {
        let cipher = SecretCipher::from_secret_key("unit-test-key").unwrap();
        assert_eq!(cipher.encrypt("").unwrap(), "");
        assert_eq!(cipher.decrypt("").unwrap(), "");
    }

    #[test]
    fn test_different_nonces() {
        let cipher = SecretCipher::from_secret_key("unit-test-key").unwrap();

        let encrypted1 = cipher.encrypt("value").unwrap();
        let encrypted2 = cipher.encrypt("value").unwrap();

        // Same plaintext should produce different ciphertext (different nonces)
        assert_ne!(encrypted1, encrypted2);
        assert_eq!(cipher.decrypt(&encrypted1).unwrap(), "value");
        assert_eq!(cipher.decrypt(&encrypted2).unwrap(), "value");
    }

    #[test]
    fn test_same_key_decrypts_across_instances() {
        let first = SecretCipher::from_secret_key("stable").unwrap();
        let second = SecretCipher::from_secret_key("stable").unwrap();

        let encrypted = first.encrypt("carry-over").unwrap();
        assert_eq!(second.decrypt(&encrypted).unwrap(), "carry-over");
    }

    #[test]
    fn test_wrong_key_fails_decrypt() {
        let right = SecretCipher::from_secret_key("right").unwrap();
        let wrong = SecretCipher::from_secret_key("wrong").unwrap();

        let encrypted = right.encrypt("classified").unwrap();
        assert!(matches!(
            wrong.decrypt(&encrypted),
            Err(EncryptionError::Decryption(_))
        ));
    }

    #[test]
    fn test_decrypt_invalid_data() {
        let cipher = SecretCipher::from_secret_key("unit-test-key").unwrap();

        assert!(cipher.decrypt("not-valid-base64!@#").is_err());
        assert!(cipher.decrypt(&BASE64.encode(b"short")).is_err());
        assert!(cipher.decrypt(&BASE64.encode(vec![0u8; 50])).is_err());
    }

    #[test]
    fn test_empty_secret_key_rejected() {
        assert!(matches!(
            SecretCipher::from_secret_key(""),
            Err(EncryptionError::KeyDerivation(_))
        ));
    }

    #[test]
    fn test_secret_hint() {
        assert_eq!(secret_hint("sk-abcdef1234"), "1234");
        assert_eq!(secret_hint("abc"), "abc");
    }
}
