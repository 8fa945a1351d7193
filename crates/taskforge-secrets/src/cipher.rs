use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use rand::Rng;

use crate::error::{Result, SecretsError};

/// Process-wide AES-256-GCM cipher built once from the master key.
///
/// Ciphertext layout: base64(nonce(12) || ciphertext+tag). GCM
/// authenticates the payload, so a flipped bit anywhere in the encoded
/// value fails decryption rather than yielding garbage plaintext.
#[derive(Clone)]
pub struct MasterCipher {
    cipher: Aes256Gcm,
}

impl MasterCipher {
    /// Build the cipher from a base64-encoded 32-byte key.
    pub fn from_base64_key(key_b64: &str) -> Result<Self> {
        let key = base64::engine::general_purpose::STANDARD
            .decode(key_b64.trim())
            .map_err(|e| SecretsError::MasterKey(format!("not valid base64: {e}")))?;
        if key.len() != 32 {
            return Err(SecretsError::MasterKey(format!(
                "expected 32 bytes, got {}",
                key.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|_| SecretsError::MasterKey("key rejected by cipher".into()))?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| SecretsError::InvalidKey)?;

        let mut packed = Vec::with_capacity(12 + ciphertext.len());
        packed.extend_from_slice(&nonce_bytes);
        packed.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(packed))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let packed = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| SecretsError::InvalidKey)?;

        // nonce + at least the GCM tag
        if packed.len() < 12 + 16 {
            return Err(SecretsError::InvalidKey);
        }

        let (nonce_bytes, ciphertext) = packed.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| SecretsError::InvalidKey)?;

        String::from_utf8(plaintext).map_err(|_| SecretsError::InvalidKey)
    }
}

#[cfg(test)]
pub(crate) fn test_cipher() -> MasterCipher {
    let key = base64::engine::general_purpose::STANDARD.encode([0x42u8; 32]);
    MasterCipher::from_base64_key(&key).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let cipher = test_cipher();
        let ct = cipher.encrypt("li_at=AQEDAT...").unwrap();
        assert_ne!(ct, "li_at=AQEDAT...");
        assert_eq!(cipher.decrypt(&ct).unwrap(), "li_at=AQEDAT...");
    }

    #[test]
    fn nonce_makes_ciphertexts_differ() {
        let cipher = test_cipher();
        let a = cipher.encrypt("v").unwrap();
        let b = cipher.encrypt("v").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_ciphertext_rejected() {
        let cipher = test_cipher();
        let ct = cipher.encrypt("payload").unwrap();

        // Flip one byte in the packed payload and re-encode.
        let mut packed = base64::engine::general_purpose::STANDARD
            .decode(&ct)
            .unwrap();
        let last = packed.len() - 1;
        packed[last] ^= 0x01;
        let corrupted = base64::engine::general_purpose::STANDARD.encode(packed);

        assert!(matches!(
            cipher.decrypt(&corrupted),
            Err(SecretsError::InvalidKey)
        ));
    }

    #[test]
    fn wrong_key_rejected() {
        let cipher = test_cipher();
        let ct = cipher.encrypt("payload").unwrap();

        let other_key = base64::engine::general_purpose::STANDARD.encode([0x43u8; 32]);
        let other = MasterCipher::from_base64_key(&other_key).unwrap();
        assert!(matches!(other.decrypt(&ct), Err(SecretsError::InvalidKey)));
    }

    #[test]
    fn short_key_rejected() {
        let short = base64::engine::general_purpose::STANDARD.encode([0u8; 16]);
        assert!(matches!(
            MasterCipher::from_base64_key(&short),
            Err(SecretsError::MasterKey(_))
        ));
    }
}
