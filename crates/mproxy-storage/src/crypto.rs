//! Secret handling for stored API keys: AES-256-GCM under a key derived
//! from the environment master secret, plus masking and strength checks.

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64;
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;

/// Fixed application salt for the KDF. Key derivation is deterministic so
/// every process sharing the master secret can decrypt the same rows.
const KDF_SALT: &[u8] = b"mproxy_api_key_salt";
const KDF_ITERATIONS: u32 = 100_000;
const NONCE_LEN: usize = 12;
const MIN_KEY_LENGTH: usize = 10;
const PLACEHOLDER_PATTERNS: &[&str] = &["demo", "test", "example", "replace", "your-key"];

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed (wrong master key or corrupted ciphertext)")]
    Decrypt,
    #[error("ciphertext is not valid base64")]
    Encoding,
}

/// Symmetric cipher for API-key secrets at rest.
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl SecretCipher {
    pub fn new(master_secret: &str) -> Self {
        let mut key = [0u8; 32];
        pbkdf2_hmac::<Sha256>(
            master_secret.as_bytes(),
            KDF_SALT,
            KDF_ITERATIONS,
            &mut key,
        );
        let cipher = Aes256Gcm::new_from_slice(&key).expect("derived key is 32 bytes");
        Self { cipher }
    }

    /// Encrypt one secret. Output layout: base64(nonce || ciphertext).
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::Encrypt)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(blob))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, CryptoError> {
        let blob = BASE64.decode(encoded).map_err(|_| CryptoError::Encoding)?;
        if blob.len() <= NONCE_LEN {
            return Err(CryptoError::Decrypt);
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CryptoError::Decrypt)?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::Decrypt)
    }
}

/// Logging form of a key: first four characters, the rest asterisks.
pub fn mask_key(key: &str) -> String {
    if key.len() <= 4 {
        return "****".to_string();
    }
    let visible: String = key.chars().take(4).collect();
    let hidden = key.chars().count() - 4;
    format!("{visible}{}", "*".repeat(hidden))
}

/// Refuse obviously unusable secrets before they reach storage.
pub fn validate_key_strength(key: &str) -> Result<(), String> {
    if key.len() < MIN_KEY_LENGTH {
        return Err(format!(
            "key is too short (minimum {MIN_KEY_LENGTH} characters)"
        ));
    }
    let lowered = key.to_ascii_lowercase();
    for pattern in PLACEHOLDER_PATTERNS {
        if lowered.contains(pattern) {
            return Err(format!("key looks like a placeholder ({pattern})"));
        }
    }
    Ok(())
}
