//! AES-256-GCM encrypt/decrypt against the vault's on-disk leaf shape:
//! `{ _encrypted:"aes-256-gcm", _iv:base64, _authTag:base64, _data:base64 }`,
//! keyed by the SHA-256 digest of the caller-provided key.

use crate::error::{Result, VaultError};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const TAG_LEN: usize = 16;
const IV_LEN: usize = 12;

/// The on-disk shape of one encrypted leaf value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedLeaf {
    #[serde(rename = "_encrypted")]
    pub encrypted: String,
    #[serde(rename = "_iv")]
    pub iv: String,
    #[serde(rename = "_authTag")]
    pub auth_tag: String,
    #[serde(rename = "_data")]
    pub data: String,
}

fn derive_key(user_key: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(user_key.as_bytes());
    hasher.finalize().into()
}

/// Encrypts `plaintext` with `user_key`, generating a fresh random 12-byte
/// IV. Two calls with the same plaintext and key differ in `_iv`/`_data`
/// because the IV is re-randomized each time.
pub fn encrypt(user_key: &str, plaintext: &str) -> Result<EncryptedLeaf> {
    let key_bytes = derive_key(user_key);
    let cipher = Aes256Gcm::new_from_slice(&key_bytes)
        .map_err(|e| VaultError::Decryption(format!("bad key length: {e}")))?;

    let mut iv = [0u8; IV_LEN];
    rand::rng().fill_bytes(&mut iv);
    let nonce = Nonce::from_slice(&iv);

    let mut ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|e| VaultError::Decryption(format!("encryption failed: {e}")))?;
    if ciphertext.len() < TAG_LEN {
        return Err(VaultError::Decryption("ciphertext shorter than the auth tag".to_string()));
    }
    let tag = ciphertext.split_off(ciphertext.len() - TAG_LEN);

    Ok(EncryptedLeaf {
        encrypted: "aes-256-gcm".to_string(),
        iv: BASE64.encode(iv),
        auth_tag: BASE64.encode(tag),
        data: BASE64.encode(ciphertext),
    })
}

/// Decrypts a leaf previously produced by [`encrypt`] (or an
/// externally-authored vault file in the same shape).
pub fn decrypt(user_key: &str, leaf: &EncryptedLeaf) -> Result<String> {
    if leaf.encrypted != "aes-256-gcm" {
        return Err(VaultError::Malformed(format!(
            "unsupported encryption scheme '{}'",
            leaf.encrypted
        )));
    }
    let key_bytes = derive_key(user_key);
    let cipher = Aes256Gcm::new_from_slice(&key_bytes)
        .map_err(|e| VaultError::Decryption(format!("bad key length: {e}")))?;

    let iv = BASE64
        .decode(&leaf.iv)
        .map_err(|e| VaultError::Malformed(format!("invalid _iv: {e}")))?;
    let mut combined = BASE64
        .decode(&leaf.data)
        .map_err(|e| VaultError::Malformed(format!("invalid _data: {e}")))?;
    let mut tag = BASE64
        .decode(&leaf.auth_tag)
        .map_err(|e| VaultError::Malformed(format!("invalid _authTag: {e}")))?;
    combined.append(&mut tag);

    let nonce = Nonce::from_slice(&iv);
    let plaintext = cipher
        .decrypt(nonce, combined.as_ref())
        .map_err(|e| VaultError::Decryption(format!("wrong key or corrupted data: {e}")))?;
    String::from_utf8(plaintext).map_err(|e| VaultError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encrypt_and_decrypt() {
        let leaf = encrypt("correct horse battery staple", "s3cr3t-value").unwrap();
        let plaintext = decrypt("correct horse battery staple", &leaf).unwrap();
        assert_eq!(plaintext, "s3cr3t-value");
    }

    #[test]
    fn two_encryptions_of_same_plaintext_differ_in_iv_and_data() {
        let a = encrypt("key", "same plaintext").unwrap();
        let b = encrypt("key", "same plaintext").unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.data, b.data);
    }

    #[test]
    fn decrypt_with_wrong_key_fails() {
        let leaf = encrypt("right-key", "top secret").unwrap();
        assert!(decrypt("wrong-key", &leaf).is_err());
    }

    #[test]
    fn decrypt_rejects_unsupported_scheme() {
        let leaf = EncryptedLeaf {
            encrypted: "rot13".to_string(),
            iv: String::new(),
            auth_tag: String::new(),
            data: String::new(),
        };
        assert!(decrypt("any", &leaf).is_err());
    }
}
