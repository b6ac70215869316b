// Credential sealing with AES-256-GCM.
//
// The process key lives in a key file created on first boot (0600). Sealed
// payloads are base64(nonce || ciphertext || tag); a fresh nonce is drawn for
// every seal operation.

use crate::errors::VaultError;
use crate::models::{GitSecret, SshSecret};
use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::fs;
use std::path::Path;
use tracing::info;

/// Size of the AES-GCM nonce (12 bytes)
const NONCE_SIZE: usize = 12;
/// Size of the process key (256 bits)
const KEY_SIZE: usize = 32;

/// Symmetric sealer for opaque credential payloads
pub trait SecretSealer: Send + Sync {
    fn seal(&self, plaintext: &[u8]) -> Result<String, VaultError>;
    fn open(&self, ciphertext: &str) -> Result<Vec<u8>, VaultError>;
}

pub struct AesGcmSealer {
    cipher: Aes256Gcm,
}

impl AesGcmSealer {
    /// Read the key file, creating it with a fresh random key on first boot
    pub fn load_or_create(key_path: &Path) -> Result<Self, VaultError> {
        let key_bytes = if key_path.exists() {
            let bytes = fs::read(key_path)
                .map_err(|e| VaultError::KeyUnavailable(format!("read {}: {}", key_path.display(), e)))?;
            if bytes.len() != KEY_SIZE {
                return Err(VaultError::KeyUnavailable(format!(
                    "{} holds {} bytes, expected {}",
                    key_path.display(),
                    bytes.len(),
                    KEY_SIZE
                )));
            }
            bytes
        } else {
            if let Some(parent) = key_path.parent() {
                fs::create_dir_all(parent).map_err(|e| {
                    VaultError::KeyUnavailable(format!("create {}: {}", parent.display(), e))
                })?;
            }
            let mut bytes = vec![0u8; KEY_SIZE];
            OsRng.fill_bytes(&mut bytes);
            fs::write(key_path, &bytes)
                .map_err(|e| VaultError::KeyUnavailable(format!("write {}: {}", key_path.display(), e)))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(key_path, fs::Permissions::from_mode(0o600)).map_err(|e| {
                    VaultError::KeyUnavailable(format!("chmod {}: {}", key_path.display(), e))
                })?;
            }
            info!(path = %key_path.display(), "Generated sealing key");
            bytes
        };

        let cipher = Aes256Gcm::new_from_slice(&key_bytes)
            .map_err(|e| VaultError::KeyUnavailable(e.to_string()))?;
        Ok(Self { cipher })
    }
}

impl SecretSealer for AesGcmSealer {
    fn seal(&self, plaintext: &[u8]) -> Result<String, VaultError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| VaultError::SealFailed(e.to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(sealed))
    }

    fn open(&self, ciphertext: &str) -> Result<Vec<u8>, VaultError> {
        let sealed = BASE64
            .decode(ciphertext)
            .map_err(|e| VaultError::OpenFailed(format!("invalid base64: {}", e)))?;
        if sealed.len() < NONCE_SIZE {
            return Err(VaultError::OpenFailed("payload too short".to_string()));
        }
        let (nonce_bytes, body) = sealed.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, body)
            .map_err(|_| VaultError::OpenFailed("authentication failed".to_string()))
    }
}

/// Seal an SSH secret as JSON
pub fn seal_ssh_secret(sealer: &dyn SecretSealer, secret: &SshSecret) -> Result<String, VaultError> {
    let json = serde_json::to_vec(secret).map_err(|e| VaultError::SealFailed(e.to_string()))?;
    sealer.seal(&json)
}

/// Open a sealed SSH secret
pub fn open_ssh_secret(sealer: &dyn SecretSealer, sealed: &str) -> Result<SshSecret, VaultError> {
    let json = sealer.open(sealed)?;
    serde_json::from_slice(&json).map_err(|e| VaultError::OpenFailed(e.to_string()))
}

/// Seal a Git secret as JSON
pub fn seal_git_secret(sealer: &dyn SecretSealer, secret: &GitSecret) -> Result<String, VaultError> {
    let json = serde_json::to_vec(secret).map_err(|e| VaultError::SealFailed(e.to_string()))?;
    sealer.seal(&json)
}

/// Open a sealed Git secret
pub fn open_git_secret(sealer: &dyn SecretSealer, sealed: &str) -> Result<GitSecret, VaultError> {
    let json = sealer.open(sealed)?;
    serde_json::from_slice(&json).map_err(|e| VaultError::OpenFailed(e.to_string()))
}
