//! Token persistence
//!
//! Tokens are persisted after every mutation through a [`SecretStore`]. The
//! default backend is an AES-256-GCM encrypted file (random 12-byte nonce
//! prefixed to the ciphertext) written atomically via a temp-file rename.
//! [`MemoryStore`] backs tests and explicit no-persistence setups.

use crate::{token::TokenCredentials, OAuthError, Result};
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Abstract token persistence
pub trait SecretStore: Send + Sync {
    fn load(&self) -> Result<Vec<TokenCredentials>>;
    fn save(&self, tokens: &[TokenCredentials]) -> Result<()>;
}

/// In-memory store (tests, ephemeral deployments)
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Vec<TokenCredentials>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemoryStore {
    fn load(&self) -> Result<Vec<TokenCredentials>> {
        Ok(self.inner.lock().unwrap_or_else(|p| p.into_inner()).clone())
    }

    fn save(&self, tokens: &[TokenCredentials]) -> Result<()> {
        *self.inner.lock().unwrap_or_else(|p| p.into_inner()) = tokens.to_vec();
        Ok(())
    }
}

/// Environment variable holding the hex-encoded 32-byte file key
pub const KEY_ENV_VAR: &str = "NIMBUS_TOKEN_KEY";

/// AES-256-GCM encrypted file store
pub struct EncryptedFileStore {
    path: PathBuf,
    key: [u8; 32],
}

impl EncryptedFileStore {
    pub fn new(path: impl AsRef<Path>, key: [u8; 32]) -> Result<Self> {
        Ok(Self {
            path: expand_tilde(path.as_ref())?,
            key,
        })
    }

    /// Build a store with the key taken from `NIMBUS_TOKEN_KEY` (64 hex
    /// chars).
    pub fn from_env(path: impl AsRef<Path>) -> Result<Self> {
        let hex = std::env::var(KEY_ENV_VAR).map_err(|_| {
            OAuthError::Store(format!("{} is not set", KEY_ENV_VAR))
        })?;
        let key = parse_hex_key(&hex)?;
        Self::new(path, key)
    }

    /// Generate a fresh random key (setup tooling).
    pub fn generate_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        key
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = Aes256Gcm::new((&self.key).into());
        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| OAuthError::Store(format!("encryption error: {}", e)))?;

        let mut out = nonce_bytes.to_vec();
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < 12 {
            return Err(OAuthError::Store("encrypted token file too short".to_string()));
        }
        let cipher = Aes256Gcm::new((&self.key).into());
        let (nonce_bytes, ciphertext) = data.split_at(12);
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| OAuthError::Store(format!("decryption error: {}", e)))
    }
}

impl SecretStore for EncryptedFileStore {
    fn load(&self) -> Result<Vec<TokenCredentials>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = std::fs::read(&self.path)
            .map_err(|e| OAuthError::Store(format!("failed to read {}: {}", self.path.display(), e)))?;
        let plaintext = self.decrypt(&data)?;
        let tokens = serde_json::from_slice(&plaintext)?;
        Ok(tokens)
    }

    fn save(&self, tokens: &[TokenCredentials]) -> Result<()> {
        let plaintext = serde_json::to_vec(tokens)?;
        let encrypted = self.encrypt(&plaintext)?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| OAuthError::Store(format!("failed to create {}: {}", parent.display(), e)))?;
        }

        // Write-then-rename so a crash never leaves a torn file.
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, &encrypted)
            .map_err(|e| OAuthError::Store(format!("failed to write {}: {}", tmp.display(), e)))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| OAuthError::Store(format!("failed to rename token file: {}", e)))?;
        Ok(())
    }
}

fn parse_hex_key(hex: &str) -> Result<[u8; 32]> {
    let hex = hex.trim();
    if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(OAuthError::Store(format!(
            "{} must be 64 hex characters",
            KEY_ENV_VAR
        )));
    }
    let mut key = [0u8; 32];
    for (i, byte) in key.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
            .map_err(|e| OAuthError::Store(format!("invalid key hex: {}", e)))?;
    }
    Ok(key)
}

fn expand_tilde(path: &Path) -> Result<PathBuf> {
    let Some(text) = path.to_str() else {
        return Ok(path.to_path_buf());
    };
    if let Some(rest) = text.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| OAuthError::Store("could not determine home directory".to_string()))?;
        return Ok(home.join(rest));
    }
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_token() -> TokenCredentials {
        TokenCredentials {
            access_token: "sk-acc".to_string(),
            refresh_token: "sk-ref".to_string(),
            expires_at: 2_000_000_000,
            scopes: vec!["user:inference".to_string()],
            account_email: "a@example.com".to_string(),
            usage_count: 3,
            last_used: Some(1_700_000_000),
            created_at: Some(1_700_000_000),
            unusable: false,
        }
    }

    #[test]
    fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        store.save(&[sample_token()]).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].account_email, "a@example.com");
    }

    #[test]
    fn test_encrypted_file_round_trip() {
        let dir = std::env::temp_dir().join(format!("nimbus-oauth-{}", std::process::id()));
        let path = dir.join("tokens.enc");
        let store = EncryptedFileStore::new(&path, EncryptedFileStore::generate_key()).unwrap();

        // Missing file loads empty
        assert!(store.load().unwrap().is_empty());

        store.save(&[sample_token()]).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].usage_count, 3);

        // File on disk is not plaintext
        let raw = std::fs::read(&path).unwrap();
        assert!(!String::from_utf8_lossy(&raw).contains("sk-acc"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_wrong_key_fails() {
        let dir = std::env::temp_dir().join(format!("nimbus-oauth-k-{}", std::process::id()));
        let path = dir.join("tokens.enc");
        let store = EncryptedFileStore::new(&path, [1u8; 32]).unwrap();
        store.save(&[sample_token()]).unwrap();

        let other = EncryptedFileStore::new(&path, [2u8; 32]).unwrap();
        assert!(other.load().is_err());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_parse_hex_key() {
        assert!(parse_hex_key(&"ab".repeat(32)).is_ok());
        assert!(parse_hex_key("short").is_err());
        assert!(parse_hex_key(&"zz".repeat(32)).is_err());
    }
}
