//! Packet encryption for sessions.
//!
//! A shared secret is stretched with PBKDF2 into a cipher key, and the key
//! backs an AEAD [`BlockCrypt`] the transport applies to every packet.

use std::sync::Arc;

use aes_gcm::Aes256Gcm;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Salt used for key expansion when none is configured.
pub const DEFAULT_SALT: &str = "kcp-go";

const GCM_NONCE_LEN: usize = 12;
const CHACHA_NONCE_LEN: usize = 12;
const XCHACHA_NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CryptError {
    #[error("cipher {cipher} requires a {expected}-byte key, kdf produces {actual}")]
    KeyLength {
        cipher: CipherKind,
        expected: usize,
        actual: usize,
    },
    #[error("kdf iterations must be > 0")]
    InvalidIterations,
    #[error("packet too short")]
    Truncated,
    #[error("authentication failed")]
    Authentication,
    #[error("encryption failed")]
    Seal,
}

/// Digest used inside PBKDF2-HMAC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KdfDigest {
    Sha1,
    Sha256,
    Sha512,
}

/// Cipher selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CipherKind {
    #[serde(rename = "none")]
    None,
    /// AES-256 keyed straight from the PBKDF2 output, as classic KCP servers do.
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
    #[serde(rename = "xchacha20-poly1305")]
    XChaCha20Poly1305,
}

impl CipherKind {
    pub fn key_len(self) -> usize {
        match self {
            CipherKind::None => 0,
            CipherKind::Aes256Gcm
            | CipherKind::ChaCha20Poly1305
            | CipherKind::XChaCha20Poly1305 => 32,
        }
    }
}

impl std::fmt::Display for CipherKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CipherKind::None => "none",
            CipherKind::Aes256Gcm => "aes-256-gcm",
            CipherKind::ChaCha20Poly1305 => "chacha20-poly1305",
            CipherKind::XChaCha20Poly1305 => "xchacha20-poly1305",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfConfig {
    pub iterations: u32,
    pub key_len: usize,
    pub digest: KdfDigest,
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            iterations: 4096,
            key_len: 32,
            digest: KdfDigest::Sha1,
        }
    }
}

/// Security parameters for a listener.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Shared secret. Empty disables encryption.
    pub key: String,
    pub cipher: CipherKind,
    pub salt: String,
    pub kdf: KdfConfig,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            key: String::new(),
            cipher: CipherKind::ChaCha20Poly1305,
            salt: DEFAULT_SALT.to_string(),
            kdf: KdfConfig::default(),
        }
    }
}

impl std::fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityConfig")
            .field("key", &if self.key.is_empty() { "<unset>" } else { "<redacted>" })
            .field("cipher", &self.cipher)
            .field("salt", &self.salt)
            .field("kdf", &self.kdf)
            .finish()
    }
}

impl SecurityConfig {
    pub fn is_enabled(&self) -> bool {
        !self.key.is_empty() && self.cipher != CipherKind::None
    }
}

/// Packet-level encryption capability handed to the transport.
pub trait BlockCrypt: Send + Sync {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptError>;
    fn open(&self, packet: &[u8]) -> Result<Vec<u8>, CryptError>;
    /// Bytes added to every sealed packet.
    fn overhead(&self) -> usize;
}

/// Stretches `secret` into `config.key_len` bytes with PBKDF2-HMAC.
pub fn derive_key(secret: &str, salt: &str, config: &KdfConfig) -> Result<Vec<u8>, CryptError> {
    if config.iterations == 0 {
        return Err(CryptError::InvalidIterations);
    }
    let mut key = vec![0u8; config.key_len];
    let (password, salt, rounds) = (secret.as_bytes(), salt.as_bytes(), config.iterations);
    match config.digest {
        KdfDigest::Sha1 => pbkdf2::pbkdf2_hmac::<sha1::Sha1>(password, salt, rounds, &mut key),
        KdfDigest::Sha256 => pbkdf2::pbkdf2_hmac::<sha2::Sha256>(password, salt, rounds, &mut key),
        KdfDigest::Sha512 => pbkdf2::pbkdf2_hmac::<sha2::Sha512>(password, salt, rounds, &mut key),
    }
    Ok(key)
}

/// Builds the block crypt described by `config`.
///
/// Returns `Ok(None)` when no secret is configured or the cipher is `none`.
pub fn new_block_crypt(config: &SecurityConfig) -> Result<Option<Arc<dyn BlockCrypt>>, CryptError> {
    if !config.is_enabled() {
        return Ok(None);
    }
    let expected = config.cipher.key_len();
    if config.kdf.key_len != expected {
        return Err(CryptError::KeyLength {
            cipher: config.cipher,
            expected,
            actual: config.kdf.key_len,
        });
    }
    let key = derive_key(&config.key, &config.salt, &config.kdf)?;
    let crypt: Arc<dyn BlockCrypt> = match config.cipher {
        CipherKind::None => return Ok(None),
        CipherKind::Aes256Gcm => Arc::new(AeadCrypt::Aes(
            Aes256Gcm::new_from_slice(&key).map_err(|_| CryptError::KeyLength {
                cipher: config.cipher,
                expected,
                actual: key.len(),
            })?,
        )),
        CipherKind::ChaCha20Poly1305 => Arc::new(AeadCrypt::ChaCha(
            ChaCha20Poly1305::new_from_slice(&key).map_err(|_| CryptError::KeyLength {
                cipher: config.cipher,
                expected,
                actual: key.len(),
            })?,
        )),
        CipherKind::XChaCha20Poly1305 => Arc::new(AeadCrypt::XChaCha(
            XChaCha20Poly1305::new_from_slice(&key).map_err(|_| CryptError::KeyLength {
                cipher: config.cipher,
                expected,
                actual: key.len(),
            })?,
        )),
    };
    Ok(Some(crypt))
}

/// AEAD packet crypt. Sealed layout: `nonce || ciphertext || tag`.
enum AeadCrypt {
    Aes(Aes256Gcm),
    ChaCha(ChaCha20Poly1305),
    XChaCha(XChaCha20Poly1305),
}

impl AeadCrypt {
    fn nonce_len(&self) -> usize {
        match self {
            AeadCrypt::Aes(_) => GCM_NONCE_LEN,
            AeadCrypt::ChaCha(_) => CHACHA_NONCE_LEN,
            AeadCrypt::XChaCha(_) => XCHACHA_NONCE_LEN,
        }
    }
}

impl BlockCrypt for AeadCrypt {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptError> {
        let nonce_len = self.nonce_len();
        let mut nonce = [0u8; XCHACHA_NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce[..nonce_len]);
        let ciphertext = match self {
            AeadCrypt::Aes(cipher) => {
                cipher.encrypt(Nonce::from_slice(&nonce[..nonce_len]), plaintext)
            }
            AeadCrypt::ChaCha(cipher) => {
                cipher.encrypt(Nonce::from_slice(&nonce[..nonce_len]), plaintext)
            }
            AeadCrypt::XChaCha(cipher) => {
                cipher.encrypt(XNonce::from_slice(&nonce[..nonce_len]), plaintext)
            }
        }
        .map_err(|_| CryptError::Seal)?;

        let mut packet = Vec::with_capacity(nonce_len + ciphertext.len());
        packet.extend_from_slice(&nonce[..nonce_len]);
        packet.extend_from_slice(&ciphertext);
        Ok(packet)
    }

    fn open(&self, packet: &[u8]) -> Result<Vec<u8>, CryptError> {
        let nonce_len = self.nonce_len();
        if packet.len() < nonce_len + TAG_LEN {
            return Err(CryptError::Truncated);
        }
        let (nonce, ciphertext) = packet.split_at(nonce_len);
        let plaintext = match self {
            AeadCrypt::Aes(cipher) => cipher.decrypt(Nonce::from_slice(nonce), ciphertext),
            AeadCrypt::ChaCha(cipher) => cipher.decrypt(Nonce::from_slice(nonce), ciphertext),
            AeadCrypt::XChaCha(cipher) => cipher.decrypt(XNonce::from_slice(nonce), ciphertext),
        };
        plaintext.map_err(|_| CryptError::Authentication)
    }

    fn overhead(&self) -> usize {
        self.nonce_len() + TAG_LEN
    }
}
