//! Password-based envelope encryption for backup archives.
//!
//! Envelope layout: `salt (32) || nonce (12) || ciphertext+tag`.
//! The key is Argon2id(password, salt); the payload is sealed with AES-256-GCM.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use rand::rngs::OsRng;
use std::io::{Read, Write};
use std::path::Path;
use zeroize::Zeroizing;

use crate::error::{Result, StrongboxError};
use crate::types::BackupPassword;

pub const SALT_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const HEADER_LEN: usize = SALT_LEN + NONCE_LEN;
pub const KEY_LEN: usize = 32;

/// Argon2id memory cost in KiB.
pub const KDF_MEMORY_KIB: u32 = 19_456;
/// Argon2id passes over memory.
pub const KDF_ITERATIONS: u32 = 2;
pub const KDF_PARALLELISM: u32 = 1;

const ENVELOPE_AAD: &[u8] = b"strongbox-envelope-v1";

/// Argon2id work factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: KDF_MEMORY_KIB,
            iterations: KDF_ITERATIONS,
            parallelism: KDF_PARALLELISM,
        }
    }
}

/// Encrypts and decrypts backup envelopes with one fixed KDF work factor.
#[derive(Debug, Clone)]
pub struct CryptoCodec {
    params: Params,
}

impl CryptoCodec {
    pub fn new() -> Self {
        Self::with_params(KdfParams::default())
            .unwrap_or_else(|_| Self { params: Params::default() })
    }

    pub fn with_params(kdf: KdfParams) -> Result<Self> {
        let params = Params::new(
            kdf.memory_kib,
            kdf.iterations,
            kdf.parallelism,
            Some(KEY_LEN),
        )
        .map_err(|e| StrongboxError::Config(format!("Invalid KDF parameters: {e}")))?;
        Ok(Self { params })
    }

    fn derive_key(
        &self,
        password: &BackupPassword,
        salt: &[u8],
    ) -> Result<Zeroizing<[u8; KEY_LEN]>> {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
            .hash_password_into(password.as_bytes(), salt, key.as_mut_slice())
            .map_err(|e| StrongboxError::Encryption(format!("Argon2id key derivation failed: {e}")))?;
        Ok(key)
    }

    /// Seal `plaintext` into a self-describing envelope.
    pub fn encrypt(&self, password: &BackupPassword, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let key = self.derive_key(password, &salt)?;
        let cipher = Aes256Gcm::new_from_slice(key.as_slice())
            .map_err(|e| StrongboxError::Encryption(format!("Invalid key: {e}")))?;

        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: ENVELOPE_AAD,
                },
            )
            .map_err(|e| StrongboxError::Encryption(format!("Encryption failed: {e}")))?;

        let mut envelope = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        envelope.extend_from_slice(&salt);
        envelope.extend_from_slice(&nonce_bytes);
        envelope.extend_from_slice(&ciphertext);
        Ok(envelope)
    }

    /// Open an envelope. Any truncation, bit flip or wrong password is `DecryptionFailed`.
    pub fn decrypt(&self, password: &BackupPassword, envelope: &[u8]) -> Result<Vec<u8>> {
        if envelope.len() < HEADER_LEN + TAG_LEN {
            return Err(StrongboxError::DecryptionFailed);
        }
        let (salt, rest) = envelope.split_at(SALT_LEN);
        let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);

        let key = self.derive_key(password, salt)?;
        let cipher = Aes256Gcm::new_from_slice(key.as_slice())
            .map_err(|_| StrongboxError::DecryptionFailed)?;

        cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: ENVELOPE_AAD,
                },
            )
            .map_err(|_| StrongboxError::DecryptionFailed)
    }

    /// Encrypt everything readable from `reader` into `writer`. Returns bytes written.
    pub fn encrypt_stream<R: Read, W: Write>(
        &self,
        password: &BackupPassword,
        mut reader: R,
        mut writer: W,
    ) -> Result<u64> {
        let mut plaintext = Zeroizing::new(Vec::new());
        reader.read_to_end(&mut plaintext)?;
        let envelope = self.encrypt(password, &plaintext)?;
        writer.write_all(&envelope)?;
        writer.flush()?;
        Ok(envelope.len() as u64)
    }

    /// Decrypt an envelope read from `reader` into `writer`. Nothing is written on failure.
    pub fn decrypt_stream<R: Read, W: Write>(
        &self,
        password: &BackupPassword,
        mut reader: R,
        mut writer: W,
    ) -> Result<u64> {
        let mut envelope = Vec::new();
        reader.read_to_end(&mut envelope)?;
        let plaintext = Zeroizing::new(self.decrypt(password, &envelope)?);
        writer.write_all(&plaintext)?;
        writer.flush()?;
        Ok(plaintext.len() as u64)
    }

    pub fn encrypt_file(&self, password: &BackupPassword, source: &Path, dest: &Path) -> Result<u64> {
        let input = std::fs::File::open(source)?;
        let output = std::fs::File::create(dest)?;
        self.encrypt_stream(password, input, output)
    }

    pub fn decrypt_file(&self, password: &BackupPassword, source: &Path, dest: &Path) -> Result<u64> {
        let envelope = std::fs::read(source)?;
        let plaintext = Zeroizing::new(self.decrypt(password, &envelope)?);
        std::fs::write(dest, plaintext.as_slice())?;
        Ok(plaintext.len() as u64)
    }
}

impl Default for CryptoCodec {
    fn default() -> Self {
        Self::new()
    }
}
